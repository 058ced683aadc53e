use std::{
    io::{self, SeekFrom},
    path::{Path, PathBuf},
};

use async_trait::async_trait;
use tokio::{
    fs::File,
    io::{AsyncSeekExt, AsyncWrite, AsyncWriteExt, BufWriter},
};

use crate::error::OutputError;

pub type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Destination of muxed bytes.
#[async_trait]
pub trait ByteSink: Send {
    async fn write_all(&mut self, data: &[u8]) -> Result<(), OutputError>;

    async fn flush(&mut self) -> Result<(), OutputError>;

    /// Bytes written so far.
    fn position(&self) -> u64;
}

/// Seekable file target. Values written earlier can be patched in place.
pub struct FileSink {
    path: PathBuf,
    file: BufWriter<File>,
    position: u64,
}

impl FileSink {
    pub async fn create(path: impl AsRef<Path>) -> Result<Self, OutputError> {
        let path = path.as_ref().to_path_buf();
        let file = File::create(&path).await.map_err(|e| match e.kind() {
            io::ErrorKind::NotFound
            | io::ErrorKind::PermissionDenied
            | io::ErrorKind::IsADirectory
            | io::ErrorKind::NotADirectory => {
                OutputError::BadPath(format!("{}: {}", path.display(), e))
            }
            _ => OutputError::from_io(e),
        })?;
        Ok(Self {
            path,
            file: BufWriter::new(file),
            position: 0,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Overwrites bytes at `offset` and returns to the end of the file.
    pub async fn patch(&mut self, offset: u64, data: &[u8]) -> Result<(), OutputError> {
        self.file.flush().await?;
        self.file.seek(SeekFrom::Start(offset)).await?;
        self.file.write_all(data).await?;
        self.file.flush().await?;
        self.file.seek(SeekFrom::Start(self.position)).await?;
        Ok(())
    }

    /// Flushes and syncs the file, returning its final size.
    pub async fn close(mut self) -> Result<u64, OutputError> {
        self.file.flush().await?;
        self.file.get_mut().sync_all().await?;
        Ok(self.position)
    }
}

#[async_trait]
impl ByteSink for FileSink {
    async fn write_all(&mut self, data: &[u8]) -> Result<(), OutputError> {
        self.file.write_all(data).await?;
        self.position += data.len() as u64;
        Ok(())
    }

    async fn flush(&mut self) -> Result<(), OutputError> {
        self.file.flush().await?;
        Ok(())
    }

    fn position(&self) -> u64 {
        self.position
    }
}

/// Connection to a streaming server. Any write failure means the
/// connection is gone.
pub struct StreamSink {
    writer: BoxedWriter,
    position: u64,
}

impl StreamSink {
    pub fn new(writer: BoxedWriter) -> Self {
        Self {
            writer,
            position: 0,
        }
    }

    pub async fn shutdown(&mut self) -> Result<(), OutputError> {
        self.writer
            .shutdown()
            .await
            .map_err(|e| OutputError::Disconnected(e.to_string()))
    }
}

#[async_trait]
impl ByteSink for StreamSink {
    async fn write_all(&mut self, data: &[u8]) -> Result<(), OutputError> {
        self.writer
            .write_all(data)
            .await
            .map_err(|e| OutputError::Disconnected(e.to_string()))?;
        self.position += data.len() as u64;
        Ok(())
    }

    async fn flush(&mut self) -> Result<(), OutputError> {
        self.writer
            .flush()
            .await
            .map_err(|e| OutputError::Disconnected(e.to_string()))
    }

    fn position(&self) -> u64 {
        self.position
    }
}
