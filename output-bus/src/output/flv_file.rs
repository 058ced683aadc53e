use std::{io, path::PathBuf};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::task::JoinHandle;

use crate::{
    avc,
    error::OutputError,
    flv::{AudioMeta, FlvMetadata, FlvMuxer, FlvWriter, StreamHeaders, VideoMeta},
    output::{OutputDriver, SessionInfo},
    packet::{EncoderPacket, EncoderType},
    settings::{Property, PropertyKind, Settings},
    sink::FileSink,
};

pub const ENCODER_NAME: &str = concat!("lite-caster ", env!("CARGO_PKG_VERSION"));

/// Records the session into a seekable FLV file.
#[derive(Default)]
pub struct FlvFileOutput {
    path: PathBuf,
    keyframe_slots: usize,
    // runs to completion even when `start` is dropped
    creating: Option<JoinHandle<Result<FileSink, OutputError>>>,
    writer: Option<FlvWriter<FileSink>>,
    wait_keyframe: bool,
}

impl FlvFileOutput {
    pub fn new() -> Self {
        Self::default()
    }
}

/// Builds the FLV metadata and decoder headers of a session.
pub(crate) fn session_layout(
    session: &SessionInfo,
    keyframe_slots: usize,
) -> Result<(FlvMetadata, StreamHeaders), OutputError> {
    let mut metadata = FlvMetadata {
        encoder_name: ENCODER_NAME.to_string(),
        keyframe_slots,
        ..Default::default()
    };
    let mut headers = StreamHeaders::default();

    if let Some(video) = &session.video {
        let extra = video
            .extra_data()
            .ok_or_else(|| OutputError::InvalidStream("video encoder has no header".into()))?;
        headers.video = Some(avc::parse_avc_header(&extra)?);
        metadata.video = Some(VideoMeta {
            width: video.width(),
            height: video.height(),
            frame_rate: video.video_info().map(|v| v.frame_rate()).unwrap_or(0.0),
            bitrate_kbps: video.bitrate(),
        });
    }

    if let Some(audio) = session.primary_audio() {
        headers.audio = Some(audio.extra_data().unwrap_or_else(Bytes::new));
        let info = audio.audio_info();
        metadata.audio = Some(AudioMeta {
            sample_rate: info.as_ref().map(|a| a.sample_rate).unwrap_or(0),
            channels: info.as_ref().map(|a| a.channels).unwrap_or(0),
            bitrate_kbps: audio.bitrate(),
        });
    }

    Ok((metadata, headers))
}

#[async_trait]
impl OutputDriver for FlvFileOutput {
    fn id(&self) -> &'static str {
        "flv_output"
    }

    fn properties(&self) -> Vec<Property> {
        vec![
            Property::new("path", "File path", PropertyKind::Text),
            Property::new(
                "keyframe_index_slots",
                "Keyframe index entries",
                PropertyKind::Int { min: 0, max: 4096 },
            ),
        ]
    }

    fn update(&mut self, settings: &Settings) {
        self.path = PathBuf::from(settings.get_string("path"));
        self.keyframe_slots = settings
            .get_int("keyframe_index_slots")
            .unwrap_or(0)
            .clamp(0, 4096) as usize;
    }

    async fn start(&mut self, session: &SessionInfo) -> Result<(), OutputError> {
        if self.path.as_os_str().is_empty() {
            return Err(OutputError::BadPath("no file path set".into()));
        }
        let (metadata, headers) = session_layout(session, self.keyframe_slots)?;
        let creating = self
            .creating
            .insert(tokio::spawn(FileSink::create(self.path.clone())));
        let created = creating
            .await
            .map_err(|e| OutputError::Io(io::Error::other(e)));
        self.creating = None;
        let sink = created??;
        session
            .logger
            .info(format_args!("writing FLV file '{}'", self.path.display()));
        self.writer = Some(FlvWriter::new(sink, FlvMuxer::new(metadata), headers));
        // a shared encoder may already be mid-GOP
        self.wait_keyframe = session.video.is_some();
        Ok(())
    }

    async fn encoded_packet(&mut self, packet: EncoderPacket) -> Result<(), OutputError> {
        if self.wait_keyframe {
            let keyframe = packet.keyframe || avc::avc_keyframe(&packet.data);
            if packet.kind != EncoderType::Video || !keyframe {
                return Ok(());
            }
            self.wait_keyframe = false;
        }
        match self.writer.as_mut() {
            Some(writer) => writer.write_encoded(&packet).await,
            None => Ok(()),
        }
    }

    async fn stop(&mut self) -> Result<(), OutputError> {
        let Some(writer) = self.writer.take() else {
            return Ok(());
        };
        let size = writer.finalize_file().await?;
        log::info!("FLV file '{}' closed, {} bytes", self.path.display(), size);
        Ok(())
    }

    /// Removes the file whenever it was created, also when `start` was
    /// dropped while the file was being opened.
    async fn abort(&mut self) {
        let created = match self.creating.take() {
            Some(pending) => matches!(pending.await, Ok(Ok(_))),
            None => self.writer.is_some(),
        };
        self.writer = None;
        self.wait_keyframe = false;
        if !created {
            return;
        }
        match tokio::fs::remove_file(&self.path).await {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => log::warn!("remove partial file {}: {}", self.path.display(), e),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use futures::FutureExt;

    use super::*;
    use crate::logger::{LogConfig, OutputLogger};

    fn bare_session() -> SessionInfo {
        SessionInfo {
            name: "rec".into(),
            video: None,
            audio: Vec::new(),
            service: None,
            logger: Arc::new(OutputLogger::new("flv_output", "rec", LogConfig::default())),
        }
    }

    #[tokio::test]
    async fn test_abort_after_dropped_start_removes_file() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("canceled.flv");
        let mut driver = FlvFileOutput::new();
        driver.update(&Settings::new().with("path", path.to_string_lossy().to_string()));

        let session = bare_session();
        // one poll gets start to the file open, then it is dropped
        let _ = driver.start(&session).now_or_never();
        driver.abort().await;
        assert!(!path.exists());
        assert!(driver.creating.is_none() && driver.writer.is_none());
        Ok(())
    }

    #[tokio::test]
    async fn test_abort_keeps_file_it_did_not_create() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("missing").join("x.flv");
        let mut driver = FlvFileOutput::new();
        driver.update(&Settings::new().with("path", path.to_string_lossy().to_string()));

        let err = driver.start(&bare_session()).await.unwrap_err();
        assert!(matches!(err, OutputError::BadPath(_)));
        driver.abort().await;

        let path = dir.path().join("kept.flv");
        std::fs::write(&path, b"old")?;
        let mut driver = FlvFileOutput::new();
        driver.update(&Settings::new().with("path", path.to_string_lossy().to_string()));
        driver.abort().await;
        assert!(path.exists());
        Ok(())
    }
}
