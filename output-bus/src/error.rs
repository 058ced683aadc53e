use std::{io, path::PathBuf};

use thiserror::Error;

use crate::event::{SessionKind, StopCode};

pub type Result<T, E = OutputError> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum OutputError {
    #[error("invalid path: {0}")]
    BadPath(String),

    #[error("connect failed: {0}")]
    ConnectFailed(String),

    #[error("invalid stream: {0}")]
    InvalidStream(String),

    #[error("disconnected: {0}")]
    Disconnected(String),

    #[error("no space left on device")]
    NoSpace,

    #[error("encoder error: {0}")]
    Encoder(String),

    #[error("output is busy: {0}")]
    Busy(String),

    #[error("start canceled")]
    Canceled,

    #[error(transparent)]
    Io(io::Error),
}

impl OutputError {
    /// Classifies a write failure, separating a full disk from other I/O errors.
    pub fn from_io(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::StorageFull => OutputError::NoSpace,
            _ => OutputError::Io(err),
        }
    }

    pub fn code(&self) -> StopCode {
        match self {
            OutputError::BadPath(_) => StopCode::BadPath,
            OutputError::ConnectFailed(_) => StopCode::ConnectFailed,
            OutputError::InvalidStream(_) => StopCode::InvalidStream,
            OutputError::Disconnected(_) => StopCode::Disconnected,
            OutputError::NoSpace => StopCode::NoSpace,
            OutputError::Canceled => StopCode::Success,
            OutputError::Encoder(_) | OutputError::Busy(_) | OutputError::Io(_) => StopCode::Error,
        }
    }

    /// Transport failures that the reconnect policy may retry.
    pub fn is_reconnectable(&self) -> bool {
        matches!(self, OutputError::Disconnected(_))
    }
}

impl From<io::Error> for OutputError {
    fn from(err: io::Error) -> Self {
        Self::from_io(err)
    }
}

#[derive(Debug, Error)]
pub enum HandlerError {
    #[error("recording path is not a writable directory: {}", .0.display())]
    BadPath(PathBuf),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("encoders are in use by an active session")]
    EncodersBusy,

    #[error("encoder error: {0}")]
    Encoder(String),

    #[error("{kind} failed: {source}")]
    Output {
        kind: SessionKind,
        #[source]
        source: OutputError,
    },
}

impl HandlerError {
    pub fn output(kind: SessionKind, source: OutputError) -> Self {
        HandlerError::Output { kind, source }
    }

    pub fn config(msg: impl Into<String>) -> Self {
        HandlerError::Config(msg.into())
    }

    pub fn code(&self) -> StopCode {
        match self {
            HandlerError::BadPath(_) => StopCode::BadPath,
            HandlerError::Output { source, .. } => source.code(),
            HandlerError::Config(_) => StopCode::InvalidStream,
            HandlerError::EncodersBusy | HandlerError::Encoder(_) => StopCode::Error,
        }
    }
}

impl From<anyhow::Error> for HandlerError {
    fn from(err: anyhow::Error) -> Self {
        HandlerError::Encoder(format!("{err:#}"))
    }
}
