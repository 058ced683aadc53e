use std::{fmt, time::Duration};

/// Why a session ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum StopCode {
    Success,
    BadPath,
    ConnectFailed,
    InvalidStream,
    Error,
    Disconnected,
    NoSpace,
}

impl StopCode {
    pub fn is_success(&self) -> bool {
        matches!(self, StopCode::Success)
    }
}

impl fmt::Display for StopCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            StopCode::Success => "success",
            StopCode::BadPath => "invalid path or connection URL",
            StopCode::ConnectFailed => "could not connect to server",
            StopCode::InvalidStream => "invalid stream settings",
            StopCode::Error => "unexpected error",
            StopCode::Disconnected => "disconnected from server",
            StopCode::NoSpace => "not enough disk space",
        };
        f.write_str(msg)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SessionEvent {
    /// Start succeeded; packets are withheld for `delay`.
    DelayStarting { delay: Duration },
    SessionStarted,
    SessionStopping,
    /// Graceful stop requested; the delay buffer drains over `remaining`.
    DelayStopping { remaining: Duration },
    Reconnecting { attempt: u32, max_retries: u32 },
    Reconnected,
    SessionStopped { code: StopCode },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SessionKind {
    Streaming,
    Recording,
}

impl fmt::Display for SessionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionKind::Streaming => f.write_str("streaming"),
            SessionKind::Recording => f.write_str("recording"),
        }
    }
}

/// Session event tagged with the handler session it came from.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HandlerEvent {
    pub kind: SessionKind,
    pub event: SessionEvent,
}
