//! Output pipeline for encoded audio/video: FLV muxing, file and stream
//! outputs, reconnect/delay handling and the Simple/Advanced output handlers.

pub mod avc;
pub mod config;
pub mod encoder;
pub mod error;
pub mod event;
pub mod flv;
pub mod handler;
pub mod logger;
pub mod output;
pub mod packet;
pub mod service;
pub mod settings;
pub mod sink;
pub mod transport;

#[cfg(test)]
pub(crate) mod test_util;

pub use error::{HandlerError, OutputError};
pub use event::{SessionEvent, StopCode};
