//! FLV container: AMF0 script data, tag building and the session writer.

pub(crate) mod amf;
pub mod mux;
pub mod writer;

pub use mux::{AudioMeta, FlvMetadata, FlvMuxer, MetaDataTag, VideoMeta};
pub use writer::{FlvWriter, StreamHeaders};
