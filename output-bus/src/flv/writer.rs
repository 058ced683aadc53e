use std::borrow::Cow;

use bytes::{BufMut, Bytes, BytesMut};

use crate::{
    avc,
    error::OutputError,
    flv::mux::FlvMuxer,
    packet::{EncoderPacket, EncoderType},
    sink::{ByteSink, FileSink, StreamSink},
};

/// Decoder configuration of the streams carried by one FLV session.
#[derive(Clone, Debug, Default)]
pub struct StreamHeaders {
    /// AVCDecoderConfigurationRecord.
    pub video: Option<Bytes>,
    /// AAC AudioSpecificConfig of track 0.
    pub audio: Option<Bytes>,
}

/// Absolute file offsets of the metadata values patched on finalize.
#[derive(Clone, Copy, Debug)]
struct MetaLayout {
    duration: u64,
    filesize: u64,
    times: Option<u64>,
    positions: Option<u64>,
}

/// Writes one FLV session into a sink.
///
/// The writer is owned by a single session task, so the `sent_headers`
/// check and the header block it guards can never run twice.
pub struct FlvWriter<S> {
    sink: S,
    muxer: FlvMuxer,
    headers: StreamHeaders,
    sent_headers: bool,
    last_packet_ts: i64,
    layout: Option<MetaLayout>,
    keyframes: Vec<(f64, u64)>,
}

impl<S: ByteSink> FlvWriter<S> {
    pub fn new(sink: S, muxer: FlvMuxer, headers: StreamHeaders) -> Self {
        Self {
            sink,
            muxer,
            headers,
            sent_headers: false,
            last_packet_ts: 0,
            layout: None,
            keyframes: Vec::new(),
        }
    }

    pub fn sent_headers(&self) -> bool {
        self.sent_headers
    }

    /// Normalized timestamp (ms) of the last data tag written.
    pub fn last_packet_ts(&self) -> i64 {
        self.last_packet_ts
    }

    pub fn position(&self) -> u64 {
        self.sink.position()
    }

    pub fn keyframe_count(&self) -> usize {
        self.keyframes.len()
    }

    pub async fn write_file_header(&mut self) -> Result<(), OutputError> {
        let header = self.muxer.file_header();
        self.sink.write_all(&header).await
    }

    pub async fn write_metadata(&mut self) -> Result<(), OutputError> {
        let base = self.sink.position();
        let tag = self.muxer.meta_data();
        self.sink.write_all(&tag.data).await?;
        self.layout = Some(MetaLayout {
            duration: base + tag.duration_offset as u64,
            filesize: base + tag.filesize_offset as u64,
            times: tag.keyframe_times_offset.map(|o| base + o as u64),
            positions: tag.keyframe_positions_offset.map(|o| base + o as u64),
        });
        Ok(())
    }

    pub async fn write_audio_header(&mut self) -> Result<(), OutputError> {
        if let Some(config) = &self.headers.audio {
            let tag = self.muxer.audio_header(config);
            self.sink.write_all(&tag).await?;
        }
        Ok(())
    }

    pub async fn write_video_header(&mut self) -> Result<(), OutputError> {
        if let Some(record) = &self.headers.video {
            let tag = self.muxer.video_header(record);
            self.sink.write_all(&tag).await?;
        }
        Ok(())
    }

    /// File header, metadata and one sequence header per stream.
    pub async fn write_headers(&mut self) -> Result<(), OutputError> {
        self.write_file_header().await?;
        self.write_metadata().await?;
        self.write_audio_header().await?;
        self.write_video_header().await?;
        self.sent_headers = true;
        Ok(())
    }

    pub async fn write_packet(
        &mut self,
        packet: &EncoderPacket,
        is_header: bool,
    ) -> Result<(), OutputError> {
        let packet = if packet.kind == EncoderType::Video && !is_header {
            Cow::Owned(avc::parse_avc_packet(packet))
        } else {
            Cow::Borrowed(packet)
        };

        let position = self.sink.position();
        let (tag, ts) = self.muxer.packet(&packet, is_header);
        self.sink.write_all(&tag).await?;

        if !is_header {
            self.last_packet_ts = ts;
            if packet.kind == EncoderType::Video && packet.keyframe {
                self.keyframes.push((ts as f64 / 1000.0, position));
            }
        }
        Ok(())
    }

    /// Writes a packet coming from an encoder, emitting the header block
    /// first if this is the first packet of the session.
    pub async fn write_encoded(&mut self, packet: &EncoderPacket) -> Result<(), OutputError> {
        // FLV carries a single audio track
        if packet.kind == EncoderType::Audio && packet.track_idx != 0 {
            return Ok(());
        }
        if packet.data.is_empty() {
            return Ok(());
        }
        if !self.sent_headers {
            self.write_headers().await?;
        }
        self.write_packet(packet, false).await
    }

    pub async fn flush(&mut self) -> Result<(), OutputError> {
        self.sink.flush().await
    }
}

impl FlvWriter<FileSink> {
    /// Patches duration, file size and the keyframe index, then closes the
    /// file. Returns the final file size.
    pub async fn finalize_file(mut self) -> Result<u64, OutputError> {
        if !self.sent_headers {
            self.write_headers().await?;
        }
        let size = self.sink.position();
        let Some(layout) = self.layout else {
            return self.sink.close().await;
        };

        let duration = self.last_packet_ts as f64 / 1000.0;
        self.sink.patch(layout.duration, &duration.to_be_bytes()).await?;
        self.sink.patch(layout.filesize, &(size as f64).to_be_bytes()).await?;

        if let (Some(times), Some(positions)) = (layout.times, layout.positions) {
            let index = sample_keyframes(&self.keyframes, self.muxer.metadata().keyframe_slots);
            if !index.is_empty() {
                let time_values = number_run(index.iter().map(|(t, _)| *t));
                let position_values = number_run(index.iter().map(|(_, p)| *p as f64));
                self.sink.patch(times, &time_values).await?;
                self.sink.patch(positions, &position_values).await?;
            }
        }

        self.sink.close().await
    }
}

impl FlvWriter<StreamSink> {
    pub async fn close(mut self) -> Result<(), OutputError> {
        self.sink.flush().await?;
        self.sink.shutdown().await
    }
}

/// Picks `slots` entries: repeats the last keyframe when there are fewer,
/// samples evenly when there are more.
fn sample_keyframes(keyframes: &[(f64, u64)], slots: usize) -> Vec<(f64, u64)> {
    if keyframes.is_empty() || slots == 0 {
        return Vec::new();
    }
    let len = keyframes.len();
    (0..slots)
        .map(|i| {
            let idx = if len <= slots { i.min(len - 1) } else { i * len / slots };
            keyframes[idx]
        })
        .collect()
}

/// Contiguous strict-array payload starting at the first number's value.
fn number_run(values: impl Iterator<Item = f64>) -> Bytes {
    let mut buf = BytesMut::new();
    for (i, value) in values.enumerate() {
        if i > 0 {
            buf.put_u8(0x00);
        }
        buf.put_f64(value);
    }
    buf.freeze()
}

#[cfg(test)]
#[path = "writer_test.rs"]
mod writer_test;
