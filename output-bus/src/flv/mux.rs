use bytes::{BufMut, Bytes, BytesMut};

use crate::{
    flv::amf::AmfWriter,
    packet::{EncoderPacket, EncoderType},
};

pub const FLV_HEADER_LENGTH: usize = 9;
pub const FLV_TAG_HEADER_LENGTH: usize = 11;
pub const PREVIOUS_TAG_SIZE_LENGTH: usize = 4;

pub const TAG_AUDIO: u8 = 8;
pub const TAG_VIDEO: u8 = 9;
pub const TAG_SCRIPT: u8 = 18;

const FLAG_AUDIO: u8 = 0x04;
const FLAG_VIDEO: u8 = 0x01;

const CODEC_AVC: u8 = 7;
const CODEC_AAC: u8 = 10;
const AVC_SEQUENCE_HEADER: u8 = 0;
const AVC_NALU: u8 = 1;
const AAC_SEQUENCE_HEADER: u8 = 0;
const AAC_RAW: u8 = 1;
// AAC, 44 kHz, 16-bit, stereo: FLV readers take the real layout from the config.
const AAC_SOUND_FLAGS: u8 = 0xaf;

#[derive(Clone, Debug, Default, PartialEq)]
pub struct VideoMeta {
    pub width: u32,
    pub height: u32,
    pub frame_rate: f64,
    pub bitrate_kbps: u32,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct AudioMeta {
    pub sample_rate: u32,
    pub channels: u32,
    pub bitrate_kbps: u32,
}

/// Stream description written into `onMetaData`.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct FlvMetadata {
    pub video: Option<VideoMeta>,
    pub audio: Option<AudioMeta>,
    pub encoder_name: String,
    /// Number of reserved keyframe index entries, 0 disables the index.
    pub keyframe_slots: usize,
}

/// Serialized `onMetaData` tag and the offsets (from the tag start) of the
/// values patched when the file is finalized.
#[derive(Clone, Debug)]
pub struct MetaDataTag {
    pub data: Bytes,
    pub duration_offset: usize,
    pub filesize_offset: usize,
    pub keyframe_times_offset: Option<usize>,
    pub keyframe_positions_offset: Option<usize>,
}

/// Builds FLV tags. Holds only the timestamp bookkeeping of a session; all
/// I/O is done by [`crate::flv::FlvWriter`].
pub struct FlvMuxer {
    metadata: FlvMetadata,
    origin_ms: Option<i64>,
    last_ts: [i64; 2],
}

impl FlvMuxer {
    pub fn new(metadata: FlvMetadata) -> Self {
        Self {
            metadata,
            origin_ms: None,
            last_ts: [0; 2],
        }
    }

    pub fn metadata(&self) -> &FlvMetadata {
        &self.metadata
    }

    pub fn file_header(&self) -> Bytes {
        let mut flags = 0;
        if self.metadata.audio.is_some() {
            flags |= FLAG_AUDIO;
        }
        if self.metadata.video.is_some() {
            flags |= FLAG_VIDEO;
        }

        let mut buf = BytesMut::with_capacity(FLV_HEADER_LENGTH + PREVIOUS_TAG_SIZE_LENGTH);
        buf.extend_from_slice(b"FLV");
        buf.put_u8(0x01);
        buf.put_u8(flags);
        buf.put_u32(FLV_HEADER_LENGTH as u32);
        buf.put_u32(0);
        buf.freeze()
    }

    pub fn meta_data(&self) -> MetaDataTag {
        let meta = &self.metadata;
        let mut amf = AmfWriter::new();
        amf.string("onMetaData");

        let mut count = 3;
        if meta.video.is_some() {
            count += 5;
        }
        if meta.audio.is_some() {
            count += 6;
        }
        if meta.keyframe_slots > 0 {
            count += 1;
        }
        amf.ecma_array(count);

        let duration = amf.number("duration", 0.0);
        let filesize = amf.number("fileSize", 0.0);
        if let Some(video) = &meta.video {
            amf.number("width", video.width as f64);
            amf.number("height", video.height as f64);
            amf.number("videocodecid", CODEC_AVC as f64);
            amf.number("videodatarate", video.bitrate_kbps as f64);
            amf.number("framerate", video.frame_rate);
        }
        if let Some(audio) = &meta.audio {
            amf.number("audiocodecid", CODEC_AAC as f64);
            amf.number("audiodatarate", audio.bitrate_kbps as f64);
            amf.number("audiosamplerate", audio.sample_rate as f64);
            amf.number("audiosamplesize", 16.0);
            amf.number("audiochannels", audio.channels as f64);
            amf.boolean("stereo", audio.channels == 2);
        }
        amf.string_entry("encoder", &meta.encoder_name);

        let mut times = None;
        let mut positions = None;
        if meta.keyframe_slots > 0 {
            amf.object("keyframes");
            times = Some(amf.number_array("times", meta.keyframe_slots));
            positions = Some(amf.number_array("filepositions", meta.keyframe_slots));
            amf.end_object();
        }
        amf.end_object();

        let body = amf.into_bytes();
        let data = tag(TAG_SCRIPT, 0, &body);
        MetaDataTag {
            data,
            duration_offset: FLV_TAG_HEADER_LENGTH + duration,
            filesize_offset: FLV_TAG_HEADER_LENGTH + filesize,
            keyframe_times_offset: times.map(|o| FLV_TAG_HEADER_LENGTH + o),
            keyframe_positions_offset: positions.map(|o| FLV_TAG_HEADER_LENGTH + o),
        }
    }

    /// Sequence header tag carrying the AudioSpecificConfig.
    pub fn audio_header(&self, config: &[u8]) -> Bytes {
        let mut body = BytesMut::with_capacity(2 + config.len());
        body.put_u8(AAC_SOUND_FLAGS);
        body.put_u8(AAC_SEQUENCE_HEADER);
        body.extend_from_slice(config);
        tag(TAG_AUDIO, 0, &body)
    }

    /// Sequence header tag carrying the AVCDecoderConfigurationRecord.
    pub fn video_header(&self, record: &[u8]) -> Bytes {
        let mut body = BytesMut::with_capacity(5 + record.len());
        body.put_u8(0x10 | CODEC_AVC);
        body.put_u8(AVC_SEQUENCE_HEADER);
        body.put_int(0, 3);
        body.extend_from_slice(record);
        tag(TAG_VIDEO, 0, &body)
    }

    /// Builds a data tag. Video payloads must already be length-prefixed.
    ///
    /// Returns the tag and its normalized timestamp in milliseconds.
    pub fn packet(&mut self, packet: &EncoderPacket, is_header: bool) -> (Bytes, i64) {
        let ts = if is_header { 0 } else { self.timestamp(packet) };
        let data = match packet.kind {
            EncoderType::Video => {
                let cts = if is_header {
                    0
                } else {
                    packet.ms_time(packet.pts) - packet.ms_time(packet.dts)
                };
                let frame_type = if packet.keyframe || is_header { 0x10 } else { 0x20 };
                let mut body = BytesMut::with_capacity(5 + packet.data.len());
                body.put_u8(frame_type | CODEC_AVC);
                body.put_u8(if is_header { AVC_SEQUENCE_HEADER } else { AVC_NALU });
                body.put_int(cts, 3);
                body.extend_from_slice(&packet.data);
                tag(TAG_VIDEO, ts, &body)
            }
            EncoderType::Audio => {
                let mut body = BytesMut::with_capacity(2 + packet.data.len());
                body.put_u8(AAC_SOUND_FLAGS);
                body.put_u8(if is_header { AAC_SEQUENCE_HEADER } else { AAC_RAW });
                body.extend_from_slice(&packet.data);
                tag(TAG_AUDIO, ts, &body)
            }
        };
        (data, ts)
    }

    /// Milliseconds since the first data packet of the session, never
    /// negative and never decreasing within one stream.
    fn timestamp(&mut self, packet: &EncoderPacket) -> i64 {
        let dts_ms = packet.ms_time(packet.dts);
        let origin = *self.origin_ms.get_or_insert(dts_ms);
        let slot = match packet.kind {
            EncoderType::Audio => 0,
            EncoderType::Video => 1,
        };
        let ts = (dts_ms - origin).max(0).max(self.last_ts[slot]);
        self.last_ts[slot] = ts;
        ts
    }
}

pub(crate) fn tag(tag_type: u8, ts_ms: i64, body: &[u8]) -> Bytes {
    let ts = ts_ms as u32;
    let mut buf =
        BytesMut::with_capacity(FLV_TAG_HEADER_LENGTH + body.len() + PREVIOUS_TAG_SIZE_LENGTH);
    buf.put_u8(tag_type);
    buf.put_uint(body.len() as u64, 3);
    buf.put_uint((ts & 0x00ff_ffff) as u64, 3);
    buf.put_u8((ts >> 24) as u8);
    buf.put_uint(0, 3);
    buf.extend_from_slice(body);
    buf.put_u32((body.len() + FLV_TAG_HEADER_LENGTH) as u32);
    buf.freeze()
}
