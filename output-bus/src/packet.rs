use bytes::Bytes;

pub type PacketSender = tokio::sync::broadcast::Sender<PacketCmd>;
pub type PacketReceiver = tokio::sync::broadcast::Receiver<PacketCmd>;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum EncoderType {
    Audio,
    Video,
}

impl EncoderType {
    pub fn is_video(&self) -> bool {
        matches!(self, EncoderType::Video)
    }

    pub fn is_audio(&self) -> bool {
        matches!(self, EncoderType::Audio)
    }
}

#[derive(Clone, Debug)]
pub enum PacketCmd {
    Data(EncoderPacket),
    Eof,
}

/// One compressed frame as produced by an encoder.
#[derive(Clone, Debug)]
pub struct EncoderPacket {
    pub kind: EncoderType,
    pub data: Bytes,
    pub pts: i64,
    pub dts: i64,
    pub timebase_num: i32,
    pub timebase_den: i32,
    pub keyframe: bool,
    pub track_idx: usize,
}

impl EncoderPacket {
    pub fn video(
        data: impl Into<Bytes>,
        pts: i64,
        dts: i64,
        timebase: (i32, i32),
        keyframe: bool,
    ) -> Self {
        Self {
            kind: EncoderType::Video,
            data: data.into(),
            pts,
            dts,
            timebase_num: timebase.0,
            timebase_den: timebase.1,
            keyframe,
            track_idx: 0,
        }
    }

    pub fn audio(data: impl Into<Bytes>, pts: i64, timebase: (i32, i32)) -> Self {
        Self {
            kind: EncoderType::Audio,
            data: data.into(),
            pts,
            dts: pts,
            timebase_num: timebase.0,
            timebase_den: timebase.1,
            keyframe: true,
            track_idx: 0,
        }
    }

    /// Converts a timestamp in this packet's timebase to milliseconds.
    pub fn ms_time(&self, value: i64) -> i64 {
        if self.timebase_den == 0 {
            return 0;
        }
        (value as i128 * self.timebase_num as i128 * 1000 / self.timebase_den as i128) as i64
    }

    pub fn dts_usec(&self) -> i64 {
        if self.timebase_den == 0 {
            return 0;
        }
        (self.dts as i128 * self.timebase_num as i128 * 1_000_000 / self.timebase_den as i128)
            as i64
    }

    pub fn size(&self) -> usize {
        self.data.len()
    }
}

/// Decoder configuration of one encoder, read once per session.
#[derive(Clone, Debug)]
pub struct HeaderInfo {
    pub kind: EncoderType,
    pub data: Bytes,
}
