use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;

use crate::{
    packet::{EncoderPacket, EncoderType, HeaderInfo, PacketCmd, PacketReceiver, PacketSender},
    settings::{Property, Settings},
};

const PACKET_CHANNEL_CAPACITY: usize = 1024;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum VideoFormat {
    I420,
    #[default]
    Nv12,
    I444,
    Rgba,
}

impl VideoFormat {
    pub fn parse(name: &str) -> Self {
        match name.to_ascii_uppercase().as_str() {
            "I420" => VideoFormat::I420,
            "I444" => VideoFormat::I444,
            "RGBA" | "RGB" => VideoFormat::Rgba,
            _ => VideoFormat::Nv12,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct VideoInfo {
    pub width: u32,
    pub height: u32,
    pub fps_num: u32,
    pub fps_den: u32,
    pub format: VideoFormat,
}

impl VideoInfo {
    pub fn frame_rate(&self) -> f64 {
        if self.fps_den == 0 {
            return 0.0;
        }
        self.fps_num as f64 / self.fps_den as f64
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct AudioInfo {
    pub sample_rate: u32,
    pub channels: u32,
}

/// Everything a backend needs to open its codec.
#[derive(Clone, Debug)]
pub struct EncoderContext {
    pub name: String,
    pub settings: Settings,
    pub video: Option<VideoInfo>,
    pub audio: Option<AudioInfo>,
    /// Output size when the encoder rescales.
    pub scaled_size: Option<(u32, u32)>,
    pub preferred_format: Option<VideoFormat>,
}

/// Handle the backend pushes compressed packets through. Safe to use from
/// any thread.
#[derive(Clone)]
pub struct PacketPublisher {
    kind: EncoderType,
    tx: PacketSender,
}

impl PacketPublisher {
    pub fn send(&self, mut packet: EncoderPacket) {
        packet.kind = self.kind;
        // no receivers simply means no output is listening right now
        let _ = self.tx.send(PacketCmd::Data(packet));
    }

    pub fn finish(&self) {
        let _ = self.tx.send(PacketCmd::Eof);
    }
}

/// External codec implementation driven by [`Encoder`].
pub trait EncoderBackend: Send {
    /// Opens the codec and starts publishing packets.
    fn initialize(
        &mut self,
        ctx: &EncoderContext,
        publisher: PacketPublisher,
    ) -> anyhow::Result<()>;

    fn update(&mut self, settings: &Settings) -> anyhow::Result<()>;

    /// Decoder configuration; available after `initialize`.
    fn extra_data(&self) -> Option<Bytes>;

    fn properties(&self) -> Vec<Property> {
        Vec::new()
    }

    fn shutdown(&mut self);
}

/// Creates backends by encoder type id (`obs_x264`, `ffmpeg_aac`, ...).
pub trait EncoderFactory: Send + Sync {
    fn create(
        &self,
        id: &str,
        name: &str,
        kind: EncoderType,
        settings: &Settings,
    ) -> anyhow::Result<Box<dyn EncoderBackend>>;

    /// Bitrates (kbps) supported by an audio encoder type, empty when the
    /// type is unavailable.
    fn audio_bitrates(&self, id: &str) -> Vec<u32>;
}

struct EncoderState {
    name: String,
    settings: Settings,
    video: Option<VideoInfo>,
    audio: Option<AudioInfo>,
    scaled_size: Option<(u32, u32)>,
    preferred_format: Option<VideoFormat>,
    users: usize,
}

struct EncoderInner {
    id: String,
    kind: EncoderType,
    mixer_idx: usize,
    state: Mutex<EncoderState>,
    backend: Mutex<Box<dyn EncoderBackend>>,
    tx: PacketSender,
}

/// Shared encoder handle. Cloning shares the codec; the codec runs while at
/// least one active output is attached.
#[derive(Clone)]
pub struct Encoder {
    inner: Arc<EncoderInner>,
}

impl Encoder {
    pub fn new(
        id: &str,
        name: &str,
        kind: EncoderType,
        mixer_idx: usize,
        settings: Settings,
        backend: Box<dyn EncoderBackend>,
    ) -> Self {
        let (tx, _) = tokio::sync::broadcast::channel(PACKET_CHANNEL_CAPACITY);
        Self {
            inner: Arc::new(EncoderInner {
                id: id.to_string(),
                kind,
                mixer_idx,
                state: Mutex::new(EncoderState {
                    name: name.to_string(),
                    settings,
                    video: None,
                    audio: None,
                    scaled_size: None,
                    preferred_format: None,
                    users: 0,
                }),
                backend: Mutex::new(backend),
                tx,
            }),
        }
    }

    pub fn create(
        factory: &dyn EncoderFactory,
        id: &str,
        name: &str,
        kind: EncoderType,
        mixer_idx: usize,
        settings: Settings,
    ) -> anyhow::Result<Self> {
        let backend = factory
            .create(id, name, kind, &settings)
            .map_err(|e| anyhow::anyhow!("create encoder {} ({}): {:#}", name, id, e))?;
        Ok(Self::new(id, name, kind, mixer_idx, settings, backend))
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn kind(&self) -> EncoderType {
        self.inner.kind
    }

    pub fn mixer_idx(&self) -> usize {
        self.inner.mixer_idx
    }

    pub fn name(&self) -> String {
        self.inner.state.lock().name.clone()
    }

    pub fn set_name(&self, name: &str) {
        self.inner.state.lock().name = name.to_string();
    }

    pub fn settings(&self) -> Settings {
        self.inner.state.lock().settings.clone()
    }

    /// Stores new settings and forwards them to a running codec.
    pub fn update(&self, settings: Settings) -> anyhow::Result<()> {
        let active = {
            let mut state = self.inner.state.lock();
            state.settings = settings.clone();
            state.users > 0
        };
        if active {
            self.inner.backend.lock().update(&settings)?;
        }
        Ok(())
    }

    pub fn active(&self) -> bool {
        self.inner.state.lock().users > 0
    }

    pub fn set_video(&self, info: VideoInfo) {
        self.inner.state.lock().video = Some(info);
    }

    pub fn set_audio(&self, info: AudioInfo) {
        self.inner.state.lock().audio = Some(info);
    }

    pub fn video_info(&self) -> Option<VideoInfo> {
        self.inner.state.lock().video.clone()
    }

    pub fn audio_info(&self) -> Option<AudioInfo> {
        self.inner.state.lock().audio.clone()
    }

    pub fn set_scaled_size(&self, width: u32, height: u32) {
        self.inner.state.lock().scaled_size = Some((width, height));
    }

    pub fn clear_scaled_size(&self) {
        self.inner.state.lock().scaled_size = None;
    }

    pub fn width(&self) -> u32 {
        let state = self.inner.state.lock();
        state
            .scaled_size
            .map(|(w, _)| w)
            .or_else(|| state.video.as_ref().map(|v| v.width))
            .unwrap_or(0)
    }

    pub fn height(&self) -> u32 {
        let state = self.inner.state.lock();
        state
            .scaled_size
            .map(|(_, h)| h)
            .or_else(|| state.video.as_ref().map(|v| v.height))
            .unwrap_or(0)
    }

    pub fn set_preferred_video_format(&self, format: VideoFormat) {
        self.inner.state.lock().preferred_format = Some(format);
    }

    pub fn preferred_video_format(&self) -> Option<VideoFormat> {
        self.inner.state.lock().preferred_format
    }

    /// Target bitrate in kbps as configured in the settings.
    pub fn bitrate(&self) -> u32 {
        self.inner
            .state
            .lock()
            .settings
            .get_int("bitrate")
            .unwrap_or(0)
            .max(0) as u32
    }

    pub fn extra_data(&self) -> Option<Bytes> {
        self.inner.backend.lock().extra_data()
    }

    pub fn header_info(&self) -> Option<HeaderInfo> {
        self.extra_data().map(|data| HeaderInfo {
            kind: self.inner.kind,
            data,
        })
    }

    pub fn properties(&self) -> Vec<Property> {
        self.inner.backend.lock().properties()
    }

    pub fn subscribe(&self) -> PacketReceiver {
        self.inner.tx.subscribe()
    }

    pub fn ptr_eq(&self, other: &Encoder) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Attaches one active output, opening the codec for the first one.
    pub(crate) fn acquire(&self) -> anyhow::Result<()> {
        let mut state = self.inner.state.lock();
        if state.users == 0 {
            let ctx = EncoderContext {
                name: state.name.clone(),
                settings: state.settings.clone(),
                video: state.video.clone(),
                audio: state.audio.clone(),
                scaled_size: state.scaled_size,
                preferred_format: state.preferred_format,
            };
            let publisher = PacketPublisher {
                kind: self.inner.kind,
                tx: self.inner.tx.clone(),
            };
            self.inner.backend.lock().initialize(&ctx, publisher)?;
            log::debug!("encoder '{}' ({}) initialized", state.name, self.inner.id);
        }
        state.users += 1;
        Ok(())
    }

    /// Detaches one output; the last one shuts the codec down.
    pub(crate) fn release(&self) {
        let mut state = self.inner.state.lock();
        if state.users == 0 {
            return;
        }
        state.users -= 1;
        if state.users == 0 {
            self.inner.backend.lock().shutdown();
            let _ = self.inner.tx.send(PacketCmd::Eof);
            log::debug!("encoder '{}' ({}) shut down", state.name, self.inner.id);
        }
    }
}

impl std::fmt::Debug for Encoder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Encoder")
            .field("id", &self.inner.id)
            .field("name", &self.name())
            .field("kind", &self.inner.kind)
            .field("mixer_idx", &self.inner.mixer_idx)
            .finish()
    }
}
