//! Output handlers: turn the flat configuration into encoders and wire
//! them to one streaming and one recording output.

use std::{
    path::PathBuf,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio_util::sync::CancellationToken;

use crate::{
    config::ConfigMap,
    encoder::{AudioInfo, Encoder, EncoderFactory, VideoFormat, VideoInfo},
    error::HandlerError,
    event::{HandlerEvent, SessionEvent, SessionKind},
    output::{Output, ReconnectPolicy},
    packet::EncoderType,
    service::{Service, WeakService},
    settings::Settings,
};

pub mod advanced;
pub mod audio;
pub mod filename;
pub mod quality;
pub mod simple;

pub use advanced::AdvancedOutput;
pub use audio::AacBitrateMap;
pub use simple::SimpleOutput;

const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Raw video/audio format every encoder is fed with.
#[derive(Clone, Debug, PartialEq)]
pub struct MediaInfo {
    pub video: VideoInfo,
    pub audio: AudioInfo,
}

impl MediaInfo {
    pub fn from_config(config: &ConfigMap) -> Self {
        Self {
            video: VideoInfo {
                width: config.get_uint("Video", "OutputCX"),
                height: config.get_uint("Video", "OutputCY"),
                fps_num: config.get_uint("Video", "FPSNum"),
                fps_den: config.get_uint("Video", "FPSDen").max(1),
                format: VideoFormat::parse(&config.get_str("Video", "ColorFormat")),
            },
            audio: AudioInfo {
                sample_rate: config.get_uint("Audio", "SampleRate"),
                channels: config.get_uint("Audio", "Channels"),
            },
        }
    }

    /// Encoders only take NV12 or I420 input directly.
    pub fn needs_nv12_conversion(&self) -> bool {
        !matches!(self.video.format, VideoFormat::Nv12 | VideoFormat::I420)
    }
}

#[async_trait]
pub trait OutputHandler: Send + Sync {
    fn base(&self) -> &BasicOutputHandler;

    async fn start_streaming(&self, service: &Service) -> Result<(), HandlerError>;

    async fn start_recording(&self) -> Result<(), HandlerError>;

    async fn stop_streaming(&self) {
        self.base().stream_output.stop().await;
    }

    async fn force_stop_streaming(&self) {
        self.base().stream_output.force_stop().await;
    }

    async fn stop_recording(&self) {
        self.base().file_output.stop().await;
    }

    fn streaming_active(&self) -> bool {
        self.base().stream_output.active()
    }

    fn recording_active(&self) -> bool {
        self.base().file_output.active()
    }

    fn active(&self) -> bool {
        self.streaming_active() || self.recording_active()
    }

    /// Reapplies the streaming encoder settings from the configuration.
    fn update(&self) -> Result<(), HandlerError>;

    fn subscribe(&self) -> broadcast::Receiver<HandlerEvent> {
        self.base().events.subscribe()
    }
}

/// State shared by the Simple and Advanced handlers.
pub struct BasicOutputHandler {
    pub(crate) config: ConfigMap,
    pub(crate) media: MediaInfo,
    pub(crate) factory: Arc<dyn EncoderFactory>,
    pub(crate) aac: AacBitrateMap,
    pub(crate) stream_output: Output,
    pub(crate) file_output: Output,
    /// Serializes start requests.
    pub(crate) op: tokio::sync::Mutex<()>,
    events: broadcast::Sender<HandlerEvent>,
    delay_active: Arc<AtomicBool>,
    service: Mutex<Option<WeakService>>,
    cancel: CancellationToken,
}

impl BasicOutputHandler {
    pub(crate) fn new(
        config: ConfigMap,
        factory: Arc<dyn EncoderFactory>,
        stream_output: Output,
        file_output: Output,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let handler = Self {
            media: MediaInfo::from_config(&config),
            aac: AacBitrateMap::probe(factory.as_ref()),
            config,
            factory,
            stream_output,
            file_output,
            op: tokio::sync::Mutex::new(()),
            events,
            delay_active: Arc::new(AtomicBool::new(false)),
            service: Mutex::new(None),
            cancel: CancellationToken::new(),
        };
        handler.forward_events(SessionKind::Streaming, &handler.stream_output);
        handler.forward_events(SessionKind::Recording, &handler.file_output);
        handler
    }

    fn forward_events(&self, kind: SessionKind, output: &Output) {
        let mut rx = output.subscribe();
        let events = self.events.clone();
        let delay_active = self.delay_active.clone();
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    _ = cancel.cancelled() => break,
                    event = rx.recv() => event,
                };
                match event {
                    Ok(event) => {
                        if kind == SessionKind::Streaming {
                            match &event {
                                SessionEvent::DelayStarting { .. } => {
                                    delay_active.store(true, Ordering::SeqCst)
                                }
                                SessionEvent::SessionStopped { .. } => {
                                    delay_active.store(false, Ordering::SeqCst)
                                }
                                _ => {}
                            }
                        }
                        log::debug!("{} event: {:?}", kind, event);
                        let _ = events.send(HandlerEvent { kind, event });
                    }
                    Err(RecvError::Lagged(n)) => {
                        log::warn!("{} events lagged, {} dropped", kind, n);
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        });
    }

    pub fn config(&self) -> &ConfigMap {
        &self.config
    }

    pub fn media(&self) -> &MediaInfo {
        &self.media
    }

    pub fn stream_output(&self) -> &Output {
        &self.stream_output
    }

    pub fn file_output(&self) -> &Output {
        &self.file_output
    }

    /// True while the running stream withholds packets for a delay.
    pub fn delay_active(&self) -> bool {
        self.delay_active.load(Ordering::SeqCst)
    }

    /// The service of the last streaming start, if it still exists.
    pub fn service(&self) -> Option<Service> {
        self.service.lock().as_ref().and_then(WeakService::upgrade)
    }

    pub(crate) fn set_service(&self, service: &Service) {
        *self.service.lock() = Some(service.downgrade());
    }

    pub(crate) fn create_video_encoder(
        &self,
        id: &str,
        name: &str,
        settings: Settings,
    ) -> Result<Encoder, HandlerError> {
        Ok(Encoder::create(
            self.factory.as_ref(),
            id,
            name,
            EncoderType::Video,
            0,
            settings,
        )?)
    }

    /// Creates the AAC encoder that serves `bitrate` best.
    pub(crate) fn create_aac_encoder(
        &self,
        bitrate: u32,
        name: &str,
        mixer_idx: usize,
    ) -> Result<Encoder, HandlerError> {
        let bitrate = self.aac.closest(bitrate);
        let id = self.aac.encoder_for_bitrate(bitrate).ok_or_else(|| {
            HandlerError::Encoder(format!("no AAC encoder supports {bitrate} kbps"))
        })?;
        Ok(Encoder::create(
            self.factory.as_ref(),
            id,
            name,
            EncoderType::Audio,
            mixer_idx,
            Settings::new()
                .with("rate_control", "CBR")
                .with("bitrate", bitrate),
        )?)
    }

    /// Applies bind address, reconnect policy and delay from `Output.*`.
    pub(crate) fn configure_stream_output(&self, service: &Service) {
        let config = &self.config;
        self.stream_output.set_service(service);
        self.stream_output.update(
            Settings::new().with("bind_ip", config.get_str("Output", "BindIP")),
        );

        let reconnect = config.get_bool("Output", "Reconnect");
        self.stream_output.set_reconnect_settings(ReconnectPolicy {
            enabled: reconnect,
            max_retries: if reconnect {
                config.get_uint("Output", "MaxRetries")
            } else {
                0
            },
            retry_delay: Duration::from_secs(config.get_uint("Output", "RetryDelay") as u64),
        });

        let delay = if config.get_bool("Output", "DelayEnable") {
            config.get_uint("Output", "DelaySec")
        } else {
            0
        };
        self.stream_output.set_delay(
            Duration::from_secs(delay as u64),
            config.get_bool("Output", "DelayPreserve"),
        );
    }

    /// Validates the recording directory and picks the file to record to.
    pub(crate) async fn recording_path(
        &self,
        dir_key: (&str, &str),
        format_key: (&str, &str),
        no_space_key: (&str, &str),
    ) -> Result<PathBuf, HandlerError> {
        let config = &self.config;
        let dir = config.get_str(dir_key.0, dir_key.1);
        let format = config.get_str(format_key.0, format_key.1);
        if !format.eq_ignore_ascii_case("flv") {
            return Err(HandlerError::config(format!(
                "recording format '{format}' is not supported, use flv"
            )));
        }
        filename::prepare_recording_path(
            &dir,
            &format.to_ascii_lowercase(),
            config.get_bool(no_space_key.0, no_space_key.1),
            &config.get_str("Output", "FilenameFormatting"),
            config.get_bool("Output", "OverwriteIfExists"),
        )
        .await
    }

    pub(crate) async fn start_output(&self, kind: SessionKind) -> Result<(), HandlerError> {
        let output = match kind {
            SessionKind::Streaming => &self.stream_output,
            SessionKind::Recording => &self.file_output,
        };
        output
            .start()
            .await
            .map_err(|e| HandlerError::output(kind, e))
    }
}

impl Drop for BasicOutputHandler {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Parses `"<width>x<height>"`.
pub(crate) fn parse_resolution(value: &str) -> Option<(u32, u32)> {
    let (cx, cy) = value.trim().split_once('x')?;
    let cx = cx.trim().parse().ok()?;
    let cy = cy.trim().parse().ok()?;
    Some((cx, cy))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_resolution() {
        assert_eq!(parse_resolution("1280x720"), Some((1280, 720)));
        assert_eq!(parse_resolution(" 852 x 480 "), Some((852, 480)));
        assert_eq!(parse_resolution("1280"), None);
        assert_eq!(parse_resolution("axb"), None);
    }

    #[test]
    fn test_media_info_from_config() {
        let config = ConfigMap::new()
            .with("Video", "OutputCX", 1920)
            .with("Video", "OutputCY", 1080)
            .with("Video", "ColorFormat", "RGBA");
        let media = MediaInfo::from_config(&config);
        assert_eq!((media.video.width, media.video.height), (1920, 1080));
        assert_eq!(media.video.frame_rate(), 30.0);
        assert_eq!(media.audio.sample_rate, 44100);
        assert!(media.needs_nv12_conversion());
    }
}
