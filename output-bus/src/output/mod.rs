//! Generic output runtime.
//!
//! An [`Output`] owns one [`OutputDriver`] (file muxer, stream transport)
//! and runs at most one session at a time:
//! `Idle -> Configuring -> [DelayBuffering ->] Active -> Stopping -> Idle`.

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::{sync::broadcast, task::JoinHandle};
use tokio_util::sync::CancellationToken;

use crate::{
    encoder::Encoder,
    error::OutputError,
    event::SessionEvent,
    logger::{LogConfig, OutputLogger},
    packet::{EncoderPacket, EncoderType},
    service::{Service, WeakService},
    settings::{Property, Settings},
};

pub mod flv_file;
pub mod flv_stream;
mod session;

pub use flv_file::FlvFileOutput;
pub use flv_stream::FlvStreamOutput;

pub const MAX_AUDIO_MIXES: usize = 4;

const EVENT_CHANNEL_CAPACITY: usize = 64;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Configuring,
    DelayBuffering,
    Active,
    Stopping,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub enabled: bool,
    pub max_retries: u32,
    pub retry_delay: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            enabled: true,
            max_retries: 20,
            retry_delay: Duration::from_secs(10),
        }
    }
}

impl ReconnectPolicy {
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            max_retries: 0,
            retry_delay: Duration::ZERO,
        }
    }

    /// Attempts allowed after a connection loss.
    pub fn retries(&self) -> u32 {
        if self.enabled { self.max_retries } else { 0 }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DelaySettings {
    pub delay: Duration,
    /// Keep buffered packets across a reconnect.
    pub preserve: bool,
}

/// What a driver gets to work with for one session.
pub struct SessionInfo {
    pub name: String,
    pub video: Option<Encoder>,
    /// `(track slot, encoder)`, ordered by slot.
    pub audio: Vec<(usize, Encoder)>,
    pub service: Option<Service>,
    pub logger: Arc<OutputLogger>,
}

impl SessionInfo {
    pub fn encoders(&self) -> impl Iterator<Item = &Encoder> {
        self.video.iter().chain(self.audio.iter().map(|(_, e)| e))
    }

    /// The audio encoder of track 0.
    pub fn primary_audio(&self) -> Option<&Encoder> {
        self.audio.iter().find(|(slot, _)| *slot == 0).map(|(_, e)| e)
    }
}

/// Output implementation plugged into the runtime.
///
/// All methods are called from one task at a time: `start`, then
/// `encoded_packet` for every packet, then `stop`. `abort` replaces `stop`
/// when a start is canceled or fails.
#[async_trait]
pub trait OutputDriver: Send + 'static {
    fn id(&self) -> &'static str;

    fn properties(&self) -> Vec<Property> {
        Vec::new()
    }

    /// Whether the driver needs a service to start.
    fn uses_service(&self) -> bool {
        false
    }

    fn update(&mut self, settings: &Settings);

    async fn start(&mut self, session: &SessionInfo) -> Result<(), OutputError>;

    async fn encoded_packet(&mut self, packet: EncoderPacket) -> Result<(), OutputError>;

    async fn stop(&mut self) -> Result<(), OutputError>;

    async fn reconnect(&mut self, _session: &SessionInfo) -> Result<(), OutputError> {
        Err(OutputError::Disconnected(
            "output does not support reconnecting".into(),
        ))
    }

    async fn abort(&mut self) {}
}

pub(crate) struct OutputState {
    pub(crate) phase: SessionState,
    video: Option<Encoder>,
    audio: [Option<Encoder>; MAX_AUDIO_MIXES],
    service: Option<WeakService>,
    settings: Settings,
    delay: DelaySettings,
    reconnect: ReconnectPolicy,
    pub(crate) active_delay: Duration,
    pub(crate) force: Option<CancellationToken>,
    pub(crate) stop: Option<CancellationToken>,
    task: Option<JoinHandle<()>>,
}

struct OutputInner {
    name: String,
    id: &'static str,
    properties: Vec<Property>,
    uses_service: bool,
    driver: Arc<tokio::sync::Mutex<Box<dyn OutputDriver>>>,
    state: Arc<Mutex<OutputState>>,
    events: broadcast::Sender<SessionEvent>,
    logger: Arc<OutputLogger>,
}

impl Drop for OutputInner {
    fn drop(&mut self) {
        if let Some(force) = self.state.lock().force.take() {
            force.cancel();
        }
    }
}

/// Encoders acquired during start, released again unless disarmed.
#[derive(Default)]
struct Attached(Vec<Encoder>);

impl Attached {
    fn disarm(mut self) -> Vec<Encoder> {
        std::mem::take(&mut self.0)
    }
}

impl Drop for Attached {
    fn drop(&mut self) {
        for encoder in self.0.drain(..) {
            encoder.release();
        }
    }
}

#[derive(Clone)]
pub struct Output {
    inner: Arc<OutputInner>,
}

impl Output {
    pub fn new(name: &str, driver: impl OutputDriver) -> Self {
        Self::with_log_config(name, driver, LogConfig::default())
    }

    pub fn with_log_config(name: &str, driver: impl OutputDriver, log_config: LogConfig) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let id = driver.id();
        Self {
            inner: Arc::new(OutputInner {
                name: name.to_string(),
                id,
                properties: driver.properties(),
                uses_service: driver.uses_service(),
                driver: Arc::new(tokio::sync::Mutex::new(Box::new(driver))),
                state: Arc::new(Mutex::new(OutputState {
                    phase: SessionState::Idle,
                    video: None,
                    audio: Default::default(),
                    service: None,
                    settings: Settings::new(),
                    delay: DelaySettings::default(),
                    reconnect: ReconnectPolicy::default(),
                    active_delay: Duration::ZERO,
                    force: None,
                    stop: None,
                    task: None,
                })),
                events,
                logger: Arc::new(OutputLogger::new(id, name, log_config)),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn id(&self) -> &'static str {
        self.inner.id
    }

    pub fn properties(&self) -> Vec<Property> {
        self.inner.properties.clone()
    }

    pub fn logger(&self) -> &OutputLogger {
        &self.inner.logger
    }

    pub fn state(&self) -> SessionState {
        self.inner.state.lock().phase
    }

    pub fn active(&self) -> bool {
        self.state() != SessionState::Idle
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.inner.events.subscribe()
    }

    pub fn set_video_encoder(&self, encoder: Option<Encoder>) -> Result<(), OutputError> {
        if let Some(encoder) = &encoder {
            if encoder.kind() != EncoderType::Video {
                return Err(OutputError::InvalidStream(format!(
                    "'{}' is not a video encoder",
                    encoder.name()
                )));
            }
        }
        let mut state = self.inner.state.lock();
        if state.phase != SessionState::Idle {
            return Err(OutputError::Busy(
                "cannot change the video encoder of an active output".into(),
            ));
        }
        state.video = encoder;
        Ok(())
    }

    pub fn set_audio_encoder(&self, encoder: Option<Encoder>, idx: usize) -> Result<(), OutputError> {
        if idx >= MAX_AUDIO_MIXES {
            return Err(OutputError::InvalidStream(format!(
                "audio track {idx} out of range"
            )));
        }
        if let Some(encoder) = &encoder {
            if encoder.kind() != EncoderType::Audio {
                return Err(OutputError::InvalidStream(format!(
                    "'{}' is not an audio encoder",
                    encoder.name()
                )));
            }
        }
        let mut state = self.inner.state.lock();
        if state.phase != SessionState::Idle {
            return Err(OutputError::Busy(
                "cannot change an audio encoder of an active output".into(),
            ));
        }
        state.audio[idx] = encoder;
        Ok(())
    }

    pub fn video_encoder(&self) -> Option<Encoder> {
        self.inner.state.lock().video.clone()
    }

    pub fn audio_encoder(&self, idx: usize) -> Option<Encoder> {
        self.inner.state.lock().audio.get(idx).cloned().flatten()
    }

    pub fn set_service(&self, service: &Service) {
        self.inner.state.lock().service = Some(service.downgrade());
    }

    pub fn service(&self) -> Option<Service> {
        self.inner
            .state
            .lock()
            .service
            .as_ref()
            .and_then(WeakService::upgrade)
    }

    /// Takes effect on the next start.
    pub fn set_delay(&self, delay: Duration, preserve: bool) {
        self.inner.state.lock().delay = DelaySettings { delay, preserve };
    }

    pub fn delay(&self) -> DelaySettings {
        self.inner.state.lock().delay
    }

    /// Delay of the running session, zero when idle.
    pub fn active_delay(&self) -> Duration {
        self.inner.state.lock().active_delay
    }

    pub fn set_reconnect_settings(&self, policy: ReconnectPolicy) {
        self.inner.state.lock().reconnect = policy;
    }

    pub fn reconnect_settings(&self) -> ReconnectPolicy {
        self.inner.state.lock().reconnect
    }

    /// Replaces the driver settings used by the next start.
    pub fn update(&self, settings: Settings) {
        self.inner.state.lock().settings = settings;
    }

    pub fn settings(&self) -> Settings {
        self.inner.state.lock().settings.clone()
    }

    /// Starts a session. Starting an output that is already configuring or
    /// running succeeds without doing anything.
    pub async fn start(&self) -> Result<(), OutputError> {
        let (info, settings, delay, reconnect, force) = {
            let mut state = self.inner.state.lock();
            match state.phase {
                SessionState::Idle => {}
                SessionState::Stopping => {
                    return Err(OutputError::Busy("output is still stopping".into()));
                }
                _ => {
                    self.inner
                        .logger
                        .debug(format_args!("already active, start ignored"));
                    return Ok(());
                }
            }

            let video = state.video.clone();
            let audio: Vec<(usize, Encoder)> = state
                .audio
                .iter()
                .enumerate()
                .filter_map(|(slot, e)| e.clone().map(|e| (slot, e)))
                .collect();
            if video.is_none() && audio.is_empty() {
                return Err(OutputError::InvalidStream("no encoders attached".into()));
            }

            let service = state.service.as_ref().and_then(WeakService::upgrade);
            if self.inner.uses_service && service.is_none() {
                return Err(OutputError::InvalidStream(
                    "service is not set or no longer exists".into(),
                ));
            }

            let force = CancellationToken::new();
            state.phase = SessionState::Configuring;
            state.force = Some(force.clone());
            state.stop = None;
            let info = SessionInfo {
                name: self.inner.name.clone(),
                video,
                audio,
                service,
                logger: self.inner.logger.clone(),
            };
            (info, state.settings.clone(), state.delay, state.reconnect, force)
        };

        let packets = session::subscribe(&info);
        let mut driver = self.inner.driver.clone().lock_owned().await;
        let mut attached = Attached::default();

        let result = tokio::select! {
            biased;
            _ = force.cancelled() => Err(OutputError::Canceled),
            res = async {
                for encoder in info.encoders() {
                    encoder.acquire().map_err(|e| {
                        OutputError::Encoder(format!("{}: {:#}", encoder.name(), e))
                    })?;
                    attached.0.push(encoder.clone());
                }
                driver.update(&settings);
                driver.start(&info).await
            } => res,
        };

        if let Err(err) = result {
            driver.abort().await;
            drop(attached);
            drop(driver);
            {
                let mut state = self.inner.state.lock();
                state.phase = SessionState::Idle;
                state.force = None;
            }
            match &err {
                OutputError::Canceled => self.inner.logger.info(format_args!("start canceled")),
                _ => self.inner.logger.warn(format_args!("start failed: {err}")),
            }
            return Err(err);
        }

        if let Some(service) = &info.service {
            service.activate(&self.inner.name);
        }
        let encoders = attached.disarm();
        let buffering = !delay.delay.is_zero();
        if buffering {
            self.inner.logger.info(format_args!(
                "started with a {:.1}s delay",
                delay.delay.as_secs_f64()
            ));
            let _ = self.inner.events.send(SessionEvent::DelayStarting { delay: delay.delay });
        } else {
            self.inner.logger.info(format_args!("started"));
            let _ = self.inner.events.send(SessionEvent::SessionStarted);
        }

        let stop = CancellationToken::new();
        let session = session::Session {
            logger: self.inner.logger.clone(),
            driver,
            info,
            encoders,
            delay,
            reconnect,
            state: self.inner.state.clone(),
            events: self.inner.events.clone(),
            stop: stop.clone(),
            force,
        };

        let mut state = self.inner.state.lock();
        state.phase = if buffering {
            SessionState::DelayBuffering
        } else {
            SessionState::Active
        };
        state.stop = Some(stop);
        state.active_delay = delay.delay;
        state.task = Some(tokio::spawn(session.run(packets)));
        Ok(())
    }

    /// Graceful stop: drains pending packets and the delay buffer, then
    /// finalizes the output. Stopping an idle output does nothing.
    pub async fn stop(&self) {
        let handle = {
            let mut state = self.inner.state.lock();
            match state.phase {
                SessionState::Idle | SessionState::Stopping => None,
                SessionState::Configuring => {
                    if let Some(force) = &state.force {
                        force.cancel();
                    }
                    None
                }
                SessionState::DelayBuffering | SessionState::Active => {
                    state.phase = SessionState::Stopping;
                    if let Some(stop) = &state.stop {
                        stop.cancel();
                    }
                    state.task.take()
                }
            }
        };
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }

    /// Immediate stop: skips draining and cancels a pending start.
    pub async fn force_stop(&self) {
        let handle = {
            let mut state = self.inner.state.lock();
            if state.phase == SessionState::Idle {
                return;
            }
            if let Some(force) = &state.force {
                force.cancel();
            }
            if state.phase != SessionState::Configuring {
                state.phase = SessionState::Stopping;
            }
            state.task.take()
        };
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }
}

impl std::fmt::Debug for Output {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Output")
            .field("name", &self.inner.name)
            .field("id", &self.inner.id)
            .field("state", &self.state())
            .finish()
    }
}

#[cfg(test)]
#[path = "output_test.rs"]
mod output_test;
