use std::{collections::VecDeque, sync::Arc, time::Duration};

use futures::{
    FutureExt, StreamExt,
    stream::{BoxStream, SelectAll},
};
use parking_lot::Mutex;
use tokio::{
    sync::{OwnedMutexGuard, broadcast},
    time::{Instant, sleep, sleep_until},
};
use tokio_stream::wrappers::{BroadcastStream, errors::BroadcastStreamRecvError};
use tokio_util::sync::CancellationToken;

use crate::{
    encoder::Encoder,
    error::OutputError,
    event::{SessionEvent, StopCode},
    logger::OutputLogger,
    output::{DelaySettings, OutputDriver, OutputState, ReconnectPolicy, SessionInfo, SessionState},
    packet::{EncoderPacket, PacketCmd},
};

type TrackItem = (usize, Result<PacketCmd, BroadcastStreamRecvError>);

pub(crate) type PacketStream = SelectAll<BoxStream<'static, TrackItem>>;

/// Merges the packet channels of all session encoders. Video is reported
/// as slot 0, audio with its track slot.
pub(crate) fn subscribe(info: &SessionInfo) -> PacketStream {
    let mut streams: Vec<BoxStream<'static, TrackItem>> = Vec::new();
    if let Some(video) = &info.video {
        streams.push(
            BroadcastStream::new(video.subscribe())
                .map(|item| (0, item))
                .boxed(),
        );
    }
    for (slot, audio) in &info.audio {
        let slot = *slot;
        streams.push(
            BroadcastStream::new(audio.subscribe())
                .map(move |item| (slot, item))
                .boxed(),
        );
    }
    futures::stream::select_all(streams)
}

/// The single writer of one output session.
pub(crate) struct Session {
    pub(crate) logger: Arc<OutputLogger>,
    pub(crate) driver: OwnedMutexGuard<Box<dyn OutputDriver>>,
    pub(crate) info: SessionInfo,
    pub(crate) encoders: Vec<Encoder>,
    pub(crate) delay: DelaySettings,
    pub(crate) reconnect: ReconnectPolicy,
    pub(crate) state: Arc<Mutex<OutputState>>,
    pub(crate) events: broadcast::Sender<SessionEvent>,
    pub(crate) stop: CancellationToken,
    pub(crate) force: CancellationToken,
}

impl Session {
    pub(crate) async fn run(mut self, mut packets: PacketStream) {
        let started = Instant::now();
        let mut queue: VecDeque<(Instant, EncoderPacket)> = VecDeque::new();
        let mut buffering = !self.delay.delay.is_zero();
        let mut stopping = false;
        let mut open_streams = packets.len();
        let stop = self.stop.clone();
        let force = self.force.clone();

        let failure = loop {
            let release_at = queue.front().map(|(at, _)| *at + self.delay.delay);
            tokio::select! {
                biased;
                _ = force.cancelled() => break None,
                _ = stop.cancelled(), if !stopping => {
                    stopping = true;
                    let _ = self.events.send(SessionEvent::SessionStopping);
                    if let Err(err) = self.drain_ready(&mut packets, &mut queue).await {
                        break Some(err);
                    }
                    match queue.back() {
                        None => break None,
                        Some((at, _)) => {
                            let remaining = (*at + self.delay.delay).saturating_duration_since(Instant::now());
                            self.logger.info(format_args!(
                                "stopping after the {:.1}s delay buffer drains",
                                remaining.as_secs_f64()
                            ));
                            let _ = self.events.send(SessionEvent::DelayStopping { remaining });
                        }
                    }
                }
                _ = sleep_until(started + self.delay.delay), if buffering && !stopping => {
                    buffering = false;
                    {
                        let mut state = self.state.lock();
                        if state.phase == SessionState::DelayBuffering {
                            state.phase = SessionState::Active;
                        }
                    }
                    let _ = self.events.send(SessionEvent::SessionStarted);
                }
                _ = sleep_until(release_at.unwrap_or(started)), if release_at.is_some() => {
                    if let Err(err) = self.release_due(&mut queue).await {
                        break Some(err);
                    }
                    if stopping && queue.is_empty() {
                        break None;
                    }
                }
                item = packets.next(), if !stopping => match item {
                    Some((slot, Ok(PacketCmd::Data(packet)))) => {
                        if let Err(err) = self.accept(slot, packet, &mut queue).await {
                            break Some(err);
                        }
                    }
                    Some((_, Ok(PacketCmd::Eof))) => {
                        open_streams = open_streams.saturating_sub(1);
                        if open_streams == 0 {
                            self.logger.info(format_args!("encoders finished"));
                            stopping = true;
                            if queue.is_empty() {
                                break None;
                            }
                        }
                    }
                    Some((slot, Err(BroadcastStreamRecvError::Lagged(n)))) => {
                        self.logger.warn(format_args!(
                            "output too slow, dropped {n} packets of track {slot}"
                        ));
                    }
                    None => {
                        stopping = true;
                        if queue.is_empty() {
                            break None;
                        }
                    }
                },
            }
        };

        let mut code = match &failure {
            None | Some(OutputError::Canceled) => StopCode::Success,
            Some(err) => {
                self.logger.error(format_args!("session failed: {err}"));
                err.code()
            }
        };

        if let Err(err) = self.driver.stop().await {
            self.logger.warn(format_args!("stop failed: {err}"));
            if code.is_success() {
                code = err.code();
            }
        }
        drop(self.driver);

        for encoder in self.encoders.drain(..) {
            encoder.release();
        }
        if let Some(service) = &self.info.service {
            service.deactivate();
        }
        {
            let mut state = self.state.lock();
            state.phase = SessionState::Idle;
            state.force = None;
            state.stop = None;
            state.active_delay = Duration::ZERO;
        }
        self.logger.info(format_args!("stopped: {code}"));
        let _ = self.events.send(SessionEvent::SessionStopped { code });
    }

    async fn accept(
        &mut self,
        slot: usize,
        mut packet: EncoderPacket,
        queue: &mut VecDeque<(Instant, EncoderPacket)>,
    ) -> Result<(), OutputError> {
        if packet.kind.is_audio() {
            packet.track_idx = slot;
        }
        if self.delay.delay.is_zero() {
            self.deliver(packet, queue).await
        } else {
            queue.push_back((Instant::now(), packet));
            Ok(())
        }
    }

    /// Takes whatever the encoders already published without waiting.
    async fn drain_ready(
        &mut self,
        packets: &mut PacketStream,
        queue: &mut VecDeque<(Instant, EncoderPacket)>,
    ) -> Result<(), OutputError> {
        while let Some(Some(item)) = packets.next().now_or_never() {
            if let (slot, Ok(PacketCmd::Data(packet))) = item {
                self.accept(slot, packet, queue).await?;
            }
        }
        Ok(())
    }

    async fn release_due(
        &mut self,
        queue: &mut VecDeque<(Instant, EncoderPacket)>,
    ) -> Result<(), OutputError> {
        let now = Instant::now();
        while let Some((at, _)) = queue.front() {
            if *at + self.delay.delay > now {
                break;
            }
            let Some((_, packet)) = queue.pop_front() else {
                break;
            };
            self.deliver(packet, queue).await?;
        }
        Ok(())
    }

    async fn deliver(
        &mut self,
        packet: EncoderPacket,
        queue: &mut VecDeque<(Instant, EncoderPacket)>,
    ) -> Result<(), OutputError> {
        let result = tokio::select! {
            biased;
            _ = self.force.cancelled() => return Err(OutputError::Canceled),
            res = self.driver.encoded_packet(packet) => res,
        };
        match result {
            Ok(()) => Ok(()),
            Err(err) if err.is_reconnectable() => self.reconnect(err, queue).await,
            Err(err) => Err(err),
        }
    }

    async fn reconnect(
        &mut self,
        cause: OutputError,
        queue: &mut VecDeque<(Instant, EncoderPacket)>,
    ) -> Result<(), OutputError> {
        let max_retries = self.reconnect.retries();
        if max_retries == 0 {
            return Err(cause);
        }
        self.logger.warn(format_args!("connection lost: {cause}"));

        for attempt in 1..=max_retries {
            let _ = self.events.send(SessionEvent::Reconnecting {
                attempt,
                max_retries,
            });
            self.logger.info(format_args!(
                "reconnecting in {:.1}s, attempt {attempt} of {max_retries}",
                self.reconnect.retry_delay.as_secs_f64()
            ));
            tokio::select! {
                biased;
                _ = self.force.cancelled() => return Err(OutputError::Canceled),
                _ = self.stop.cancelled() => return Err(OutputError::Canceled),
                _ = sleep(self.reconnect.retry_delay) => {}
            }

            let result = tokio::select! {
                biased;
                _ = self.force.cancelled() => return Err(OutputError::Canceled),
                res = self.driver.reconnect(&self.info) => res,
            };
            match result {
                Ok(()) => {
                    if !self.delay.preserve {
                        queue.clear();
                    }
                    self.logger.info(format_args!("reconnected"));
                    let _ = self.events.send(SessionEvent::Reconnected);
                    return Ok(());
                }
                Err(err) => {
                    self.logger
                        .warn(format_args!("reconnect attempt {attempt} failed: {err}"));
                }
            }
        }

        Err(OutputError::Disconnected(format!(
            "gave up after {max_retries} reconnect attempts: {cause}"
        )))
    }
}
