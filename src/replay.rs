//! Encoder collaborator that replays pre-encoded elementary streams: an
//! Annex B H.264 file for video and an ADTS AAC file for audio.

use std::{
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use anyhow::Context;
use bytes::{BufMut, Bytes, BytesMut};
use output_bus::{
    avc::{AnnexBNals, nal_type},
    config::ConfigMap,
    encoder::{EncoderBackend, EncoderContext, EncoderFactory, PacketPublisher},
    packet::{EncoderPacket, EncoderType},
    settings::Settings,
};
use tokio_util::sync::CancellationToken;

const NAL_SLICE: u8 = 1;
const NAL_IDR: u8 = 5;
const NAL_SEI: u8 = 6;
const NAL_SPS: u8 = 7;
const NAL_PPS: u8 = 8;
const NAL_AUD: u8 = 9;

const AAC_FRAME_SAMPLES: i64 = 1024;
const ADTS_SAMPLE_RATES: [u32; 13] = [
    96000, 88200, 64000, 48000, 44100, 32000, 24000, 22050, 16000, 12000, 11025, 8000, 7350,
];

#[derive(Clone, Debug)]
struct Frame {
    data: Bytes,
    keyframe: bool,
}

/// A whole elementary stream held in memory.
#[derive(Clone, Debug)]
struct Track {
    kind: EncoderType,
    /// Annex B SPS/PPS for video, AudioSpecificConfig for audio.
    extra: Bytes,
    frames: Arc<Vec<Frame>>,
    /// Set for audio; video timing follows the configured frame rate.
    sample_rate: Option<u32>,
}

impl Track {
    fn h264(data: &[u8]) -> anyhow::Result<Self> {
        let mut extra = BytesMut::new();
        let (mut have_sps, mut have_pps) = (false, false);
        let mut frames = Vec::new();
        let mut current = BytesMut::new();
        let mut has_vcl = false;
        let mut keyframe = false;

        for nal in AnnexBNals::new(data) {
            let kind = nal_type(nal);
            let starts_new = match kind {
                NAL_AUD => true,
                NAL_SPS | NAL_PPS | NAL_SEI => has_vcl,
                NAL_SLICE | NAL_IDR => has_vcl && nal.get(1).is_some_and(|b| b & 0x80 != 0),
                _ => false,
            };
            if starts_new && has_vcl {
                frames.push(Frame {
                    data: current.split().freeze(),
                    keyframe,
                });
                has_vcl = false;
                keyframe = false;
            }

            match kind {
                NAL_SPS | NAL_PPS => {
                    let seen = if kind == NAL_SPS { &mut have_sps } else { &mut have_pps };
                    if !*seen {
                        *seen = true;
                        extra.put_slice(&[0, 0, 0, 1]);
                        extra.put_slice(nal);
                    }
                }
                NAL_AUD => {}
                _ => {
                    current.put_slice(&[0, 0, 0, 1]);
                    current.put_slice(nal);
                    if matches!(kind, NAL_SLICE | NAL_IDR) {
                        has_vcl = true;
                        keyframe |= kind == NAL_IDR;
                    }
                }
            }
        }
        if has_vcl {
            frames.push(Frame {
                data: current.freeze(),
                keyframe,
            });
        }

        anyhow::ensure!(have_sps && have_pps, "no SPS/PPS in H.264 stream");
        anyhow::ensure!(!frames.is_empty(), "no frames in H.264 stream");
        Ok(Self {
            kind: EncoderType::Video,
            extra: extra.freeze(),
            frames: Arc::new(frames),
            sample_rate: None,
        })
    }

    fn adts(data: &[u8]) -> anyhow::Result<Self> {
        let mut frames = Vec::new();
        let mut config = None;
        let mut pos = 0;

        while pos + 7 <= data.len() {
            let header = &data[pos..];
            anyhow::ensure!(
                header[0] == 0xff && header[1] & 0xf0 == 0xf0,
                "lost ADTS sync at offset {pos}"
            );
            let header_len = if header[1] & 0x01 == 0 { 9 } else { 7 };
            let frame_len = (((header[3] & 0x03) as usize) << 11)
                | ((header[4] as usize) << 3)
                | ((header[5] as usize) >> 5);
            anyhow::ensure!(
                frame_len > header_len && pos + frame_len <= data.len(),
                "truncated ADTS frame at offset {pos}"
            );

            if config.is_none() {
                config = Some(adts_audio_config(header)?);
            }
            frames.push(Frame {
                data: Bytes::copy_from_slice(&data[pos + header_len..pos + frame_len]),
                keyframe: true,
            });
            pos += frame_len;
        }

        let Some((extra, sample_rate)) = config else {
            anyhow::bail!("no frames in ADTS stream");
        };
        Ok(Self {
            kind: EncoderType::Audio,
            extra,
            frames: Arc::new(frames),
            sample_rate: Some(sample_rate),
        })
    }

    fn load(kind: EncoderType, path: &Path) -> anyhow::Result<Self> {
        let data = std::fs::read(path).with_context(|| format!("read {}", path.display()))?;
        let track = match kind {
            EncoderType::Video => Self::h264(&data),
            EncoderType::Audio => Self::adts(&data),
        };
        track.with_context(|| format!("parse {}", path.display()))
    }
}

/// Builds the two-byte AudioSpecificConfig from an ADTS header and returns
/// it with the sample rate.
fn adts_audio_config(header: &[u8]) -> anyhow::Result<(Bytes, u32)> {
    let profile = (header[2] >> 6) & 0x03;
    let sf_idx = (header[2] >> 2) & 0x0f;
    let channels = ((header[2] & 0x01) << 2) | (header[3] >> 6);
    let sample_rate = *ADTS_SAMPLE_RATES
        .get(sf_idx as usize)
        .with_context(|| format!("invalid ADTS sample rate index {sf_idx}"))?;

    let config: u16 =
        (((profile + 1) as u16) << 11) | ((sf_idx as u16) << 7) | ((channels as u16) << 3);
    Ok((Bytes::copy_from_slice(&config.to_be_bytes()), sample_rate))
}

pub struct ReplayBackend {
    track: Track,
    cancel: Option<CancellationToken>,
}

impl ReplayBackend {
    fn new(track: Track) -> Self {
        Self {
            track,
            cancel: None,
        }
    }
}

impl EncoderBackend for ReplayBackend {
    fn initialize(
        &mut self,
        ctx: &EncoderContext,
        publisher: PacketPublisher,
    ) -> anyhow::Result<()> {
        let handle = tokio::runtime::Handle::try_current()
            .context("replay encoders need a tokio runtime")?;

        let (timebase, step, interval) = match (self.track.kind, self.track.sample_rate) {
            (EncoderType::Audio, Some(rate)) => (
                (1, rate as i32),
                AAC_FRAME_SAMPLES,
                Duration::from_secs_f64(AAC_FRAME_SAMPLES as f64 / rate as f64),
            ),
            _ => {
                let video = ctx
                    .video
                    .as_ref()
                    .with_context(|| format!("{}: no video format set", ctx.name))?;
                anyhow::ensure!(video.fps_num > 0, "{}: invalid frame rate", ctx.name);
                (
                    (video.fps_den as i32, video.fps_num as i32),
                    1,
                    Duration::from_secs_f64(video.fps_den as f64 / video.fps_num as f64),
                )
            }
        };

        let cancel = CancellationToken::new();
        self.cancel = Some(cancel.clone());
        let track = self.track.clone();
        let name = ctx.name.clone();
        handle.spawn(async move {
            log::info!(
                "replay '{}' started, {} frames per loop",
                name,
                track.frames.len()
            );
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            let mut index: i64 = 0;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                let frame = &track.frames[index as usize % track.frames.len()];
                let ts = index * step;
                let packet = match track.kind {
                    EncoderType::Video => EncoderPacket::video(
                        frame.data.clone(),
                        ts,
                        ts,
                        timebase,
                        frame.keyframe,
                    ),
                    EncoderType::Audio => EncoderPacket::audio(frame.data.clone(), ts, timebase),
                };
                publisher.send(packet);
                index += 1;
            }
            log::debug!("replay '{}' stopped after {} frames", name, index);
        });
        Ok(())
    }

    fn update(&mut self, settings: &Settings) -> anyhow::Result<()> {
        log::debug!("replay encoder ignores live settings: {:?}", settings);
        Ok(())
    }

    fn extra_data(&self) -> Option<Bytes> {
        Some(self.track.extra.clone())
    }

    fn shutdown(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel.cancel();
        }
    }
}

/// Serves every encoder id from the configured replay files.
pub struct ReplayFactory {
    video: PathBuf,
    audio: PathBuf,
}

impl ReplayFactory {
    pub fn from_config(config: &ConfigMap) -> Self {
        Self {
            video: PathBuf::from(config.get_str("Replay", "Video")),
            audio: PathBuf::from(config.get_str("Replay", "Audio")),
        }
    }
}

impl EncoderFactory for ReplayFactory {
    fn create(
        &self,
        id: &str,
        name: &str,
        kind: EncoderType,
        _settings: &Settings,
    ) -> anyhow::Result<Box<dyn EncoderBackend>> {
        let path = match kind {
            EncoderType::Video => &self.video,
            EncoderType::Audio => &self.audio,
        };
        let track = Track::load(kind, path)?;
        log::debug!(
            "replay encoder '{}' ({}) loaded {} frames from {}",
            name,
            id,
            track.frames.len(),
            path.display()
        );
        Ok(Box::new(ReplayBackend::new(track)))
    }

    fn audio_bitrates(&self, _id: &str) -> Vec<u32> {
        Vec::new()
    }
}
