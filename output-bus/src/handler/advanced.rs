use std::sync::Arc;

use async_trait::async_trait;

use crate::{
    config::ConfigMap,
    encoder::{Encoder, EncoderFactory, VideoFormat},
    error::{HandlerError, OutputError},
    event::SessionKind,
    handler::{BasicOutputHandler, OutputHandler, parse_resolution},
    output::{FlvFileOutput, FlvStreamOutput, MAX_AUDIO_MIXES, Output},
    service::Service,
    settings::Settings,
    transport::Connector,
};

const SECTION: &str = "AdvOut";

/// Advanced mode: explicit encoders, per-track audio and optional
/// rescaling for each session.
pub struct AdvancedOutput {
    base: BasicOutputHandler,
    h264_streaming: Encoder,
    /// `None` when recordings reuse the streaming encoder.
    h264_recording: Option<Encoder>,
    aac_tracks: Vec<Encoder>,
}

impl AdvancedOutput {
    pub fn new(
        config: ConfigMap,
        factory: Arc<dyn EncoderFactory>,
        connector: Arc<dyn Connector>,
    ) -> Result<Self, HandlerError> {
        if config.get_str(SECTION, "RecType") == "FFmpeg" {
            return Err(HandlerError::config(
                "custom FFmpeg recording output is not available",
            ));
        }

        let base = BasicOutputHandler::new(
            config,
            factory,
            Output::new("adv_stream", FlvStreamOutput::new(connector)),
            Output::new("adv_file_output", FlvFileOutput::new()),
        );
        let config = &base.config;

        let h264_streaming = base.create_video_encoder(
            &config.get_str(SECTION, "Encoder"),
            "streaming_h264",
            encoder_settings(config, "StreamEncoderSettings"),
        )?;

        let rec_encoder = config.get_str(SECTION, "RecEncoder");
        let h264_recording = if rec_encoder.eq_ignore_ascii_case("none") {
            None
        } else {
            Some(base.create_video_encoder(
                &rec_encoder,
                "recording_h264",
                encoder_settings(config, "RecordEncoderSettings"),
            )?)
        };

        let mut aac_tracks = Vec::with_capacity(MAX_AUDIO_MIXES);
        for i in 0..MAX_AUDIO_MIXES {
            let bitrate = config.get_uint(SECTION, &format!("Track{}Bitrate", i + 1));
            aac_tracks.push(base.create_aac_encoder(bitrate, &format!("adv_aac{i}"), i)?);
        }

        log::info!(
            "advanced output ready: stream encoder {}, recording encoder {}",
            h264_streaming.id(),
            h264_recording.as_ref().map_or("(stream)", |e| e.id())
        );
        Ok(Self {
            base,
            h264_streaming,
            h264_recording,
            aac_tracks,
        })
    }

    pub fn use_stream_encoder(&self) -> bool {
        self.h264_recording.is_none()
    }

    pub fn streaming_encoder(&self) -> &Encoder {
        &self.h264_streaming
    }

    pub fn recording_encoder(&self) -> &Encoder {
        self.h264_recording.as_ref().unwrap_or(&self.h264_streaming)
    }

    pub fn audio_tracks(&self) -> &[Encoder] {
        &self.aac_tracks
    }

    fn update_stream_settings(&self) -> Result<(), HandlerError> {
        let mut settings = encoder_settings(&self.base.config, "StreamEncoderSettings");
        if self.base.config.get_bool(SECTION, "ApplyServiceSettings") {
            if let Some(service) = self.base.service() {
                service.apply_encoder_settings(Some(&mut settings), None);
            }
        }
        if self.base.media.needs_nv12_conversion() {
            self.h264_streaming
                .set_preferred_video_format(VideoFormat::Nv12);
        }
        self.h264_streaming.update(settings)?;
        Ok(())
    }

    fn update_recording_settings(&self) -> Result<(), HandlerError> {
        if let Some(h264) = &self.h264_recording {
            h264.update(encoder_settings(&self.base.config, "RecordEncoderSettings"))?;
        }
        Ok(())
    }

    fn update_audio_settings(&self) -> Result<(), HandlerError> {
        let config = &self.base.config;
        let apply_service = config.get_bool(SECTION, "ApplyServiceSettings");
        let stream_track = config.get_uint(SECTION, "TrackIndex") as usize;
        let service = self.base.service();

        for (i, aac) in self.aac_tracks.iter().enumerate() {
            let track = i + 1;
            let name = config.get_str(SECTION, &format!("Track{track}Name"));
            if name.is_empty() {
                aac.set_name(&format!("Track{track}"));
            } else {
                aac.set_name(&name);
            }

            let bitrate = self
                .base
                .aac
                .closest(config.get_uint(SECTION, &format!("Track{track}Bitrate")));
            let mut settings = Settings::new()
                .with("rate_control", "CBR")
                .with("bitrate", bitrate);
            if apply_service && track == stream_track {
                if let Some(service) = &service {
                    service.apply_encoder_settings(None, Some(&mut settings));
                }
            }

            // a running session keeps its track settings
            if aac.active() {
                continue;
            }
            aac.update(settings)?;
        }
        Ok(())
    }

    fn setup_streaming(&self) -> Result<(), OutputError> {
        let config = &self.base.config;
        let rescale = config
            .get_bool(SECTION, "Rescale")
            .then(|| parse_resolution(&config.get_str(SECTION, "RescaleRes")))
            .flatten();
        match rescale {
            Some((cx, cy)) => self.h264_streaming.set_scaled_size(cx, cy),
            None => self.h264_streaming.clear_scaled_size(),
        }

        let output = &self.base.stream_output;
        output.set_video_encoder(Some(self.h264_streaming.clone()))?;
        if config.get_bool(SECTION, "Multitrack") {
            let count = config.get_uint(SECTION, "TrackCount") as usize;
            for (slot, aac) in self.aac_tracks.iter().enumerate() {
                output.set_audio_encoder((slot < count).then(|| aac.clone()), slot)?;
            }
        } else {
            let track = (config.get_uint(SECTION, "TrackIndex") as usize).clamp(1, MAX_AUDIO_MIXES);
            output.set_audio_encoder(Some(self.aac_tracks[track - 1].clone()), 0)?;
            for slot in 1..MAX_AUDIO_MIXES {
                output.set_audio_encoder(None, slot)?;
            }
        }
        Ok(())
    }

    fn setup_recording(&self) -> Result<(), OutputError> {
        let config = &self.base.config;
        let output = &self.base.file_output;

        match &self.h264_recording {
            None => output.set_video_encoder(Some(self.h264_streaming.clone()))?,
            Some(h264) => {
                let rescale = config
                    .get_bool(SECTION, "RecRescale")
                    .then(|| parse_resolution(&config.get_str(SECTION, "RecRescaleRes")))
                    .flatten();
                match rescale {
                    Some((cx, cy)) => h264.set_scaled_size(cx, cy),
                    None => h264.clear_scaled_size(),
                }
                output.set_video_encoder(Some(h264.clone()))?;
            }
        }

        let tracks = config.get_uint(SECTION, "RecTracks");
        let mut slot = 0;
        for (i, aac) in self.aac_tracks.iter().enumerate() {
            if tracks & (1 << i) != 0 {
                output.set_audio_encoder(Some(aac.clone()), slot)?;
                slot += 1;
            }
        }
        for unused in slot..MAX_AUDIO_MIXES {
            output.set_audio_encoder(None, unused)?;
        }
        Ok(())
    }

    /// Feeds the encoders and attaches them to both outputs. Only called
    /// while neither session runs.
    fn setup_outputs(&self) -> Result<(), HandlerError> {
        let media = &self.base.media;
        self.h264_streaming.set_video(media.video.clone());
        if let Some(h264) = &self.h264_recording {
            h264.set_video(media.video.clone());
        }
        for aac in &self.aac_tracks {
            aac.set_audio(media.audio.clone());
        }
        self.setup_streaming()
            .map_err(|e| HandlerError::output(SessionKind::Streaming, e))?;
        self.setup_recording()
            .map_err(|e| HandlerError::output(SessionKind::Recording, e))
    }
}

/// Encoder settings stored as a JSON object under `AdvOut.<key>`.
fn encoder_settings(config: &ConfigMap, key: &str) -> Settings {
    config
        .get(SECTION, key)
        .map(Settings::from_value)
        .unwrap_or_default()
}

#[async_trait]
impl OutputHandler for AdvancedOutput {
    fn base(&self) -> &BasicOutputHandler {
        &self.base
    }

    async fn start_streaming(&self, service: &Service) -> Result<(), HandlerError> {
        let _op = self.base.op.lock().await;
        if self.streaming_active() {
            return Ok(());
        }
        self.base.set_service(service);

        // the recording may be running on the same encoder
        if !self.use_stream_encoder() || !self.recording_active() {
            self.update_stream_settings()?;
        }
        self.update_audio_settings()?;
        if !self.active() {
            self.setup_outputs()?;
        }

        self.base.configure_stream_output(service);
        self.base.start_output(SessionKind::Streaming).await
    }

    async fn start_recording(&self) -> Result<(), HandlerError> {
        let _op = self.base.op.lock().await;
        if self.recording_active() {
            return Ok(());
        }
        let path = self
            .base
            .recording_path(
                (SECTION, "RecFilePath"),
                (SECTION, "RecFormat"),
                (SECTION, "RecFileNameWithoutSpace"),
            )
            .await?;

        if !self.use_stream_encoder() {
            self.update_recording_settings()?;
        } else if !self.streaming_active() {
            self.update_stream_settings()?;
        }
        self.update_audio_settings()?;
        if !self.active() {
            self.setup_outputs()?;
        }

        self.base.file_output.update(
            Settings::new()
                .with("path", path.to_string_lossy().to_string())
                .with("muxer_settings", self.base.config.get_str(SECTION, "RecMuxerCustom")),
        );
        self.base.start_output(SessionKind::Recording).await
    }

    fn update(&self) -> Result<(), HandlerError> {
        if self.h264_streaming.active() {
            return Err(HandlerError::EncodersBusy);
        }
        self.update_stream_settings()?;
        self.update_audio_settings()
    }
}

#[cfg(test)]
#[path = "advanced_test.rs"]
mod advanced_test;
