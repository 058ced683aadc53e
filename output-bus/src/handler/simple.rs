use std::sync::Arc;

use async_trait::async_trait;

use crate::{
    config::ConfigMap,
    encoder::{Encoder, EncoderFactory, VideoFormat},
    error::HandlerError,
    event::SessionKind,
    handler::{BasicOutputHandler, OutputHandler, quality},
    output::{FlvFileOutput, FlvStreamOutput, Output},
    service::Service,
    settings::Settings,
    transport::Connector,
};

const SECTION: &str = "SimpleOutput";

/// Hardware/software encoder choices of the simple mode.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SimpleEncoder {
    X264,
    X264LowCpu,
    Qsv,
    Nvenc,
}

impl SimpleEncoder {
    pub fn parse(name: &str) -> Self {
        match name {
            "x264_lowcpu" => SimpleEncoder::X264LowCpu,
            "qsv" => SimpleEncoder::Qsv,
            "nvenc" => SimpleEncoder::Nvenc,
            _ => SimpleEncoder::X264,
        }
    }

    pub fn encoder_id(self) -> &'static str {
        match self {
            SimpleEncoder::X264 | SimpleEncoder::X264LowCpu => "obs_x264",
            SimpleEncoder::Qsv => "obs_qsv11",
            SimpleEncoder::Nvenc => "ffmpeg_nvenc",
        }
    }

    pub fn low_cpu(self) -> bool {
        self == SimpleEncoder::X264LowCpu
    }

    fn preset_key(self) -> &'static str {
        match self {
            SimpleEncoder::Qsv => "QSVPreset",
            SimpleEncoder::Nvenc => "NVENCPreset",
            _ => "Preset",
        }
    }
}

enum RecordingPreset {
    /// Recording shares the streaming encoders.
    Stream,
    Dedicated {
        h264: Encoder,
        aac: Encoder,
        encoder: SimpleEncoder,
        ultra_hq: bool,
    },
}

/// Simple mode: one bitrate for streaming and a quality preset for
/// recording.
pub struct SimpleOutput {
    base: BasicOutputHandler,
    stream_encoder: SimpleEncoder,
    h264_streaming: Encoder,
    aac_streaming: Encoder,
    recording: RecordingPreset,
}

impl SimpleOutput {
    pub fn new(
        config: ConfigMap,
        factory: Arc<dyn EncoderFactory>,
        connector: Arc<dyn Connector>,
    ) -> Result<Self, HandlerError> {
        let quality = config.get_str(SECTION, "RecQuality");
        if quality == "Lossless" {
            return Err(HandlerError::config(
                "lossless recording needs an FFmpeg muxer, which is not available",
            ));
        }

        let base = BasicOutputHandler::new(
            config,
            factory,
            Output::new("simple_stream", FlvStreamOutput::new(connector)),
            Output::new("simple_file_output", FlvFileOutput::new()),
        );

        let stream_encoder = SimpleEncoder::parse(&base.config.get_str(SECTION, "StreamEncoder"));
        let h264_streaming = base.create_video_encoder(
            stream_encoder.encoder_id(),
            "simple_h264_stream",
            Settings::new(),
        )?;
        let aac_streaming =
            base.create_aac_encoder(base.config.get_uint(SECTION, "ABitrate"), "simple_aac", 0)?;

        let recording = if quality == "Stream" {
            RecordingPreset::Stream
        } else {
            let encoder = SimpleEncoder::parse(&base.config.get_str(SECTION, "RecEncoder"));
            let h264 = base.create_video_encoder(
                encoder.encoder_id(),
                "simple_h264_recording",
                Settings::new(),
            )?;
            let aac = base.create_aac_encoder(192, "simple_aac_recording", 0)?;
            aac.update(quality::recording_audio_settings())?;
            RecordingPreset::Dedicated {
                h264,
                aac,
                encoder,
                ultra_hq: quality == "HQ",
            }
        };

        log::info!(
            "simple output ready: stream encoder {}, recording quality '{}'",
            stream_encoder.encoder_id(),
            quality
        );
        Ok(Self {
            base,
            stream_encoder,
            h264_streaming,
            aac_streaming,
            recording,
        })
    }

    pub fn streaming_encoders(&self) -> (&Encoder, &Encoder) {
        (&self.h264_streaming, &self.aac_streaming)
    }

    /// The streaming encoders unless a quality preset gave recording its
    /// own.
    pub fn recording_encoders(&self) -> (&Encoder, &Encoder) {
        match &self.recording {
            RecordingPreset::Stream => (&self.h264_streaming, &self.aac_streaming),
            RecordingPreset::Dedicated { h264, aac, .. } => (h264, aac),
        }
    }

    fn update_stream_encoders(&self) -> Result<(), HandlerError> {
        let config = &self.base.config;
        let video_bitrate = config.get_uint(SECTION, "VBitrate");
        let audio_bitrate = self.base.aac.closest(config.get_uint(SECTION, "ABitrate"));
        let advanced = config.get_bool(SECTION, "UseAdvanced");
        let enforce_bitrate = config.get_bool(SECTION, "EnforceBitrate");

        let mut h264 = Settings::new()
            .with("rate_control", "CBR")
            .with("bitrate", video_bitrate);
        if advanced {
            h264.set(
                "preset",
                config.get_str(SECTION, self.stream_encoder.preset_key()),
            );
            h264.set("x264opts", config.get_str(SECTION, "x264Settings"));
        }
        let mut aac = Settings::new()
            .with("rate_control", "CBR")
            .with("bitrate", audio_bitrate);

        if let Some(service) = self.base.service() {
            service.apply_encoder_settings(Some(&mut h264), Some(&mut aac));
        }
        if advanced && !enforce_bitrate {
            h264.set("bitrate", video_bitrate);
            aac.set("bitrate", audio_bitrate);
        }

        if self.base.media.needs_nv12_conversion() {
            self.h264_streaming
                .set_preferred_video_format(VideoFormat::Nv12);
        }
        self.h264_streaming.update(h264)?;
        self.aac_streaming.update(aac)?;
        Ok(())
    }

    fn update_recording_settings(&self) -> Result<(), HandlerError> {
        let RecordingPreset::Dedicated {
            h264,
            encoder,
            ultra_hq,
            ..
        } = &self.recording
        else {
            return Ok(());
        };
        let video = &self.base.media.video;
        let crf = quality::calc_crf(
            if *ultra_hq { 16 } else { 23 },
            video.width,
            video.height,
            encoder.low_cpu(),
        );
        let settings = match encoder {
            SimpleEncoder::X264 | SimpleEncoder::X264LowCpu => {
                quality::x264_crf_settings(crf, encoder.low_cpu())
            }
            SimpleEncoder::Qsv => {
                quality::qsv_settings(crf, quality::icq_available(&h264.properties()))
            }
            SimpleEncoder::Nvenc => quality::nvenc_settings(crf),
        };
        log::debug!("recording encoder {} at quality {}", encoder.encoder_id(), crf);
        h264.update(settings)?;
        Ok(())
    }

    /// Reconfigures the encoders and feeds them the raw media. Only called
    /// while neither session runs.
    fn setup_outputs(&self) -> Result<(), HandlerError> {
        self.update_stream_encoders()?;
        let media = &self.base.media;
        self.h264_streaming.set_video(media.video.clone());
        self.aac_streaming.set_audio(media.audio.clone());
        if let RecordingPreset::Dedicated { h264, aac, .. } = &self.recording {
            h264.set_video(media.video.clone());
            aac.set_audio(media.audio.clone());
        }
        Ok(())
    }
}

#[async_trait]
impl OutputHandler for SimpleOutput {
    fn base(&self) -> &BasicOutputHandler {
        &self.base
    }

    async fn start_streaming(&self, service: &Service) -> Result<(), HandlerError> {
        let _op = self.base.op.lock().await;
        if self.streaming_active() {
            return Ok(());
        }
        self.base.set_service(service);
        if !self.active() {
            self.setup_outputs()?;
        }

        let output = &self.base.stream_output;
        let attach = || {
            output.set_video_encoder(Some(self.h264_streaming.clone()))?;
            output.set_audio_encoder(Some(self.aac_streaming.clone()), 0)
        };
        attach().map_err(|e| HandlerError::output(SessionKind::Streaming, e))?;
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
                (SECTION, "FilePath"),
                (SECTION, "RecFormat"),
                (SECTION, "FileNameWithoutSpace"),
            )
            .await?;

        match self.recording {
            RecordingPreset::Dedicated { .. } => self.update_recording_settings()?,
            // shared encoders keep their settings while the stream runs
            RecordingPreset::Stream if !self.streaming_active() => self.update_stream_encoders()?,
            RecordingPreset::Stream => {}
        }
        if !self.active() {
            self.setup_outputs()?;
        }

        let (h264, aac) = self.recording_encoders();
        let output = &self.base.file_output;
        let attach = || {
            output.set_video_encoder(Some(h264.clone()))?;
            output.set_audio_encoder(Some(aac.clone()), 0)
        };
        attach().map_err(|e| HandlerError::output(SessionKind::Recording, e))?;
        output.update(
            Settings::new()
                .with("path", path.to_string_lossy().to_string())
                .with("muxer_settings", self.base.config.get_str(SECTION, "MuxerCustom")),
        );
        self.base.start_output(SessionKind::Recording).await
    }

    fn update(&self) -> Result<(), HandlerError> {
        if self.h264_streaming.active() || self.aac_streaming.active() {
            return Err(HandlerError::EncodersBusy);
        }
        self.update_stream_encoders()
    }
}

#[cfg(test)]
#[path = "simple_test.rs"]
mod simple_test;
