//! Recording quality presets of the simple output mode.

use crate::settings::{Property, Settings, find_property};

const CROSS_DIST_CUTOFF: f64 = 2000.0;

/// Lowers the CRF for small output resolutions, and by 2 more for the
/// low-CPU x264 preset.
pub fn calc_crf(crf: i32, cx: u32, cy: u32, low_cpu: bool) -> i32 {
    let crf = if low_cpu { crf - 2 } else { crf };
    let (fcx, fcy) = (cx as f64, cy as f64);
    let cross_dist = (fcx * fcx + fcy * fcy).sqrt();
    let reduction = (1.0 - cross_dist.min(CROSS_DIST_CUTOFF) / CROSS_DIST_CUTOFF) * 10.0;
    crf - reduction as i32
}

pub fn x264_crf_settings(crf: i32, low_cpu: bool) -> Settings {
    Settings::new()
        .with("crf", crf)
        .with("use_bufsize", true)
        .with("rate_control", "CRF")
        .with("profile", "high")
        .with("preset", if low_cpu { "ultrafast" } else { "veryfast" })
}

/// ICQ when the encoder offers it, constant QP otherwise.
pub fn qsv_settings(crf: i32, icq: bool) -> Settings {
    let settings = Settings::new().with("profile", "high");
    if icq {
        settings.with("rate_control", "ICQ").with("icq_quality", crf)
    } else {
        settings
            .with("rate_control", "CQP")
            .with("qpi", crf)
            .with("qpp", crf)
            .with("qpb", crf)
    }
}

pub fn nvenc_settings(cqp: i32) -> Settings {
    Settings::new()
        .with("rate_control", "CQP")
        .with("profile", "high")
        .with("preset", "hq")
        .with("cqp", cqp)
}

pub fn recording_audio_settings() -> Settings {
    Settings::new().with("bitrate", 192).with("rate_control", "CBR")
}

pub fn icq_available(properties: &[Property]) -> bool {
    find_property(properties, "rate_control").is_some_and(|p| p.list_contains("ICQ"))
}
