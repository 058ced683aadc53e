use std::collections::BTreeMap;

use crate::encoder::EncoderFactory;

/// AAC encoder ids in order of preference.
const AAC_ENCODERS: [&str; 4] = ["CoreAudio_AAC", "libfdk_aac", "mf_aac", "ffmpeg_aac"];

const FALLBACK_ENCODER: &str = "ffmpeg_aac";
const FALLBACK_BITRATES: [u32; 13] = [32, 48, 64, 80, 96, 112, 128, 160, 192, 224, 256, 288, 320];

/// Supported AAC bitrates and the preferred encoder for each one.
#[derive(Clone, Debug, PartialEq)]
pub struct AacBitrateMap {
    map: BTreeMap<u32, &'static str>,
}

impl AacBitrateMap {
    /// Asks the factory which bitrates each AAC encoder supports. The first
    /// encoder listing a bitrate wins it.
    pub fn probe(factory: &dyn EncoderFactory) -> Self {
        let mut map = BTreeMap::new();
        for id in AAC_ENCODERS {
            for bitrate in factory.audio_bitrates(id) {
                map.entry(bitrate).or_insert(id);
            }
        }
        if map.is_empty() {
            log::debug!("no AAC encoder reported bitrates, assuming {}", FALLBACK_ENCODER);
            map = FALLBACK_BITRATES
                .iter()
                .map(|b| (*b, FALLBACK_ENCODER))
                .collect();
        }
        Self { map }
    }

    pub fn bitrates(&self) -> impl Iterator<Item = u32> + '_ {
        self.map.keys().copied()
    }

    /// Nearest supported bitrate; a tie goes to the higher one.
    pub fn closest(&self, bitrate: u32) -> u32 {
        let mut best: Option<(u32, u32)> = None;
        for candidate in self.map.keys().copied() {
            let distance = candidate.abs_diff(bitrate);
            match best {
                Some((_, d)) if distance > d => {}
                _ => best = Some((candidate, distance)),
            }
        }
        best.map(|(b, _)| b).unwrap_or(bitrate)
    }

    pub fn encoder_for_bitrate(&self, bitrate: u32) -> Option<&'static str> {
        self.map.get(&bitrate).copied()
    }
}
