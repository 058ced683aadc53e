use std::collections::BTreeMap;

use serde_json::{Value, json};

/// Flat `Section.Key` configuration consumed by the output handlers.
///
/// Lookups fall back to the built-in defaults, so a config only needs to
/// carry the keys it changes.
#[derive(Clone, Debug, PartialEq)]
pub struct ConfigMap {
    values: BTreeMap<String, Value>,
    defaults: BTreeMap<String, Value>,
}

impl Default for ConfigMap {
    fn default() -> Self {
        Self::new()
    }
}

impl ConfigMap {
    pub fn new() -> Self {
        Self {
            values: BTreeMap::new(),
            defaults: default_values(),
        }
    }

    /// Accepts `{"Section": {"Key": v}}` as well as `{"Section.Key": v}`.
    pub fn from_json(value: &Value) -> anyhow::Result<Self> {
        let Value::Object(root) = value else {
            anyhow::bail!("config root must be an object");
        };
        let mut config = Self::new();
        for (section, entry) in root {
            match entry {
                Value::Object(keys) if !section.contains('.') => {
                    for (key, v) in keys {
                        config.values.insert(format!("{section}.{key}"), v.clone());
                    }
                }
                v => {
                    config.values.insert(section.clone(), v.clone());
                }
            }
        }
        Ok(config)
    }

    pub fn from_json_str(text: &str) -> anyhow::Result<Self> {
        let value: Value = serde_json::from_str(text)?;
        Self::from_json(&value)
    }

    pub fn set(&mut self, section: &str, key: &str, value: impl Into<Value>) -> &mut Self {
        self.values.insert(format!("{section}.{key}"), value.into());
        self
    }

    pub fn with(mut self, section: &str, key: &str, value: impl Into<Value>) -> Self {
        self.set(section, key, value);
        self
    }

    pub fn get(&self, section: &str, key: &str) -> Option<&Value> {
        let full = format!("{section}.{key}");
        self.values.get(&full).or_else(|| self.defaults.get(&full))
    }

    pub fn get_str(&self, section: &str, key: &str) -> String {
        match self.get(section, key) {
            Some(Value::String(s)) => s.clone(),
            Some(Value::Number(n)) => n.to_string(),
            Some(Value::Bool(b)) => b.to_string(),
            _ => String::new(),
        }
    }

    pub fn get_int(&self, section: &str, key: &str) -> i64 {
        match self.get(section, key) {
            Some(Value::Number(n)) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
            Some(Value::String(s)) => s.trim().parse().ok(),
            Some(Value::Bool(b)) => Some(*b as i64),
            _ => None,
        }
        .unwrap_or(0)
    }

    pub fn get_uint(&self, section: &str, key: &str) -> u32 {
        self.get_int(section, key).clamp(0, u32::MAX as i64) as u32
    }

    pub fn get_bool(&self, section: &str, key: &str) -> bool {
        match self.get(section, key) {
            Some(Value::Bool(b)) => *b,
            Some(Value::Number(n)) => n.as_i64().unwrap_or(0) != 0,
            Some(Value::String(s)) => matches!(s.as_str(), "true" | "1"),
            _ => false,
        }
    }
}

fn default_values() -> BTreeMap<String, Value> {
    let defaults = json!({
        "Output": {
            "Mode": "Simple",
            "Reconnect": true,
            "RetryDelay": 10,
            "MaxRetries": 20,
            "DelayEnable": false,
            "DelaySec": 20,
            "DelayPreserve": true,
            "BindIP": "default",
            "FilenameFormatting": "%CCYY-%MM-%DD %hh-%mm-%ss",
            "OverwriteIfExists": false,
        },
        "SimpleOutput": {
            "FilePath": ".",
            "RecFormat": "flv",
            "VBitrate": 2500,
            "ABitrate": 160,
            "UseAdvanced": false,
            "EnforceBitrate": true,
            "Preset": "veryfast",
            "QSVPreset": "balanced",
            "NVENCPreset": "hq",
            "x264Settings": "",
            "StreamEncoder": "x264",
            "RecQuality": "Stream",
            "RecEncoder": "x264",
            "MuxerCustom": "",
            "FileNameWithoutSpace": false,
        },
        "AdvOut": {
            "Encoder": "obs_x264",
            "RecEncoder": "none",
            "RecType": "Standard",
            "ApplyServiceSettings": true,
            "Rescale": false,
            "RescaleRes": "1280x720",
            "Multitrack": false,
            "TrackIndex": 1,
            "TrackCount": 1,
            "RecFilePath": ".",
            "RecFormat": "flv",
            "RecMuxerCustom": "",
            "RecRescale": false,
            "RecRescaleRes": "1280x720",
            "RecTracks": 1,
            "RecFileNameWithoutSpace": false,
            "Track1Bitrate": 160,
            "Track2Bitrate": 160,
            "Track3Bitrate": 160,
            "Track4Bitrate": 160,
            "Track1Name": "",
            "Track2Name": "",
            "Track3Name": "",
            "Track4Name": "",
        },
        "Video": {
            "OutputCX": 1280,
            "OutputCY": 720,
            "FPSNum": 30,
            "FPSDen": 1,
            "ColorFormat": "NV12",
        },
        "Audio": {
            "SampleRate": 44100,
            "Channels": 2,
        },
    });

    let mut flat = BTreeMap::new();
    if let Value::Object(sections) = defaults {
        for (section, keys) in sections {
            if let Value::Object(keys) = keys {
                for (key, value) in keys {
                    flat.insert(format!("{section}.{key}"), value);
                }
            }
        }
    }
    flat
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_and_overrides() {
        let config = ConfigMap::from_json_str(
            r#"{
                "Output": { "Reconnect": false, "MaxRetries": "5" },
                "SimpleOutput.VBitrate": 6000
            }"#,
        )
        .unwrap();

        assert!(!config.get_bool("Output", "Reconnect"));
        assert_eq!(config.get_int("Output", "MaxRetries"), 5);
        assert_eq!(config.get_uint("SimpleOutput", "VBitrate"), 6000);
        // untouched keys keep their defaults
        assert_eq!(config.get_int("Output", "RetryDelay"), 10);
        assert_eq!(config.get_str("AdvOut", "RecEncoder"), "none");
        assert_eq!(config.get_str("Missing", "Key"), "");
    }

    #[test]
    fn test_rejects_non_object_root() {
        assert!(ConfigMap::from_json_str("[1, 2]").is_err());
    }
}
