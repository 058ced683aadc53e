use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// String-keyed settings handed to encoders, outputs and services.
///
/// Values are kept as JSON so that opaque encoder options (x264 presets,
/// NVENC/QSV knobs) pass through without this crate knowing their meaning.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Settings(BTreeMap<String, Value>);

impl Settings {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_value(value: &Value) -> Self {
        match value {
            Value::Object(map) => Self(map.iter().map(|(k, v)| (k.clone(), v.clone())).collect()),
            _ => Self::default(),
        }
    }

    pub fn set(&mut self, key: &str, value: impl Into<Value>) -> &mut Self {
        self.0.insert(key.to_string(), value.into());
        self
    }

    pub fn with(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.set(key, value);
        self
    }

    pub fn remove(&mut self, key: &str) -> Option<Value> {
        self.0.remove(key)
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.0.get(key).and_then(Value::as_str)
    }

    pub fn get_string(&self, key: &str) -> String {
        self.get_str(key).unwrap_or_default().to_string()
    }

    pub fn get_int(&self, key: &str) -> Option<i64> {
        match self.0.get(key)? {
            Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    pub fn get_bool(&self, key: &str) -> Option<bool> {
        match self.0.get(key)? {
            Value::Bool(b) => Some(*b),
            Value::Number(n) => n.as_i64().map(|v| v != 0),
            Value::String(s) => match s.as_str() {
                "true" | "1" => Some(true),
                "false" | "0" => Some(false),
                _ => None,
            },
            _ => None,
        }
    }

    /// Copies every entry of `other` over this map.
    pub fn merge(&mut self, other: &Settings) {
        for (k, v) in &other.0 {
            self.0.insert(k.clone(), v.clone());
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.0.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum PropertyKind {
    Text,
    Int { min: i64, max: i64 },
    Bool,
    List(Vec<String>),
}

/// Describes one setting understood by an output or encoder.
#[derive(Clone, Debug, PartialEq)]
pub struct Property {
    pub name: String,
    pub description: String,
    pub kind: PropertyKind,
}

impl Property {
    pub fn new(name: &str, description: &str, kind: PropertyKind) -> Self {
        Self {
            name: name.to_string(),
            description: description.to_string(),
            kind,
        }
    }

    pub fn list_contains(&self, item: &str) -> bool {
        match &self.kind {
            PropertyKind::List(items) => items.iter().any(|i| i == item),
            _ => false,
        }
    }
}

pub fn find_property<'a>(props: &'a [Property], name: &str) -> Option<&'a Property> {
    props.iter().find(|p| p.name == name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_typed_getters() {
        let settings = Settings::new()
            .with("bitrate", 2500)
            .with("use_bufsize", true)
            .with("preset", "veryfast")
            .with("keyint", "2");

        assert_eq!(settings.get_int("bitrate"), Some(2500));
        assert_eq!(settings.get_int("keyint"), Some(2));
        assert_eq!(settings.get_bool("use_bufsize"), Some(true));
        assert_eq!(settings.get_string("preset"), "veryfast");
        assert_eq!(settings.get_string("missing"), "");
        assert_eq!(settings.get_int("preset"), None);
    }

    #[test]
    fn test_merge_overrides() {
        let mut base = Settings::new().with("bitrate", 2500).with("profile", "main");
        base.merge(&Settings::new().with("bitrate", 6000));
        assert_eq!(base.get_int("bitrate"), Some(6000));
        assert_eq!(base.get_string("profile"), "main");
    }
}
