use std::path::{Path, PathBuf};

use anyhow::Context;
use output_bus::config::ConfigMap;

pub const CONFIG_ENV: &str = "LITE_CASTER_CONFIG";
const DEFAULT_API_LISTEN: &str = "0.0.0.0:8080";

/// First command line argument, else `LITE_CASTER_CONFIG`.
pub fn config_path() -> Option<PathBuf> {
    std::env::args_os()
        .nth(1)
        .or_else(|| std::env::var_os(CONFIG_ENV))
        .map(PathBuf::from)
}

/// Reads a JSON config file; without one every key keeps its default.
pub fn load(path: Option<&Path>) -> anyhow::Result<ConfigMap> {
    let Some(path) = path else {
        log::info!("no config file given, using defaults");
        return Ok(ConfigMap::new());
    };
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("read config {}", path.display()))?;
    let config = ConfigMap::from_json_str(&text)
        .with_context(|| format!("parse config {}", path.display()))?;
    log::info!("loaded config from {}", path.display());
    Ok(config)
}

pub fn api_listen(config: &ConfigMap) -> String {
    let listen = config.get_str("Api", "Listen");
    if listen.is_empty() {
        DEFAULT_API_LISTEN.to_string()
    } else {
        listen
    }
}
