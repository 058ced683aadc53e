use std::fmt;

use log::Level;
use parking_lot::Mutex;

#[derive(Clone, Debug)]
pub struct LogConfig {
    /// Collapse identical consecutive messages into a repeat count.
    pub suppress_repeats: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            suppress_repeats: true,
        }
    }
}

struct LastMessage {
    level: Level,
    text: String,
    repeats: u32,
}

/// Per-output logger. Prefixes every line with the output's identity and
/// keeps its own repeat-suppression state.
pub struct OutputLogger {
    prefix: String,
    config: LogConfig,
    last: Mutex<Option<LastMessage>>,
}

impl OutputLogger {
    pub fn new(kind: &str, name: &str, config: LogConfig) -> Self {
        Self {
            prefix: format!("[{kind}: '{name}']"),
            config,
            last: Mutex::new(None),
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn error(&self, args: fmt::Arguments<'_>) {
        self.log(Level::Error, args);
    }

    pub fn warn(&self, args: fmt::Arguments<'_>) {
        self.log(Level::Warn, args);
    }

    pub fn info(&self, args: fmt::Arguments<'_>) {
        self.log(Level::Info, args);
    }

    pub fn debug(&self, args: fmt::Arguments<'_>) {
        self.log(Level::Debug, args);
    }

    fn log(&self, level: Level, args: fmt::Arguments<'_>) {
        if !log::log_enabled!(level) {
            return;
        }
        let text = args.to_string();
        if self.config.suppress_repeats && !self.record(level, &text) {
            return;
        }
        log::log!(level, "{} {}", self.prefix, text);
    }

    /// Returns false when the message repeats the previous one.
    fn record(&self, level: Level, text: &str) -> bool {
        let mut last = self.last.lock();
        if let Some(prev) = last.as_mut() {
            if prev.level == level && prev.text == text {
                prev.repeats += 1;
                return false;
            }
            if prev.repeats > 0 {
                log::log!(
                    prev.level,
                    "{} last message repeated {} times",
                    self.prefix,
                    prev.repeats
                );
            }
        }
        *last = Some(LastMessage {
            level,
            text: text.to_string(),
            repeats: 0,
        });
        true
    }

    #[cfg(test)]
    fn pending_repeats(&self) -> u32 {
        self.last.lock().as_ref().map(|m| m.repeats).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_repeats_are_counted() {
        let logger = OutputLogger::new("flv_output", "rec", LogConfig::default());
        assert_eq!(logger.prefix(), "[flv_output: 'rec']");

        assert!(logger.record(Level::Warn, "write failed"));
        assert!(!logger.record(Level::Warn, "write failed"));
        assert!(!logger.record(Level::Warn, "write failed"));
        assert_eq!(logger.pending_repeats(), 2);

        assert!(logger.record(Level::Warn, "reconnecting"));
        assert_eq!(logger.pending_repeats(), 0);
        // same text at another level is not a repeat
        assert!(logger.record(Level::Info, "reconnecting"));
    }

    #[test]
    fn test_instances_do_not_share_state() {
        let a = OutputLogger::new("flv_output", "a", LogConfig::default());
        let b = OutputLogger::new("flv_output", "b", LogConfig::default());
        assert!(a.record(Level::Info, "started"));
        assert!(b.record(Level::Info, "started"));
    }
}
