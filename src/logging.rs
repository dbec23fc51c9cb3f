//! Structured logging for chatlink.
//!
//! Logs go to stderr so they never interleave with streamed replies on
//! stdout.
//!
//! ## Environment Variables
//!
//! - `CHATLINK_LOG` or `RUST_LOG`: filter directive (e.g. `chatlink=debug,warn`)
//! - `CHATLINK_LOG_FORMAT`: `pretty`, `compact` or `json`
//!
//! ```bash
//! # Trace reconnects and queue activity
//! CHATLINK_LOG=chatlink::manager=debug,chatlink::queue=debug chatlink -C 42
//! ```

use tracing_subscriber::{
    EnvFilter,
    fmt::{self, format::FmtSpan},
    prelude::*,
};

pub const DEFAULT_FILTER: &str = "chatlink=info,warn";

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    /// Single-line output
    #[default]
    Compact,
    /// Multi-line, indented
    Pretty,
    /// One JSON object per event
    Json,
}

impl LogFormat {
    /// Case-insensitive; anything unknown falls back to compact.
    pub fn parse(s: &str) -> Self {
        match s.trim().to_ascii_lowercase().as_str() {
            "json" => Self::Json,
            "pretty" => Self::Pretty,
            _ => Self::Compact,
        }
    }
}

#[derive(Debug, Clone)]
pub struct LogConfig {
    pub filter: String,
    pub format: LogFormat,
    /// Emit span open/close events
    pub with_spans: bool,
    /// Include file and line
    pub with_file: bool,
    pub with_target: bool,
    pub ansi: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            filter: DEFAULT_FILTER.to_string(),
            format: LogFormat::Compact,
            with_spans: false,
            with_file: false,
            with_target: true,
            ansi: true,
        }
    }
}

impl LogConfig {
    pub fn from_env() -> Self {
        Self::from_vars(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary variable lookup.
    pub fn from_vars(var: impl Fn(&str) -> Option<String>) -> Self {
        let filter = var("CHATLINK_LOG")
            .or_else(|| var("RUST_LOG"))
            .filter(|f| !f.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_FILTER.to_string());
        let format = var("CHATLINK_LOG_FORMAT")
            .map(|s| LogFormat::parse(&s))
            .unwrap_or_default();
        Self {
            filter,
            format,
            ..Default::default()
        }
    }

    /// `-v` on the command line.
    pub fn verbose(mut self) -> Self {
        self.filter = "chatlink=debug,info".to_string();
        self.with_file = true;
        self
    }
}

/// Install the global subscriber. Later calls are ignored.
pub fn init(config: LogConfig) {
    let env_filter =
        EnvFilter::try_new(&config.filter).unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

    let span_events = if config.with_spans {
        FmtSpan::NEW | FmtSpan::CLOSE
    } else {
        FmtSpan::NONE
    };

    let layer = fmt::layer()
        .with_writer(std::io::stderr)
        .with_span_events(span_events)
        .with_file(config.with_file)
        .with_line_number(config.with_file)
        .with_target(config.with_target);

    // Already installed (tests, embedding applications) is fine.
    let _ = match config.format {
        LogFormat::Json => tracing_subscriber::registry()
            .with(env_filter)
            .with(layer.json())
            .try_init(),
        LogFormat::Pretty => tracing_subscriber::registry()
            .with(env_filter)
            .with(layer.pretty().with_ansi(config.ansi))
            .try_init(),
        LogFormat::Compact => tracing_subscriber::registry()
            .with(env_filter)
            .with(layer.compact().with_ansi(config.ansi))
            .try_init(),
    };
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn vars(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_format_parsing() {
        assert_eq!(LogFormat::parse("JSON"), LogFormat::Json);
        assert_eq!(LogFormat::parse(" pretty "), LogFormat::Pretty);
        assert_eq!(LogFormat::parse("compact"), LogFormat::Compact);
        assert_eq!(LogFormat::parse("fancy"), LogFormat::Compact);
    }

    #[test]
    fn test_chatlink_log_wins_over_rust_log() {
        let config = LogConfig::from_vars(vars(&[
            ("CHATLINK_LOG", "chatlink=trace"),
            ("RUST_LOG", "debug"),
            ("CHATLINK_LOG_FORMAT", "json"),
        ]));
        assert_eq!(config.filter, "chatlink=trace");
        assert_eq!(config.format, LogFormat::Json);
    }

    #[test]
    fn test_defaults_without_env() {
        let config = LogConfig::from_vars(vars(&[("CHATLINK_LOG", "  ")]));
        assert_eq!(config.filter, DEFAULT_FILTER);
        assert_eq!(config.format, LogFormat::Compact);
    }

    #[test]
    fn test_verbose_turns_on_debug() {
        let config = LogConfig::default().verbose();
        assert!(config.filter.contains("debug"));
        assert!(config.with_file);
    }
}
