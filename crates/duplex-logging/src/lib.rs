//! Structured logging for the duplex gateway.
//!
//! [`init_subscriber`] installs a global `tracing` subscriber that writes to
//! stderr, either as compact human-readable lines or as one JSON object per
//! line. `RUST_LOG` takes precedence over the configured level.

#![deny(unsafe_code)]

use duplex_settings::{LogFormat, LoggingSettings};
use tracing_subscriber::EnvFilter;

/// Filter used when neither `RUST_LOG` nor the configured level parses.
const FALLBACK_DIRECTIVE: &str = "info";

/// Initialize the global tracing subscriber.
///
/// Call once at startup. Later calls are no-ops.
pub fn init_subscriber(settings: &LoggingSettings) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| build_filter(&settings.level));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr);

    // try_init fails only if a global subscriber already exists
    let _ = match settings.format {
        LogFormat::Text => builder.compact().try_init(),
        LogFormat::Json => builder.json().with_current_span(false).try_init(),
    };
}

/// Build a filter from a configured directive, falling back to `info`.
pub fn build_filter(directive: &str) -> EnvFilter {
    let directive = directive.trim();
    if directive.is_empty() {
        return EnvFilter::new(FALLBACK_DIRECTIVE);
    }
    EnvFilter::try_new(directive).unwrap_or_else(|err| {
        eprintln!("invalid log level {directive:?} ({err}), using {FALLBACK_DIRECTIVE}");
        EnvFilter::new(FALLBACK_DIRECTIVE)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_filter_accepts_level() {
        assert_eq!(build_filter("debug").to_string(), "debug");
    }

    #[test]
    fn build_filter_accepts_targets() {
        let filter = build_filter("duplex_server=trace,info");
        assert!(filter.to_string().contains("duplex_server=trace"));
    }

    #[test]
    fn build_filter_empty_falls_back() {
        assert_eq!(build_filter("  ").to_string(), "info");
    }

    #[test]
    fn build_filter_garbage_falls_back() {
        assert_eq!(build_filter("duplex=loud").to_string(), "info");
    }

    #[test]
    fn init_twice_is_harmless() {
        let settings = LoggingSettings::default();
        init_subscriber(&settings);
        init_subscriber(&LoggingSettings {
            format: LogFormat::Json,
            ..settings
        });
    }
}
