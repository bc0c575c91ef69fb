//! Tracing subscriber setup for hosts that do not install their own.
//!
//! Loaders log at `info`, the engine runs inside an `analyze` span and
//! reports blocks at `debug` and instructions at `trace`. `RUST_LOG`
//! overrides the default filter.

use std::sync::Once;

use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter,
};

static INIT: Once = Once::new();

/// Output format of the installed subscriber.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

fn env_filter(default_directive: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_directive))
}

/// Install the global subscriber with `default_directive` as the filter
/// when `RUST_LOG` is unset.
///
/// Only the first call in a process does anything. Returns true if this
/// call installed the subscriber; false if one was already set, here or by
/// the host.
pub fn init_with(format: LogFormat, default_directive: &str) -> bool {
    let mut installed = false;
    INIT.call_once(|| {
        let text = (format == LogFormat::Text).then(|| {
            fmt::layer()
                .with_span_events(FmtSpan::CLOSE)
                .with_target(true)
                .with_file(true)
                .with_line_number(true)
        });
        let json = (format == LogFormat::Json).then(|| {
            fmt::layer()
                .json()
                .with_span_events(FmtSpan::CLOSE)
                .with_target(true)
                .with_current_span(true)
        });
        installed = tracing_subscriber::registry()
            .with(env_filter(default_directive))
            .with(text)
            .with(json)
            .try_init()
            .is_ok();
        if installed {
            tracing::info!(?format, "scatha tracing initialized");
        }
    });
    installed
}

/// Human-readable output at `info`.
pub fn init_tracing() {
    init_with(LogFormat::Text, "info");
}

/// JSON lines at `info`, one object per event.
pub fn init_tracing_json() {
    init_with(LogFormat::Json, "info");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_first_init_installs() {
        init_tracing();
        assert!(!init_with(LogFormat::Json, "debug"));
        init_tracing_json();
    }

    #[test]
    fn test_default_filter_directive() {
        if std::env::var_os("RUST_LOG").is_none() {
            assert_eq!(env_filter("warn").to_string(), "warn");
        }
    }
}
