//! Structured logging setup and the severity scale shared by render logs,
//! forwarded browser console output and the HTTP access log.

use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, trace, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub enum Severity {
    Verbose = 10,
    Debug = 20,
    Info = 30,
    Warn = 40,
    Error = 50,
    Fatal = 60,
}

impl Severity {
    /// Maps a browser console API type onto the scale.
    pub fn from_console_type(kind: &str) -> Self {
        match kind {
            "log" | "info" => Severity::Info,
            "debug" => Severity::Debug,
            "warn" | "warning" => Severity::Warn,
            "error" => Severity::Error,
            _ => Severity::Verbose,
        }
    }

    /// Access log level for an HTTP response status.
    pub fn from_http_status(status: u16) -> Self {
        match status {
            200..=299 => Severity::Info,
            500..=599 => Severity::Fatal,
            _ => Severity::Warn,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Severity::Verbose => "verbose",
            Severity::Debug => "debug",
            Severity::Info => "info",
            Severity::Warn => "warn",
            Severity::Error => "error",
            Severity::Fatal => "fatal",
        }
    }
}

/// Writes one event at `severity` with `extra` attached as a JSON field.
pub fn emit(severity: Severity, message: &str, extra: &serde_json::Value) {
    match severity {
        Severity::Verbose => trace!(extra = %extra, "{message}"),
        Severity::Debug => debug!(extra = %extra, "{message}"),
        Severity::Info => info!(extra = %extra, "{message}"),
        Severity::Warn => warn!(extra = %extra, "{message}"),
        Severity::Error => error!(extra = %extra, "{message}"),
        Severity::Fatal => error!(fatal = true, extra = %extra, "{message}"),
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Json,
    Compact,
}

pub fn setup_logging(verbose: bool, format: LogFormat) -> Result<(), Box<dyn std::error::Error>> {
    let default_level = if verbose {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };

    let env_filter = EnvFilter::builder()
        .with_default_directive(default_level.into())
        .from_env_lossy();

    let fmt_layer = match format {
        LogFormat::Json => fmt::layer()
            .json()
            .with_current_span(true)
            .with_target(false)
            .boxed(),
        LogFormat::Compact => fmt::layer().compact().with_target(false).boxed(),
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .try_init()?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn console_types_map_onto_scale() {
        assert_eq!(Severity::from_console_type("log"), Severity::Info);
        assert_eq!(Severity::from_console_type("info"), Severity::Info);
        assert_eq!(Severity::from_console_type("debug"), Severity::Debug);
        assert_eq!(Severity::from_console_type("warn"), Severity::Warn);
        assert_eq!(Severity::from_console_type("warning"), Severity::Warn);
        assert_eq!(Severity::from_console_type("error"), Severity::Error);
        assert_eq!(Severity::from_console_type("verbose"), Severity::Verbose);
        assert_eq!(Severity::from_console_type("table"), Severity::Verbose);
    }

    #[test]
    fn access_log_levels_follow_status_class() {
        assert_eq!(Severity::from_http_status(200), Severity::Info);
        assert_eq!(Severity::from_http_status(204), Severity::Info);
        assert_eq!(Severity::from_http_status(301), Severity::Warn);
        assert_eq!(Severity::from_http_status(404), Severity::Warn);
        assert_eq!(Severity::from_http_status(503), Severity::Fatal);
        assert_eq!(Severity::from_http_status(101), Severity::Warn);
    }

    #[test]
    fn scale_is_ordered() {
        assert!(Severity::Verbose < Severity::Debug);
        assert!(Severity::Warn < Severity::Error);
        assert!(Severity::Error < Severity::Fatal);
        assert_eq!(Severity::Fatal as u8, 60);
    }
}
