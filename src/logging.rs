//! Logging - tracing subscriber setup for the CLI and embedding hosts

use tracing_subscriber::{fmt, EnvFilter};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Pretty,
    Json,
}

impl LogFormat {
    /// `HAZE_LOG_JSON=1` selects JSON lines, anything else pretty output.
    pub fn from_env() -> Self {
        match std::env::var("HAZE_LOG_JSON").as_deref() {
            Ok("1") => LogFormat::Json,
            _ => LogFormat::Pretty,
        }
    }
}

/// Install the stderr subscriber in the format chosen by the environment.
pub fn init_logging() {
    init_logging_with(LogFormat::from_env());
}

/// `RUST_LOG` filters (default `info`). Safe to call more than once.
pub fn init_logging_with(format: LogFormat) {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = fmt::Subscriber::builder()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr);

    let _ = match format {
        LogFormat::Json => builder.json().try_init(),
        LogFormat::Pretty => builder.pretty().try_init(),
    };
}
