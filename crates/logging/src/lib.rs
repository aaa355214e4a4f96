//! Meshlink Logging
//!
//! `tracing` subscriber setup shared by Meshlink binaries.
//! `RUST_LOG` always wins over the level passed in.

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::{SubscriberInitExt, TryInitError};
use tracing_subscriber::{fmt, EnvFilter};

/// Verbosity when `RUST_LOG` is unset
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogLevel {
    Error,
    Warn,
    #[default]
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    /// Filter directive: the level for our crates, at most `info` for dependencies
    pub fn directive(&self) -> &'static str {
        match self {
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "info,meshlink=debug",
            LogLevel::Trace => "info,meshlink=trace",
        }
    }

    pub fn from_verbose(verbose: bool) -> Self {
        if verbose {
            LogLevel::Debug
        } else {
            LogLevel::Info
        }
    }
}

fn filter(level: LogLevel) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level.directive()))
}

/// Install the global subscriber; fails if one is already set
pub fn try_init(level: LogLevel) -> Result<(), TryInitError> {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(filter(level))
        .try_init()
}

/// Install the global subscriber, ignoring an existing one
pub fn init_logging(verbose: bool) {
    let _ = try_init(LogLevel::from_verbose(verbose));
}
