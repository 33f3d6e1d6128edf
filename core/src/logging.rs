//! Process-wide `tracing` subscriber.
//!
//! Library code only emits events through the `tracing` macros; binaries call
//! [`init`] once at startup. The filter follows `RUST_LOG` syntax, e.g.
//! `revlm=debug,info`.

use crate::error::{Error, Result};
use clap::ValueEnum;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::Layer;

/// Filter used when neither `RUST_LOG` nor an explicit directive is given.
pub const DEFAULT_FILTER: &str = "revlm=info,warn";

/// Output format of log lines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum LogFormat {
    /// Human-readable, multi-line events.
    Pretty,
    /// One line per event.
    #[default]
    Compact,
}

/// Resolves the filter directive: the explicit one, then `RUST_LOG`, then [`DEFAULT_FILTER`].
pub fn filter_directive(explicit: Option<&str>) -> String {
    explicit
        .map(str::to_string)
        .or_else(|| std::env::var("RUST_LOG").ok())
        .unwrap_or_else(|| DEFAULT_FILTER.to_string())
}

/// Installs the global subscriber.
///
/// Fails if the directive does not parse or a subscriber is already installed.
pub fn init(filter: Option<&str>, format: LogFormat) -> Result<()> {
    let directive = filter_directive(filter);
    let filter = EnvFilter::try_new(&directive)
        .map_err(|e| Error::Config(format!("invalid log filter {directive:?}: {e}")))?;

    let installed = match format {
        LogFormat::Pretty => tracing_subscriber::registry()
            .with(fmt::layer().pretty().with_thread_names(true).with_filter(filter))
            .try_init(),
        LogFormat::Compact => tracing_subscriber::registry()
            .with(fmt::layer().compact().with_target(true).with_filter(filter))
            .try_init(),
    };
    installed.map_err(|e| Error::Config(format!("logging already initialized: {e}")))
}
