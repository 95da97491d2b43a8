//! Logging setup
//!
//! Structured logging through `tracing`. The filter comes from `RUST_LOG`
//! when set, otherwise from the level given on the command line. Output is
//! human-readable text, or one JSON object per line with `--log-json`.
//!
//! # Usage
//!
//! ```rust,ignore
//! use co2_recorder::observability::init_tracing;
//!
//! init_tracing("info", false)?;
//! tracing::info!(stream = "/co2/1", "recorder started");
//! ```

pub mod spans;

use crate::error::TracingError;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

pub use spans::*;

/// Install the global subscriber. Fails if one is already installed or the
/// level is not a valid filter directive.
pub fn init_tracing(level: &str, json: bool) -> Result<(), TracingError> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => level_filter(level)?,
    };

    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry
            .with(tracing_subscriber::fmt::layer().json().with_current_span(true))
            .try_init()?;
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().with_target(false))
            .try_init()?;
    }

    tracing::debug!(level, json, "tracing initialized");
    Ok(())
}

fn level_filter(level: &str) -> Result<EnvFilter, TracingError> {
    Ok(EnvFilter::try_new(level)?)
}
