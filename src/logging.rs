//! Structured logging setup using `tracing-subscriber`.
//!
//! The level filter is installed behind a reload layer; [`LevelHandle`]
//! is the single, explicit mutation entry point for the process-wide
//! level. Nothing else in the process writes logger state.

use anyhow::Context;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{reload, EnvFilter, Registry};

/// Handle for changing the process-wide log level after startup.
#[derive(Clone)]
pub struct LevelHandle {
    inner: reload::Handle<EnvFilter, Registry>,
}

impl LevelHandle {
    /// Replace the active level filter.
    ///
    /// # Errors
    ///
    /// Returns an error if `level` is not a valid filter directive or
    /// the subscriber is gone.
    pub fn set_level(&self, level: &str) -> anyhow::Result<()> {
        let filter = EnvFilter::try_new(level)
            .with_context(|| format!("invalid log level {level:?}"))?;
        self.inner
            .reload(filter)
            .context("failed to reload log level")
    }
}

/// Initialise logging: human-readable output on stderr, level from
/// `RUST_LOG` when set, otherwise from the configured default.
///
/// Returns the [`LevelHandle`] used for later level changes.
///
/// # Errors
///
/// Returns an error if the configured level is not a valid filter
/// directive (a fatal configuration error at startup).
pub fn init(default_level: &str) -> anyhow::Result<LevelHandle> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(default_level)
            .with_context(|| format!("invalid log level {default_level:?}"))?,
    };

    let (filter_layer, handle) = reload::Layer::new(filter);
    tracing_subscriber::registry()
        .with(filter_layer)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    Ok(LevelHandle { inner: handle })
}
