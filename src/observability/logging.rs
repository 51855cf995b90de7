//! Structured logging.
//!
//! # Responsibilities
//! - Initialize the global `tracing` subscriber once, from `main`
//! - Hand out a [`LogLevelControl`] so the level can change at runtime
//!
//! # Design Decisions
//! - The filter sits behind a `reload` layer; nothing else mutates global
//!   logging state
//! - `RUST_LOG`, when set, takes precedence over the configured level

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::{SubscriberInitExt, TryInitError};
use tracing_subscriber::{fmt, reload, EnvFilter, Registry};

use crate::config::LogLevel;

/// Handle for switching the active log filter.
#[derive(Debug, Clone)]
pub struct LogLevelControl {
    handle: reload::Handle<EnvFilter, Registry>,
    initial: String,
}

impl LogLevelControl {
    /// Replace the active filter with `level` for every target.
    pub fn set_level(&self, level: LogLevel) -> Result<(), reload::Error> {
        self.handle.reload(EnvFilter::new(level.directive()))
    }

    /// Go back to the filter the process started with.
    pub fn restore(&self) -> Result<(), reload::Error> {
        self.handle.reload(EnvFilter::new(&self.initial))
    }

    /// The active filter, rendered as directives.
    pub fn current(&self) -> Option<String> {
        self.handle.with_current(|filter| filter.to_string()).ok()
    }
}

/// Build the reloadable filter layer without installing it.
pub fn filter_layer(level: LogLevel) -> (reload::Layer<EnvFilter, Registry>, LogLevelControl) {
    let initial = std::env::var(EnvFilter::DEFAULT_ENV)
        .ok()
        .filter(|directives| !directives.trim().is_empty())
        .unwrap_or_else(|| level.directive().to_string());
    let (layer, handle) = reload::Layer::new(EnvFilter::new(&initial));
    (layer, LogLevelControl { handle, initial })
}

/// Install the global subscriber.
pub fn init(level: LogLevel) -> Result<LogLevelControl, TryInitError> {
    let (filter, control) = filter_layer(level);
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer())
        .try_init()?;
    Ok(control)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn level_switches_and_restores() {
        let (filter, control) = filter_layer(LogLevel::Warn);
        let subscriber = tracing_subscriber::registry().with(filter);
        let _guard = tracing::subscriber::set_default(subscriber);

        let initial = control.current().unwrap();

        control.set_level(LogLevel::Trace).unwrap();
        assert_eq!(control.current().unwrap(), "trace");

        control.restore().unwrap();
        assert_eq!(control.current().unwrap(), initial);
    }
}
