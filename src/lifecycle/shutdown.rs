//! Process lifetime and shutdown coordination.
//!
//! Any number of triggers (signals, listener failures) fan in here. The
//! first one records its cause and cancels the shared token; the rest are
//! no-ops.

use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, OnceLock};

use tokio_util::sync::{CancellationToken, WaitForCancellationFutureOwned};

use crate::net::ListenUrl;
use crate::observability::metrics;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ShutdownState {
    Running = 0,
    ShuttingDown = 1,
    Stopped = 2,
}

impl ShutdownState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Running,
            1 => Self::ShuttingDown,
            _ => Self::Stopped,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::ShuttingDown => "shutting_down",
            Self::Stopped => "stopped",
        }
    }
}

/// What ended the process lifetime.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShutdownCause {
    /// A termination signal, by name.
    Signal(&'static str),
    /// The first listener to report a terminal error.
    ListenerFailed { address: ListenUrl, error: String },
}

impl ShutdownCause {
    /// `0` for an orderly signal-driven stop, `1` otherwise.
    pub fn exit_code(&self) -> u8 {
        match self {
            Self::Signal(_) => 0,
            Self::ListenerFailed { .. } => 1,
        }
    }

    fn label(&self) -> &'static str {
        match self {
            Self::Signal(_) => "signal",
            Self::ListenerFailed { .. } => "listener_failed",
        }
    }
}

impl fmt::Display for ShutdownCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Signal(name) => write!(f, "received {name}"),
            Self::ListenerFailed { address, error } => {
                write!(f, "listener {address} failed: {error}")
            }
        }
    }
}

#[derive(Debug)]
struct Inner {
    token: CancellationToken,
    state: AtomicU8,
    cause: OnceLock<ShutdownCause>,
}

/// Shared handle to the process lifetime. Cheap to clone.
#[derive(Debug, Clone)]
pub struct Shutdown {
    inner: Arc<Inner>,
}

impl Shutdown {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                token: CancellationToken::new(),
                state: AtomicU8::new(ShutdownState::Running as u8),
                cause: OnceLock::new(),
            }),
        }
    }

    /// Begin shutdown. Returns `true` only for the call that won.
    pub fn trigger(&self, cause: ShutdownCause) -> bool {
        let won = self
            .inner
            .state
            .compare_exchange(
                ShutdownState::Running as u8,
                ShutdownState::ShuttingDown as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok();

        if !won {
            tracing::debug!(cause = %cause, "Shutdown already in progress");
            return false;
        }

        match &cause {
            ShutdownCause::Signal(_) => tracing::info!(cause = %cause, "Shutting down"),
            ShutdownCause::ListenerFailed { address, error } => {
                tracing::error!(address = %address, error = %error, "Listener failed, shutting down")
            }
        }
        metrics::record_shutdown(cause.label());
        // Only the winner gets here, so the slot is always empty.
        let _ = self.inner.cause.set(cause);
        self.inner.token.cancel();
        true
    }

    /// Resolves once shutdown has been triggered.
    pub async fn cancelled(&self) {
        self.inner.token.cancelled().await
    }

    /// Owned variant of [`Shutdown::cancelled`], for servers that need a
    /// `'static` shutdown future.
    pub fn cancelled_owned(&self) -> WaitForCancellationFutureOwned {
        self.inner.token.clone().cancelled_owned()
    }

    pub fn is_triggered(&self) -> bool {
        self.inner.token.is_cancelled()
    }

    pub fn state(&self) -> ShutdownState {
        ShutdownState::from_u8(self.inner.state.load(Ordering::Acquire))
    }

    pub fn cause(&self) -> Option<&ShutdownCause> {
        self.inner.cause.get()
    }

    /// Record that the main path has observed cancellation.
    pub fn mark_stopped(&self) {
        let _ = self.inner.state.compare_exchange(
            ShutdownState::ShuttingDown as u8,
            ShutdownState::Stopped as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
    }

    /// Exit code for the winning cause; `0` while still running.
    pub fn exit_code(&self) -> u8 {
        self.cause().map(ShutdownCause::exit_code).unwrap_or(0)
    }
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}
