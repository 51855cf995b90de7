//! Lifecycle management subsystem.
//!
//! # Data Flow
//! ```text
//! Startup (startup.rs):
//!     Identity → TLS → tokens/dial options → policies → chain → listeners
//!
//! Supervision (supervisor.rs):
//!     Each listener → own error channel → first error triggers shutdown
//!
//! Shutdown (shutdown.rs):
//!     Signal or listener error → cancel lifetime once → drain → exit code
//!
//! Signals (signals.rs):
//!     SIGINT/SIGHUP/SIGTERM/SIGQUIT → shutdown
//!     SIGUSR1/SIGUSR2 → log level TRACE / configured
//! ```
//!
//! # Design Decisions
//! - Ordered startup: identity first, listeners last
//! - One cancellation token for the whole process lifetime
//! - The first cause decides the exit code

pub mod shutdown;
pub mod signals;
pub mod startup;
pub mod supervisor;

pub use shutdown::{Shutdown, ShutdownCause, ShutdownState};
pub use startup::StartupError;
