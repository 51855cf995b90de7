//! Network layer subsystem.
//!
//! # Data Flow
//! ```text
//! Configured ListenUrl (unix:// or tcp://)
//!     → listener.rs (synchronous bind, accept)
//!     → tls.rs (mutual TLS handshake with the current SVID)
//!     → connection.rs (peer identity, active connection tracking)
//!     → Hand off to the gRPC server
//! ```
//!
//! # Design Decisions
//! - Binding never yields, so an address conflict is known before the
//!   serve task exists
//! - Unix and TCP share one stream type; gRPC code does not care which
//! - Every connection is authenticated; there is no plaintext mode

pub mod connection;
pub mod listener;
pub mod tls;
pub mod url;

pub use connection::{ConnectionTracker, MeshStream, PeerInfo};
pub use listener::{BoundListener, ListenerError, RawStream, ServeError};
pub use tls::{MtlsConfig, TlsError};
pub use url::{ListenUrl, ListenUrlError};
