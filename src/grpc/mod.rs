//! gRPC plumbing.
//!
//! # Data Flow
//! ```text
//! Server: BoundListener → TLS handshake → MeshStream → tonic Server → registry routes
//! Client: DialOptions → mutual TLS connector → Channel → TokenInterceptor
//! ```
//!
//! # Design Decisions
//! - Transport internals stay in tonic; this module only supplies the
//!   authenticated streams and the per-call credentials
//! - One `GrpcServer` serves every listener and shares its routes

pub mod client;
pub mod server;

pub use client::{AuthenticatedChannel, DialOptions, TokenInterceptor};
pub use server::GrpcServer;
