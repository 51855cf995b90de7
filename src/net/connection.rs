//! Accepted connection tracking and the stream type handed to gRPC.
//!
//! # Responsibilities
//! - Number authenticated connections for tracing
//! - Count live connections for diagnostics, metrics and the exit drain
//! - Carry the authenticated peer identity into request extensions

use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio_rustls::server::TlsStream;
use tonic::transport::server::Connected;

use crate::identity::SpiffeId;
use crate::net::{ListenUrl, RawStream};
use crate::observability::metrics;

/// Per-tracker sequence number of an authenticated connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "mesh-{}", self.0)
    }
}

#[derive(Debug, Default)]
struct Counters {
    next_id: AtomicU64,
    active: AtomicU64,
}

/// Counts connections that completed the TLS handshake, across all listeners
/// sharing one server.
#[derive(Debug, Clone, Default)]
pub struct ConnectionTracker {
    counters: Arc<Counters>,
}

impl ConnectionTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers an authenticated connection. The slot releases it on drop.
    pub fn open(&self) -> ConnectionSlot {
        let id = ConnectionId(self.counters.next_id.fetch_add(1, Ordering::Relaxed) + 1);
        self.counters.active.fetch_add(1, Ordering::AcqRel);
        metrics::record_connection_opened();
        ConnectionSlot {
            counters: Arc::clone(&self.counters),
            id,
        }
    }

    pub fn active_count(&self) -> u64 {
        self.counters.active.load(Ordering::Acquire)
    }
}

/// Holds one unit of [`ConnectionTracker::active_count`] for as long as the
/// connection lives.
#[derive(Debug)]
pub struct ConnectionSlot {
    counters: Arc<Counters>,
    id: ConnectionId,
}

impl ConnectionSlot {
    pub fn id(&self) -> ConnectionId {
        self.id
    }
}

impl Drop for ConnectionSlot {
    fn drop(&mut self) {
        self.counters.active.fetch_sub(1, Ordering::AcqRel);
        metrics::record_connection_closed();
        tracing::trace!(connection_id = %self.id, "Mesh connection released");
    }
}

/// Who is on the other end of a connection. Available to registry services
/// through `tonic::Request::extensions()`.
#[derive(Debug, Clone)]
pub struct PeerInfo {
    pub connection_id: ConnectionId,
    pub local: ListenUrl,
    pub remote: Option<SocketAddr>,
    /// SPIFFE ID presented in the peer's client certificate.
    pub spiffe_id: Option<SpiffeId>,
}

/// An authenticated connection accepted by a registry listener.
#[derive(Debug)]
pub struct MeshStream {
    inner: TlsStream<RawStream>,
    peer: PeerInfo,
    _slot: ConnectionSlot,
}

impl MeshStream {
    pub fn new(
        inner: TlsStream<RawStream>,
        local: ListenUrl,
        remote: Option<SocketAddr>,
        slot: ConnectionSlot,
    ) -> Self {
        let spiffe_id = inner
            .get_ref()
            .1
            .peer_certificates()
            .and_then(|certs| certs.first())
            .and_then(|leaf| SpiffeId::from_certificate(leaf).ok());

        let peer = PeerInfo {
            connection_id: slot.id(),
            local,
            remote,
            spiffe_id,
        };
        tracing::debug!(
            connection_id = %peer.connection_id,
            listener = %peer.local,
            peer_id = ?peer.spiffe_id,
            "Connection established"
        );

        Self {
            inner,
            peer,
            _slot: slot,
        }
    }

    pub fn peer(&self) -> &PeerInfo {
        &self.peer
    }
}

impl Connected for MeshStream {
    type ConnectInfo = PeerInfo;

    fn connect_info(&self) -> Self::ConnectInfo {
        self.peer.clone()
    }
}

impl AsyncRead for MeshStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl AsyncWrite for MeshStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}
