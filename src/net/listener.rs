//! Listener binding for unix and TCP endpoints.
//!
//! # Responsibilities
//! - Bind the configured address synchronously so failures surface at once
//! - Accept incoming connections as a single stream type for both transports
//! - Clean up unix socket files around the listener's lifetime

use std::io;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::pin::Pin;
use std::task::{Context, Poll};

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::{TcpListener, TcpStream, UnixListener, UnixStream};

use crate::net::ListenUrl;

/// Terminal failure of one listener, delivered on its error channel.
#[derive(Debug, Error)]
pub enum ListenerError {
    #[error("failed to listen on {address}: {source}")]
    Bind {
        address: ListenUrl,
        #[source]
        source: io::Error,
    },

    #[error("server on {address} stopped: {source}")]
    Serve {
        address: ListenUrl,
        #[source]
        source: ServeError,
    },
}

impl ListenerError {
    pub fn address(&self) -> &ListenUrl {
        match self {
            ListenerError::Bind { address, .. } | ListenerError::Serve { address, .. } => address,
        }
    }
}

/// Why a running listener stopped serving.
#[derive(Debug, Error)]
pub enum ServeError {
    #[error("failed to accept: {0}")]
    Accept(#[source] io::Error),

    #[error("transport error: {0}")]
    Transport(#[from] tonic::transport::Error),
}

/// A bound, not yet serving, listener.
#[derive(Debug)]
pub enum BoundListener {
    Tcp {
        inner: TcpListener,
        address: ListenUrl,
    },
    Unix {
        inner: UnixListener,
        address: ListenUrl,
        path: PathBuf,
    },
}

impl BoundListener {
    /// Bind `address` without yielding to the runtime.
    ///
    /// Must be called from within a Tokio runtime. Stale unix socket files
    /// are removed and missing parent directories created first.
    pub fn bind(address: &ListenUrl) -> io::Result<Self> {
        match address {
            ListenUrl::Tcp { .. } => {
                let host_port = address.host_port().unwrap_or_default();
                let std_listener = std::net::TcpListener::bind(host_port.as_str())?;
                std_listener.set_nonblocking(true)?;
                Ok(Self::Tcp {
                    inner: TcpListener::from_std(std_listener)?,
                    address: address.clone(),
                })
            }
            ListenUrl::Unix(path) => {
                if let Some(parent) = path.parent() {
                    if !parent.as_os_str().is_empty() && !parent.exists() {
                        std::fs::create_dir_all(parent)?;
                    }
                }
                if path.exists() {
                    std::fs::remove_file(path)?;
                }
                let std_listener = std::os::unix::net::UnixListener::bind(path)?;
                std_listener.set_nonblocking(true)?;
                Ok(Self::Unix {
                    inner: UnixListener::from_std(std_listener)?,
                    address: address.clone(),
                    path: path.clone(),
                })
            }
        }
    }

    pub fn address(&self) -> &ListenUrl {
        match self {
            Self::Tcp { address, .. } | Self::Unix { address, .. } => address,
        }
    }

    /// Bound socket address, for TCP listeners.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        match self {
            Self::Tcp { inner, .. } => inner.local_addr().ok(),
            Self::Unix { .. } => None,
        }
    }

    /// Accept the next connection. The peer address is only known for TCP.
    pub async fn accept(&self) -> io::Result<(RawStream, Option<SocketAddr>)> {
        match self {
            Self::Tcp { inner, .. } => {
                let (stream, peer) = inner.accept().await?;
                stream.set_nodelay(true)?;
                Ok((RawStream::Tcp(stream), Some(peer)))
            }
            Self::Unix { inner, .. } => {
                let (stream, _) = inner.accept().await?;
                Ok((RawStream::Unix(stream), None))
            }
        }
    }
}

impl Drop for BoundListener {
    fn drop(&mut self) {
        if let Self::Unix { path, .. } = self {
            let _ = std::fs::remove_file(path);
        }
    }
}

/// Accept errors that only affect the connection being accepted.
pub fn is_transient_accept_error(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::Interrupted
            | io::ErrorKind::WouldBlock
    )
}

/// Plain byte stream from either transport.
#[derive(Debug)]
pub enum RawStream {
    Tcp(TcpStream),
    Unix(UnixStream),
}

impl RawStream {
    /// Dial `address`.
    pub async fn connect(address: &ListenUrl) -> io::Result<Self> {
        match address {
            ListenUrl::Unix(path) => Ok(Self::Unix(UnixStream::connect(path).await?)),
            ListenUrl::Tcp { .. } => {
                let stream = TcpStream::connect(address.host_port().unwrap_or_default()).await?;
                stream.set_nodelay(true)?;
                Ok(Self::Tcp(stream))
            }
        }
    }
}

impl AsyncRead for RawStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Self::Tcp(s) => Pin::new(s).poll_read(cx, buf),
            Self::Unix(s) => Pin::new(s).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for RawStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            Self::Tcp(s) => Pin::new(s).poll_write(cx, buf),
            Self::Unix(s) => Pin::new(s).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Self::Tcp(s) => Pin::new(s).poll_flush(cx),
            Self::Unix(s) => Pin::new(s).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Self::Tcp(s) => Pin::new(s).poll_shutdown(cx),
            Self::Unix(s) => Pin::new(s).poll_shutdown(cx),
        }
    }
}
