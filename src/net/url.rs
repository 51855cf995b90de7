//! Listen address parsing.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ListenUrlError {
    #[error("invalid url {0:?}: {1}")]
    Parse(String, url::ParseError),

    #[error("unsupported scheme {scheme:?} in {url:?}, expected unix or tcp")]
    Scheme { url: String, scheme: String },

    #[error("{0:?} has no socket path")]
    MissingPath(String),

    #[error("{0:?} needs both host and port")]
    MissingHostPort(String),
}

/// A URL the registry serves on: `unix:///path/to.sock` or `tcp://host:port`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(try_from = "String", into = "String")]
pub enum ListenUrl {
    Unix(PathBuf),
    Tcp { host: String, port: u16 },
}

impl ListenUrl {
    pub fn unix(path: impl Into<PathBuf>) -> Self {
        Self::Unix(path.into())
    }

    pub fn tcp(host: impl Into<String>, port: u16) -> Self {
        Self::Tcp {
            host: host.into(),
            port,
        }
    }

    /// `host:port` for tcp URLs, suitable for `ToSocketAddrs`.
    pub fn host_port(&self) -> Option<String> {
        match self {
            Self::Unix(_) => None,
            Self::Tcp { host, port } if host.contains(':') => Some(format!("[{host}]:{port}")),
            Self::Tcp { host, port } => Some(format!("{host}:{port}")),
        }
    }
}

impl FromStr for ListenUrl {
    type Err = ListenUrlError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let url = Url::parse(s).map_err(|e| ListenUrlError::Parse(s.to_string(), e))?;
        match url.scheme() {
            "unix" => {
                let path = url.path();
                if path.is_empty() || path == "/" {
                    return Err(ListenUrlError::MissingPath(s.to_string()));
                }
                Ok(Self::Unix(PathBuf::from(path)))
            }
            "tcp" => {
                let host = url
                    .host_str()
                    .filter(|h| !h.is_empty())
                    .ok_or_else(|| ListenUrlError::MissingHostPort(s.to_string()))?;
                let port = url
                    .port()
                    .ok_or_else(|| ListenUrlError::MissingHostPort(s.to_string()))?;
                let host = host.trim_start_matches('[').trim_end_matches(']');
                Ok(Self::tcp(host, port))
            }
            scheme => Err(ListenUrlError::Scheme {
                url: s.to_string(),
                scheme: scheme.to_string(),
            }),
        }
    }
}

impl fmt::Display for ListenUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unix(path) => write!(f, "unix://{}", path.display()),
            Self::Tcp { .. } => write!(f, "tcp://{}", self.host_port().unwrap_or_default()),
        }
    }
}

impl TryFrom<String> for ListenUrl {
    type Error = ListenUrlError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<ListenUrl> for String {
    fn from(url: ListenUrl) -> Self {
        url.to_string()
    }
}
