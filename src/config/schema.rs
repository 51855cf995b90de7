//! Configuration schema definitions.
//!
//! This module defines the complete configuration structure for the registry.
//! All types derive Serde traits so a TOML file can provide a base layer that
//! environment variables then override.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use url::Url;

use crate::net::ListenUrl;

/// Root configuration for the registry node.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RegistryConfig {
    /// URLs to serve the registry on.
    pub listen_on: Vec<ListenUrl>,

    /// Upper bound for the expiry of issued tokens.
    #[serde(with = "duration_str")]
    pub max_token_lifetime: Duration,

    /// Policy path patterns applied to incoming registry calls.
    pub registry_server_policies: Vec<String>,

    /// Policy path patterns applied to outgoing registry calls.
    pub registry_client_policies: Vec<String>,

    pub log_level: LogLevel,

    /// Settings handed to the registry chain.
    pub registry: ChainConfig,

    /// Kubernetes client tuning.
    pub kube: KubeConfig,

    /// Where the workload identity material lives.
    pub identity: IdentityConfig,

    pub telemetry: TelemetryConfig,

    pub diagnostics: DiagnosticsConfig,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            listen_on: vec![ListenUrl::unix("/listen.on.socket")],
            max_token_lifetime: Duration::from_secs(10 * 60),
            registry_server_policies: default_policies("server"),
            registry_client_policies: default_policies("client"),
            log_level: LogLevel::Info,
            registry: ChainConfig::default(),
            kube: KubeConfig::default(),
            identity: IdentityConfig::default(),
            telemetry: TelemetryConfig::default(),
            diagnostics: DiagnosticsConfig::default(),
        }
    }
}

fn default_policies(side: &str) -> Vec<String> {
    vec![
        "etc/nsm/opa/common/.*.rego".to_string(),
        "etc/nsm/opa/registry/.*.rego".to_string(),
        format!("etc/nsm/opa/{side}/.*.rego"),
    ]
}

/// Settings consumed by the registry chain.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ChainConfig {
    /// Namespace the registry stores its resources in.
    pub namespace: String,

    /// Proxy registry that handles foreign domains.
    pub proxy_registry_url: Option<Url>,

    /// Period between scans for expired endpoints.
    #[serde(with = "duration_str")]
    pub expire_period: Duration,
}

impl Default for ChainConfig {
    fn default() -> Self {
        Self {
            namespace: "default".to_string(),
            proxy_registry_url: None,
            expire_period: Duration::from_secs(60),
        }
    }
}

/// Kubernetes client tuning.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct KubeConfig {
    /// Sustained request rate towards the API server.
    ///
    /// Sized for 40 endpoints, 40 clients and 5 forwarders refreshing once
    /// per second: 40 + 5 + 4 * 40 = 205.
    pub kubelet_qps: u32,
}

impl KubeConfig {
    /// Burst allowance, twice the sustained rate.
    pub fn burst(&self) -> u32 {
        self.kubelet_qps.saturating_mul(2)
    }
}

impl Default for KubeConfig {
    fn default() -> Self {
        Self { kubelet_qps: 205 }
    }
}

/// Workload identity configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct IdentityConfig {
    /// Directory holding `svid.pem`, `svid_key.pem` and `svid_bundle.pem`.
    pub svid_dir: PathBuf,
}

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            svid_dir: PathBuf::from("/run/spiffe/certs"),
        }
    }
}

/// Metrics exposition.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct TelemetryConfig {
    pub metrics_enabled: bool,

    /// Prometheus scrape endpoint bind address.
    pub metrics_listen_on: String,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            metrics_enabled: false,
            metrics_listen_on: "0.0.0.0:9090".to_string(),
        }
    }
}

/// Local diagnostics endpoint.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct DiagnosticsConfig {
    pub enabled: bool,
    pub listen_on: String,
}

impl Default for DiagnosticsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            listen_on: "localhost:6060".to_string(),
        }
    }
}

/// Log verbosity.
///
/// Accepts the level names operators already use for the registry,
/// including `panic` and `fatal`, which both map to `ERROR`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(try_from = "String", into = "String")]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    /// Filter directive understood by `tracing_subscriber::EnvFilter`.
    pub fn directive(self) -> &'static str {
        match self {
            LogLevel::Trace => "trace",
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

impl FromStr for LogLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "trace" => Ok(LogLevel::Trace),
            "debug" => Ok(LogLevel::Debug),
            "info" => Ok(LogLevel::Info),
            "warn" | "warning" => Ok(LogLevel::Warn),
            "error" | "fatal" | "panic" => Ok(LogLevel::Error),
            _ => Err(format!("invalid log level {s:?}")),
        }
    }
}

impl TryFrom<String> for LogLevel {
    type Error = String;

    fn try_from(value: String) -> Result<Self, String> {
        value.parse()
    }
}

impl From<LogLevel> for String {
    fn from(level: LogLevel) -> Self {
        level.to_string()
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.directive().to_ascii_uppercase())
    }
}

/// Largest duration accepted, about 292 years.
const MAX_DURATION_NANOS: u64 = i64::MAX as u64;

/// Parses Go-style duration strings: a sequence of `<integer><unit>` pairs
/// with units `ns`, `us`, `ms`, `s`, `m` and `h`, e.g. `1m30s`.
pub fn parse_duration(s: &str) -> Result<Duration, String> {
    let s = s.trim();
    if s == "0" {
        return Ok(Duration::ZERO);
    }
    if s.is_empty() {
        return Err("empty duration".to_string());
    }

    let mut total_nanos: u64 = 0;
    let mut rest = s;
    while !rest.is_empty() {
        let digits = rest.find(|c: char| !c.is_ascii_digit()).unwrap_or(rest.len());
        if digits == 0 {
            return Err(format!("invalid duration: {s}"));
        }
        let value: u64 = rest[..digits]
            .parse()
            .map_err(|_| format!("invalid duration: {s}"))?;
        rest = &rest[digits..];

        let unit_len = rest.find(|c: char| c.is_ascii_digit()).unwrap_or(rest.len());
        let nanos_per_unit: u64 = match &rest[..unit_len] {
            "ns" => 1,
            "us" | "µs" => 1_000,
            "ms" => 1_000_000,
            "s" => 1_000_000_000,
            "m" => 60_000_000_000,
            "h" => 3_600_000_000_000,
            "" => return Err(format!("missing unit in duration: {s}")),
            unit => return Err(format!("unknown unit {unit:?} in duration: {s}")),
        };
        total_nanos = value
            .checked_mul(nanos_per_unit)
            .and_then(|part| total_nanos.checked_add(part))
            .filter(|total| *total <= MAX_DURATION_NANOS)
            .ok_or_else(|| format!("duration out of range: {s}"))?;
        rest = &rest[unit_len..];
    }
    Ok(Duration::from_nanos(total_nanos))
}

/// Formats a duration the way [`parse_duration`] reads it back.
pub fn format_duration(d: Duration) -> String {
    let secs = d.as_secs();
    if d.subsec_nanos() != 0 {
        return format!("{}ms", d.as_millis());
    }
    if secs == 0 {
        return "0".to_string();
    }
    let (h, m, s) = (secs / 3600, (secs % 3600) / 60, secs % 60);
    let mut out = String::new();
    if h > 0 {
        out.push_str(&format!("{h}h"));
    }
    if m > 0 {
        out.push_str(&format!("{m}m"));
    }
    if s > 0 {
        out.push_str(&format!("{s}s"));
    }
    out
}

mod duration_str {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&super::format_duration(*d))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let s = String::deserialize(deserializer)?;
        super::parse_duration(&s).map_err(serde::de::Error::custom)
    }
}
