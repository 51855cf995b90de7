//! Configuration loading from disk and the environment.

use std::fs;
use std::path::Path;

use thiserror::Error;

use crate::config::schema::{parse_duration, LogLevel, RegistryConfig};
use crate::config::validation::{validate_config, ValidationError};
use crate::net::ListenUrl;

/// Prefix shared by every recognised environment variable.
pub const ENV_PREFIX: &str = "NSM_";

/// Error type for configuration loading.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Parse error: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("error processing config from env: {key}={value:?}: {reason}")]
    Env {
        key: String,
        value: String,
        reason: String,
    },

    #[error("Validation failed: {}", join(.0))]
    Validation(Vec<ValidationError>),
}

fn join(errors: &[ValidationError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

/// An environment variable the registry understands.
#[derive(Debug, Clone, Copy)]
pub struct EnvVar {
    pub name: &'static str,
    pub default: &'static str,
    pub description: &'static str,
}

/// Every variable applied by [`apply_env`], in usage order.
pub const ENV_VARS: &[EnvVar] = &[
    EnvVar { name: "NSM_LISTEN_ON", default: "unix:///listen.on.socket", description: "url to listen on" },
    EnvVar { name: "NSM_MAX_TOKEN_LIFETIME", default: "10m", description: "maximum lifetime of tokens" },
    EnvVar {
        name: "NSM_REGISTRY_SERVER_POLICIES",
        default: "etc/nsm/opa/common/.*.rego,etc/nsm/opa/registry/.*.rego,etc/nsm/opa/server/.*.rego",
        description: "paths to files and directories that contain registry server policies",
    },
    EnvVar {
        name: "NSM_REGISTRY_CLIENT_POLICIES",
        default: "etc/nsm/opa/common/.*.rego,etc/nsm/opa/registry/.*.rego,etc/nsm/opa/client/.*.rego",
        description: "paths to files and directories that contain registry client policies",
    },
    EnvVar { name: "NSM_LOG_LEVEL", default: "INFO", description: "Log level" },
    EnvVar { name: "NSM_NAMESPACE", default: "default", description: "namespace where the registry stores its resources" },
    EnvVar { name: "NSM_PROXY_REGISTRY_URL", default: "", description: "url to the proxy registry that handles this domain" },
    EnvVar { name: "NSM_EXPIRE_PERIOD", default: "1m", description: "period to check expired NSEs" },
    EnvVar { name: "NSM_KUBELET_QPS", default: "205", description: "kubelet config settings" },
    EnvVar { name: "NSM_SVID_DIR", default: "/run/spiffe/certs", description: "directory with the X.509 SVID, key and bundle" },
    EnvVar { name: "NSM_METRICS_ENABLED", default: "false", description: "expose Prometheus metrics" },
    EnvVar { name: "NSM_METRICS_LISTEN_ON", default: "0.0.0.0:9090", description: "Prometheus metrics address" },
    EnvVar { name: "NSM_PPROF_ENABLED", default: "false", description: "is the diagnostics endpoint enabled" },
    EnvVar { name: "NSM_PPROF_LISTEN_ON", default: "localhost:6060", description: "diagnostics endpoint address" },
];

/// Read a TOML file into a configuration. Absent keys keep their defaults.
pub fn read_file(path: &Path) -> Result<RegistryConfig, ConfigError> {
    let content = fs::read_to_string(path)?;
    Ok(toml::from_str(&content)?)
}

/// Build the effective configuration: defaults, then the optional file,
/// then `NSM_*` variables from `vars`.
pub fn load<I>(file: Option<&Path>, vars: I) -> Result<RegistryConfig, ConfigError>
where
    I: IntoIterator<Item = (String, String)>,
{
    let mut config = match file {
        Some(path) => read_file(path)?,
        None => RegistryConfig::default(),
    };

    apply_env(&mut config, vars)?;
    validate_config(&config).map_err(ConfigError::Validation)?;

    Ok(config)
}

/// Overlay recognised variables onto `config`. Unknown keys are ignored.
pub fn apply_env<I>(config: &mut RegistryConfig, vars: I) -> Result<(), ConfigError>
where
    I: IntoIterator<Item = (String, String)>,
{
    for (key, value) in vars {
        if !key.starts_with(ENV_PREFIX) {
            continue;
        }
        apply_var(config, &key, &value).map_err(|reason| ConfigError::Env {
            key: key.clone(),
            value: value.clone(),
            reason,
        })?;
    }
    Ok(())
}

fn apply_var(config: &mut RegistryConfig, key: &str, value: &str) -> Result<(), String> {
    match key {
        "NSM_LISTEN_ON" => {
            config.listen_on = split_list(value)
                .map(|s| s.parse::<ListenUrl>().map_err(|e| e.to_string()))
                .collect::<Result<_, _>>()?;
        }
        "NSM_MAX_TOKEN_LIFETIME" => config.max_token_lifetime = parse_duration(value)?,
        "NSM_REGISTRY_SERVER_POLICIES" => {
            config.registry_server_policies = split_list(value).map(String::from).collect();
        }
        "NSM_REGISTRY_CLIENT_POLICIES" => {
            config.registry_client_policies = split_list(value).map(String::from).collect();
        }
        "NSM_LOG_LEVEL" => config.log_level = value.parse::<LogLevel>()?,
        "NSM_NAMESPACE" => config.registry.namespace = value.to_string(),
        "NSM_PROXY_REGISTRY_URL" => {
            config.registry.proxy_registry_url = if value.trim().is_empty() {
                None
            } else {
                Some(value.trim().parse().map_err(|e: url::ParseError| e.to_string())?)
            };
        }
        "NSM_EXPIRE_PERIOD" => config.registry.expire_period = parse_duration(value)?,
        "NSM_KUBELET_QPS" => {
            config.kube.kubelet_qps = value
                .trim()
                .parse()
                .map_err(|e: std::num::ParseIntError| e.to_string())?;
        }
        "NSM_SVID_DIR" => config.identity.svid_dir = value.into(),
        "NSM_METRICS_ENABLED" => config.telemetry.metrics_enabled = parse_bool(value)?,
        "NSM_METRICS_LISTEN_ON" => config.telemetry.metrics_listen_on = value.to_string(),
        "NSM_PPROF_ENABLED" => config.diagnostics.enabled = parse_bool(value)?,
        "NSM_PPROF_LISTEN_ON" => config.diagnostics.listen_on = value.to_string(),
        _ => {}
    }
    Ok(())
}

fn split_list(value: &str) -> impl Iterator<Item = &str> {
    value.split(',').map(str::trim).filter(|s| !s.is_empty())
}

fn parse_bool(value: &str) -> Result<bool, String> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "t" | "true" | "yes" | "on" => Ok(true),
        "0" | "f" | "false" | "no" | "off" => Ok(false),
        other => Err(format!("invalid boolean {other:?}")),
    }
}

/// Render the table printed by `--env-usage`.
pub fn usage() -> String {
    let width = ENV_VARS.iter().map(|v| v.name.len()).max().unwrap_or(0);
    let mut out = format!("This application is configured via the environment. The following environment\nvariables can be used:\n\n{:<width$}  {}\n", "KEY", "DEFAULT / DESCRIPTION");
    for var in ENV_VARS {
        out.push_str(&format!("{:<width$}  {}\n", var.name, var.default));
        out.push_str(&format!("{:<width$}  {}\n", "", var.description));
    }
    out
}
