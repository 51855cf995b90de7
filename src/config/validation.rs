//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (serde and the env parser handle syntax)
//! - Validate value ranges (lifetimes > 0, rates > 0)
//! - Reject configurations that cannot serve anything
//!
//! # Design Decisions
//! - Returns all validation errors, not just first
//! - Validation is pure function: RegistryConfig → Result<(), Vec<ValidationError>>
//! - Runs before config is accepted into the system

use std::collections::HashSet;

use thiserror::Error;

use crate::config::schema::RegistryConfig;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("listen_on must contain at least one address")]
    NoListeners,

    #[error("listen_on contains {0} more than once")]
    DuplicateListener(String),

    #[error("{0} must be greater than zero")]
    NotPositive(&'static str),

    #[error("{0} must not be empty")]
    Empty(&'static str),
}

pub fn validate_config(config: &RegistryConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    if config.listen_on.is_empty() {
        errors.push(ValidationError::NoListeners);
    }
    let mut seen = HashSet::new();
    for url in &config.listen_on {
        if !seen.insert(url) {
            errors.push(ValidationError::DuplicateListener(url.to_string()));
        }
    }

    if config.max_token_lifetime.is_zero() {
        errors.push(ValidationError::NotPositive("max_token_lifetime"));
    }
    if config.registry.expire_period.is_zero() {
        errors.push(ValidationError::NotPositive("expire_period"));
    }
    if config.kube.kubelet_qps == 0 {
        errors.push(ValidationError::NotPositive("kubelet_qps"));
    }
    if config.registry.namespace.trim().is_empty() {
        errors.push(ValidationError::Empty("namespace"));
    }
    if config.telemetry.metrics_enabled && config.telemetry.metrics_listen_on.trim().is_empty() {
        errors.push(ValidationError::Empty("metrics_listen_on"));
    }
    if config.diagnostics.enabled && config.diagnostics.listen_on.trim().is_empty() {
        errors.push(ValidationError::Empty("diagnostics listen_on"));
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}
