//! Error taxonomy for the harness.
//!
//! Only conditions that make the rest of a scenario meaningless are errors.
//! A predicate that evaluates false is a [`crate::InvariantVerdict`], and a
//! business failure on the allow-list is classified by the checker, so neither
//! shows up here.

use std::time::Duration;

/// Errors that abort the current scenario.
#[derive(Debug, thiserror::Error)]
pub enum HarnessError {
    /// Connection refused, DNS failure, broken body stream.
    #[error("transport error on {method} {path}: {message}")]
    Transport {
        method: String,
        path: String,
        message: String,
    },

    /// The call did not complete within its absolute deadline.
    #[error("{method} {path} timed out after {timeout:?}")]
    Timeout {
        method: String,
        path: String,
        timeout: Duration,
    },

    /// Login or anti-forgery issuance failed, or a required cookie never appeared.
    #[error("auth error: {0}")]
    Auth(String),

    /// A response did not have the shape a step required.
    #[error("contract violation in {step}: {detail}")]
    ContractViolation { step: String, detail: String },

    /// The caller built a request the client refuses to send.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// Missing or unparsable configuration value.
    #[error("config error: {0}")]
    Config(String),
}

impl HarnessError {
    pub fn contract(step: impl Into<String>, detail: impl Into<String>) -> Self {
        Self::ContractViolation {
            step: step.into(),
            detail: detail.into(),
        }
    }

    /// Short symbolic code used when the error is folded into a failed batch entry.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Transport { .. } => "TRANSPORT_ERROR",
            Self::Timeout { .. } => "TIMEOUT",
            Self::Auth(_) => "AUTH_ERROR",
            Self::ContractViolation { .. } => "CONTRACT_VIOLATION",
            Self::InvalidRequest(_) => "INVALID_REQUEST",
            Self::Config(_) => "CONFIG_ERROR",
        }
    }
}

pub type Result<T, E = HarnessError> = std::result::Result<T, E>;
