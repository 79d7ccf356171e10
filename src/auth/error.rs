//! Error taxonomy for credential refresh

use std::io;

use thiserror::Error;

/// Failure of a single authentication step.
///
/// Every variant is recoverable at the coordinator level: a failed strategy
/// is logged and the next one is attempted.
#[derive(Debug, Error)]
pub enum AuthError {
    /// Malformed or error-bearing identity provider response.
    #[error("{0}")]
    Protocol(String),

    /// Device-code session elapsed, or the provider declared expiry/decline.
    #[error("{0}")]
    Expired(String),

    /// The surrounding operation was cancelled or timed out.
    #[error("authentication cancelled: {0}")]
    Cancelled(String),

    /// No viable fallback execution strategy was found.
    #[error("{0}")]
    ToolchainMissing(String),

    /// A chosen strategy's process exited with failure.
    #[error("{step} failed ({status}){}", format_output(.output))]
    Execution {
        step: String,
        status: String,
        output: String,
    },

    /// Embedded-display prerequisites are absent on this host.
    #[error("{0}")]
    EnvironmentUnsupported(String),

    /// Writing a token file failed.
    #[error("failed to persist {name} token: {source}")]
    Persistence {
        name: String,
        #[source]
        source: io::Error,
    },

    #[error("request to identity provider failed: {0}")]
    Http(#[from] reqwest::Error),
}

fn format_output(output: &str) -> String {
    if output.is_empty() {
        String::new()
    } else {
        format!(" (output: {})", output)
    }
}

impl AuthError {
    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::Protocol(msg.into())
    }

    pub fn toolchain_missing(msg: impl Into<String>) -> Self {
        Self::ToolchainMissing(msg.into())
    }

    pub fn unsupported(msg: impl Into<String>) -> Self {
        Self::EnvironmentUnsupported(msg.into())
    }

    /// Short machine-friendly kind, used as a structured log field.
    pub fn kind(&self) -> &'static str {
        match self {
            AuthError::Protocol(_) => "protocol",
            AuthError::Expired(_) => "expired",
            AuthError::Cancelled(_) => "cancelled",
            AuthError::ToolchainMissing(_) => "toolchain_missing",
            AuthError::Execution { .. } => "execution",
            AuthError::EnvironmentUnsupported(_) => "environment_unsupported",
            AuthError::Persistence { .. } => "persistence",
            AuthError::Http(_) => "http",
        }
    }
}
