use crate::protocol::ErrorCode;
use thiserror::Error;

pub type AgentResult<T> = std::result::Result<T, AgentError>;

/// Failures surfaced by the agent client, registry and server lifecycle.
///
/// Variants carry rendered messages rather than source errors so results can
/// be shared between callers waiting on the same connection attempt.
#[derive(Debug, Clone, Error)]
pub enum AgentError {
    #[error("config error: {message}")]
    Config { message: String },
    #[error("connection error: {message}")]
    Connection { message: String },
    #[error("agent connection closed")]
    ConnectionClosed,
    #[error("agent error ({code}): {message}")]
    Remote { code: ErrorCode, message: String },
    #[error("invalid ciphertext: {message}")]
    Validation { message: String },
    #[error("symmetric key not found for revision {revision}")]
    KeyNotFound { revision: u64 },
    #[error("key store error: {message}")]
    KeyStore { message: String },
    #[error("protocol error: {message}")]
    Protocol { message: String },
    #[error("timeout after {timeout_ms}ms waiting for {operation} reply")]
    Timeout { operation: String, timeout_ms: u64 },
    #[error("secret agent usage is disabled")]
    Disabled,
}

impl AgentError {
    pub(crate) fn config(err: impl std::fmt::Display) -> Self {
        Self::Config {
            message: format!("{err:#}"),
        }
    }

    pub(crate) fn connection(err: impl std::fmt::Display) -> Self {
        Self::Connection {
            message: format!("{err:#}"),
        }
    }

    pub(crate) fn protocol(err: impl std::fmt::Display) -> Self {
        Self::Protocol {
            message: format!("{err:#}"),
        }
    }

    /// True when the failure means the connection is gone and a fresh one is needed.
    pub fn is_closed(&self) -> bool {
        matches!(self, Self::ConnectionClosed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_keeps_anyhow_context_chain() {
        let err = anyhow::anyhow!("bad json").context("failed to read settings.json");
        let mapped = AgentError::config(err);
        assert_eq!(
            mapped.to_string(),
            "config error: failed to read settings.json: bad json"
        );
    }

    #[test]
    fn remote_error_includes_code() {
        let err = AgentError::Remote {
            code: ErrorCode::HandlerFailed,
            message: "decryption failed".into(),
        };
        assert_eq!(
            err.to_string(),
            "agent error (handler_failed): decryption failed"
        );
    }
}
