//! Error types for the LATS service.
//!
//! One variant per row of the error taxonomy: LM transport, unparsable LM
//! output, executor transport, session lookup, and gateway-level request
//! errors all get their own variant so callers can match on `error_type()`
//! without string-sniffing a message.

use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum LatsError {
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("search timeout after {0:?}")]
    SearchTimeout(Duration),

    #[error("node not found: {0}")]
    NodeNotFound(String),

    #[error("language model transport error: {0}")]
    LmTransport(String),

    #[error("language model response could not be parsed as JSON: {0}")]
    LmUnparsable(String),

    #[error("coverage executor transport error: {0}")]
    ExecutorTransport(String),

    #[error("session not found: {0}")]
    SessionNotFound(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("initialization error: {0}")]
    Initialization(String),

    #[error("concurrency error: {0}")]
    Concurrency(String),

    #[error("unexpected error: {0}")]
    Unexpected(String),
}

impl LatsError {
    pub fn config_error(msg: impl Into<String>) -> Self {
        Self::InvalidConfig(msg.into())
    }

    pub fn timeout_error(duration: Duration) -> Self {
        Self::SearchTimeout(duration)
    }

    pub fn node_not_found(node_id: impl Into<String>) -> Self {
        Self::NodeNotFound(node_id.into())
    }

    pub fn lm_transport(msg: impl Into<String>) -> Self {
        Self::LmTransport(msg.into())
    }

    pub fn lm_unparsable(msg: impl Into<String>) -> Self {
        Self::LmUnparsable(msg.into())
    }

    pub fn executor_transport(msg: impl Into<String>) -> Self {
        Self::ExecutorTransport(msg.into())
    }

    pub fn session_not_found(session_id: impl Into<String>) -> Self {
        Self::SessionNotFound(session_id.into())
    }

    pub fn invalid_request(msg: impl Into<String>) -> Self {
        Self::InvalidRequest(msg.into())
    }

    pub fn concurrency_error(msg: impl Into<String>) -> Self {
        Self::Concurrency(msg.into())
    }

    pub fn unexpected(msg: impl Into<String>) -> Self {
        Self::Unexpected(msg.into())
    }

    /// Convert to a JSON-serializable error for HTTP responses.
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::json!({
            "type": self.error_type(),
            "message": self.to_string(),
            "timestamp": chrono::Utc::now().to_rfc3339(),
        })
    }

    pub fn error_type(&self) -> &'static str {
        match self {
            Self::InvalidConfig(_) => "InvalidConfig",
            Self::SearchTimeout(_) => "SearchTimeout",
            Self::NodeNotFound(_) => "NodeNotFound",
            Self::LmTransport(_) => "LmTransport",
            Self::LmUnparsable(_) => "LmUnparsable",
            Self::ExecutorTransport(_) => "ExecutorTransport",
            Self::SessionNotFound(_) => "SessionNotFound",
            Self::InvalidRequest(_) => "InvalidRequest",
            Self::Serialization(_) => "Serialization",
            Self::Io(_) => "Io",
            Self::Initialization(_) => "Initialization",
            Self::Concurrency(_) => "Concurrency",
            Self::Unexpected(_) => "Unexpected",
        }
    }

    /// Whether a caller could reasonably retry the operation that produced
    /// this error. Transport-shaped errors are recoverable; data/validation
    /// errors are not.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::SearchTimeout(_)
                | Self::LmTransport(_)
                | Self::ExecutorTransport(_)
                | Self::Concurrency(_)
                | Self::Io(_)
        )
    }
}

pub type LatsResult<T> = Result<T, LatsError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_creation_and_classification() {
        let config_err = LatsError::config_error("invalid max_iterations");
        assert_eq!(config_err.error_type(), "InvalidConfig");
        assert!(!config_err.is_recoverable());

        let timeout_err = LatsError::timeout_error(Duration::from_secs(30));
        assert_eq!(timeout_err.error_type(), "SearchTimeout");
        assert!(timeout_err.is_recoverable());
    }

    #[test]
    fn json_serialization() {
        let err = LatsError::lm_transport("connection reset");
        let json = err.to_json();
        assert_eq!(json["type"], "LmTransport");
        assert!(json["message"].as_str().unwrap().contains("connection reset"));
        assert!(json["timestamp"].is_string());
    }

    #[test]
    fn recoverability_matches_taxonomy() {
        assert!(LatsError::executor_transport("refused").is_recoverable());
        assert!(!LatsError::invalid_request("missing field").is_recoverable());
        assert!(!LatsError::session_not_found("abc").is_recoverable());
    }
}
