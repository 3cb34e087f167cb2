use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Clone, Error)]
pub enum TransportError {
    /// Connection, DNS, TLS or timeout failure
    #[error("network error: {0}")]
    Network(String),
    /// Server answered with a non-success status
    #[error("server returned HTTP {0}")]
    Status(u16),
    /// Response body was not the JSON we expected
    #[error("invalid response body: {0}")]
    Decode(String),
}

impl TransportError {
    /// Whether resending the same request later could succeed
    ///
    /// 4xx answers mean the request itself was rejected.
    pub fn is_retryable(&self) -> bool {
        match self {
            TransportError::Status(code) => !(400..500).contains(code),
            TransportError::Network(_) | TransportError::Decode(_) => true,
        }
    }
}

pub type TransportResult<T> = Result<T, TransportError>;

/// Request headers as ordered name/value pairs
pub type Headers = Vec<(&'static str, String)>;

/// HTTP surface used by the resolvers and the tracker
#[async_trait]
pub trait Transport: Send + Sync {
    /// GET `url` and decode the body as JSON
    async fn get_json(&self, url: &str, headers: Headers) -> TransportResult<Value>;

    /// POST `body` as JSON; any 2xx answer is success, the body is ignored
    async fn post_json(&self, url: &str, headers: Headers, body: &Value) -> TransportResult<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_errors_are_not_retryable() {
        assert!(!TransportError::Status(400).is_retryable());
        assert!(!TransportError::Status(413).is_retryable());
        assert!(TransportError::Status(503).is_retryable());
        assert!(TransportError::Network("reset".into()).is_retryable());
    }
}
