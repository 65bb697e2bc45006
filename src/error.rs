//! Error types for brokerq.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("queue not found: {0}")]
    NotFound(String),

    #[error("broker error: {0}")]
    Broker(String),

    #[error("malformed message: {0}")]
    MalformedMessage(String),

    #[error("setup failed: {0}")]
    Setup(String),

    #[error("queue {0} is already consuming")]
    AlreadyConsuming(String),

    #[error("invalid policy document: {0}")]
    Policy(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Whether this error came from the broker and may succeed on retry.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::Broker(_))
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_broker_errors_are_transient() {
        assert!(Error::Broker("throttled".to_string()).is_transient());
        assert!(!Error::NotFound("orders".to_string()).is_transient());
        assert!(!Error::MalformedMessage("x".to_string()).is_transient());
    }
}
