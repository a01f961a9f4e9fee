use std::sync::Arc;

use redis_protocol::error::RedisProtocolError;

pub type Result<T> = std::result::Result<T, EngineError>;

/// Errors surfaced by engine operations.
///
/// The enum is `Clone` on purpose: one transport failure is fanned out to
/// every request of the batch that was in flight when it happened.
#[derive(thiserror::Error, Debug, Clone)]
pub enum EngineError {
    #[error("store i/o: {0}")]
    Io(#[source] Arc<std::io::Error>),
    #[error("store protocol: {0}")]
    Protocol(String),
    #[error("store error: {0}")]
    Store(String),
    #[error("connection closed by store")]
    ConnectionClosed,
    #[error("operation timed out")]
    Timeout,
    #[error("encode: {0}")]
    Encode(Arc<anyhow::Error>),
    #[error("server-side script not loaded")]
    ScriptNotLoaded,
    #[error("engine is shut down")]
    Shutdown,
    #[error("engine already running")]
    AlreadyRunning,
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("reply dropped before completion")]
    ReplyDropped,
}

impl EngineError {
    /// True when the store reported a missing script (`NOSCRIPT`). The
    /// owning pipeline finishes its batch and exits so the supervised
    /// restart reloads scripts.
    pub fn is_no_script(&self) -> bool {
        matches!(self, EngineError::Store(message) if message.starts_with("NOSCRIPT"))
    }

    pub(crate) fn encode(err: anyhow::Error) -> Self {
        EngineError::Encode(Arc::new(err))
    }
}

impl From<std::io::Error> for EngineError {
    fn from(err: std::io::Error) -> Self {
        EngineError::Io(Arc::new(err))
    }
}

impl From<RedisProtocolError> for EngineError {
    fn from(err: RedisProtocolError) -> Self {
        EngineError::Protocol(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::EngineError;

    #[test]
    fn no_script_is_detected_from_store_errors() {
        let err = EngineError::Store("NOSCRIPT No matching script.".to_string());
        assert!(err.is_no_script());
        assert!(!EngineError::Store("ERR wrong number of arguments".to_string()).is_no_script());
        assert!(!EngineError::Timeout.is_no_script());
    }

    #[test]
    fn errors_clone_for_batch_fanout() {
        let err: EngineError = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "gone").into();
        let copy = err.clone();
        assert_eq!(err.to_string(), copy.to_string());
    }
}
