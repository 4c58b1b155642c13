//! Topic error types

use std::fmt;

/// Error type for topic operations
#[derive(Debug)]
pub enum TopicError {
    /// Connection error (Redis)
    Connection(String),
    /// Stream operation error
    Stream(String),
    /// Consumer group error
    ConsumerGroup(String),
    /// Configuration error
    Config(String),
}

impl TopicError {
    /// Whether a retry has a chance of succeeding
    pub fn is_transient(&self) -> bool {
        matches!(self, TopicError::Connection(_) | TopicError::Stream(_))
    }
}

impl std::error::Error for TopicError {}

impl fmt::Display for TopicError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TopicError::Connection(msg) => write!(f, "connection error: {}", msg),
            TopicError::Stream(msg) => write!(f, "stream error: {}", msg),
            TopicError::ConsumerGroup(msg) => write!(f, "consumer group error: {}", msg),
            TopicError::Config(msg) => write!(f, "configuration error: {}", msg),
        }
    }
}

impl From<deadpool_redis::PoolError> for TopicError {
    fn from(err: deadpool_redis::PoolError) -> Self {
        TopicError::Connection(err.to_string())
    }
}

impl From<deadpool_redis::redis::RedisError> for TopicError {
    fn from(err: deadpool_redis::redis::RedisError) -> Self {
        TopicError::Stream(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display() {
        assert_eq!(
            TopicError::Connection("refused".into()).to_string(),
            "connection error: refused"
        );
        assert_eq!(
            TopicError::ConsumerGroup("missing".into()).to_string(),
            "consumer group error: missing"
        );
    }

    #[test]
    fn test_is_transient() {
        assert!(TopicError::Connection("x".into()).is_transient());
        assert!(TopicError::Stream("x".into()).is_transient());
        assert!(!TopicError::Config("x".into()).is_transient());
    }
}
