use thiserror::Error;

/// Crate-wide error type.
///
/// Variants carry plain strings mapped at the boundary where the error
/// occurred; the few places that branch on error *kind* (agent recovery,
/// pipeline retries) use the structured sub-errors in `credentials` and
/// `index` instead.
#[derive(Debug, Clone, Error)]
pub enum OneboxError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("unauthorized")]
    Unauthorized,

    #[error("network error: {0}")]
    Network(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("parse error: {0}")]
    Parse(String),

    #[error("io error: {0}")]
    Io(String),
}

impl OneboxError {
    /// Whether an agent may recover from this error via the backoff ladder.
    /// Authorization failures require a new credential and a manual restart.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, OneboxError::Unauthorized)
    }
}

impl From<std::io::Error> for OneboxError {
    fn from(err: std::io::Error) -> Self {
        OneboxError::Io(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unauthorized_is_not_retryable() {
        assert!(!OneboxError::Unauthorized.is_retryable());
        assert!(OneboxError::Network("reset".into()).is_retryable());
        assert!(OneboxError::Protocol("bad tag".into()).is_retryable());
    }
}
