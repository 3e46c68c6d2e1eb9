#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    #[error("connection error: {0}")]
    Connect(String),

    #[error("HTTP error: {status} - {body}")]
    Http { status: u16, body: String },

    #[error("rate limited, retry after {retry_after_ms}ms")]
    RateLimited { retry_after_ms: u64 },

    #[error("deserialization error: {0}")]
    Deserialization(String),

    #[error("context window exceeded: {0}")]
    ContextOverflow(String),
}

impl ProviderError {
    /// Transient failures worth retrying: connection problems, 5xx, and 429.
    /// Other 4xx and malformed-payload errors indicate caller bugs.
    pub fn is_retryable(&self) -> bool {
        match self {
            ProviderError::Connect(_) => true,
            ProviderError::Http { status, .. } => *status >= 500 || *status == 429,
            ProviderError::RateLimited { .. } => true,
            ProviderError::Deserialization(_) => false,
            ProviderError::ContextOverflow(_) => false,
        }
    }

    pub fn retry_after_ms(&self) -> Option<u64> {
        match self {
            ProviderError::RateLimited { retry_after_ms } => Some(*retry_after_ms),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_classification() {
        assert!(ProviderError::Connect("refused".into()).is_retryable());
        assert!(ProviderError::Http { status: 503, body: String::new() }.is_retryable());
        assert!(ProviderError::Http { status: 429, body: String::new() }.is_retryable());
        assert!(ProviderError::RateLimited { retry_after_ms: 100 }.is_retryable());
        assert!(!ProviderError::Http { status: 400, body: String::new() }.is_retryable());
        assert!(!ProviderError::Http { status: 404, body: String::new() }.is_retryable());
        assert!(!ProviderError::Deserialization("bad json".into()).is_retryable());
    }

    #[test]
    fn retry_after_only_for_rate_limits() {
        assert_eq!(
            ProviderError::RateLimited { retry_after_ms: 1500 }.retry_after_ms(),
            Some(1500)
        );
        assert_eq!(
            ProviderError::Http { status: 500, body: String::new() }.retry_after_ms(),
            None
        );
    }
}
