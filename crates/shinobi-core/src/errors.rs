use std::time::Duration;

/// How a caller that owns the retry decision should treat a gateway failure.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FailureClass {
    /// The same request will fail again.
    Fatal,
    /// May succeed if sent again later.
    Transient,
    /// Raised on the caller's behalf: a deadline or a cancellation.
    Operational,
}

/// Failures reported by a [`ModelGateway`](crate::gateway::ModelGateway).
///
/// The gateway decides the [`FailureClass`]. Specialists never retry; a
/// retrying gateway wrapper or an enclosing workflow policy reads the class.
#[derive(Clone, Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("authentication failed: {0}")]
    AuthenticationFailed(String),
    #[error("request does not fit the context window ({actual} of {limit} tokens)")]
    ContextWindowExceeded { limit: usize, actual: usize },
    #[error("request rejected: {0}")]
    InvalidRequest(String),

    #[error("rate limited")]
    RateLimited { retry_after: Option<Duration> },
    #[error("provider returned {status}: {body}")]
    ServerError { status: u16, body: String },
    #[error("provider overloaded")]
    ProviderOverloaded,
    #[error("network failure: {0}")]
    NetworkError(String),

    #[error("no response within {0:?}")]
    Timeout(Duration),
    #[error("cancelled")]
    Cancelled,
}

impl GatewayError {
    pub fn class(&self) -> FailureClass {
        match self {
            Self::AuthenticationFailed(_) | Self::ContextWindowExceeded { .. } | Self::InvalidRequest(_) => {
                FailureClass::Fatal
            }
            Self::RateLimited { .. } | Self::ServerError { .. } | Self::ProviderOverloaded | Self::NetworkError(_) => {
                FailureClass::Transient
            }
            Self::Timeout(_) | Self::Cancelled => FailureClass::Operational,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.class() == FailureClass::Transient
    }

    pub fn is_fatal(&self) -> bool {
        self.class() == FailureClass::Fatal
    }

    /// Provider-requested wait before the next attempt.
    pub fn suggested_delay(&self) -> Option<Duration> {
        match self {
            Self::RateLimited { retry_after } => *retry_after,
            _ => None,
        }
    }

    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::AuthenticationFailed(_) => "authentication_failed",
            Self::ContextWindowExceeded { .. } => "context_window_exceeded",
            Self::InvalidRequest(_) => "invalid_request",
            Self::RateLimited { .. } => "rate_limited",
            Self::ServerError { .. } => "server_error",
            Self::ProviderOverloaded => "provider_overloaded",
            Self::NetworkError(_) => "network_error",
            Self::Timeout(_) => "timeout",
            Self::Cancelled => "cancelled",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn all() -> Vec<GatewayError> {
        vec![
            GatewayError::AuthenticationFailed("bad key".into()),
            GatewayError::ContextWindowExceeded { limit: 8, actual: 9 },
            GatewayError::InvalidRequest("bad".into()),
            GatewayError::RateLimited { retry_after: None },
            GatewayError::ServerError { status: 503, body: "down".into() },
            GatewayError::ProviderOverloaded,
            GatewayError::NetworkError("reset".into()),
            GatewayError::Timeout(Duration::from_secs(1)),
            GatewayError::Cancelled,
        ]
    }

    #[test]
    fn every_error_has_exactly_one_class() {
        let classes: Vec<FailureClass> = all().iter().map(GatewayError::class).collect();
        use FailureClass::*;
        assert_eq!(
            classes,
            vec![Fatal, Fatal, Fatal, Transient, Transient, Transient, Transient, Operational, Operational]
        );
        for err in all() {
            assert!(!(err.is_fatal() && err.is_retryable()), "{err}");
        }
    }

    #[test]
    fn suggested_delay_only_for_rate_limit() {
        let rl = GatewayError::RateLimited { retry_after: Some(Duration::from_secs(2)) };
        assert_eq!(rl.suggested_delay(), Some(Duration::from_secs(2)));
        assert_eq!(GatewayError::ProviderOverloaded.suggested_delay(), None);
    }

    #[test]
    fn context_window_message_names_both_sizes() {
        let err = GatewayError::ContextWindowExceeded { limit: 8, actual: 9 };
        assert_eq!(err.to_string(), "request does not fit the context window (9 of 8 tokens)");
        assert_eq!(err.error_kind(), "context_window_exceeded");
    }
}
