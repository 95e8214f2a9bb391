use thiserror::Error;

/// Typed error hierarchy for keygate.
///
/// Use at module boundaries (provider calls, pool selection, run transitions).
/// Internal/leaf functions can continue using `anyhow::Result` — the `Internal`
/// variant allows seamless conversion via the `?` operator.
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Rate limit exceeded")]
    RateLimit { retry_after: Option<u64> },

    #[error("Transient provider error: {0}")]
    Transient(String),

    #[error("Authentication failed: {0}")]
    Auth(String),

    #[error("Client error: {0}")]
    Client(String),

    #[error("No available keys for provider '{provider}'")]
    NoKey { provider: String },

    #[error("Not found: {0}")]
    NotFound(String),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

/// Classification of an upstream failure, as seen by the key pool.
/// Drives cooling, disabling and retry decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    RateLimit,
    Transient,
    Authentication,
    Client,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::RateLimit => "rate_limit",
            Self::Transient => "transient",
            Self::Authentication => "authentication",
            Self::Client => "client",
        }
    }
}

impl GatewayError {
    /// The pool-facing error kind, for errors produced by a provider call.
    /// `None` for plumbing errors that never reach the failover loop.
    pub fn kind(&self) -> Option<ErrorKind> {
        match self {
            Self::RateLimit { .. } => Some(ErrorKind::RateLimit),
            Self::Transient(_) => Some(ErrorKind::Transient),
            Self::Auth(_) => Some(ErrorKind::Authentication),
            Self::Client(_) => Some(ErrorKind::Client),
            _ => None,
        }
    }

    /// Whether the operation may succeed if retried (on another key, or later).
    ///
    /// `Auth` is retryable at the request level: the key is dead, the request
    /// is not. `NoKey` is retryable over time — the worker re-enqueues on it.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::RateLimit { .. } | Self::Transient(_) | Self::Auth(_) | Self::NoKey { .. } => {
                true
            }
            Self::Client(_) | Self::Config(_) | Self::NotFound(_) | Self::Internal(_) => false,
        }
    }

    /// Retry-After hint carried by a rate-limit error, if any.
    pub fn retry_after(&self) -> Option<u64> {
        match self {
            Self::RateLimit { retry_after } => *retry_after,
            _ => None,
        }
    }
}

pub type GatewayResult<T> = std::result::Result<T, GatewayError>;
