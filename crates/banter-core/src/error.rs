use thiserror::Error;

/// Coarse failure classification that drives retry and breaker policy.
///
/// Every crate-level error maps into exactly one kind via [`Classify`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Retryable: model/network/store timeouts and transport failures.
    TransientExternal,
    /// Not retryable: the external service answered with an invalid shape.
    PermanentExternal,
    /// A stored invariant is violated — fatal at the component level.
    DataCorrupt,
    /// Queue full, cache full, breaker open.
    ResourceExhausted,
    /// Unknown tool, unknown fact type, unsupported operation.
    Unsupported,
    /// The surrounding task was cancelled.
    Cancelled,
}

impl ErrorKind {
    /// Whether a failure of this kind should count against a circuit breaker.
    pub fn is_breaker_eligible(&self) -> bool {
        matches!(self, ErrorKind::TransientExternal)
    }

    /// Whether the operation may be retried at all.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ErrorKind::TransientExternal | ErrorKind::ResourceExhausted
        )
    }
}

/// Implemented by every crate error so callers can apply uniform policy
/// without matching on foreign enums.
pub trait Classify {
    fn kind(&self) -> ErrorKind;
}

/// Errors owned by `banter-core` itself.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl Classify for CoreError {
    fn kind(&self) -> ErrorKind {
        match self {
            CoreError::Config(_) => ErrorKind::Unsupported,
            CoreError::Serialization(_) => ErrorKind::PermanentExternal,
        }
    }
}

pub type Result<T> = std::result::Result<T, CoreError>;
