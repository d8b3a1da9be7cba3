//! Error types surfaced by a breaker, and by configuration validation.

/// A breaker's error, wrapping either a rejection or the inner call's own error.
#[derive(Debug, thiserror::Error)]
pub enum Error<E> {
    /// The inner call ran and failed (or timed out); the inner error is preserved.
    #[error(transparent)]
    Inner(E),

    /// Admission was refused because the breaker is `Open`.
    #[error("call was rejected: circuit open")]
    Rejected,

    /// Admission was refused because the `HalfOpen` probe quota is exhausted.
    #[error("call was rejected: too many requests in half-open state")]
    TooManyRequests,

    /// Lazy breaker creation failed because the resolved resource configuration
    /// didn't revalidate.
    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl<E> Error<E> {
    /// `true` for any rejection variant (`Rejected` or `TooManyRequests`).
    pub fn is_rejected(&self) -> bool {
        matches!(self, Error::Rejected | Error::TooManyRequests)
    }

    /// Returns the inner error, if this is an `Inner` variant.
    pub fn into_inner(self) -> Option<E> {
        match self {
            Error::Inner(err) => Some(err),
            _ => None,
        }
    }
}

/// Raised when a `ManagerConfig` or `ResourceConfig` fails validation.
#[derive(Debug, thiserror::Error)]
#[error("invalid configuration for resource {resource:?}, field `{field}`: {reason}")]
pub struct ConfigError {
    /// Name of the offending resource, or `None` for the `default` config.
    pub resource: Option<String>,
    /// Name of the offending field.
    pub field: &'static str,
    /// Human-readable explanation.
    pub reason: String,
}

impl ConfigError {
    pub(crate) fn new(resource: Option<&str>, field: &'static str, reason: impl Into<String>) -> Self {
        Self {
            resource: resource.map(str::to_owned),
            field,
            reason: reason.into(),
        }
    }
}
