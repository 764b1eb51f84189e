//! Error types for admission control
use thiserror::Error;

/// Boxed error as produced by arbitrary store backends.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// The shared store could not be reached or reported an error.
///
/// Engines never retry; the decision fails loudly and the caller decides.
#[derive(Debug, Error)]
#[error("store unavailable: {source}")]
pub struct StoreError {
    #[source]
    source: BoxError,
}

impl StoreError {
    pub fn new(source: impl Into<BoxError>) -> Self {
        Self { source: source.into() }
    }

    /// Borrow the backend error.
    pub fn backend(&self) -> &(dyn std::error::Error + Send + Sync + 'static) {
        self.source.as_ref()
    }
}

/// Errors produced when validating engine configuration.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConfigError {
    /// Window duration must be > 0.
    #[error("window_ms must be > 0 (got {provided})")]
    InvalidWindow {
        /// Value provided by caller.
        provided: u64,
    },
    /// Refill rate must be finite and non-negative.
    #[error("refill_rate must be finite and >= 0 (got {provided})")]
    InvalidRefillRate {
        /// Value provided by caller.
        provided: f64,
    },
    /// Idle TTL must be > 0.
    #[error("ttl_ms must be > 0 (got {provided})")]
    InvalidTtl {
        /// Value provided by caller.
        provided: u64,
    },
}

/// Failures that prevent an admission decision from being made.
///
/// A denial is not an error; it is reported through [`crate::Decision`].
#[derive(Debug, Error)]
pub enum AdmissionError {
    /// No client identity could be derived from the request.
    #[error("client identity is required")]
    ClientIdentityMissing,
    /// The shared store failed during the decision.
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl AdmissionError {
    /// Check if this error is due to a missing client identity
    pub fn is_client_identity_missing(&self) -> bool {
        matches!(self, Self::ClientIdentityMissing)
    }

    /// Check if this error is due to a store failure
    pub fn is_store(&self) -> bool {
        matches!(self, Self::Store(_))
    }

    /// Borrow the store error if present.
    pub fn as_store(&self) -> Option<&StoreError> {
        match self {
            Self::Store(e) => Some(e),
            _ => None,
        }
    }
}
