//! Error taxonomy for the ingestion, query and delivery pipelines.
//!
//! Every library operation returns [`Result<T>`] over [`RagError`]. Callers
//! branch on [`RagError::kind`] rather than on individual variants: an
//! [`ErrorKind::Input`] failure is the caller's fault and must not be
//! retried, an [`ErrorKind::Dependency`] failure means an external service
//! (embedding API, LLM, index backend) is degraded and may be retried, and
//! so on.
//!
//! A query that simply finds nothing is **not** an error; it produces the
//! fixed "no information" answer. This keeps "nothing found" and "system
//! degraded" distinguishable for user interfaces.

use std::fmt;
use std::time::Duration;

use thiserror::Error;

/// The external service behind a [`RagError::Dependency`] failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Service {
    Embedding,
    Llm,
}

impl fmt::Display for Service {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Service::Embedding => write!(f, "embedding provider"),
            Service::Llm => write!(f, "language model"),
        }
    }
}

/// Coarse classification used for retry decisions and HTTP status mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Malformed request or document. Never retried.
    Input,
    /// An external service is unreachable, failing or rate limited.
    Dependency,
    /// Frame delivery failed after the whole-message retry.
    Transport,
    /// The caller cancelled the operation or its deadline passed.
    Cancelled,
    /// The referenced document does not exist.
    NotFound,
    /// Inconsistent state that retrying cannot fix.
    Fatal,
}

#[derive(Debug, Error)]
pub enum RagError {
    #[error("invalid input: {0}")]
    Input(String),

    #[error("{service} unavailable: {message}")]
    Dependency { service: Service, message: String },

    #[error("embedding dimension mismatch: index holds {expected}-d vectors, got {actual}-d")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("vector index unavailable: {0}")]
    IndexUnavailable(String),

    #[error("frame delivery failed after {attempts} attempt(s): {message}")]
    Transport { attempts: u32, message: String },

    #[error("operation cancelled")]
    Cancelled,

    #[error("operation timed out after {0:?}")]
    Timeout(Duration),

    #[error("document not found: {0}")]
    NotFound(String),

    #[error("internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, RagError>;

impl RagError {
    pub fn input(message: impl Into<String>) -> Self {
        RagError::Input(message.into())
    }

    pub fn embedding(message: impl Into<String>) -> Self {
        RagError::Dependency {
            service: Service::Embedding,
            message: message.into(),
        }
    }

    pub fn llm(message: impl Into<String>) -> Self {
        RagError::Dependency {
            service: Service::Llm,
            message: message.into(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            RagError::Input(_) => ErrorKind::Input,
            RagError::Dependency { .. } | RagError::IndexUnavailable(_) => ErrorKind::Dependency,
            RagError::Transport { .. } => ErrorKind::Transport,
            RagError::Cancelled | RagError::Timeout(_) => ErrorKind::Cancelled,
            RagError::NotFound(_) => ErrorKind::NotFound,
            RagError::DimensionMismatch { .. } | RagError::Internal(_) => ErrorKind::Fatal,
        }
    }

    /// Whether the same call may succeed if repeated later.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            RagError::Dependency { .. } | RagError::IndexUnavailable(_) | RagError::Timeout(_)
        )
    }
}

impl From<sqlx::Error> for RagError {
    fn from(err: sqlx::Error) -> Self {
        RagError::IndexUnavailable(err.to_string())
    }
}
