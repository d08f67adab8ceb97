//! Error taxonomy shared by the ingestion and query pipelines.
//!
//! Every error carries a stable machine-readable code alongside the human
//! message, so callers can branch on the code without string matching the
//! message text. Validation and configuration errors abort a pipeline
//! immediately; upstream errors are tolerated only inside the retrieval
//! fan-out's partial-failure window.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Stable error codes surfaced to callers.
pub mod codes {
    pub const BOT_ID_MISSING: &str = "BOT_ID_MISSING";
    pub const MESSAGE_MISSING: &str = "MESSAGE_MISSING";
    pub const DOC_CONTENT_MISSING: &str = "DOC_CONTENT_MISSING";
    pub const DOC_TOO_LARGE: &str = "DOC_TOO_LARGE";
    pub const VECTOR_SCOPE_MISSING: &str = "VECTOR_SCOPE_MISSING";
    pub const CHUNK_NOT_FOUND: &str = "CHUNK_NOT_FOUND";
    pub const IDEMPOTENCY_CONFLICT: &str = "IDEMPOTENCY_CONFLICT";
    pub const PARSE_FAILED: &str = "PARSE_FAILED";
    pub const URL_FETCH_FAILED: &str = "URL_FETCH_FAILED";
    pub const EMBEDDING_UPSTREAM: &str = "EMBEDDING_UPSTREAM";
    pub const EMBEDDING_COUNT_MISMATCH: &str = "EMBEDDING_COUNT_MISMATCH";
    pub const GENERATION_UPSTREAM: &str = "GENERATION_UPSTREAM";
    pub const VECTOR_UPSTREAM: &str = "VECTOR_UPSTREAM";
    pub const QUEUE_UPSTREAM: &str = "QUEUE_UPSTREAM";
    pub const CONFIG_INVALID: &str = "CONFIG_INVALID";
}

/// Error kinds for the toolkit.
///
/// The five variants mirror how callers are expected to react: fix the
/// request (`Validation`), fix the reference (`NotFound`), retry with a new
/// key (`Conflict`), treat as an internal dependency failure (`Upstream`),
/// or fix the deployment (`Config`).
#[derive(Debug, Error)]
pub enum Error {
    #[error("{code}: {message}")]
    Validation { code: &'static str, message: String },

    #[error("{code}: {message}")]
    NotFound { code: &'static str, message: String },

    #[error("{code}: {message}")]
    Conflict { code: &'static str, message: String },

    #[error("{code}: {message}")]
    Upstream { code: &'static str, message: String },

    #[error("{code}: {message}")]
    Config { code: &'static str, message: String },
}

impl Error {
    pub fn validation(code: &'static str, message: impl Into<String>) -> Self {
        Self::Validation {
            code,
            message: message.into(),
        }
    }

    pub fn not_found(code: &'static str, message: impl Into<String>) -> Self {
        Self::NotFound {
            code,
            message: message.into(),
        }
    }

    pub fn conflict(code: &'static str, message: impl Into<String>) -> Self {
        Self::Conflict {
            code,
            message: message.into(),
        }
    }

    pub fn upstream(code: &'static str, message: impl Into<String>) -> Self {
        Self::Upstream {
            code,
            message: message.into(),
        }
    }

    pub fn config(code: &'static str, message: impl Into<String>) -> Self {
        Self::Config {
            code,
            message: message.into(),
        }
    }

    /// The stable code attached to this error.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Validation { code, .. }
            | Self::NotFound { code, .. }
            | Self::Conflict { code, .. }
            | Self::Upstream { code, .. }
            | Self::Config { code, .. } => code,
        }
    }

    /// True when the caller can fix the request and retry.
    pub fn is_validation(&self) -> bool {
        matches!(self, Self::Validation { .. })
    }
}

impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        Self::upstream(codes::VECTOR_UPSTREAM, err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_code_roundtrip() {
        let err = Error::validation(codes::BOT_ID_MISSING, "bot id is required");
        assert_eq!(err.code(), "BOT_ID_MISSING");
        assert!(err.is_validation());
        assert_eq!(err.to_string(), "BOT_ID_MISSING: bot id is required");
    }

    #[test]
    fn test_upstream_not_validation() {
        let err = Error::upstream(codes::EMBEDDING_COUNT_MISMATCH, "got 3, want 4");
        assert!(!err.is_validation());
        assert_eq!(err.code(), "EMBEDDING_COUNT_MISMATCH");
    }
}
