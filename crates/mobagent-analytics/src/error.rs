//! Analytics error types.

use thiserror::Error;

/// Errors raised inside the analytics core.
///
/// Validator rejections are not errors: they surface as `false`/`None`
/// returns. Everything here is either an input contract violation, a
/// programming error, or a storage failure.
#[derive(Debug, Error)]
pub enum AnalyticsError {
    /// Caller-supplied input broke a hard limit (oversized name or value).
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// An attribute with this name is already present on the event.
    #[error("duplicate attribute: {0}")]
    DuplicateAttribute(String),

    /// A persisted record or value stream could not be parsed.
    #[error("deserialization error: {0}")]
    Deserialization(String),

    /// The wall clock reads earlier than the session start.
    #[error("clock skew: now {now_ms}ms precedes session start {session_start_ms}ms")]
    ClockSkew { now_ms: u64, session_start_ms: u64 },

    /// An I/O error from the backing file.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration could not be parsed or failed validation.
    #[error("config error: {0}")]
    Config(String),

    /// The store's writer thread has already shut down.
    #[error("store closed: {0}")]
    StoreClosed(String),
}

impl From<toml::de::Error> for AnalyticsError {
    fn from(err: toml::de::Error) -> Self {
        AnalyticsError::Config(err.to_string())
    }
}

/// Convenience result type.
pub type Result<T> = std::result::Result<T, AnalyticsError>;
