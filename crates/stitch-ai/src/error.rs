//! Error types for stitch-ai

use thiserror::Error;

use crate::types::Provider;

/// Result type alias using stitch-ai Error
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur before a generation stream is running.
///
/// Failures once the stream has started are reported as
/// [`MessageEvent::Error`](crate::stream::MessageEvent::Error) instead.
#[derive(Error, Debug)]
pub enum Error {
    /// No usable API key for the selected provider
    #[error("No API key found for provider: {0}")]
    MissingApiKey(Provider),

    /// Server-sent events error
    #[error("SSE error: {0}")]
    Sse(String),

    /// Provider not supported
    #[error("Unsupported AI provider: {0}")]
    UnsupportedProvider(String),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl Error {
    /// Whether this error means the caller has no usable credential.
    pub fn is_credential(&self) -> bool {
        matches!(self, Error::MissingApiKey(_))
    }
}
