//! Error types for stitch-stream

use thiserror::Error;

/// Result type alias using stitch-stream Error
pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised while producing a segmented response
#[derive(Error, Debug)]
pub enum Error {
    /// An error from the provider layer (credentials, unknown provider, request setup)
    #[error(transparent)]
    Ai(#[from] stitch_ai::Error),

    /// The active generation source failed mid-segment
    #[error("Generation failed: {0}")]
    Generation(String),

    /// Every permitted segment ended truncated
    #[error("Cannot continue message: Maximum segments reached")]
    MaxSegmentsReached,

    /// A segment ended for a reason that is neither success nor truncation
    #[error("Unexpected finish reason: {0}")]
    UnexpectedFinish(String),

    /// The output stream no longer accepts sources
    #[error("Stream closed")]
    StreamClosed,

    /// The controller went away without closing the stream
    #[error("Stream abandoned before completion")]
    Abandoned,
}

impl Error {
    /// Whether the failure is a missing or rejected credential
    pub fn is_credential(&self) -> bool {
        match self {
            Error::Ai(e) => e.is_credential(),
            _ => false,
        }
    }
}
