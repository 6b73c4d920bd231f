//! stitch-stream: segmented response streaming
//!
//! A model that stops at its output token budget leaves the answer
//! unfinished. This crate keeps one byte stream open towards the client
//! while successive generation calls are swapped in behind it:
//!
//! - [`SwitchableStream`] / [`SwitchableReader`]: one output, many sources
//! - [`Segment`]: one generation call split into bytes and a final result
//! - [`assemble_continuation`]: the history fed to the next call
//! - [`ContinuationController`]: the loop deciding when to continue

pub mod controller;
pub mod conversation;
pub mod error;
pub mod segment;
pub mod switchable;

pub use controller::{ContinuationController, GenerationRequest, SegmentLimits};
pub use conversation::{CONTINUE_PROMPT, Conversation, assemble_continuation};
pub use error::{Error, Result};
pub use segment::{FinishReason, Segment, SegmentResult};
pub use switchable::{ChunkStream, SwitchableReader, SwitchableStream};
