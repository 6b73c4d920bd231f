//! stitch-ai: chat message model and pluggable LLM generation sources
//!
//! Each provider (Anthropic, Gemini, OpenRouter, Groq) is exposed through the
//! [`GenerationSource`] trait, which turns a conversation into a stream of
//! [`stream::MessageEvent`]s for exactly one response segment.

pub mod credentials;
pub mod error;
pub mod models;
pub mod providers;
pub mod stream;
pub mod types;

pub use credentials::CredentialResolver;
pub use error::{Error, Result};
pub use providers::{GenerationSource, ProviderRegistry};
pub use stream::MessageEventStream;
pub use types::*;
