//! The continuation loop.
//!
//! A response starts with one generation call switched into a fresh
//! [`SwitchableStream`]. Each time a segment ends truncated the loop extends
//! the conversation with the partial answer and [`CONTINUE_PROMPT`], asks the
//! same source again and switches the new segment in, until the model
//! finishes or the segment ceiling is hit.
//!
//! [`CONTINUE_PROMPT`]: crate::CONTINUE_PROMPT

use std::collections::HashMap;
use std::sync::Arc;

use stitch_ai::{
    CredentialResolver, GenerationSource, Message, ModelConfig, Provider, ProviderRegistry,
    StreamOptions,
};
use tokio::sync::oneshot;
use tracing::Instrument;

use crate::{
    conversation::{Conversation, assemble_continuation},
    error::{Error, Result},
    segment::{FinishReason, Segment, SegmentResult},
    switchable::{SwitchableReader, SwitchableStream},
};

/// Process-wide budget for one response
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentLimits {
    /// Output tokens requested per generation call
    pub max_tokens: u32,
    /// Most segments one response may consist of
    pub max_segments: usize,
}

impl SegmentLimits {
    pub const DEFAULT_MAX_TOKENS: u32 = 8192;
    pub const DEFAULT_MAX_SEGMENTS: usize = 2;
}

impl Default for SegmentLimits {
    fn default() -> Self {
        Self {
            max_tokens: Self::DEFAULT_MAX_TOKENS,
            max_segments: Self::DEFAULT_MAX_SEGMENTS,
        }
    }
}

/// What the caller asked for
#[derive(Debug, Clone)]
pub struct GenerationRequest {
    pub messages: Vec<Message>,
    pub provider: Provider,
    pub model: Option<String>,
    /// Caller-supplied keys by provider id
    pub api_keys: Option<HashMap<String, String>>,
}

impl GenerationRequest {
    pub fn new(provider: Provider, messages: Vec<Message>) -> Self {
        Self {
            messages,
            provider,
            model: None,
            api_keys: None,
        }
    }
}

/// Starts segmented responses. Cheap to clone; shares nothing mutable.
#[derive(Clone)]
pub struct ContinuationController {
    registry: ProviderRegistry,
    credentials: CredentialResolver,
    limits: SegmentLimits,
    system_prompt: Option<String>,
}

impl ContinuationController {
    pub fn new(
        registry: ProviderRegistry,
        credentials: CredentialResolver,
        limits: SegmentLimits,
    ) -> Self {
        Self {
            registry,
            credentials,
            limits,
            system_prompt: None,
        }
    }

    /// Set the system prompt sent with every call
    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = Some(prompt.into());
        self
    }

    pub fn limits(&self) -> SegmentLimits {
        self.limits
    }

    pub fn credentials(&self) -> &CredentialResolver {
        &self.credentials
    }

    /// Start a response that continues truncated segments.
    ///
    /// Credentials are resolved and the first call is issued before this
    /// returns, so those failures surface here rather than in the stream.
    /// Everything after that is reported through the reader.
    pub async fn start(&self, request: GenerationRequest) -> Result<SwitchableReader> {
        self.launch(request, true).await
    }

    /// Start a response made of exactly one segment; truncation ends it cleanly.
    pub async fn start_single(&self, request: GenerationRequest) -> Result<SwitchableReader> {
        self.launch(request, false).await
    }

    async fn launch(
        &self,
        request: GenerationRequest,
        continue_truncated: bool,
    ) -> Result<SwitchableReader> {
        let api_key = self
            .credentials
            .resolve(request.provider, request.api_keys.as_ref())?;
        let source = self.registry.get(request.provider)?;

        let config = ModelConfig::new(request.provider, api_key, request.model);
        let options = StreamOptions {
            max_tokens: Some(self.limits.max_tokens),
            temperature: None,
        };
        let conversation = Conversation::new(self.system_prompt.clone(), request.messages);

        tracing::debug!(
            provider = %config.provider,
            model = config.model_id(),
            messages = conversation.len(),
            "starting response"
        );

        let first = generate(source.as_ref(), &config, &conversation, &options).await?;
        let (mut output, reader) = SwitchableStream::new();
        output.switch_source(first.chunks)?;

        let segments = SegmentLoop {
            source,
            config,
            options,
            limits: self.limits,
            continue_truncated,
        };
        tokio::spawn(
            segments
                .run(conversation, output, first.result)
                .in_current_span(),
        );

        Ok(reader)
    }
}

async fn generate(
    source: &dyn GenerationSource,
    config: &ModelConfig,
    conversation: &Conversation,
    options: &StreamOptions,
) -> Result<Segment> {
    let events = source.stream(config, conversation.context(), options).await?;
    Ok(Segment::from_events(events))
}

/// State owned by the task driving one response
struct SegmentLoop {
    source: Arc<dyn GenerationSource>,
    config: ModelConfig,
    options: StreamOptions,
    limits: SegmentLimits,
    continue_truncated: bool,
}

impl SegmentLoop {
    async fn run(
        self,
        mut conversation: Conversation,
        mut output: SwitchableStream,
        mut pending: oneshot::Receiver<SegmentResult>,
    ) {
        loop {
            let Ok(segment) = pending.await else {
                // The forwarder dropped the segment: the reader is gone.
                tracing::debug!("response abandoned by reader");
                return;
            };

            tracing::debug!(
                reason = ?segment.finish_reason,
                output_tokens = segment.usage.output,
                switches = output.switches(),
                "segment finished"
            );

            match segment.finish_reason {
                FinishReason::Completed => {
                    output.close();
                    return;
                }
                FinishReason::Errored(message) => {
                    tracing::warn!("Segment failed: {}", message);
                    output.close();
                    return;
                }
                FinishReason::Abnormal(reason) => {
                    tracing::warn!("Segment ended unexpectedly: {}", reason);
                    output.fail(Error::UnexpectedFinish(reason));
                    return;
                }
                FinishReason::Truncated if !self.continue_truncated => {
                    output.close();
                    return;
                }
                FinishReason::Truncated => {
                    let switches = output.switches();
                    if switches >= self.limits.max_segments {
                        tracing::warn!(
                            "Reached max token limit ({}) with no segments left",
                            self.limits.max_tokens
                        );
                        output.fail(Error::MaxSegmentsReached);
                        return;
                    }

                    if output.is_detached() {
                        tracing::debug!("reader gone, not continuing");
                        return;
                    }

                    tracing::info!(
                        "Reached max token limit ({}): Continuing message ({} switches left)",
                        self.limits.max_tokens,
                        self.limits.max_segments - switches
                    );

                    conversation = assemble_continuation(conversation, &segment.text);
                    let request = generate(
                        self.source.as_ref(),
                        &self.config,
                        &conversation,
                        &self.options,
                    );
                    let next = tokio::select! {
                        biased;
                        _ = output.detached() => {
                            tracing::debug!("reader gone during continuation request");
                            return;
                        }
                        next = request => next,
                    };
                    let next = match next {
                        Ok(next) => next,
                        Err(e) => {
                            tracing::warn!("Continuation request failed: {}", e);
                            output.fail(e);
                            return;
                        }
                    };

                    pending = next.result;
                    if output.switch_source(next.chunks).is_err() {
                        tracing::debug!("output closed before continuation");
                        return;
                    }
                }
            }
        }
    }
}
