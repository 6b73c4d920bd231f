//! Anthropic Claude API provider

use crate::{
    error::Result,
    providers::{GenerationSource, describe_sse_error, insert_header},
    stream::{MessageEvent, MessageEventStream},
    types::{Context, Message, ModelConfig, Role, StopReason, StreamOptions, Usage},
};
use async_stream::stream;
use async_trait::async_trait;
use futures::StreamExt;
use reqwest::header::HeaderMap;
use reqwest_eventsource::{Event, EventSource};
use serde::{Deserialize, Serialize};
use serde_json::json;

const ANTHROPIC_VERSION: &str = "2023-06-01";
/// Lifts the 4096 output token cap on Claude 3.5 Sonnet
const MAX_TOKENS_BETA: &str = "max-tokens-3-5-sonnet-2024-07-15";
const DEFAULT_MAX_TOKENS: u32 = 4096;

/// Anthropic API client
pub struct AnthropicProvider {
    client: reqwest::Client,
    base_url: String,
}

impl AnthropicProvider {
    /// Create a provider against the public API
    pub fn new() -> Self {
        Self::with_client(reqwest::Client::new())
    }

    /// Create a provider sharing an existing HTTP client
    pub fn with_client(client: reqwest::Client) -> Self {
        Self {
            client,
            base_url: crate::Provider::Anthropic.base_url().to_string(),
        }
    }

    /// Point the provider at a different endpoint (proxies, tests)
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    fn build_request(
        &self,
        config: &ModelConfig,
        context: &Context,
        options: &StreamOptions,
    ) -> AnthropicRequest {
        AnthropicRequest {
            model: config.model_id().to_string(),
            messages: convert_messages(&context.messages),
            max_tokens: options.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS),
            stream: true,
            system: context.system_prompt.clone(),
            temperature: options.temperature,
        }
    }
}

impl Default for AnthropicProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl GenerationSource for AnthropicProvider {
    async fn stream(
        &self,
        config: &ModelConfig,
        context: &Context,
        options: &StreamOptions,
    ) -> Result<MessageEventStream> {
        let request = self.build_request(config, context, options);
        let url = format!("{}/v1/messages", self.base_url);

        tracing::debug!("Anthropic API URL: {}", url);

        let mut headers = HeaderMap::new();
        insert_header(&mut headers, "x-api-key", &config.api_key)?;
        insert_header(&mut headers, "anthropic-version", ANTHROPIC_VERSION)?;
        insert_header(&mut headers, "anthropic-beta", MAX_TOKENS_BETA)?;
        insert_header(&mut headers, "accept", "text/event-stream")?;
        insert_header(&mut headers, "content-type", "application/json")?;

        let request_builder = self.client.post(&url).headers(headers).json(&request);

        let event_source = EventSource::new(request_builder).map_err(|e| {
            crate::Error::Sse(format!("Failed to create event source: {}", e))
        })?;

        Ok(Box::pin(create_stream(event_source, request.model)))
    }
}

/// Convert chat messages to Anthropic content blocks.
///
/// An assistant turn with tool invocations becomes `tool_use` blocks
/// followed by a user turn carrying the matching `tool_result` blocks.
fn convert_messages(messages: &[Message]) -> Vec<AnthropicMessage> {
    let mut converted = Vec::with_capacity(messages.len());

    for msg in messages {
        let mut blocks = Vec::new();
        if !msg.content.is_empty() {
            blocks.push(json!({ "type": "text", "text": msg.content }));
        }

        match msg.role {
            Role::User => {
                if !blocks.is_empty() {
                    converted.push(AnthropicMessage {
                        role: "user".to_string(),
                        content: blocks,
                    });
                }
            }
            Role::Assistant => {
                let invocations = msg.tool_invocations();
                for call in invocations {
                    blocks.push(json!({
                        "type": "tool_use",
                        "id": call.tool_call_id,
                        "name": call.tool_name,
                        "input": call.args,
                    }));
                }
                if !blocks.is_empty() {
                    converted.push(AnthropicMessage {
                        role: "assistant".to_string(),
                        content: blocks,
                    });
                }
                if !invocations.is_empty() {
                    let results = invocations
                        .iter()
                        .map(|call| {
                            json!({
                                "type": "tool_result",
                                "tool_use_id": call.tool_call_id,
                                "content": result_text(&call.result),
                            })
                        })
                        .collect();
                    converted.push(AnthropicMessage {
                        role: "user".to_string(),
                        content: results,
                    });
                }
            }
        }
    }

    converted
}

fn result_text(result: &serde_json::Value) -> String {
    match result {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn map_stop_reason(reason: &str) -> StopReason {
    match reason {
        "max_tokens" => StopReason::Length,
        "tool_use" => StopReason::ToolUse,
        "refusal" => StopReason::ContentFilter,
        _ => StopReason::Stop,
    }
}

/// Create the event stream from SSE events
fn create_stream(
    mut event_source: EventSource,
    model: String,
) -> impl futures::Stream<Item = MessageEvent> {
    stream! {
        let mut usage = Usage::default();
        let mut stop_reason = StopReason::Stop;
        let mut finished = false;

        yield MessageEvent::Start { model };

        while let Some(event_result) = event_source.next().await {
            match event_result {
                Ok(Event::Open) => {}
                Ok(Event::Message(message)) => match message.event.as_str() {
                    "message_start" => {
                        if let Ok(data) = serde_json::from_str::<MessageStartEvent>(&message.data) {
                            usage.input = data.message.usage.input_tokens;
                        }
                    }
                    "content_block_delta" => {
                        if let Ok(data) = serde_json::from_str::<ContentBlockDeltaEvent>(&message.data) {
                            if data.delta.delta_type == "text_delta" {
                                if let Some(delta) = data.delta.text.filter(|t| !t.is_empty()) {
                                    yield MessageEvent::TextDelta { delta };
                                }
                            }
                        }
                    }
                    "message_delta" => {
                        if let Ok(data) = serde_json::from_str::<MessageDeltaEvent>(&message.data) {
                            if let Some(reason) = data.delta.stop_reason {
                                stop_reason = map_stop_reason(&reason);
                            }
                            usage.output = data.usage.output_tokens;
                        }
                    }
                    "message_stop" => {
                        finished = true;
                        break;
                    }
                    "error" => {
                        let message = serde_json::from_str::<ErrorEvent>(&message.data)
                            .map(|data| format!("API error: {} (type: {})", data.error.message, data.error.error_type))
                            .unwrap_or_else(|_| format!("API error: {}", message.data));
                        yield MessageEvent::Error { message };
                        return;
                    }
                    _ => {}
                },
                Err(reqwest_eventsource::Error::StreamEnded) => break,
                Err(e) => {
                    yield MessageEvent::Error { message: describe_sse_error(e).await };
                    return;
                }
            }
        }
        event_source.close();

        if finished {
            yield MessageEvent::Done { stop_reason, usage };
        } else {
            yield MessageEvent::Error {
                message: "SSE error: stream ended before message_stop".to_string(),
            };
        }
    }
}

// ============================================================================
// Request types
// ============================================================================

#[derive(Debug, Serialize)]
struct AnthropicRequest {
    model: String,
    messages: Vec<AnthropicMessage>,
    max_tokens: u32,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
}

#[derive(Debug, Serialize)]
struct AnthropicMessage {
    role: String,
    content: Vec<serde_json::Value>,
}

// ============================================================================
// Response event types
// ============================================================================

#[derive(Debug, Deserialize)]
struct MessageStartEvent {
    message: MessageInfo,
}

#[derive(Debug, Deserialize)]
struct MessageInfo {
    usage: UsageInfo,
}

#[derive(Debug, Deserialize)]
struct UsageInfo {
    #[serde(default)]
    input_tokens: u32,
    #[serde(default)]
    output_tokens: u32,
}

#[derive(Debug, Deserialize)]
struct ContentBlockDeltaEvent {
    delta: DeltaInfo,
}

#[derive(Debug, Deserialize)]
struct DeltaInfo {
    #[serde(rename = "type")]
    delta_type: String,
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct MessageDeltaEvent {
    delta: MessageDelta,
    usage: UsageInfo,
}

#[derive(Debug, Deserialize)]
struct MessageDelta {
    stop_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ErrorEvent {
    error: ApiError,
}

#[derive(Debug, Deserialize)]
struct ApiError {
    #[serde(rename = "type")]
    error_type: String,
    message: String,
}
