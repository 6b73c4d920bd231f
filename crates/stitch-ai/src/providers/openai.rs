//! OpenAI-compatible Chat Completions provider (OpenRouter, Groq)

use async_stream::stream;
use async_trait::async_trait;
use futures::StreamExt;
use reqwest::header::HeaderMap;
use reqwest_eventsource::{Event, EventSource};
use serde::{Deserialize, Serialize};

use crate::{
    error::{Error, Result},
    providers::{GenerationSource, describe_sse_error, insert_header},
    stream::{MessageEvent, MessageEventStream},
    types::{Context, Message, ModelConfig, Provider, Role, StopReason, StreamOptions, Usage},
};

/// Client for any endpoint speaking the chat completions protocol
pub struct OpenAICompatibleProvider {
    client: reqwest::Client,
    base_url: String,
}

impl OpenAICompatibleProvider {
    /// Create a provider for an arbitrary base URL
    pub fn new(client: reqwest::Client, base_url: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into(),
        }
    }

    /// OpenRouter endpoint
    pub fn openrouter(client: reqwest::Client) -> Self {
        Self::new(client, Provider::OpenRouter.base_url())
    }

    /// Groq endpoint
    pub fn groq(client: reqwest::Client) -> Self {
        Self::new(client, Provider::Groq.base_url())
    }

    fn build_request(
        &self,
        config: &ModelConfig,
        context: &Context,
        options: &StreamOptions,
    ) -> OpenAIRequest {
        let mut messages = Vec::new();

        if let Some(ref system_prompt) = context.system_prompt {
            messages.push(OpenAIMessage::text("system", system_prompt.clone()));
        }

        for msg in &context.messages {
            messages.extend(convert_message(msg));
        }

        OpenAIRequest {
            model: config.model_id().to_string(),
            messages,
            stream: true,
            max_tokens: options.max_tokens,
            temperature: options.temperature,
        }
    }
}

#[async_trait]
impl GenerationSource for OpenAICompatibleProvider {
    async fn stream(
        &self,
        config: &ModelConfig,
        context: &Context,
        options: &StreamOptions,
    ) -> Result<MessageEventStream> {
        let request = self.build_request(config, context, options);
        let url = format!("{}/chat/completions", self.base_url);

        tracing::debug!("Chat completions URL: {}", url);

        let mut headers = HeaderMap::new();
        insert_header(&mut headers, "authorization", &format!("Bearer {}", config.api_key))?;
        insert_header(&mut headers, "content-type", "application/json")?;

        let request_builder = self.client.post(&url).headers(headers).json(&request);

        let event_source = EventSource::new(request_builder)
            .map_err(|e| Error::Sse(format!("Failed to create event source: {}", e)))?;

        Ok(Box::pin(create_stream(event_source, request.model)))
    }
}

fn convert_message(msg: &Message) -> Vec<OpenAIMessage> {
    match msg.role {
        Role::User => vec![OpenAIMessage::text("user", msg.content.clone())],
        Role::Assistant => {
            let invocations = msg.tool_invocations();
            let tool_calls: Vec<OpenAIToolCall> = invocations
                .iter()
                .map(|call| OpenAIToolCall {
                    id: call.tool_call_id.clone(),
                    call_type: "function".to_string(),
                    function: OpenAIFunctionCall {
                        name: call.tool_name.clone(),
                        arguments: call.args.to_string(),
                    },
                })
                .collect();

            let mut out = vec![OpenAIMessage {
                role: "assistant".to_string(),
                content: (!msg.content.is_empty()).then(|| msg.content.clone()),
                tool_calls: (!tool_calls.is_empty()).then_some(tool_calls),
                tool_call_id: None,
            }];

            for call in invocations {
                let content = match &call.result {
                    serde_json::Value::String(s) => s.clone(),
                    other => other.to_string(),
                };
                out.push(OpenAIMessage {
                    role: "tool".to_string(),
                    content: Some(content),
                    tool_calls: None,
                    tool_call_id: Some(call.tool_call_id.clone()),
                });
            }
            out
        }
    }
}

fn map_finish_reason(reason: &str) -> StopReason {
    match reason {
        "length" => StopReason::Length,
        "tool_calls" | "function_call" => StopReason::ToolUse,
        "content_filter" => StopReason::ContentFilter,
        "error" => StopReason::Error,
        _ => StopReason::Stop,
    }
}

fn create_stream(
    mut event_source: EventSource,
    model: String,
) -> impl futures::Stream<Item = MessageEvent> {
    stream! {
        let mut finish_reason: Option<String> = None;
        let mut usage = Usage::default();

        yield MessageEvent::Start { model };

        while let Some(event) = event_source.next().await {
            match event {
                Ok(Event::Open) => {}
                Ok(Event::Message(msg)) => {
                    if msg.data == "[DONE]" {
                        break;
                    }

                    match serde_json::from_str::<StreamChunk>(&msg.data) {
                        Ok(chunk) => {
                            if let Some(error) = chunk.error {
                                yield MessageEvent::Error {
                                    message: format!("API error: {}", error.message),
                                };
                                return;
                            }

                            for choice in &chunk.choices {
                                if let Some(ref content) = choice.delta.content {
                                    if !content.is_empty() {
                                        yield MessageEvent::TextDelta { delta: content.clone() };
                                    }
                                }
                                if let Some(ref reason) = choice.finish_reason {
                                    finish_reason = Some(reason.clone());
                                }
                            }

                            if let Some(ref stream_usage) = chunk.usage {
                                usage.input = stream_usage.prompt_tokens;
                                usage.output = stream_usage.completion_tokens;
                            }
                        }
                        Err(e) => {
                            yield MessageEvent::Error {
                                message: format!("Failed to parse chunk: {}", e),
                            };
                            return;
                        }
                    }
                }
                Err(reqwest_eventsource::Error::StreamEnded) => break,
                Err(e) => {
                    yield MessageEvent::Error { message: describe_sse_error(e).await };
                    return;
                }
            }
        }
        event_source.close();

        match finish_reason.as_deref() {
            Some(reason) => yield MessageEvent::Done {
                stop_reason: map_finish_reason(reason),
                usage,
            },
            None => yield MessageEvent::Error {
                message: "SSE error: stream ended without a finish reason".to_string(),
            },
        }
    }
}

// Request/Response types

#[derive(Debug, Serialize)]
struct OpenAIRequest {
    model: String,
    messages: Vec<OpenAIMessage>,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
}

#[derive(Debug, Serialize)]
struct OpenAIMessage {
    role: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_calls: Option<Vec<OpenAIToolCall>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_call_id: Option<String>,
}

impl OpenAIMessage {
    fn text(role: &str, content: String) -> Self {
        Self {
            role: role.to_string(),
            content: Some(content),
            tool_calls: None,
            tool_call_id: None,
        }
    }
}

#[derive(Debug, Serialize)]
struct OpenAIToolCall {
    id: String,
    #[serde(rename = "type")]
    call_type: String,
    function: OpenAIFunctionCall,
}

#[derive(Debug, Serialize)]
struct OpenAIFunctionCall {
    name: String,
    arguments: String,
}

// Streaming response types

#[derive(Debug, Deserialize)]
struct StreamChunk {
    #[serde(default)]
    choices: Vec<StreamChoice>,
    #[serde(default)]
    usage: Option<StreamUsage>,
    #[serde(default)]
    error: Option<StreamError>,
}

#[derive(Debug, Deserialize)]
struct StreamChoice {
    delta: StreamDelta,
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct StreamDelta {
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct StreamUsage {
    prompt_tokens: u32,
    completion_tokens: u32,
}

#[derive(Debug, Deserialize)]
struct StreamError {
    message: String,
}
