//! Google Generative AI (Gemini) API provider

use crate::{
    error::{Error, Result},
    providers::{GenerationSource, describe_sse_error, insert_header},
    stream::{MessageEvent, MessageEventStream},
    types::{Context, Message, ModelConfig, Provider, Role, StopReason, StreamOptions, Usage},
};
use async_stream::stream;
use async_trait::async_trait;
use futures::StreamExt;
use reqwest::header::HeaderMap;
use reqwest_eventsource::{Event, EventSource};
use serde::{Deserialize, Serialize};

/// Google Generative AI client
pub struct GoogleProvider {
    client: reqwest::Client,
    base_url: String,
}

impl GoogleProvider {
    /// Create a provider against the public API
    pub fn new() -> Self {
        Self::with_client(reqwest::Client::new())
    }

    /// Create a provider sharing an existing HTTP client
    pub fn with_client(client: reqwest::Client) -> Self {
        Self {
            client,
            base_url: Provider::Gemini.base_url().to_string(),
        }
    }

    /// Point the provider at a different endpoint
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    fn build_request(&self, context: &Context, options: &StreamOptions) -> GeminiRequest {
        let contents = context.messages.iter().flat_map(convert_message).collect();

        let system_instruction = context.system_prompt.as_ref().map(|prompt| GeminiContent {
            role: None,
            parts: vec![GeminiPart::Text {
                text: prompt.clone(),
            }],
        });

        GeminiRequest {
            contents,
            system_instruction,
            generation_config: Some(GeminiGenerationConfig {
                max_output_tokens: options.max_tokens,
                temperature: options.temperature,
            }),
        }
    }
}

impl Default for GoogleProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl GenerationSource for GoogleProvider {
    async fn stream(
        &self,
        config: &ModelConfig,
        context: &Context,
        options: &StreamOptions,
    ) -> Result<MessageEventStream> {
        let request = self.build_request(context, options);
        let model = config.model_id().to_string();
        let url = format!(
            "{}/models/{}:streamGenerateContent?alt=sse",
            self.base_url, model
        );

        tracing::debug!("Gemini API URL: {}", url);

        let mut headers = HeaderMap::new();
        insert_header(&mut headers, "x-goog-api-key", &config.api_key)?;
        insert_header(&mut headers, "content-type", "application/json")?;

        let request_builder = self.client.post(&url).headers(headers).json(&request);

        let event_source = EventSource::new(request_builder)
            .map_err(|e| Error::Sse(format!("Failed to create event source: {}", e)))?;

        Ok(Box::pin(create_stream(event_source, model)))
    }
}

/// Convert one chat message; tool invocations become a `model` function
/// call turn followed by a `function` response turn.
fn convert_message(msg: &Message) -> Vec<GeminiContent> {
    let mut out = Vec::new();
    let text_part = (!msg.content.is_empty()).then(|| GeminiPart::Text {
        text: msg.content.clone(),
    });

    match msg.role {
        Role::User => {
            if let Some(part) = text_part {
                out.push(GeminiContent {
                    role: Some("user".to_string()),
                    parts: vec![part],
                });
            }
        }
        Role::Assistant => {
            let invocations = msg.tool_invocations();
            let mut parts: Vec<GeminiPart> = text_part.into_iter().collect();
            parts.extend(invocations.iter().map(|call| GeminiPart::FunctionCall {
                function_call: GeminiFunctionCall {
                    name: call.tool_name.clone(),
                    args: call.args.clone(),
                },
            }));
            if !parts.is_empty() {
                out.push(GeminiContent {
                    role: Some("model".to_string()),
                    parts,
                });
            }
            if !invocations.is_empty() {
                out.push(GeminiContent {
                    role: Some("function".to_string()),
                    parts: invocations
                        .iter()
                        .map(|call| GeminiPart::FunctionResponse {
                            function_response: GeminiFunctionResponse {
                                name: call.tool_name.clone(),
                                response: serde_json::json!({ "result": call.result }),
                            },
                        })
                        .collect(),
                });
            }
        }
    }
    out
}

fn map_finish_reason(reason: &str) -> StopReason {
    match reason {
        "MAX_TOKENS" => StopReason::Length,
        "SAFETY" | "RECITATION" | "BLOCKLIST" | "PROHIBITED_CONTENT" | "SPII" => {
            StopReason::ContentFilter
        }
        "MALFORMED_FUNCTION_CALL" => StopReason::Error,
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
                    if msg.data.is_empty() {
                        continue;
                    }

                    match serde_json::from_str::<GeminiStreamResponse>(&msg.data) {
                        Ok(response) => {
                            for candidate in &response.candidates {
                                if let Some(ref content) = candidate.content {
                                    for part in &content.parts {
                                        if let Some(ref text) = part.text {
                                            if !text.is_empty() {
                                                yield MessageEvent::TextDelta { delta: text.clone() };
                                            }
                                        }
                                    }
                                }
                                if let Some(ref reason) = candidate.finish_reason {
                                    finish_reason = Some(reason.clone());
                                }
                            }

                            if let Some(ref meta) = response.usage_metadata {
                                usage.input = meta.prompt_token_count.unwrap_or(0);
                                usage.output = meta.candidates_token_count.unwrap_or(0);
                            }
                        }
                        Err(e) => {
                            if let Ok(error_response) = serde_json::from_str::<GeminiErrorResponse>(&msg.data) {
                                yield MessageEvent::Error {
                                    message: format!("API error: {}", error_response.error.message),
                                };
                                return;
                            }
                            yield MessageEvent::Error {
                                message: format!("Failed to parse chunk: {}", e),
                            };
                            return;
                        }
                    }
                }
                // Gemini closes the connection instead of sending a sentinel
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

// Request types

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GeminiRequest {
    contents: Vec<GeminiContent>,
    #[serde(skip_serializing_if = "Option::is_none")]
    system_instruction: Option<GeminiContent>,
    #[serde(skip_serializing_if = "Option::is_none")]
    generation_config: Option<GeminiGenerationConfig>,
}

#[derive(Debug, Serialize)]
struct GeminiContent {
    #[serde(skip_serializing_if = "Option::is_none")]
    role: Option<String>,
    parts: Vec<GeminiPart>,
}

#[derive(Debug, Serialize)]
#[serde(untagged)]
enum GeminiPart {
    Text {
        text: String,
    },
    FunctionCall {
        #[serde(rename = "functionCall")]
        function_call: GeminiFunctionCall,
    },
    FunctionResponse {
        #[serde(rename = "functionResponse")]
        function_response: GeminiFunctionResponse,
    },
}

#[derive(Debug, Serialize)]
struct GeminiFunctionCall {
    name: String,
    args: serde_json::Value,
}

#[derive(Debug, Serialize)]
struct GeminiFunctionResponse {
    name: String,
    response: serde_json::Value,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GeminiGenerationConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    max_output_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
}

// Response types

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GeminiStreamResponse {
    #[serde(default)]
    candidates: Vec<GeminiCandidate>,
    usage_metadata: Option<GeminiUsageMetadata>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GeminiCandidate {
    content: Option<GeminiResponseContent>,
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GeminiResponseContent {
    #[serde(default)]
    parts: Vec<GeminiResponsePart>,
}

#[derive(Debug, Deserialize)]
struct GeminiResponsePart {
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GeminiUsageMetadata {
    prompt_token_count: Option<u32>,
    candidates_token_count: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct GeminiErrorResponse {
    error: GeminiError,
}

#[derive(Debug, Deserialize)]
struct GeminiError {
    message: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ToolInvocation;
    use serde_json::json;

    #[test]
    fn test_request_shape() {
        let provider = GoogleProvider::new();
        let mut context = Context::with_system("sys");
        context.push(Message::user("hi"));
        context.push(Message::assistant("hello"));
        let options = StreamOptions {
            max_tokens: Some(8192),
            temperature: None,
        };

        let value = serde_json::to_value(provider.build_request(&context, &options)).unwrap();
        assert_eq!(value["systemInstruction"]["parts"][0]["text"], "sys");
        assert_eq!(value["contents"][0]["role"], "user");
        assert_eq!(value["contents"][1]["role"], "model");
        assert_eq!(value["generationConfig"]["maxOutputTokens"], 8192);
    }

    #[test]
    fn test_tool_invocation_round_of_turns() {
        let mut assistant = Message::assistant("");
        assistant.tool_invocations = Some(vec![ToolInvocation {
            tool_call_id: "c".into(),
            tool_name: "lookup".into(),
            args: json!({"id": 1}),
            result: json!("found"),
        }]);
        let converted = convert_message(&assistant);
        assert_eq!(converted.len(), 2);
        let value = serde_json::to_value(&converted).unwrap();
        assert_eq!(value[0]["parts"][0]["functionCall"]["name"], "lookup");
        assert_eq!(value[1]["role"], "function");
        assert_eq!(value[1]["parts"][0]["functionResponse"]["response"]["result"], "found");
    }

    #[test]
    fn test_finish_reason_mapping() {
        assert_eq!(map_finish_reason("STOP"), StopReason::Stop);
        assert_eq!(map_finish_reason("MAX_TOKENS"), StopReason::Length);
        assert_eq!(map_finish_reason("SAFETY"), StopReason::ContentFilter);
        assert_eq!(map_finish_reason("RECITATION"), StopReason::ContentFilter);
    }

    #[test]
    fn test_response_parsing_skips_non_text_parts() {
        let response: GeminiStreamResponse = serde_json::from_str(
            r#"{"candidates":[{"content":{"parts":[{"text":"Hi"},{"functionCall":{"name":"x","args":{}}}]},"finishReason":"STOP"}],
                "usageMetadata":{"promptTokenCount":4,"candidatesTokenCount":1}}"#,
        )
        .unwrap();
        let parts = &response.candidates[0].content.as_ref().unwrap().parts;
        assert_eq!(parts[0].text.as_deref(), Some("Hi"));
        assert!(parts[1].text.is_none());
        assert_eq!(response.usage_metadata.unwrap().prompt_token_count, Some(4));
    }

    async fn gemini_stream(body: &'static str) -> (Vec<MessageEvent>, String) {
        let (base_url, server) = crate::providers::sse_fixture::serve(body).await;
        let provider = GoogleProvider::new().with_base_url(base_url);
        let config = ModelConfig::new(Provider::Gemini, "goog-test", None);
        let context = Context {
            system_prompt: Some("sys".into()),
            messages: vec![Message::user("hi")],
        };
        let options = StreamOptions {
            max_tokens: Some(8192),
            temperature: None,
        };

        let events: Vec<_> = provider
            .stream(&config, &context, &options)
            .await
            .unwrap()
            .collect()
            .await;
        (events, server.await.unwrap())
    }

    #[tokio::test]
    async fn test_stream_max_tokens_ends_with_connection() {
        let body = concat!(
            "data: {\"candidates\":[{\"content\":{\"parts\":[{\"text\":\"Hel\"}],\"role\":\"model\"}}]}\n\n",
            "data: {\"candidates\":[{\"content\":{\"parts\":[{\"text\":\"lo\"}],\"role\":\"model\"},\"finishReason\":\"MAX_TOKENS\"}],",
            "\"usageMetadata\":{\"promptTokenCount\":4,\"candidatesTokenCount\":2}}\n\n",
        );
        let (events, request) = gemini_stream(body).await;

        assert_eq!(
            events,
            vec![
                MessageEvent::Start {
                    model: "gemini-1.5-pro-latest".into()
                },
                MessageEvent::TextDelta { delta: "Hel".into() },
                MessageEvent::TextDelta { delta: "lo".into() },
                MessageEvent::Done {
                    stop_reason: StopReason::Length,
                    usage: Usage { input: 4, output: 2 },
                },
            ]
        );

        let request = request.to_lowercase();
        assert!(request.starts_with(
            "post /models/gemini-1.5-pro-latest:streamgeneratecontent?alt=sse "
        ));
        assert!(request.contains("x-goog-api-key: goog-test"));
        assert!(!request.contains("key=goog-test"));
        assert!(request.contains("\"maxoutputtokens\":8192"));
    }

    #[tokio::test]
    async fn test_stream_without_finish_reason_is_error() {
        let body = "data: {\"candidates\":[{\"content\":{\"parts\":[{\"text\":\"par\"}]}}]}\n\n";
        let (events, _) = gemini_stream(body).await;

        assert_eq!(events.len(), 3);
        assert!(matches!(&events[2], MessageEvent::Error { message } if message.contains("finish reason")));
    }
}
