//! HTTP surface.
//!
//! - `POST /api/chat`: segmented response streamed as plain text
//! - `POST /api/enhancer`: single segment improving a prompt
//! - `GET /api/providers`: model catalog and server key availability
//! - `GET /health`: liveness plus the active segment budget
//!
//! Chat answers 401 with `{"error": ...}` when no credential is available
//! and 500 with an empty body for any other failure before streaming
//! starts. Failures after that abort the chunked body.

use std::collections::HashMap;

use anyhow::Result;
use axum::{
    Json, Router,
    body::{Body, Bytes},
    extract::State,
    http::{StatusCode, header},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::json;
use stitch_ai::{Message, Provider, models};
use stitch_stream::{ContinuationController, GenerationRequest, SwitchableReader};
use tokio::net::TcpListener;
use tracing::Instrument;
use uuid::Uuid;

use crate::prompts;

/// Shared state: the controller plus the provider used when a request names none
#[derive(Clone)]
pub struct AppState {
    pub controller: ContinuationController,
    pub default_provider: Provider,
}

/// Request body for POST /api/chat
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatRequest {
    pub messages: Vec<Message>,
    #[serde(default)]
    pub provider: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub api_keys: Option<HashMap<String, String>>,
}

/// Request body for POST /api/enhancer
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnhancerRequest {
    pub message: String,
    #[serde(default)]
    pub provider: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub api_keys: Option<HashMap<String, String>>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ProviderSummary {
    id: Provider,
    name: &'static str,
    default_model: &'static str,
    has_server_key: bool,
    models: &'static [models::ModelInfo],
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ProvidersResponse {
    default_provider: Provider,
    providers: Vec<ProviderSummary>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct HealthResponse {
    status: &'static str,
    max_tokens: u32,
    max_segments: usize,
}

impl AppState {
    fn generation_request(
        &self,
        provider: Option<&str>,
        model: Option<String>,
        api_keys: Option<HashMap<String, String>>,
        messages: Vec<Message>,
    ) -> stitch_ai::Result<GenerationRequest> {
        let provider = match provider.map(str::trim) {
            None | Some("") => self.default_provider,
            Some(id) => id.parse()?,
        };
        Ok(GenerationRequest {
            messages,
            provider,
            model,
            api_keys,
        })
    }
}

fn internal_error() -> Response {
    StatusCode::INTERNAL_SERVER_ERROR.into_response()
}

/// 200 with the reader as a chunked plain-text body
fn stream_response(reader: SwitchableReader) -> Response {
    let span = tracing::Span::current();
    let body = reader.inspect(move |item| {
        if let Err(e) = item {
            let _entered = span.enter();
            tracing::warn!("Response aborted: {}", e);
        }
    });
    (
        [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
        Body::from_stream(body),
    )
        .into_response()
}

async fn handle_chat(State(state): State<AppState>, body: Bytes) -> Response {
    let span = tracing::info_span!("chat", request_id = %Uuid::new_v4());
    async move {
        let body: ChatRequest = match serde_json::from_slice(&body) {
            Ok(body) => body,
            Err(e) => {
                tracing::warn!("Invalid chat request: {}", e);
                return internal_error();
            }
        };

        let request = match state.generation_request(
            body.provider.as_deref(),
            body.model,
            body.api_keys,
            body.messages,
        ) {
            Ok(request) => request,
            Err(e) => {
                tracing::warn!("{}", e);
                return internal_error();
            }
        };

        match state.controller.start(request).await {
            Ok(reader) => stream_response(reader),
            Err(e) if e.is_credential() => {
                tracing::warn!("{}", e);
                (
                    StatusCode::UNAUTHORIZED,
                    Json(json!({ "error": e.to_string() })),
                )
                    .into_response()
            }
            Err(e) => {
                tracing::warn!("Chat request failed: {}", e);
                internal_error()
            }
        }
    }
    .instrument(span)
    .await
}

async fn handle_enhancer(State(state): State<AppState>, body: Bytes) -> Response {
    let span = tracing::info_span!("enhancer", request_id = %Uuid::new_v4());
    async move {
        let body: EnhancerRequest = match serde_json::from_slice(&body) {
            Ok(body) => body,
            Err(e) => {
                tracing::warn!("Invalid enhancer request: {}", e);
                return internal_error();
            }
        };

        let messages = vec![Message::user(prompts::enhancer_prompt(&body.message))];
        let request = match state.generation_request(
            body.provider.as_deref(),
            body.model,
            body.api_keys,
            messages,
        ) {
            Ok(request) => request,
            Err(e) => {
                tracing::warn!("{}", e);
                return internal_error();
            }
        };

        match state.controller.start_single(request).await {
            Ok(reader) => stream_response(reader),
            Err(e) => {
                tracing::warn!("Enhancer request failed: {}", e);
                internal_error()
            }
        }
    }
    .instrument(span)
    .await
}

async fn handle_providers(State(state): State<AppState>) -> Json<ProvidersResponse> {
    let credentials = state.controller.credentials();
    let providers = models::get_providers()
        .into_iter()
        .map(|info| ProviderSummary {
            id: info.id,
            name: info.name,
            default_model: info.id.default_model(),
            has_server_key: credentials.has_server_key(info.id),
            models: info.models,
        })
        .collect();
    Json(ProvidersResponse {
        default_provider: state.default_provider,
        providers,
    })
}

async fn handle_health(State(state): State<AppState>) -> Json<HealthResponse> {
    let limits = state.controller.limits();
    Json(HealthResponse {
        status: "ok",
        max_tokens: limits.max_tokens,
        max_segments: limits.max_segments,
    })
}

/// Build the router
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(handle_health))
        .route("/api/chat", post(handle_chat))
        .route("/api/enhancer", post(handle_enhancer))
        .route("/api/providers", get(handle_providers))
        .with_state(state)
}

/// Serve on `bind_addr` until Ctrl+C or SIGTERM; open responses finish first.
pub async fn run_http(state: AppState, bind_addr: &str) -> Result<()> {
    let limits = state.controller.limits();
    let app = router(state);
    let listener = TcpListener::bind(bind_addr).await?;
    tracing::info!(
        "stitch listening on {} (max_tokens={}, max_segments={}, Ctrl+C/SIGTERM to stop)",
        bind_addr,
        limits.max_tokens,
        limits.max_segments
    );
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    tracing::info!("stitch stopped");
    Ok(())
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(e) => {
                tracing::warn!("Cannot listen for SIGTERM: {}", e);
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!("Cannot listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use axum::body::to_bytes;
    use axum::http::Request;
    use serde_json::Value;
    use std::collections::VecDeque;
    use parking_lot::Mutex;
    use std::sync::Arc;
    use stitch_ai::{
        Context, CredentialResolver, GenerationSource, MessageEventStream, ModelConfig,
        ProviderRegistry, StopReason, StreamOptions, Usage, stream::MessageEvent,
    };
    use stitch_stream::{CONTINUE_PROMPT, SegmentLimits};
    use tower::ServiceExt;

    /// Replays one event list per call and records the contexts it saw
    #[derive(Default)]
    struct ScriptedSource {
        scripts: Mutex<VecDeque<Vec<MessageEvent>>>,
        seen: Mutex<Vec<Context>>,
    }

    impl ScriptedSource {
        fn new(scripts: Vec<Vec<MessageEvent>>) -> Arc<Self> {
            Arc::new(Self {
                scripts: Mutex::new(scripts.into()),
                seen: Mutex::new(Vec::new()),
            })
        }

        fn calls(&self) -> usize {
            self.seen.lock().len()
        }
    }

    #[async_trait]
    impl GenerationSource for ScriptedSource {
        async fn stream(
            &self,
            _config: &ModelConfig,
            context: &Context,
            _options: &StreamOptions,
        ) -> stitch_ai::Result<MessageEventStream> {
            self.seen.lock().push(context.clone());
            let script = self.scripts.lock().pop_front().unwrap_or_else(|| {
                vec![MessageEvent::TextDelta { delta: "x".into() }, done(StopReason::Length)]
            });
            Ok(Box::pin(futures::stream::iter(script)))
        }
    }

    fn text(s: &str) -> MessageEvent {
        MessageEvent::TextDelta { delta: s.into() }
    }

    fn done(stop_reason: StopReason) -> MessageEvent {
        MessageEvent::Done {
            stop_reason,
            usage: Usage::default(),
        }
    }

    /// App whose every provider is served by `source`; only anthropic has a server key
    fn app(source: Arc<ScriptedSource>, max_segments: usize) -> Router {
        let mut registry = ProviderRegistry::new();
        for provider in Provider::ALL {
            registry.register(provider, source.clone());
        }
        let credentials = CredentialResolver::new(HashMap::from([(
            Provider::Anthropic,
            "server-key".to_string(),
        )]))
        .with_env_lookup(|_| None);
        let controller = ContinuationController::new(
            registry,
            credentials,
            SegmentLimits {
                max_tokens: 8192,
                max_segments,
            },
        )
        .with_system_prompt("test system prompt");
        router(AppState {
            controller,
            default_provider: Provider::Anthropic,
        })
    }

    fn post_json(uri: &str, body: &str) -> Request<Body> {
        Request::post(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn test_health_reports_limits() {
        let response = app(ScriptedSource::new(vec![]), 3)
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let json: Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["status"], "ok");
        assert_eq!(json["maxTokens"], 8192);
        assert_eq!(json["maxSegments"], 3);
    }

    #[tokio::test]
    async fn test_chat_streams_continued_answer() {
        let source = ScriptedSource::new(vec![
            vec![text("Hel"), done(StopReason::Length)],
            vec![text("lo!"), done(StopReason::Stop)],
        ]);
        let response = app(source.clone(), 3)
            .oneshot(post_json(
                "/api/chat",
                r#"{"messages":[{"role":"user","content":"hi"}]}"#,
            ))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers()[header::CONTENT_TYPE],
            "text/plain; charset=utf-8"
        );
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert_eq!(&body[..], b"Hello!");

        let seen = source.seen.lock();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0].system_prompt.as_deref(), Some("test system prompt"));
        assert_eq!(seen[1].messages[2].content, CONTINUE_PROMPT);
    }

    #[tokio::test]
    async fn test_chat_missing_key_is_401() {
        let source = ScriptedSource::new(vec![]);
        let response = app(source.clone(), 2)
            .oneshot(post_json(
                "/api/chat",
                r#"{"messages":[{"role":"user","content":"hi"}],"provider":"groq"}"#,
            ))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let json: Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["error"], "No API key found for provider: groq");
        assert_eq!(source.calls(), 0);
    }

    #[tokio::test]
    async fn test_chat_request_key_is_used() {
        let source = ScriptedSource::new(vec![vec![text("ok"), done(StopReason::Stop)]]);
        let response = app(source.clone(), 2)
            .oneshot(post_json(
                "/api/chat",
                r#"{"messages":[{"role":"user","content":"hi"}],"provider":"groq","model":"llama-3.1-8b-instant","apiKeys":{"groq":"gsk_user"}}"#,
            ))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert_eq!(&body[..], b"ok");
    }

    #[tokio::test]
    async fn test_chat_malformed_body_is_500() {
        let response = app(ScriptedSource::new(vec![]), 2)
            .oneshot(post_json("/api/chat", r#"{"messages": "nope"}"#))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert!(body.is_empty());
    }

    #[tokio::test]
    async fn test_chat_unknown_provider_is_500() {
        let response = app(ScriptedSource::new(vec![]), 2)
            .oneshot(post_json(
                "/api/chat",
                r#"{"messages":[{"role":"user","content":"hi"}],"provider":"mistral"}"#,
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[tokio::test]
    async fn test_chat_ceiling_aborts_body() {
        // Every call is truncated
        let source = ScriptedSource::new(vec![]);
        let response = app(source.clone(), 2)
            .oneshot(post_json(
                "/api/chat",
                r#"{"messages":[{"role":"user","content":"hi"}]}"#,
            ))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert!(to_bytes(response.into_body(), usize::MAX).await.is_err());
        assert_eq!(source.calls(), 2);
    }

    #[tokio::test]
    async fn test_chat_source_error_aborts_body() {
        let source = ScriptedSource::new(vec![vec![
            text("partial"),
            MessageEvent::Error {
                message: "overloaded".into(),
            },
        ]]);
        let response = app(source.clone(), 3)
            .oneshot(post_json(
                "/api/chat",
                r#"{"messages":[{"role":"user","content":"hi"}]}"#,
            ))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert!(to_bytes(response.into_body(), usize::MAX).await.is_err());
        assert_eq!(source.calls(), 1);
    }

    #[tokio::test]
    async fn test_enhancer_wraps_prompt_in_single_segment() {
        let source = ScriptedSource::new(vec![vec![
            text("Build a todo app with"),
            done(StopReason::Length),
        ]]);
        let response = app(source.clone(), 3)
            .oneshot(post_json("/api/enhancer", r#"{"message":"todo app"}"#))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert_eq!(&body[..], b"Build a todo app with");

        let seen = source.seen.lock();
        assert_eq!(seen.len(), 1);
        assert!(seen[0].messages[0].content.contains("<original_prompt>\ntodo app\n</original_prompt>"));
    }

    #[tokio::test]
    async fn test_enhancer_missing_key_is_500() {
        let response = app(ScriptedSource::new(vec![]), 2)
            .oneshot(post_json(
                "/api/enhancer",
                r#"{"message":"todo app","provider":"gemini"}"#,
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert!(body.is_empty());
    }

    #[tokio::test]
    async fn test_providers_lists_catalog_without_keys() {
        let response = app(ScriptedSource::new(vec![]), 2)
            .oneshot(Request::get("/api/providers").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert!(!String::from_utf8_lossy(&body).contains("server-key"));
        let json: Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["defaultProvider"], "anthropic");
        let providers = json["providers"].as_array().unwrap();
        assert_eq!(providers.len(), 4);
        assert_eq!(providers[0]["hasServerKey"], true);
        assert_eq!(providers[0]["defaultModel"], "claude-3-5-sonnet-20240620");
        assert_eq!(providers[3]["id"], "groq");
        assert_eq!(providers[3]["hasServerKey"], false);
    }

    #[tokio::test]
    async fn test_unknown_route_is_404() {
        let response = app(ScriptedSource::new(vec![]), 2)
            .oneshot(Request::get("/unknown").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
