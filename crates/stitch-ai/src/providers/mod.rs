//! Generation source implementations

pub mod anthropic;
pub mod google;
pub mod openai;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};

use crate::{Context, Error, MessageEventStream, ModelConfig, Provider, Result, StreamOptions};

/// A text-generation backend.
///
/// One call produces one segment: a stream of text deltas ending in a
/// single `Done` or `Error` event.
#[async_trait]
pub trait GenerationSource: Send + Sync {
    /// Stream a response from the LLM
    async fn stream(
        &self,
        config: &ModelConfig,
        context: &Context,
        options: &StreamOptions,
    ) -> Result<MessageEventStream>;
}

/// Generation sources keyed by provider
#[derive(Clone, Default)]
pub struct ProviderRegistry {
    sources: HashMap<Provider, Arc<dyn GenerationSource>>,
}

impl ProviderRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the built-in HTTP sources for every known provider
    pub fn with_defaults() -> Self {
        let client = reqwest::Client::new();
        let mut registry = Self::new();
        registry.register(
            Provider::Anthropic,
            Arc::new(anthropic::AnthropicProvider::with_client(client.clone())),
        );
        registry.register(
            Provider::Gemini,
            Arc::new(google::GoogleProvider::with_client(client.clone())),
        );
        registry.register(
            Provider::OpenRouter,
            Arc::new(openai::OpenAICompatibleProvider::openrouter(client.clone())),
        );
        registry.register(
            Provider::Groq,
            Arc::new(openai::OpenAICompatibleProvider::groq(client)),
        );
        registry
    }

    /// Add or replace the source for a provider
    pub fn register(&mut self, provider: Provider, source: Arc<dyn GenerationSource>) {
        self.sources.insert(provider, source);
    }

    /// Look up the source for a provider
    pub fn get(&self, provider: Provider) -> Result<Arc<dyn GenerationSource>> {
        self.sources
            .get(&provider)
            .cloned()
            .ok_or_else(|| Error::UnsupportedProvider(provider.id().to_string()))
    }

    /// Providers with a registered source
    pub fn providers(&self) -> Vec<Provider> {
        Provider::ALL
            .into_iter()
            .filter(|p| self.sources.contains_key(p))
            .collect()
    }
}

/// Insert a header, rejecting values that are not valid header text.
pub(crate) fn insert_header(headers: &mut HeaderMap, name: &'static str, value: &str) -> Result<()> {
    let value = HeaderValue::from_str(value)
        .map_err(|e| Error::InvalidConfig(format!("invalid value for header {name}: {e}")))?;
    headers.insert(HeaderName::from_static(name), value);
    Ok(())
}

/// Render an event-source failure for an `Error` event.
pub(crate) async fn describe_sse_error(error: reqwest_eventsource::Error) -> String {
    match error {
        reqwest_eventsource::Error::InvalidStatusCode(status, response) => {
            let body = response.text().await.unwrap_or_default();
            if body.is_empty() {
                format!("API error: HTTP {status}")
            } else {
                format!("API error: HTTP {status}: {body}")
            }
        }
        other => format!("SSE error: {other}"),
    }
}
