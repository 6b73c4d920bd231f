//! Model catalog: the providers and models offered to clients.

use serde::Serialize;

use crate::Provider;

/// A selectable model
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ModelInfo {
    pub id: &'static str,
    pub name: &'static str,
}

/// A provider together with its models
#[derive(Debug, Clone, Copy, Serialize)]
pub struct ProviderInfo {
    pub id: Provider,
    pub name: &'static str,
    pub models: &'static [ModelInfo],
}

const ANTHROPIC_MODELS: &[ModelInfo] = &[
    ModelInfo { id: "claude-3-5-sonnet-20240620", name: "Claude 3.5 Sonnet" },
    ModelInfo { id: "claude-3-opus-20240229", name: "Claude 3 Opus" },
    ModelInfo { id: "claude-3-haiku-20240307", name: "Claude 3 Haiku" },
];

const GEMINI_MODELS: &[ModelInfo] = &[
    ModelInfo { id: "gemini-1.5-pro-latest", name: "Gemini 1.5 Pro" },
    ModelInfo { id: "gemini-1.5-flash-latest", name: "Gemini 1.5 Flash" },
];

const OPENROUTER_MODELS: &[ModelInfo] = &[
    ModelInfo { id: "anthropic/claude-3.5-sonnet", name: "Claude 3.5 Sonnet" },
    ModelInfo { id: "openai/gpt-4o", name: "GPT-4o" },
    ModelInfo { id: "meta-llama/llama-3.1-405b-instruct", name: "Llama 3.1 405B" },
    ModelInfo { id: "google/gemini-pro-1.5", name: "Gemini Pro 1.5" },
];

const GROQ_MODELS: &[ModelInfo] = &[
    ModelInfo { id: "llama-3.1-70b-versatile", name: "Llama 3.1 70B" },
    ModelInfo { id: "llama-3.1-8b-instant", name: "Llama 3.1 8B" },
    ModelInfo { id: "mixtral-8x7b-32768", name: "Mixtral 8x7B" },
];

/// Get the catalog entry for a provider.
pub fn get_provider(provider: Provider) -> ProviderInfo {
    let models = match provider {
        Provider::Anthropic => ANTHROPIC_MODELS,
        Provider::Gemini => GEMINI_MODELS,
        Provider::OpenRouter => OPENROUTER_MODELS,
        Provider::Groq => GROQ_MODELS,
    };
    ProviderInfo {
        id: provider,
        name: provider.name(),
        models,
    }
}

/// Get all models for a specific provider.
pub fn get_models(provider: Provider) -> &'static [ModelInfo] {
    get_provider(provider).models
}

/// Look up a model by provider and ID.
pub fn get_model(provider: Provider, id: &str) -> Option<ModelInfo> {
    get_models(provider).iter().find(|m| m.id == id).copied()
}

/// Get every provider in catalog order.
pub fn get_providers() -> Vec<ProviderInfo> {
    Provider::ALL.iter().map(|p| get_provider(*p)).collect()
}
