//! Configuration file support

use anyhow::{Context as _, bail};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use stitch_ai::Provider;
use stitch_stream::SegmentLimits;

/// Address used when neither the CLI nor the config file names one
pub const DEFAULT_BIND: &str = "127.0.0.1:8080";

/// Configuration for stitch
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Address to listen on
    pub bind: Option<String>,
    /// Provider used when a request does not name one
    pub provider: Option<String>,
    /// Output tokens requested per generation call
    pub max_tokens: Option<u32>,
    /// Most segments one response may span
    pub max_segments: Option<usize>,
    /// Custom system prompt file path
    pub system_prompt_file: Option<String>,
    /// API keys (alternative to environment variables)
    #[serde(default)]
    pub api_keys: ApiKeys,
}

/// API key configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiKeys {
    pub anthropic: Option<String>,
    pub gemini: Option<String>,
    pub openrouter: Option<String>,
    pub groq: Option<String>,
}

impl ApiKeys {
    /// Non-empty configured keys by provider
    pub fn configured(&self) -> HashMap<Provider, String> {
        [
            (Provider::Anthropic, &self.anthropic),
            (Provider::Gemini, &self.gemini),
            (Provider::OpenRouter, &self.openrouter),
            (Provider::Groq, &self.groq),
        ]
        .into_iter()
        .filter_map(|(provider, key)| {
            key.as_ref()
                .filter(|k| !k.trim().is_empty())
                .map(|k| (provider, k.clone()))
        })
        .collect()
    }
}

impl Config {
    /// Get the config directory
    pub fn config_dir() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("stitch")
    }

    /// Get the config file path
    pub fn config_path() -> PathBuf {
        if let Ok(path) = std::env::var("STITCH_CONFIG_PATH") {
            return PathBuf::from(path);
        }
        Self::config_dir().join("config.toml")
    }

    /// Load config from `path`; a missing or broken file yields defaults
    pub fn load_from(path: &Path) -> Self {
        if !path.exists() {
            tracing::debug!("No config file at {}, using defaults", path.display());
            return Self::default();
        }

        match fs::read_to_string(path) {
            Ok(content) => match toml::from_str(&content) {
                Ok(config) => config,
                Err(e) => {
                    tracing::warn!("Failed to parse config file {}: {}", path.display(), e);
                    Self::default()
                }
            },
            Err(e) => {
                tracing::warn!("Failed to read config file {}: {}", path.display(), e);
                Self::default()
            }
        }
    }

    /// Save config to `path`
    pub fn save_to(&self, path: &Path) -> std::io::Result<()> {
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir)?;
        }
        let content = toml::to_string_pretty(self).map_err(std::io::Error::other)?;
        fs::write(path, content)
    }

    /// Create a default config file at `path` if it doesn't exist
    pub fn init(path: &Path) -> std::io::Result<()> {
        if path.exists() {
            return Ok(());
        }

        let default_config = Config {
            bind: Some(DEFAULT_BIND.to_string()),
            provider: Some(Provider::default().id().to_string()),
            max_tokens: Some(SegmentLimits::DEFAULT_MAX_TOKENS),
            max_segments: Some(SegmentLimits::DEFAULT_MAX_SEGMENTS),
            system_prompt_file: None,
            api_keys: ApiKeys::default(),
        };

        default_config.save_to(path)
    }

    /// The provider requests fall back to
    pub fn default_provider(&self) -> anyhow::Result<Provider> {
        match self.provider.as_deref().map(str::trim) {
            None | Some("") => Ok(Provider::default()),
            Some(id) => id
                .parse()
                .with_context(|| format!("invalid `provider` in config: {id}")),
        }
    }

    /// Segment budget, validated
    pub fn limits(&self) -> anyhow::Result<SegmentLimits> {
        let limits = SegmentLimits {
            max_tokens: self.max_tokens.unwrap_or(SegmentLimits::DEFAULT_MAX_TOKENS),
            max_segments: self
                .max_segments
                .unwrap_or(SegmentLimits::DEFAULT_MAX_SEGMENTS),
        };
        if limits.max_tokens == 0 {
            bail!("`max_tokens` must be greater than zero");
        }
        if limits.max_segments == 0 {
            bail!("`max_segments` must be at least 1");
        }
        Ok(limits)
    }
}

/// Generate example config content
pub fn example_config() -> &'static str {
    r#"# stitch configuration file
# Place at ~/.config/stitch/config.toml (Linux), ~/Library/Application Support/stitch/config.toml (Mac)
# or %APPDATA%\stitch\config.toml (Windows), or point STITCH_CONFIG_PATH at it.

# Address to listen on
bind = "127.0.0.1:8080"

# Provider used when a request names none (anthropic, gemini, openrouter, groq)
provider = "anthropic"

# Output tokens requested per generation call
max_tokens = 8192

# How many segments one response may span before it fails
max_segments = 2

# Custom system prompt file (optional)
# system_prompt_file = "~/.config/stitch/system_prompt.txt"

# API keys (optional - can also use environment variables
# ANTHROPIC_API_KEY, GOOGLE_API_KEY, OPENROUTER_API_KEY, GROQ_API_KEY).
# A key sent with a request takes precedence over both.
[api_keys]
# anthropic = "sk-ant-..."
# gemini = "..."
# openrouter = "sk-or-..."
# groq = "gsk_..."
"#
}
