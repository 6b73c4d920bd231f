//! API key resolution.
//!
//! Precedence: key supplied with the request, then the server's configured
//! key, then the provider's environment variable. Empty strings count as
//! absent at every level.

use std::collections::HashMap;
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::types::Provider;

type EnvLookup = Arc<dyn Fn(&str) -> Option<String> + Send + Sync>;

/// Resolves the secret used for a provider
#[derive(Clone)]
pub struct CredentialResolver {
    configured: HashMap<Provider, String>,
    env: EnvLookup,
}

impl CredentialResolver {
    /// Create a resolver over configured keys, falling back to the process environment
    pub fn new(configured: HashMap<Provider, String>) -> Self {
        Self {
            configured,
            env: Arc::new(|name| std::env::var(name).ok()),
        }
    }

    /// Replace the environment lookup
    pub fn with_env_lookup(
        mut self,
        lookup: impl Fn(&str) -> Option<String> + Send + Sync + 'static,
    ) -> Self {
        self.env = Arc::new(lookup);
        self
    }

    /// Find a key for `provider`.
    ///
    /// `request_keys` is the caller's map keyed by provider id.
    pub fn resolve(
        &self,
        provider: Provider,
        request_keys: Option<&HashMap<String, String>>,
    ) -> Result<String> {
        let from_request = request_keys.and_then(|keys| keys.get(provider.id())).cloned();
        from_request
            .filter(|key| !key.trim().is_empty())
            .or_else(|| self.server_key(provider))
            .ok_or(Error::MissingApiKey(provider))
    }

    /// Whether the server itself holds a key for `provider`
    pub fn has_server_key(&self, provider: Provider) -> bool {
        self.server_key(provider).is_some()
    }

    fn server_key(&self, provider: Provider) -> Option<String> {
        self.configured
            .get(&provider)
            .cloned()
            .filter(|key| !key.trim().is_empty())
            .or_else(|| (self.env)(provider.api_key_env_var()))
            .filter(|key| !key.trim().is_empty())
    }
}

impl Default for CredentialResolver {
    fn default() -> Self {
        Self::new(HashMap::new())
    }
}
