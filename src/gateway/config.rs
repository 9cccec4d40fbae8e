use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use serde::{Deserialize, Serialize};

use super::cache::CacheConfig;
use super::hooks::HookConfig;
use super::retry::RetryConfig;
use crate::{Error, Result};

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_listen")]
    pub listen: String,
    #[serde(default)]
    pub providers: Vec<ProviderConfig>,
    /// Used when a request names no provider.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_provider: Option<String>,
    #[serde(default)]
    pub hooks: HooksConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_timeout_ms: Option<u64>,
    /// Strip `content-encoding` from relayed responses (set when the upstream
    /// client does not decompress transparently).
    #[serde(default)]
    pub strip_content_encoding: bool,
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: usize,
    /// Handed to every check as `options.env`.
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

fn default_listen() -> String {
    "127.0.0.1:8787".to_string()
}

fn default_max_body_bytes() -> usize {
    64 * 1024 * 1024
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            providers: Vec::new(),
            default_provider: None,
            hooks: HooksConfig::default(),
            retry: RetryConfig::default(),
            cache: CacheConfig::default(),
            request_timeout_ms: None,
            strip_content_encoding: false,
            max_body_bytes: default_max_body_bytes(),
            env: BTreeMap::new(),
        }
    }
}

impl GatewayConfig {
    /// Loads a config file, picking the format from its extension
    /// (`.json`, `.toml`, and `.yaml`/`.yml` with `gateway-config-yaml`).
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)?;
        let extension = path
            .extension()
            .and_then(|ext| ext.to_str())
            .unwrap_or_default()
            .to_ascii_lowercase();
        let config: Self = match extension.as_str() {
            "json" => serde_json::from_str(&raw)?,
            "toml" => toml::from_str(&raw)
                .map_err(|err| Error::Config(format!("{}: {err}", path.display())))?,
            #[cfg(feature = "gateway-config-yaml")]
            "yaml" | "yml" => serde_yaml::from_str(&raw)
                .map_err(|err| Error::Config(format!("{}: {err}", path.display())))?,
            other => {
                return Err(Error::Config(format!(
                    "unsupported config format `{other}` for {}",
                    path.display()
                )));
            }
        };
        config.validate()?;
        Ok(config)
    }

    pub fn provider(&self, name: &str) -> Option<&ProviderConfig> {
        self.providers.iter().find(|provider| provider.name == name)
    }

    pub fn validate(&self) -> Result<()> {
        let mut names = BTreeSet::new();
        for provider in &self.providers {
            let name = provider.name.trim();
            if name.is_empty() {
                return Err(Error::Config("provider name must not be empty".to_string()));
            }
            if !names.insert(name) {
                return Err(Error::Config(format!("duplicate provider `{name}`")));
            }
            let base = provider
                .custom_host
                .as_deref()
                .unwrap_or(provider.base_url.as_str())
                .trim();
            if base.is_empty() {
                return Err(Error::Config(format!(
                    "provider `{name}` needs a base_url or custom_host"
                )));
            }
            reqwest::Url::parse(base).map_err(|err| {
                Error::Config(format!("provider `{name}` has invalid base url {base}: {err}"))
            })?;
            validate_hooks(&provider.before_request_hooks)?;
            validate_hooks(&provider.after_request_hooks)?;
        }

        if let Some(default) = self.default_provider.as_deref() {
            if self.provider(default).is_none() {
                return Err(Error::Config(format!(
                    "default_provider `{default}` is not configured"
                )));
            }
        }

        validate_hooks(&self.hooks.before_request_hooks)?;
        validate_hooks(&self.hooks.after_request_hooks)?;
        self.retry.validate()?;
        Ok(())
    }
}

fn validate_hooks(hooks: &[HookConfig]) -> Result<()> {
    for hook in hooks {
        if hook.checks.iter().any(|check| check.id.trim().is_empty()) {
            return Err(Error::Config(format!(
                "hook `{}` has a check without an id",
                hook.id
            )));
        }
    }
    Ok(())
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct HooksConfig {
    /// Run ahead of each request's own before-hooks.
    #[serde(default)]
    pub before_request_hooks: Vec<HookConfig>,
    #[serde(default)]
    pub after_request_hooks: Vec<HookConfig>,
    #[serde(default = "default_check_timeout_ms")]
    pub check_timeout_ms: u64,
    #[serde(default = "default_async_queue_capacity")]
    pub async_queue_capacity: usize,
}

fn default_check_timeout_ms() -> u64 {
    5_000
}

fn default_async_queue_capacity() -> usize {
    1024
}

impl Default for HooksConfig {
    fn default() -> Self {
        Self {
            before_request_hooks: Vec::new(),
            after_request_hooks: Vec::new(),
            check_timeout_ms: default_check_timeout_ms(),
            async_queue_capacity: default_async_queue_capacity(),
        }
    }
}

#[derive(Clone, Serialize, Deserialize)]
pub struct ProviderAuthConfig {
    #[serde(default = "default_auth_header")]
    pub header: String,
    #[serde(default = "default_auth_prefix")]
    pub prefix: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key_env: Option<String>,
}

fn default_auth_header() -> String {
    "authorization".to_string()
}

fn default_auth_prefix() -> String {
    "Bearer ".to_string()
}

impl Default for ProviderAuthConfig {
    fn default() -> Self {
        Self {
            header: default_auth_header(),
            prefix: default_auth_prefix(),
            api_key: None,
            api_key_env: None,
        }
    }
}

impl std::fmt::Debug for ProviderAuthConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderAuthConfig")
            .field("header", &self.header)
            .field("prefix", &self.prefix)
            .field("api_key", &self.api_key.as_ref().map(|_| "<redacted>"))
            .field("api_key_env", &self.api_key_env)
            .finish()
    }
}

impl ProviderAuthConfig {
    /// Literal key first, then the named environment variable.
    pub fn resolve_api_key(&self) -> Option<String> {
        if let Some(key) = self.api_key.as_deref().map(str::trim) {
            if !key.is_empty() {
                return Some(key.to_string());
            }
        }
        let var = self.api_key_env.as_deref()?.trim();
        std::env::var(var)
            .ok()
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
    }
}

#[derive(Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    pub name: String,
    #[serde(default)]
    pub base_url: String,
    #[serde(default)]
    pub auth: ProviderAuthConfig,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub custom_host: Option<String>,
    /// Per-endpoint path overrides keyed by endpoint name (e.g. `chatComplete`).
    #[serde(default)]
    pub endpoint_paths: BTreeMap<String, String>,
    /// Provider-default guardrails, appended after the request's own hooks.
    #[serde(default)]
    pub before_request_hooks: Vec<HookConfig>,
    #[serde(default)]
    pub after_request_hooks: Vec<HookConfig>,
}

impl std::fmt::Debug for ProviderConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderConfig")
            .field("name", &self.name)
            .field("base_url", &self.base_url)
            .field("auth", &self.auth)
            .field("headers", &"<redacted>")
            .field("custom_host", &self.custom_host)
            .field("endpoint_paths", &self.endpoint_paths)
            .field("before_request_hooks", &self.before_request_hooks.len())
            .field("after_request_hooks", &self.after_request_hooks.len())
            .finish()
    }
}

impl ProviderConfig {
    pub fn new(name: impl Into<String>, base_url: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            base_url: base_url.into(),
            auth: ProviderAuthConfig::default(),
            headers: BTreeMap::new(),
            custom_host: None,
            endpoint_paths: BTreeMap::new(),
            before_request_hooks: Vec::new(),
            after_request_hooks: Vec::new(),
        }
    }

    pub fn with_api_key(mut self, api_key: impl Into<String>) -> Self {
        self.auth.api_key = Some(api_key.into());
        self
    }
}
