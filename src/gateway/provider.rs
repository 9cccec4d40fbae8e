use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use axum::http::{HeaderMap, HeaderName, HeaderValue};
use serde_json::Value;

use super::config::{GatewayConfig, ProviderConfig};
use super::endpoint::Endpoint;
use super::request::RequestContext;
use super::response::UpstreamResponse;
use super::transform::{OpenAiCompatible, ProviderTransform};
use super::{GatewayError, headers};

/// Replaces request transformation and the HTTP fetch for one endpoint of one
/// provider. Its response still flows through the response service.
#[async_trait]
pub trait RequestHandler: Send + Sync {
    async fn handle(
        &self,
        provider: &ProviderConfig,
        context: &RequestContext,
        client: &reqwest::Client,
    ) -> Result<UpstreamResponse, GatewayError>;
}

pub struct Provider {
    config: ProviderConfig,
    api_key: Option<String>,
    static_headers: HeaderMap,
    transform: Arc<dyn ProviderTransform>,
    handlers: HashMap<Endpoint, Arc<dyn RequestHandler>>,
}

impl std::fmt::Debug for Provider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Provider")
            .field("config", &self.config)
            .field("handlers", &self.handlers.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl Provider {
    fn from_config(config: ProviderConfig) -> Result<Self, GatewayError> {
        let static_headers = parse_headers(&config.headers)?;
        let api_key = config.auth.resolve_api_key();
        HeaderName::from_bytes(config.auth.header.trim().as_bytes()).map_err(|_| {
            GatewayError::Config {
                reason: format!(
                    "provider `{}` has invalid auth header name {}",
                    config.name, config.auth.header
                ),
            }
        })?;
        Ok(Self {
            transform: Arc::new(OpenAiCompatible::new(config.name.clone())),
            config,
            api_key,
            static_headers,
            handlers: HashMap::new(),
        })
    }

    pub fn config(&self) -> &ProviderConfig {
        &self.config
    }
}

#[derive(Debug, Default)]
pub struct ProviderRegistry {
    providers: HashMap<String, Provider>,
}

impl ProviderRegistry {
    pub fn from_config(config: &GatewayConfig) -> Result<Self, GatewayError> {
        let mut providers = HashMap::new();
        for provider in &config.providers {
            providers.insert(
                provider.name.clone(),
                Provider::from_config(provider.clone())?,
            );
        }
        Ok(Self { providers })
    }

    pub fn get(&self, name: &str) -> Option<&Provider> {
        self.providers.get(name)
    }

    pub fn context(&self, name: &str) -> Result<ProviderContext<'_>, GatewayError> {
        self.get(name)
            .map(|provider| ProviderContext { provider })
            .ok_or_else(|| GatewayError::ProviderNotFound {
                name: name.to_string(),
            })
    }

    pub fn set_transform(&mut self, name: &str, transform: Arc<dyn ProviderTransform>) -> bool {
        match self.providers.get_mut(name) {
            Some(provider) => {
                provider.transform = transform;
                true
            }
            None => false,
        }
    }

    pub fn set_request_handler(
        &mut self,
        name: &str,
        endpoint: Endpoint,
        handler: Arc<dyn RequestHandler>,
    ) -> bool {
        match self.providers.get_mut(name) {
            Some(provider) => {
                provider.handlers.insert(endpoint, handler);
                true
            }
            None => false,
        }
    }
}

/// Where and how to call one provider. Every method is a pure function of the
/// provider config and the request context.
#[derive(Debug, Clone, Copy)]
pub struct ProviderContext<'a> {
    provider: &'a Provider,
}

impl<'a> ProviderContext<'a> {
    pub fn name(&self) -> &'a str {
        &self.provider.config.name
    }

    pub fn config(&self) -> &'a ProviderConfig {
        &self.provider.config
    }

    pub fn transform(&self) -> &'a Arc<dyn ProviderTransform> {
        &self.provider.transform
    }

    /// Custom host (request, then provider config) wins over `base_url`.
    pub fn get_base_url(&self, context: &RequestContext) -> String {
        context
            .custom_host()
            .or(self.provider.config.custom_host.as_deref())
            .map(str::trim)
            .filter(|host| !host.is_empty())
            .unwrap_or(self.provider.config.base_url.trim())
            .trim_end_matches('/')
            .to_string()
    }

    /// Path appended to the base URL, without query string.
    pub fn get_endpoint_path(&self, context: &RequestContext) -> String {
        if let Some(path) = self
            .provider
            .config
            .endpoint_paths
            .get(context.endpoint().as_str())
        {
            return path.clone();
        }
        if let Some(path) = context.endpoint().default_path() {
            return path.to_string();
        }
        let (path, _) = split_query(context.path());
        match path.strip_prefix("/v1/proxy") {
            Some(rest) if rest.is_empty() || rest.starts_with('/') => rest.to_string(),
            _ => path.to_string(),
        }
    }

    pub fn get_full_url(&self, context: &RequestContext) -> String {
        let base = self.get_base_url(context);
        let path = self.get_endpoint_path(context);
        let mut url = join_base_url(&base, &path);
        let (_, query) = split_query(context.path());
        if let Some(query) = query.filter(|query| !query.is_empty()) {
            url.push('?');
            url.push_str(query);
        }
        url
    }

    /// Content type, provider auth, static provider headers, then the client
    /// headers named in the forward list.
    pub fn get_headers(&self, context: &RequestContext) -> HeaderMap {
        let mut out = HeaderMap::new();
        if context.body().as_json().is_some() {
            out.insert("content-type", HeaderValue::from_static("application/json"));
        } else if let Some(content_type) = context.headers().get("content-type") {
            out.insert("content-type", content_type.clone());
        }

        let auth = &self.provider.config.auth;
        if let Ok(auth_header) = HeaderName::from_bytes(auth.header.trim().as_bytes()) {
            match self.provider.api_key.as_deref() {
                Some(key) => {
                    if let Ok(value) = HeaderValue::from_str(&format!("{}{key}", auth.prefix)) {
                        out.insert(auth_header, value);
                    }
                }
                None => {
                    if let Some(value) = context.headers().get(&auth_header) {
                        out.insert(auth_header, value.clone());
                    }
                }
            }
        }

        for (name, value) in &self.provider.static_headers {
            out.insert(name.clone(), value.clone());
        }

        for name in context.forward_headers() {
            if name.starts_with(headers::GATEWAY_PREFIX) || is_hop_by_hop(name) {
                continue;
            }
            let Ok(name) = HeaderName::from_bytes(name.as_bytes()) else {
                continue;
            };
            for value in context.headers().get_all(&name) {
                out.append(name.clone(), value.clone());
            }
        }
        out
    }

    pub fn has_request_handler(&self, endpoint: Endpoint) -> bool {
        self.provider.handlers.contains_key(&endpoint)
    }

    pub fn get_request_handler(&self, endpoint: Endpoint) -> Option<Arc<dyn RequestHandler>> {
        self.provider.handlers.get(&endpoint).cloned()
    }

    pub fn transform_request(&self, context: &RequestContext, body: &Value) -> Result<Value, GatewayError> {
        self.provider.transform.transform_request(context.endpoint(), body)
    }
}

fn split_query(path: &str) -> (&str, Option<&str>) {
    match path.split_once('?') {
        Some((path, query)) => (path, Some(query)),
        None => (path, None),
    }
}

fn is_hop_by_hop(name: &str) -> bool {
    matches!(
        name,
        "connection"
            | "keep-alive"
            | "proxy-authenticate"
            | "proxy-authorization"
            | "te"
            | "trailer"
            | "transfer-encoding"
            | "upgrade"
            | "host"
            | "content-length"
    )
}

fn join_base_url(base_url: &str, path: &str) -> String {
    let base = base_url.trim_end_matches('/');
    let path_no_leading_slash = path.strip_prefix('/').unwrap_or(path);

    // A base URL that already ends in /v1 absorbs a leading /v1 in the path.
    if base.ends_with("/v1") {
        if path_no_leading_slash == "v1" {
            return base.to_string();
        }
        if let Some(rest) = path_no_leading_slash.strip_prefix("v1/") {
            return format!("{base}/{rest}");
        }
    }

    if path_no_leading_slash.is_empty() {
        return base.to_string();
    }
    format!("{base}/{path_no_leading_slash}")
}

fn parse_headers(headers: &BTreeMap<String, String>) -> Result<HeaderMap, GatewayError> {
    let mut out = HeaderMap::new();
    for (name, value) in headers {
        let header_name = name
            .trim()
            .parse::<HeaderName>()
            .map_err(|_| GatewayError::Config {
                reason: format!("invalid header name: {name}"),
            })?;
        let header_value = value
            .parse::<HeaderValue>()
            .map_err(|_| GatewayError::Config {
                reason: format!("invalid header value for {name}"),
            })?;
        out.insert(header_name, header_value);
    }
    Ok(out)
}
