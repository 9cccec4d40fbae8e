use std::time::Duration;

use axum::http::{HeaderMap, Method};
use bytes::Bytes;
use serde::Deserialize;
use serde_json::{Map, Value};

use super::cache::{CacheMode, CachePolicy};
use super::config::GatewayConfig;
use super::endpoint::Endpoint;
use super::headers;
use super::hooks::HookConfig;
use super::retry::RetryPolicy;
use super::{GatewayError, hex_lower, now_millis};

/// A request as it reached the gateway, before any interpretation.
#[derive(Debug, Clone)]
pub struct InboundRequest {
    pub endpoint: Endpoint,
    pub method: Method,
    /// Path plus query string, e.g. `/v1/proxy/models?limit=2`.
    pub path: String,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl InboundRequest {
    pub fn new(method: Method, path: impl Into<String>, headers: HeaderMap, body: Bytes) -> Self {
        let path = path.into();
        Self {
            endpoint: Endpoint::from_path(method.as_str(), &path),
            method,
            path,
            headers,
            body,
        }
    }

    pub fn json(path: impl Into<String>, body: &Value) -> Self {
        let mut headers = HeaderMap::new();
        headers.insert(
            "content-type",
            axum::http::HeaderValue::from_static("application/json"),
        );
        Self::new(
            Method::POST,
            path,
            headers,
            Bytes::from(serde_json::to_vec(body).unwrap_or_default()),
        )
    }

    pub fn with_header(mut self, name: &'static str, value: &str) -> Self {
        if let Ok(value) = axum::http::HeaderValue::from_str(value) {
            self.headers.insert(name, value);
        }
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum RequestBody {
    Json(Value),
    Raw(Bytes),
    Empty,
}

impl RequestBody {
    fn parse(headers: &HeaderMap, body: &Bytes) -> Result<Self, GatewayError> {
        if body.is_empty() {
            return Ok(RequestBody::Empty);
        }
        let content_type = headers
            .get("content-type")
            .and_then(|value| value.to_str().ok())
            .unwrap_or_default()
            .to_ascii_lowercase();
        let declared_json = content_type.contains("json");
        if declared_json || content_type.is_empty() {
            match serde_json::from_slice::<Value>(body) {
                Ok(value) => return Ok(RequestBody::Json(value)),
                Err(err) if declared_json => {
                    return Err(GatewayError::InvalidRequest {
                        reason: format!("request body is not valid json: {err}"),
                    });
                }
                Err(_) => {}
            }
        }
        Ok(RequestBody::Raw(body.clone()))
    }

    pub fn as_json(&self) -> Option<&Value> {
        match self {
            RequestBody::Json(value) => Some(value),
            _ => None,
        }
    }
}

/// Settings a client can send as JSON in `x-gateway-config`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RequestConfig {
    #[serde(default)]
    pub provider: Option<String>,
    #[serde(default)]
    pub retry: Option<RetryPolicy>,
    #[serde(default)]
    pub cache: Option<CachePolicy>,
    #[serde(default, alias = "beforeRequestHooks")]
    pub before_request_hooks: Vec<HookConfig>,
    #[serde(default, alias = "afterRequestHooks")]
    pub after_request_hooks: Vec<HookConfig>,
    #[serde(default, alias = "customHost")]
    pub custom_host: Option<String>,
    #[serde(default, alias = "requestTimeout")]
    pub request_timeout: Option<u64>,
    #[serde(default, alias = "forwardHeaders")]
    pub forward_headers: Vec<String>,
    #[serde(default, alias = "strictOpenAiCompliance")]
    pub strict_open_ai_compliance: Option<bool>,
    #[serde(default)]
    pub metadata: Option<Map<String, Value>>,
}

/// Normalized view of one request, shared by every lifecycle stage. Read-only
/// once built, apart from what the upstream call records:
///
/// ```compile_fail
/// fn retarget(context: &mut guardrail_gateway::gateway::RequestContext) {
///     context.provider = "other".to_string();
/// }
/// ```
#[derive(Debug, Clone)]
pub struct RequestContext {
    provider: String,
    endpoint: Endpoint,
    method: Method,
    path: String,
    headers: HeaderMap,
    raw_body: Bytes,
    body: RequestBody,
    retry: RetryPolicy,
    cache: CachePolicy,
    before_hooks: Vec<HookConfig>,
    after_hooks: Vec<HookConfig>,
    stream: bool,
    strict_openai_compliance: bool,
    trace_id: String,
    metadata: Map<String, Value>,
    request_timeout: Option<Duration>,
    custom_host: Option<String>,
    forward_headers: Vec<String>,
    option_index: usize,
    transformed_body: Option<Value>,
    url: Option<String>,
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
}

fn header_json<T: for<'de> Deserialize<'de>>(
    headers: &HeaderMap,
    name: &str,
) -> Result<Option<T>, GatewayError> {
    let Some(raw) = header_str(headers, name) else {
        return Ok(None);
    };
    serde_json::from_str(raw)
        .map(Some)
        .map_err(|err| GatewayError::InvalidRequest {
            reason: format!("invalid {name} header: {err}"),
        })
}

fn header_bool(headers: &HeaderMap, name: &str) -> Option<bool> {
    match header_str(headers, name)?.to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" => Some(true),
        "false" | "0" | "no" => Some(false),
        _ => None,
    }
}

pub(crate) fn generate_trace_id() -> String {
    let mut bytes = [0u8; 16];
    match getrandom::fill(&mut bytes) {
        Ok(()) => hex_lower(&bytes),
        Err(_) => format!("{:032x}", u128::from(now_millis())),
    }
}

impl RequestContext {
    pub fn from_parts(inbound: InboundRequest, config: &GatewayConfig) -> Result<Self, GatewayError> {
        let InboundRequest {
            endpoint,
            method,
            path,
            headers,
            body: raw_body,
        } = inbound;

        let request_config: RequestConfig =
            header_json(&headers, headers::CONFIG)?.unwrap_or_default();

        let provider = header_str(&headers, headers::PROVIDER)
            .map(str::to_string)
            .or_else(|| request_config.provider.clone())
            .or_else(|| config.default_provider.clone())
            .or_else(|| match config.providers.as_slice() {
                [only] => Some(only.name.clone()),
                _ => None,
            })
            .ok_or_else(|| GatewayError::InvalidRequest {
                reason: format!("no provider selected; set the {} header", headers::PROVIDER),
            })?;

        let body = RequestBody::parse(&headers, &raw_body)?;
        let stream = body
            .as_json()
            .and_then(|json| json.get("stream"))
            .and_then(Value::as_bool)
            .unwrap_or(false);

        let retry = header_json::<RetryPolicy>(&headers, headers::RETRY)?
            .or_else(|| request_config.retry.clone())
            .unwrap_or_else(|| config.retry.default_policy.clone())
            .normalized(config.retry.max_attempts);

        let mut cache = request_config.cache.clone().unwrap_or(CachePolicy {
            mode: config.cache.mode,
            max_age: config.cache.max_age,
        });
        if let Some(raw) = header_str(&headers, headers::CACHE) {
            cache.mode = match raw.to_ascii_lowercase().as_str() {
                "false" | "off" | "none" => None,
                other => Some(CacheMode::parse(other).ok_or_else(|| {
                    GatewayError::InvalidRequest {
                        reason: format!("invalid {} header: {raw}", headers::CACHE),
                    }
                })?),
            };
        }
        if let Some(raw) = header_str(&headers, headers::CACHE_MAX_AGE) {
            cache.max_age = Some(raw.parse().map_err(|_| GatewayError::InvalidRequest {
                reason: format!("invalid {} header: {raw}", headers::CACHE_MAX_AGE),
            })?);
        }

        let provider_config = config.provider(&provider);
        let mut before_hooks = config.hooks.before_request_hooks.clone();
        before_hooks.extend(request_config.before_request_hooks.iter().cloned());
        let mut after_hooks = config.hooks.after_request_hooks.clone();
        after_hooks.extend(request_config.after_request_hooks.iter().cloned());
        if let Some(provider_config) = provider_config {
            before_hooks.extend(provider_config.before_request_hooks.iter().cloned());
            after_hooks.extend(provider_config.after_request_hooks.iter().cloned());
        }
        for (index, hook) in before_hooks.iter_mut().chain(after_hooks.iter_mut()).enumerate() {
            if hook.id.is_empty() {
                hook.id = format!("hook-{index}");
            }
        }

        let mut metadata = request_config.metadata.clone().unwrap_or_default();
        if let Some(extra) = header_json::<Map<String, Value>>(&headers, headers::METADATA)? {
            metadata.extend(extra);
        }

        let request_timeout = match header_str(&headers, headers::REQUEST_TIMEOUT) {
            Some(raw) => Some(raw.parse::<u64>().map_err(|_| GatewayError::InvalidRequest {
                reason: format!("invalid {} header: {raw}", headers::REQUEST_TIMEOUT),
            })?),
            None => request_config.request_timeout.or(config.request_timeout_ms),
        }
        .filter(|ms| *ms > 0)
        .map(Duration::from_millis);

        let custom_host = header_str(&headers, headers::CUSTOM_HOST)
            .map(str::to_string)
            .or_else(|| request_config.custom_host.clone());

        let forward_headers = match header_str(&headers, headers::FORWARD_HEADERS) {
            Some(raw) => raw
                .split(',')
                .map(|name| name.trim().to_ascii_lowercase())
                .filter(|name| !name.is_empty())
                .collect(),
            None => request_config
                .forward_headers
                .iter()
                .map(|name| name.trim().to_ascii_lowercase())
                .collect(),
        };

        let strict_openai_compliance = header_bool(&headers, headers::STRICT_OPENAI_COMPLIANCE)
            .or(request_config.strict_open_ai_compliance)
            .unwrap_or(false);

        let trace_id = header_str(&headers, headers::TRACE_ID)
            .map(str::to_string)
            .unwrap_or_else(generate_trace_id);

        Ok(Self {
            provider,
            endpoint,
            method,
            path,
            headers,
            raw_body,
            body,
            retry,
            cache,
            before_hooks,
            after_hooks,
            stream,
            strict_openai_compliance,
            trace_id,
            metadata,
            request_timeout,
            custom_host,
            forward_headers,
            option_index: 0,
            transformed_body: None,
            url: None,
        })
    }

    pub fn provider(&self) -> &str {
        &self.provider
    }

    pub fn endpoint(&self) -> Endpoint {
        self.endpoint
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    /// Inbound path including any query string.
    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn raw_body(&self) -> &Bytes {
        &self.raw_body
    }

    pub fn body(&self) -> &RequestBody {
        &self.body
    }

    pub fn retry(&self) -> &RetryPolicy {
        &self.retry
    }

    pub fn cache(&self) -> &CachePolicy {
        &self.cache
    }

    /// Request/config hooks followed by the provider's default guardrails.
    pub fn before_hooks(&self) -> &[HookConfig] {
        &self.before_hooks
    }

    pub fn after_hooks(&self) -> &[HookConfig] {
        &self.after_hooks
    }

    pub fn stream(&self) -> bool {
        self.stream
    }

    pub fn strict_openai_compliance(&self) -> bool {
        self.strict_openai_compliance
    }

    pub fn trace_id(&self) -> &str {
        &self.trace_id
    }

    pub fn metadata(&self) -> &Map<String, Value> {
        &self.metadata
    }

    pub fn request_timeout(&self) -> Option<Duration> {
        self.request_timeout
    }

    pub fn custom_host(&self) -> Option<&str> {
        self.custom_host.as_deref()
    }

    pub fn forward_headers(&self) -> &[String] {
        &self.forward_headers
    }

    pub fn option_index(&self) -> usize {
        self.option_index
    }

    /// Request JSON as hooks see it; non-JSON bodies become an empty object.
    pub fn request_json(&self) -> Value {
        self.body
            .as_json()
            .cloned()
            .unwrap_or_else(|| Value::Object(Map::new()))
    }

    pub fn record_transformed_body(&mut self, body: Value) {
        self.transformed_body = Some(body);
    }

    pub fn transformed_body(&self) -> Option<&Value> {
        self.transformed_body.as_ref()
    }

    pub fn record_url(&mut self, url: String) {
        self.url = Some(url);
    }

    pub fn url(&self) -> Option<&str> {
        self.url.as_deref()
    }
}
