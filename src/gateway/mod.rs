//! Gateway module (feature-gated).
//!
//! The request lifecycle lives in [`orchestrator::Gateway::try_post`]; the other
//! modules are the services it sequences: request/provider context, the hooks
//! engine, the cache service, the response service and the logs service.

pub mod cache;
pub mod config;
pub mod endpoint;
pub mod hooks;
pub mod http;
pub mod logs;
pub mod observability;
pub mod orchestrator;
#[cfg(feature = "gateway-otel")]
pub mod otel;
pub mod provider;
pub mod request;
pub mod response;
pub mod retry;
pub mod transform;

use std::time::{SystemTime, UNIX_EPOCH};

use axum::http::{HeaderMap, HeaderValue, StatusCode};
use bytes::Bytes;
use serde_json::Value;
use thiserror::Error;

use crate::utils::http::ByteStream;

pub use cache::{
    CacheBackend, CacheConfig, CacheLookup, CacheMode, CachePolicy, CacheReadOutcome,
    CacheResponseObject, CacheService, CacheStatus, MemoryCacheBackend,
};
pub use config::{GatewayConfig, HooksConfig, ProviderAuthConfig, ProviderConfig};
pub use endpoint::Endpoint;
pub use hooks::registry::{Check, CheckOptions, CheckOutcome, CheckRegistry};
pub use hooks::span::{HookSpan, HookSpanState};
pub use hooks::{
    CheckConfig, CheckError, GuardrailCheckResult, HookConfig, HookKind, HookPhase, HookResult,
    PhaseResults,
};
pub use hooks::manager::HooksManager;
pub use http::{GatewayHttpState, router};
pub use logs::{
    LogObject, LogObjectBuilder, LogSink, LogsService, MemoryLogSink, ProviderOptions,
    TracingLogSink,
};
pub use observability::{Observability, ObservabilitySnapshot};
pub use orchestrator::{Gateway, PreRequestValidator};
pub use provider::{ProviderContext, ProviderRegistry, RequestHandler};
pub use request::{InboundRequest, RequestBody, RequestContext};
pub use response::{
    MappedResponse, ResponseService, ResponseTelemetry, UpstreamBody, UpstreamResponse,
};
pub use retry::{RetryConfig, RetryPolicy};
pub use transform::{OpenAiCompatible, ProviderTransform, StreamChunkTransform};

/// Completed, but at least one non-denying hook failed.
pub const STATUS_HOOKS_FAILED: u16 = 246;
/// Rejected by a denying hook.
pub const STATUS_HOOKS_DENIED: u16 = 446;

/// Provider name used for responses the gateway produces itself.
pub const GATEWAY_PROVIDER: &str = "gateway";

pub mod headers {
    pub const PROVIDER: &str = "x-gateway-provider";
    pub const CACHE: &str = "x-gateway-cache";
    pub const CACHE_MAX_AGE: &str = "x-gateway-cache-max-age";
    pub const RETRY: &str = "x-gateway-retry";
    pub const FORWARD_HEADERS: &str = "x-gateway-forward-headers";
    pub const CUSTOM_HOST: &str = "x-gateway-custom-host";
    pub const REQUEST_TIMEOUT: &str = "x-gateway-request-timeout";
    pub const TRACE_ID: &str = "x-gateway-trace-id";
    pub const STRICT_OPENAI_COMPLIANCE: &str = "x-gateway-strict-openai-compliance";
    pub const METADATA: &str = "x-gateway-metadata";
    pub const CONFIG: &str = "x-gateway-config";

    pub const LAST_USED_OPTION_INDEX: &str = "x-gateway-last-used-option-index";
    pub const RETRY_ATTEMPT_COUNT: &str = "x-gateway-retry-attempt-count";
    pub const CACHE_STATUS: &str = "x-gateway-cache-status";

    pub const GATEWAY_PREFIX: &str = "x-gateway-";
}

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("invalid request: {reason}")]
    InvalidRequest { reason: String },
    #[error("provider not found: {name}")]
    ProviderNotFound { name: String },
    #[error("upstream error: {message}")]
    Upstream { message: String },
    #[error("request exceeded the timeout sent in the request: {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },
    #[error("cache error: {message}")]
    Cache { message: String },
    #[error("hook phase {phase} cannot run while span is {state}")]
    HookPhaseOrder {
        phase: &'static str,
        state: &'static str,
    },
    #[error("invalid config: {reason}")]
    Config { reason: String },
}

impl GatewayError {
    pub fn status(&self) -> StatusCode {
        match self {
            GatewayError::InvalidRequest { .. } | GatewayError::ProviderNotFound { .. } => {
                StatusCode::BAD_REQUEST
            }
            GatewayError::Upstream { .. } => StatusCode::BAD_GATEWAY,
            GatewayError::Timeout { .. } => StatusCode::REQUEST_TIMEOUT,
            GatewayError::Cache { .. }
            | GatewayError::HookPhaseOrder { .. }
            | GatewayError::Config { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn kind_and_code(&self) -> (&'static str, Option<&'static str>) {
        match self {
            GatewayError::InvalidRequest { .. } => {
                ("invalid_request_error", Some("invalid_request"))
            }
            GatewayError::ProviderNotFound { .. } => {
                ("invalid_request_error", Some("provider_not_found"))
            }
            GatewayError::Upstream { .. } => ("api_error", Some("upstream_error")),
            GatewayError::Timeout { .. } => ("timeout_error", None),
            GatewayError::Cache { .. } => ("api_error", Some("cache_error")),
            GatewayError::HookPhaseOrder { .. } => ("api_error", Some("hook_phase_order")),
            GatewayError::Config { .. } => ("api_error", Some("invalid_config")),
        }
    }

    pub fn to_response(&self) -> GatewayResponse {
        let (kind, code) = self.kind_and_code();
        GatewayResponse::json(self.status(), openai_error_body(kind, code, self.to_string()))
    }
}

/// OpenAI-style error envelope: `{"error": {"message", "type", "param", "code"}}`.
pub fn openai_error_body(
    kind: &str,
    code: Option<&str>,
    message: impl std::fmt::Display,
) -> Value {
    serde_json::json!({
        "error": {
            "message": message.to_string(),
            "type": kind,
            "param": Value::Null,
            "code": code,
        }
    })
}

pub enum ResponseBody {
    Empty,
    Json(Value),
    Bytes(Bytes),
    Stream(ByteStream),
}

impl std::fmt::Debug for ResponseBody {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ResponseBody::Empty => f.write_str("Empty"),
            ResponseBody::Json(value) => f.debug_tuple("Json").field(value).finish(),
            ResponseBody::Bytes(bytes) => f.debug_tuple("Bytes").field(&bytes.len()).finish(),
            ResponseBody::Stream(_) => f.write_str("Stream(..)"),
        }
    }
}

/// The one response shape every branch of the lifecycle converges on.
#[derive(Debug)]
pub struct GatewayResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: ResponseBody,
}

impl GatewayResponse {
    pub fn new(status: StatusCode, headers: HeaderMap, body: ResponseBody) -> Self {
        Self {
            status,
            headers,
            body,
        }
    }

    pub fn json(status: StatusCode, value: Value) -> Self {
        let mut headers = HeaderMap::new();
        headers.insert(
            "content-type",
            HeaderValue::from_static("application/json"),
        );
        Self::new(status, headers, ResponseBody::Json(value))
    }

    pub fn json_body(&self) -> Option<&Value> {
        match &self.body {
            ResponseBody::Json(value) => Some(value),
            _ => None,
        }
    }

    pub fn json_body_mut(&mut self) -> Option<&mut Value> {
        match &mut self.body {
            ResponseBody::Json(value) => Some(value),
            _ => None,
        }
    }

    pub fn is_streaming(&self) -> bool {
        matches!(self.body, ResponseBody::Stream(_))
    }

    /// A loggable copy of the body that leaves the response itself intact.
    pub fn body_snapshot(&self) -> Value {
        match &self.body {
            ResponseBody::Empty => Value::Null,
            ResponseBody::Json(value) => value.clone(),
            ResponseBody::Bytes(bytes) => match std::str::from_utf8(bytes) {
                Ok(text) => Value::String(text.to_string()),
                Err(_) => serde_json::json!({ "binary_bytes": bytes.len() }),
            },
            ResponseBody::Stream(_) => Value::String("<stream>".to_string()),
        }
    }
}

pub(crate) fn custom_status(code: u16, fallback: StatusCode) -> StatusCode {
    StatusCode::from_u16(code).unwrap_or(fallback)
}

pub(crate) fn hex_lower(bytes: &[u8]) -> String {
    const HEX: &[u8; 16] = b"0123456789abcdef";
    let mut out = String::with_capacity(bytes.len().saturating_mul(2));
    for byte in bytes {
        out.push(char::from(HEX[usize::from(byte >> 4)]));
        out.push(char::from(HEX[usize::from(byte & 0x0f)]));
    }
    out
}

pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|duration| duration.as_millis() as u64)
        .unwrap_or(0)
}

pub fn now_epoch_seconds() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|duration| duration.as_secs())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gateway_error_maps_to_openai_envelope() {
        let response = GatewayError::ProviderNotFound {
            name: "nope".to_string(),
        }
        .to_response();
        assert_eq!(response.status, StatusCode::BAD_REQUEST);
        let body = response.json_body().expect("json body");
        assert_eq!(body["error"]["type"], "invalid_request_error");
        assert_eq!(body["error"]["code"], "provider_not_found");
        assert_eq!(body["error"]["message"], "provider not found: nope");
    }

    #[test]
    fn custom_statuses_are_representable() {
        assert_eq!(
            custom_status(STATUS_HOOKS_FAILED, StatusCode::OK).as_u16(),
            246
        );
        assert_eq!(
            custom_status(STATUS_HOOKS_DENIED, StatusCode::FORBIDDEN).as_u16(),
            446
        );
    }
}
