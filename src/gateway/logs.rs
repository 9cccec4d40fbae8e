//! One structured record per request.
//!
//! The orchestrator threads a [`LogObjectBuilder`] through every branch of the
//! request flow. Branches may snapshot it with [`LogObjectBuilder::log`] as
//! often as they like; exactly one branch hands it to
//! [`LogObjectBuilder::commit`], which consumes the builder:
//!
//! ```compile_fail
//! use guardrail_gateway::gateway::LogObjectBuilder;
//!
//! let mut builder = LogObjectBuilder::new("trace-1");
//! let _record = builder.commit();
//! builder.log();
//! ```

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use axum::http::HeaderMap;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::Mutex;

use super::cache::{CacheMode, CacheStatus};
use super::{GatewayResponse, now_millis};

const REDACTED: &str = "<redacted>";
const SENSITIVE_HEADERS: &[&str] = &[
    "authorization",
    "proxy-authorization",
    "x-api-key",
    "api-key",
    "cookie",
    "set-cookie",
];

/// Header map as logged: lowercase names, secrets replaced.
pub fn redact_headers(headers: &HeaderMap) -> BTreeMap<String, String> {
    headers
        .iter()
        .map(|(name, value)| {
            let name = name.as_str().to_ascii_lowercase();
            let value = if SENSITIVE_HEADERS.contains(&name.as_str()) {
                REDACTED.to_string()
            } else {
                String::from_utf8_lossy(value.as_bytes()).into_owned()
            };
            (name, value)
        })
        .collect()
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ProviderOptions {
    pub provider: String,
    pub endpoint: String,
    pub url: Option<String>,
    pub option_index: usize,
    pub stream: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct LoggedRequest {
    pub body: Value,
    pub headers: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LoggedResponse {
    pub status: u16,
    pub headers: BTreeMap<String, String>,
    pub body: Value,
}

impl LoggedResponse {
    /// Clones what can be cloned; stream bodies are recorded as a marker.
    pub fn from_response(response: &GatewayResponse) -> Self {
        Self {
            status: response.status.as_u16(),
            headers: redact_headers(&response.headers),
            body: response.body_snapshot(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CacheLog {
    pub status: Option<CacheStatus>,
    pub key: Option<String>,
    pub mode: Option<CacheMode>,
    pub max_age: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LogObject {
    pub trace_id: String,
    pub provider_options: ProviderOptions,
    /// What was sent upstream after hook rewrites and the provider transform.
    pub transformed_request: LoggedRequest,
    /// The request as the client sent it, after hook rewrites only.
    pub request: LoggedRequest,
    pub original_response: Option<Value>,
    pub response: Option<LoggedResponse>,
    pub cache: CacheLog,
    pub hook_span_id: Option<String>,
    pub retry_attempt_count: u32,
    pub created_at: u64,
    pub execution_time_ms: u64,
}

/// Open builder for a [`LogObject`].
#[derive(Debug)]
pub struct LogObjectBuilder {
    current: LogObject,
    started_at: u64,
    last: Option<LogObject>,
}

impl LogObjectBuilder {
    pub fn new(trace_id: impl Into<String>) -> Self {
        let started_at = now_millis();
        Self {
            current: LogObject {
                trace_id: trace_id.into(),
                provider_options: ProviderOptions::default(),
                transformed_request: LoggedRequest::default(),
                request: LoggedRequest::default(),
                original_response: None,
                response: None,
                cache: CacheLog::default(),
                hook_span_id: None,
                retry_attempt_count: 0,
                created_at: started_at,
                execution_time_ms: 0,
            },
            started_at,
            last: None,
        }
    }

    pub fn provider_options(&mut self, options: ProviderOptions) -> &mut Self {
        self.current.provider_options = options;
        self
    }

    pub fn transformed_request(&mut self, body: Value, headers: &HeaderMap) -> &mut Self {
        self.current.transformed_request = LoggedRequest {
            body,
            headers: redact_headers(headers),
        };
        self
    }

    pub fn request(&mut self, body: Value, headers: &HeaderMap) -> &mut Self {
        self.current.request = LoggedRequest {
            body,
            headers: redact_headers(headers),
        };
        self
    }

    pub fn original_response(&mut self, body: Option<Value>) -> &mut Self {
        self.current.original_response = body;
        self
    }

    pub fn response(&mut self, response: &GatewayResponse) -> &mut Self {
        self.current.response = Some(LoggedResponse::from_response(response));
        self
    }

    pub fn cache(
        &mut self,
        status: CacheStatus,
        key: Option<String>,
        mode: Option<CacheMode>,
        max_age: Option<u64>,
    ) -> &mut Self {
        self.current.cache = CacheLog {
            status: Some(status),
            key,
            mode,
            max_age,
        };
        self
    }

    pub fn hook_span_id(&mut self, id: impl Into<String>) -> &mut Self {
        self.current.hook_span_id = Some(id.into());
        self
    }

    pub fn retry_attempt_count(&mut self, count: u32) -> &mut Self {
        self.current.retry_attempt_count = count;
        self
    }

    /// Snapshots the fields set so far. Later snapshots replace earlier ones.
    pub fn log(&mut self) -> &LogObject {
        self.current.execution_time_ms = now_millis().saturating_sub(self.started_at);
        self.last.insert(self.current.clone())
    }

    pub fn is_logged(&self) -> bool {
        self.last.is_some()
    }

    /// Takes a final snapshot and closes the builder.
    pub fn commit(mut self) -> LogObject {
        self.log();
        self.last.take().unwrap_or(self.current)
    }
}

#[async_trait]
pub trait LogSink: Send + Sync {
    async fn write(&self, log: &LogObject);
}

/// Emits each record as one `tracing` event on the `gateway.log` target.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingLogSink;

#[async_trait]
impl LogSink for TracingLogSink {
    async fn write(&self, log: &LogObject) {
        match serde_json::to_string(log) {
            Ok(record) => tracing::info!(
                target: "gateway.log",
                trace_id = %log.trace_id,
                status = log.response.as_ref().map(|response| response.status),
                execution_time_ms = log.execution_time_ms,
                record = %record,
                "request log"
            ),
            Err(err) => tracing::warn!(error = %err, "request log not serializable"),
        }
    }
}

/// Keeps records in memory; for embedding and tests.
#[derive(Debug, Default, Clone)]
pub struct MemoryLogSink {
    records: Arc<Mutex<Vec<LogObject>>>,
}

impl MemoryLogSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn records(&self) -> Vec<LogObject> {
        self.records.lock().await.clone()
    }
}

#[async_trait]
impl LogSink for MemoryLogSink {
    async fn write(&self, log: &LogObject) {
        self.records.lock().await.push(log.clone());
    }
}

/// Fans committed records out to every sink.
#[derive(Clone)]
pub struct LogsService {
    sinks: Vec<Arc<dyn LogSink>>,
}

impl std::fmt::Debug for LogsService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogsService")
            .field("sinks", &self.sinks.len())
            .finish()
    }
}

impl Default for LogsService {
    fn default() -> Self {
        Self {
            sinks: vec![Arc::new(TracingLogSink)],
        }
    }
}

impl LogsService {
    pub fn new(sinks: Vec<Arc<dyn LogSink>>) -> Self {
        Self { sinks }
    }

    pub fn add_sink(&mut self, sink: Arc<dyn LogSink>) {
        self.sinks.push(sink);
    }

    pub async fn emit(&self, log: LogObject) {
        for sink in &self.sinks {
            sink.write(&log).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::{HeaderValue, StatusCode};
    use serde_json::json;

    #[test]
    fn repeated_logs_keep_the_latest_snapshot() {
        let mut builder = LogObjectBuilder::new("t-1");
        builder.retry_attempt_count(1);
        assert_eq!(builder.log().retry_attempt_count, 1);
        builder.retry_attempt_count(2).hook_span_id("span-1");
        builder.log();
        assert!(builder.is_logged());

        let record = builder.commit();
        assert_eq!(record.retry_attempt_count, 2);
        assert_eq!(record.hook_span_id.as_deref(), Some("span-1"));
        assert_eq!(record.trace_id, "t-1");
    }

    #[test]
    fn commit_without_prior_log_snapshots_current_fields() {
        let mut builder = LogObjectBuilder::new("t-2");
        builder.cache(CacheStatus::Miss, Some("k".to_string()), Some(CacheMode::Simple), Some(60));
        builder.response(&GatewayResponse::json(StatusCode::OK, json!({"ok": true})));
        let record = builder.commit();
        assert_eq!(record.cache.status, Some(CacheStatus::Miss));
        assert_eq!(record.cache.max_age, Some(60));
        let response = record.response.expect("response");
        assert_eq!(response.status, 200);
        assert_eq!(response.body["ok"], true);
    }

    #[test]
    fn secrets_are_redacted_in_logged_headers() {
        let mut headers = HeaderMap::new();
        headers.insert("authorization", HeaderValue::from_static("Bearer sk-live"));
        headers.insert("x-request-id", HeaderValue::from_static("r-1"));
        let redacted = redact_headers(&headers);
        assert_eq!(redacted["authorization"], REDACTED);
        assert_eq!(redacted["x-request-id"], "r-1");
    }

    #[tokio::test]
    async fn emit_reaches_every_sink() {
        let first = MemoryLogSink::new();
        let second = MemoryLogSink::new();
        let service = LogsService::new(vec![Arc::new(first.clone()), Arc::new(second.clone())]);
        service.emit(LogObjectBuilder::new("t-3").commit()).await;
        assert_eq!(first.records().await.len(), 1);
        assert_eq!(second.records().await[0].trace_id, "t-3");
    }
}
