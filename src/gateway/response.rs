use std::collections::VecDeque;

use axum::http::{HeaderMap, HeaderValue, StatusCode};
use bytes::Bytes;
use futures_util::StreamExt;
use futures_util::stream::{self, BoxStream};
use serde_json::Value;

use super::cache::CacheStatus;
use super::endpoint::Endpoint;
use super::hooks::span::HookSpan;
use super::transform::{ProviderTransform, StreamChunkTransform};
use super::{
    GATEWAY_PROVIDER, GatewayError, GatewayResponse, ResponseBody, STATUS_HOOKS_DENIED,
    STATUS_HOOKS_FAILED, custom_status, headers, openai_error_body,
};
use crate::utils::http::{ByteStream, read_stream_limited};
use crate::utils::sse::{SSE_DONE, encode_sse_data, sse_data_stream};

pub enum UpstreamBody {
    Buffered(Bytes),
    Stream(ByteStream),
}

impl std::fmt::Debug for UpstreamBody {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            UpstreamBody::Buffered(bytes) => {
                f.debug_tuple("Buffered").field(&bytes.len()).finish()
            }
            UpstreamBody::Stream(_) => f.write_str("Stream(..)"),
        }
    }
}

/// A provider response before mapping.
#[derive(Debug)]
pub struct UpstreamResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: UpstreamBody,
}

fn content_type(headers: &HeaderMap) -> String {
    headers
        .get("content-type")
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default()
        .to_ascii_lowercase()
}

fn is_binary_content_type(content_type: &str) -> bool {
    content_type.starts_with("audio/")
        || content_type.starts_with("image/")
        || content_type.starts_with("application/octet-stream")
}

impl UpstreamResponse {
    pub fn json(status: StatusCode, value: &Value) -> Self {
        let mut headers = HeaderMap::new();
        headers.insert("content-type", HeaderValue::from_static("application/json"));
        Self {
            status,
            headers,
            body: UpstreamBody::Buffered(Bytes::from(
                serde_json::to_vec(value).unwrap_or_default(),
            )),
        }
    }

    /// Keeps successful streams and binary payloads as streams; buffers the rest.
    pub async fn from_reqwest(
        response: reqwest::Response,
        stream: bool,
        max_body_bytes: usize,
    ) -> Result<Self, GatewayError> {
        let status = response.status();
        let headers = response.headers().clone();
        let keep_streaming = (stream && status.is_success())
            || is_binary_content_type(&content_type(&headers));
        let body_stream: ByteStream = response
            .bytes_stream()
            .map(|chunk| chunk.map_err(std::io::Error::other))
            .boxed();
        if keep_streaming {
            return Ok(Self {
                status,
                headers,
                body: UpstreamBody::Stream(body_stream),
            });
        }
        let (bytes, truncated) = read_stream_limited(body_stream, max_body_bytes)
            .await
            .map_err(|err| GatewayError::Upstream {
                message: err.to_string(),
            })?;
        if truncated {
            return Err(GatewayError::Upstream {
                message: format!("upstream response exceeded {max_body_bytes} bytes"),
            });
        }
        Ok(Self {
            status,
            headers,
            body: UpstreamBody::Buffered(Bytes::from(bytes)),
        })
    }
}

/// Result of mapping: the client response plus the JSON kept for logging.
#[derive(Debug)]
pub struct MappedResponse {
    pub response: GatewayResponse,
    /// Body after the provider transform (what after-hooks inspect).
    pub response_json: Option<Value>,
    /// Body as the provider sent it.
    pub original_json: Option<Value>,
}

impl MappedResponse {
    fn plain(response: GatewayResponse) -> Self {
        Self {
            response,
            response_json: None,
            original_json: None,
        }
    }
}

pub struct ResponseService<'a> {
    transform: &'a dyn ProviderTransform,
    endpoint: Endpoint,
    stream: bool,
    strict_openai_compliance: bool,
    max_body_bytes: usize,
}

impl<'a> ResponseService<'a> {
    pub fn new(
        transform: &'a dyn ProviderTransform,
        endpoint: Endpoint,
        stream: bool,
        strict_openai_compliance: bool,
        max_body_bytes: usize,
    ) -> Self {
        Self {
            transform,
            endpoint,
            stream,
            strict_openai_compliance,
            max_body_bytes,
        }
    }

    pub async fn create(
        &self,
        upstream: UpstreamResponse,
        is_cache_hit: bool,
    ) -> Result<MappedResponse, GatewayError> {
        let UpstreamResponse {
            status,
            headers: upstream_headers,
            body,
        } = upstream;
        let content_type = content_type(&upstream_headers);

        // Cache-hit replay of a buffered JSON body as SSE.
        if self.stream && is_cache_hit {
            if let UpstreamBody::Buffered(bytes) = &body {
                if let Ok(json) = serde_json::from_slice::<Value>(bytes) {
                    if let Some(events) = self.transform.json_to_stream(self.endpoint, &json) {
                        return Ok(MappedResponse {
                            response: sse_response(status, replay_stream(events)),
                            response_json: Some(json.clone()),
                            original_json: Some(json),
                        });
                    }
                }
            }
        }

        if self.stream && status.is_success() {
            if let UpstreamBody::Stream(stream) = body {
                let stream = match self
                    .transform
                    .stream_transformer(self.endpoint, self.strict_openai_compliance)
                {
                    Some(transformer) => transform_sse_stream(stream, transformer),
                    None => stream,
                };
                return Ok(MappedResponse::plain(sse_response(status, stream)));
            }
            return self.buffered(status, upstream_headers, body, is_cache_hit).await;
        }

        if is_binary_content_type(&content_type) {
            let body = match body {
                UpstreamBody::Buffered(bytes) => ResponseBody::Bytes(bytes),
                UpstreamBody::Stream(stream) => ResponseBody::Stream(stream),
            };
            return Ok(MappedResponse::plain(GatewayResponse::new(
                status,
                upstream_headers,
                body,
            )));
        }

        if content_type.starts_with("text/html") || content_type.starts_with("text/plain") {
            let bytes = self.collect(body).await?;
            let text = String::from_utf8_lossy(&bytes);
            return Ok(
                match self
                    .transform
                    .transform_text(self.endpoint, status.as_u16(), &text)
                {
                    Some(json) => MappedResponse {
                        response: GatewayResponse::json(status, json.clone()),
                        response_json: Some(json),
                        original_json: None,
                    },
                    None => MappedResponse::plain(GatewayResponse::new(
                        status,
                        upstream_headers,
                        ResponseBody::Bytes(bytes),
                    )),
                },
            );
        }

        if status == StatusCode::NO_CONTENT && content_type.is_empty() {
            return Ok(MappedResponse::plain(GatewayResponse::new(
                status,
                upstream_headers,
                ResponseBody::Empty,
            )));
        }

        self.buffered(status, upstream_headers, body, is_cache_hit).await
    }

    async fn collect(&self, body: UpstreamBody) -> Result<Bytes, GatewayError> {
        match body {
            UpstreamBody::Buffered(bytes) => Ok(bytes),
            UpstreamBody::Stream(stream) => {
                let (bytes, _) = read_stream_limited(stream, self.max_body_bytes)
                    .await
                    .map_err(|err| GatewayError::Upstream {
                        message: err.to_string(),
                    })?;
                Ok(Bytes::from(bytes))
            }
        }
    }

    async fn buffered(
        &self,
        status: StatusCode,
        upstream_headers: HeaderMap,
        body: UpstreamBody,
        is_cache_hit: bool,
    ) -> Result<MappedResponse, GatewayError> {
        let bytes = self.collect(body).await?;
        if bytes.is_empty() {
            return Ok(MappedResponse::plain(GatewayResponse::new(
                status,
                upstream_headers,
                ResponseBody::Empty,
            )));
        }
        let Ok(original) = serde_json::from_slice::<Value>(&bytes) else {
            return Ok(MappedResponse::plain(GatewayResponse::new(
                status,
                upstream_headers,
                ResponseBody::Bytes(bytes),
            )));
        };
        let mapped = if is_cache_hit {
            original.clone()
        } else {
            self.transform.transform_response(
                self.endpoint,
                status.as_u16(),
                original.clone(),
                self.strict_openai_compliance,
            )
        };
        let mut response = GatewayResponse::json(status, mapped.clone());
        for (name, value) in &upstream_headers {
            if name.as_str() != "content-type" {
                response.headers.append(name.clone(), value.clone());
            }
        }
        Ok(MappedResponse {
            response,
            response_json: Some(mapped),
            original_json: Some(original),
        })
    }
}

fn sse_response(status: StatusCode, stream: ByteStream) -> GatewayResponse {
    let mut headers = HeaderMap::new();
    headers.insert("content-type", HeaderValue::from_static("text/event-stream"));
    headers.insert("cache-control", HeaderValue::from_static("no-cache"));
    GatewayResponse::new(status, headers, ResponseBody::Stream(stream))
}

fn replay_stream(events: Vec<String>) -> ByteStream {
    let mut frames: Vec<Result<Bytes, std::io::Error>> =
        events.iter().map(|event| Ok(encode_sse_data(event))).collect();
    frames.push(Ok(encode_sse_data(SSE_DONE)));
    stream::iter(frames).boxed()
}

/// Re-encodes an upstream SSE stream through `transformer`. Pull-based: the
/// upstream is only read when the client asks for more.
fn transform_sse_stream(
    upstream: ByteStream,
    transformer: Box<dyn StreamChunkTransform>,
) -> ByteStream {
    let data: BoxStream<'static, crate::Result<String>> = sse_data_stream(upstream);
    stream::unfold(
        (
            data,
            transformer,
            VecDeque::<Result<Bytes, std::io::Error>>::new(),
            false,
        ),
        |(mut data, mut transformer, mut buffer, mut done)| async move {
            loop {
                if let Some(item) = buffer.pop_front() {
                    return Some((item, (data, transformer, buffer, done)));
                }
                if done {
                    return None;
                }
                match data.next().await {
                    Some(Ok(payload)) => {
                        for out in transformer.transform(&payload) {
                            buffer.push_back(Ok(encode_sse_data(&out)));
                        }
                    }
                    Some(Err(err)) => {
                        buffer.push_back(Err(std::io::Error::other(err.to_string())));
                        done = true;
                    }
                    None => {
                        for out in transformer.finish() {
                            buffer.push_back(Ok(encode_sse_data(&out)));
                        }
                        buffer.push_back(Ok(encode_sse_data(SSE_DONE)));
                        done = true;
                    }
                }
            }
        },
    )
    .boxed()
}

/// Values stamped onto every client response.
#[derive(Debug, Clone)]
pub struct ResponseTelemetry<'a> {
    pub option_index: usize,
    pub trace_id: &'a str,
    pub retry_attempt_count: u32,
    pub cache_status: Option<CacheStatus>,
    pub provider: &'a str,
    pub strip_content_encoding: bool,
}

pub fn update_headers(headers: &mut HeaderMap, telemetry: &ResponseTelemetry<'_>) {
    headers.insert(
        headers::LAST_USED_OPTION_INDEX,
        HeaderValue::from(telemetry.option_index as u64),
    );
    if let Ok(value) = HeaderValue::from_str(telemetry.trace_id) {
        headers.insert(headers::TRACE_ID, value);
    }
    headers.insert(
        headers::RETRY_ATTEMPT_COUNT,
        HeaderValue::from(telemetry.retry_attempt_count),
    );
    if let Some(status) = telemetry.cache_status {
        headers.insert(
            headers::CACHE_STATUS,
            HeaderValue::from_static(status.as_str()),
        );
    }
    if telemetry.provider != GATEWAY_PROVIDER {
        if let Ok(value) = HeaderValue::from_str(telemetry.provider) {
            headers.insert(headers::PROVIDER, value);
        }
    }

    headers.remove("content-length");
    headers.remove("transfer-encoding");
    let brotli = headers
        .get("content-encoding")
        .and_then(|value| value.to_str().ok())
        .is_some_and(|value| value.trim().eq_ignore_ascii_case("br"));
    if brotli || telemetry.strip_content_encoding {
        headers.remove("content-encoding");
    }
}

/// The fixed client-facing body for a denied request.
pub fn denied_response(span: &HookSpan) -> GatewayResponse {
    let mut body = openai_error_body(
        "hooks_failed",
        None,
        "The guardrail checks defined in the config failed. You can find more information in the `hook_results` object.",
    );
    if let (Some(object), Some(results)) = (body.as_object_mut(), span.hook_results_json()) {
        object.insert("hook_results".to_string(), results);
    }
    GatewayResponse::json(
        custom_status(STATUS_HOOKS_DENIED, StatusCode::FORBIDDEN),
        body,
    )
}

/// Applies hook outcomes to a mapped response: denial replaces it outright;
/// otherwise results are attached and a `200` becomes `246` when any hook failed.
pub fn merge_hook_results(response: GatewayResponse, span: &HookSpan) -> GatewayResponse {
    if span.should_deny() {
        let mut denied = denied_response(span);
        for (name, value) in &response.headers {
            if name.as_str().starts_with(headers::GATEWAY_PREFIX) {
                denied.headers.insert(name.clone(), value.clone());
            }
        }
        return denied;
    }

    let mut response = response;
    if let Some(results) = span.hook_results_json() {
        if let Some(object) = response.json_body_mut().and_then(Value::as_object_mut) {
            object.insert("hook_results".to_string(), results);
        }
    }
    if response.status == StatusCode::OK && span.any_failed() {
        response.status = custom_status(STATUS_HOOKS_FAILED, StatusCode::OK);
    }
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::hooks::content::HookContext;
    use crate::gateway::hooks::{HookKind, HookPhase, HookResult, PhaseResults};
    use crate::gateway::transform::OpenAiCompatible;
    use serde_json::json;

    fn service(transform: &dyn ProviderTransform, stream: bool) -> ResponseService<'_> {
        ResponseService::new(transform, Endpoint::ChatComplete, stream, false, 1 << 20)
    }

    fn byte_stream(parts: &[&'static str]) -> ByteStream {
        stream::iter(
            parts
                .iter()
                .map(|part| Ok::<_, std::io::Error>(Bytes::from_static(part.as_bytes())))
                .collect::<Vec<_>>(),
        )
        .boxed()
    }

    async fn collect_stream(body: ResponseBody) -> String {
        let ResponseBody::Stream(mut stream) = body else {
            panic!("expected stream body");
        };
        let mut out = Vec::new();
        while let Some(chunk) = stream.next().await {
            out.extend_from_slice(&chunk.expect("chunk"));
        }
        String::from_utf8(out).expect("utf8")
    }

    fn span_with(verdict: bool, deny: bool) -> HookSpan {
        let mut span = HookSpan::new(
            "s",
            HookContext::new(json!({}), "openai", Endpoint::ChatComplete, Default::default()),
            Vec::new(),
            Vec::new(),
        );
        span.begin_phase(HookPhase::BeforeRequest).expect("before");
        span.finish_phase(PhaseResults::new(
            HookPhase::BeforeRequest,
            vec![HookResult {
                id: "h".to_string(),
                kind: HookKind::Guardrail,
                verdict,
                deny,
                is_async: false,
                checks: Vec::new(),
                feedback: None,
                error: None,
                transformed: false,
                event_type: HookPhase::BeforeRequest,
                execution_time_ms: 0,
                created_at: 0,
            }],
        ));
        span
    }

    struct Upper;

    impl StreamChunkTransform for Upper {
        fn transform(&mut self, data: &str) -> Vec<String> {
            vec![data.to_uppercase()]
        }

        fn finish(&mut self) -> Vec<String> {
            vec!["END".to_string()]
        }
    }

    struct UpperTransform;

    impl ProviderTransform for UpperTransform {
        fn stream_transformer(
            &self,
            _endpoint: Endpoint,
            _strict: bool,
        ) -> Option<Box<dyn StreamChunkTransform>> {
            Some(Box::new(Upper))
        }
    }

    #[tokio::test]
    async fn buffered_json_keeps_original_for_logging() {
        let transform = OpenAiCompatible::new("openai");
        let upstream = UpstreamResponse::json(
            StatusCode::OK,
            &json!({"object": "chat.completion", "choices": []}),
        );
        let mapped = service(&transform, false)
            .create(upstream, false)
            .await
            .expect("mapped");
        assert_eq!(mapped.response.status, StatusCode::OK);
        assert_eq!(mapped.response_json.as_ref().expect("json")["provider"], "openai");
        assert!(mapped.original_json.expect("original").get("provider").is_none());
    }

    #[tokio::test]
    async fn stream_passthrough_and_chunk_transform() {
        let raw = "data: {\"a\":1}\n\ndata: [DONE]\n\n";
        let passthrough = UpstreamResponse {
            status: StatusCode::OK,
            headers: HeaderMap::new(),
            body: UpstreamBody::Stream(byte_stream(&[raw])),
        };
        let transform = OpenAiCompatible::new("openai");
        let mapped = service(&transform, true)
            .create(passthrough, false)
            .await
            .expect("mapped");
        assert_eq!(mapped.response.headers["content-type"], "text/event-stream");
        assert_eq!(collect_stream(mapped.response.body).await, raw);

        let upstream = UpstreamResponse {
            status: StatusCode::OK,
            headers: HeaderMap::new(),
            body: UpstreamBody::Stream(byte_stream(&["data: ab\n\n", "data: cd\n\ndata: [DONE]\n\n"])),
        };
        let mapped = service(&UpperTransform, true)
            .create(upstream, false)
            .await
            .expect("mapped");
        assert_eq!(
            collect_stream(mapped.response.body).await,
            "data: AB\n\ndata: CD\n\ndata: END\n\ndata: [DONE]\n\n"
        );
    }

    #[tokio::test]
    async fn cache_hit_replays_json_as_sse() {
        let transform = OpenAiCompatible::new("openai");
        let upstream = UpstreamResponse::json(
            StatusCode::OK,
            &json!({
                "id": "c1",
                "object": "chat.completion",
                "choices": [{"index": 0, "message": {"role": "assistant", "content": "hi"}, "finish_reason": "stop"}]
            }),
        );
        let mapped = service(&transform, true)
            .create(upstream, true)
            .await
            .expect("mapped");
        let text = collect_stream(mapped.response.body).await;
        assert!(text.contains("chat.completion.chunk"));
        assert!(text.ends_with("data: [DONE]\n\n"));
    }

    #[tokio::test]
    async fn binary_text_and_no_content_dispatch() {
        let transform = OpenAiCompatible::new("openai");
        let mut headers = HeaderMap::new();
        headers.insert("content-type", HeaderValue::from_static("audio/mpeg"));
        let mapped = service(&transform, false)
            .create(
                UpstreamResponse {
                    status: StatusCode::OK,
                    headers,
                    body: UpstreamBody::Buffered(Bytes::from_static(b"\xff\xfb")),
                },
                false,
            )
            .await
            .expect("mapped");
        assert!(matches!(mapped.response.body, ResponseBody::Bytes(_)));

        let mut headers = HeaderMap::new();
        headers.insert("content-type", HeaderValue::from_static("text/plain"));
        let mapped = service(&transform, false)
            .create(
                UpstreamResponse {
                    status: StatusCode::BAD_GATEWAY,
                    headers,
                    body: UpstreamBody::Buffered(Bytes::from_static(b"upstream down")),
                },
                false,
            )
            .await
            .expect("mapped");
        assert_eq!(
            mapped.response.json_body().expect("json")["error"]["message"],
            "upstream down"
        );

        let mapped = service(&transform, false)
            .create(
                UpstreamResponse {
                    status: StatusCode::NO_CONTENT,
                    headers: HeaderMap::new(),
                    body: UpstreamBody::Buffered(Bytes::new()),
                },
                false,
            )
            .await
            .expect("mapped");
        assert!(matches!(mapped.response.body, ResponseBody::Empty));
    }

    #[test]
    fn update_headers_sets_telemetry_and_strips_framing() {
        let mut headers = HeaderMap::new();
        headers.insert("content-length", HeaderValue::from_static("10"));
        headers.insert("content-encoding", HeaderValue::from_static("br"));
        update_headers(
            &mut headers,
            &ResponseTelemetry {
                option_index: 0,
                trace_id: "t-1",
                retry_attempt_count: 2,
                cache_status: Some(CacheStatus::Miss),
                provider: "openai",
                strip_content_encoding: false,
            },
        );
        assert_eq!(headers[headers::TRACE_ID], "t-1");
        assert_eq!(headers[headers::RETRY_ATTEMPT_COUNT], "2");
        assert_eq!(headers[headers::CACHE_STATUS], "MISS");
        assert_eq!(headers[headers::PROVIDER], "openai");
        assert!(headers.get("content-length").is_none());
        assert!(headers.get("content-encoding").is_none());

        let mut headers = HeaderMap::new();
        headers.insert("content-encoding", HeaderValue::from_static("gzip"));
        update_headers(
            &mut headers,
            &ResponseTelemetry {
                option_index: 1,
                trace_id: "t-2",
                retry_attempt_count: 0,
                cache_status: None,
                provider: GATEWAY_PROVIDER,
                strip_content_encoding: false,
            },
        );
        assert!(headers.get(headers::PROVIDER).is_none());
        assert!(headers.get(headers::CACHE_STATUS).is_none());
        assert_eq!(headers["content-encoding"], "gzip");
    }

    #[test]
    fn merge_applies_deny_and_failure_statuses() {
        let ok = || GatewayResponse::json(StatusCode::OK, json!({"id": "x"}));

        let merged = merge_hook_results(ok(), &span_with(true, true));
        assert_eq!(merged.status, StatusCode::OK);
        assert_eq!(
            merged.json_body().expect("json")["hook_results"]["before_request_hooks"][0]["verdict"],
            true
        );

        let merged = merge_hook_results(ok(), &span_with(false, false));
        assert_eq!(merged.status.as_u16(), 246);
        assert_eq!(merged.json_body().expect("json")["id"], "x");

        let merged = merge_hook_results(ok(), &span_with(false, true));
        assert_eq!(merged.status.as_u16(), 446);
        let body = merged.json_body().expect("json");
        assert_eq!(body["error"]["type"], "hooks_failed");
        assert!(body.get("id").is_none());

        let not_ok = GatewayResponse::json(StatusCode::BAD_REQUEST, json!({}));
        let merged = merge_hook_results(not_ok, &span_with(false, false));
        assert_eq!(merged.status, StatusCode::BAD_REQUEST);
    }
}
