#![cfg(feature = "gateway")]

use axum::body::{Body, to_bytes};
use axum::http::{Request, StatusCode};
use guardrail_gateway::gateway::{
    CheckConfig, Gateway, GatewayConfig, GatewayHttpState, HookConfig, ProviderConfig, headers,
};
use guardrail_gateway::utils::test_support::should_skip_httpmock;
use httpmock::Method::POST;
use httpmock::MockServer;
use serde_json::json;
use tower::util::ServiceExt;

const SSE: &str = "data: {\"id\":\"c1\",\"object\":\"chat.completion.chunk\",\"choices\":[{\"index\":0,\"delta\":{\"content\":\"he\"}}]}\n\ndata: {\"id\":\"c1\",\"object\":\"chat.completion.chunk\",\"choices\":[{\"index\":0,\"delta\":{\"content\":\"llo\"}}]}\n\ndata: [DONE]\n\n";

fn stream_request() -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri("/v1/chat/completions")
        .header("content-type", "application/json")
        .body(Body::from(
            json!({
                "model": "gpt-4o-mini",
                "stream": true,
                "messages": [{"role": "user", "content": "say hello"}]
            })
            .to_string(),
        ))
        .expect("request")
}

#[tokio::test]
async fn streaming_success_is_relayed_and_skips_after_hooks() {
    if should_skip_httpmock() {
        return;
    }
    let upstream = MockServer::start();
    let mock = upstream.mock(|when, then| {
        when.method(POST)
            .path("/v1/chat/completions")
            .body_includes("\"stream\":true");
        then.status(200)
            .header("content-type", "text/event-stream")
            .body(SSE);
    });

    let mut config = GatewayConfig::default();
    config.providers = vec![ProviderConfig::new("openai", upstream.url("/v1"))];
    config.hooks.after_request_hooks = vec![HookConfig {
        id: "after".to_string(),
        checks: vec![CheckConfig::new(
            "default.contains",
            json!({"words": ["hello"], "operator": "none"}),
        )],
        deny: true,
        ..HookConfig::default()
    }];
    let app = guardrail_gateway::gateway::router(GatewayHttpState::new(
        Gateway::new(config).expect("gateway"),
    ));

    let response = app.oneshot(stream_request()).await.expect("response");
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response
            .headers()
            .get("content-type")
            .and_then(|value| value.to_str().ok()),
        Some("text/event-stream")
    );
    assert!(response.headers().get(headers::TRACE_ID).is_some());
    let bytes = to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("body");
    assert_eq!(String::from_utf8_lossy(&bytes), SSE);
    mock.assert_calls(1);
}

#[tokio::test]
async fn streaming_error_is_buffered_as_json() {
    if should_skip_httpmock() {
        return;
    }
    let upstream = MockServer::start();
    upstream.mock(|when, then| {
        when.method(POST).path("/v1/chat/completions");
        then.status(429)
            .header("content-type", "application/json")
            .body(r#"{"error":{"message":"slow down","type":"rate_limit"}}"#);
    });

    let mut config = GatewayConfig::default();
    config.providers = vec![ProviderConfig::new("openai", upstream.url("/v1"))];
    let app = guardrail_gateway::gateway::router(GatewayHttpState::new(
        Gateway::new(config).expect("gateway"),
    ));

    let response = app.oneshot(stream_request()).await.expect("response");
    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    let bytes = to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("body");
    let body: serde_json::Value = serde_json::from_slice(&bytes).expect("json");
    assert_eq!(body["error"]["message"], "slow down");
}
