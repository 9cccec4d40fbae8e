#![cfg(feature = "gateway")]

use axum::body::{Body, to_bytes};
use axum::http::{Request, StatusCode};
use guardrail_gateway::gateway::{
    CheckConfig, Gateway, GatewayConfig, GatewayHttpState, HookConfig, HookKind, ProviderConfig,
    headers,
};
use guardrail_gateway::utils::test_support::should_skip_httpmock;
use httpmock::Method::{GET, POST};
use httpmock::MockServer;
use serde_json::{Value, json};
use tower::util::ServiceExt;

const COMPLETION: &str = r#"{"id":"chatcmpl-1","object":"chat.completion","model":"gpt-4o-mini","choices":[{"index":0,"message":{"role":"assistant","content":"hello"},"finish_reason":"stop"}]}"#;

fn config(upstream: &MockServer) -> GatewayConfig {
    let mut config = GatewayConfig::default();
    config.providers =
        vec![ProviderConfig::new("openai", upstream.url("/v1")).with_api_key("sk-test")];
    config.retry.base_delay_ms = 1;
    config.retry.max_delay_ms = 5;
    config
}

fn contains_hook(words: &[&str], deny: bool) -> HookConfig {
    HookConfig {
        id: "banned-words".to_string(),
        checks: vec![CheckConfig::new(
            "default.contains",
            json!({"words": words, "operator": "none"}),
        )],
        deny,
        ..HookConfig::default()
    }
}

fn app(config: GatewayConfig) -> axum::Router {
    let gateway = Gateway::new(config).expect("gateway");
    guardrail_gateway::gateway::router(GatewayHttpState::new(gateway))
}

fn chat_request() -> axum::http::request::Builder {
    Request::builder()
        .method("POST")
        .uri("/v1/chat/completions")
        .header("content-type", "application/json")
}

fn chat_body(content: &str) -> Body {
    Body::from(
        json!({
            "model": "gpt-4o-mini",
            "messages": [{"role": "user", "content": content}]
        })
        .to_string(),
    )
}

async fn json_body(response: axum::response::Response) -> Value {
    let bytes = to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("body");
    serde_json::from_slice(&bytes).expect("json body")
}

fn header(response: &axum::response::Response, name: &str) -> String {
    response
        .headers()
        .get(name)
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default()
        .to_string()
}

#[tokio::test]
async fn denying_hook_returns_446_without_calling_upstream() {
    if should_skip_httpmock() {
        return;
    }
    let upstream = MockServer::start();
    let mock = upstream.mock(|when, then| {
        when.method(POST).path("/v1/chat/completions");
        then.status(200)
            .header("content-type", "application/json")
            .body(COMPLETION);
    });

    let mut config = config(&upstream);
    config.hooks.before_request_hooks = vec![contains_hook(&["password"], true)];
    let response = app(config)
        .oneshot(
            chat_request()
                .body(chat_body("my password is hunter2"))
                .expect("request"),
        )
        .await
        .expect("response");

    assert_eq!(response.status().as_u16(), 446);
    assert!(!header(&response, headers::TRACE_ID).is_empty());
    let body = json_body(response).await;
    assert_eq!(body["error"]["type"], "hooks_failed");
    assert_eq!(
        body["hook_results"]["before_request_hooks"][0]["verdict"],
        false
    );
    assert_eq!(
        body["hook_results"]["before_request_hooks"][0]["checks"][0]["data"]["found_words"][0],
        "password"
    );
    mock.assert_calls(0);
}

#[tokio::test]
async fn non_denying_failure_returns_246_with_upstream_body() {
    if should_skip_httpmock() {
        return;
    }
    let upstream = MockServer::start();
    let mock = upstream.mock(|when, then| {
        when.method(POST)
            .path("/v1/chat/completions")
            .header("authorization", "Bearer sk-test");
        then.status(200)
            .header("content-type", "application/json")
            .body(COMPLETION);
    });

    let mut config = config(&upstream);
    config.hooks.before_request_hooks = vec![contains_hook(&["password"], false)];
    let response = app(config)
        .oneshot(
            chat_request()
                .body(chat_body("what is a good password?"))
                .expect("request"),
        )
        .await
        .expect("response");

    assert_eq!(response.status().as_u16(), 246);
    assert_eq!(header(&response, headers::PROVIDER), "openai");
    assert_eq!(header(&response, headers::RETRY_ATTEMPT_COUNT), "0");
    let body = json_body(response).await;
    assert_eq!(body["id"], "chatcmpl-1");
    assert_eq!(body["provider"], "openai");
    assert_eq!(
        body["hook_results"]["before_request_hooks"][0]["verdict"],
        false
    );
    mock.assert_calls(1);
}

#[tokio::test]
async fn redacted_body_is_what_upstream_receives() {
    if should_skip_httpmock() {
        return;
    }
    let upstream = MockServer::start();
    let mock = upstream.mock(|when, then| {
        when.method(POST)
            .path("/v1/chat/completions")
            .body_includes("[EMAIL_ADDRESS]");
        then.status(200)
            .header("content-type", "application/json")
            .body(COMPLETION);
    });

    let mut config = config(&upstream);
    config.hooks.before_request_hooks = vec![HookConfig {
        id: "pii".to_string(),
        kind: HookKind::Mutator,
        checks: vec![CheckConfig::new(
            "default.pii",
            json!({"categories": ["email"], "redact": true}),
        )],
        ..HookConfig::default()
    }];
    let response = app(config)
        .oneshot(
            chat_request()
                .body(chat_body("reach me at jane@example.com"))
                .expect("request"),
        )
        .await
        .expect("response");

    assert_eq!(response.status(), StatusCode::OK);
    let body = json_body(response).await;
    assert_eq!(
        body["hook_results"]["before_request_hooks"][0]["transformed"],
        true
    );
    mock.assert_calls(1);
}

#[tokio::test]
async fn retry_header_policy_retries_then_proxies_last_status() {
    if should_skip_httpmock() {
        return;
    }
    let upstream = MockServer::start();
    let mock = upstream.mock(|when, then| {
        when.method(POST).path("/v1/chat/completions");
        then.status(500)
            .header("content-type", "application/json")
            .body(r#"{"error":{"message":"boom","type":"server_error"}}"#);
    });

    let response = app(config(&upstream))
        .oneshot(
            chat_request()
                .header(headers::RETRY, r#"{"attempts": 2, "on_status_codes": [500]}"#)
                .body(chat_body("hi"))
                .expect("request"),
        )
        .await
        .expect("response");

    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(header(&response, headers::RETRY_ATTEMPT_COUNT), "2");
    let body = json_body(response).await;
    assert_eq!(body["error"]["message"], "boom");
    mock.assert_calls(3);
}

#[tokio::test]
async fn cache_serves_second_identical_request() {
    if should_skip_httpmock() {
        return;
    }
    let upstream = MockServer::start();
    let mock = upstream.mock(|when, then| {
        when.method(POST).path("/v1/chat/completions");
        then.status(200)
            .header("content-type", "application/json")
            .body(COMPLETION);
    });

    let mut config = config(&upstream);
    config.cache.enabled = true;
    let app = app(config);
    let send = || {
        app.clone().oneshot(
            chat_request()
                .header(headers::CACHE, "simple")
                .body(chat_body("cache me"))
                .expect("request"),
        )
    };

    let first = send().await.expect("response");
    assert_eq!(first.status(), StatusCode::OK);
    assert_eq!(header(&first, headers::CACHE_STATUS), "MISS");

    let second = send().await.expect("response");
    assert_eq!(second.status(), StatusCode::OK);
    assert_eq!(header(&second, headers::CACHE_STATUS), "HIT");
    let body = json_body(second).await;
    assert_eq!(body["id"], "chatcmpl-1");
    mock.assert_calls(1);
}

#[tokio::test]
async fn webhook_verdict_from_request_config_header() {
    if should_skip_httpmock() {
        return;
    }
    let upstream = MockServer::start();
    let completion = upstream.mock(|when, then| {
        when.method(POST).path("/v1/chat/completions");
        then.status(200)
            .header("content-type", "application/json")
            .body(COMPLETION);
    });
    let webhook = upstream.mock(|when, then| {
        when.method(POST)
            .path("/guard")
            .body_includes("beforeRequestHook");
        then.status(200)
            .header("content-type", "application/json")
            .body(r#"{"verdict": false, "data": {"reason": "off-topic"}}"#);
    });

    let request_config = json!({
        "before_request_hooks": [{
            "id": "remote",
            "checks": [{"id": "default.webhook", "parameters": {"webhookUrl": upstream.url("/guard")}}]
        }]
    });
    let response = app(config(&upstream))
        .oneshot(
            chat_request()
                .header(headers::CONFIG, request_config.to_string())
                .body(chat_body("tell me about llamas"))
                .expect("request"),
        )
        .await
        .expect("response");

    assert_eq!(response.status().as_u16(), 246);
    let body = json_body(response).await;
    let check = &body["hook_results"]["before_request_hooks"][0]["checks"][0];
    assert_eq!(check["id"], "default.webhook");
    assert_eq!(check["data"]["reason"], "off-topic");
    webhook.assert_calls(1);
    completion.assert_calls(1);
}

#[tokio::test]
async fn proxy_route_forwards_any_method_and_query() {
    if should_skip_httpmock() {
        return;
    }
    let upstream = MockServer::start();
    let mock = upstream.mock(|when, then| {
        when.method(GET).path("/v1/models").query_param("limit", "2");
        then.status(200)
            .header("content-type", "application/json")
            .body(r#"{"object":"list","data":[]}"#);
    });

    let response = app(config(&upstream))
        .oneshot(
            Request::builder()
                .method("GET")
                .uri("/v1/proxy/models?limit=2")
                .body(Body::empty())
                .expect("request"),
        )
        .await
        .expect("response");

    assert_eq!(response.status(), StatusCode::OK);
    let body = json_body(response).await;
    assert_eq!(body["object"], "list");
    mock.assert_calls(1);
}
