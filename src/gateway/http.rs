use std::sync::Arc;

use axum::body::{Body, to_bytes};
use axum::extract::{Request, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{any, get, post};
use axum::{Json, Router};
use serde::Serialize;

use super::orchestrator::Gateway;
use super::request::InboundRequest;
use super::{GatewayResponse, ObservabilitySnapshot, ResponseBody, openai_error_body};

#[derive(Clone)]
pub struct GatewayHttpState {
    gateway: Arc<Gateway>,
    max_body_bytes: usize,
}

impl std::fmt::Debug for GatewayHttpState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GatewayHttpState")
            .field("max_body_bytes", &self.max_body_bytes)
            .finish()
    }
}

impl GatewayHttpState {
    pub fn new(gateway: Gateway) -> Self {
        let max_body_bytes = gateway.config().max_body_bytes;
        Self {
            gateway: Arc::new(gateway),
            max_body_bytes,
        }
    }

    pub fn with_max_body_bytes(mut self, max_body_bytes: usize) -> Self {
        self.max_body_bytes = max_body_bytes;
        self
    }

    pub fn gateway(&self) -> &Gateway {
        &self.gateway
    }
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
}

pub fn router(state: GatewayHttpState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics))
        .route("/v1/chat/completions", post(handle_request))
        .route("/v1/completions", post(handle_request))
        .route("/v1/embeddings", post(handle_request))
        .route("/v1/images/generations", post(handle_request))
        .route("/v1/audio/speech", post(handle_request))
        .route("/v1/audio/transcriptions", post(handle_request))
        .route("/v1/audio/translations", post(handle_request))
        .route("/v1/batches", post(handle_request).get(handle_request))
        .route("/v1/proxy/*path", any(handle_request))
        .fallback(handle_fallback)
        .with_state(state)
}

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse { status: "ok" })
}

async fn metrics(State(state): State<GatewayHttpState>) -> Json<ObservabilitySnapshot> {
    Json(state.gateway.observability())
}

async fn handle_fallback() -> Response {
    GatewayResponse::json(
        StatusCode::NOT_FOUND,
        openai_error_body("invalid_request_error", Some("not_found"), "unknown route"),
    )
    .into_response()
}

async fn handle_request(State(state): State<GatewayHttpState>, request: Request) -> Response {
    let (parts, body) = request.into_parts();
    let path = parts
        .uri
        .path_and_query()
        .map(|path| path.as_str().to_string())
        .unwrap_or_else(|| parts.uri.path().to_string());
    let body = match to_bytes(body, state.max_body_bytes).await {
        Ok(body) => body,
        Err(err) => {
            tracing::info!(path = %path, error = %err, "request body rejected");
            return GatewayResponse::json(
                StatusCode::PAYLOAD_TOO_LARGE,
                openai_error_body(
                    "invalid_request_error",
                    Some("body_too_large"),
                    format!("request body exceeds {} bytes", state.max_body_bytes),
                ),
            )
            .into_response();
        }
    };

    let inbound = InboundRequest::new(parts.method, path, parts.headers, body);
    state.gateway.handle(inbound).await.into_response()
}

impl IntoResponse for GatewayResponse {
    fn into_response(self) -> Response {
        let GatewayResponse {
            status,
            headers,
            body,
        } = self;
        let body = match body {
            ResponseBody::Empty => Body::empty(),
            ResponseBody::Json(value) => match serde_json::to_vec(&value) {
                Ok(bytes) => Body::from(bytes),
                Err(err) => {
                    tracing::warn!(error = %err, "response body not serializable");
                    return StatusCode::INTERNAL_SERVER_ERROR.into_response();
                }
            },
            ResponseBody::Bytes(bytes) => Body::from(bytes),
            ResponseBody::Stream(stream) => Body::from_stream(stream),
        };
        let mut response = Response::new(body);
        *response.status_mut() = status;
        *response.headers_mut() = headers;
        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::{GatewayConfig, ProviderConfig};
    use tower::ServiceExt as _;

    fn app() -> Router {
        let mut config = GatewayConfig::default();
        config.providers = vec![ProviderConfig::new("openai", "http://127.0.0.1:9/v1")];
        router(GatewayHttpState::new(Gateway::new(config).expect("gateway")).with_max_body_bytes(16))
    }

    #[tokio::test]
    async fn health_is_ok() {
        let response = app()
            .oneshot(
                axum::http::Request::get("/health")
                    .body(Body::empty())
                    .expect("request"),
            )
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn oversized_body_is_413() {
        let response = app()
            .oneshot(
                axum::http::Request::post("/v1/chat/completions")
                    .header("content-type", "application/json")
                    .body(Body::from(vec![b' '; 64]))
                    .expect("request"),
            )
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
    }

    #[tokio::test]
    async fn unknown_route_is_404() {
        let response = app()
            .oneshot(
                axum::http::Request::get("/nope")
                    .body(Body::empty())
                    .expect("request"),
            )
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
