//! The request lifecycle.
//!
//! [`Gateway::try_post`] sequences the services for one request:
//!
//! 1. pre-request validator (may short-circuit),
//! 2. before-request hooks (a denying failure ends the request with `446`),
//! 3. cache lookup (a hit is replayed through the response service),
//! 4. provider dispatch with retry; each attempt is mapped and, when it is a
//!    buffered success, run through the after-request hooks,
//! 5. cache write-back, header stamping and one committed log record.
//!
//! Every branch ends in a [`GatewayResponse`]; errors are mapped to OpenAI
//! error envelopes rather than escaping.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::http::{HeaderMap, StatusCode};
use bytes::Bytes;
use serde_json::Value;
use tracing::Instrument as _;

use super::cache::{CacheBackend, CacheResponseObject, CacheService, CacheStatus, MemoryCacheBackend};
use super::config::GatewayConfig;
use super::endpoint::Endpoint;
use super::hooks::HookPhase;
use super::hooks::content::HookContext;
use super::hooks::manager::HooksManager;
use super::hooks::registry::{Check, CheckOptions, CheckRegistry};
use super::hooks::span::HookSpan;
use super::logs::{LogObjectBuilder, LogSink, LogsService, ProviderOptions};
use super::observability::{Observability, ObservabilitySnapshot};
use super::provider::{ProviderContext, ProviderRegistry, RequestHandler};
use super::request::{InboundRequest, RequestBody, RequestContext, generate_trace_id};
use super::response::{
    MappedResponse, ResponseService, ResponseTelemetry, UpstreamResponse, denied_response,
    merge_hook_results, update_headers,
};
use super::transform::ProviderTransform;
use super::{GATEWAY_PROVIDER, GatewayError, GatewayResponse};

/// Runs before any hook. Returning a response ends the request with it.
#[async_trait]
pub trait PreRequestValidator: Send + Sync {
    async fn validate(&self, context: &RequestContext) -> Option<GatewayResponse>;
}

/// What the lifecycle learned along the way; stamped onto the final response.
#[derive(Debug, Default)]
struct Outcome {
    retry_attempt_count: u32,
    cache_status: Option<CacheStatus>,
    /// The response was produced upstream (or from cache), not by the gateway.
    from_provider: bool,
}

/// A fully prepared upstream call, reused across retries.
struct PreparedCall {
    url: String,
    headers: HeaderMap,
    body: Bytes,
    handler: Option<Arc<dyn RequestHandler>>,
}

pub struct Gateway {
    config: Arc<GatewayConfig>,
    providers: ProviderRegistry,
    hooks: HooksManager,
    cache: CacheService,
    validator: Option<Arc<dyn PreRequestValidator>>,
    logs: LogsService,
    client: reqwest::Client,
    observability: Arc<Observability>,
}

impl std::fmt::Debug for Gateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Gateway")
            .field("providers", &self.providers)
            .field("hooks", &self.hooks)
            .field("cache", &self.cache)
            .field("validator", &self.validator.is_some())
            .field("logs", &self.logs)
            .finish()
    }
}

impl Gateway {
    /// Validates `config` and builds the provider registry, the hooks engine
    /// (with the built-in checks) and, when enabled, the in-memory cache.
    ///
    /// Inside a tokio runtime async hooks go through a bounded worker queue.
    pub fn new(config: GatewayConfig) -> Result<Self, GatewayError> {
        config.validate().map_err(|err| GatewayError::Config {
            reason: err.to_string(),
        })?;
        let providers = ProviderRegistry::from_config(&config)?;
        let hooks = HooksManager::new(
            CheckRegistry::with_builtin_checks(),
            CheckOptions {
                env: config.env.clone(),
            },
            Duration::from_millis(config.hooks.check_timeout_ms),
        )
        .with_async_queue(config.hooks.async_queue_capacity);
        let backend: Option<Arc<dyn CacheBackend>> = if config.cache.enabled {
            Some(Arc::new(MemoryCacheBackend::new(config.cache.clone())))
        } else {
            None
        };
        let cache = CacheService::new(backend, config.env.clone());
        let client = reqwest::Client::builder()
            .build()
            .map_err(|err| GatewayError::Config {
                reason: format!("http client: {err}"),
            })?;

        Ok(Self {
            config: Arc::new(config),
            providers,
            hooks,
            cache,
            validator: None,
            logs: LogsService::default(),
            client,
            observability: Arc::new(Observability::default()),
        })
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    pub fn hooks(&self) -> &HooksManager {
        &self.hooks
    }

    pub fn observability(&self) -> ObservabilitySnapshot {
        self.observability.snapshot()
    }

    pub fn register_check<C: Check + 'static>(&mut self, check: C) -> &mut Self {
        self.hooks.register_check(check);
        self
    }

    pub fn with_check<C: Check + 'static>(mut self, check: C) -> Self {
        self.hooks.register_check(check);
        self
    }

    pub fn with_cache_backend(mut self, backend: Arc<dyn CacheBackend>) -> Self {
        self.cache = CacheService::new(Some(backend), self.config.env.clone());
        self
    }

    pub fn with_validator(mut self, validator: Arc<dyn PreRequestValidator>) -> Self {
        self.validator = Some(validator);
        self
    }

    pub fn with_log_sink(mut self, sink: Arc<dyn LogSink>) -> Self {
        self.logs.add_sink(sink);
        self
    }

    pub fn with_http_client(mut self, client: reqwest::Client) -> Self {
        self.client = client;
        self
    }

    pub fn with_provider_transform(
        mut self,
        provider: &str,
        transform: Arc<dyn ProviderTransform>,
    ) -> Result<Self, GatewayError> {
        if !self.providers.set_transform(provider, transform) {
            return Err(GatewayError::ProviderNotFound {
                name: provider.to_string(),
            });
        }
        Ok(self)
    }

    pub fn with_request_handler(
        mut self,
        provider: &str,
        endpoint: Endpoint,
        handler: Arc<dyn RequestHandler>,
    ) -> Result<Self, GatewayError> {
        if !self.providers.set_request_handler(provider, endpoint, handler) {
            return Err(GatewayError::ProviderNotFound {
                name: provider.to_string(),
            });
        }
        Ok(self)
    }

    /// Entry point for one inbound request.
    pub async fn handle(&self, inbound: InboundRequest) -> GatewayResponse {
        self.observability.record_request();
        match RequestContext::from_parts(inbound, &self.config) {
            Ok(context) => self.try_post(context).await,
            Err(err) => {
                let trace_id = generate_trace_id();
                tracing::info!(trace_id = %trace_id, error = %err, "rejected request");
                let mut response = err.to_response();
                self.finish(&mut response, &trace_id, 0, &Outcome::default(), None);
                let mut log = LogObjectBuilder::new(trace_id);
                log.response(&response);
                self.logs.emit(log.commit()).await;
                response
            }
        }
    }

    pub async fn try_post(&self, context: RequestContext) -> GatewayResponse {
        let request_span = tracing::info_span!(
            "gateway.request",
            provider = %context.provider(),
            endpoint = %context.endpoint(),
            trace_id = %context.trace_id(),
            status = tracing::field::Empty,
            cache = tracing::field::Empty,
        );
        self.run(context).instrument(request_span).await
    }

    async fn run(&self, mut context: RequestContext) -> GatewayResponse {
        let mut log = LogObjectBuilder::new(context.trace_id().to_string());
        let mut outcome = Outcome::default();

        let result = self.lifecycle(&mut context, &mut log, &mut outcome).await;
        let mut response = match result {
            Ok(response) => response,
            Err(err) => {
                tracing::warn!(error = %err, "request failed");
                err.to_response()
            }
        };

        let provider = outcome.from_provider.then_some(context.provider());
        self.finish(
            &mut response,
            context.trace_id(),
            context.option_index(),
            &outcome,
            provider,
        );

        let current = tracing::Span::current();
        current.record("status", tracing::field::display(response.status.as_u16()));
        if let Some(status) = outcome.cache_status {
            current.record("cache", tracing::field::display(status.as_str()));
        }

        log.retry_attempt_count(outcome.retry_attempt_count)
            .response(&response);
        self.logs.emit(log.commit()).await;
        response
    }

    fn finish(
        &self,
        response: &mut GatewayResponse,
        trace_id: &str,
        option_index: usize,
        outcome: &Outcome,
        provider: Option<&str>,
    ) {
        update_headers(
            &mut response.headers,
            &ResponseTelemetry {
                option_index,
                trace_id,
                retry_attempt_count: outcome.retry_attempt_count,
                cache_status: outcome.cache_status,
                provider: provider.unwrap_or(GATEWAY_PROVIDER),
                strip_content_encoding: self.config.strip_content_encoding,
            },
        );
    }

    async fn lifecycle(
        &self,
        context: &mut RequestContext,
        log: &mut LogObjectBuilder,
        outcome: &mut Outcome,
    ) -> Result<GatewayResponse, GatewayError> {
        let provider = self.providers.context(context.provider())?;
        let mut span = self.hooks.create_span(
            generate_trace_id(),
            HookContext::new(
                context.request_json(),
                context.provider().to_string(),
                context.endpoint(),
                context.metadata().clone(),
            ),
            context.before_hooks().to_vec(),
            context.after_hooks().to_vec(),
        );
        log.hook_span_id(span.id())
            .provider_options(ProviderOptions {
                provider: context.provider().to_string(),
                endpoint: context.endpoint().to_string(),
                url: None,
                option_index: context.option_index(),
                stream: context.stream(),
            })
            .request(context.request_json(), context.headers());

        if let Some(validator) = self.validator.as_ref() {
            if let Some(response) = validator.validate(context).await {
                tracing::info!(status = response.status.as_u16(), "validator short-circuit");
                return Ok(response);
            }
        }

        self.hooks
            .execute_hooks(&mut span, HookPhase::BeforeRequest)
            .await?;
        if span.should_deny() {
            self.observability.record_hooks_denied();
            return Ok(denied_response(&span));
        }

        let request_body = match span.transformed_request_body() {
            Some(body) => body.clone(),
            None => context.request_json(),
        };
        log.request(request_body.clone(), context.headers());

        let service = ResponseService::new(
            provider.transform().as_ref(),
            context.endpoint(),
            context.stream(),
            context.strict_openai_compliance(),
            self.config.max_body_bytes,
        );

        let cached = self
            .cache
            .get_cached_response(context, context.headers(), &request_body, &span)
            .await;
        outcome.cache_status = Some(cached.cache_status);
        log.cache(
            cached.cache_status,
            cached.cache_key.clone(),
            context.cache().mode,
            context.cache().max_age,
        );
        if let Some(response) = self.serve_cached(&service, &cached, log, outcome).await? {
            return Ok(response);
        }

        let call = self.prepare(provider, context, &request_body)?;
        log.provider_options(ProviderOptions {
            provider: context.provider().to_string(),
            endpoint: context.endpoint().to_string(),
            url: Some(call.url.clone()),
            option_index: context.option_index(),
            stream: context.stream(),
        })
        .transformed_request(
            context.transformed_body().cloned().unwrap_or(Value::Null),
            &call.headers,
        );

        let mut retries = 0u32;
        let (response, mapped_json) = loop {
            self.observability.record_upstream_call();
            let attempt = match self.dispatch(provider, context, &call).await {
                Ok(upstream) => {
                    let upstream_headers = upstream.headers.clone();
                    let mapped = service.create(upstream, false).await?;
                    outcome.from_provider = true;
                    log.original_response(mapped.original_json.clone());
                    let (response, json) = self.after_hooks(&mut span, mapped, context).await?;
                    Ok((response, json, upstream_headers))
                }
                Err(err) => {
                    self.observability.record_upstream_error();
                    Err(err)
                }
            };

            let effective_status = match &attempt {
                Ok((response, _, _)) => response.status.as_u16(),
                Err(err) => err.status().as_u16(),
            };
            if !context.retry().should_retry(effective_status, retries) {
                outcome.retry_attempt_count = retries;
                let (response, json, _) = attempt?;
                break (response, json);
            }

            let delay = match &attempt {
                Ok((_, _, upstream_headers)) => {
                    self.config
                        .retry
                        .delay_for(context.retry(), upstream_headers, retries)
                }
                Err(_) => self.config.retry.backoff_delay(retries),
            };
            drop(attempt);
            retries += 1;
            self.observability.record_retry();
            self.hooks
                .reset_hook_result(&mut span, HookPhase::AfterRequest);
            tracing::info!(
                status = effective_status,
                retry = retries,
                delay_ms = delay.as_millis() as u64,
                "retrying upstream call"
            );
            tokio::time::sleep(delay).await;
        };

        if span.should_deny() {
            self.observability.record_hooks_denied();
        } else if span.any_failed() {
            self.observability.record_hooks_failed();
        }

        if cached.cache_status == CacheStatus::Miss && !span.should_deny() {
            if let (Some(key), Some(json)) = (cached.cache_key.as_deref(), mapped_json.as_ref()) {
                self.cache.store_response(context, key, json).await;
            }
        }
        Ok(response)
    }

    async fn serve_cached(
        &self,
        service: &ResponseService<'_>,
        cached: &CacheResponseObject,
        log: &mut LogObjectBuilder,
        outcome: &mut Outcome,
    ) -> Result<Option<GatewayResponse>, GatewayError> {
        if !cached.is_hit() {
            return Ok(None);
        }
        let Some(hit) = cached.cache_response.as_ref() else {
            return Ok(None);
        };
        self.observability.record_cache_hit();
        let mapped = service
            .create(UpstreamResponse::json(hit.status, &hit.body), true)
            .await?;
        outcome.from_provider = true;
        log.original_response(mapped.original_json);
        Ok(Some(mapped.response))
    }

    /// Resolves the URL and headers and transforms the body once; retries
    /// resend the same bytes.
    fn prepare(
        &self,
        provider: ProviderContext<'_>,
        context: &mut RequestContext,
        request_body: &Value,
    ) -> Result<PreparedCall, GatewayError> {
        let url = provider.get_full_url(context);
        context.record_url(url.clone());
        let headers = provider.get_headers(context);
        let handler = provider.get_request_handler(context.endpoint());

        let body = if !matches!(context.body(), RequestBody::Json(_)) {
            match context.body() {
                RequestBody::Raw(bytes) => bytes.clone(),
                _ => Bytes::new(),
            }
        } else if handler.is_some() {
            context.record_transformed_body(request_body.clone());
            Bytes::new()
        } else {
            let transformed = provider.transform_request(context, request_body)?;
            let bytes = serde_json::to_vec(&transformed).map_err(|err| {
                GatewayError::InvalidRequest {
                    reason: format!("request body not serializable: {err}"),
                }
            })?;
            context.record_transformed_body(transformed);
            Bytes::from(bytes)
        };

        Ok(PreparedCall {
            url,
            headers,
            body,
            handler,
        })
    }

    async fn dispatch(
        &self,
        provider: ProviderContext<'_>,
        context: &RequestContext,
        call: &PreparedCall,
    ) -> Result<UpstreamResponse, GatewayError> {
        let send = async {
            if let Some(handler) = call.handler.as_ref() {
                return handler.handle(provider.config(), context, &self.client).await;
            }
            let mut request = self
                .client
                .request(context.method().clone(), call.url.as_str())
                .headers(call.headers.clone());
            if !call.body.is_empty() {
                request = request.body(call.body.clone());
            }
            let response = request.send().await.map_err(|err| GatewayError::Upstream {
                message: err.to_string(),
            })?;
            UpstreamResponse::from_reqwest(response, context.stream(), self.config.max_body_bytes)
                .await
        };

        let Some(timeout) = context.request_timeout() else {
            return send.await;
        };
        match tokio::time::timeout(timeout, send).await {
            Ok(result) => result,
            Err(_) => Err(GatewayError::Timeout {
                timeout_ms: timeout.as_millis() as u64,
            }),
        }
    }

    /// Runs the after-request phase on a buffered success and merges every
    /// hook outcome into the response. Also returns the body to cache: only a
    /// buffered upstream `200`, after any after-hook rewrite.
    async fn after_hooks(
        &self,
        span: &mut HookSpan,
        mapped: MappedResponse,
        context: &RequestContext,
    ) -> Result<(GatewayResponse, Option<Value>), GatewayError> {
        let MappedResponse {
            mut response,
            response_json,
            ..
        } = mapped;

        let runs_after = !context.stream()
            && !response.is_streaming()
            && response.status.is_success()
            && response_json.is_some();
        let upstream_ok = response.status == StatusCode::OK && !response.is_streaming();
        let mut cacheable = response_json;
        if runs_after {
            if let Some(json) = cacheable.clone() {
                span.set_response(json, response.status.as_u16());
            }
            self.hooks
                .execute_hooks(span, HookPhase::AfterRequest)
                .await?;
            if let Some(transformed) = span.transformed_response_body() {
                if let Some(body) = response.json_body_mut() {
                    *body = transformed.clone();
                }
                cacheable = Some(transformed.clone());
            }
        }

        if !upstream_ok {
            cacheable = None;
        }
        Ok((merge_hook_results(response, span), cacheable))
    }
}
