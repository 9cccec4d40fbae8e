use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::FutureExt;
use futures_util::future::join_all;
use serde_json::Value;

use super::content::HookContext;
use super::queue::{AsyncHookQueue, DeferredHook};
use super::registry::{CheckOptions, CheckRegistry};
use super::span::HookSpan;
use super::{
    CheckConfig, CheckError, FeedbackMetadata, GuardrailCheckResult, HookConfig, HookFeedback,
    HookKind, HookPhase, HookResult, PhaseResults, SyncHook,
};
use crate::gateway::{GatewayError, now_millis};

/// Executes checks and hooks against a context. Cheap to clone; async hooks
/// carry a clone onto the queue.
#[derive(Clone)]
pub(crate) struct HookRunner {
    registry: Arc<CheckRegistry>,
    options: Arc<CheckOptions>,
    default_timeout: Duration,
}

impl HookRunner {
    pub(crate) async fn execute_check(
        &self,
        check: &CheckConfig,
        context: &HookContext,
        phase: HookPhase,
    ) -> GuardrailCheckResult {
        let started = Instant::now();
        let created_at = now_millis();
        let mut result = GuardrailCheckResult {
            id: check.id.clone(),
            verdict: false,
            error: None,
            data: Value::Null,
            transformed: false,
            transformed_data: None,
            execution_time_ms: 0,
            created_at,
        };

        let Some(plugin) = self.registry.get(&check.id) else {
            result.error = Some(CheckError::unknown_check(&check.id));
            return result;
        };

        if let Some(target) = context.target(phase) {
            if !plugin.supports(target.shape()) {
                result.verdict = true;
                result.error = Some(CheckError::new(
                    "UnsupportedContent",
                    format!("check `{}` does not support {:?} content", check.id, target.shape()),
                ));
                return result;
            }
        }

        let empty = Value::Object(Default::default());
        let parameters = if check.parameters.is_null() {
            &empty
        } else {
            &check.parameters
        };
        let timeout_ms = check
            .timeout_ms
            .map(Duration::from_millis)
            .unwrap_or(self.default_timeout);
        let call = AssertUnwindSafe(plugin.execute(context, parameters, phase, &self.options))
            .catch_unwind();

        match tokio::time::timeout(timeout_ms, call).await {
            Ok(Ok(Ok(outcome))) => {
                result.verdict = outcome.verdict;
                result.error = outcome.error;
                result.data = outcome.data;
                result.transformed = outcome.transformed && outcome.transformed_data.is_some();
                result.transformed_data = outcome.transformed_data.filter(|_| result.transformed);
            }
            Ok(Ok(Err(err))) => {
                result.error = Some(err);
            }
            Ok(Err(panic)) => {
                tracing::warn!(check = %check.id, "guardrail check panicked");
                result.error = Some(CheckError::from_panic(panic));
            }
            Err(_) => {
                result.error = Some(CheckError::timed_out(
                    &check.id,
                    timeout_ms.as_millis() as u64,
                ));
            }
        }
        result.execution_time_ms = started.elapsed().as_millis() as u64;
        result
    }

    async fn run_checks(
        &self,
        hook: &HookConfig,
        context: &HookContext,
        phase: HookPhase,
    ) -> Result<Vec<GuardrailCheckResult>, CheckError> {
        let enabled: Vec<&CheckConfig> = hook.checks.iter().filter(|c| c.is_enabled).collect();
        if enabled.is_empty() {
            return Err(CheckError::new(
                "HookError",
                format!("hook `{}` has no enabled checks", hook.id),
            ));
        }

        if hook.kind != HookKind::Mutator {
            return Ok(join_all(
                enabled
                    .into_iter()
                    .map(|check| self.execute_check(check, context, phase)),
            )
            .await);
        }

        // Mutators chain: each check sees the previous rewrite.
        let mut local = context.clone();
        let mut results = Vec::with_capacity(enabled.len());
        for check in enabled {
            let result = self.execute_check(check, &local, phase).await;
            if let Some(json) = result
                .transformed_data
                .as_ref()
                .and_then(|data| data.for_phase(phase))
            {
                local.apply_transform(phase, json.clone());
            }
            results.push(result);
        }
        Ok(results)
    }

    pub(crate) async fn execute_hook(
        &self,
        hook: &HookConfig,
        context: &HookContext,
        phase: HookPhase,
    ) -> HookResult {
        let started = Instant::now();
        let created_at = now_millis();
        let outcome = AssertUnwindSafe(self.run_checks(hook, context, phase))
            .catch_unwind()
            .await;
        let (checks, error) = match outcome {
            Ok(Ok(checks)) => (checks, None),
            Ok(Err(err)) => (Vec::new(), Some(err)),
            Err(panic) => (Vec::new(), Some(CheckError::from_panic(panic))),
        };

        let verdict = checks.iter().all(|check| check.verdict);
        let transformed = checks.iter().any(|check| check.transformed);
        let feedback = feedback_for(hook, verdict, &checks);
        if let Some(err) = &error {
            tracing::debug!(hook = %hook.id, error = %err, "hook finished without running checks");
        }

        HookResult {
            id: hook.id.clone(),
            kind: hook.kind,
            verdict,
            deny: hook.deny,
            is_async: hook.is_async,
            checks,
            feedback,
            error,
            transformed,
            event_type: phase,
            execution_time_ms: started.elapsed().as_millis() as u64,
            created_at,
        }
    }

    pub(crate) async fn execute_hooks_sync(
        &self,
        hooks: &[SyncHook],
        context: &HookContext,
        phase: HookPhase,
    ) -> PhaseResults {
        let results = join_all(
            hooks
                .iter()
                .map(|hook| self.execute_hook(&hook.0, context, phase)),
        )
        .await;
        PhaseResults::new(phase, results)
    }
}

fn feedback_for(
    hook: &HookConfig,
    verdict: bool,
    checks: &[GuardrailCheckResult],
) -> Option<HookFeedback> {
    let directive = if verdict {
        hook.on_success.as_ref()
    } else {
        hook.on_fail.as_ref()
    }?;

    let ids = |predicate: fn(&GuardrailCheckResult) -> bool| {
        checks
            .iter()
            .filter(|check| predicate(check))
            .map(|check| check.id.clone())
            .collect::<Vec<_>>()
    };
    Some(HookFeedback {
        value: directive.value,
        weight: directive.weight,
        metadata: FeedbackMetadata {
            successful_checks: ids(|check| check.verdict && check.error.is_none()),
            failed_checks: ids(|check| !check.verdict),
            errored_checks: ids(|check| check.error.is_some()),
            extra: directive.metadata.clone(),
        },
    })
}

/// Runs each phase's hooks for a request and records the results on its span.
#[derive(Clone)]
pub struct HooksManager {
    runner: HookRunner,
    queue: Option<AsyncHookQueue>,
}

impl std::fmt::Debug for HooksManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HooksManager")
            .field("registry", &self.runner.registry)
            .field("default_timeout", &self.runner.default_timeout)
            .field("async_queue", &self.queue.is_some())
            .finish()
    }
}

impl HooksManager {
    pub fn new(registry: CheckRegistry, options: CheckOptions, default_timeout: Duration) -> Self {
        Self {
            runner: HookRunner {
                registry: Arc::new(registry),
                options: Arc::new(options),
                default_timeout,
            },
            queue: None,
        }
    }

    /// Routes async hooks through a bounded worker queue. Without a running
    /// tokio runtime the manager keeps spawning them directly.
    pub fn with_async_queue(mut self, capacity: usize) -> Self {
        self.queue = AsyncHookQueue::spawn(capacity);
        self
    }

    pub fn registry(&self) -> &CheckRegistry {
        &self.runner.registry
    }

    pub fn register_check<C: super::registry::Check + 'static>(&mut self, check: C) {
        Arc::make_mut(&mut self.runner.registry).register(check);
    }

    pub fn create_span(
        &self,
        id: impl Into<String>,
        context: HookContext,
        before_hooks: Vec<HookConfig>,
        after_hooks: Vec<HookConfig>,
    ) -> HookSpan {
        HookSpan::new(id, context, before_hooks, after_hooks)
    }

    pub async fn execute_check(
        &self,
        check: &CheckConfig,
        context: &HookContext,
        phase: HookPhase,
    ) -> GuardrailCheckResult {
        self.runner.execute_check(check, context, phase).await
    }

    pub async fn execute_hook(
        &self,
        hook: &HookConfig,
        context: &HookContext,
        phase: HookPhase,
    ) -> HookResult {
        self.runner.execute_hook(hook, context, phase).await
    }

    pub async fn execute_hooks_sync(
        &self,
        hooks: &[SyncHook],
        context: &HookContext,
        phase: HookPhase,
    ) -> PhaseResults {
        self.runner.execute_hooks_sync(hooks, context, phase).await
    }

    /// Runs one phase on `span`: dispatches its async hooks, awaits its sync
    /// hooks, splices rewritten content back and records the results.
    pub async fn execute_hooks(
        &self,
        span: &mut HookSpan,
        phase: HookPhase,
    ) -> Result<Arc<PhaseResults>, GatewayError> {
        span.begin_phase(phase)?;

        for hook in &span.hooks(phase).deferred {
            self.dispatch(DeferredHook {
                runner: self.runner.clone(),
                hook: hook.clone(),
                context: span.context().clone(),
                phase,
                span_id: span.id().to_string(),
            });
        }

        let results = self
            .runner
            .execute_hooks_sync(&span.hooks(phase).sync, span.context(), phase)
            .await;

        let rewrites: Vec<Value> = results
            .results
            .iter()
            .flat_map(|hook| hook.checks.iter())
            .filter_map(|check| check.transformed_data.as_ref())
            .filter_map(|data| data.for_phase(phase).cloned())
            .collect();
        for json in rewrites {
            span.apply_transform(phase, json);
        }

        tracing::debug!(
            span_id = %span.id(),
            phase = phase.as_str(),
            hooks = results.results.len(),
            should_deny = results.should_deny,
            "hooks phase finished"
        );
        Ok(span.finish_phase(results))
    }

    pub fn reset_hook_result(&self, span: &mut HookSpan, phase: HookPhase) {
        span.reset_hook_results(phase);
    }

    fn dispatch(&self, job: DeferredHook) {
        match &self.queue {
            Some(queue) => queue.dispatch(job),
            None => match tokio::runtime::Handle::try_current() {
                Ok(handle) => {
                    handle.spawn(job.run());
                }
                Err(_) => {
                    tracing::warn!(hook = %job.hook.0.id, "no runtime for async hook; dropped");
                }
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::endpoint::Endpoint;
    use crate::gateway::hooks::registry::{Check, CheckOutcome};
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Fixed {
        name: &'static str,
        verdict: bool,
    }

    #[async_trait]
    impl Check for Fixed {
        fn name(&self) -> &str {
            self.name
        }

        async fn execute(
            &self,
            _context: &HookContext,
            _parameters: &Value,
            _phase: HookPhase,
            _options: &CheckOptions,
        ) -> Result<CheckOutcome, CheckError> {
            Ok(CheckOutcome::verdict(self.verdict))
        }
    }

    struct Panics;

    #[async_trait]
    impl Check for Panics {
        fn name(&self) -> &str {
            "test.panics"
        }

        async fn execute(
            &self,
            _context: &HookContext,
            _parameters: &Value,
            _phase: HookPhase,
            _options: &CheckOptions,
        ) -> Result<CheckOutcome, CheckError> {
            panic!("plugin exploded");
        }
    }

    struct Slow;

    #[async_trait]
    impl Check for Slow {
        fn name(&self) -> &str {
            "test.slow"
        }

        async fn execute(
            &self,
            _context: &HookContext,
            _parameters: &Value,
            _phase: HookPhase,
            _options: &CheckOptions,
        ) -> Result<CheckOutcome, CheckError> {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(CheckOutcome::pass())
        }
    }

    /// Appends `!` to the request text and counts invocations.
    struct Shout(Arc<AtomicUsize>);

    #[async_trait]
    impl Check for Shout {
        fn name(&self) -> &str {
            "test.shout"
        }

        async fn execute(
            &self,
            context: &HookContext,
            _parameters: &Value,
            phase: HookPhase,
            _options: &CheckOptions,
        ) -> Result<CheckOutcome, CheckError> {
            self.0.fetch_add(1, Ordering::SeqCst);
            let snapshot = context.target(phase).expect("target");
            let json = snapshot.map_text(|text| format!("{text}!"));
            Ok(CheckOutcome::pass().with_transform(phase, json))
        }
    }

    fn manager() -> HooksManager {
        let mut registry = CheckRegistry::with_builtin_checks();
        registry
            .register(Fixed {
                name: "test.pass",
                verdict: true,
            })
            .register(Fixed {
                name: "test.fail",
                verdict: false,
            })
            .register(Panics)
            .register(Slow);
        HooksManager::new(registry, CheckOptions::default(), Duration::from_millis(50))
    }

    fn context(text: &str) -> HookContext {
        HookContext::new(
            json!({"messages": [{"role": "user", "content": text}]}),
            "openai",
            Endpoint::ChatComplete,
            Default::default(),
        )
    }

    fn hook(id: &str, checks: &[&str], deny: bool) -> HookConfig {
        HookConfig {
            id: id.to_string(),
            checks: checks
                .iter()
                .map(|check| CheckConfig::new(*check, Value::Null))
                .collect(),
            deny,
            ..HookConfig::default()
        }
    }

    #[tokio::test]
    async fn faults_become_failed_checks() {
        let manager = manager();
        let ctx = context("hi");
        for id in ["test.panics", "test.slow", "nope.missing"] {
            let result = manager
                .execute_check(
                    &CheckConfig::new(id, Value::Null),
                    &ctx,
                    HookPhase::BeforeRequest,
                )
                .await;
            assert!(!result.verdict, "{id}");
            let err = result.error.expect("error");
            assert!(!err.message.contains("backtrace"), "{id}");
        }
    }

    #[tokio::test]
    async fn hook_verdict_is_and_over_checks() {
        let manager = manager();
        let ctx = context("hi");
        let result = manager
            .execute_hook(
                &hook("h", &["test.pass", "test.fail"], false),
                &ctx,
                HookPhase::BeforeRequest,
            )
            .await;
        assert!(!result.verdict);
        assert_eq!(result.checks.len(), 2);
        assert_eq!(result.checks[0].id, "test.pass");

        let result = manager
            .execute_hook(&hook("h", &["test.pass"], false), &ctx, HookPhase::BeforeRequest)
            .await;
        assert!(result.verdict);
    }

    #[tokio::test]
    async fn empty_hook_is_non_blocking() {
        let manager = manager();
        let result = manager
            .execute_hook(&hook("empty", &[], true), &context("hi"), HookPhase::BeforeRequest)
            .await;
        assert!(result.verdict);
        assert!(result.error.is_some());
        assert!(!result.denies());
    }

    #[tokio::test]
    async fn feedback_lists_check_outcomes() {
        let manager = manager();
        let mut config = hook("h", &["test.pass", "test.fail", "nope.missing"], false);
        config.on_fail = Some(super::super::FeedbackDirective {
            value: -10.0,
            weight: 1.0,
            metadata: None,
        });
        let result = manager
            .execute_hook(&config, &context("hi"), HookPhase::BeforeRequest)
            .await;
        let feedback = result.feedback.expect("feedback");
        assert_eq!(feedback.value, -10.0);
        assert_eq!(feedback.metadata.successful_checks, vec!["test.pass"]);
        assert_eq!(
            feedback.metadata.failed_checks,
            vec!["test.fail", "nope.missing"]
        );
        assert_eq!(feedback.metadata.errored_checks, vec!["nope.missing"]);
    }

    #[tokio::test]
    async fn phase_denies_only_on_failing_denying_hook() {
        let manager = manager();
        let ctx = context("hi");
        let hooks = vec![
            SyncHook(hook("soft", &["test.fail"], false)),
            SyncHook(hook("hard", &["test.pass"], true)),
        ];
        let results = manager
            .execute_hooks_sync(&hooks, &ctx, HookPhase::BeforeRequest)
            .await;
        assert!(!results.should_deny);

        let hooks = vec![SyncHook(hook("hard", &["test.fail"], true))];
        let results = manager
            .execute_hooks_sync(&hooks, &ctx, HookPhase::BeforeRequest)
            .await;
        assert!(results.should_deny);
    }

    #[tokio::test]
    async fn mutator_checks_chain_and_rewrite_span() {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut manager = manager();
        manager.register_check(Shout(Arc::clone(&calls)));
        let mutator = HookConfig {
            kind: HookKind::Mutator,
            ..hook("m", &["test.shout", "test.shout"], false)
        };
        let mut span = manager.create_span("s", context("hi"), vec![mutator], Vec::new());
        let results = manager
            .execute_hooks(&mut span, HookPhase::BeforeRequest)
            .await
            .expect("before hooks");
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert!(results.results[0].transformed);
        let body = span.transformed_request_body().expect("rewritten");
        assert_eq!(body["messages"][0]["content"], "hi!!");
        assert_eq!(span.context().request.text(), "hi!!");
    }

    #[tokio::test]
    async fn async_hooks_do_not_gate_the_phase() {
        let manager = manager().with_async_queue(8);
        let deferred = HookConfig {
            is_async: true,
            ..hook("bg", &["test.fail"], true)
        };
        let mut span = manager.create_span("s", context("hi"), vec![deferred], Vec::new());
        let results = manager
            .execute_hooks(&mut span, HookPhase::BeforeRequest)
            .await
            .expect("before hooks");
        assert!(results.results.is_empty());
        assert!(!results.should_deny);
    }
}
