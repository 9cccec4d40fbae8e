//! Guardrail hooks: configuration, per-check and per-hook results, and the
//! engine that runs them around the upstream call.

pub mod builtin;
pub mod content;
pub mod manager;
pub mod queue;
pub mod registry;
pub mod span;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum HookPhase {
    #[serde(rename = "beforeRequestHook")]
    BeforeRequest,
    #[serde(rename = "afterRequestHook")]
    AfterRequest,
}

impl HookPhase {
    pub fn as_str(self) -> &'static str {
        match self {
            HookPhase::BeforeRequest => "beforeRequestHook",
            HookPhase::AfterRequest => "afterRequestHook",
        }
    }

    /// Field name under `hook_results` in client-facing bodies.
    pub fn results_key(self) -> &'static str {
        match self {
            HookPhase::BeforeRequest => "before_request_hooks",
            HookPhase::AfterRequest => "after_request_hooks",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HookKind {
    #[default]
    Guardrail,
    Mutator,
    Custom,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckConfig {
    /// `"<plugin>.<function>"`, resolved through the check registry.
    pub id: String,
    #[serde(default)]
    pub parameters: Value,
    #[serde(default = "default_true", alias = "isEnabled")]
    pub is_enabled: bool,
    #[serde(default, alias = "timeoutMs", skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
}

impl CheckConfig {
    pub fn new(id: impl Into<String>, parameters: Value) -> Self {
        Self {
            id: id.into(),
            parameters,
            is_enabled: true,
            timeout_ms: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FeedbackDirective {
    #[serde(default)]
    pub value: f64,
    #[serde(default = "default_weight")]
    pub weight: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
}

fn default_weight() -> f64 {
    1.0
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HookConfig {
    #[serde(default)]
    pub id: String,
    #[serde(default, rename = "type")]
    pub kind: HookKind,
    #[serde(default)]
    pub checks: Vec<CheckConfig>,
    #[serde(default, rename = "async")]
    pub is_async: bool,
    #[serde(default)]
    pub deny: bool,
    #[serde(default, alias = "onFail", skip_serializing_if = "Option::is_none")]
    pub on_fail: Option<FeedbackDirective>,
    #[serde(default, alias = "onSuccess", skip_serializing_if = "Option::is_none")]
    pub on_success: Option<FeedbackDirective>,
}

/// A hook that gates the response: it runs inline and its verdict counts.
#[derive(Debug, Clone, PartialEq)]
pub struct SyncHook(pub HookConfig);

/// A fire-and-forget hook: dispatched to the async queue, never awaited.
#[derive(Debug, Clone, PartialEq)]
pub struct AsyncHook(pub HookConfig);

#[derive(Debug, Clone, Default, PartialEq)]
pub struct PhaseHooks {
    pub sync: Vec<SyncHook>,
    pub deferred: Vec<AsyncHook>,
}

impl PhaseHooks {
    pub fn classify(hooks: Vec<HookConfig>) -> Self {
        let mut out = Self::default();
        for hook in hooks {
            if hook.is_async {
                out.deferred.push(AsyncHook(hook));
            } else {
                out.sync.push(SyncHook(hook));
            }
        }
        out
    }

    pub fn is_empty(&self) -> bool {
        self.sync.is_empty() && self.deferred.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Error)]
#[error("{name}: {message}")]
pub struct CheckError {
    pub name: String,
    pub message: String,
}

impl CheckError {
    pub fn new(name: impl Into<String>, message: impl AsRef<str>) -> Self {
        Self {
            name: name.into(),
            message: strip_backtrace(message.as_ref()),
        }
    }

    pub(crate) fn unknown_check(id: &str) -> Self {
        Self::new("UnknownCheck", format!("no check registered under `{id}`"))
    }

    pub(crate) fn timed_out(id: &str, timeout_ms: u64) -> Self {
        Self::new(
            "TimeoutError",
            format!("check `{id}` timed out after {timeout_ms}ms"),
        )
    }

    pub(crate) fn from_panic(payload: Box<dyn std::any::Any + Send>) -> Self {
        let message = if let Some(message) = payload.downcast_ref::<&str>() {
            (*message).to_string()
        } else if let Some(message) = payload.downcast_ref::<String>() {
            message.clone()
        } else {
            "check panicked".to_string()
        };
        Self::new("PanicError", message)
    }
}

/// Drops everything from the first backtrace marker on.
fn strip_backtrace(message: &str) -> String {
    let mut kept = Vec::new();
    for line in message.lines() {
        let trimmed = line.trim_start();
        if trimmed.starts_with("stack backtrace:")
            || trimmed.starts_with("Stack backtrace:")
            || trimmed.starts_with("at ")
        {
            break;
        }
        kept.push(line);
    }
    kept.join("\n").trim_end().to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransformedJson {
    pub json: Value,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TransformedData {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request: Option<TransformedJson>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response: Option<TransformedJson>,
}

impl TransformedData {
    pub fn for_phase(&self, phase: HookPhase) -> Option<&Value> {
        match phase {
            HookPhase::BeforeRequest => self.request.as_ref().map(|t| &t.json),
            HookPhase::AfterRequest => self.response.as_ref().map(|t| &t.json),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GuardrailCheckResult {
    pub id: String,
    pub verdict: bool,
    pub error: Option<CheckError>,
    pub data: Value,
    pub transformed: bool,
    #[serde(skip)]
    pub transformed_data: Option<TransformedData>,
    pub execution_time_ms: u64,
    pub created_at: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FeedbackMetadata {
    pub successful_checks: Vec<String>,
    pub failed_checks: Vec<String>,
    pub errored_checks: Vec<String>,
    #[serde(flatten, skip_serializing_if = "Option::is_none")]
    pub extra: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HookFeedback {
    pub value: f64,
    pub weight: f64,
    pub metadata: FeedbackMetadata,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HookResult {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: HookKind,
    pub verdict: bool,
    pub deny: bool,
    #[serde(rename = "async")]
    pub is_async: bool,
    pub checks: Vec<GuardrailCheckResult>,
    pub feedback: Option<HookFeedback>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<CheckError>,
    pub transformed: bool,
    pub event_type: HookPhase,
    pub execution_time_ms: u64,
    pub created_at: u64,
}

impl HookResult {
    pub fn denies(&self) -> bool {
        self.deny && !self.verdict
    }
}

/// Immutable outcome of one phase. Shared by reference once produced.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PhaseResults {
    pub phase: HookPhase,
    pub results: Vec<HookResult>,
    pub should_deny: bool,
}

impl PhaseResults {
    pub fn new(phase: HookPhase, results: Vec<HookResult>) -> Self {
        let should_deny = results.iter().any(HookResult::denies);
        Self {
            phase,
            results,
            should_deny,
        }
    }

    pub fn empty(phase: HookPhase) -> Self {
        Self::new(phase, Vec::new())
    }

    pub fn any_failed(&self) -> bool {
        self.results.iter().any(|result| !result.verdict)
    }

    pub fn to_json(&self) -> Value {
        serde_json::to_value(&self.results).unwrap_or(Value::Array(Vec::new()))
    }
}
