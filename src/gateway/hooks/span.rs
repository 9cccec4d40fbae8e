use std::sync::Arc;

use serde_json::{Map, Value};

use super::content::{ContentSnapshot, HookContext};
use super::{HookConfig, HookPhase, PhaseHooks, PhaseResults};
use crate::gateway::GatewayError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookSpanState {
    NoHooksRun,
    BeforeHooksExecuting,
    BeforeHooksDone,
    AfterHooksExecuting,
    AfterHooksDone,
}

impl HookSpanState {
    pub fn as_str(self) -> &'static str {
        match self {
            HookSpanState::NoHooksRun => "NO_HOOKS_RUN",
            HookSpanState::BeforeHooksExecuting => "BEFORE_HOOKS_EXECUTING",
            HookSpanState::BeforeHooksDone => "BEFORE_HOOKS_DONE",
            HookSpanState::AfterHooksExecuting => "AFTER_HOOKS_EXECUTING",
            HookSpanState::AfterHooksDone => "AFTER_HOOKS_DONE",
        }
    }
}

/// Per-request accumulator: the hooks to run, the content they see and the
/// results of each completed phase.
#[derive(Debug)]
pub struct HookSpan {
    id: String,
    before_hooks: PhaseHooks,
    after_hooks: PhaseHooks,
    context: HookContext,
    before_results: Option<Arc<PhaseResults>>,
    after_results: Option<Arc<PhaseResults>>,
    transformed_request: Option<Value>,
    transformed_response: Option<Value>,
    state: HookSpanState,
}

impl HookSpan {
    pub fn new(
        id: impl Into<String>,
        context: HookContext,
        before_hooks: Vec<HookConfig>,
        after_hooks: Vec<HookConfig>,
    ) -> Self {
        Self {
            id: id.into(),
            before_hooks: PhaseHooks::classify(before_hooks),
            after_hooks: PhaseHooks::classify(after_hooks),
            context,
            before_results: None,
            after_results: None,
            transformed_request: None,
            transformed_response: None,
            state: HookSpanState::NoHooksRun,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn state(&self) -> HookSpanState {
        self.state
    }

    pub fn context(&self) -> &HookContext {
        &self.context
    }

    pub fn hooks(&self, phase: HookPhase) -> &PhaseHooks {
        match phase {
            HookPhase::BeforeRequest => &self.before_hooks,
            HookPhase::AfterRequest => &self.after_hooks,
        }
    }

    pub fn results(&self, phase: HookPhase) -> Option<&Arc<PhaseResults>> {
        match phase {
            HookPhase::BeforeRequest => self.before_results.as_ref(),
            HookPhase::AfterRequest => self.after_results.as_ref(),
        }
    }

    pub fn before_results(&self) -> Option<&Arc<PhaseResults>> {
        self.before_results.as_ref()
    }

    pub fn after_results(&self) -> Option<&Arc<PhaseResults>> {
        self.after_results.as_ref()
    }

    pub fn should_deny(&self) -> bool {
        self.completed().any(|phase| phase.should_deny)
    }

    pub fn any_failed(&self) -> bool {
        self.completed().any(|phase| phase.any_failed())
    }

    fn completed(&self) -> impl Iterator<Item = &Arc<PhaseResults>> {
        self.before_results.iter().chain(self.after_results.iter())
    }

    fn has_results(&self) -> bool {
        self.completed().any(|phase| !phase.results.is_empty())
    }

    /// `{"before_request_hooks": [...], "after_request_hooks": [...]}`, or
    /// `None` when no hook has produced a result yet.
    pub fn hook_results_json(&self) -> Option<Value> {
        if !self.has_results() {
            return None;
        }
        let mut out = Map::new();
        for phase in [HookPhase::BeforeRequest, HookPhase::AfterRequest] {
            let results = self
                .results(phase)
                .map(|results| results.to_json())
                .unwrap_or_else(|| Value::Array(Vec::new()));
            out.insert(phase.results_key().to_string(), results);
        }
        Some(Value::Object(out))
    }

    /// Request body after every before-phase rewrite, if any hook rewrote it.
    pub fn transformed_request_body(&self) -> Option<&Value> {
        self.transformed_request.as_ref()
    }

    pub fn transformed_response_body(&self) -> Option<&Value> {
        self.transformed_response.as_ref()
    }

    pub fn set_response(&mut self, json: Value, status: u16) {
        self.context.response = Some(ContentSnapshot::response(json));
        self.context.response_status = Some(status);
        self.transformed_response = None;
    }

    pub(crate) fn apply_transform(&mut self, phase: HookPhase, json: Value) {
        self.context.apply_transform(phase, json.clone());
        match phase {
            HookPhase::BeforeRequest => self.transformed_request = Some(json),
            HookPhase::AfterRequest => self.transformed_response = Some(json),
        }
    }

    pub(crate) fn begin_phase(&mut self, phase: HookPhase) -> Result<(), GatewayError> {
        let allowed = match phase {
            HookPhase::BeforeRequest => self.state == HookSpanState::NoHooksRun,
            HookPhase::AfterRequest => self.state == HookSpanState::BeforeHooksDone,
        };
        if !allowed {
            return Err(GatewayError::HookPhaseOrder {
                phase: phase.as_str(),
                state: self.state.as_str(),
            });
        }
        self.state = match phase {
            HookPhase::BeforeRequest => HookSpanState::BeforeHooksExecuting,
            HookPhase::AfterRequest => HookSpanState::AfterHooksExecuting,
        };
        Ok(())
    }

    pub(crate) fn finish_phase(&mut self, results: PhaseResults) -> Arc<PhaseResults> {
        let results = Arc::new(results);
        match results.phase {
            HookPhase::BeforeRequest => {
                self.before_results = Some(Arc::clone(&results));
                self.state = HookSpanState::BeforeHooksDone;
            }
            HookPhase::AfterRequest => {
                self.after_results = Some(Arc::clone(&results));
                self.state = HookSpanState::AfterHooksDone;
            }
        }
        results
    }

    /// Drops a phase's results so it can run again. Resetting the after phase
    /// keeps the before phase intact.
    pub fn reset_hook_results(&mut self, phase: HookPhase) {
        match phase {
            HookPhase::BeforeRequest => {
                self.before_results = None;
                self.after_results = None;
                self.transformed_request = None;
                self.transformed_response = None;
                self.state = HookSpanState::NoHooksRun;
            }
            HookPhase::AfterRequest => {
                self.after_results = None;
                self.transformed_response = None;
                self.context.response = None;
                self.context.response_status = None;
                if self.state != HookSpanState::NoHooksRun {
                    self.state = HookSpanState::BeforeHooksDone;
                }
            }
        }
    }
}
