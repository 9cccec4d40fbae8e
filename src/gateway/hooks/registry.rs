use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use super::content::{ContentShape, HookContext};
use super::{CheckError, HookPhase, TransformedData};

#[derive(Debug, Clone, Default)]
pub struct CheckOptions {
    pub env: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct CheckOutcome {
    pub verdict: bool,
    pub error: Option<CheckError>,
    pub data: Value,
    pub transformed: bool,
    pub transformed_data: Option<TransformedData>,
}

impl CheckOutcome {
    pub fn pass() -> Self {
        Self {
            verdict: true,
            ..Self::default()
        }
    }

    pub fn fail() -> Self {
        Self::default()
    }

    pub fn verdict(verdict: bool) -> Self {
        Self {
            verdict,
            ..Self::default()
        }
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = data;
        self
    }

    /// Passes, but records why the check could not do its job.
    pub fn fail_open(error: CheckError) -> Self {
        Self {
            verdict: true,
            error: Some(error),
            ..Self::default()
        }
    }

    pub fn with_transform(mut self, phase: HookPhase, json: Value) -> Self {
        let transformed = super::TransformedJson { json };
        let data = match phase {
            HookPhase::BeforeRequest => TransformedData {
                request: Some(transformed),
                response: None,
            },
            HookPhase::AfterRequest => TransformedData {
                request: None,
                response: Some(transformed),
            },
        };
        self.transformed = true;
        self.transformed_data = Some(data);
        self
    }
}

/// One guardrail function, addressed in hook config by its `name()`.
#[async_trait]
pub trait Check: Send + Sync {
    fn name(&self) -> &str;

    fn supports(&self, _shape: ContentShape) -> bool {
        true
    }

    async fn execute(
        &self,
        context: &HookContext,
        parameters: &Value,
        phase: HookPhase,
        options: &CheckOptions,
    ) -> Result<CheckOutcome, CheckError>;
}

#[derive(Clone, Default)]
pub struct CheckRegistry {
    checks: HashMap<String, Arc<dyn Check>>,
}

impl std::fmt::Debug for CheckRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut names = self.names();
        names.sort_unstable();
        f.debug_struct("CheckRegistry")
            .field("checks", &names)
            .finish()
    }
}

impl CheckRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_builtin_checks() -> Self {
        let mut registry = Self::new();
        super::builtin::register_builtin_checks(&mut registry);
        registry
    }

    /// Registers `check` under its own name, replacing any previous entry.
    pub fn register<C: Check + 'static>(&mut self, check: C) -> &mut Self {
        self.register_arc(Arc::new(check))
    }

    pub fn register_arc(&mut self, check: Arc<dyn Check>) -> &mut Self {
        self.checks.insert(check.name().to_string(), check);
        self
    }

    pub fn get(&self, id: &str) -> Option<Arc<dyn Check>> {
        self.checks.get(id).cloned()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.checks.contains_key(id)
    }

    pub fn names(&self) -> Vec<&str> {
        self.checks.keys().map(String::as_str).collect()
    }
}
