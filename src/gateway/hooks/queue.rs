use std::sync::Arc;

use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{Semaphore, mpsc};

use super::content::HookContext;
use super::manager::HookRunner;
use super::{AsyncHook, HookPhase};
use crate::utils::task::AbortOnDrop;

pub(crate) struct DeferredHook {
    pub(crate) runner: HookRunner,
    pub(crate) hook: AsyncHook,
    pub(crate) context: HookContext,
    pub(crate) phase: HookPhase,
    pub(crate) span_id: String,
}

impl DeferredHook {
    pub(crate) async fn run(self) {
        let result = self
            .runner
            .execute_hook(&self.hook.0, &self.context, self.phase)
            .await;
        tracing::info!(
            span_id = %self.span_id,
            hook = %result.id,
            phase = self.phase.as_str(),
            verdict = result.verdict,
            checks = result.checks.len(),
            execution_time_ms = result.execution_time_ms,
            "async hook finished"
        );
    }
}

/// Bounded fire-and-forget queue for async hooks. At most `capacity` jobs run
/// at once and at most `capacity` more wait; anything past that is dropped.
/// Jobs have no ordering relative to the response.
#[derive(Clone)]
pub(crate) struct AsyncHookQueue {
    tx: mpsc::Sender<DeferredHook>,
    _worker: Arc<AbortOnDrop>,
}

impl AsyncHookQueue {
    pub(crate) fn spawn(capacity: usize) -> Option<Self> {
        let handle = tokio::runtime::Handle::try_current().ok()?;
        let capacity = capacity.max(1);
        let (tx, mut rx) = mpsc::channel::<DeferredHook>(capacity);
        let in_flight = Arc::new(Semaphore::new(capacity));
        let worker = handle.spawn(async move {
            while let Some(job) = rx.recv().await {
                let Ok(permit) = Arc::clone(&in_flight).acquire_owned().await else {
                    break;
                };
                tokio::spawn(async move {
                    job.run().await;
                    drop(permit);
                });
            }
        });
        Some(Self {
            tx,
            _worker: Arc::new(AbortOnDrop::new(worker.abort_handle())),
        })
    }

    pub(crate) fn dispatch(&self, job: DeferredHook) {
        match self.tx.try_send(job) {
            Ok(()) => {}
            Err(TrySendError::Full(job)) => {
                tracing::warn!(hook = %job.hook.0.id, "async hook queue full; dropped");
            }
            Err(TrySendError::Closed(job)) => {
                tracing::warn!(hook = %job.hook.0.id, "async hook queue closed; dropped");
            }
        }
    }
}
