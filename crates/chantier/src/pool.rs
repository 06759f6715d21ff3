//! Bounded task pool.
//!
//! Flow of a submission:
//! 1. Refuse immediately if the failure policy has tripped
//! 2. Wait for a free slot
//! 3. Start the work through the backend, record the handle in the slot
//! 4. Spawn a watcher that awaits the outcome, records it into the policy,
//!    then frees the slot
//! 5. For process tasks with `kill_after` set, spawn an escalator alongside
//!
//! Watchers and escalators are detached. Their only side effects are on one
//! slot and the shared policy.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::backend::{Backend, Completion, ProcessBackend, TaskBackend};
use crate::error::{PoolError, TaskFailure};
use crate::escalator::{EscalationConfig, Escalator};
use crate::policy::{FailurePolicy, NoLimit, SharedPolicy};
use crate::slot::{SlotGuard, SlotTable};

pub type ProcessPool = Pool<ProcessBackend>;
pub type TaskPool = Pool<TaskBackend>;

pub struct PoolConfig {
    pub slots: usize,
    pub policy: Box<dyn FailurePolicy>,
    /// Forcibly terminate process tasks still running after this long.
    pub kill_after: Option<Duration>,
    pub escalation: EscalationConfig,
    /// Parent span for everything the pool and its watchers log.
    pub span: tracing::Span,
}

impl PoolConfig {
    pub fn new(slots: usize) -> Self {
        Self {
            slots,
            policy: Box::new(NoLimit),
            kill_after: None,
            escalation: EscalationConfig::default(),
            span: tracing::info_span!("pool", slots),
        }
    }

    pub fn with_policy(mut self, policy: impl FailurePolicy) -> Self {
        self.policy = Box::new(policy);
        self
    }

    pub fn with_kill_after(mut self, kill_after: Duration) -> Self {
        self.kill_after = Some(kill_after);
        self
    }

    pub fn with_escalation(mut self, escalation: EscalationConfig) -> Self {
        self.escalation = escalation;
        self
    }

    pub fn with_span(mut self, span: tracing::Span) -> Self {
        self.span = span;
        self
    }
}

impl std::fmt::Debug for PoolConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PoolConfig")
            .field("slots", &self.slots)
            .field("kill_after", &self.kill_after)
            .field("escalation", &self.escalation)
            .finish_non_exhaustive()
    }
}

/// Point-in-time view of a pool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PoolStatus {
    pub slots: usize,
    pub occupied: usize,
    pub limit_reached: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_failure: Option<String>,
}

impl PoolStatus {
    pub fn available(&self) -> usize {
        self.slots - self.occupied
    }
}

type LastFailure = Arc<Mutex<Option<TaskFailure>>>;

fn lock_last_failure(last: &Mutex<Option<TaskFailure>>) -> MutexGuard<'_, Option<TaskFailure>> {
    last.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// At most `slots` tasks run at once; `submit` waits for a free slot.
pub struct Pool<B: Backend> {
    backend: B,
    slots: Arc<SlotTable<B::Handle>>,
    policy: Arc<SharedPolicy>,
    last_failure: LastFailure,
    escalation: Option<(Escalator, Duration)>,
    span: tracing::Span,
}

impl Pool<ProcessBackend> {
    pub fn processes(config: PoolConfig) -> Result<Self, PoolError> {
        Self::new(config, ProcessBackend::new())
    }
}

impl Pool<TaskBackend> {
    pub fn tasks(config: PoolConfig) -> Result<Self, PoolError> {
        Self::new(config, TaskBackend::new())
    }
}

impl<B: Backend> Pool<B> {
    /// Build a pool. Arms the failure policy.
    pub fn new(config: PoolConfig, backend: B) -> Result<Self, PoolError> {
        if config.slots < 1 {
            return Err(PoolError::Config {
                slots: config.slots,
            });
        }

        let escalation = match config.kill_after {
            Some(kill_after) if backend.supports_termination() => {
                Some((Escalator::new(config.escalation), kill_after))
            }
            Some(kill_after) => {
                tracing::warn!(
                    parent: &config.span,
                    ?kill_after,
                    "Backend cannot terminate tasks, kill_after ignored"
                );
                None
            }
            None => None,
        };

        let policy = Arc::new(SharedPolicy::from_boxed(config.policy));
        policy.arm();

        Ok(Self {
            backend,
            slots: Arc::new(SlotTable::new(config.slots)),
            policy,
            last_failure: Arc::new(Mutex::new(None)),
            escalation,
            span: config.span,
        })
    }

    /// Start `work` once a slot is free and return its handle without
    /// waiting for it to finish.
    ///
    /// Fails fast with [`PoolError::CircuitOpen`] if the failure policy has
    /// tripped; no slot is waited for in that case.
    pub async fn submit(&self, work: B::Work) -> Result<B::Handle, PoolError> {
        if self.policy.limit_reached() {
            let last_failure = self.last_failure();
            tracing::info!(
                parent: &self.span,
                last_failure = ?last_failure,
                "Failure limit reached, refusing task"
            );
            return Err(PoolError::CircuitOpen { last_failure });
        }

        let slot = self.slots.acquire().await;

        let launched = match self.backend.start(work) {
            Ok(launched) => launched,
            Err(e) => {
                tracing::warn!(
                    parent: &self.span,
                    slot = slot.index(),
                    error = %e,
                    "Failed to start task"
                );
                return Err(PoolError::Spawn(e));
            }
        };

        slot.occupy(launched.handle.clone());
        tracing::debug!(
            parent: &self.span,
            slot = slot.index(),
            handle = ?launched.handle,
            "Task started"
        );

        let exited = launched.exited.clone();
        if let (Some((escalator, kill_after)), Some(pid)) = (&self.escalation, launched.pid) {
            self.span
                .in_scope(|| escalator.spawn(pid, *kill_after, exited.clone()));
            tracing::debug!(parent: &self.span, pid, ?kill_after, "Escalation scheduled");
        }

        let watcher = Watcher {
            slot,
            policy: Arc::clone(&self.policy),
            last_failure: Arc::clone(&self.last_failure),
            exited,
        };
        tokio::spawn(watcher.watch(launched.completion).instrument(self.span.clone()));

        Ok(launched.handle)
    }

    /// Submit one task per item, in order, then wait for all of them.
    ///
    /// Stops at the first refused submission. Tasks already started keep
    /// running.
    pub async fn submit_all<I, F>(&self, items: I, mut work_for: F) -> Result<(), PoolError>
    where
        I: IntoIterator,
        F: FnMut(I::Item) -> B::Work,
    {
        for item in items {
            self.submit(work_for(item)).await?;
        }
        self.block_until_complete().await;
        Ok(())
    }

    /// Submit `work` once per slot, for worker-style fan-out.
    pub async fn fill_all_slots(&self, work: B::Work) -> Result<Vec<B::Handle>, PoolError>
    where
        B::Work: Clone,
    {
        let num_slots = self.slot_count();
        let mut handles = Vec::with_capacity(num_slots);
        for _ in 0..num_slots {
            handles.push(self.submit(work.clone()).await?);
        }
        Ok(handles)
    }

    /// Whether any task is still running.
    pub fn still_running(&self) -> bool {
        self.slots.any_occupied()
    }

    /// Wait until every slot is free.
    pub async fn block_until_complete(&self) {
        self.slots.block_until_all_empty().await
    }

    /// Reset the failure policy, closing a tripped breaker.
    pub fn rearm(&self) {
        lock_last_failure(&self.last_failure).take();
        self.policy.arm();
        tracing::info!(parent: &self.span, "Failure policy re-armed");
    }

    pub fn limit_reached(&self) -> bool {
        self.policy.limit_reached()
    }

    pub fn last_failure(&self) -> Option<TaskFailure> {
        lock_last_failure(&self.last_failure).clone()
    }

    pub fn slot_count(&self) -> usize {
        self.slots.num_slots()
    }

    /// Handles of the tasks currently running, by slot index.
    pub fn running(&self) -> Vec<(usize, B::Handle)> {
        self.slots.running()
    }

    pub fn status(&self) -> PoolStatus {
        PoolStatus {
            slots: self.slot_count(),
            occupied: self.slots.occupied(),
            limit_reached: self.policy.limit_reached(),
            last_failure: self.last_failure().map(|f| f.to_string()),
        }
    }
}

impl<B: Backend> std::fmt::Debug for Pool<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pool")
            .field("status", &self.status())
            .finish_non_exhaustive()
    }
}

/// Owns one running task's slot until the task completes.
struct Watcher<H: Clone> {
    slot: SlotGuard<H>,
    policy: Arc<SharedPolicy>,
    last_failure: LastFailure,
    exited: CancellationToken,
}

impl<H: Clone> Watcher<H> {
    async fn watch(self, completion: Completion) {
        let outcome = completion.await;
        self.exited.cancel();

        let slot = self.slot.index();
        match outcome {
            Ok(()) => {
                tracing::debug!(slot, "Task succeeded");
                self.policy.success();
            }
            Err(failure) => {
                tracing::warn!(slot, error = %failure, "Task failed");
                *lock_last_failure(&self.last_failure) = Some(failure);
                self.policy.failure();
                if self.policy.limit_reached() {
                    tracing::info!(slot, "Failure limit reached");
                }
            }
        }

        self.slot.release();
    }
}
