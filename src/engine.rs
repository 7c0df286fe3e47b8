//! Engine / concurrency controller.
//!
//! The engine owns the registries of in-flight attempts (`states` plus the
//! per-attempt cancel handles), dispatches each attempt to a fresh
//! isolated runner through the dispatcher fixed at construction, and
//! proxies per-attempt context events onto an engine-wide emitter with the
//! workflow id attached. External observers only ever get a read-only
//! subscription; nothing outside the engine can emit.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use serde_json::Value;
use thiserror::Error;
use tokio::sync::{broadcast, watch, Notify, Semaphore};
use tracing::{info, warn};
use uuid::Uuid;

use crate::channel::Channel;
use crate::compiler;
use crate::context::{self, AttemptEvent, AttemptOptions, ExecutionContext};
use crate::error::AttemptFailure;
use crate::plan::ExecutionPlan;
use crate::runner::RunnerDispatcher;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkflowStatus {
    Queued,
    Running,
}

#[derive(Debug, Clone)]
pub struct WorkflowState {
    pub id: String,
    pub status: WorkflowStatus,
}

/// A context event tagged with its workflow id.
#[derive(Debug, Clone)]
pub struct EngineEvent {
    pub workflow_id: String,
    pub event: AttemptEvent,
}

#[derive(Debug, Clone)]
pub struct EngineOptions {
    /// Max attempts in flight. Enforcement is the claim loop's
    /// responsibility; the engine exposes the accounting.
    pub capacity: usize,
    pub attempt: AttemptOptions,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            capacity: 5,
            attempt: AttemptOptions::default(),
        }
    }
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("workflow '{0}' is already registered")]
    Duplicate(String),
}

struct Registry {
    states: HashMap<String, WorkflowState>,
    cancels: HashMap<String, watch::Sender<bool>>,
}

struct EngineInner {
    options: EngineOptions,
    dispatcher: RunnerDispatcher,
    registry: Mutex<Registry>,
    events: broadcast::Sender<EngineEvent>,
    completions: Notify,
    /// Capacity backstop: attempts beyond `capacity` queue here even if
    /// the claim loop over-claims.
    slots: Arc<Semaphore>,
}

/// The worker-side attempt engine.
#[derive(Clone)]
pub struct Engine {
    inner: Arc<EngineInner>,
}

impl Engine {
    pub fn new(dispatcher: RunnerDispatcher, options: EngineOptions) -> Self {
        let (events, _) = broadcast::channel(256);
        let slots = Arc::new(Semaphore::new(options.capacity.max(1)));
        Self {
            inner: Arc::new(EngineInner {
                options,
                dispatcher,
                registry: Mutex::new(Registry {
                    states: HashMap::new(),
                    cancels: HashMap::new(),
                }),
                events,
                completions: Notify::new(),
                slots,
            }),
        }
    }

    pub fn capacity(&self) -> usize {
        self.inner.options.capacity
    }

    /// Attempts currently queued or running.
    pub fn active_count(&self) -> usize {
        self.registry().states.len()
    }

    pub fn available_capacity(&self) -> usize {
        self.inner.options.capacity.saturating_sub(self.active_count())
    }

    /// Ids of attempts currently queued or running.
    pub fn active_ids(&self) -> Vec<String> {
        self.registry().states.keys().cloned().collect()
    }

    pub fn get_workflow_state(&self, workflow_id: &str) -> Option<WorkflowState> {
        self.registry().states.get(workflow_id).cloned()
    }

    pub fn get_workflow_status(&self, workflow_id: &str) -> Option<WorkflowStatus> {
        self.get_workflow_state(workflow_id).map(|state| state.status)
    }

    /// Engine-wide event stream: every attempt's events, workflow id
    /// attached.
    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.inner.events.subscribe()
    }

    /// Read-only subscription filtered to one workflow.
    pub fn listen(&self, workflow_id: impl Into<String>) -> SubscriptionHandle {
        SubscriptionHandle {
            workflow_id: workflow_id.into(),
            rx: self.inner.events.subscribe(),
        }
    }

    /// Park until some attempt completes.
    pub async fn wait_for_completion(&self) {
        self.inner.completions.notified().await;
    }

    /// Coordinator-initiated cancellation: tear down the runner and let
    /// the attempt finish as cancelled.
    pub fn cancel(&self, workflow_id: &str) {
        let registry = self.registry();
        match registry.cancels.get(workflow_id) {
            Some(sender) => {
                info!(workflow_id, "cancelling attempt");
                let _ = sender.send(true);
            }
            None => warn!(workflow_id, "cancel for unknown attempt"),
        }
    }

    /// Register and start executing a plan. Returns a read-only
    /// subscription to the attempt's events.
    pub fn execute(
        &self,
        mut plan: ExecutionPlan,
        channel: Arc<dyn Channel>,
    ) -> Result<SubscriptionHandle, EngineError> {
        let workflow_id = match &plan.id {
            Some(id) => id.clone(),
            None => {
                let id = Uuid::new_v4().to_string();
                plan.id = Some(id.clone());
                id
            }
        };

        let cancel_rx = self.register_workflow(&workflow_id)?;
        let handle = self.listen(workflow_id.clone());

        let inner = Arc::clone(&self.inner);
        let engine = self.clone();
        tokio::spawn(async move {
            let emit = |event: AttemptEvent| {
                let _ = inner.events.send(EngineEvent {
                    workflow_id: workflow_id.clone(),
                    event,
                });
            };

            // Compile before anything starts: a bad plan fails the
            // attempt without an `attempt:start` ever going out.
            let compiled = match compiler::compile(&plan) {
                Ok(compiled) => compiled,
                Err(err) => {
                    let failure = AttemptFailure::Compile(err.to_string());
                    warn!(workflow_id = %workflow_id, %failure, "plan rejected");
                    context::report_failed_attempt(channel.as_ref(), &workflow_id, &failure, None)
                        .await;
                    emit(AttemptEvent::Complete {
                        result: None,
                        failure: Some(failure),
                    });
                    engine.finish_workflow(&workflow_id);
                    return;
                }
            };

            // Queue until a capacity slot frees up. Normally the claim
            // loop keeps us under the ceiling and this acquires at once.
            let _slot = match Arc::clone(&inner.slots).acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => return,
            };
            engine.mark_running(&workflow_id);

            let (context_events, mut proxy_rx) = broadcast::channel(256);
            let proxy_inner = Arc::clone(&inner);
            let proxy_workflow_id = workflow_id.clone();
            let proxy = tokio::spawn(async move {
                loop {
                    match proxy_rx.recv().await {
                        Ok(event) => {
                            let _ = proxy_inner.events.send(EngineEvent {
                                workflow_id: proxy_workflow_id.clone(),
                                event,
                            });
                        }
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            warn!(skipped, "attempt event proxy lagged");
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }
            });

            let execution = ExecutionContext::new(
                workflow_id.clone(),
                Arc::clone(&channel),
                Arc::clone(&inner.dispatcher),
                inner.options.attempt.clone(),
                context_events,
                cancel_rx,
            );

            match execution.run(compiled).await {
                Ok(_) => {
                    metrics::counter!("belay_attempts_completed_total").increment(1);
                    info!(workflow_id = %workflow_id, "attempt complete");
                }
                Err(failure) => {
                    metrics::counter!("belay_attempts_failed_total").increment(1);
                    warn!(workflow_id = %workflow_id, %failure, "attempt failed");
                }
            }

            let _ = proxy.await;
            engine.finish_workflow(&workflow_id);
        });

        Ok(handle)
    }

    fn registry(&self) -> std::sync::MutexGuard<'_, Registry> {
        self.inner
            .registry
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Insert the queued registry entry and its cancel handle. The sender
    /// lives in the registry for the attempt's lifetime; the receiver goes
    /// to the execution context.
    fn register_workflow(&self, workflow_id: &str) -> Result<watch::Receiver<bool>, EngineError> {
        let mut registry = self.registry();
        if registry.states.contains_key(workflow_id) {
            return Err(EngineError::Duplicate(workflow_id.to_string()));
        }
        registry.states.insert(
            workflow_id.to_string(),
            WorkflowState {
                id: workflow_id.to_string(),
                status: WorkflowStatus::Queued,
            },
        );
        let (tx, rx) = watch::channel(false);
        registry.cancels.insert(workflow_id.to_string(), tx);
        Ok(rx)
    }

    fn mark_running(&self, workflow_id: &str) {
        if let Some(state) = self.registry().states.get_mut(workflow_id) {
            state.status = WorkflowStatus::Running;
        }
    }

    /// Drop the registry entries and free the capacity slot.
    fn finish_workflow(&self, workflow_id: &str) {
        {
            let mut registry = self.registry();
            registry.states.remove(workflow_id);
            registry.cancels.remove(workflow_id);
        }
        // notify_one stores a permit when nobody is waiting yet, so a
        // completion that lands between the claim loop's capacity check
        // and its wait still wakes it.
        self.inner.completions.notify_one();
    }
}

/// Read-only view of one workflow's events: subscribe-only, no way to
/// push events in.
pub struct SubscriptionHandle {
    workflow_id: String,
    rx: broadcast::Receiver<EngineEvent>,
}

impl SubscriptionHandle {
    pub fn workflow_id(&self) -> &str {
        &self.workflow_id
    }

    /// Next event for this workflow; `None` once the engine is gone.
    pub async fn recv(&mut self) -> Option<AttemptEvent> {
        loop {
            match self.rx.recv().await {
                Ok(event) if event.workflow_id == self.workflow_id => return Some(event.event),
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "subscription lagged behind the attempt stream");
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Drain events until the attempt completes.
    pub async fn wait(mut self) -> Option<(Option<Value>, Option<AttemptFailure>)> {
        while let Some(event) = self.recv().await {
            if let AttemptEvent::Complete { result, failure } = event {
                return Some((result, failure));
            }
        }
        None
    }
}
