//! Per-attempt execution context.
//!
//! One context owns an attempt's mutable state (active run, active job,
//! dataclip table, result pointer), subscribes to the runner's event
//! stream, and translates runner events into coordinator protocol
//! messages. Lifecycle pushes are dispatched in event order without
//! awaiting acks; only the final `attempt:complete` ack gates the
//! completion result.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tokio::sync::{broadcast, watch};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::channel::{Channel, ReplyStatus};
use crate::error::AttemptFailure;
use crate::plan::{CompiledExecutionPlan, ExecutionPlan, InitialState, JobId};
use crate::protocol::{
    self, AttemptComplete, AttemptLog, GetCredential, GetDataclip, RunComplete, RunStart,
};
use crate::runner::events::{JsonLog, RunnerEvent};
use crate::runner::{DispatchRequest, RunnerDispatcher};

/// Budgets and state policy for one attempt.
#[derive(Debug, Clone)]
pub struct AttemptOptions {
    pub timeout: Duration,
    pub memory_limit_mb: u64,
    pub immutable_state: bool,
    pub strict_state: bool,
    pub state_props_to_remove: Vec<String>,
}

impl Default for AttemptOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(300),
            memory_limit_mb: 500,
            immutable_state: false,
            strict_state: false,
            state_props_to_remove: vec!["configuration".to_string(), "response".to_string()],
        }
    }
}

/// Mutable per-attempt state. Created on claim, destroyed on completion
/// or fatal error.
#[derive(Debug)]
pub struct AttemptState {
    pub active_run: Option<Uuid>,
    pub active_job: Option<JobId>,
    pub dataclips: HashMap<Uuid, Value>,
    /// Dataclip id of the last completed run; on workflow completion this
    /// is the terminal dataclip. In multi-branch plans the last-completed
    /// job globally wins.
    pub result: Option<Uuid>,
}

impl AttemptState {
    fn new() -> Self {
        Self {
            active_run: None,
            active_job: None,
            dataclips: HashMap::new(),
            result: None,
        }
    }
}

/// Context events re-emitted on the engine-wide emitter.
#[derive(Debug, Clone)]
pub enum AttemptEvent {
    Start,
    RunStart {
        run_id: Uuid,
        job_id: JobId,
    },
    RunComplete {
        run_id: Uuid,
        job_id: JobId,
        dataclip_id: Uuid,
    },
    Log(JsonLog),
    Complete {
        result: Option<Value>,
        failure: Option<AttemptFailure>,
    },
}

pub struct ExecutionContext {
    attempt_id: String,
    channel: Arc<dyn Channel>,
    dispatcher: RunnerDispatcher,
    options: AttemptOptions,
    events: broadcast::Sender<AttemptEvent>,
    cancel: watch::Receiver<bool>,
}

impl ExecutionContext {
    pub fn new(
        attempt_id: impl Into<String>,
        channel: Arc<dyn Channel>,
        dispatcher: RunnerDispatcher,
        options: AttemptOptions,
        events: broadcast::Sender<AttemptEvent>,
        cancel: watch::Receiver<bool>,
    ) -> Self {
        Self {
            attempt_id: attempt_id.into(),
            channel,
            dispatcher,
            options,
            events,
            cancel,
        }
    }

    /// Drive the attempt to completion. Resolves with the terminal
    /// dataclip once the coordinator acks `attempt:complete`.
    pub async fn run(mut self, plan: CompiledExecutionPlan) -> Result<Value, AttemptFailure> {
        match self.run_inner(&plan).await {
            Ok(value) => Ok(value),
            Err((failure, state)) => {
                self.report_failure(&failure, &state).await;
                Err(failure)
            }
        }
    }

    async fn run_inner(
        &mut self,
        plan: &CompiledExecutionPlan,
    ) -> Result<Value, (AttemptFailure, AttemptState)> {
        let mut state = AttemptState::new();

        let dispatch_plan = match self.prepare_plan(plan).await {
            Ok(prepared) => prepared,
            Err(failure) => return Err((failure, state)),
        };

        let request = DispatchRequest {
            plan: dispatch_plan,
            timeout: self.options.timeout,
            memory_limit_mb: self.options.memory_limit_mb,
            immutable_state: self.options.immutable_state,
            strict_state: self.options.strict_state,
        };
        let mut handle = match (self.dispatcher)(request).await {
            Ok(handle) => handle,
            Err(err) => {
                return Err((
                    AttemptFailure::Resource(format!("failed to start runner: {err}")),
                    state,
                ));
            }
        };

        let mut cancel = self.cancel.clone();
        loop {
            tokio::select! {
                event = handle.events.recv() => match event {
                    Some(event) => {
                        match self.handle_event(event, &mut state).await {
                            Ok(Some(result)) => return Ok(result),
                            Ok(None) => {}
                            Err(failure) => {
                                handle.kill();
                                return Err((failure, state));
                            }
                        }
                    }
                    // Stream closed with no terminal event: the runner
                    // died underneath us.
                    None => {
                        return Err((
                            AttemptFailure::Resource("runner exited unexpectedly".to_string()),
                            state,
                        ));
                    }
                },
                changed = cancel.changed() => {
                    if changed.is_err() || *cancel.borrow() {
                        handle.kill();
                        return Err((
                            AttemptFailure::Cancelled("cancelled by coordinator".to_string()),
                            state,
                        ));
                    }
                }
            }
        }
    }

    /// Resolve the initial state and any credential references, producing
    /// the raw plan shipped to the runner.
    async fn prepare_plan(
        &self,
        plan: &CompiledExecutionPlan,
    ) -> Result<ExecutionPlan, AttemptFailure> {
        let mut dispatch_plan = ExecutionPlan::from(plan);

        if let Some(InitialState::Dataclip(id)) = &plan.initial_state {
            let reply = self
                .channel
                .get_with_reply(protocol::GET_DATACLIP, json!(GetDataclip { id: id.clone() }))
                .await
                .map_err(|err| AttemptFailure::Protocol(err.to_string()))?;
            let value = protocol::decode_dataclip(&reply)
                .map_err(|err| AttemptFailure::Protocol(err.to_string()))?;
            dispatch_plan.initial_state = Some(InitialState::Inline(value));
        }

        // Jobs whose configuration is a bare string hold a credential id;
        // resolve it on demand through the channel.
        for job in &mut dispatch_plan.jobs {
            let Some(Value::String(credential_id)) = &job.configuration else {
                continue;
            };
            let reply = self
                .channel
                .get_with_reply(
                    protocol::GET_CREDENTIAL,
                    json!(GetCredential {
                        id: credential_id.clone()
                    }),
                )
                .await
                .map_err(|err| AttemptFailure::Protocol(err.to_string()))?;
            job.configuration = Some(reply);
        }

        Ok(dispatch_plan)
    }

    /// Translate one runner event. Returns the terminal value once the
    /// attempt completes.
    async fn handle_event(
        &self,
        event: RunnerEvent,
        state: &mut AttemptState,
    ) -> Result<Option<Value>, AttemptFailure> {
        match event {
            RunnerEvent::WorkflowStart => {
                self.push(protocol::ATTEMPT_START, json!({})).await?;
                self.emit(AttemptEvent::Start);
                Ok(None)
            }
            RunnerEvent::JobStart { job_id } => {
                let run_id = Uuid::new_v4();
                state.active_run = Some(run_id);
                state.active_job = Some(job_id.clone());
                self.push(
                    protocol::RUN_START,
                    json!(RunStart {
                        run_id,
                        job_id: job_id.clone()
                    }),
                )
                .await?;
                self.emit(AttemptEvent::RunStart { run_id, job_id });
                Ok(None)
            }
            RunnerEvent::JobComplete { job_id, state: output, .. } => {
                let run_id = state.active_run.take().unwrap_or_else(|| {
                    warn!(attempt_id = %self.attempt_id, "job completed with no active run");
                    Uuid::new_v4()
                });
                state.active_job = None;

                let dataclip_id = Uuid::new_v4();
                let scrubbed = scrub_state(output, &self.options.state_props_to_remove);
                let serialised = serde_json::to_string(&scrubbed)
                    .map_err(|err| AttemptFailure::Invariant(err.to_string()))?;
                self.push(
                    protocol::RUN_COMPLETE,
                    json!(RunComplete {
                        run_id,
                        job_id: job_id.clone(),
                        output_dataclip_id: dataclip_id,
                        output_dataclip: serialised,
                    }),
                )
                .await?;
                state.dataclips.insert(dataclip_id, scrubbed);
                state.result = Some(dataclip_id);
                self.emit(AttemptEvent::RunComplete {
                    run_id,
                    job_id,
                    dataclip_id,
                });
                Ok(None)
            }
            RunnerEvent::Log { log } => {
                self.push(
                    protocol::ATTEMPT_LOG,
                    json!(AttemptLog {
                        log: log.clone(),
                        attempt_id: self.attempt_id.clone(),
                        run_id: state.active_run,
                    }),
                )
                .await?;
                self.emit(AttemptEvent::Log(log));
                Ok(None)
            }
            RunnerEvent::WorkflowComplete => {
                let result_id = state.result.ok_or_else(|| {
                    AttemptFailure::Invariant("workflow completed with no result".to_string())
                })?;
                let result = state.dataclips.get(&result_id).cloned().ok_or_else(|| {
                    AttemptFailure::Invariant(format!("missing dataclip {result_id}"))
                })?;

                let ack = self
                    .channel
                    .push(
                        protocol::ATTEMPT_COMPLETE,
                        json!(AttemptComplete {
                            final_dataclip_id: Some(result_id),
                            reason: None,
                        }),
                    )
                    .await
                    .map_err(|err| AttemptFailure::Protocol(err.to_string()))?;
                match ack.wait().await {
                    ReplyStatus::Ok(_) => {
                        debug!(attempt_id = %self.attempt_id, "attempt complete acked");
                        self.emit(AttemptEvent::Complete {
                            result: Some(result.clone()),
                            failure: None,
                        });
                        Ok(Some(result))
                    }
                    ReplyStatus::Error(response) => Err(AttemptFailure::Protocol(format!(
                        "attempt:complete rejected: {response}"
                    ))),
                    ReplyStatus::Timeout => Err(AttemptFailure::Protocol(
                        "no ack for attempt:complete".to_string(),
                    )),
                }
            }
            RunnerEvent::Error { code, message } => {
                Err(AttemptFailure::from_wire(&code, message))
            }
        }
    }

    /// Report a failed attempt: the stringified error goes out as a log
    /// line, then a synthetic `attempt:complete` carries the reason.
    async fn report_failure(&self, failure: &AttemptFailure, state: &AttemptState) {
        report_failed_attempt(
            self.channel.as_ref(),
            &self.attempt_id,
            failure,
            state.result,
        )
        .await;
        self.emit(AttemptEvent::Complete {
            result: None,
            failure: Some(failure.clone()),
        });
    }

    /// Fire-and-forget lifecycle push; only transport failure aborts the
    /// attempt.
    async fn push(&self, event: &str, payload: Value) -> Result<(), AttemptFailure> {
        self.channel
            .push(event, payload)
            .await
            .map(drop)
            .map_err(|err| AttemptFailure::Protocol(err.to_string()))
    }

    fn emit(&self, event: AttemptEvent) {
        let _ = self.events.send(event);
    }
}

/// Fail an attempt on the wire without a live runner: the stringified
/// failure as an `attempt:log` line, then a synthetic `attempt:complete`
/// carrying the reason code. Used both for mid-run failures and for plans
/// rejected before any `attempt:start`.
pub async fn report_failed_attempt(
    channel: &dyn Channel,
    attempt_id: &str,
    failure: &AttemptFailure,
    final_dataclip_id: Option<Uuid>,
) {
    let log = JsonLog::new(
        "error",
        Some("run".to_string()),
        vec![Value::String(failure.to_string())],
    );
    let _ = channel
        .push(
            protocol::ATTEMPT_LOG,
            json!(AttemptLog {
                log,
                attempt_id: attempt_id.to_string(),
                run_id: None,
            }),
        )
        .await;
    let _ = channel
        .push(
            protocol::ATTEMPT_COMPLETE,
            json!(AttemptComplete {
                final_dataclip_id,
                reason: Some(failure.code().to_string()),
            }),
        )
        .await;
}

/// Remove the configured top-level keys before a state snapshot leaves
/// the worker.
pub fn scrub_state(mut state: Value, props_to_remove: &[String]) -> Value {
    if let Some(object) = state.as_object_mut() {
        for prop in props_to_remove {
            object.remove(prop);
        }
    }
    state
}
