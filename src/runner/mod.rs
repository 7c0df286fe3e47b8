//! Sandboxed attempt runner.
//!
//! The runner consumes a compiled plan and an initial state, walks the job
//! graph from `start`, and threads state through each job's operation
//! chain. Every operation is wrapped with a log line, wall-clock timing
//! and (optionally) a structural clone of its input; wrapped operations
//! are composed by the expression's reducer, or sequentially by default.
//! A single timeout spans the whole composed run.
//!
//! Job expressions compile through the [`ExpressionCompiler`] seam. The
//! built-in compiler accepts the restricted state-expression language of
//! [`crate::expr`] — a `;`-separated sequence where each expression
//! produces the next state — plus top-level `log(..)` statements wired to
//! the scoped logger. There is no dynamic code loading: an expression can
//! only ever inspect and build JSON state.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::BoxFuture;
use serde_json::{json, Map as JsonMap, Value};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tracing::warn;

use crate::compiler;
use crate::error::AttemptFailure;
use crate::expr::{self, ExprContext};
use crate::plan::{CompiledEdge, CompiledExecutionPlan, ExecutionPlan, Expression, InitialState};

pub mod child;
pub mod events;

use events::{JsonLog, RunnerEvent};

/// State threaded through operations: an opaque JSON mapping with
/// well-known slots `configuration`, `data`, `references`, `index`.
pub type State = Value;

/// `op(state) -> state`, possibly asynchronous. The error string is the
/// serialised user-code failure.
pub type Operation = Arc<dyn Fn(State) -> BoxFuture<'static, Result<State, String>> + Send + Sync>;

pub type OperationList = Vec<Operation>;

/// Composes wrapped operations over an initial state.
pub type Reducer =
    Arc<dyn Fn(OperationList, State) -> BoxFuture<'static, Result<State, String>> + Send + Sync>;

/// Wall-clock budget when none is configured.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(300);

#[derive(Debug, Error)]
pub enum RunnerError {
    #[error("run exceeded its {}s wall-clock budget", .0.as_secs_f64())]
    Timeout(Duration),

    #[error("{0}")]
    Runtime(String),

    #[error("expression failed to compile: {0}")]
    Expression(String),

    #[error("precompiled operation lists are rejected when the sandbox is forced")]
    PrecompiledRejected,

    #[error("invariant violated: {0}")]
    Invariant(String),
}

impl RunnerError {
    pub fn to_failure(&self) -> AttemptFailure {
        match self {
            RunnerError::Timeout(_) => AttemptFailure::Timeout(self.to_string()),
            RunnerError::Runtime(message) => AttemptFailure::Runtime(message.clone()),
            RunnerError::Expression(message) => AttemptFailure::Compile(message.clone()),
            RunnerError::PrecompiledRejected => AttemptFailure::Compile(self.to_string()),
            RunnerError::Invariant(message) => AttemptFailure::Invariant(message.clone()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RunnerOptions {
    /// Budget spanning the whole composed run.
    pub timeout: Duration,
    /// Deep-clone state before each operation.
    pub immutable_state: bool,
    /// Project the final state to `{data, error, references}`.
    pub strict_state: bool,
    /// Refuse precompiled operation lists.
    pub force_sandbox: bool,
}

impl Default for RunnerOptions {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_TIMEOUT,
            immutable_state: false,
            strict_state: false,
            force_sandbox: false,
        }
    }
}

/// Scoped logger handed to operations. Log lines become events on the
/// attempt stream rather than process logs.
#[derive(Clone)]
pub struct LogHandle {
    tx: mpsc::Sender<RunnerEvent>,
    name: Option<String>,
}

impl LogHandle {
    pub fn new(tx: mpsc::Sender<RunnerEvent>, name: Option<String>) -> Self {
        Self { tx, name }
    }

    pub fn emit(&self, level: &str, message: Vec<Value>) {
        let log = JsonLog::new(level, self.name.clone(), message);
        if self.tx.try_send(RunnerEvent::Log { log }).is_err() {
            warn!("runner log dropped: event stream full or closed");
        }
    }

    pub fn debug(&self, text: impl Into<String>) {
        self.emit("debug", vec![Value::String(text.into())]);
    }

    pub fn info(&self, text: impl Into<String>) {
        self.emit("info", vec![Value::String(text.into())]);
    }
}

/// A compiled job body: the operation chain plus an optional reducer
/// override.
pub struct CompiledExpression {
    pub ops: OperationList,
    pub reducer: Option<Reducer>,
}

impl CompiledExpression {
    pub fn sequential(ops: OperationList) -> Self {
        Self { ops, reducer: None }
    }
}

/// Turns expression source text into a callable operation chain.
pub trait ExpressionCompiler: Send + Sync {
    fn compile(&self, source: &str, logs: &LogHandle) -> Result<CompiledExpression, RunnerError>;
}

/// Built-in compiler over the restricted state-expression language.
///
/// Each `;`-separated expression becomes one operation evaluating with
/// `state` bound; a top-level `log(..)` statement evaluates its arguments,
/// emits them through the scoped logger, and passes state through
/// unchanged.
#[derive(Debug, Default)]
pub struct ExprCompiler;

impl ExpressionCompiler for ExprCompiler {
    fn compile(&self, source: &str, logs: &LogHandle) -> Result<CompiledExpression, RunnerError> {
        let statements =
            expr::parse_program(source).map_err(|err| RunnerError::Expression(err.to_string()))?;

        let mut ops: OperationList = Vec::with_capacity(statements.len());
        for statement in statements {
            if let expr::Expr::Call { function, args } = &statement {
                if function == "log" {
                    let args = args.clone();
                    let logs = logs.clone();
                    ops.push(Arc::new(move |state: State| {
                        let args = args.clone();
                        let logs = logs.clone();
                        Box::pin(async move {
                            let mut message = Vec::with_capacity(args.len());
                            for arg in &args {
                                message.push(
                                    expr::evaluate(arg, &state, ExprContext::Operation)
                                        .map_err(|err| err.to_string())?,
                                );
                            }
                            logs.emit("info", message);
                            Ok(state)
                        })
                    }));
                    continue;
                }
            }
            expr::validate(&statement, ExprContext::Operation)
                .map_err(|err| RunnerError::Expression(err.to_string()))?;
            ops.push(Arc::new(move |state: State| {
                let ast = statement.clone();
                Box::pin(async move {
                    expr::evaluate(&ast, &state, ExprContext::Operation)
                        .map_err(|err| err.to_string())
                })
            }));
        }
        Ok(CompiledExpression::sequential(ops))
    }
}

pub struct Runner {
    compiler: Arc<dyn ExpressionCompiler>,
}

impl Default for Runner {
    fn default() -> Self {
        Self {
            compiler: Arc::new(ExprCompiler),
        }
    }
}

impl Runner {
    pub fn new(compiler: Arc<dyn ExpressionCompiler>) -> Self {
        Self { compiler }
    }

    /// Execute a compiled plan, emitting lifecycle events on `events`.
    ///
    /// All expressions resolve before any event is emitted, so a bad
    /// expression or a rejected precompiled list fails synchronously. On
    /// failure the terminal error event is emitted before returning.
    pub async fn execute(
        &self,
        plan: &CompiledExecutionPlan,
        initial: State,
        options: &RunnerOptions,
        events: &mpsc::Sender<RunnerEvent>,
    ) -> Result<State, RunnerError> {
        match self.execute_inner(plan, initial, options, events).await {
            Ok(state) => Ok(state),
            Err(err) => {
                let _ = events.send(RunnerEvent::failure(&err.to_failure())).await;
                Err(err)
            }
        }
    }

    async fn execute_inner(
        &self,
        plan: &CompiledExecutionPlan,
        initial: State,
        options: &RunnerOptions,
        events: &mpsc::Sender<RunnerEvent>,
    ) -> Result<State, RunnerError> {
        let logs = LogHandle::new(events.clone(), Some("run".to_string()));
        let bodies = self.resolve_expressions(plan, options, &logs)?;

        send_event(events, RunnerEvent::WorkflowStart).await?;

        let result = tokio::time::timeout(
            options.timeout,
            self.run_jobs(plan, initial, options, events, &bodies),
        )
        .await;
        let state = match result {
            Ok(state) => state?,
            Err(_) => return Err(RunnerError::Timeout(options.timeout)),
        };

        send_event(events, RunnerEvent::WorkflowComplete).await?;
        Ok(filter_final_state(state, options.strict_state))
    }

    /// Resolve every job body up front. `force_sandbox` makes precompiled
    /// operation lists a synchronous failure.
    fn resolve_expressions(
        &self,
        plan: &CompiledExecutionPlan,
        options: &RunnerOptions,
        logs: &LogHandle,
    ) -> Result<HashMap<String, CompiledExpression>, RunnerError> {
        let mut bodies = HashMap::with_capacity(plan.jobs.len());
        for (id, job) in &plan.jobs {
            let body = match &job.expression {
                Expression::Source(source) => self.compiler.compile(source, logs)?,
                Expression::Ops(_) if options.force_sandbox => {
                    return Err(RunnerError::PrecompiledRejected);
                }
                Expression::Ops(ops) => CompiledExpression::sequential(ops.clone()),
            };
            bodies.insert(id.clone(), body);
        }
        Ok(bodies)
    }

    async fn run_jobs(
        &self,
        plan: &CompiledExecutionPlan,
        initial: State,
        options: &RunnerOptions,
        events: &mpsc::Sender<RunnerEvent>,
        bodies: &HashMap<String, CompiledExpression>,
    ) -> Result<State, RunnerError> {
        let logs = LogHandle::new(events.clone(), Some("run".to_string()));
        let mut frontier = std::collections::VecDeque::new();
        frontier.push_back((plan.start.clone(), initial));
        let mut last_completed = json!({});

        while let Some((job_id, inbound)) = frontier.pop_front() {
            let job = plan
                .jobs
                .get(&job_id)
                .ok_or_else(|| RunnerError::Invariant(format!("no such job '{job_id}'")))?;
            let body = bodies
                .get(&job_id)
                .ok_or_else(|| RunnerError::Invariant(format!("no body for job '{job_id}'")))?;

            send_event(events, RunnerEvent::JobStart {
                job_id: job_id.clone(),
            })
            .await?;

            // Job-level state replaces the inbound value; configuration is
            // injected into its well-known slot.
            let mut state = match &job.state {
                Some(fixed) => fixed.clone(),
                None => inbound,
            };
            if let Some(configuration) = &job.configuration {
                if let Some(object) = state.as_object_mut() {
                    object.insert("configuration".to_string(), configuration.clone());
                }
            }

            let started = Instant::now();
            let wrapped: OperationList = body
                .ops
                .iter()
                .enumerate()
                .map(|(index, op)| wrap_operation(op, index, options.immutable_state, &logs))
                .collect();
            let output = match &body.reducer {
                Some(reducer) => reducer(wrapped, state)
                    .await
                    .map_err(RunnerError::Runtime)?,
                None => default_reduce(wrapped, state).await?,
            };
            let duration_ms = started.elapsed().as_millis() as u64;

            send_event(events, RunnerEvent::JobComplete {
                job_id: job_id.clone(),
                state: output.clone(),
                duration_ms,
            })
            .await?;

            for (target, edge) in &job.next {
                let follow = match edge {
                    CompiledEdge::Always => true,
                    CompiledEdge::Disabled => false,
                    CompiledEdge::Condition { source, predicate } => {
                        predicate(&output).map_err(|err| {
                            RunnerError::Runtime(format!("condition '{source}' failed: {err}"))
                        })?
                    }
                };
                if follow {
                    frontier.push_back((target.clone(), output.clone()));
                }
            }
            last_completed = output;
        }

        Ok(last_completed)
    }
}

/// Wrap one operation: log start, record wall-clock, optionally hand the
/// operation a structural clone, await, log duration.
fn wrap_operation(op: &Operation, index: usize, immutable: bool, logs: &LogHandle) -> Operation {
    let op = Arc::clone(op);
    let logs = logs.clone();
    Arc::new(move |state: State| {
        let op = Arc::clone(&op);
        let logs = logs.clone();
        Box::pin(async move {
            logs.debug(format!("Starting operation {}", index + 1));
            let started = Instant::now();
            let input = if immutable { clone_state(&state) } else { state };
            let output = op(input).await?;
            logs.debug(format!(
                "Operation {} complete in {}ms",
                index + 1,
                started.elapsed().as_millis()
            ));
            Ok(output)
        })
    })
}

/// Default reducer: thread operations sequentially, propagating the first
/// failure.
async fn default_reduce(ops: OperationList, initial: State) -> Result<State, RunnerError> {
    let mut state = initial;
    for op in ops {
        state = op(state).await.map_err(RunnerError::Runtime)?;
    }
    Ok(state)
}

/// Structural clone via JSON round-trip. Lossy for anything a JSON value
/// cannot carry, which is the documented contract.
pub fn clone_state(state: &State) -> State {
    serde_json::to_string(state)
        .ok()
        .and_then(|text| serde_json::from_str(&text).ok())
        .unwrap_or_else(|| state.clone())
}

fn filter_final_state(state: State, strict: bool) -> State {
    if !strict {
        return state;
    }
    match state {
        Value::Object(map) => {
            let mut projected = JsonMap::new();
            for key in ["data", "error", "references"] {
                if let Some(value) = map.get(key) {
                    projected.insert(key.to_string(), value.clone());
                }
            }
            Value::Object(projected)
        }
        other => other,
    }
}

async fn send_event(
    events: &mpsc::Sender<RunnerEvent>,
    event: RunnerEvent,
) -> Result<(), RunnerError> {
    events
        .send(event)
        .await
        .map_err(|_| RunnerError::Invariant("runner event stream closed".to_string()))
}

// ---------------------------------------------------------------------------
// Dispatcher seam
// ---------------------------------------------------------------------------

/// One attempt's worth of work handed to a runner dispatcher.
#[derive(Debug, Clone)]
pub struct DispatchRequest {
    pub plan: ExecutionPlan,
    pub timeout: Duration,
    pub memory_limit_mb: u64,
    pub immutable_state: bool,
    pub strict_state: bool,
}

/// Live runner for one attempt: the event stream plus a kill switch.
pub struct RunnerHandle {
    pub events: mpsc::Receiver<RunnerEvent>,
    cancel: Option<oneshot::Sender<()>>,
}

impl RunnerHandle {
    pub fn new(events: mpsc::Receiver<RunnerEvent>, cancel: oneshot::Sender<()>) -> Self {
        Self {
            events,
            cancel: Some(cancel),
        }
    }

    /// Tear the runner down. Idempotent.
    pub fn kill(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            let _ = cancel.send(());
        }
    }
}

/// Spawns or dispatches one attempt to an isolated runner. Fixed at engine
/// construction; tests swap in [`local_dispatcher`].
pub type RunnerDispatcher =
    Arc<dyn Fn(DispatchRequest) -> BoxFuture<'static, anyhow::Result<RunnerHandle>> + Send + Sync>;

/// In-process dispatcher: runs the attempt on a task in this process.
/// Isolation is the child dispatcher's job ([`child::dispatcher`]); this
/// one exists for tests and one-shot local execution.
pub fn local_dispatcher() -> RunnerDispatcher {
    local_dispatcher_with(Arc::new(ExprCompiler), false)
}

pub fn local_dispatcher_with(
    compiler: Arc<dyn ExpressionCompiler>,
    force_sandbox: bool,
) -> RunnerDispatcher {
    Arc::new(move |request: DispatchRequest| {
        let compiler = Arc::clone(&compiler);
        Box::pin(async move {
            let compiled = compiler::compile(&request.plan)
                .map_err(|err| anyhow::anyhow!("plan failed to compile: {err}"))?;
            let initial = match &compiled.initial_state {
                Some(InitialState::Inline(value)) => value.clone(),
                None => json!({}),
                Some(InitialState::Dataclip(id)) => {
                    anyhow::bail!("dataclip '{id}' must be resolved before dispatch")
                }
            };
            let options = RunnerOptions {
                timeout: request.timeout,
                immutable_state: request.immutable_state,
                strict_state: request.strict_state,
                force_sandbox,
            };
            let (tx, rx) = mpsc::channel(256);
            let (cancel_tx, cancel_rx) = oneshot::channel();
            tokio::spawn(async move {
                let runner = Runner::new(compiler);
                tokio::select! {
                    _ = cancel_rx => {}
                    _ = runner.execute(&compiled, initial, &options, &tx) => {}
                }
            });
            Ok(RunnerHandle::new(rx, cancel_tx))
        })
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::{EdgeRule, EdgeSpec, Edges, JobSpec};

    fn plan_of(jobs: Vec<JobSpec>) -> CompiledExecutionPlan {
        compiler::compile(&ExecutionPlan {
            id: Some("test".into()),
            initial_state: None,
            jobs,
            start: None,
        })
        .expect("compile")
    }

    fn source_job(id: &str, source: &str, next: Option<Edges>) -> JobSpec {
        JobSpec {
            id: Some(id.to_string()),
            next,
            ..JobSpec::new(Expression::source(source))
        }
    }

    async fn run(
        plan: &CompiledExecutionPlan,
        initial: State,
        options: RunnerOptions,
    ) -> (Result<State, RunnerError>, Vec<RunnerEvent>) {
        let (tx, mut rx) = mpsc::channel(256);
        let runner = Runner::default();
        let result = runner.execute(plan, initial, &options, &tx).await;
        drop(tx);
        let mut events = Vec::new();
        while let Some(event) = rx.recv().await {
            events.push(event);
        }
        (result, events)
    }

    #[tokio::test]
    async fn threads_state_through_a_single_job() {
        let plan = plan_of(vec![source_job(
            "double",
            "merge(state, { data: state.data * 2 })",
            None,
        )]);
        let (result, events) = run(&plan, json!({"data": 21}), RunnerOptions::default()).await;
        assert_eq!(result.expect("state"), json!({"data": 42}));

        let kinds: Vec<&str> = events
            .iter()
            .filter_map(|event| match event {
                RunnerEvent::WorkflowStart => Some("workflow-start"),
                RunnerEvent::JobStart { .. } => Some("job-start"),
                RunnerEvent::JobComplete { .. } => Some("job-complete"),
                RunnerEvent::WorkflowComplete => Some("workflow-complete"),
                _ => None,
            })
            .collect();
        assert_eq!(
            kinds,
            vec![
                "workflow-start",
                "job-start",
                "job-complete",
                "workflow-complete"
            ]
        );
    }

    #[tokio::test]
    async fn follows_matching_edges_only() {
        let edges = Edges::Many(
            [
                (
                    "big".to_string(),
                    EdgeSpec::Rule(EdgeRule {
                        condition: Some("state.data > 10".into()),
                        ..EdgeRule::default()
                    }),
                ),
                (
                    "small".to_string(),
                    EdgeSpec::Rule(EdgeRule {
                        condition: Some("state.data <= 10".into()),
                        ..EdgeRule::default()
                    }),
                ),
            ]
            .into_iter()
            .collect(),
        );
        let plan = plan_of(vec![
            source_job("head", "merge(state, { data: state.data + 1 })", Some(edges)),
            source_job("big", "merge(state, { branch: 'big' })", None),
            source_job("small", "merge(state, { branch: 'small' })", None),
        ]);
        let (result, events) = run(&plan, json!({"data": 3}), RunnerOptions::default()).await;
        assert_eq!(result.expect("state"), json!({"data": 4, "branch": "small"}));

        let started: Vec<String> = events
            .iter()
            .filter_map(|event| match event {
                RunnerEvent::JobStart { job_id } => Some(job_id.clone()),
                _ => None,
            })
            .collect();
        assert_eq!(started, vec!["head".to_string(), "small".to_string()]);
    }

    #[tokio::test]
    async fn hanging_operation_times_out() {
        let hang: Operation = Arc::new(|_state| Box::pin(futures::future::pending()));
        let plan = plan_of(vec![JobSpec {
            id: Some("hang".into()),
            ..JobSpec::new(Expression::Ops(vec![hang]))
        }]);
        let options = RunnerOptions {
            timeout: Duration::from_millis(100),
            ..RunnerOptions::default()
        };
        let started = Instant::now();
        let (result, events) = run(&plan, json!({}), options).await;
        assert!(started.elapsed() < Duration::from_millis(150));
        assert!(matches!(result, Err(RunnerError::Timeout(_))));
        assert!(events
            .iter()
            .any(|event| matches!(event, RunnerEvent::Error { code, .. } if code == "ERR_TIMEOUT")));
        // the run never completed
        assert!(!events
            .iter()
            .any(|event| matches!(event, RunnerEvent::WorkflowComplete)));
    }

    #[tokio::test]
    async fn user_errors_surface_as_runtime_failures() {
        let plan = plan_of(vec![source_job("bad", "state.data / 0", None)]);
        let (result, events) = run(&plan, json!({"data": 1}), RunnerOptions::default()).await;
        assert!(matches!(result, Err(RunnerError::Runtime(_))));
        assert!(events.iter().any(
            |event| matches!(event, RunnerEvent::Error { code, .. } if code == "ERR_RUNTIME_EXCEPTION")
        ));
    }

    #[tokio::test]
    async fn force_sandbox_rejects_precompiled_ops_before_any_event() {
        let noop: Operation = Arc::new(|state| Box::pin(async move { Ok(state) }));
        let plan = plan_of(vec![JobSpec {
            id: Some("pre".into()),
            ..JobSpec::new(Expression::Ops(vec![noop]))
        }]);
        let options = RunnerOptions {
            force_sandbox: true,
            ..RunnerOptions::default()
        };
        let (result, events) = run(&plan, json!({}), options).await;
        assert!(matches!(result, Err(RunnerError::PrecompiledRejected)));
        assert!(!events
            .iter()
            .any(|event| matches!(event, RunnerEvent::WorkflowStart)));
    }

    #[tokio::test]
    async fn immutable_state_hands_each_operation_a_clone() {
        // The operation returns its input untouched; under immutable mode
        // the value it sees is a structural copy, so mutating the copy in
        // a later op cannot change earlier snapshots. Observable here as
        // plain value semantics surviving the round trip.
        let plan = plan_of(vec![source_job(
            "pass",
            "merge(state, { data: state.data })",
            None,
        )]);
        let options = RunnerOptions {
            immutable_state: true,
            ..RunnerOptions::default()
        };
        let (result, _) = run(&plan, json!({"data": {"deep": [1, 2]}}), options).await;
        assert_eq!(result.expect("state"), json!({"data": {"deep": [1, 2]}}));
    }

    #[tokio::test]
    async fn strict_mode_projects_the_final_state() {
        let plan = plan_of(vec![source_job(
            "noisy",
            "merge(state, { response: { status: 200 }, references: [1] })",
            None,
        )]);
        let options = RunnerOptions {
            strict_state: true,
            ..RunnerOptions::default()
        };
        let (result, _) = run(&plan, json!({"data": 1, "configuration": {"secret": true}}), options)
            .await;
        assert_eq!(result.expect("state"), json!({"data": 1, "references": [1]}));
    }

    #[tokio::test]
    async fn log_statements_emit_events_and_pass_state_through() {
        let plan = plan_of(vec![source_job(
            "chatty",
            "log('n is', state.data.n); merge(state, { data: { n: state.data.n + 1 } })",
            None,
        )]);
        let (result, events) = run(&plan, json!({"data": {"n": 1}}), RunnerOptions::default()).await;
        assert_eq!(result.expect("state"), json!({"data": {"n": 2}}));
        let logged = events.iter().any(|event| match event {
            RunnerEvent::Log { log } => log.message == vec![json!("n is"), json!(1)],
            _ => false,
        });
        assert!(logged, "expected the user log line on the event stream");
    }

    #[tokio::test]
    async fn job_configuration_lands_in_its_slot() {
        let mut job = source_job("cfg", "state.configuration.token", None);
        job.configuration = Some(json!({"token": "abc"}));
        let plan = plan_of(vec![job]);
        let (result, _) = run(&plan, json!({}), RunnerOptions::default()).await;
        assert_eq!(result.expect("state"), json!("abc"));
    }
}
