//! Belay - a distributed job-execution worker
//!
//! A long-running agent that claims workflow attempts from a central
//! coordinator over a persistent bidirectional message channel, executes
//! each attempt in an isolated child runner under time and memory budgets,
//! and streams lifecycle events and final results back. The key
//! components are:
//!
//! ## Attempt lifecycle
//!
//! - [`ClaimLoop`]: claim/backoff loop against the coordinator queue
//! - [`Engine`]: concurrency controller and registry of in-flight attempts
//! - [`ExecutionContext`]: per-attempt state and protocol translation
//!
//! ## Execution
//!
//! - [`compiler`]: normalises raw plans into the canonical directed form
//! - [`Runner`]: composes operation chains over an evolving state value
//! - [`runner::child`]: isolated child-process runners with memory and
//!   wall-clock supervision
//!
//! ## Transport
//!
//! - [`Channel`]: join/push/request-reply contract over the coordinator
//!   link
//! - [`Socket`]: newline-delimited JSON transport with reply correlation

pub mod channel;
pub mod claim;
pub mod compiler;
pub mod config;
pub mod context;
pub mod engine;
pub mod error;
pub mod expr;
pub mod plan;
pub mod protocol;
pub mod repo;
pub mod runner;
pub mod server;

// Configuration
pub use config::{BackoffRange, Config};

// Errors
pub use error::{AttemptFailure, ExitCode};

// Channel contract and transport
pub use channel::socket::{ServerFrame, Socket, SocketChannel};
pub use channel::{Channel, ChannelError, ChannelProvider, PushAck, ReplyStatus, PROTOCOL_TIMEOUT};

// Plans
pub use compiler::{compile, CompileError};
pub use plan::{
    CompiledExecutionPlan, CompiledJob, EdgeRule, EdgeSpec, Edges, ExecutionPlan, Expression,
    InitialState, JobSpec,
};

// Runner
pub use runner::events::{JsonLog, RunnerEvent};
pub use runner::{
    local_dispatcher, local_dispatcher_with, CompiledExpression, DispatchRequest, ExprCompiler,
    ExpressionCompiler, LogHandle, Operation, OperationList, Runner, RunnerDispatcher, RunnerError,
    RunnerHandle, RunnerOptions, State, DEFAULT_TIMEOUT,
};

// Attempt lifecycle
pub use claim::{ClaimAbort, ClaimError, ClaimLoop, ClaimOptions, TokenVerifier};
pub use context::{AttemptEvent, AttemptOptions, AttemptState, ExecutionContext};
pub use engine::{
    Engine, EngineError, EngineEvent, EngineOptions, SubscriptionHandle, WorkflowState,
    WorkflowStatus,
};

// Adaptor repo
pub use repo::AdaptorRepo;
