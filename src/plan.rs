//! Execution plan data model.
//!
//! [`ExecutionPlan`] is the declarative input handed over by the
//! coordinator: a list of jobs with optional `next` edges. The compiler
//! (`crate::compiler`) normalises it into a [`CompiledExecutionPlan`]
//! keyed by job id, with edge conditions compiled into callable
//! predicates.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use serde::de::Error as DeError;
use serde::ser::Error as SerError;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map as JsonMap, Value};

use crate::expr::ExprError;
use crate::runner::OperationList;

pub type JobId = String;

/// Compiled edge condition: a pure predicate over the upstream job's
/// output state.
pub type Predicate = Arc<dyn Fn(&Value) -> Result<bool, ExprError> + Send + Sync>;

/// Initial state for an attempt: either an inline state value or the id of
/// a dataclip held by the coordinator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum InitialState {
    Dataclip(String),
    Inline(Value),
}

/// A job's executable body: source text for the expression compiler, or a
/// pre-compiled operation list supplied programmatically. Only source text
/// survives serialisation; precompiled operations never cross a process
/// boundary.
#[derive(Clone)]
pub enum Expression {
    Source(String),
    Ops(OperationList),
}

impl Expression {
    pub fn source(text: impl Into<String>) -> Self {
        Expression::Source(text.into())
    }
}

impl fmt::Debug for Expression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expression::Source(text) => f.debug_tuple("Source").field(text).finish(),
            Expression::Ops(ops) => write!(f, "Ops(<{} operations>)", ops.len()),
        }
    }
}

impl Serialize for Expression {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Expression::Source(text) => serializer.serialize_str(text),
            Expression::Ops(_) => Err(S::Error::custom(
                "precompiled operation lists are not serialisable",
            )),
        }
    }
}

impl<'de> Deserialize<'de> for Expression {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        if text.is_empty() {
            return Err(D::Error::custom("expression must not be empty"));
        }
        Ok(Expression::Source(text))
    }
}

/// Successor edges: a bare successor id, or a mapping from successor id to
/// `true | false | "<condition>" | { condition, .. }`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Edges {
    Single(JobId),
    Many(BTreeMap<JobId, EdgeSpec>),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EdgeSpec {
    Bool(bool),
    /// A bare string is shorthand for `{ condition: .. }`.
    Condition(String),
    Rule(EdgeRule),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EdgeRule {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub disabled: bool,
    /// Other fields are carried through untouched.
    #[serde(flatten)]
    pub extra: JsonMap<String, Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobSpec {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<JobId>,
    pub expression: Expression,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub configuration: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub adaptor: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next: Option<Edges>,
}

impl JobSpec {
    pub fn new(expression: Expression) -> Self {
        Self {
            id: None,
            expression,
            state: None,
            configuration: None,
            adaptor: None,
            next: None,
        }
    }
}

/// Raw execution plan as supplied by the coordinator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionPlan {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(rename = "initialState", skip_serializing_if = "Option::is_none")]
    pub initial_state: Option<InitialState>,
    pub jobs: Vec<JobSpec>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub start: Option<JobId>,
}

// ---------------------------------------------------------------------------
// Compiled form
// ---------------------------------------------------------------------------

/// A compiled successor edge.
#[derive(Clone)]
pub enum CompiledEdge {
    /// Unconditional: always follow.
    Always,
    /// Statically disabled: never follow.
    Disabled,
    /// Follow when the predicate holds over the upstream output state.
    Condition { source: String, predicate: Predicate },
}

impl CompiledEdge {
    pub fn condition_source(&self) -> Option<&str> {
        match self {
            CompiledEdge::Condition { source, .. } => Some(source),
            _ => None,
        }
    }
}

impl fmt::Debug for CompiledEdge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CompiledEdge::Always => write!(f, "Always"),
            CompiledEdge::Disabled => write!(f, "Disabled"),
            CompiledEdge::Condition { source, .. } => {
                f.debug_struct("Condition").field("source", source).finish()
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct CompiledJob {
    pub id: JobId,
    pub expression: Expression,
    pub state: Option<Value>,
    pub configuration: Option<Value>,
    pub adaptor: Option<String>,
    pub next: BTreeMap<JobId, CompiledEdge>,
    pub previous: Option<JobId>,
}

/// Canonical directed form of a plan, keyed by job id.
///
/// Invariants upheld by the compiler: `start` exists in `jobs`; every id
/// referenced by a `next` exists in `jobs`; each job has at most one
/// upstream parent; the graph is acyclic.
#[derive(Debug, Clone)]
pub struct CompiledExecutionPlan {
    pub id: String,
    pub start: JobId,
    pub initial_state: Option<InitialState>,
    pub jobs: BTreeMap<JobId, CompiledJob>,
}

impl From<&CompiledExecutionPlan> for ExecutionPlan {
    /// Project a compiled plan back to its raw form. Used to ship plans to
    /// child runners and to make a second compiler pass a no-op.
    fn from(plan: &CompiledExecutionPlan) -> Self {
        let jobs = plan
            .jobs
            .values()
            .map(|job| JobSpec {
                id: Some(job.id.clone()),
                expression: job.expression.clone(),
                state: job.state.clone(),
                configuration: job.configuration.clone(),
                adaptor: job.adaptor.clone(),
                next: if job.next.is_empty() {
                    None
                } else {
                    Some(Edges::Many(
                        job.next
                            .iter()
                            .map(|(target, edge)| {
                                let spec = match edge {
                                    CompiledEdge::Always => EdgeSpec::Bool(true),
                                    CompiledEdge::Disabled => EdgeSpec::Bool(false),
                                    CompiledEdge::Condition { source, .. } => {
                                        EdgeSpec::Rule(EdgeRule {
                                            condition: Some(source.clone()),
                                            ..EdgeRule::default()
                                        })
                                    }
                                };
                                (target.clone(), spec)
                            })
                            .collect(),
                    ))
                },
            })
            .collect();
        ExecutionPlan {
            id: Some(plan.id.clone()),
            initial_state: plan.initial_state.clone(),
            jobs,
            start: Some(plan.start.clone()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn plan_deserialises_single_and_mapped_edges() {
        let plan: ExecutionPlan = serde_json::from_value(json!({
            "id": "wf-1",
            "jobs": [
                { "id": "a", "expression": "state", "next": "b" },
                { "id": "b", "expression": "state", "next": {
                    "c": true,
                    "d": { "condition": "state.data.n > 1", "label": "big" }
                }},
                { "id": "c", "expression": "state" },
                { "id": "d", "expression": "state" }
            ]
        }))
        .expect("parse");

        assert_eq!(plan.jobs.len(), 4);
        match &plan.jobs[0].next {
            Some(Edges::Single(target)) => assert_eq!(target, "b"),
            other => panic!("expected single edge, got {other:?}"),
        }
        match &plan.jobs[1].next {
            Some(Edges::Many(edges)) => {
                assert!(matches!(edges.get("c"), Some(EdgeSpec::Bool(true))));
                let Some(EdgeSpec::Rule(rule)) = edges.get("d") else {
                    panic!("expected rule edge");
                };
                assert_eq!(rule.condition.as_deref(), Some("state.data.n > 1"));
                assert_eq!(rule.extra.get("label"), Some(&json!("big")));
            }
            other => panic!("expected edge map, got {other:?}"),
        }
    }

    #[test]
    fn initial_state_distinguishes_dataclip_ids_from_values() {
        let clip: InitialState = serde_json::from_value(json!("dc-1")).expect("parse");
        assert_eq!(clip, InitialState::Dataclip("dc-1".to_string()));

        let inline: InitialState = serde_json::from_value(json!({"data": 1})).expect("parse");
        assert_eq!(inline, InitialState::Inline(json!({"data": 1})));
    }

    #[test]
    fn empty_expressions_are_rejected() {
        let result: Result<JobSpec, _> = serde_json::from_value(json!({ "expression": "" }));
        assert!(result.is_err());
    }
}
