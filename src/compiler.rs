//! Plan compiler: normalises a raw [`ExecutionPlan`] into the canonical
//! directed form keyed by job id.
//!
//! Edge-condition failures are collected across the whole plan and raised
//! as one aggregate error; structural violations (unknown targets, cycles,
//! multiple upstream parents) are fatal immediately.

use std::collections::{BTreeMap, HashMap, VecDeque};

use thiserror::Error;

use crate::expr::{self, ExprContext};
use crate::plan::{
    CompiledEdge, CompiledExecutionPlan, CompiledJob, EdgeSpec, Edges, ExecutionPlan, JobId,
    Predicate,
};

#[derive(Debug, Error)]
pub enum CompileError {
    #[error("plan has no jobs")]
    EmptyPlan,

    #[error("start job '{0}' does not exist")]
    UnknownStart(JobId),

    #[error("edge from '{from}' references unknown job '{to}'")]
    UnknownTarget { from: JobId, to: JobId },

    #[error("job '{0}' has more than one upstream parent")]
    MultipleParents(JobId),

    #[error("plan contains a cycle through '{0}'")]
    Cycle(JobId),

    /// Accumulated edge-condition failures, one message per bad edge.
    #[error("{}", .messages.join("\n\n"))]
    Aggregate { messages: Vec<String> },
}

/// Compile a raw plan. Idempotent: feeding a compiled plan's raw
/// projection back through produces an identical result.
pub fn compile(plan: &ExecutionPlan) -> Result<CompiledExecutionPlan, CompileError> {
    if plan.jobs.is_empty() {
        return Err(CompileError::EmptyPlan);
    }

    // Step 1: assign `job-<n>` ids, monotonic within the plan.
    let mut counter = 0usize;
    let ids: Vec<JobId> = plan
        .jobs
        .iter()
        .map(|job| match &job.id {
            Some(id) => id.clone(),
            None => {
                counter += 1;
                format!("job-{counter}")
            }
        })
        .collect();

    // Step 2: seed start from the plan, else the first job.
    let start = plan.start.clone().unwrap_or_else(|| ids[0].clone());

    // Step 3: compile each job, accumulating edge-condition errors.
    let mut errors: Vec<String> = Vec::new();
    let mut jobs: BTreeMap<JobId, CompiledJob> = BTreeMap::new();
    for (job, id) in plan.jobs.iter().zip(&ids) {
        let next = match &job.next {
            Some(edges) => compile_edges(id, edges, &mut errors),
            None => BTreeMap::new(),
        };
        jobs.insert(
            id.clone(),
            CompiledJob {
                id: id.clone(),
                expression: job.expression.clone(),
                state: job.state.clone(),
                configuration: job.configuration.clone(),
                adaptor: job.adaptor.clone(),
                next,
                previous: None,
            },
        );
    }

    // Structural validation is fatal, independent of condition errors.
    if !jobs.contains_key(&start) {
        return Err(CompileError::UnknownStart(start));
    }
    let mut previous: HashMap<JobId, JobId> = HashMap::new();
    for (id, job) in &jobs {
        for target in job.next.keys() {
            if !jobs.contains_key(target) {
                return Err(CompileError::UnknownTarget {
                    from: id.clone(),
                    to: target.clone(),
                });
            }
            if previous.insert(target.clone(), id.clone()).is_some() {
                return Err(CompileError::MultipleParents(target.clone()));
            }
        }
    }
    reject_cycles(&jobs)?;

    if !errors.is_empty() {
        return Err(CompileError::Aggregate { messages: errors });
    }

    for (target, parent) in previous {
        if let Some(job) = jobs.get_mut(&target) {
            job.previous = Some(parent);
        }
    }

    Ok(CompiledExecutionPlan {
        id: plan.id.clone().unwrap_or_default(),
        start,
        initial_state: plan.initial_state.clone(),
        jobs,
    })
}

/// Compile one job's edges. Condition failures are pushed onto `errors`
/// rather than thrown so every bad edge in the plan is reported at once.
fn compile_edges(
    from: &JobId,
    edges: &Edges,
    errors: &mut Vec<String>,
) -> BTreeMap<JobId, CompiledEdge> {
    let mut compiled = BTreeMap::new();
    match edges {
        Edges::Single(target) => {
            compiled.insert(target.clone(), CompiledEdge::Always);
        }
        Edges::Many(entries) => {
            for (target, spec) in entries {
                let condition = match spec {
                    EdgeSpec::Bool(true) => None,
                    EdgeSpec::Bool(false) => {
                        compiled.insert(target.clone(), CompiledEdge::Disabled);
                        continue;
                    }
                    EdgeSpec::Condition(source) => Some(source),
                    EdgeSpec::Rule(rule) if rule.disabled => {
                        compiled.insert(target.clone(), CompiledEdge::Disabled);
                        continue;
                    }
                    EdgeSpec::Rule(rule) => rule.condition.as_ref(),
                };
                let edge = match condition {
                    None => CompiledEdge::Always,
                    Some(source) => match compile_condition(source) {
                        Ok(predicate) => CompiledEdge::Condition {
                            source: source.clone(),
                            predicate,
                        },
                        Err(err) => {
                            errors.push(format!(
                                "invalid condition on edge '{from}' -> '{target}': {err}"
                            ));
                            continue;
                        }
                    },
                };
                compiled.insert(target.clone(), edge);
            }
        }
    }
    compiled
}

/// Compile a condition expression in the condition context: pure
/// inspection primitives over state only.
fn compile_condition(source: &str) -> Result<Predicate, expr::ExprError> {
    let ast = expr::parse_expression(source)?;
    expr::validate(&ast, ExprContext::Condition)?;
    Ok(std::sync::Arc::new(move |state| {
        expr::evaluate(&ast, state, ExprContext::Condition).map(|value| expr::truthy(&value))
    }))
}

/// Kahn's algorithm over the successor edges; any remaining node implies a
/// cycle.
fn reject_cycles(jobs: &BTreeMap<JobId, CompiledJob>) -> Result<(), CompileError> {
    let mut in_degree: BTreeMap<&JobId, usize> = jobs.keys().map(|id| (id, 0)).collect();
    for job in jobs.values() {
        for target in job.next.keys() {
            if let Some(count) = in_degree.get_mut(target) {
                *count += 1;
            }
        }
    }
    let mut frontier: VecDeque<&JobId> = in_degree
        .iter()
        .filter(|(_, count)| **count == 0)
        .map(|(id, _)| *id)
        .collect();
    let mut visited = 0usize;
    while let Some(id) = frontier.pop_front() {
        visited += 1;
        if let Some(job) = jobs.get(id) {
            for target in job.next.keys() {
                if let Some(count) = in_degree.get_mut(target) {
                    *count -= 1;
                    if *count == 0 {
                        frontier.push_back(target);
                    }
                }
            }
        }
    }
    if visited < jobs.len() {
        let stuck = in_degree
            .iter()
            .find(|(_, count)| **count > 0)
            .map(|(id, _)| (*id).clone())
            .unwrap_or_default();
        return Err(CompileError::Cycle(stuck));
    }
    Ok(())
}
