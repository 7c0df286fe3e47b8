//! Round trips through the real worker binary in `run-attempt` mode.

use std::path::PathBuf;
use std::time::Duration;

use serde_json::json;

use belay::runner::child::{self, ChildRunnerConfig};
use belay::{DispatchRequest, ExecutionPlan, RunnerEvent};

fn worker_binary() -> ChildRunnerConfig {
    ChildRunnerConfig {
        worker_entry: PathBuf::from(env!("CARGO_BIN_EXE_belay-worker")),
    }
}

fn request_for(plan: serde_json::Value) -> DispatchRequest {
    DispatchRequest {
        plan: serde_json::from_value::<ExecutionPlan>(plan).expect("plan parses"),
        timeout: Duration::from_secs(5),
        memory_limit_mb: 500,
        immutable_state: false,
        strict_state: false,
    }
}

#[tokio::test]
async fn child_process_streams_lifecycle_events_back() {
    let request = request_for(json!({
        "id": "child-1",
        "initialState": {"data": 5},
        "jobs": [{"expression": "merge(state, { data: state.data * 3 })"}]
    }));
    let mut handle = child::spawn(&worker_binary(), &request).await.expect("spawn");

    let mut outputs = Vec::new();
    let mut complete = false;
    while let Some(event) = handle.events.recv().await {
        match event {
            RunnerEvent::JobComplete { state, .. } => outputs.push(state),
            RunnerEvent::WorkflowComplete => complete = true,
            RunnerEvent::Error { code, message } => panic!("child failed: {code}: {message}"),
            _ => {}
        }
    }

    assert!(complete, "child never completed the workflow");
    assert_eq!(outputs, vec![json!({"data": 15})]);
}

#[tokio::test]
async fn child_process_reports_compile_failures() {
    let request = request_for(json!({
        "id": "child-2",
        "jobs": [
            {"id": "a", "expression": "state", "next": {"b": {"condition": "!!!not valid"}}},
            {"id": "b", "expression": "state"}
        ]
    }));
    let mut handle = child::spawn(&worker_binary(), &request).await.expect("spawn");

    let mut failure = None;
    while let Some(event) = handle.events.recv().await {
        match event {
            RunnerEvent::Error { code, .. } => failure = Some(code),
            RunnerEvent::WorkflowStart => panic!("bad plan must not start"),
            _ => {}
        }
    }
    assert_eq!(failure.as_deref(), Some("ERR_COMPILE"));
}

#[tokio::test]
async fn killing_the_handle_terminates_the_child() {
    let request = request_for(json!({
        "id": "child-3",
        "initialState": {"data": 1},
        "jobs": [{"expression": "merge(state, { data: state.data })"}]
    }));
    let mut handle = child::spawn(&worker_binary(), &request).await.expect("spawn");
    handle.kill();
    // The stream ends once the supervisor reaps the child.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        tokio::select! {
            event = handle.events.recv() => {
                if event.is_none() {
                    break;
                }
            }
            _ = tokio::time::sleep_until(deadline) => panic!("child never terminated"),
        }
    }
}
