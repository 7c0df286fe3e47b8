//! End-to-end attempt lifecycle tests against an in-memory coordinator.
//!
//! These cover the wire-protocol scenarios: the happy path event sequence,
//! join rejection, runner timeout, edge-compile failure, dataclip initial
//! state, and the capacity ceiling.

use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tokio::sync::watch;
use tokio::time::Instant;

use belay::protocol::{self, ClaimedAttempt};
use belay::{
    local_dispatcher, local_dispatcher_with, AttemptEvent, AttemptFailure, AttemptOptions, Channel,
    ClaimAbort, ClaimLoop, ClaimOptions, Engine, EngineOptions, TokenVerifier,
};

use harness::{FakeCoordinator, SlowJobCompiler};

fn claim_loop(engine: &Engine, coordinator: &FakeCoordinator, options: ClaimOptions) -> ClaimLoop {
    let queue: Arc<dyn Channel> = coordinator.channel(protocol::QUEUE_TOPIC);
    ClaimLoop::new(
        engine.clone(),
        queue,
        Arc::new(coordinator.clone()),
        TokenVerifier::none(),
        options,
    )
}

fn claimed(attempt_id: &str) -> ClaimedAttempt {
    ClaimedAttempt {
        attempt_id: attempt_id.to_string(),
        token: "token".to_string(),
    }
}

fn lifecycle_events(coordinator: &FakeCoordinator, topic: &str) -> Vec<String> {
    coordinator
        .recorded_on(topic)
        .iter()
        .map(|record| record.event.clone())
        .filter(|event| event != protocol::ATTEMPT_LOG)
        .collect()
}

#[tokio::test]
async fn happy_path_doubles_the_data() {
    let coordinator = FakeCoordinator::new();
    coordinator.add_plan(
        "a1",
        json!({
            "id": "a1",
            "initialState": {"data": 21},
            "jobs": [{"expression": "merge(state, { data: state.data * 2 })"}]
        }),
    );
    let engine = Engine::new(local_dispatcher(), EngineOptions::default());
    let claims = claim_loop(&engine, &coordinator, ClaimOptions::default());

    let handle = engine.listen("a1");
    claims.claim_attempt(&claimed("a1")).await.expect("claim");
    let (result, failure) = handle.wait().await.expect("attempt finished");

    assert!(failure.is_none(), "unexpected failure: {failure:?}");
    assert_eq!(result, Some(json!({"data": 42})));

    let topic = "attempt:a1";
    assert_eq!(
        lifecycle_events(&coordinator, topic),
        vec![
            "join",
            protocol::GET_ATTEMPT,
            protocol::ATTEMPT_START,
            protocol::RUN_START,
            protocol::RUN_COMPLETE,
            protocol::ATTEMPT_COMPLETE,
        ]
    );

    let records = coordinator.recorded_on(topic);
    let run_complete = records
        .iter()
        .find(|record| record.event == protocol::RUN_COMPLETE)
        .expect("run:complete pushed");
    let output: Value =
        serde_json::from_str(run_complete.payload["output_dataclip"].as_str().unwrap())
            .expect("output dataclip parses");
    assert_eq!(output, json!({"data": 42}));

    let attempt_complete = records
        .iter()
        .find(|record| record.event == protocol::ATTEMPT_COMPLETE)
        .expect("attempt:complete pushed");
    assert_eq!(
        attempt_complete.payload["final_dataclip_id"],
        run_complete.payload["output_dataclip_id"]
    );
    assert!(attempt_complete.payload.get("reason").is_none());
}

#[tokio::test]
async fn every_run_start_pairs_with_a_run_complete() {
    let coordinator = FakeCoordinator::new();
    coordinator.add_plan(
        "a2",
        json!({
            "id": "a2",
            "initialState": {"data": 1},
            "jobs": [
                {"id": "inc", "expression": "merge(state, { data: state.data + 1 })", "next": "double"},
                {"id": "double", "expression": "merge(state, { data: state.data * 2 })"}
            ]
        }),
    );
    let engine = Engine::new(local_dispatcher(), EngineOptions::default());
    let claims = claim_loop(&engine, &coordinator, ClaimOptions::default());

    let handle = engine.listen("a2");
    claims.claim_attempt(&claimed("a2")).await.expect("claim");
    let (result, failure) = handle.wait().await.expect("attempt finished");
    assert!(failure.is_none());
    assert_eq!(result, Some(json!({"data": 4})));

    let records = coordinator.recorded_on("attempt:a2");
    let mut open_runs: Vec<Value> = Vec::new();
    let mut last_output_id = Value::Null;
    let mut saw_attempt_complete = false;
    for record in &records {
        match record.event.as_str() {
            event if event == protocol::RUN_START => {
                assert!(!saw_attempt_complete);
                open_runs.push(record.payload["run_id"].clone());
            }
            event if event == protocol::RUN_COMPLETE => {
                let run_id = record.payload["run_id"].clone();
                let position = open_runs
                    .iter()
                    .position(|open| *open == run_id)
                    .expect("run:complete matches an open run:start");
                open_runs.remove(position);
                last_output_id = record.payload["output_dataclip_id"].clone();
            }
            event if event == protocol::ATTEMPT_COMPLETE => {
                saw_attempt_complete = true;
                assert!(open_runs.is_empty(), "runs left open at attempt:complete");
                assert_eq!(record.payload["final_dataclip_id"], last_output_id);
            }
            _ => {}
        }
    }
    assert!(saw_attempt_complete);
    assert_eq!(coordinator.count_of("attempt:a2", protocol::RUN_START), 2);
    assert_eq!(coordinator.count_of("attempt:a2", protocol::RUN_COMPLETE), 2);
}

#[tokio::test]
async fn rejected_join_surfaces_the_reason_verbatim() {
    let coordinator = FakeCoordinator::new();
    coordinator.add_plan("a3", json!({"jobs": [{"expression": "state"}]}));
    coordinator.reject_joins("attempt:a3", json!("invalid-token"));
    let engine = Engine::new(local_dispatcher(), EngineOptions::default());
    let claims = claim_loop(&engine, &coordinator, ClaimOptions::default());

    let abort = claims.claim_attempt(&claimed("a3")).await.unwrap_err();
    assert_eq!(abort, ClaimAbort::JoinRejected("invalid-token".to_string()));

    assert_eq!(coordinator.count_of("attempt:a3", protocol::ATTEMPT_START), 0);
    assert_eq!(engine.active_count(), 0);
}

#[tokio::test]
async fn hanging_job_fails_with_timeout_and_frees_capacity() {
    let coordinator = FakeCoordinator::new();
    coordinator.add_plan("a4", json!({"jobs": [{"expression": "slow:10000"}]}));
    let engine = Engine::new(
        local_dispatcher_with(Arc::new(SlowJobCompiler::default()), false),
        EngineOptions {
            capacity: 5,
            attempt: AttemptOptions {
                timeout: Duration::from_millis(100),
                ..AttemptOptions::default()
            },
        },
    );
    let claims = claim_loop(&engine, &coordinator, ClaimOptions::default());

    let mut handle = engine.listen("a4");
    claims.claim_attempt(&claimed("a4")).await.expect("claim");

    let mut started_at = None;
    let failure = loop {
        match handle.recv().await.expect("event stream open") {
            AttemptEvent::RunStart { .. } => started_at = Some(Instant::now()),
            AttemptEvent::Complete { failure, .. } => break failure,
            _ => {}
        }
    };
    let elapsed = started_at.expect("run started").elapsed();
    assert!(
        elapsed < Duration::from_millis(150),
        "timeout took {elapsed:?}"
    );
    assert!(matches!(failure, Some(AttemptFailure::Timeout(_))));

    let records = coordinator.recorded_on("attempt:a4");
    let attempt_complete = records
        .iter()
        .find(|record| record.event == protocol::ATTEMPT_COMPLETE)
        .expect("attempt:complete pushed");
    assert_eq!(attempt_complete.payload["reason"], json!("ERR_TIMEOUT"));

    // capacity freed
    let deadline = Instant::now() + Duration::from_secs(1);
    while engine.active_count() > 0 {
        assert!(Instant::now() < deadline, "capacity never freed");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[tokio::test]
async fn bad_edge_condition_fails_before_any_attempt_start() {
    let coordinator = FakeCoordinator::new();
    coordinator.add_plan(
        "a5",
        json!({
            "jobs": [
                {"id": "a", "expression": "state", "next": {"b": {"condition": "!!!not valid"}}},
                {"id": "b", "expression": "state"}
            ]
        }),
    );
    let engine = Engine::new(local_dispatcher(), EngineOptions::default());
    let claims = claim_loop(&engine, &coordinator, ClaimOptions::default());

    let handle = engine.listen("a5");
    claims.claim_attempt(&claimed("a5")).await.expect("claim");
    let (result, failure) = handle.wait().await.expect("attempt finished");

    assert!(result.is_none());
    assert!(matches!(failure, Some(AttemptFailure::Compile(_))));
    assert_eq!(coordinator.count_of("attempt:a5", protocol::ATTEMPT_START), 0);
    assert_eq!(coordinator.count_of("attempt:a5", protocol::RUN_START), 0);

    let records = coordinator.recorded_on("attempt:a5");
    let attempt_complete = records
        .iter()
        .find(|record| record.event == protocol::ATTEMPT_COMPLETE)
        .expect("synthetic attempt:complete pushed");
    assert_eq!(attempt_complete.payload["reason"], json!("ERR_COMPILE"));
    assert!(attempt_complete.payload.get("final_dataclip_id").is_none());
}

#[tokio::test]
async fn dataclip_initial_state_is_fetched_and_parsed() {
    let coordinator = FakeCoordinator::new();
    coordinator.add_dataclip("dc-1", br#"{"data":{"n":7}}"#);
    coordinator.add_plan(
        "a6",
        json!({
            "initialState": "dc-1",
            "jobs": [{"expression": "merge(state, { data: { n: state.data.n + 1 } })"}]
        }),
    );
    let engine = Engine::new(local_dispatcher(), EngineOptions::default());
    let claims = claim_loop(&engine, &coordinator, ClaimOptions::default());

    let handle = engine.listen("a6");
    claims.claim_attempt(&claimed("a6")).await.expect("claim");
    let (result, failure) = handle.wait().await.expect("attempt finished");

    assert!(failure.is_none(), "unexpected failure: {failure:?}");
    assert_eq!(result, Some(json!({"data": {"n": 8}})));

    let fetch = coordinator
        .recorded_on("attempt:a6")
        .into_iter()
        .find(|record| record.event == protocol::GET_DATACLIP)
        .expect("dataclip requested");
    assert_eq!(fetch.payload, json!({"id": "dc-1"}));
}

#[tokio::test]
async fn string_configuration_resolves_as_a_credential() {
    let coordinator = FakeCoordinator::new();
    coordinator.add_credential("cred-1", json!({"user": "admin", "token": "s3cret"}));
    coordinator.add_plan(
        "a7",
        json!({
            "initialState": {"data": null},
            "jobs": [{
                "expression": "merge(state, { data: state.configuration.user })",
                "configuration": "cred-1"
            }]
        }),
    );
    let engine = Engine::new(local_dispatcher(), EngineOptions::default());
    let claims = claim_loop(&engine, &coordinator, ClaimOptions::default());

    let handle = engine.listen("a7");
    claims.claim_attempt(&claimed("a7")).await.expect("claim");
    let (result, failure) = handle.wait().await.expect("attempt finished");

    assert!(failure.is_none(), "unexpected failure: {failure:?}");
    // configuration itself is scrubbed from the dataclip
    assert_eq!(result, Some(json!({"data": "admin"})));
    assert_eq!(coordinator.count_of("attempt:a7", protocol::GET_CREDENTIAL), 1);
}

#[tokio::test]
async fn capacity_ceiling_holds_two_of_three_attempts() {
    let coordinator = FakeCoordinator::new();
    for id in ["c1", "c2", "c3"] {
        coordinator.add_plan(id, json!({"id": id, "jobs": [{"expression": "slow:150"}]}));
    }
    coordinator.queue_claim_reply(vec![("c1", "t1"), ("c2", "t2"), ("c3", "t3")]);

    let compiler = SlowJobCompiler::default();
    let engine = Engine::new(
        local_dispatcher_with(Arc::new(compiler.clone()), false),
        EngineOptions {
            capacity: 2,
            attempt: AttemptOptions::default(),
        },
    );
    let claims = claim_loop(
        &engine,
        &coordinator,
        ClaimOptions {
            backoff: belay::BackoffRange {
                min: Duration::from_millis(10),
                max: Duration::from_millis(40),
            },
            no_loop: false,
            grace: Duration::from_secs(1),
        },
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let loop_handle = tokio::spawn(claims.run(shutdown_rx));

    for id in ["c1", "c2", "c3"] {
        coordinator
            .wait_for(&format!("attempt:{id}"), protocol::ATTEMPT_COMPLETE, 1)
            .await;
    }
    let _ = shutdown_tx.send(true);
    loop_handle.await.expect("join").expect("claim loop");

    assert_eq!(
        compiler.peak.load(std::sync::atomic::Ordering::SeqCst),
        2,
        "expected exactly two attempts running concurrently"
    );
    for id in ["c1", "c2", "c3"] {
        assert_eq!(
            coordinator.count_of(&format!("attempt:{id}"), protocol::ATTEMPT_START),
            1
        );
    }
}

#[tokio::test(start_paused = true)]
async fn empty_claim_replies_back_off_exponentially() {
    let coordinator = FakeCoordinator::new();
    let engine = Engine::new(local_dispatcher(), EngineOptions::default());
    let claims = claim_loop(
        &engine,
        &coordinator,
        ClaimOptions {
            backoff: belay::BackoffRange {
                min: Duration::from_millis(100),
                max: Duration::from_millis(400),
            },
            no_loop: false,
            grace: Duration::from_secs(1),
        },
    );

    let started = Instant::now();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let loop_handle = tokio::spawn(claims.run(shutdown_rx));

    coordinator
        .wait_for(protocol::QUEUE_TOPIC, protocol::CLAIM, 4)
        .await;
    // three sleeps separate four claims: 100 + 200 + 400 virtual ms
    let elapsed = started.elapsed();
    assert!(
        elapsed >= Duration::from_millis(700),
        "backed off too fast: {elapsed:?}"
    );

    let _ = shutdown_tx.send(true);
    loop_handle.await.expect("join").expect("claim loop");
}

#[tokio::test]
async fn coordinator_cancellation_tears_down_the_runner() {
    let coordinator = FakeCoordinator::new();
    coordinator.add_plan("a8", json!({"jobs": [{"expression": "slow:5000"}]}));
    let engine = Engine::new(
        local_dispatcher_with(Arc::new(SlowJobCompiler::default()), false),
        EngineOptions::default(),
    );
    let claims = claim_loop(&engine, &coordinator, ClaimOptions::default());

    let mut handle = engine.listen("a8");
    claims.claim_attempt(&claimed("a8")).await.expect("claim");

    let failure = loop {
        match handle.recv().await.expect("event stream open") {
            AttemptEvent::RunStart { .. } => engine.cancel("a8"),
            AttemptEvent::Complete { failure, .. } => break failure,
            _ => {}
        }
    };
    assert!(matches!(failure, Some(AttemptFailure::Cancelled(_))));

    let records = coordinator.recorded_on("attempt:a8");
    let attempt_complete = records
        .iter()
        .find(|record| record.event == protocol::ATTEMPT_COMPLETE)
        .expect("attempt:complete pushed");
    assert_eq!(attempt_complete.payload["reason"], json!("CANCEL"));

    let deadline = Instant::now() + Duration::from_secs(1);
    while engine.active_count() > 0 {
        assert!(Instant::now() < deadline, "registry entry never cleaned up");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
