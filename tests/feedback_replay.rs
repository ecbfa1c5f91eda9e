#[allow(dead_code)]
mod helpers;

use std::sync::Arc;
use std::time::Duration;

use helpers::{ScriptedInvoker, build_core, completion_request, default_dispatch, wait_for};
use tandem::config::TokenConfig;
use tandem::inference::ModelRegistry;
use tandem::web::protocol::{ClientFrame, ServerFrame};

fn feedback(request_id: &str, accepted: bool) -> ClientFrame {
    ClientFrame::CompletionFeedback {
        request_id: request_id.to_owned(),
        model_id: 1,
        accepted,
        shown_at: vec![chrono::Utc::now()],
        ground_truth: Some("return a + b".into()),
    }
}

// S6: identical feedback submitted twice results in exactly one state
// change; the replay is a no-op.
#[tokio::test(start_paused = true)]
async fn feedback_replay_is_idempotent() {
    let mut core = build_core(TokenConfig::default(), default_dispatch());
    core.spawn_closed_listener();
    core.spawn_persistence_worker();

    let mut models = ModelRegistry::new();
    models.register(Arc::new(ScriptedInvoker::new(
        1,
        Duration::from_millis(50),
        "return a + b",
        0.92,
    )));
    core.spawn_inference_workers(models, 1);

    let chain = core.login("proj-fb");
    let mut conn = core.connect(&chain);

    core.orchestrator
        .handle_frame(&conn.ctx, completion_request("r-fb", vec![1], "def add():"))
        .await;
    conn.recv().await;
    conn.recv().await;
    wait_for(|| {
        core.gateway
            .data
            .lock()
            .unwrap()
            .generations
            .contains_key(&("r-fb".to_owned(), 1))
    })
    .await;

    core.orchestrator
        .handle_frame(&conn.ctx, feedback("r-fb", true))
        .await;
    core.orchestrator
        .handle_frame(&conn.ctx, feedback("r-fb", true))
        .await;

    wait_for(|| core.gateway.data.lock().unwrap().feedback_changes >= 1).await;
    // Give the second task time to drain before asserting it changed nothing.
    tokio::time::sleep(Duration::from_secs(2)).await;
    let data = core.gateway.data.lock().unwrap();
    assert_eq!(data.feedback_changes, 1);
    assert_eq!(data.feedback.get(&("r-fb".to_owned(), 1)), Some(&true));
}

// Feedback is accepted even when the originating connection is gone, as
// long as the user matches.
#[tokio::test(start_paused = true)]
async fn feedback_accepted_after_connection_death() {
    let mut core = build_core(TokenConfig::default(), default_dispatch());
    core.spawn_closed_listener();
    core.spawn_persistence_worker();

    let mut models = ModelRegistry::new();
    models.register(Arc::new(ScriptedInvoker::new(
        1,
        Duration::from_millis(50),
        "done",
        0.9,
    )));
    core.spawn_inference_workers(models, 1);

    let chain = core.login("proj-fb2");
    let mut conn = core.connect(&chain);
    core.orchestrator
        .handle_frame(&conn.ctx, completion_request("r-fb2", vec![1], "q = "))
        .await;
    conn.recv().await;
    conn.recv().await;
    wait_for(|| {
        core.gateway
            .data
            .lock()
            .unwrap()
            .generations
            .contains_key(&("r-fb2".to_owned(), 1))
    })
    .await;

    // Original connection goes away; the same user reconnects.
    core.registry
        .close(conn.id(), tandem::error::CloseReason::Internal);
    let mut conn2 = core.connect(&chain);

    core.orchestrator
        .handle_frame(&conn2.ctx, feedback("r-fb2", true))
        .await;
    wait_for(|| core.gateway.data.lock().unwrap().feedback_changes == 1).await;
    assert!(conn2.frames.try_recv().is_err(), "feedback sends no reply");
}

// Feedback against another user's live request is refused.
#[tokio::test(start_paused = true)]
async fn feedback_ownership_is_enforced() {
    let mut core = build_core(TokenConfig::default(), default_dispatch());
    core.spawn_closed_listener();

    let chain_a = core.login("proj-own-a");
    let chain_b = core.login("proj-own-b");
    let conn_a = core.connect(&chain_a);
    let mut conn_b = core.connect(&chain_b);

    // Pending request owned by A (no workers, so it stays live).
    core.orchestrator
        .handle_frame(&conn_a.ctx, completion_request("r-own", vec![1], "w"))
        .await;

    core.orchestrator
        .handle_frame(&conn_b.ctx, feedback("r-own", true))
        .await;
    let ServerFrame::Error { code, .. } = conn_b.recv().await else {
        panic!("expected forbidden error");
    };
    assert_eq!(code, tandem::web::protocol::ErrorKind::Forbidden);
}
