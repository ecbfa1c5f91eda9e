#[allow(dead_code)]
mod helpers;

use std::sync::Arc;
use std::time::Duration;

use helpers::{ScriptedInvoker, build_core, completion_request, default_dispatch, wait_for};
use tandem::broker::{QueueName, ReplyEnvelope};
use tandem::config::{DispatchConfig, TokenConfig};
use tandem::inference::ModelRegistry;
use tandem::web::protocol::{ModelReply, ServerFrame};

fn long_deadline() -> DispatchConfig {
    DispatchConfig {
        request_deadline: Duration::from_secs(60),
        ..default_dispatch()
    }
}

// A worker dies holding a claimed task; the visibility timeout redelivers
// it and the second attempt produces exactly one generation row.
#[tokio::test(start_paused = true)]
async fn redelivery_does_not_duplicate_generations() {
    let mut core = build_core(TokenConfig::default(), long_deadline());
    core.spawn_closed_listener();
    core.spawn_persistence_worker();

    let chain = core.login("proj-q");
    let mut conn = core.connect(&chain);

    core.orchestrator
        .handle_frame(&conn.ctx, completion_request("r-redeliver", vec![1], "z = "))
        .await;

    // Simulate a worker crash: claim without ever acknowledging.
    let claimed = core.broker.claim(QueueName::Inference).await;
    assert_eq!(claimed.attempt, 1);

    // Past the visibility timeout the sweeper hands the task out again.
    tokio::time::advance(Duration::from_secs(11)).await;
    core.broker.sweep_once();

    let mut models = ModelRegistry::new();
    models.register(Arc::new(ScriptedInvoker::new(
        1,
        Duration::from_millis(100),
        "redelivered",
        0.9,
    )));
    core.spawn_inference_workers(models, 1);

    assert!(matches!(
        conn.recv().await,
        ServerFrame::CompletionPartial { .. }
    ));
    assert!(matches!(
        conn.recv().await,
        ServerFrame::CompletionFinal { .. }
    ));

    // A duplicate publish for the now-sealed request is dropped.
    core.broker.publish_reply(
        &conn.id().reply_channel(),
        ReplyEnvelope::Model {
            request_id: "r-redeliver".into(),
            reply: ModelReply {
                model_id: 1,
                completion: Some("duplicate".into()),
                confidence: Some(0.9),
                logprobs: vec![],
                generation_time_ms: Some(5),
                error: None,
            },
        },
    );

    wait_for(|| {
        core.gateway
            .data
            .lock()
            .unwrap()
            .generations
            .contains_key(&("r-redeliver".to_owned(), 1))
    })
    .await;
    let data = core.gateway.data.lock().unwrap();
    assert_eq!(data.generations.len(), 1);
    assert_eq!(
        data.generations
            .get(&("r-redeliver".to_owned(), 1))
            .unwrap()
            .completion,
        "redelivered"
    );
}

// A reply addressed to `conn:<id>` reaches that connection and no other.
#[tokio::test(start_paused = true)]
async fn replies_have_connection_affinity() {
    let mut core = build_core(TokenConfig::default(), long_deadline());
    core.spawn_closed_listener();

    let chain_a = core.login("proj-aff-a");
    let chain_b = core.login("proj-aff-b");
    let mut conn_a = core.connect(&chain_a);
    let mut conn_b = core.connect(&chain_b);

    // Pending request on A only; two models so the first reply does not
    // seal it.
    core.orchestrator
        .handle_frame(&conn_a.ctx, completion_request("r-aff", vec![1, 2], "a"))
        .await;

    core.broker.publish_reply(
        &conn_a.id().reply_channel(),
        ReplyEnvelope::Model {
            request_id: "r-aff".into(),
            reply: ModelReply {
                model_id: 1,
                completion: Some("for a only".into()),
                confidence: Some(0.5),
                logprobs: vec![],
                generation_time_ms: Some(1),
                error: None,
            },
        },
    );

    let ServerFrame::CompletionPartial { request_id, .. } = conn_a.recv().await else {
        panic!("expected partial on connection A");
    };
    assert_eq!(request_id, "r-aff");
    assert!(conn_b.frames.try_recv().is_err(), "B must receive nothing");
}

// Transient gateway failures back off and retry; the write eventually
// lands exactly once.
#[tokio::test(start_paused = true)]
async fn transient_persistence_failures_retry_with_backoff() {
    let mut core = build_core(TokenConfig::default(), default_dispatch());
    core.spawn_closed_listener();
    core.spawn_persistence_worker();

    let mut models = ModelRegistry::new();
    models.register(Arc::new(ScriptedInvoker::new(
        1,
        Duration::from_millis(50),
        "retry me",
        0.9,
    )));
    core.spawn_inference_workers(models, 1);

    core.gateway.fail_next(2);

    let chain = core.login("proj-retry");
    let mut conn = core.connect(&chain);
    core.orchestrator
        .handle_frame(&conn.ctx, completion_request("r-retry", vec![1], "b"))
        .await;
    conn.recv().await;
    conn.recv().await;

    wait_for(|| {
        core.gateway
            .data
            .lock()
            .unwrap()
            .generations
            .contains_key(&("r-retry".to_owned(), 1))
    })
    .await;
    let data = core.gateway.data.lock().unwrap();
    assert_eq!(data.generations.len(), 1);
    assert_eq!(core.broker.dead_letter_count(), 0);
}
