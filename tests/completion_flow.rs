#[allow(dead_code)]
mod helpers;

use std::sync::Arc;
use std::time::Duration;

use helpers::{ScriptedInvoker, build_core, completion_request, default_dispatch, wait_for};
use tandem::config::TokenConfig;
use tandem::gateway::models::MetaQueryRecord;
use tandem::inference::ModelRegistry;
use tandem::web::protocol::{ChatMessage, ClientFrame, ServerFrame};

// ── Single-model completion ─────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn single_model_completion_round_trip() {
    let mut core = build_core(TokenConfig::default(), default_dispatch());
    core.spawn_closed_listener();
    core.spawn_persistence_worker();

    let mut models = ModelRegistry::new();
    models.register(Arc::new(ScriptedInvoker::new(
        1,
        Duration::from_millis(300),
        "return a + b",
        0.92,
    )));
    core.spawn_inference_workers(models, 1);

    let chain = core.login("proj-1");
    let mut conn = core.connect(&chain);

    core.orchestrator
        .handle_frame(
            &conn.ctx,
            completion_request("r-1", vec![1], "def add(a, b):\n  "),
        )
        .await;

    let ServerFrame::CompletionPartial { request_id, reply } = conn.recv().await else {
        panic!("expected completion.partial first");
    };
    assert_eq!(request_id, "r-1");
    assert_eq!(reply.model_id, 1);
    assert_eq!(reply.completion.as_deref(), Some("return a + b"));
    assert_eq!(reply.confidence, Some(0.92));

    let ServerFrame::CompletionFinal {
        request_id,
        received,
        timed_out,
        timeout,
    } = conn.recv().await
    else {
        panic!("expected completion.final after all models reported");
    };
    assert_eq!(request_id, "r-1");
    assert_eq!(received, vec![1]);
    assert!(timed_out.is_empty());
    assert!(!timeout);

    // Exactly one generation row keyed (request, model), one meta-query
    // row, one telemetry row.
    wait_for(|| {
        let data = core.gateway.data.lock().unwrap();
        data.generations.contains_key(&("r-1".to_owned(), 1))
    })
    .await;
    let data = core.gateway.data.lock().unwrap();
    assert_eq!(data.generations.len(), 1);
    assert_eq!(data.meta_queries.len(), 1);
    assert!(matches!(
        data.meta_queries.get("r-1"),
        Some(MetaQueryRecord::Completion(q)) if !q.deadline_fired && !q.orphaned
    ));
    assert!(data.telemetries.contains_key("r-1"));
}

// ── Two-model race with one timeout ─────────────────────────────────

#[tokio::test(start_paused = true)]
async fn deadline_seals_partial_result_set() {
    let mut core = build_core(TokenConfig::default(), default_dispatch());
    core.spawn_closed_listener();
    core.spawn_persistence_worker();

    let mut models = ModelRegistry::new();
    models.register(Arc::new(ScriptedInvoker::new(
        1,
        Duration::from_millis(300),
        "fast",
        0.8,
    )));
    // Model 2 is still running when the 1500 ms request deadline fires.
    models.register(Arc::new(ScriptedInvoker::new(
        2,
        Duration::from_millis(5000),
        "slow",
        0.8,
    )));
    core.spawn_inference_workers(models, 1);

    let chain = core.login("proj-2");
    let mut conn = core.connect(&chain);

    core.orchestrator
        .handle_frame(&conn.ctx, completion_request("r-2", vec![1, 2], "x = "))
        .await;

    let ServerFrame::CompletionPartial { reply, .. } = conn.recv().await else {
        panic!("expected the fast model's partial first");
    };
    assert_eq!(reply.model_id, 1);

    let ServerFrame::CompletionFinal {
        received,
        timed_out,
        timeout,
        ..
    } = conn.recv().await
    else {
        panic!("expected completion.final at the deadline");
    };
    assert_eq!(received, vec![1]);
    assert_eq!(timed_out, vec![2]);
    assert!(timeout);

    // Persisted generations contain only the model that returned.
    wait_for(|| {
        let data = core.gateway.data.lock().unwrap();
        data.meta_queries.contains_key("r-2")
    })
    .await;
    let data = core.gateway.data.lock().unwrap();
    assert!(data.generations.contains_key(&("r-2".to_owned(), 1)));
    assert!(!data.generations.contains_key(&("r-2".to_owned(), 2)));
    assert!(matches!(
        data.meta_queries.get("r-2"),
        Some(MetaQueryRecord::Completion(q)) if q.deadline_fired
    ));
}

// ── Duplicate model ids ─────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn duplicate_model_ids_are_treated_once() {
    let mut core = build_core(TokenConfig::default(), default_dispatch());
    core.spawn_closed_listener();
    core.spawn_persistence_worker();

    let mut models = ModelRegistry::new();
    models.register(Arc::new(ScriptedInvoker::new(
        1,
        Duration::from_millis(100),
        "once",
        0.7,
    )));
    core.spawn_inference_workers(models, 1);

    let chain = core.login("proj-3");
    let mut conn = core.connect(&chain);

    core.orchestrator
        .handle_frame(&conn.ctx, completion_request("r-3", vec![1, 1, 1], "y = "))
        .await;

    assert!(matches!(
        conn.recv().await,
        ServerFrame::CompletionPartial { .. }
    ));
    let ServerFrame::CompletionFinal { received, .. } = conn.recv().await else {
        panic!("expected completion.final");
    };
    assert_eq!(received, vec![1]);
}

// ── Chat streaming ──────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn chat_request_streams_partials_then_final() {
    let mut core = build_core(TokenConfig::default(), default_dispatch());
    core.spawn_closed_listener();
    core.spawn_persistence_worker();

    let mut models = ModelRegistry::new();
    models.register(Arc::new(ScriptedInvoker::new(
        1,
        Duration::from_millis(100),
        "hello there",
        0.9,
    )));
    core.spawn_inference_workers(models, 1);

    let chain = core.login("proj-4");
    let mut conn = core.connect(&chain);

    core.orchestrator
        .handle_frame(
            &conn.ctx,
            ClientFrame::ChatRequest {
                request_id: "r-chat".into(),
                chat_id: "chat-9".into(),
                model_id: 1,
                messages: vec![ChatMessage {
                    role: "user".into(),
                    content: "hi".into(),
                }],
            },
        )
        .await;

    let ServerFrame::ChatPartial {
        chat_id, delta, ..
    } = conn.recv().await
    else {
        panic!("expected chat.partial before the final frame");
    };
    assert_eq!(chat_id, "chat-9");
    assert_eq!(delta, "hello there");

    let ServerFrame::ChatFinal {
        request_id,
        chat_id,
        model_id,
        timeout,
    } = conn.recv().await
    else {
        panic!("expected chat.final");
    };
    assert_eq!(request_id, "r-chat");
    assert_eq!(chat_id, "chat-9");
    assert_eq!(model_id, 1);
    assert!(!timeout);

    wait_for(|| {
        let data = core.gateway.data.lock().unwrap();
        data.meta_queries.contains_key("r-chat")
    })
    .await;
    let data = core.gateway.data.lock().unwrap();
    assert!(matches!(
        data.meta_queries.get("r-chat"),
        Some(MetaQueryRecord::Chat(q)) if q.chat_id == "chat-9"
    ));
}

// ── Secrets never reach the model or the store ──────────────────────

#[tokio::test(start_paused = true)]
async fn secrets_are_redacted_before_persistence() {
    let mut core = build_core(TokenConfig::default(), default_dispatch());
    core.spawn_closed_listener();
    core.spawn_persistence_worker();

    let mut models = ModelRegistry::new();
    models.register(Arc::new(ScriptedInvoker::new(
        1,
        Duration::from_millis(50),
        "ok",
        0.5,
    )));
    core.spawn_inference_workers(models, 1);

    let chain = core.login("proj-5");
    let mut conn = core.connect(&chain);

    core.orchestrator
        .handle_frame(
            &conn.ctx,
            completion_request(
                "r-secret",
                vec![1],
                r#"api_key = "sk_live_abcdef12345678""#,
            ),
        )
        .await;
    conn.recv().await;
    conn.recv().await;

    wait_for(|| {
        let data = core.gateway.data.lock().unwrap();
        data.meta_queries.contains_key("r-secret")
    })
    .await;
    let data = core.gateway.data.lock().unwrap();
    let Some(MetaQueryRecord::Completion(query)) = data.meta_queries.get("r-secret") else {
        panic!("expected completion query");
    };
    assert!(!query.context.prefix.contains("sk_live"));
    assert!(query.context.prefix.contains("[REDACTED]"));
}
