//! Shared fixtures: an in-memory persistence gateway, scripted model
//! invokers, and a fully wired core without the web layer.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{Value, json};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use tandem::analytics::AnalyticsSink;
use tandem::broker::TaskBroker;
use tandem::cache::{Cascades, ExpiryNotice, Reaper, TokenStore};
use tandem::config::{DispatchConfig, TokenConfig, WorkerConfig};
use tandem::error::{CloseReason, GatewayError};
use tandem::gateway::PersistenceGateway;
use tandem::gateway::models::{
    ContextFlushRecord, FeedbackRecord, GenerationRow, GroundTruthRow, MetaQueryRecord,
    TelemetryRecord, UserRow,
};
use tandem::inference::redact::RegexSecretDetector;
use tandem::inference::{InferencePrompt, ModelInvoker, ModelOutput, ModelRegistry};
use tandem::orchestrator::{ConnectionCtx, Orchestrator};
use tandem::registry::{ClosedConnection, ConnectionId, ConnectionRegistry};
use tandem::session::SessionManager;
use tandem::web::protocol::{
    BehavioralTelemetry, ChatMessage, ClientFrame, CodeContext, ContextualTelemetry, ServerFrame,
};
use tandem::workers::{InferenceWorker, PersistenceWorker};

// ── In-memory gateway ───────────────────────────────────────────────

#[derive(Default)]
pub struct GatewayData {
    pub users: HashMap<Uuid, UserRow>,
    pub meta_queries: HashMap<String, MetaQueryRecord>,
    pub generations: HashMap<(String, i32), GenerationRow>,
    pub ground_truths: HashSet<(String, DateTime<Utc>)>,
    pub telemetries: HashMap<String, TelemetryRecord>,
    pub context_flushes: HashMap<(String, u64), ContextFlushRecord>,
    /// Accepted-state per (request, model), as applied by feedback.
    pub feedback: HashMap<(String, i32), bool>,
    /// Number of feedback updates that actually changed state.
    pub feedback_changes: usize,
    /// Remaining writes that will fail transiently (failure injection).
    pub transient_failures: usize,
}

/// In-memory `PersistenceGateway` honoring the same idempotency keys as
/// the Postgres implementation.
#[derive(Default)]
pub struct MemoryGateway {
    pub data: Mutex<GatewayData>,
}

impl MemoryGateway {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn seed_user(&self, user_id: Uuid) {
        self.data.lock().unwrap().users.insert(
            user_id,
            UserRow {
                id: user_id,
                email: format!("{user_id}@example.com"),
                name: "Test User".into(),
                preferences: json!({"theme": "dark"}),
                verified: true,
                joined_at: Utc::now(),
            },
        );
    }

    pub fn fail_next(&self, n: usize) {
        self.data.lock().unwrap().transient_failures = n;
    }

    fn check_injected(&self) -> Result<(), GatewayError> {
        let mut data = self.data.lock().unwrap();
        if data.transient_failures > 0 {
            data.transient_failures -= 1;
            return Err(GatewayError::Transient("injected failure".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl PersistenceGateway for MemoryGateway {
    async fn upsert_user(&self, user: &UserRow) -> Result<(), GatewayError> {
        self.data.lock().unwrap().users.insert(user.id, user.clone());
        Ok(())
    }

    async fn load_user(&self, user_id: Uuid) -> Result<Option<UserRow>, GatewayError> {
        Ok(self.data.lock().unwrap().users.get(&user_id).cloned())
    }

    async fn load_config(&self, _name: &str) -> Result<Option<Value>, GatewayError> {
        Ok(None)
    }

    async fn create_meta_query(&self, query: &MetaQueryRecord) -> Result<(), GatewayError> {
        self.check_injected()?;
        self.data
            .lock()
            .unwrap()
            .meta_queries
            .entry(query.request_id().to_owned())
            .or_insert_with(|| query.clone());
        Ok(())
    }

    async fn create_generation(&self, generation: &GenerationRow) -> Result<(), GatewayError> {
        self.check_injected()?;
        self.data
            .lock()
            .unwrap()
            .generations
            .entry((generation.request_id.clone(), generation.model_id))
            .or_insert_with(|| generation.clone());
        Ok(())
    }

    async fn append_ground_truth(&self, truth: &GroundTruthRow) -> Result<(), GatewayError> {
        self.data
            .lock()
            .unwrap()
            .ground_truths
            .insert((truth.request_id.clone(), truth.truth_timestamp));
        Ok(())
    }

    async fn upsert_telemetry(&self, telemetry: &TelemetryRecord) -> Result<(), GatewayError> {
        self.data
            .lock()
            .unwrap()
            .telemetries
            .insert(telemetry.request_id.clone(), telemetry.clone());
        Ok(())
    }

    async fn update_generation_feedback(
        &self,
        feedback: &FeedbackRecord,
    ) -> Result<(), GatewayError> {
        let mut data = self.data.lock().unwrap();
        let key = (feedback.request_id.clone(), feedback.model_id);
        if !data.generations.contains_key(&key) {
            return Err(GatewayError::Transient(format!(
                "no generation for ({}, {}) yet",
                feedback.request_id, feedback.model_id
            )));
        }
        let owner = data
            .meta_queries
            .get(&feedback.request_id)
            .map(MetaQueryRecord::user_id);
        if owner.is_some_and(|owner| owner != feedback.user_id) {
            return Err(GatewayError::Permanent("feedback ownership mismatch".into()));
        }
        // Replayed identical feedback is a no-op.
        if data.feedback.get(&key) != Some(&feedback.accepted) {
            data.feedback.insert(key, feedback.accepted);
            data.feedback_changes += 1;
        }
        Ok(())
    }

    async fn flush_project_context(&self, flush: &ContextFlushRecord) -> Result<(), GatewayError> {
        self.check_injected()?;
        self.data
            .lock()
            .unwrap()
            .context_flushes
            .entry((flush.project_id.clone(), flush.applied_through))
            .or_insert_with(|| flush.clone());
        Ok(())
    }
}

// ── Scripted model invoker ──────────────────────────────────────────

pub struct ScriptedInvoker {
    pub model_id: i32,
    pub delay: Duration,
    pub completion: String,
    pub confidence: f64,
    pub fail: bool,
}

impl ScriptedInvoker {
    pub fn new(model_id: i32, delay: Duration, completion: &str, confidence: f64) -> Self {
        Self {
            model_id,
            delay,
            completion: completion.to_owned(),
            confidence,
            fail: false,
        }
    }
}

#[async_trait]
impl ModelInvoker for ScriptedInvoker {
    fn model_id(&self) -> i32 {
        self.model_id
    }

    fn name(&self) -> &str {
        "scripted"
    }

    async fn complete(&self, _prompt: &InferencePrompt) -> anyhow::Result<ModelOutput> {
        tokio::time::sleep(self.delay).await;
        if self.fail {
            anyhow::bail!("scripted failure");
        }
        Ok(ModelOutput {
            completion: self.completion.clone(),
            confidence: self.confidence,
            logprobs: vec![-0.1, -0.2],
        })
    }

    async fn chat(
        &self,
        _messages: &[ChatMessage],
        deltas: mpsc::UnboundedSender<String>,
    ) -> anyhow::Result<ModelOutput> {
        tokio::time::sleep(self.delay).await;
        let _ = deltas.send(self.completion.clone());
        Ok(ModelOutput {
            completion: self.completion.clone(),
            confidence: self.confidence,
            logprobs: vec![],
        })
    }
}

// ── Wired core ──────────────────────────────────────────────────────

pub struct TestCore {
    pub store: Arc<TokenStore>,
    pub broker: Arc<TaskBroker>,
    pub registry: Arc<ConnectionRegistry>,
    pub gateway: Arc<MemoryGateway>,
    pub sink: Arc<AnalyticsSink>,
    pub orchestrator: Arc<Orchestrator>,
    pub cascades: Arc<Cascades>,
    pub sessions: Arc<SessionManager>,
    pub cancel: CancellationToken,
    expiry_rx: Option<mpsc::UnboundedReceiver<ExpiryNotice>>,
    closed_rx: Option<mpsc::UnboundedReceiver<ClosedConnection>>,
}

impl Drop for TestCore {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

pub fn default_dispatch() -> DispatchConfig {
    DispatchConfig {
        request_deadline: Duration::from_millis(1500),
        per_model_timeout: Duration::from_millis(2000),
        ..DispatchConfig::default()
    }
}

pub fn build_core(tokens: TokenConfig, dispatch: DispatchConfig) -> TestCore {
    let (store, expiry_rx) = TokenStore::new(tokens);
    let store = Arc::new(store);
    let broker = Arc::new(TaskBroker::new(
        Duration::from_secs(10),
        dispatch.inference_queue_high_water,
        dispatch.inference_queue_low_water,
    ));
    let (registry, closed_rx) = ConnectionRegistry::new();
    let registry = Arc::new(registry);
    let gateway = MemoryGateway::new();
    let sink = Arc::new(AnalyticsSink::new(
        Arc::clone(&broker),
        dispatch.persistence_queue_hard_cap,
    ));
    let cascades = Arc::new(Cascades::new(
        Arc::clone(&store),
        Arc::clone(&registry),
        Arc::clone(&broker),
        true,
    ));
    let gateway_dyn: Arc<dyn PersistenceGateway> = gateway.clone();
    let sessions = Arc::new(SessionManager::new(
        Arc::clone(&store),
        gateway_dyn,
        Arc::clone(&cascades),
    ));
    let orchestrator = Arc::new(Orchestrator::new(
        Arc::clone(&store),
        Arc::clone(&registry),
        Arc::clone(&broker),
        Arc::clone(&sink),
        Arc::new(RegexSecretDetector::new()),
        dispatch,
    ));

    TestCore {
        store,
        broker,
        registry,
        gateway,
        sink,
        orchestrator,
        cascades,
        sessions,
        cancel: CancellationToken::new(),
        expiry_rx: Some(expiry_rx),
        closed_rx: Some(closed_rx),
    }
}

impl TestCore {
    /// Spawn the closed-connection listener (orphan sealing).
    pub fn spawn_closed_listener(&mut self) {
        let closed_rx = self.closed_rx.take().expect("closed listener already spawned");
        tokio::spawn(
            Arc::clone(&self.orchestrator).run_closed_listener(closed_rx, self.cancel.clone()),
        );
    }

    /// Spawn the reaper plus the cache expiry sweeper.
    pub fn spawn_reaper(&mut self) {
        let expiry_rx = self.expiry_rx.take().expect("reaper already spawned");
        let reaper = Reaper::new(Arc::clone(&self.cascades), expiry_rx);
        tokio::spawn(reaper.run(self.cancel.clone()));
        let store = Arc::clone(&self.store);
        let cancel = self.cancel.clone();
        tokio::spawn(async move { store.run_expiry_sweeper(cancel).await });
    }

    pub fn spawn_inference_workers(&self, models: ModelRegistry, count: usize) {
        let models = Arc::new(models);
        let worker_cfg = WorkerConfig::default();
        for id in 0..count {
            let worker = InferenceWorker::new(
                id,
                Arc::clone(&self.store),
                Arc::clone(&self.broker),
                Arc::clone(&models),
                Arc::new(RegexSecretDetector::new()),
                Duration::from_millis(2000),
                worker_cfg.model_concurrency,
            );
            let cancel = self.cancel.clone();
            tokio::spawn(async move { worker.run(cancel).await });
        }
    }

    pub fn spawn_persistence_worker(&self) {
        let gateway: Arc<dyn PersistenceGateway> = self.gateway.clone();
        let worker = PersistenceWorker::new(0, Arc::clone(&self.broker), gateway, 5, 16);
        let cancel = self.cancel.clone();
        tokio::spawn(async move { worker.run(cancel).await });
        let broker = Arc::clone(&self.broker);
        let cancel = self.cancel.clone();
        tokio::spawn(async move { broker.run_redelivery_sweeper(cancel).await });
    }

    /// Create a full token chain for a fresh user.
    pub fn login(&self, project_id: &str) -> Chain {
        let user_id = Uuid::new_v4();
        self.gateway.seed_user(user_id);
        let auth_token = self.store.issue_auth(user_id);
        let session_token = self
            .store
            .issue_session(&auth_token, json!({}))
            .expect("auth token live");
        let project_token = self
            .store
            .attach_project(&session_token, project_id)
            .expect("session token live");
        Chain {
            user_id,
            auth_token,
            session_token,
            project_token,
        }
    }

    /// Register a connection and attach it to the orchestrator.
    pub fn connect(&self, chain: &Chain) -> TestConn {
        let (id, frames, close_reason) = self
            .registry
            .register(&chain.session_token, &chain.project_token);
        let ctx = ConnectionCtx {
            id,
            user_id: chain.user_id,
            auth_token: chain.auth_token.clone(),
            session_token: chain.session_token.clone(),
            project_token: chain.project_token.clone(),
        };
        self.orchestrator.attach_connection(&ctx);
        TestConn {
            ctx,
            frames,
            close_reason,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Chain {
    pub user_id: Uuid,
    pub auth_token: String,
    pub session_token: String,
    pub project_token: String,
}

pub struct TestConn {
    pub ctx: ConnectionCtx,
    pub frames: mpsc::Receiver<ServerFrame>,
    pub close_reason: Arc<std::sync::OnceLock<CloseReason>>,
}

impl TestConn {
    pub fn id(&self) -> ConnectionId {
        self.ctx.id
    }

    pub async fn recv(&mut self) -> ServerFrame {
        tokio::time::timeout(Duration::from_secs(30), self.frames.recv())
            .await
            .expect("timed out waiting for frame")
            .expect("connection sink closed")
    }
}

// ── Frame builders ──────────────────────────────────────────────────

pub fn completion_request(request_id: &str, model_ids: Vec<i32>, prefix: &str) -> ClientFrame {
    ClientFrame::CompletionRequest {
        request_id: request_id.to_owned(),
        model_ids,
        context: CodeContext {
            prefix: prefix.to_owned(),
            suffix: String::new(),
            file_name: Some("main.py".into()),
            selected_text: None,
        },
        contextual_telemetry: ContextualTelemetry {
            version_id: 1,
            trigger_type_id: 2,
            language_id: 7,
            file_path: Some("main.py".into()),
            caret_line: Some(10),
            document_char_length: Some(420),
            relative_document_position: Some(0.5),
        },
        behavioral_telemetry: BehavioralTelemetry {
            time_since_last_shown: Some(1200),
            time_since_last_accepted: Some(9000),
            typing_speed: Some(41.5),
        },
        change_indices: None,
    }
}

/// Wait until a condition holds or the timeout lapses.
pub async fn wait_for(mut condition: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(30);
    while !condition() {
        if tokio::time::Instant::now() > deadline {
            panic!("condition not reached in time");
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}
