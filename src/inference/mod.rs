//! Opaque inference callables and the model registry.
//!
//! The core never sees tokenization or model internals; it hands a prompt to
//! an invoker and gets back a completion with confidence and log-probs.

pub mod dummy;
pub mod redact;

use async_trait::async_trait;
use indexmap::IndexMap;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::info;

use crate::web::protocol::ChatMessage;

/// What a model produces for one invocation.
#[derive(Debug, Clone)]
pub struct ModelOutput {
    pub completion: String,
    /// Confidence in [0, 1].
    pub confidence: f64,
    pub logprobs: Vec<f64>,
}

/// Prompt handed to a completion invocation, already redacted.
#[derive(Debug, Clone)]
pub struct InferencePrompt {
    pub prefix: String,
    pub suffix: String,
    pub file_name: Option<String>,
    /// Multi-file context snapshot the model may condition on.
    pub context_files: IndexMap<String, String>,
}

/// An opaque inference callable for a single model.
#[async_trait]
pub trait ModelInvoker: Send + Sync {
    fn model_id(&self) -> i32;

    fn name(&self) -> &str;

    /// Warm start (weight loading etc.). Called at worker boot when
    /// `preload_models` is set.
    async fn preload(&self) -> anyhow::Result<()> {
        Ok(())
    }

    async fn complete(&self, prompt: &InferencePrompt) -> anyhow::Result<ModelOutput>;

    /// Chat invocation. Incremental output goes through `deltas` as it is
    /// produced; the aggregate comes back as the return value.
    async fn chat(
        &self,
        messages: &[ChatMessage],
        deltas: mpsc::UnboundedSender<String>,
    ) -> anyhow::Result<ModelOutput>;
}

/// Registry of invokers keyed by model id.
#[derive(Default)]
pub struct ModelRegistry {
    models: HashMap<i32, Arc<dyn ModelInvoker>>,
}

impl ModelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, invoker: Arc<dyn ModelInvoker>) {
        self.models.insert(invoker.model_id(), invoker);
    }

    pub fn get(&self, model_id: i32) -> Option<Arc<dyn ModelInvoker>> {
        self.models.get(&model_id).cloned()
    }

    pub fn ids(&self) -> Vec<i32> {
        let mut ids: Vec<i32> = self.models.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Warm every registered invoker; failures are fatal to boot.
    pub async fn preload_all(&self) -> anyhow::Result<()> {
        for invoker in self.models.values() {
            invoker.preload().await?;
            info!(model_id = invoker.model_id(), model = invoker.name(), "model preloaded");
        }
        Ok(())
    }
}
