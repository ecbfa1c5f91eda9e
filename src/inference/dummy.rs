//! Deterministic local invoker for development and demos.

use async_trait::async_trait;
use std::time::Duration;
use tokio::sync::mpsc;

use crate::inference::{InferencePrompt, ModelInvoker, ModelOutput};
use crate::web::protocol::ChatMessage;

/// Echo-style invoker producing a stable completion for any prompt.
pub struct DummyInvoker {
    model_id: i32,
    name: String,
    latency: Duration,
}

impl DummyInvoker {
    pub fn new(model_id: i32, latency: Duration) -> Self {
        Self {
            model_id,
            name: format!("dummy-{model_id}"),
            latency,
        }
    }
}

#[async_trait]
impl ModelInvoker for DummyInvoker {
    fn model_id(&self) -> i32 {
        self.model_id
    }

    fn name(&self) -> &str {
        &self.name
    }

    async fn complete(&self, prompt: &InferencePrompt) -> anyhow::Result<ModelOutput> {
        tokio::time::sleep(self.latency).await;
        let last_line = prompt.prefix.lines().last().unwrap_or("").trim();
        Ok(ModelOutput {
            completion: format!("pass  # {last_line}"),
            confidence: 0.5,
            logprobs: vec![-0.7, -0.7],
        })
    }

    async fn chat(
        &self,
        messages: &[ChatMessage],
        deltas: mpsc::UnboundedSender<String>,
    ) -> anyhow::Result<ModelOutput> {
        let prompt = messages.last().map(|m| m.content.as_str()).unwrap_or("");
        let reply = format!("You said: {prompt}");
        for word in reply.split_inclusive(' ') {
            tokio::time::sleep(self.latency / 4).await;
            let _ = deltas.send(word.to_owned());
        }
        Ok(ModelOutput {
            completion: reply,
            confidence: 0.5,
            logprobs: Vec::new(),
        })
    }
}
