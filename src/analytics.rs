//! Fire-and-forget envelope producer over the `persist` queue.
//!
//! All cold-path writes from the orchestrator go through here. Query,
//! feedback, and context-flush envelopes always enqueue; standalone
//! telemetry envelopes are sampled away once the persist queue grows past
//! its hard cap, so the analytics path can never block or bloat the hot
//! path.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::warn;

use crate::broker::{QueueName, TaskBroker, kind};
use crate::gateway::models::{FeedbackRecord, QueryTaskRecord, TelemetryRecord};

pub struct AnalyticsSink {
    broker: Arc<TaskBroker>,
    hard_cap: usize,
    sampled_out: AtomicU64,
}

impl AnalyticsSink {
    pub fn new(broker: Arc<TaskBroker>, hard_cap: usize) -> Self {
        Self {
            broker,
            hard_cap,
            sampled_out: AtomicU64::new(0),
        }
    }

    fn enqueue(&self, task_kind: &str, payload: &impl serde::Serialize) {
        match serde_json::to_value(payload) {
            Ok(value) => {
                self.broker.enqueue(QueueName::Persist, task_kind, value, None);
            }
            Err(e) => warn!(kind = task_kind, error = %e, "failed to encode persist payload"),
        }
    }

    /// Persist a sealed request: query row, then generations, then
    /// telemetry, in that order within the task.
    pub fn emit_query(&self, record: &QueryTaskRecord) {
        self.enqueue(kind::QUERY, record);
    }

    pub fn emit_feedback(&self, record: &FeedbackRecord) {
        self.enqueue(kind::FEEDBACK_UPDATE, record);
    }

    /// Standalone telemetry envelope; dropped (with a counter) when the
    /// persist queue is past its hard cap.
    pub fn emit_telemetry(&self, record: &TelemetryRecord) {
        if self.broker.depth(QueueName::Persist) >= self.hard_cap {
            let dropped = self.sampled_out.fetch_add(1, Ordering::Relaxed) + 1;
            if dropped.is_power_of_two() {
                warn!(dropped, "persist queue past hard cap, sampling telemetry");
            }
            return;
        }
        self.enqueue(kind::TELEMETRY, record);
    }

    /// Telemetry envelopes dropped by sampling since startup.
    pub fn sampled_out(&self) -> u64 {
        self.sampled_out.load(Ordering::Relaxed)
    }
}
