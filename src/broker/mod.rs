//! Two-queue task broker with reply channels.
//!
//! FIFO queues `inference` and `persist`, at-least-once delivery: a claimed
//! task carries a visibility deadline and is redelivered if the consumer
//! dies without acknowledging it. Reply channels are addressable strings of
//! the form `conn:<connection-id>`; each process subscribes only to channels
//! for connections it owns, so a reply for an unknown channel is dropped.

mod task;

pub use task::{QueueName, ReplyEnvelope, TaskEnvelope, kind};

use dashmap::DashMap;
use serde_json::Value;
use std::cmp::Reverse;
use std::collections::{BinaryHeap, VecDeque};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tokio::sync::{Notify, mpsc};
use tokio::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::error::BrokerError;

struct InFlight {
    envelope: TaskEnvelope,
    redeliver_at: Instant,
}

struct Delayed {
    due: Instant,
    envelope: TaskEnvelope,
}

impl PartialEq for Delayed {
    fn eq(&self, other: &Self) -> bool {
        self.due == other.due && self.envelope.id == other.envelope.id
    }
}
impl Eq for Delayed {}
impl Ord for Delayed {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        (self.due, self.envelope.id).cmp(&(other.due, other.envelope.id))
    }
}
impl PartialOrd for Delayed {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

struct Queue {
    name: &'static str,
    ready: Mutex<VecDeque<TaskEnvelope>>,
    delayed: Mutex<BinaryHeap<Reverse<Delayed>>>,
    in_flight: DashMap<u64, InFlight>,
    notify: Notify,
}

impl Queue {
    fn new(name: &'static str) -> Self {
        Self {
            name,
            ready: Mutex::new(VecDeque::new()),
            delayed: Mutex::new(BinaryHeap::new()),
            in_flight: DashMap::new(),
            notify: Notify::new(),
        }
    }

    fn depth(&self) -> usize {
        self.ready.lock().expect("lock poisoned").len()
            + self.delayed.lock().expect("lock poisoned").len()
            + self.in_flight.len()
    }

    fn push(&self, envelope: TaskEnvelope) {
        self.ready.lock().expect("lock poisoned").push_back(envelope);
        self.notify.notify_one();
    }
}

/// In-process broker for the `inference` and `persist` queues.
pub struct TaskBroker {
    inference: Queue,
    persist: Queue,
    replies: DashMap<String, mpsc::UnboundedSender<ReplyEnvelope>>,
    next_id: AtomicU64,
    visibility_timeout: Duration,
    /// Hysteresis gate for the inference queue.
    admitting: AtomicBool,
    high_water: usize,
    low_water: usize,
    dead_letters: Mutex<Vec<TaskEnvelope>>,
}

impl TaskBroker {
    pub fn new(visibility_timeout: Duration, high_water: usize, low_water: usize) -> Self {
        Self {
            inference: Queue::new(QueueName::Inference.as_str()),
            persist: Queue::new(QueueName::Persist.as_str()),
            replies: DashMap::new(),
            next_id: AtomicU64::new(1),
            visibility_timeout,
            admitting: AtomicBool::new(true),
            high_water,
            low_water,
            dead_letters: Mutex::new(Vec::new()),
        }
    }

    fn queue(&self, name: QueueName) -> &Queue {
        match name {
            QueueName::Inference => &self.inference,
            QueueName::Persist => &self.persist,
        }
    }

    fn make_envelope(
        &self,
        kind: &str,
        payload: Value,
        reply_channel: Option<String>,
    ) -> TaskEnvelope {
        TaskEnvelope {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            kind: kind.to_owned(),
            payload,
            reply_channel,
            attempt: 1,
            enqueued_at: Instant::now(),
        }
    }

    /// Enqueue on the named queue without admission control.
    pub fn enqueue(
        &self,
        queue: QueueName,
        kind: &str,
        payload: Value,
        reply_channel: Option<String>,
    ) -> u64 {
        let envelope = self.make_envelope(kind, payload, reply_channel);
        let id = envelope.id;
        trace!(queue = queue.as_str(), kind, task_id = id, "task enqueued");
        self.queue(queue).push(envelope);
        id
    }

    /// Enqueue on the inference queue, subject to the high/low-water gate.
    pub fn try_enqueue_inference(
        &self,
        kind: &str,
        payload: Value,
        reply_channel: Option<String>,
    ) -> Result<u64, BrokerError> {
        let depth = self.inference.depth();
        if self.admitting.load(Ordering::Acquire) {
            if depth >= self.high_water {
                self.admitting.store(false, Ordering::Release);
                warn!(depth, "inference queue hit high-water mark");
                return Err(BrokerError::Saturated(self.inference.name));
            }
        } else if depth <= self.low_water {
            self.admitting.store(true, Ordering::Release);
            debug!(depth, "inference queue drained below low-water mark");
        } else {
            return Err(BrokerError::Saturated(self.inference.name));
        }
        Ok(self.enqueue(QueueName::Inference, kind, payload, reply_channel))
    }

    /// Claim the next ready task, waiting until one is available.
    ///
    /// Exactly one consumer receives each task; the claim is held under a
    /// visibility deadline until `ack`, `retry`, or `dead_letter`.
    pub async fn claim(&self, name: QueueName) -> TaskEnvelope {
        let queue = self.queue(name);
        loop {
            let envelope = queue.ready.lock().expect("lock poisoned").pop_front();
            if let Some(envelope) = envelope {
                queue.in_flight.insert(
                    envelope.id,
                    InFlight {
                        envelope: envelope.clone(),
                        redeliver_at: Instant::now() + self.visibility_timeout,
                    },
                );
                return envelope;
            }
            queue.notify.notified().await;
        }
    }

    /// Non-blocking claim, used to batch already-ready work.
    pub fn try_claim(&self, name: QueueName) -> Option<TaskEnvelope> {
        let queue = self.queue(name);
        let envelope = queue.ready.lock().expect("lock poisoned").pop_front()?;
        queue.in_flight.insert(
            envelope.id,
            InFlight {
                envelope: envelope.clone(),
                redeliver_at: Instant::now() + self.visibility_timeout,
            },
        );
        Some(envelope)
    }

    /// Acknowledge a claimed task as done, removing it from the queue.
    pub fn ack(&self, name: QueueName, task_id: u64) -> Result<(), BrokerError> {
        self.queue(name)
            .in_flight
            .remove(&task_id)
            .map(|_| ())
            .ok_or(BrokerError::UnknownTask(task_id))
    }

    /// Return a claimed task to the queue after a delay, bumping its attempt.
    pub fn retry(&self, name: QueueName, task_id: u64, delay: Duration) -> Result<(), BrokerError> {
        let queue = self.queue(name);
        let (_, in_flight) = queue
            .in_flight
            .remove(&task_id)
            .ok_or(BrokerError::UnknownTask(task_id))?;
        let mut envelope = in_flight.envelope;
        envelope.attempt += 1;
        if delay.is_zero() {
            queue.push(envelope);
        } else {
            queue.delayed.lock().expect("lock poisoned").push(Reverse(Delayed {
                due: Instant::now() + delay,
                envelope,
            }));
        }
        Ok(())
    }

    /// Park a claimed task in the dead-letter store, payload preserved.
    pub fn dead_letter(&self, name: QueueName, task_id: u64) -> Result<(), BrokerError> {
        let queue = self.queue(name);
        let (_, in_flight) = queue
            .in_flight
            .remove(&task_id)
            .ok_or(BrokerError::UnknownTask(task_id))?;
        warn!(
            queue = queue.name,
            task_id,
            kind = %in_flight.envelope.kind,
            attempt = in_flight.envelope.attempt,
            "task dead-lettered"
        );
        self.dead_letters
            .lock()
            .expect("lock poisoned")
            .push(in_flight.envelope);
        Ok(())
    }

    pub fn dead_letter_count(&self) -> usize {
        self.dead_letters.lock().expect("lock poisoned").len()
    }

    /// Drain the dead-letter store (used by operational tooling and tests).
    pub fn take_dead_letters(&self) -> Vec<TaskEnvelope> {
        std::mem::take(&mut *self.dead_letters.lock().expect("lock poisoned"))
    }

    pub fn depth(&self, name: QueueName) -> usize {
        self.queue(name).depth()
    }

    /// Whether the inference queue currently admits new work.
    pub fn admitting(&self) -> bool {
        if !self.admitting.load(Ordering::Acquire)
            && self.inference.depth() <= self.low_water
        {
            self.admitting.store(true, Ordering::Release);
        }
        self.admitting.load(Ordering::Acquire)
    }

    // ── Reply channels ──────────────────────────────────────────────

    /// Subscribe to a reply channel, replacing any previous subscriber.
    pub fn subscribe_reply(&self, channel: &str) -> mpsc::UnboundedReceiver<ReplyEnvelope> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.replies.insert(channel.to_owned(), tx);
        rx
    }

    pub fn unsubscribe_reply(&self, channel: &str) {
        self.replies.remove(channel);
    }

    /// Publish a reply. Returns false when nobody owns the channel; the
    /// reply is dropped and the task is not retried.
    pub fn publish_reply(&self, channel: &str, envelope: ReplyEnvelope) -> bool {
        match self.replies.get(channel) {
            Some(tx) => tx.send(envelope).is_ok(),
            None => {
                trace!(channel, "reply for unowned channel dropped");
                false
            }
        }
    }

    // ── Redelivery ──────────────────────────────────────────────────

    fn sweep_queue(queue: &Queue) {
        let now = Instant::now();

        // Promote delayed retries that have come due.
        let mut due = Vec::new();
        {
            let mut delayed = queue.delayed.lock().expect("lock poisoned");
            while matches!(delayed.peek(), Some(Reverse(d)) if d.due <= now) {
                if let Some(Reverse(d)) = delayed.pop() {
                    due.push(d.envelope);
                }
            }
        }
        for envelope in due {
            queue.push(envelope);
        }

        // Redeliver tasks whose visibility deadline lapsed (consumer died).
        let lapsed: Vec<u64> = queue
            .in_flight
            .iter()
            .filter(|e| e.value().redeliver_at <= now)
            .map(|e| *e.key())
            .collect();
        for task_id in lapsed {
            if let Some((_, in_flight)) = queue.in_flight.remove(&task_id) {
                let mut envelope = in_flight.envelope;
                envelope.attempt += 1;
                warn!(
                    queue = queue.name,
                    task_id,
                    attempt = envelope.attempt,
                    "visibility timeout lapsed, redelivering task"
                );
                queue.push(envelope);
            }
        }
    }

    /// Periodically promote delayed retries and redeliver lapsed claims.
    pub async fn run_redelivery_sweeper(&self, cancel: CancellationToken) {
        let tick = (self.visibility_timeout / 4).max(Duration::from_millis(250));
        let mut interval = tokio::time::interval(tick);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    Self::sweep_queue(&self.inference);
                    Self::sweep_queue(&self.persist);
                }
                _ = cancel.cancelled() => {
                    debug!("redelivery sweeper stopped");
                    return;
                }
            }
        }
    }

    /// Force a single sweep pass (test hook and shutdown drain).
    pub fn sweep_once(&self) {
        Self::sweep_queue(&self.inference);
        Self::sweep_queue(&self.persist);
    }
}
