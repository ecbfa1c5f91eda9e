use super::Service;
use crate::cache::Reaper;
use crate::registry::ClosedConnection;
use crate::state::AppState;
use crate::status::ComponentStatus;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Lifecycle maintenance service: the cache expiry sweeper, the cascading
/// reaper, the broker's redelivery sweeper, and the orchestrator's
/// closed-connection listener all run under its cancellation token.
pub struct ReaperService {
    state: AppState,
    reaper: Option<Reaper>,
    closed_rx: Option<mpsc::UnboundedReceiver<ClosedConnection>>,
    cancel: CancellationToken,
    handles: Vec<JoinHandle<()>>,
}

impl ReaperService {
    pub fn new(
        state: AppState,
        reaper: Reaper,
        closed_rx: mpsc::UnboundedReceiver<ClosedConnection>,
    ) -> Self {
        Self {
            state,
            reaper: Some(reaper),
            closed_rx: Some(closed_rx),
            cancel: CancellationToken::new(),
            handles: Vec::new(),
        }
    }
}

#[async_trait::async_trait]
impl Service for ReaperService {
    fn name(&self) -> &'static str {
        "reaper"
    }

    async fn run(&mut self) -> Result<(), anyhow::Error> {
        let reaper = self
            .reaper
            .take()
            .ok_or_else(|| anyhow::anyhow!("reaper service restarted"))?;
        let closed_rx = self
            .closed_rx
            .take()
            .ok_or_else(|| anyhow::anyhow!("reaper service restarted"))?;

        let store = Arc::clone(&self.state.store);
        let cancel = self.cancel.clone();
        self.handles.push(tokio::spawn(async move {
            store.run_expiry_sweeper(cancel).await;
        }));

        self.handles
            .push(tokio::spawn(reaper.run(self.cancel.clone())));

        let broker = Arc::clone(&self.state.broker);
        let cancel = self.cancel.clone();
        self.handles.push(tokio::spawn(async move {
            broker.run_redelivery_sweeper(cancel).await;
        }));

        let orchestrator = Arc::clone(&self.state.orchestrator);
        self.handles.push(tokio::spawn(
            orchestrator.run_closed_listener(closed_rx, self.cancel.clone()),
        ));

        info!("reaper running");
        self.state.statuses.set("reaper", ComponentStatus::Active);

        std::future::pending::<()>().await;
        Ok(())
    }

    async fn shutdown(&mut self) -> Result<(), anyhow::Error> {
        self.cancel.cancel();
        for handle in self.handles.drain(..) {
            let _ = handle.await;
        }
        Ok(())
    }
}
