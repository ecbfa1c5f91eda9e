use super::Service;
use crate::state::AppState;
use crate::status::ComponentStatus;
use crate::web::create_router;
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tracing::{info, warn};

/// Web server service: HTTP endpoints plus the WebSocket request path.
pub struct WebService {
    port: u16,
    state: AppState,
    shutdown_tx: Option<oneshot::Sender<()>>,
}

impl WebService {
    pub fn new(port: u16, state: AppState) -> Self {
        Self {
            port,
            state,
            shutdown_tx: None,
        }
    }
}

#[async_trait::async_trait]
impl Service for WebService {
    fn name(&self) -> &'static str {
        "web"
    }

    async fn run(&mut self) -> Result<(), anyhow::Error> {
        let router = create_router(self.state.clone());
        let addr = SocketAddr::from(([0, 0, 0, 0], self.port));
        let listener = TcpListener::bind(addr).await?;
        info!(port = self.port, "web server listening");
        self.state.statuses.set("web", ComponentStatus::Active);

        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        self.shutdown_tx = Some(shutdown_tx);

        axum::serve(
            listener,
            router.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(async {
            let _ = shutdown_rx.await;
        })
        .await?;
        Ok(())
    }

    async fn shutdown(&mut self) -> Result<(), anyhow::Error> {
        self.state.statuses.set("web", ComponentStatus::Draining);
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }

        // Refuse new requests and let in-flight ones seal before the
        // connections go away.
        let drained = self
            .state
            .orchestrator
            .drain(std::time::Duration::from_secs(5))
            .await;
        if !drained {
            warn!("web shutdown proceeding with undrained requests");
        }
        Ok(())
    }
}
