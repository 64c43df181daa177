//! Server Implementation
//!
//! Binds the admin HTTP API and the sync hub, runs background tasks, and
//! shuts everything down on Ctrl-C.

use std::net::SocketAddr;

use tokio::net::TcpListener;

use crate::core::tasks::TaskKind;
use crate::core::{Config, Result, ServerState};

pub struct Server {
    config: Config,
    state: Option<ServerState>,
}

impl Server {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            state: None,
        }
    }

    pub fn with_state(config: Config, state: ServerState) -> Self {
        Self {
            config,
            state: Some(state),
        }
    }

    pub async fn run(&self) -> Result<()> {
        let state = match &self.state {
            Some(s) => s.clone(),
            None => ServerState::initialize(&self.config)?,
        };

        let mut tasks = state.start_background_tasks();

        let hub_addr = SocketAddr::from(([0, 0, 0, 0], self.config.hub_tcp_port));
        let hub_listener = TcpListener::bind(hub_addr).await?;
        let hub = state.hub.clone();
        tasks.spawn("sync_hub", TaskKind::Hub, async move {
            if let Err(e) = hub.run_tcp(hub_listener).await {
                tracing::error!(error = %e, "Sync hub stopped");
            }
        });

        let http_addr = SocketAddr::from(([0, 0, 0, 0], self.config.http_port));
        let http_listener = TcpListener::bind(http_addr).await?;
        tracing::info!(addr = %http_addr, hub = %hub_addr, "Dispatch server listening");

        let app = crate::api::build_app(state.clone());
        let shutdown = async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("Shutting down...");
        };
        let served = axum::serve(http_listener, app)
            .with_graceful_shutdown(shutdown)
            .await;

        state.hub.shutdown();
        tasks.shutdown().await;
        served?;
        Ok(())
    }
}
