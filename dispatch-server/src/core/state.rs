//! Server state shared by the HTTP API, the hub and background tasks

use std::sync::Arc;
use std::time::Instant;

use crate::core::event_router::EventRouter;
use crate::core::tasks::{BackgroundTasks, TaskKind};
use crate::core::{Config, Result};
use crate::dispatch::{ArchiveWorker, DispatchManager, Repository};
use crate::hub::{HubConfig, HubServer};
use crate::planning::{
    DistanceProvider, HttpDistanceProvider, Planner, RefreshWorker, Reoptimizer,
    StraightLineProvider,
};

/// Failed-stop channel buffer
const FAILED_STOP_BUFFER: usize = 256;

/// Cheap to clone; every field is shared
#[derive(Clone)]
pub struct ServerState {
    pub config: Config,
    pub manager: DispatchManager,
    pub repo: Arc<dyn Repository>,
    pub provider: Arc<dyn DistanceProvider>,
    pub planner: Planner,
    pub reoptimizer: Reoptimizer,
    pub hub: HubServer,
    pub started_at: Instant,
}

impl std::fmt::Debug for ServerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerState")
            .field("epoch", &self.manager.epoch())
            .field("provider", &self.provider.name())
            .field("sessions", &self.hub.session_count())
            .finish()
    }
}

impl ServerState {
    /// Open the database under the work dir and wire every service
    pub fn initialize(config: &Config) -> Result<Self> {
        std::fs::create_dir_all(&config.work_dir)?;
        let manager = DispatchManager::new(config.database_path())?;
        Self::with_manager(config, manager)
    }

    /// Wire every service around an existing manager
    pub fn with_manager(config: &Config, manager: DispatchManager) -> Result<Self> {
        let repo: Arc<dyn Repository> = Arc::new(manager.storage().clone());
        let provider: Arc<dyn DistanceProvider> = match &config.distance_provider_url {
            Some(url) => Arc::new(HttpDistanceProvider::new(
                url.clone(),
                config.distance_provider_key.clone(),
                std::time::Duration::from_millis(config.provider_timeout_ms),
                config.provider_max_attempts,
                config.average_speed_kmh,
            )?),
            None => Arc::new(StraightLineProvider::new(config.average_speed_kmh)),
        };
        tracing::info!(provider = provider.name(), "Distance provider ready");

        let settings = config.planning_settings();
        let planner = Planner::new(manager.clone(), repo.clone(), provider.clone(), settings);
        let reoptimizer = Reoptimizer::new(
            manager.clone(),
            repo.clone(),
            provider.clone(),
            settings,
            config.reoptimize_budget(),
        );
        let hub = HubServer::new(
            manager.clone(),
            HubConfig {
                heartbeat_timeout: config.heartbeat_timeout(),
            },
        );

        Ok(Self {
            config: config.clone(),
            manager,
            repo,
            provider,
            planner,
            reoptimizer,
            hub,
            started_at: Instant::now(),
        })
    }

    /// Start the event router, the failed-stop refresh and the archive scan
    ///
    /// The hub listener is started by [`crate::core::Server::run`].
    pub fn start_background_tasks(&self) -> BackgroundTasks {
        let mut tasks = BackgroundTasks::new();

        let (router, channels) = EventRouter::new(FAILED_STOP_BUFFER);
        tasks.spawn("event_router", TaskKind::Listener, router.run(self.manager.subscribe()));

        let refresh = RefreshWorker::new(self.reoptimizer.clone());
        tasks.spawn(
            "failed_stop_refresh",
            TaskKind::Worker,
            refresh.run(channels.failed_rx, tasks.shutdown_token()),
        );

        let archive = ArchiveWorker::new(self.manager.clone(), self.config.archive_interval());
        tasks.spawn("route_archive", TaskKind::Periodic, archive.run(tasks.shutdown_token()));

        tasks.log_summary();
        tasks
    }

    pub fn uptime_seconds(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }
}
