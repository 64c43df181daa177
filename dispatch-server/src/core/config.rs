use std::path::PathBuf;
use std::time::Duration;

/// Server configuration
///
/// # Environment variables
///
/// Every field can be overridden from the environment:
///
/// | Variable | Default | Meaning |
/// |----------|---------|---------|
/// | WORK_DIR | /var/lib/dispatch | Working directory (database, logs) |
/// | HTTP_PORT | 3000 | Admin HTTP API port |
/// | HUB_TCP_PORT | 8081 | Synchronization hub TCP port |
/// | HEARTBEAT_TIMEOUT_MS | 30000 | Silence after which a client is considered offline |
/// | REOPTIMIZE_BUDGET_MS | 2000 | Time budget for one partial re-optimization |
/// | LOCAL_SEARCH_PASSES | 4 | Max swap/2-opt passes in the route builder |
/// | SERVICE_TIME_SECS | 300 | Time spent at each stop |
/// | CAPACITY_RESERVE_RATIO | 0.1 | Share of capacity kept free at planning time |
/// | AVERAGE_SPEED_KMH | 35 | Speed used by straight-line estimates |
/// | DISTANCE_PROVIDER_URL | (unset) | External distance API; straight-line when unset |
/// | DISTANCE_PROVIDER_KEY | (unset) | API key sent to the distance provider |
/// | PROVIDER_MAX_ATTEMPTS | 3 | Provider attempts before falling back |
/// | PROVIDER_TIMEOUT_MS | 5000 | Per-request provider timeout |
/// | ARCHIVE_INTERVAL_SECS | 3600 | Period of the route archive task |
/// | LOG_LEVEL | info | Log level |
/// | LOG_DIR | (unset) | Daily rolling log files when set |
/// | LOG_JSON | false | JSON log lines |
///
/// # Example
///
/// ```ignore
/// WORK_DIR=/data/dispatch HTTP_PORT=8080 cargo run
/// ```
#[derive(Debug, Clone)]
pub struct Config {
    pub work_dir: String,
    pub http_port: u16,
    pub hub_tcp_port: u16,
    pub heartbeat_timeout_ms: u64,
    pub reoptimize_budget_ms: u64,
    pub local_search_passes: u32,
    pub service_time_secs: u32,
    pub capacity_reserve_ratio: f64,
    pub average_speed_kmh: f64,
    pub distance_provider_url: Option<String>,
    pub distance_provider_key: Option<String>,
    pub provider_max_attempts: u32,
    pub provider_timeout_ms: u64,
    pub archive_interval_secs: u64,
    pub log_level: String,
    pub log_dir: Option<String>,
    pub log_json: bool,
}

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_opt(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

impl Config {
    /// Load configuration from the environment, falling back to defaults
    pub fn from_env() -> Self {
        Self {
            work_dir: std::env::var("WORK_DIR").unwrap_or_else(|_| "/var/lib/dispatch".into()),
            http_port: env_or("HTTP_PORT", 3000),
            hub_tcp_port: env_or("HUB_TCP_PORT", 8081),
            heartbeat_timeout_ms: env_or("HEARTBEAT_TIMEOUT_MS", 30_000),
            reoptimize_budget_ms: env_or("REOPTIMIZE_BUDGET_MS", 2_000),
            local_search_passes: env_or("LOCAL_SEARCH_PASSES", 4),
            service_time_secs: env_or("SERVICE_TIME_SECS", 300),
            capacity_reserve_ratio: env_or("CAPACITY_RESERVE_RATIO", 0.1_f64).clamp(0.0, 0.9),
            average_speed_kmh: env_or("AVERAGE_SPEED_KMH", 35.0),
            distance_provider_url: env_opt("DISTANCE_PROVIDER_URL"),
            distance_provider_key: env_opt("DISTANCE_PROVIDER_KEY"),
            provider_max_attempts: env_or("PROVIDER_MAX_ATTEMPTS", 3).max(1),
            provider_timeout_ms: env_or("PROVIDER_TIMEOUT_MS", 5_000),
            archive_interval_secs: env_or("ARCHIVE_INTERVAL_SECS", 3_600),
            log_level: std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".into()),
            log_dir: env_opt("LOG_DIR"),
            log_json: env_or("LOG_JSON", false),
        }
    }

    /// Override the paths and ports, keep everything else from the environment
    ///
    /// Used by tests.
    pub fn with_overrides(work_dir: impl Into<String>, http_port: u16, hub_tcp_port: u16) -> Self {
        let mut config = Self::from_env();
        config.work_dir = work_dir.into();
        config.http_port = http_port;
        config.hub_tcp_port = hub_tcp_port;
        config
    }

    pub fn database_path(&self) -> PathBuf {
        PathBuf::from(&self.work_dir).join("dispatch.redb")
    }

    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_millis(self.heartbeat_timeout_ms)
    }

    pub fn reoptimize_budget(&self) -> Duration {
        Duration::from_millis(self.reoptimize_budget_ms)
    }

    pub fn archive_interval(&self) -> Duration {
        Duration::from_secs(self.archive_interval_secs.max(1))
    }

    /// Builder settings derived from this configuration
    pub fn builder_settings(&self) -> crate::planning::BuilderSettings {
        crate::planning::BuilderSettings {
            service_time_s: self.service_time_secs as f64,
            max_local_search_passes: self.local_search_passes,
        }
    }

    pub fn planning_settings(&self) -> crate::planning::PlanningSettings {
        crate::planning::PlanningSettings {
            cluster: crate::planning::ClusterSettings {
                reserve_ratio: self.capacity_reserve_ratio,
            },
            builder: self.builder_settings(),
            fallback_speed_kmh: self.average_speed_kmh,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::from_env()
    }
}
