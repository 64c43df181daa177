//! Dispatch Server - route assignment and delivery synchronization
//!
//! # Modules
//!
//! ```text
//! dispatch-server/src/
//! ├── core/       # config, state, server, background tasks
//! ├── planning/   # distance provider, clustering, route builder, re-optimizer
//! ├── dispatch/   # route/stop state machine, redb event store, archive
//! ├── hub/        # sync hub: transport, sessions, driver submissions
//! ├── api/        # admin HTTP API
//! └── utils/      # logging
//! ```

pub mod api;
pub mod core;
pub mod dispatch;
pub mod hub;
pub mod planning;
pub mod utils;

pub use core::{Config, Server, ServerError, ServerState};
pub use dispatch::{DispatchManager, DispatchStorage, Repository};
pub use hub::{HubConfig, HubServer};
pub use utils::logger::{init_logger, init_logger_with_file};

/// Security event on the `security` target
#[macro_export]
macro_rules! security_log {
    ($level:expr, $event:expr, $($key:ident = $value:expr),*) => {
        tracing::info!(
            target: "security",
            level = $level,
            event = $event,
            $($key = $value),*
        );
    };
}

/// Load `.env`, create the work dir and start logging
pub fn setup_environment() -> Result<(), ServerError> {
    dotenv::dotenv().ok();
    let config = Config::from_env();
    std::fs::create_dir_all(&config.work_dir)?;
    if let Some(dir) = &config.log_dir {
        std::fs::create_dir_all(dir)?;
    }
    init_logger_with_file(
        Some(&config.log_level),
        Some(config.log_json),
        config.log_dir.as_deref(),
    );
    Ok(())
}

pub fn print_banner() {
    println!(
        r#"
    ____  _                  __       __
   / __ \(_)________  ____ _/ /______/ /_
  / / / / / ___/ __ \/ __ `/ __/ ___/ __ \
 / /_/ / (__  ) /_/ / /_/ / /_/ /__/ / / /
/_____/_/____/ .___/\__,_/\__/\___/_/ /_/
            /_/
    "#
    );
}
