use dispatch_server::{Config, Server, ServerState, print_banner, setup_environment};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // 1. Environment (dotenv, work dir, logging)
    setup_environment()?;

    print_banner();
    tracing::info!(version = env!("CARGO_PKG_VERSION"), "Dispatch server starting...");

    // 2. Configuration
    let config = Config::from_env();

    // 3. State: database, planner, re-optimizer, hub
    let state = ServerState::initialize(&config)?;

    // 4. HTTP API and sync hub until Ctrl-C
    let server = Server::with_state(config, state);
    if let Err(e) = server.run().await {
        tracing::error!(error = %e, "Server error");
        return Err(e.into());
    }

    Ok(())
}
