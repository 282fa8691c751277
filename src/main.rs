use anyhow::Context;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use nuvion_agent::agent::Agent;
use nuvion_agent::config::Config;
use nuvion_agent::health;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    gstreamer::init().context("failed to initialize gstreamer")?;

    let config = Config::from_env().context("failed to load configuration from environment")?;
    info!(server = %config.server_base_url, backend = ?config.zsad_backend, "starting nuvion agent");

    let agent = Agent::new(config)?;
    let health_state = agent.health_state();
    let health_config = agent.config();

    tokio::spawn(async move {
        if let Err(e) = health::run_server(health_config, health_state).await {
            error!(error = %e, "health endpoint failed");
        }
    });

    tokio::select! {
        result = agent.run() => {
            if let Err(e) = result {
                error!(error = %e, "agent terminated with error");
                return Err(e);
            }
        }
        _ = shutdown_signal() => {
            info!("received shutdown signal");
        }
    }

    Ok(())
}

/// Waits for either Ctrl-C or SIGTERM (the signal systemd/k8s send on a
/// managed stop), matching how this process is actually terminated outside
/// an interactive terminal.
async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        let mut terminate = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler");
        tokio::select! {
            _ = ctrl_c => {}
            _ = terminate.recv() => {}
        }
    }

    #[cfg(not(unix))]
    {
        let _ = ctrl_c.await;
    }
}
