use anyhow::Result;
use armada_agent::{AgentConfig, NodeAgent};
use armada_core::config::ArmadaConfigFile;
use tracing::{error, info};
use tracing_subscriber::fmt::format::FmtSpan;

fn parse_config() -> Result<AgentConfig> {
    let mut file = match std::env::var("ARMADA_CONFIG") {
        Ok(path) => ArmadaConfigFile::load(path)?,
        Err(_) => ArmadaConfigFile::default(),
    };
    file.apply_env_overrides();
    Ok(AgentConfig::from_file(&file)?)
}

#[tokio::main]
async fn main() -> Result<()> {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_span_events(FmtSpan::CLOSE)
        .with_target(false)
        .init();

    info!("Starting armada-agent");

    let config = parse_config()?;
    info!(
        hub = %config.hub_addr,
        name = %config.node_name,
        node_type = %config.node_type,
        max_concurrent = config.max_concurrent_tasks,
        "Configuration loaded"
    );

    let mut agent = NodeAgent::new(config);

    let shutdown = agent.shutdown_sender();
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        info!("Received Ctrl+C, initiating shutdown");
        let _ = shutdown.send(());
    });

    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let shutdown = agent.shutdown_sender();
        tokio::spawn(async move {
            match signal(SignalKind::terminate()) {
                Ok(mut sigterm) => {
                    sigterm.recv().await;
                    info!("Received SIGTERM, initiating shutdown");
                }
                Err(e) => {
                    tracing::warn!("Failed to register SIGTERM handler: {e}");
                }
            }
            let _ = shutdown.send(());
        });
    }

    match agent.run().await {
        Ok(()) => {
            info!("Agent shut down cleanly");
            Ok(())
        }
        Err(e) => {
            error!(error = %e, "Agent failed");
            Err(e.into())
        }
    }
}
