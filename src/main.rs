use anyhow::Context;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use topolink_core::{ConnectorConfig, StaticClusterViewProvider};
use topolink_transport::ConnectorServer;
use tracing_subscriber::EnvFilter;

/// Topology connector node: announces the local cluster to configured peers
/// and accepts their announcements.
#[derive(Debug, Parser)]
#[command(name = "topolink", version)]
struct Args {
    /// TOML configuration file.
    #[arg(short, long)]
    config: PathBuf,

    /// Overrides `bind` from the configuration.
    #[arg(long)]
    bind: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();
    let mut config = ConnectorConfig::load(&args.config)
        .with_context(|| format!("loading {}", args.config.display()))?;
    if let Some(bind) = args.bind {
        config.bind = bind;
    }

    let provider = Arc::new(StaticClusterViewProvider::from_config(&config.local)?);
    let server = ConnectorServer::new(config, provider).start().await?;
    tracing::info!("topolink: accepting connectors at {}", server.connector_url());

    tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
    tracing::info!("topolink: shutting down");
    server.stop().await;
    Ok(())
}
