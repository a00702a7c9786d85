use std::sync::Arc;
use topolink_core::{ConnectorConfig, StaticClusterViewProvider};
use topolink_transport::ConnectorServer;

/// Two single-instance clusters on localhost; `alpha` connects to `beta`.
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let mut beta_config = ConnectorConfig::default();
    beta_config.bind = "127.0.0.1:0".to_string();
    beta_config.server_info = "beta demo node".to_string();
    let beta = ConnectorServer::new(beta_config, Arc::new(StaticClusterViewProvider::single("beta", "cluster-beta")))
        .without_heartbeat()
        .start()
        .await?;

    let mut alpha_config = ConnectorConfig::default();
    alpha_config.bind = "127.0.0.1:0".to_string();
    alpha_config.server_info = "alpha demo node".to_string();
    alpha_config.connector_urls = vec![beta.connector_url()];
    let alpha = ConnectorServer::new(alpha_config, Arc::new(StaticClusterViewProvider::single("alpha", "cluster-alpha")))
        .without_heartbeat()
        .start()
        .await?;

    alpha.connectors().ping_outgoing_connectors(true).await;

    for info in alpha.connectors().list_outgoing_connectors() {
        println!("alpha -> {}", serde_json::to_string_pretty(&info)?);
    }
    for announcement in beta.announcements().list_local_announcements() {
        println!("beta knows {}", announcement.owner_id);
    }

    alpha.stop().await;
    beta.stop().await;
    Ok(())
}
