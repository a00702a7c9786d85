use crate::connectors::ConnectorRegistry;
use crate::context::ConnectorContext;
use crate::heartbeat::HeartbeatScheduler;
use crate::receiver::TopologyConnectorReceiver;
use axum::extract::DefaultBodyLimit;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use topolink_cluster::AnnouncementRegistry;
use topolink_core::{Clock, ClusterViewProvider, ConnectorConfig, NoopListener, SystemClock, TopologyError, TopologyListener};
use topolink_trust::{NoPeerNames, PeerNameResolver};

/// Builder for a connector node: receiver, outgoing connectors and the
/// heartbeat that drives them.
pub struct ConnectorServer {
    config: ConnectorConfig,
    provider: Arc<dyn ClusterViewProvider>,
    listener: Arc<dyn TopologyListener>,
    peer_names: Arc<dyn PeerNameResolver>,
    clock: Arc<dyn Clock>,
    heartbeat: bool,
}

impl ConnectorServer {
    pub fn new(config: ConnectorConfig, provider: Arc<dyn ClusterViewProvider>) -> Self {
        Self {
            config,
            provider,
            listener: Arc::new(NoopListener),
            peer_names: Arc::new(NoPeerNames),
            clock: Arc::new(SystemClock),
            heartbeat: true,
        }
    }

    pub fn with_listener(mut self, listener: Arc<dyn TopologyListener>) -> Self {
        self.listener = listener;
        self
    }

    pub fn with_peer_resolver(mut self, peer_names: Arc<dyn PeerNameResolver>) -> Self {
        self.peer_names = peer_names;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Leaves pinging to the caller (`ping_outgoing_connectors`).
    pub fn without_heartbeat(mut self) -> Self {
        self.heartbeat = false;
        self
    }

    /// Binds the receiver, registers the configured connectors and starts
    /// the heartbeat. Connectors are first pinged on the next tick.
    pub async fn start(self) -> Result<RunningServer, TopologyError> {
        let Self {
            config,
            provider,
            listener,
            peer_names,
            clock,
            heartbeat,
        } = self;
        config.validate()?;

        let registry = Arc::new(
            AnnouncementRegistry::from_config(&config, provider.local_instance_id(), clock.clone())
                .with_listener(listener),
        );
        let context = Arc::new(ConnectorContext::new(config.clone(), provider, registry, clock)?.with_peer_names(peer_names));
        let receiver = Arc::new(TopologyConnectorReceiver::new(context.clone()));
        let connectors = Arc::new(ConnectorRegistry::new(context.clone()));

        let tcp = TcpListener::bind(config.bind.as_str()).await?;
        let local_addr = tcp.local_addr()?;
        let app = receiver
            .router()
            .layer(DefaultBodyLimit::max(config.max_message_bytes));
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let server = tokio::spawn(async move {
            let result = axum::serve(tcp, app.into_make_service_with_connect_info::<SocketAddr>())
                .with_graceful_shutdown(async move {
                    let _ = shutdown_rx.await;
                })
                .await;
            if let Err(e) = result {
                tracing::error!("ConnectorServer: receiver stopped with error: {}", e);
            }
        });
        tracing::info!(
            "ConnectorServer: instance {} listening on {}{}",
            context.local_instance_id(),
            local_addr,
            config.path_prefix
        );

        connectors.sync_connectors(&config.connector_urls);
        let heartbeat = heartbeat.then(|| HeartbeatScheduler::start(connectors.clone(), config.heartbeat_interval()));

        Ok(RunningServer {
            local_addr,
            context,
            connectors,
            heartbeat,
            shutdown: shutdown_tx,
            server,
        })
    }
}

/// Handle to a started [`ConnectorServer`].
pub struct RunningServer {
    local_addr: SocketAddr,
    context: Arc<ConnectorContext>,
    connectors: Arc<ConnectorRegistry>,
    heartbeat: Option<HeartbeatScheduler>,
    shutdown: oneshot::Sender<()>,
    server: JoinHandle<()>,
}

impl RunningServer {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// URL other nodes configure as a connector endpoint to reach this one.
    pub fn connector_url(&self) -> String {
        format!("http://{}{}", self.local_addr, self.context.config().path_prefix)
    }

    pub fn connectors(&self) -> &Arc<ConnectorRegistry> {
        &self.connectors
    }

    pub fn announcements(&self) -> &Arc<AnnouncementRegistry> {
        self.context.registry()
    }

    pub fn context(&self) -> &Arc<ConnectorContext> {
        &self.context
    }

    /// Applies a new configuration: trust policy and connector set.
    /// Bind address, heartbeat period and announcement timeout keep their
    /// startup values.
    ///
    /// Host names in the whitelist are resolved on the blocking pool.
    pub async fn reload(&self, config: ConnectorConfig) -> Result<(), TopologyError> {
        let current = self.context.config();
        if config.bind != current.bind || config.heartbeat_interval_secs != current.heartbeat_interval_secs {
            tracing::warn!("ConnectorServer: bind address and heartbeat interval changes need a restart");
        }
        let endpoints = config.connector_urls.clone();
        let context = self.context.clone();
        tokio::task::spawn_blocking(move || context.reload(config))
            .await
            .map_err(|e| TopologyError::Transport(format!("reload task failed: {}", e)))??;
        self.connectors.sync_connectors(&endpoints);
        Ok(())
    }

    /// Stops pinging, disconnects every connector, then drains the receiver.
    pub async fn stop(self) {
        if let Some(heartbeat) = self.heartbeat {
            heartbeat.stop().await;
        }
        self.connectors.shutdown().await;
        let _ = self.shutdown.send(());
        if let Err(e) = self.server.await {
            tracing::warn!("ConnectorServer: receiver task ended abnormally: {}", e);
        }
        tracing::info!("ConnectorServer: stopped");
    }
}
