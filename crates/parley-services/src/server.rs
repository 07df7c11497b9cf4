//! Relay accept loop.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::task::JoinSet;

use parley_core::config::ServerConfig;
use parley_core::KeyProvider;

use crate::connection::{ConnectionHandler, HandlerSettings};
use crate::registry::SessionRegistry;
use crate::tls::{PendingTls, TlsListener};
use crate::SessionError;

pub struct RelayServer {
    listener: TlsListener,
    handler: ConnectionHandler,
    registry: SessionRegistry,
    handshake_timeout: Duration,
    snapshot_interval: Option<Duration>,
}

impl RelayServer {
    pub async fn bind(
        addr: SocketAddr,
        tls: Arc<rustls::ServerConfig>,
        keys: KeyProvider,
        config: &ServerConfig,
    ) -> Result<Self, SessionError> {
        let listener = TlsListener::bind(addr, tls).await?;
        let registry = SessionRegistry::new();
        let handler = ConnectionHandler::new(registry.clone(), keys, HandlerSettings::from(config));

        Ok(Self {
            listener,
            handler,
            registry,
            handshake_timeout: Duration::from_secs(config.handshake_timeout_secs.max(1)),
            snapshot_interval: (config.registry_snapshot_secs > 0)
                .then(|| Duration::from_secs(config.registry_snapshot_secs)),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, SessionError> {
        self.listener.local_addr()
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    /// Accept until `shutdown` fires. Each connection runs on its own task;
    /// open connections are aborted on shutdown.
    pub async fn run(self, mut shutdown: broadcast::Receiver<()>) -> Result<(), SessionError> {
        let addr = self.local_addr()?;
        tracing::info!(%addr, "relay listening");

        let snapshot_task = self.snapshot_interval.map(|every| {
            let registry = self.registry.clone();
            tokio::spawn(async move {
                let mut interval = tokio::time::interval(every);
                loop {
                    interval.tick().await;
                    let online = registry.usernames().await;
                    tracing::info!(count = online.len(), users = ?online, "registry snapshot");
                }
            })
        });

        let mut connections = JoinSet::new();
        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    tracing::info!(open = connections.len(), "relay shutting down");
                    break;
                }

                Some(_) = connections.join_next(), if !connections.is_empty() => {}

                accepted = self.listener.accept() => {
                    let (pending, peer) = match accepted {
                        Ok(a) => a,
                        Err(e) => {
                            tracing::warn!(error = %e, "accept failed");
                            tokio::time::sleep(Duration::from_millis(50)).await;
                            continue;
                        }
                    };
                    connections.spawn(serve_connection(
                        pending,
                        peer,
                        self.handler.clone(),
                        self.handshake_timeout,
                    ));
                }
            }
        }

        connections.shutdown().await;
        if let Some(task) = snapshot_task {
            task.abort();
        }
        Ok(())
    }
}

async fn serve_connection(
    pending: PendingTls,
    peer: SocketAddr,
    handler: ConnectionHandler,
    handshake_timeout: Duration,
) {
    let stream = match pending.handshake(handshake_timeout).await {
        Ok(stream) => stream,
        Err(e) => {
            tracing::warn!(%peer, error = %e, "TLS handshake failed");
            return;
        }
    };
    tracing::info!(%peer, "client connected");

    match handler.run(stream).await {
        Ok(()) => tracing::info!(%peer, "client disconnected"),
        Err(e) => tracing::warn!(%peer, error = %e, "connection closed with error"),
    }
}
