//! Parley integration test harness.
//!
//! Every test starts its own relay on 127.0.0.1 with an ephemeral port and a
//! freshly generated certificate in a per-test temp directory, then talks to
//! it over real TLS:
//!
//!   cargo test --test integration
//!
//! Dropping a `Relay` stops the server and removes its directory.

use std::future::Future;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::io::{ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc};

use parley_core::config::{ServerConfig, TlsConfig};
use parley_core::wire::DEFAULT_MAX_FRAME_LEN;
use parley_core::{Envelope, KeyProvider};
use parley_services::client::{connect, RelayStream};
use parley_services::{
    client_config, ensure_certificate, load_server_config, write_envelope, ChatEvent,
    ClientSession, ConnectionId, FramedReader, RelayServer, SessionRegistry,
};

mod failures;
mod relay;
mod tls_modes;

// ── Harness ───────────────────────────────────────────────────────────────────

pub const WAIT: Duration = Duration::from_secs(5);

/// A relay running on its own task.
pub struct Relay {
    pub addr: SocketAddr,
    pub registry: SessionRegistry,
    pub keys: KeyProvider,
    pub cert_path: PathBuf,
    dir: PathBuf,
    shutdown: broadcast::Sender<()>,
}

impl Drop for Relay {
    fn drop(&mut self) {
        let _ = self.shutdown.send(());
        let _ = std::fs::remove_dir_all(&self.dir);
    }
}

/// Per-test temp directory holding a certificate/key pair.
pub fn cert_dir(tag: &str) -> Result<(PathBuf, TlsConfig)> {
    let dir = std::env::temp_dir().join(format!("parley-it-{}-{}", std::process::id(), tag));
    let _ = std::fs::remove_dir_all(&dir);
    let tls = TlsConfig {
        cert_path: dir.join("cert.pem"),
        key_path: dir.join("key.pem"),
        ..TlsConfig::default()
    };
    ensure_certificate(&tls).context("certificate provisioning failed")?;
    Ok((dir, tls))
}

pub async fn start_relay(tag: &str) -> Result<Relay> {
    start_relay_with(tag, ServerConfig::default()).await
}

pub async fn start_relay_with(tag: &str, config: ServerConfig) -> Result<Relay> {
    let (dir, tls) = cert_dir(tag)?;
    let keys = KeyProvider::generate();
    let server = RelayServer::bind(
        "127.0.0.1:0".parse()?,
        load_server_config(&tls)?,
        keys.clone(),
        &config,
    )
    .await?;

    let addr = server.local_addr()?;
    let registry = server.registry().clone();
    let (shutdown, rx) = broadcast::channel(1);
    tokio::spawn(server.run(rx));

    Ok(Relay {
        addr,
        registry,
        keys,
        cert_path: tls.cert_path,
        dir,
        shutdown,
    })
}

pub type Session = ClientSession<RelayStream>;

/// Join `relay` as `name` with the relay's certificate pinned, and wait until
/// the registry shows a connection for `name` that was not there before.
pub async fn join(relay: &Relay, name: &str) -> Result<(Session, mpsc::Receiver<ChatEvent>)> {
    let before = relay.registry.current_id(name).await;
    let tls = client_config(Some(&relay.cert_path))?;
    let joined = connect("127.0.0.1", relay.addr.port(), name, tls).await?;
    wait_for(move || async move {
        relay
            .registry
            .current_id(name)
            .await
            .is_some_and(|id| Some(id) != before)
    })
    .await
    .with_context(|| format!("{name} never appeared in the registry"))?;
    Ok(joined)
}

/// Poll `check` until it holds or `WAIT` elapses.
pub async fn wait_for<F, Fut>(mut check: F) -> Result<()>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    tokio::time::timeout(WAIT, async {
        while !check().await {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .context("condition not reached in time")
}

pub async fn next_event(events: &mut mpsc::Receiver<ChatEvent>) -> ChatEvent {
    tokio::time::timeout(WAIT, events.recv())
        .await
        .expect("timed out waiting for a chat event")
        .expect("event channel closed")
}

/// Everything that arrives until `quiet` passes with no new event.
pub async fn drain(events: &mut mpsc::Receiver<ChatEvent>, quiet: Duration) -> Vec<ChatEvent> {
    let mut seen = Vec::new();
    while let Ok(Some(event)) = tokio::time::timeout(quiet, events.recv()).await {
        seen.push(event);
    }
    seen
}

/// `(sender, text)` of a chat event, panicking on anything else.
pub fn message(event: ChatEvent) -> (String, String) {
    match event {
        ChatEvent::Message { username, text, .. } => (username, text),
        other => panic!("expected a chat message, got {other:?}"),
    }
}

/// A hand-driven TLS connection for sending out-of-protocol input.
pub struct RawPeer {
    pub reader: FramedReader<ReadHalf<RelayStream>>,
    pub writer: WriteHalf<RelayStream>,
}

impl RawPeer {
    /// Connect and consume the key distribution envelope.
    pub async fn connect(relay: &Relay) -> Result<Self> {
        let tls = client_config(Some(&relay.cert_path))?;
        let stream = parley_services::tls::connect("127.0.0.1", relay.addr.port(), tls).await?;
        let (r, w) = tokio::io::split(stream);
        let mut peer = Self {
            reader: FramedReader::new(r, DEFAULT_MAX_FRAME_LEN),
            writer: w,
        };
        match peer.reader.read_envelope().await? {
            Some(Envelope::KeyDistribution { .. }) => Ok(peer),
            other => anyhow::bail!("expected key_distribution, got {other:?}"),
        }
    }

    pub async fn send(&mut self, envelope: &Envelope) -> Result<()> {
        write_envelope(&mut self.writer, envelope).await?;
        Ok(())
    }

    /// True once the relay has closed this connection.
    pub async fn closed_by_relay(&mut self) -> bool {
        matches!(
            tokio::time::timeout(WAIT, self.reader.read_envelope()).await,
            Ok(Ok(None)) | Ok(Err(_))
        )
    }
}

pub async fn ids_of(registry: &SessionRegistry, names: &[String]) -> Vec<ConnectionId> {
    let mut ids = Vec::new();
    for name in names {
        if let Some(id) = registry.current_id(name).await {
            ids.push(id);
        }
    }
    ids
}

pub async fn plain_tcp(relay: &Relay) -> Result<TcpStream> {
    Ok(TcpStream::connect(relay.addr).await?)
}
