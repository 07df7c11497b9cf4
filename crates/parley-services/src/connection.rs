//! Server side of one client connection.
//!
//! State machine:
//!   Connected ──key sent──▶ KeySent ──register──▶ Registered ──▶ Closed
//!
//! Any decode failure, out-of-sequence envelope, I/O error, or eviction moves
//! the connection straight to Closed. Failures stay inside this connection.

use std::fmt;
use std::time::Duration;

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, WriteHalf};
use tokio::sync::mpsc;

use parley_core::config::ServerConfig;
use parley_core::envelope::validate_username;
use parley_core::wire::DEFAULT_MAX_FRAME_LEN;
use parley_core::{Envelope, KeyProvider};

use crate::broadcast;
use crate::framed::FramedReader;
use crate::registry::{Delivery, SessionHandle, SessionRegistry};
use crate::SessionError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connected,
    KeySent,
    Registered,
    Closed,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Connected => "connected",
            Self::KeySent => "key_sent",
            Self::Registered => "registered",
            Self::Closed => "closed",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-connection limits.
#[derive(Debug, Clone)]
pub struct HandlerSettings {
    pub outbound_queue_depth: usize,
    pub max_frame_len: usize,
    /// How long queued frames may keep flushing after the connection closes.
    pub drain_timeout: Duration,
}

impl Default for HandlerSettings {
    fn default() -> Self {
        Self {
            outbound_queue_depth: 256,
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
            drain_timeout: Duration::from_secs(2),
        }
    }
}

impl From<&ServerConfig> for HandlerSettings {
    fn from(config: &ServerConfig) -> Self {
        Self {
            outbound_queue_depth: config.outbound_queue_depth,
            max_frame_len: config.max_frame_len,
            ..Self::default()
        }
    }
}

/// Drives one connection from key distribution to close.
#[derive(Clone)]
pub struct ConnectionHandler {
    registry: SessionRegistry,
    keys: KeyProvider,
    settings: HandlerSettings,
}

impl ConnectionHandler {
    pub fn new(registry: SessionRegistry, keys: KeyProvider, settings: HandlerSettings) -> Self {
        Self {
            registry,
            keys,
            settings,
        }
    }

    /// Run the connection to completion. `Ok` means the peer left cleanly,
    /// logged out, or was evicted.
    pub async fn run<S>(&self, stream: S) -> Result<(), SessionError>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (read_half, write_half) = tokio::io::split(stream);
        let (handle, outbound_rx) = SessionHandle::with_queue(self.settings.outbound_queue_depth);
        let conn_id = handle.id();

        let mut writer = tokio::spawn(write_loop(write_half, outbound_rx));
        let mut reader = FramedReader::new(read_half, self.settings.max_frame_len);

        let mut state = ConnectionState::Connected;
        let mut username: Option<String> = None;
        let result = self
            .serve(&mut reader, &handle, &mut state, &mut username)
            .await;

        // ── Closed ──
        tracing::debug!(conn_id = %conn_id, from = %state, "connection closing");
        if let Some(name) = username.as_deref() {
            if self.registry.unregister_if_current(name, conn_id).await {
                tracing::info!(username = name, conn_id = %conn_id, "user left");
                self.notice(name, &format!("~~{name} left the chat")).await;
            } else {
                tracing::debug!(username = name, conn_id = %conn_id, "already replaced, registry untouched");
            }
        }

        // Dropping the last sender lets the writer flush what is queued and exit
        drop(handle);
        match tokio::time::timeout(self.settings.drain_timeout, &mut writer).await {
            Ok(Ok(Err(e))) => tracing::debug!(conn_id = %conn_id, error = %e, "writer stopped"),
            Ok(_) => {}
            Err(_) => {
                tracing::debug!(conn_id = %conn_id, "writer did not drain in time, aborting");
                writer.abort();
            }
        }

        state = ConnectionState::Closed;
        tracing::debug!(conn_id = %conn_id, state = %state, "connection released");
        result
    }

    async fn serve<R>(
        &self,
        reader: &mut FramedReader<R>,
        handle: &SessionHandle,
        state: &mut ConnectionState,
        username: &mut Option<String>,
    ) -> Result<(), SessionError>
    where
        R: AsyncRead + Unpin,
    {
        // ── Connected ──
        let key = self.keys.current_key();
        let key_frame = Envelope::key_distribution(&key).to_frame()?;
        if handle.try_deliver(key_frame) != Delivery::Queued {
            return Err(SessionError::ConnectionClosed);
        }
        *state = ConnectionState::KeySent;

        loop {
            let envelope = tokio::select! {
                _ = handle.evicted() => {
                    tracing::info!(conn_id = %handle.id(), username = ?username, "session evicted");
                    return Ok(());
                }
                read = reader.read_envelope() => match read? {
                    Some(envelope) => envelope,
                    None if *state == ConnectionState::KeySent => {
                        return Err(SessionError::ConnectionClosed);
                    }
                    None => return Ok(()),
                },
            };

            match (*state, envelope) {
                // ── KeySent ──
                (ConnectionState::KeySent, Envelope::Register { username: requested }) => {
                    let name = validate_username(&requested)
                        .map_err(|e| SessionError::violation(state.as_str(), e.to_string()))?
                        .to_string();

                    if let Some(replaced) = self.registry.register(&name, handle.clone()).await {
                        tracing::info!(
                            username = %name,
                            old_conn_id = %replaced.id(),
                            new_conn_id = %handle.id(),
                            "username re-registered, evicting older session"
                        );
                        replaced.evict();
                    }
                    *state = ConnectionState::Registered;
                    tracing::info!(username = %name, conn_id = %handle.id(), "user registered");

                    self.notice(&name, &format!("~~{name} joined the chat")).await;
                    *username = Some(name);
                }

                // ── Registered ──
                (
                    ConnectionState::Registered,
                    Envelope::ChatMessage {
                        username: claimed,
                        ciphertext,
                        timestamp,
                    },
                ) => {
                    let Some(name) = username.as_deref() else {
                        return Err(SessionError::violation(state.as_str(), "no username bound"));
                    };
                    if claimed != name {
                        tracing::warn!(
                            username = name,
                            claimed = %claimed,
                            "chat message carried a different username, relaying as registered"
                        );
                    }

                    let envelope = Envelope::ChatMessage {
                        username: name.to_string(),
                        ciphertext,
                        timestamp,
                    };
                    let report = broadcast::relay(&self.registry, &envelope, name).await?;
                    tracing::debug!(
                        username = name,
                        delivered = report.delivered,
                        dropped = report.dropped,
                        "message relayed"
                    );
                }

                (ConnectionState::Registered, Envelope::Disconnect) => {
                    tracing::debug!(username = ?username, "client logged out");
                    return Ok(());
                }

                (current, other) => {
                    return Err(SessionError::violation(
                        current.as_str(),
                        format!("unexpected {} envelope", other.kind()),
                    ));
                }
            }
        }
    }

    /// Encrypted notice from the relay itself to everyone but `subject`.
    async fn notice(&self, subject: &str, text: &str) {
        let key = self.keys.current_key();
        let envelope = match Envelope::system_notice(&key, text) {
            Ok(envelope) => envelope,
            Err(e) => {
                tracing::warn!(error = %e, "failed to seal system notice");
                return;
            }
        };
        match broadcast::relay(&self.registry, &envelope, subject).await {
            Ok(report) => tracing::debug!(
                delivered = report.delivered,
                dropped = report.dropped,
                text,
                "system notice sent"
            ),
            Err(e) => tracing::warn!(error = %e, "failed to encode system notice"),
        }
    }
}

/// Sole writer for a connection: flushes queued frames until every sender
/// is gone, then shuts the stream down.
async fn write_loop<W>(mut writer: WriteHalf<W>, mut outbound: mpsc::Receiver<Bytes>) -> std::io::Result<()>
where
    W: AsyncWrite,
{
    while let Some(frame) = outbound.recv().await {
        writer.write_all(&frame).await?;
        writer.flush().await?;
    }
    writer.shutdown().await
}
