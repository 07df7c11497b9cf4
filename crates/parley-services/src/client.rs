//! Client side of a relay session.
//!
//! `establish` runs the one-time handshake (receive the key, register) and
//! then splits the stream: a spawned receive task owns the read half and
//! reports `ChatEvent`s, the returned `ClientSession` owns the write half.

use std::fmt;
use std::io::BufRead;
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, WriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio_rustls::client::TlsStream;

use parley_core::envelope::validate_username;
use parley_core::wire::DEFAULT_MAX_FRAME_LEN;
use parley_core::{Envelope, SymmetricKey};

use crate::framed::{write_envelope, FramedReader};
use crate::SessionError;

/// Client end of a TLS connection to the relay.
pub type RelayStream = TlsStream<TcpStream>;

/// Events buffered between the receive task and the UI.
const EVENT_QUEUE_DEPTH: usize = 256;

/// Input lines buffered ahead of the send loop.
const INPUT_QUEUE_DEPTH: usize = 16;

/// Something the user should see.
///
/// `Display` renders messages as `[HH:MM:SS] user: text` with the clock in
/// UTC, not the local zone.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChatEvent {
    Message {
        /// Unix milliseconds as stamped by the sender.
        timestamp: u64,
        username: String,
        text: String,
    },
    /// A message that could not be shown. The session continues.
    Diagnostic(String),
    /// The connection is gone, with the reason if it failed.
    Disconnected(Option<String>),
}

impl fmt::Display for ChatEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Message {
                timestamp,
                username,
                text,
            } => write!(f, "[{}] {username}: {text}", clock(*timestamp)),
            Self::Diagnostic(detail) => write!(f, "! {detail}"),
            Self::Disconnected(None) => f.write_str("* disconnected from server"),
            Self::Disconnected(Some(reason)) => write!(f, "* disconnected from server: {reason}"),
        }
    }
}

/// `HH:MM:SS` for a Unix millisecond timestamp. Always UTC, whatever the
/// host's zone.
fn clock(millis: u64) -> String {
    let secs = (millis / 1000) % 86_400;
    format!("{:02}:{:02}:{:02}", secs / 3600, (secs / 60) % 60, secs % 60)
}

pub struct ClientSession<S> {
    username: String,
    key: Arc<SymmetricKey>,
    writer: WriteHalf<S>,
    connected: watch::Receiver<bool>,
}

impl<S> ClientSession<S>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    /// Receive the shared key, register `username`, and start the receive
    /// task. Any failure here aborts the session.
    pub async fn establish(
        stream: S,
        username: &str,
    ) -> Result<(Self, mpsc::Receiver<ChatEvent>), SessionError> {
        let username = validate_username(username)
            .map_err(|e| SessionError::violation("handshake", e.to_string()))?
            .to_string();

        let (read_half, mut writer) = tokio::io::split(stream);
        let mut reader = FramedReader::new(read_half, DEFAULT_MAX_FRAME_LEN);

        let key = match reader.read_envelope().await? {
            Some(Envelope::KeyDistribution { key }) => Arc::new(SymmetricKey::from_hex(&key)?),
            Some(other) => {
                return Err(SessionError::violation(
                    "handshake",
                    format!("expected key_distribution, got {}", other.kind()),
                ));
            }
            None => return Err(SessionError::ConnectionClosed),
        };
        tracing::debug!(fingerprint = %key.fingerprint(), "received session key");

        write_envelope(&mut writer, &Envelope::register(username.as_str())).await?;
        tracing::info!(username = %username, "registered");

        let (events_tx, events_rx) = mpsc::channel(EVENT_QUEUE_DEPTH);
        let (connected_tx, connected_rx) = watch::channel(true);
        tokio::spawn(receive_loop(reader, key.clone(), events_tx, connected_tx));

        Ok((
            Self {
                username,
                key,
                writer,
                connected: connected_rx,
            },
            events_rx,
        ))
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    /// Fingerprint of the shared key, for comparing with the server log.
    pub fn key_fingerprint(&self) -> String {
        self.key.fingerprint()
    }

    pub fn is_connected(&self) -> bool {
        *self.connected.borrow()
    }

    /// Encrypt and send one chat line.
    pub async fn send(&mut self, text: &str) -> Result<(), SessionError> {
        if !self.is_connected() {
            return Err(SessionError::ConnectionClosed);
        }
        let envelope = Envelope::chat(&self.username, &self.key, text)?;
        write_envelope(&mut self.writer, &envelope).await
    }

    /// Send each non-empty input line until `quit_command` (any case), end
    /// of input, or the connection drops. Closes the session on return.
    /// Lines usually come from [`spawn_line_reader`].
    pub async fn run_send_loop(
        mut self,
        mut lines: mpsc::Receiver<String>,
        quit_command: &str,
    ) -> Result<(), SessionError> {
        let mut outcome = Ok(());

        loop {
            let line = tokio::select! {
                _ = disconnected(self.connected.clone()) => break,
                line = lines.recv() => match line {
                    Some(line) => line,
                    None => break,
                },
            };

            let text = line.trim();
            if text.is_empty() {
                continue;
            }
            if text.eq_ignore_ascii_case(quit_command) {
                break;
            }
            if let Err(e) = self.send(text).await {
                outcome = Err(e);
                break;
            }
        }

        if let Err(e) = self.close().await {
            tracing::debug!(error = %e, "close after send loop failed");
        }
        outcome
    }

    /// Log out and shut the stream down.
    pub async fn close(mut self) -> Result<(), SessionError> {
        if self.is_connected() {
            write_envelope(&mut self.writer, &Envelope::Disconnect).await?;
        }
        self.writer.shutdown().await?;
        Ok(())
    }
}

/// Read lines from a blocking source on a dedicated OS thread.
///
/// The thread is detached: a pending read on it never keeps the runtime or
/// the process alive. The channel closes at end of input or on a read error.
pub fn spawn_line_reader<R>(input: R) -> mpsc::Receiver<String>
where
    R: BufRead + Send + 'static,
{
    let (tx, rx) = mpsc::channel(INPUT_QUEUE_DEPTH);
    let spawned = std::thread::Builder::new()
        .name("parley-input".into())
        .spawn(move || {
            for line in input.lines() {
                match line {
                    Ok(line) => {
                        if tx.blocking_send(line).is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        tracing::debug!(error = %e, "input read failed");
                        break;
                    }
                }
            }
        });
    if let Err(e) = spawned {
        tracing::warn!(error = %e, "failed to start input thread");
    }
    rx
}

async fn disconnected(mut connected: watch::Receiver<bool>) {
    let _ = connected.wait_for(|up| !*up).await;
}

async fn receive_loop<R>(
    mut reader: FramedReader<R>,
    key: Arc<SymmetricKey>,
    events: mpsc::Sender<ChatEvent>,
    connected: watch::Sender<bool>,
) where
    R: AsyncRead + Unpin,
{
    let reason = loop {
        let event = match reader.read_envelope().await {
            Ok(Some(Envelope::ChatMessage {
                username,
                ciphertext,
                timestamp,
            })) => match key.open_text(&ciphertext) {
                Ok(text) => ChatEvent::Message {
                    timestamp,
                    username,
                    text,
                },
                Err(e) => ChatEvent::Diagnostic(format!("unreadable message from {username}: {e}")),
            },
            Ok(Some(other)) => {
                ChatEvent::Diagnostic(format!("ignored unexpected {} envelope", other.kind()))
            }
            Ok(None) => break None,
            Err(SessionError::Decode(e)) if !e.is_framing() => {
                ChatEvent::Diagnostic(format!("malformed envelope: {e}"))
            }
            Err(e) => break Some(e.to_string()),
        };
        if events.send(event).await.is_err() {
            tracing::debug!("event receiver dropped");
        }
    };

    tracing::info!(reason = ?reason, "connection to relay lost");
    connected.send_replace(false);
    let _ = events.send(ChatEvent::Disconnected(reason)).await;
}

/// TLS connect to the relay and establish a session.
pub async fn connect(
    host: &str,
    port: u16,
    username: &str,
    tls: Arc<rustls::ClientConfig>,
) -> Result<(ClientSession<RelayStream>, mpsc::Receiver<ChatEvent>), SessionError> {
    let stream = crate::tls::connect(host, port, tls).await?;
    ClientSession::establish(stream, username).await
}
