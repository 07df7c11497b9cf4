//! parley-chat: terminal client for a Parley relay.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;

use parley_core::config::{ClientConfig, ParleyConfig};
use parley_services::client::{connect, ChatEvent, ClientSession};
use parley_services::{client_config, spawn_line_reader};

/// How long queued events may take to print once the send loop has ended.
const PRINTER_GRACE: Duration = Duration::from_millis(500);

fn print_usage() {
    println!("Usage: parley-chat [--host <host>] [--port <port>] [--ca-cert <path>] [username]");
    println!();
    println!("Options:");
    println!("  --host <host>      Relay host (default: localhost)");
    println!("  --port <port>      Relay port (default: {})", parley_core::config::DEFAULT_PORT);
    println!("  --ca-cert <path>   Trust only this certificate for the relay");
    println!();
    println!("Without a username the client asks for host, port and username.");
}

/// Command-line flags on top of the loaded config. Returns `false` when only
/// usage was requested.
fn apply_args(config: &mut ClientConfig, args: &[String]) -> Result<bool> {
    let mut i = 0;
    while i < args.len() {
        match args[i].as_str() {
            "--host" => {
                i += 1;
                config.host = args.get(i).context("--host requires a value")?.clone();
            }
            "--port" => {
                i += 1;
                config.port = args
                    .get(i)
                    .context("--port requires a value")?
                    .parse()
                    .context("--port must be a number")?;
            }
            "--ca-cert" => {
                i += 1;
                config.ca_cert = Some(PathBuf::from(
                    args.get(i).context("--ca-cert requires a value")?,
                ));
            }
            "help" | "--help" | "-h" => return Ok(false),
            flag if flag.starts_with("--") => anyhow::bail!("unknown option: {flag}"),
            name => config.username = name.to_string(),
        }
        i += 1;
    }
    Ok(true)
}

async fn prompt(input: &mut mpsc::Receiver<String>, label: &str) -> Result<String> {
    let mut stdout = tokio::io::stdout();
    stdout.write_all(label.as_bytes()).await?;
    stdout.flush().await?;

    let line = input.recv().await.context("input closed")?;
    Ok(line.trim().to_string())
}

/// Ask for host, port and username, offering the configured values.
async fn ask_connection_details(
    input: &mut mpsc::Receiver<String>,
    config: &mut ClientConfig,
) -> Result<()> {
    let host = prompt(input, &format!("Server [{}]: ", config.host)).await?;
    if !host.is_empty() {
        config.host = host;
    }
    let port = prompt(input, &format!("Port [{}]: ", config.port)).await?;
    if !port.is_empty() {
        config.port = port.parse().context("port must be a number")?;
    }
    config.username = prompt(input, "Username: ").await?;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let mut config = ParleyConfig::load()
        .unwrap_or_else(|e| {
            tracing::warn!(error = %e, "failed to load config, using defaults");
            ParleyConfig::default()
        })
        .client;

    let args: Vec<String> = std::env::args().skip(1).collect();
    if !apply_args(&mut config, &args)? {
        print_usage();
        return Ok(());
    }

    let mut input = spawn_line_reader(std::io::BufReader::new(std::io::stdin()));
    if config.username.trim().is_empty() {
        println!("=============== PARLEY SECURE CHAT ===============\n");
        ask_connection_details(&mut input, &mut config).await?;
    }
    if config.username.trim().is_empty() {
        anyhow::bail!("a username is required");
    }

    let tls = client_config(config.ca_cert.as_deref()).context("failed to build TLS config")?;
    let (session, events) = connect(&config.host, config.port, &config.username, tls)
        .await
        .with_context(|| format!("failed to join relay at {}:{}", config.host, config.port))?;

    println!("\nSecure chat started as: {}", session.username());
    println!("Key fingerprint: {}", session.key_fingerprint());
    println!("Type '{}' to leave\n", config.quit_command);

    tokio::select! {
        _ = chat(session, events, input, &config.quit_command) => {}
        _ = tokio::signal::ctrl_c() => {
            println!("\nDisconnecting...");
        }
    }

    println!("Connection closed");
    Ok(())
}

/// Print incoming events while sending input lines, until the user quits,
/// input ends, or the relay goes away.
async fn chat<S>(
    session: ClientSession<S>,
    mut events: mpsc::Receiver<ChatEvent>,
    input: mpsc::Receiver<String>,
    quit_command: &str,
) where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let mut printer = tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            println!("{event}");
            if matches!(event, ChatEvent::Disconnected(_)) {
                break;
            }
        }
    });

    if let Err(e) = session.run_send_loop(input, quit_command).await {
        eprintln!("Send failed: {e}");
    }

    // Let the disconnect notice print
    if tokio::time::timeout(PRINTER_GRACE, &mut printer).await.is_err() {
        printer.abort();
    }
}
