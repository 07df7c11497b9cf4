//! parleyd: Parley chat relay.

use std::net::SocketAddr;

use anyhow::{Context, Result};

use parley_core::config::ParleyConfig;
use parley_core::KeyProvider;
use parley_services::{ensure_certificate, load_server_config, RelayServer};

fn print_usage() {
    println!("Usage: parleyd [--host <host>] [--port <port>]");
    println!();
    println!("Options:");
    println!("  --host <host>   Address or host name to listen on (overrides config)");
    println!("  --port <port>   Port to listen on (overrides config)");
    println!();
    println!("Config file: {}", ParleyConfig::file_path().display());
}

/// Apply command-line flags on top of the loaded config.
/// Returns `false` when only usage was requested.
fn apply_args(config: &mut ParleyConfig, args: &[String]) -> Result<bool> {
    let mut i = 0;
    while i < args.len() {
        match args[i].as_str() {
            "--host" => {
                i += 1;
                config.server.host = args.get(i).context("--host requires a value")?.clone();
            }
            "--port" => {
                i += 1;
                config.server.port = args
                    .get(i)
                    .context("--port requires a value")?
                    .parse()
                    .context("--port must be a number")?;
            }
            "help" | "--help" | "-h" => return Ok(false),
            other => anyhow::bail!("unknown argument: {other}"),
        }
        i += 1;
    }
    Ok(true)
}

/// Resolve the configured listen host, which may be a name such as
/// `localhost` or a literal address.
async fn listen_addr(host: &str, port: u16) -> Result<SocketAddr> {
    tokio::net::lookup_host((host, port))
        .await
        .with_context(|| format!("failed to resolve listen address {host:?}"))?
        .next()
        .with_context(|| format!("listen address {host:?} resolved to nothing"))
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    // Load config
    if let Err(e) = ParleyConfig::write_default_if_missing() {
        tracing::warn!(error = %e, "failed to write default config");
    }
    let mut config = ParleyConfig::load().unwrap_or_else(|e| {
        tracing::warn!(error = %e, "failed to load config, using defaults");
        ParleyConfig::default()
    });

    let args: Vec<String> = std::env::args().skip(1).collect();
    if !apply_args(&mut config, &args)? {
        print_usage();
        return Ok(());
    }

    // Certificate
    if ensure_certificate(&config.tls).context("failed to provision TLS certificate")? {
        tracing::info!(cert = %config.tls.cert_path.display(), "clients may pin this certificate");
    }
    let tls = load_server_config(&config.tls).context("failed to load TLS certificate")?;

    // Shared key
    let keys = KeyProvider::generate();
    tracing::info!(fingerprint = %keys.current_key().fingerprint(), "session key ready");

    let addr = listen_addr(&config.server.host, config.server.port).await?;
    let server = RelayServer::bind(addr, tls, keys, &config.server)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;

    // ── Shutdown channel ─────────────────────────────────────────────────────
    let (shutdown_tx, _) = tokio::sync::broadcast::channel::<()>(1);
    let shutdown_rx = shutdown_tx.subscribe();
    {
        let shutdown = shutdown_tx.clone();
        tokio::spawn(async move {
            tokio::signal::ctrl_c().await.ok();
            tracing::info!("shutdown signal received");
            let _ = shutdown.send(());
        });
    }

    server.run(shutdown_rx).await?;
    tracing::info!("parleyd stopped");
    Ok(())
}
