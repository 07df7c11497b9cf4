use crate::*;

/// Without a pinned certificate the client accepts the relay's self-signed
/// certificate.
#[tokio::test]
async fn test_accept_any_certificate_mode() -> Result<()> {
    let relay = start_relay("accept-any").await?;

    let (alice, _events) = connect("127.0.0.1", relay.addr.port(), "alice", client_config(None)?).await?;
    assert_eq!(alice.key_fingerprint(), relay.keys.current_key().fingerprint());

    let registry = &relay.registry;
    wait_for(move || async move { registry.contains("alice").await }).await?;
    Ok(())
}

/// Pinning a certificate the relay does not hold fails the handshake and
/// never reaches registration.
#[tokio::test]
async fn test_pinned_mode_rejects_other_certificate() -> Result<()> {
    let relay = start_relay("pinned-wrong").await?;
    let (other_dir, other) = cert_dir("pinned-other")?;

    let tls = client_config(Some(&other.cert_path))?;
    let result = connect("127.0.0.1", relay.addr.port(), "mallory", tls).await;
    assert!(result.is_err(), "handshake should fail against a different certificate");
    assert!(relay.registry.is_empty().await);

    let _ = std::fs::remove_dir_all(&other_dir);
    Ok(())
}

/// The provisioned certificate names `localhost`, so clients using the
/// default host name verify too.
#[tokio::test]
async fn test_pinned_mode_by_host_name() -> Result<()> {
    let relay = start_relay("pinned-localhost").await?;

    let tls = client_config(Some(&relay.cert_path))?;
    let (session, _events) = connect("localhost", relay.addr.port(), "alice", tls).await?;
    assert!(session.is_connected());
    Ok(())
}
