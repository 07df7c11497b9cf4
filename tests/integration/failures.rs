use crate::*;

use tokio::io::AsyncWriteExt;

use parley_core::SYSTEM_SENDER;

/// A client that vanishes without logging out is removed and announced.
#[tokio::test]
async fn test_abrupt_disconnect_removes_user() -> Result<()> {
    let relay = start_relay("abrupt").await?;
    let (_bob, mut bob_events) = join(&relay, "bob").await?;

    let mut alice = RawPeer::connect(&relay).await?;
    alice.send(&Envelope::register("alice")).await?;
    assert_eq!(
        message(next_event(&mut bob_events).await).1,
        "~~alice joined the chat"
    );

    drop(alice);

    assert_eq!(
        message(next_event(&mut bob_events).await),
        (SYSTEM_SENDER.to_string(), "~~alice left the chat".to_string())
    );
    let registry = &relay.registry;
    wait_for(move || async move { !registry.contains("alice").await }).await?;
    assert!(relay.registry.contains("bob").await);
    Ok(())
}

/// Garbage on one connection closes that connection and nothing else.
#[tokio::test]
async fn test_malformed_frame_is_isolated() -> Result<()> {
    let relay = start_relay("malformed").await?;
    let (_bob, mut bob_events) = join(&relay, "bob").await?;
    let (mut carol, _carol_events) = join(&relay, "carol").await?;
    drain(&mut bob_events, Duration::from_millis(200)).await;

    let mut rogue = RawPeer::connect(&relay).await?;
    rogue.writer.write_all(b"\x00\x01 this is not a parley frame").await?;
    rogue.writer.flush().await?;
    assert!(rogue.closed_by_relay().await);

    carol.send("still works").await?;
    assert_eq!(
        message(next_event(&mut bob_events).await),
        ("carol".to_string(), "still works".to_string())
    );
    assert_eq!(relay.registry.usernames().await, ["bob", "carol"]);
    Ok(())
}

/// An envelope that is wrong for the connection's state is a protocol
/// violation for that connection only.
#[tokio::test]
async fn test_out_of_sequence_envelopes() -> Result<()> {
    let relay = start_relay("sequence").await?;
    let (_bob, _bob_events) = join(&relay, "bob").await?;

    // Chat before registering
    let mut early = RawPeer::connect(&relay).await?;
    early
        .send(&Envelope::chat("ghost", &relay.keys.current_key(), "boo")?)
        .await?;
    assert!(early.closed_by_relay().await);

    // Registering twice
    let mut twice = RawPeer::connect(&relay).await?;
    twice.send(&Envelope::register("dave")).await?;
    twice.send(&Envelope::register("dave-again")).await?;
    assert!(twice.closed_by_relay().await);

    let registry = &relay.registry;
    wait_for(move || async move { !registry.contains("dave").await }).await?;
    assert_eq!(relay.registry.usernames().await, ["bob"]);
    Ok(())
}

/// A second registration under a taken name wins; the older connection is
/// closed and cannot remove the newer entry.
#[tokio::test]
async fn test_reregistration_replaces_older_session() -> Result<()> {
    let relay = start_relay("replace").await?;

    let (old, mut old_events) = join(&relay, "alice").await?;
    let old_id = relay.registry.current_id("alice").await;
    let (_new, mut new_events) = join(&relay, "alice").await?;
    let new_id = relay.registry.current_id("alice").await;
    assert_ne!(old_id, new_id);

    // The relay evicts the old connection
    loop {
        if let ChatEvent::Disconnected(_) = next_event(&mut old_events).await {
            break;
        }
    }
    assert!(!old.is_connected());
    assert_eq!(relay.registry.current_id("alice").await, new_id);
    assert_eq!(relay.registry.len().await, 1);

    let (mut bob, _bob_events) = join(&relay, "bob").await?;
    let _ = next_event(&mut new_events).await; // bob's join notice
    bob.send("which alice?").await?;
    assert_eq!(
        message(next_event(&mut new_events).await),
        ("bob".to_string(), "which alice?".to_string())
    );
    Ok(())
}

/// Plain TCP clients and stalled handshakes do not disturb the relay.
#[tokio::test]
async fn test_failed_handshakes_are_contained() -> Result<()> {
    let relay = start_relay_with(
        "handshake",
        ServerConfig {
            handshake_timeout_secs: 1,
            ..ServerConfig::default()
        },
    )
    .await?;

    let mut plain = plain_tcp(&relay).await?;
    plain.write_all(b"hello?\n").await?;
    let _stalled = plain_tcp(&relay).await?;

    let (mut alice, _alice_events) = join(&relay, "alice").await?;
    let (_bob, mut bob_events) = join(&relay, "bob").await?;
    alice.send("made it").await?;
    assert_eq!(
        message(next_event(&mut bob_events).await),
        ("alice".to_string(), "made it".to_string())
    );
    Ok(())
}

/// A client that stops reading is evicted instead of holding up others.
#[tokio::test]
async fn test_stalled_reader_is_evicted() -> Result<()> {
    let relay = start_relay_with(
        "stalled",
        ServerConfig {
            outbound_queue_depth: 2,
            ..ServerConfig::default()
        },
    )
    .await?;

    // Registers but never reads
    let mut sloth = RawPeer::connect(&relay).await?;
    sloth.send(&Envelope::register("sloth")).await?;
    let (mut alice, _alice_events) = join(&relay, "alice").await?;

    // Enough to fill the socket buffers and then the queue
    let big = "x".repeat(256 * 1024);
    for _ in 0..32 {
        alice.send(&big).await?;
    }

    let registry = &relay.registry;
    wait_for(move || async move { !registry.contains("sloth").await }).await?;

    let (_bob, mut bob_events) = join(&relay, "bob").await?;
    alice.send("lighter now").await?;
    assert_eq!(
        message(next_event(&mut bob_events).await),
        ("alice".to_string(), "lighter now".to_string())
    );
    drop(sloth);
    Ok(())
}

/// Nobody can register under the relay's own notice sender and forge notices.
#[tokio::test]
async fn test_system_sender_name_is_refused() -> Result<()> {
    let relay = start_relay("system-name").await?;
    let (_bob, mut bob_events) = join(&relay, "bob").await?;

    let mut impostor = RawPeer::connect(&relay).await?;
    impostor.send(&Envelope::register(SYSTEM_SENDER)).await?;
    let forged = Envelope::chat(SYSTEM_SENDER, &relay.keys.current_key(), "~~bob left the chat")?;
    let _ = impostor.send(&forged).await;
    assert!(impostor.closed_by_relay().await);

    assert!(drain(&mut bob_events, Duration::from_millis(300)).await.is_empty());
    assert_eq!(relay.registry.usernames().await, ["bob"]);
    Ok(())
}
