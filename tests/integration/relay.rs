use crate::*;

use parley_core::SYSTEM_SENDER;

/// The classic two-user session: join notice, messages both ways, no echo,
/// leave notice.
#[tokio::test]
async fn test_alice_and_bob_chat() -> Result<()> {
    let relay = start_relay("alice-bob").await?;

    let (mut alice, mut alice_events) = join(&relay, "alice").await?;
    let (mut bob, mut bob_events) = join(&relay, "bob").await?;
    assert_eq!(alice.key_fingerprint(), bob.key_fingerprint());
    assert_eq!(alice.key_fingerprint(), relay.keys.current_key().fingerprint());

    assert_eq!(
        message(next_event(&mut alice_events).await),
        (SYSTEM_SENDER.to_string(), "~~bob joined the chat".to_string())
    );

    bob.send("hi").await?;
    assert_eq!(
        message(next_event(&mut alice_events).await),
        ("bob".to_string(), "hi".to_string())
    );

    alice.send("hello").await?;
    // bob's first event is alice's reply, not his own "hi"
    assert_eq!(
        message(next_event(&mut bob_events).await),
        ("alice".to_string(), "hello".to_string())
    );
    assert!(drain(&mut alice_events, Duration::from_millis(200)).await.is_empty());

    alice.close().await?;
    assert_eq!(
        message(next_event(&mut bob_events).await),
        (SYSTEM_SENDER.to_string(), "~~alice left the chat".to_string())
    );
    let registry = &relay.registry;
    wait_for(move || async move { !registry.contains("alice").await }).await?;
    assert_eq!(relay.registry.usernames().await, ["bob"]);
    assert!(bob.is_connected());
    Ok(())
}

/// With several clients online a message reaches each of the others exactly
/// once and never the sender.
#[tokio::test]
async fn test_fan_out_exactly_once() -> Result<()> {
    let relay = start_relay("fan-out").await?;
    let names = ["ann", "ben", "cat", "dan"];

    let mut clients = Vec::new();
    for name in names {
        clients.push(join(&relay, name).await?);
    }
    // Settle the join notices first
    for (_, events) in clients.iter_mut() {
        drain(events, Duration::from_millis(200)).await;
    }

    clients[1].0.send("one for all").await?;

    for (i, (_, events)) in clients.iter_mut().enumerate() {
        let got: Vec<_> = drain(events, Duration::from_millis(300))
            .await
            .into_iter()
            .map(message)
            .collect();
        if i == 1 {
            assert!(got.is_empty(), "sender got {got:?}");
        } else {
            assert_eq!(got, [("ben".to_string(), "one for all".to_string())]);
        }
    }
    Ok(())
}

/// N clients registering at once produce N entries with distinct ids.
#[tokio::test]
async fn test_concurrent_registrations() -> Result<()> {
    const N: usize = 16;
    let relay = std::sync::Arc::new(start_relay("concurrent").await?);

    let mut tasks = Vec::new();
    for i in 0..N {
        let relay = relay.clone();
        tasks.push(tokio::spawn(async move {
            let tls = client_config(Some(&relay.cert_path))?;
            connect("127.0.0.1", relay.addr.port(), &format!("user{i:02}"), tls)
                .await
                .map_err(anyhow::Error::from)
        }));
    }
    let mut sessions = Vec::new();
    for task in tasks {
        sessions.push(task.await??);
    }

    let registry = &relay.registry;
    wait_for(move || async move { registry.len().await == N }).await?;
    let names: Vec<String> = (0..N).map(|i| format!("user{i:02}")).collect();
    assert_eq!(relay.registry.usernames().await, names);

    let mut ids = ids_of(&relay.registry, &names).await;
    ids.sort();
    ids.dedup();
    assert_eq!(ids.len(), N);
    Ok(())
}

/// The relay forwards whatever ciphertext it gets; it never needs to read it.
#[tokio::test]
async fn test_relay_does_not_open_messages() -> Result<()> {
    let relay = start_relay("opaque").await?;
    let (_alice, mut alice_events) = join(&relay, "alice").await?;

    let mut raw = RawPeer::connect(&relay).await?;
    raw.send(&Envelope::register("bob")).await?;
    let _ = next_event(&mut alice_events).await; // join notice

    raw.send(&Envelope::ChatMessage {
        username: "bob".into(),
        ciphertext: "00".repeat(40),
        timestamp: 1,
    })
    .await?;

    // alice cannot open it either, but the relay delivered it
    assert!(matches!(
        next_event(&mut alice_events).await,
        ChatEvent::Diagnostic(_)
    ));
    assert!(relay.registry.contains("bob").await);
    Ok(())
}
