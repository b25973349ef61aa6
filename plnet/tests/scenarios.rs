//! Whole-node scenarios against the in-process broker hub and loopback
//! engines. Two (or more) complete nodes run side by side; only the
//! network and the WebRTC stack are simulated.

use std::sync::{Arc, Mutex};

use plnet::prelude::*;
use plnet::testing::{
    ghost_link, test_node, test_node_with, test_settings, wait_for, BrokerHub, HubIn, LoopbackNet,
};

use plarch::start_logging_filter_level;

fn endpoint() -> BrokerEndpoint {
    BrokerEndpoint::new("ws://hub.test")
}

#[derive(Clone, Default)]
struct Recorder {
    messages: Arc<Mutex<Vec<(String, String, Vec<u8>)>>>,
}

impl Recorder {
    fn callbacks(&self) -> PeerCallbacks {
        let messages = Arc::clone(&self.messages);
        PeerCallbacks::new().on_message(move |channel, from, payload| {
            messages
                .lock()
                .unwrap()
                .push((channel.to_string(), from.to_string(), payload.to_vec()));
        })
    }

    fn count(&self) -> usize {
        self.messages.lock().unwrap().len()
    }

    fn first(&self) -> Option<(String, String, Vec<u8>)> {
        self.messages.lock().unwrap().first().cloned()
    }
}

#[tokio::test]
async fn two_party_connect_and_echo() -> anyhow::Result<()> {
    start_logging_filter_level(vec![], log::LevelFilter::Info);

    let hub = BrokerHub::start()?;
    let net = LoopbackNet::new();
    let alice = test_node(&hub, &net, "alice")?;
    let bob = test_node(&hub, &net, "bob")?;

    let seen_attempt = Arc::new(Mutex::new(None));
    let seen = Arc::clone(&seen_attempt);
    let recorder = Recorder::default();
    bob.allow_incoming_connections(IncomingPolicy::new(
        move |remote, platform, version| {
            *seen.lock().unwrap() = Some((
                remote.to_string(),
                platform.to_string(),
                version.to_string(),
            ));
            true
        },
        recorder.callbacks(),
    ));

    bob.connect_to_broker(endpoint(), BrokerCallbacks::new(), None)
        .await?;
    alice
        .connect_to_broker(endpoint(), BrokerCallbacks::new(), None)
        .await?;

    let peer = alice
        .connect_to_node("bob", PeerCallbacks::new(), None)
        .await
        .expect("direct connection");
    assert!(
        wait_for(
            || alice.is_connected_to_node("bob") && bob.is_connected_to_node("alice"),
            5_000
        )
        .await
    );

    let attempt = seen_attempt.lock().unwrap().clone().expect("predicate ran");
    assert_eq!("alice", attempt.0);
    assert_eq!("rust", attempt.1);

    peer.send("chat", b"hi")?;
    assert!(wait_for(|| recorder.count() == 1, 5_000).await);
    assert_eq!(
        Some(("chat".to_string(), "alice".to_string(), b"hi".to_vec())),
        recorder.first()
    );
    Ok(())
}

#[tokio::test]
async fn refused_attempt_leaves_no_records() -> anyhow::Result<()> {
    start_logging_filter_level(vec![], log::LevelFilter::Info);

    let hub = BrokerHub::start()?;
    let net = LoopbackNet::new();
    let alice = test_node(&hub, &net, "alice")?;
    let bob = test_node(&hub, &net, "bob")?;

    bob.allow_incoming_connections(IncomingPolicy::new(
        |_, _, _| false,
        PeerCallbacks::new(),
    ));
    bob.connect_to_broker(endpoint(), BrokerCallbacks::new(), None)
        .await?;
    alice
        .connect_to_broker(endpoint(), BrokerCallbacks::new(), None)
        .await?;

    let result = alice
        .connect_to_node("bob", PeerCallbacks::new(), None)
        .await;
    assert_eq!(
        Err(ConnectFailedReason::ConnectionRefusedByRemoteNode),
        result.map(|_| ())
    );
    assert!(!alice.is_connected_to_node("bob"));
    assert!(!bob.is_connected_to_node("alice"));

    // A refused attempt doesn't poison later ones.
    bob.allow_incoming_connections(IncomingPolicy::accept_all(PeerCallbacks::new()));
    alice
        .connect_to_node("bob", PeerCallbacks::new(), None)
        .await
        .expect("second attempt");
    Ok(())
}

#[tokio::test]
async fn incoming_connections_disabled_is_reported() -> anyhow::Result<()> {
    start_logging_filter_level(vec![], log::LevelFilter::Info);

    let hub = BrokerHub::start()?;
    let net = LoopbackNet::new();
    let alice = test_node(&hub, &net, "alice")?;
    let bob = test_node(&hub, &net, "bob")?;

    bob.connect_to_broker(endpoint(), BrokerCallbacks::new(), None)
        .await?;
    alice
        .connect_to_broker(endpoint(), BrokerCallbacks::new(), None)
        .await?;

    let result = alice
        .connect_to_node("bob", PeerCallbacks::new(), None)
        .await;
    assert_eq!(
        Err(ConnectFailedReason::ConnectionsNotAllowedOnRemoteNode),
        result.map(|_| ())
    );
    Ok(())
}

#[tokio::test]
async fn simultaneous_bidirectional_attempts_both_connect() -> anyhow::Result<()> {
    start_logging_filter_level(vec![], log::LevelFilter::Info);

    let hub = BrokerHub::start()?;
    let net = LoopbackNet::new();
    let alice = test_node(&hub, &net, "alice")?;
    let bob = test_node(&hub, &net, "bob")?;

    alice.allow_incoming_connections(IncomingPolicy::accept_all(PeerCallbacks::new()));
    bob.allow_incoming_connections(IncomingPolicy::accept_all(PeerCallbacks::new()));
    alice
        .connect_to_broker(endpoint(), BrokerCallbacks::new(), None)
        .await?;
    bob.connect_to_broker(endpoint(), BrokerCallbacks::new(), None)
        .await?;

    let (from_alice, from_bob) = tokio::join!(
        alice.connect_to_node("bob", PeerCallbacks::new(), None),
        bob.connect_to_node("alice", PeerCallbacks::new(), None),
    );
    from_alice.expect("alice's attempt");
    from_bob.expect("bob's attempt");

    assert!(alice.is_connected_to_node("bob"));
    assert!(bob.is_connected_to_node("alice"));
    Ok(())
}

#[tokio::test]
async fn large_message_is_chunked_and_delivered_once() -> anyhow::Result<()> {
    start_logging_filter_level(vec![], log::LevelFilter::Info);

    let hub = BrokerHub::start()?;
    let net = LoopbackNet::new();
    let alice = test_node(&hub, &net, "alice")?;
    let bob = test_node(&hub, &net, "bob")?;

    let recorder = Recorder::default();
    bob.allow_incoming_connections(IncomingPolicy::accept_all(recorder.callbacks()));
    bob.connect_to_broker(endpoint(), BrokerCallbacks::new(), None)
        .await?;
    alice
        .connect_to_broker(endpoint(), BrokerCallbacks::new(), None)
        .await?;

    let peer = alice
        .connect_to_node("bob", PeerCallbacks::new(), None)
        .await
        .expect("direct connection");

    let payload: Vec<u8> = (0..200 * 1024).map(|i| (i % 251) as u8).collect();
    peer.send("bulk", &payload)?;

    assert!(wait_for(|| recorder.count() >= 1, 10_000).await);
    // Exactly one delivery, byte-identical.
    assert_eq!(1, recorder.count());
    let (channel, from, delivered) = recorder.first().unwrap();
    assert_eq!("bulk", channel);
    assert_eq!("alice", from);
    assert_eq!(payload, delivered);
    Ok(())
}

#[tokio::test]
async fn broker_loss_fails_pending_handshakes() -> anyhow::Result<()> {
    start_logging_filter_level(vec![], log::LevelFilter::Info);

    let hub = BrokerHub::start()?;
    let net = LoopbackNet::new();
    let alice = test_node(&hub, &net, "alice")?;

    // A node that is registered at the broker but never answers, so
    // alice's handshake stays in flight.
    hub.post(HubIn::Register {
        node: "ghost".into(),
        auth: None,
        link: ghost_link()?,
    })?;

    alice
        .connect_to_broker(endpoint(), BrokerCallbacks::new(), None)
        .await?;

    let pending = alice.connect_to_node("ghost", PeerCallbacks::new(), None);
    let killer = async {
        plarch::tasks::wait_ms(200).await;
        hub.post(HubIn::Drop {
            node: "alice".into(),
            reason: None,
        })
        .expect("dropping alice");
    };
    let (result, _) = tokio::join!(pending, killer);

    assert_eq!(
        Err(ConnectFailedReason::LocalNodeNotConnectedToBroker),
        result.map(|_| ())
    );
    assert!(wait_for(|| !alice.is_connected_to_broker(), 2_000).await);
    Ok(())
}

#[tokio::test]
async fn socket_relay_works_without_direct_connection() -> anyhow::Result<()> {
    start_logging_filter_level(vec![], log::LevelFilter::Info);

    let hub = BrokerHub::start()?;
    let net = LoopbackNet::new();
    let alice = test_node(&hub, &net, "alice")?;
    let bob = test_node(&hub, &net, "bob")?;

    let received = Arc::new(Mutex::new(None));
    let sink = Arc::clone(&received);
    bob.on_socket_msg("notify", move |from, content| {
        *sink.lock().unwrap() = Some((from.to_string(), content.to_string()));
    });

    bob.connect_to_broker(endpoint(), BrokerCallbacks::new(), None)
        .await?;
    alice
        .connect_to_broker(endpoint(), BrokerCallbacks::new(), None)
        .await?;

    alice.send_socket_msg("bob", "notify", "ping").await?;
    assert!(
        wait_for(|| received.lock().unwrap().is_some(), 5_000).await,
        "relay message never arrived"
    );
    assert_eq!(
        Some(("alice".to_string(), "ping".to_string())),
        received.lock().unwrap().clone()
    );

    // The taxonomy is precise about the failure modes.
    assert_eq!(
        Err(SendSocketError::RemoteNodeNotConnectedToBroker),
        alice.send_socket_msg("nobody", "notify", "ping").await
    );
    assert_eq!(
        Err(SendSocketError::TriedToSendMsgToSelf),
        alice.send_socket_msg("alice", "notify", "ping").await
    );
    assert_eq!(
        Err(SendSocketError::EmptyChannel),
        alice.send_socket_msg("bob", "", "ping").await
    );
    Ok(())
}

#[tokio::test]
async fn broker_rejections_map_to_the_taxonomy() -> anyhow::Result<()> {
    start_logging_filter_level(vec![], log::LevelFilter::Info);

    let hub = BrokerHub::start()?;
    let net = LoopbackNet::new();

    let denied = test_node(&hub, &net, "denied")?;
    let result = denied
        .connect_to_broker(
            BrokerEndpoint::with_auth("ws://hub.test", "deny"),
            BrokerCallbacks::new(),
            None,
        )
        .await;
    assert_eq!(Err(BrokerError::Unauthorized), result);

    let first = test_node(&hub, &net, "twin")?;
    first
        .connect_to_broker(endpoint(), BrokerCallbacks::new(), None)
        .await?;
    let second = test_node(&hub, &net, "twin")?;
    assert_eq!(
        Err(BrokerError::ClientWithSameIdAlreadyConnected),
        second
            .connect_to_broker(endpoint(), BrokerCallbacks::new(), None)
            .await
    );
    Ok(())
}

#[tokio::test]
async fn connect_preconditions_are_checked() -> anyhow::Result<()> {
    start_logging_filter_level(vec![], log::LevelFilter::Info);

    let hub = BrokerHub::start()?;
    let net = LoopbackNet::new();
    let alice = test_node(&hub, &net, "alice")?;
    let bob = test_node(&hub, &net, "bob")?;

    // Not yet connected to the broker.
    assert_eq!(
        Err(ConnectFailedReason::LocalNodeNotConnectedToBroker),
        alice
            .connect_to_node("bob", PeerCallbacks::new(), None)
            .await
            .map(|_| ())
    );

    bob.allow_incoming_connections(IncomingPolicy::accept_all(PeerCallbacks::new()));
    bob.connect_to_broker(endpoint(), BrokerCallbacks::new(), None)
        .await?;
    alice
        .connect_to_broker(endpoint(), BrokerCallbacks::new(), None)
        .await?;

    assert_eq!(
        Err(ConnectFailedReason::TriedToConnectToSelf),
        alice
            .connect_to_node("alice", PeerCallbacks::new(), None)
            .await
            .map(|_| ())
    );

    alice
        .connect_to_node("bob", PeerCallbacks::new(), None)
        .await
        .expect("first connection");
    assert_eq!(
        Err(ConnectFailedReason::AlreadyConnectedToRemoteNode),
        alice
            .connect_to_node("bob", PeerCallbacks::new(), None)
            .await
            .map(|_| ())
    );
    Ok(())
}

#[tokio::test]
async fn negotiation_failure_is_reported() -> anyhow::Result<()> {
    start_logging_filter_level(vec![], log::LevelFilter::Info);

    let hub = BrokerHub::start()?;
    let net = LoopbackNet::new();
    let alice = test_node(&hub, &net, "alice")?;
    let bob = test_node(&hub, &net, "bob")?;

    bob.allow_incoming_connections(IncomingPolicy::accept_all(PeerCallbacks::new()));
    bob.connect_to_broker(endpoint(), BrokerCallbacks::new(), None)
        .await?;
    alice
        .connect_to_broker(endpoint(), BrokerCallbacks::new(), None)
        .await?;

    net.fail_next_negotiation();
    assert_eq!(
        Err(ConnectFailedReason::ConnectionNegotiationError),
        alice
            .connect_to_node("bob", PeerCallbacks::new(), None)
            .await
            .map(|_| ())
    );
    Ok(())
}

#[tokio::test]
async fn are_nodes_connected_reports_per_id() -> anyhow::Result<()> {
    start_logging_filter_level(vec![], log::LevelFilter::Info);

    let hub = BrokerHub::start()?;
    let net = LoopbackNet::new();
    let alice = test_node(&hub, &net, "alice")?;
    let bob = test_node(&hub, &net, "bob")?;

    // Needs an authenticated session first.
    assert_eq!(
        Err(StatusCheckError::NotConnectedToBroker),
        alice.are_nodes_connected(&["bob".to_string()]).await
    );

    alice
        .connect_to_broker(endpoint(), BrokerCallbacks::new(), None)
        .await?;
    bob.connect_to_broker(endpoint(), BrokerCallbacks::new(), None)
        .await?;

    let statuses = alice
        .are_nodes_connected(&["bob".to_string(), "nobody".to_string()])
        .await?;
    assert_eq!(Some(&true), statuses.get("bob"));
    assert_eq!(Some(&false), statuses.get("nobody"));
    Ok(())
}

#[tokio::test]
async fn user_disconnect_tears_everything_down() -> anyhow::Result<()> {
    start_logging_filter_level(vec![], log::LevelFilter::Info);

    let hub = BrokerHub::start()?;
    let net = LoopbackNet::new();
    let alice = test_node(&hub, &net, "alice")?;
    let bob = test_node(&hub, &net, "bob")?;

    let disconnected = Arc::new(Mutex::new(vec![]));
    let sink = Arc::clone(&disconnected);
    bob.allow_incoming_connections(IncomingPolicy::accept_all(
        PeerCallbacks::new().on_disconnected(move |remote| {
            sink.lock().unwrap().push(remote.to_string());
        }),
    ));
    bob.connect_to_broker(endpoint(), BrokerCallbacks::new(), None)
        .await?;
    alice
        .connect_to_broker(endpoint(), BrokerCallbacks::new(), None)
        .await?;
    alice
        .connect_to_node("bob", PeerCallbacks::new(), None)
        .await
        .expect("direct connection");

    alice.disconnect_from_broker().await;
    assert!(!alice.is_connected_to_broker());
    assert!(wait_for(|| !alice.is_connected_to_node("bob"), 2_000).await);

    // Bob's side notices the closed engine and fires its callback.
    assert!(
        wait_for(|| disconnected.lock().unwrap().contains(&"alice".to_string()), 5_000).await
    );
    Ok(())
}

#[tokio::test]
async fn unsolicited_broker_loss_triggers_reconnection() -> anyhow::Result<()> {
    start_logging_filter_level(vec![], log::LevelFilter::Info);

    let hub = BrokerHub::start()?;
    let net = LoopbackNet::new();
    let mut settings = test_settings();
    settings.reconnect.enabled = true;
    settings.reconnect.base = std::time::Duration::from_millis(200);
    let alice = test_node_with(&hub, &net, "alice", settings)?;

    let reconnecting = Arc::new(Mutex::new(0u32));
    let counter = Arc::clone(&reconnecting);
    alice
        .connect_to_broker(
            endpoint(),
            BrokerCallbacks::new().on_reconnecting(move || {
                *counter.lock().unwrap() += 1;
            }),
            None,
        )
        .await?;
    assert!(alice.is_connected_to_broker());

    hub.post(HubIn::Drop {
        node: "alice".into(),
        reason: None,
    })?;

    assert!(wait_for(|| !alice.is_connected_to_broker(), 2_000).await);
    assert!(
        wait_for(|| alice.is_connected_to_broker(), 5_000).await,
        "node never re-authenticated"
    );
    assert_eq!(1, *reconnecting.lock().unwrap());
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn sync_facades_block_on_the_guard() -> anyhow::Result<()> {
    start_logging_filter_level(vec![], log::LevelFilter::Info);

    let hub = BrokerHub::start()?;
    let net = LoopbackNet::new();
    let alice = test_node(&hub, &net, "alice")?;
    let bob = test_node(&hub, &net, "bob")?;

    bob.allow_incoming_connections(IncomingPolicy::accept_all(PeerCallbacks::new()));
    bob.connect_to_broker(endpoint(), BrokerCallbacks::new(), None)
        .await?;

    // Drive the blocking API from a plain thread, as an embedding
    // application would.
    let worker = std::thread::spawn(move || {
        alice.connect_to_broker_sync(endpoint(), BrokerCallbacks::new(), None)?;
        let results = alice.connect_to_many_sync(
            &["bob".to_string(), "alice".to_string()],
            PeerCallbacks::new(),
            None,
        );
        alice.disconnect_from_broker_sync();
        Ok::<_, BrokerError>(results)
    });
    let results = worker.join().expect("worker thread")?;

    assert_eq!(Some(&Ok(())), results.get("bob"));
    assert_eq!(
        Some(&Err(ConnectFailedReason::TriedToConnectToSelf)),
        results.get("alice")
    );
    Ok(())
}
