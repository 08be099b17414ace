//! Peer session end-to-end tests
//!
//! Sessions negotiate through a real relay; the mock network stands in for
//! ICE/DTLS/SCTP and delivers data-channel payloads in process.
//!
//! ## Test Scenarios
//!
//! 1. Identity-addressed connect, text and binary delivery
//! 2. Local size cap on queued and direct sends
//! 3. Channel rendezvous with relay-chosen offerer
//! 4. ICE candidates: exchange, channel addressing, early buffering
//! 5. Establishment failures: rejected offer/answer/candidate, silent peer, unknown peer
//! 6. Remote max-message-size discovery, debug snapshot, close

mod harness;

use harness::{
    connected_pair, expect_notification, init_test_tracing, wait_for_candidates, wait_for_state,
    HarnessResult, RelayHarness, WAIT,
};
use peerlink::peer::{ConnectionState, DataChannelState, PeerConnection};
use peerlink::signaling::protocol::{DeliveredSignal, IceCandidate};
use peerlink::signaling::{Notification, SignalPayload};
use peerlink::{ChannelId, Destination, Error, Payload, PeerId, SessionState};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::info;

async fn recv(rx: &mut mpsc::UnboundedReceiver<Payload>) -> Payload {
    tokio::time::timeout(WAIT, rx.recv())
        .await
        .expect("payload within the wait bound")
        .expect("incoming stream open")
}

// =============================================================================
// Delivery
// =============================================================================

#[tokio::test]
async fn test_text_delivered_exactly_once() -> HarnessResult<()> {
    init_test_tracing();
    let harness = RelayHarness::start().await?;
    let (alice, bob) = connected_pair(&harness, "A", "B").await?;
    let mut incoming = bob.take_incoming().unwrap();

    alice.send_async("hi").await?;
    assert_eq!(recv(&mut incoming).await, Payload::from("hi"));

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(incoming.try_recv().is_err());

    assert_eq!(alice.state(), SessionState::Open);
    assert_eq!(bob.remote(), Some(Destination::Peer(PeerId::parse("A")?)));
    assert_eq!(alice.remote(), Some(Destination::Peer(PeerId::parse("B")?)));

    harness.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn test_binary_payload_at_cap() -> HarnessResult<()> {
    init_test_tracing();
    let harness = RelayHarness::start().await?;
    let (alice, bob) = connected_pair(&harness, "A", "B").await?;
    let mut incoming = bob.take_incoming().unwrap();

    alice.send_async(vec![42u8; 64 * 1024]).await?;
    match recv(&mut incoming).await {
        Payload::Binary(data) => {
            assert_eq!(data.len(), 65536);
            assert!(data.iter().all(|b| *b == 42));
        }
        other => panic!("expected binary payload, got {:?}", other),
    }

    harness.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn test_both_directions_keep_order() -> HarnessResult<()> {
    init_test_tracing();
    let harness = RelayHarness::start().await?;
    let (alice, bob) = connected_pair(&harness, "A", "B").await?;
    let mut at_alice = alice.take_incoming().unwrap();
    let mut at_bob = bob.take_incoming().unwrap();

    for i in 0..20 {
        alice.send_async(format!("a{}", i)).await?;
        bob.send_async(vec![i as u8; i + 1]).await?;
    }
    for i in 0..20 {
        assert_eq!(recv(&mut at_bob).await, Payload::from(format!("a{}", i)));
        assert_eq!(recv(&mut at_alice).await.byte_length(), i + 1);
    }

    harness.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn test_oversized_payload_rejected_with_sizes() -> HarnessResult<()> {
    init_test_tracing();
    let harness = RelayHarness::start().await?;
    let (alice, bob) = connected_pair(&harness, "A", "B").await?;
    let mut incoming = bob.take_incoming().unwrap();

    alice.send_async("x".repeat(65536)).await?;
    assert_eq!(recv(&mut incoming).await.byte_length(), 65536);

    let err = alice.send_async(vec![0u8; 65537]).await.unwrap_err();
    assert_eq!(
        err.to_string(),
        "message too big, allowed are 65536 bytes, but message has 65537 bytes"
    );

    // Multi-byte text is measured in UTF-8 bytes
    let err = alice.send_async("€".repeat(21846)).await.unwrap_err();
    assert!(matches!(err, Error::MessageTooBig { actual: 65538, .. }));

    // The direct path applies the same cap
    assert!(!alice.send(vec![0u8; 65537]).await);
    assert!(alice.send("direct").await);
    assert_eq!(recv(&mut incoming).await, Payload::from("direct"));

    harness.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn test_send_before_open_waits_for_channel() -> HarnessResult<()> {
    init_test_tracing();
    let harness = RelayHarness::start().await?;
    let alice = harness.session("A").await?;
    let bob = harness.session("B").await?;
    let mut incoming = bob.take_incoming().unwrap();

    // Queued before negotiation starts; drained once the channel opens
    let pending = alice.send_async("early");
    let connect = alice.connect("B");
    let (sent, connected) = tokio::join!(pending, connect);
    connected?;
    sent?;
    assert_eq!(recv(&mut incoming).await, Payload::from("early"));

    harness.shutdown().await;
    Ok(())
}

// =============================================================================
// Channel rendezvous
// =============================================================================

#[tokio::test]
async fn test_channel_rendezvous_opens_session() -> HarnessResult<()> {
    init_test_tracing();
    let harness = RelayHarness::start().await?;
    let alice = harness.session("A").await?;
    let bob = harness.session("B").await?;
    let mut at_bob = bob.take_incoming().unwrap();

    assert_eq!(alice.join_channel("room").await?, 1);
    assert_eq!(bob.join_channel("room").await?, 2);
    alice.wait_open(WAIT).await?;
    bob.wait_open(WAIT).await?;

    let room = Destination::Channel(ChannelId::parse("room")?);
    assert_eq!(alice.remote(), Some(room.clone()));
    assert_eq!(bob.remote(), Some(room));

    alice.send_async("over the channel").await?;
    assert_eq!(recv(&mut at_bob).await, Payload::from("over the channel"));

    harness.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn test_full_channel_leaves_session_unbound() -> HarnessResult<()> {
    init_test_tracing();
    let harness = RelayHarness::start().await?;
    let a = harness.session("A").await?;
    let b = harness.session("B").await?;
    let c = harness.session("C").await?;
    a.join_channel("room").await?;
    b.join_channel("room").await?;

    let err = c.join_channel("room").await.unwrap_err();
    assert!(err.is_routing_error());
    assert_eq!(c.remote(), None);
    assert_eq!(c.state(), SessionState::Idle);

    // Free to try another channel
    assert_eq!(c.join_channel("other").await?, 1);

    harness.shutdown().await;
    Ok(())
}

// =============================================================================
// ICE candidates
// =============================================================================

fn signal_kind(value: &serde_json::Value) -> Option<&'static str> {
    serde_json::from_value::<SignalPayload>(value.clone())
        .ok()
        .map(|payload| payload.kind())
}

#[tokio::test]
async fn test_candidates_applied_on_both_sides() -> HarnessResult<()> {
    init_test_tracing();
    let harness = RelayHarness::start().await?;
    let (alice, alice_conn) = harness
        .session_with_connection(harness.session_config(), "A")
        .await?;
    let (bob, bob_conn) = harness
        .session_with_connection(harness.session_config(), "B")
        .await?;

    alice.connect("B").await?;
    alice.wait_open(WAIT).await?;
    bob.wait_open(WAIT).await?;

    wait_for_candidates(&alice_conn, 1).await?;
    wait_for_candidates(&bob_conn, 1).await?;
    assert_eq!(alice.state(), SessionState::Open);
    assert_eq!(bob.state(), SessionState::Open);

    harness.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn test_local_candidates_follow_channel_addressing() -> HarnessResult<()> {
    init_test_tracing();
    let harness = RelayHarness::start().await?;
    let alice = harness.session("A").await?;
    let raw = harness.client("B").await?;
    let mut raw_notes = raw.take_notifications().unwrap();

    alice.join_channel("room").await?;
    raw.join_channel("room").await?;

    // The relay makes alice the offerer; both the offer and her candidate
    // arrive on the channel, never peer-addressed
    let room = ChannelId::parse("room")?;
    for kind in ["offer", "candidate"] {
        let note = expect_notification(&mut raw_notes, kind, |n| match n {
            Notification::Signal(DeliveredSignal::Channel { data, .. }) => {
                signal_kind(data) == Some(kind)
            }
            _ => false,
        })
        .await?;
        match note {
            Notification::Signal(DeliveredSignal::Channel { channel_id, .. }) => {
                assert_eq!(channel_id, room)
            }
            other => panic!("expected channel signal, got {:?}", other),
        }
    }
    assert_eq!(alice.state(), SessionState::Offering);

    harness.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn test_candidate_before_offer_is_buffered_and_applied() -> HarnessResult<()> {
    init_test_tracing();
    let harness = RelayHarness::start().await?;
    let (alice, alice_conn) = harness
        .session_with_connection(harness.session_config(), "A")
        .await?;
    let raw = harness.client("B").await?;
    let mut raw_notes = raw.take_notifications().unwrap();
    let to_alice = Destination::Peer(PeerId::parse("A")?);

    // A connection on the same network produces an offer alice can apply
    let remote = harness.network().create_connection();
    let offer = remote.create_offer().await?;
    remote.set_local_description(offer.clone()).await?;

    let candidate = SignalPayload::Candidate(IceCandidate {
        candidate: "candidate:early 1 udp 2130706431 127.0.0.1 9 typ host".to_string(),
        sdp_mid: Some("0".to_string()),
        sdp_m_line_index: Some(0),
    });
    raw.signal(&to_alice, serde_json::to_value(candidate).unwrap())
        .await?;
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(alice_conn.applied_candidates(), 0);

    raw.signal(&to_alice, serde_json::to_value(SignalPayload::Offer(offer)).unwrap())
        .await?;
    expect_notification(&mut raw_notes, "answer from A", |n| match n {
        Notification::Signal(DeliveredSignal::Peer { from, signal }) => {
            from.as_str() == "A" && signal_kind(signal) == Some("answer")
        }
        _ => false,
    })
    .await?;

    wait_for_candidates(&alice_conn, 1).await?;
    assert_eq!(alice_conn.applied_candidates(), 1);
    assert_eq!(alice.remote(), Some(Destination::Peer(PeerId::parse("B")?)));
    assert_eq!(alice.state(), SessionState::Negotiating);

    harness.shutdown().await;
    Ok(())
}

// =============================================================================
// Establishment failures
// =============================================================================

#[tokio::test]
async fn test_rejected_answer_aborts_connect() -> HarnessResult<()> {
    init_test_tracing();
    let harness = RelayHarness::start().await?;
    harness.network().reject_answers(true);
    let alice = harness.session("A").await?;
    let _bob = harness.session("B").await?;

    // connect_timeout is 3s; the failure must surface well before it
    let started = Instant::now();
    let err = alice.connect("B").await.unwrap_err();
    assert!(
        started.elapsed() < Duration::from_secs(1),
        "connect took {:?}",
        started.elapsed()
    );
    assert_eq!(err.to_string(), "negotiation failed: answer rejected");
    assert_eq!(alice.state(), SessionState::Failed);

    let err = alice.wait_open(Duration::from_millis(100)).await.unwrap_err();
    assert_eq!(err.to_string(), "negotiation failed: answer rejected");
    assert_eq!(harness.peer_count(), 2);

    harness.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn test_rejected_candidates_fail_both_sides() -> HarnessResult<()> {
    init_test_tracing();
    let harness = RelayHarness::start().await?;
    harness.network().reject_candidates(true);
    let config = peerlink::SessionConfig {
        connect_timeout: Duration::from_secs(1),
        ..harness.session_config()
    };
    let alice = harness.session_with(config, "A").await?;
    let bob = harness.session("B").await?;

    // Whether alice's connect settles first depends on relay ordering; the
    // end state does not
    let (connected, bob_failed) =
        tokio::join!(alice.connect("B"), wait_for_state(&bob, SessionState::Failed));
    info!("Connect with rejected candidates: {:?}", connected);
    bob_failed?;
    wait_for_state(&alice, SessionState::Failed).await?;

    let err = bob.wait_open(Duration::from_millis(100)).await.unwrap_err();
    assert_eq!(err.to_string(), "negotiation failed: candidate rejected");
    assert_eq!(harness.peer_count(), 2);

    harness.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn test_rejected_offer_fails_both_sides_but_keeps_relay() -> HarnessResult<()> {
    init_test_tracing();
    let harness = RelayHarness::start().await?;
    harness.network().reject_offers(true);

    let config = peerlink::SessionConfig {
        connect_timeout: Duration::from_millis(500),
        ..harness.session_config()
    };
    let alice = harness.session_with(config, "A").await?;
    let bob = harness.session("B").await?;

    let err = alice.connect("B").await.unwrap_err();
    info!("Connect failed as expected: {}", err);
    assert!(matches!(err, Error::Timeout(_)));
    assert_eq!(alice.state(), SessionState::Failed);
    wait_for_state(&bob, SessionState::Failed).await?;

    // Signaling connections survive a failed negotiation
    assert_eq!(harness.peer_count(), 2);
    assert_eq!(alice.peers().len(), 2);

    harness.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn test_connect_times_out_against_silent_peer() -> HarnessResult<()> {
    init_test_tracing();
    let harness = RelayHarness::start().await?;
    let config = peerlink::SessionConfig {
        connect_timeout: Duration::from_millis(300),
        ..harness.session_config()
    };
    let alice = harness.session_with(config, "A").await?;
    // Admitted, but never answers
    let _silent = harness.client("B").await?;

    let err = alice.connect("B").await.unwrap_err();
    assert_eq!(err.to_string(), "Operation timeout: connection timeout");
    assert_eq!(alice.state(), SessionState::Failed);

    let err = alice.wait_open(Duration::from_millis(100)).await.unwrap_err();
    assert!(matches!(err, Error::Negotiation(_)));

    harness.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn test_connect_to_unknown_peer_fails() -> HarnessResult<()> {
    init_test_tracing();
    let harness = RelayHarness::start().await?;
    let alice = harness.session("A").await?;

    let err = alice.connect("nobody").await.unwrap_err();
    assert!(err.is_routing_error());
    assert_eq!(alice.state(), SessionState::Failed);

    harness.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn test_connect_rejects_malformed_remote_and_rebinding() -> HarnessResult<()> {
    init_test_tracing();
    let harness = RelayHarness::start().await?;
    let (alice, _bob) = connected_pair(&harness, "A", "B").await?;
    let _carol = harness.session("C").await?;

    assert!(matches!(
        alice.connect("%").await,
        Err(Error::InvalidPeerId(_))
    ));
    assert!(matches!(alice.connect("C").await, Err(Error::Session(_))));
    assert!(matches!(
        alice.join_channel("room").await,
        Err(Error::Session(_))
    ));
    assert_eq!(alice.state(), SessionState::Open);

    harness.shutdown().await;
    Ok(())
}

// =============================================================================
// Diagnostics and teardown
// =============================================================================

#[tokio::test]
async fn test_remote_max_message_size_defaults_without_attribute() -> HarnessResult<()> {
    init_test_tracing();
    let harness = RelayHarness::start().await?;
    let alice = harness.session("A").await?;
    assert_eq!(alice.remote_max_message_size(), 65535);

    let bob = harness.session("B").await?;
    alice.connect("B").await?;
    bob.wait_open(WAIT).await?;
    assert_eq!(alice.remote_max_message_size(), 65535);
    assert_eq!(bob.remote_max_message_size(), 65535);

    harness.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn test_remote_max_message_size_from_description() -> HarnessResult<()> {
    init_test_tracing();
    let harness = RelayHarness::start().await?;
    harness.network().announce_max_message_size(262144);

    let (alice, bob) = connected_pair(&harness, "A", "B").await?;
    assert_eq!(alice.remote_max_message_size(), 262144);
    assert_eq!(bob.remote_max_message_size(), 262144);

    // The local cap still applies
    assert!(alice.send_async(vec![0u8; 100_000]).await.is_err());

    harness.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn test_debug_state_snapshot() -> HarnessResult<()> {
    init_test_tracing();
    let harness = RelayHarness::start().await?;
    let idle = harness.session("C").await?;
    let snapshot = idle.debug_state().await;
    assert_eq!(snapshot.state, SessionState::Idle);
    assert_eq!(snapshot.connection_state, ConnectionState::New);
    assert_eq!(snapshot.channel_state, None);

    let (alice, _bob) = connected_pair(&harness, "A", "B").await?;
    let snapshot = alice.debug_state().await;
    assert_eq!(snapshot.state, SessionState::Open);
    assert_eq!(snapshot.connection_state, ConnectionState::Connected);
    assert_eq!(snapshot.channel_state, Some(DataChannelState::Open));
    assert_eq!(snapshot.buffered_amount, Some(0));
    assert_eq!(snapshot.queued, 0);
    assert_eq!(snapshot.remote_max_message_size, 65535);

    harness.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn test_close_propagates_to_remote() -> HarnessResult<()> {
    init_test_tracing();
    let harness = RelayHarness::start().await?;
    let (alice, bob) = connected_pair(&harness, "A", "B").await?;

    alice.close().await?;
    assert_eq!(alice.state(), SessionState::Closed);
    wait_for_state(&bob, SessionState::Closed).await?;
    harness.wait_for_peer_count(1).await?;

    assert!(matches!(
        bob.send_async("late").await,
        Err(Error::ChannelClosed)
    ));
    assert!(!alice.send("late").await);

    harness.shutdown().await;
    Ok(())
}
