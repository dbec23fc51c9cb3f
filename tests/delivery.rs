//! Outbound delivery through a chat session over the in-memory transport.
//!
//! Time is paused, so waiting on a queue deadline costs nothing.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::time::Instant;
use url::Url;

use chatlink::channel::mock::{self, MockServer};
use chatlink::channel::{NORMAL_CLOSURE, WireMessage};
use chatlink::{ChatSession, DeliveryError, ManagerConfig, Phase, ReconnectPolicy};

fn spawn_session() -> (ChatSession, MockServer) {
    let (transport, server) = mock::pair();
    let config = ManagerConfig::new(Url::parse("ws://chat.test").unwrap(), ReconnectPolicy::Manual);
    (ChatSession::spawn(config, Arc::new(transport)), server)
}

#[tokio::test(start_paused = true)]
async fn test_queued_messages_flush_in_submission_order() {
    let (session, mut server) = spawn_session();

    let first = session.send_message("first").await;
    let second = session.send_message("second").await;
    let third = session.send_message("third").await;

    session.connect("42").await.unwrap();
    let mut conn = server.accept().await.unwrap();
    assert_eq!(conn.url.as_str(), "ws://chat.test/ws/chat/42");

    for expected in ["first", "second", "third"] {
        let envelope = conn.next_json().await.unwrap();
        assert_eq!(envelope["type"], "message");
        assert_eq!(envelope["content"], expected);
    }
    assert_eq!(first.await, Ok(()));
    assert_eq!(second.await, Ok(()));
    assert_eq!(third.await, Ok(()));
}

#[tokio::test(start_paused = true)]
async fn test_envelope_carries_routing_snapshot() {
    let (mut session, mut server) = spawn_session();
    session.routing_mut().mcp_servers = vec!["warehouse".into()];
    session.routing_mut().rag_enabled = true;

    // Queued while offline, then the settings change.
    let queued = session.send_message("what sold best?").await;
    session.routing_mut().mcp_servers.clear();
    session.routing_mut().model = "other".into();

    session.connect("42").await.unwrap();
    let mut conn = server.accept().await.unwrap();
    let envelope = conn.next_json().await.unwrap();
    assert_eq!(
        envelope,
        json!({
            "type": "message",
            "content": "what sold best?",
            "mcp_servers": ["warehouse"],
            "provider": "ollama",
            "model": "llama3.1",
            "thinking_enabled": false,
            "rag_enabled": true,
            "rag_top_k": 5,
            "rag_hybrid_search": false
        })
    );
    assert_eq!(queued.await, Ok(()));
}

#[tokio::test(start_paused = true)]
async fn test_expired_message_is_rejected_and_never_sent() {
    let (session, mut server) = spawn_session();
    let start = Instant::now();

    let stale = session.send_message("stale").await;
    assert_eq!(
        stale.await,
        Err(DeliveryError::Timeout(Duration::from_secs(10)))
    );
    assert!(start.elapsed() >= Duration::from_secs(10));

    session.connect("42").await.unwrap();
    let mut conn = server.accept().await.unwrap();
    session.handle().wait_connected(true).await.unwrap();
    let fresh = session.send_message("fresh").await;

    assert_eq!(conn.next_json().await.unwrap()["content"], "fresh");
    assert_eq!(fresh.await, Ok(()));
    assert!(conn.try_next_sent().is_none());
}

#[tokio::test(start_paused = true)]
async fn test_each_delivery_settles_exactly_once() {
    let (session, mut server) = spawn_session();

    // Rejected by disconnect; must not time out later or be sent on the
    // next connection.
    let dropped = session.send_message("dropped").await;
    session.disconnect().await.unwrap();
    assert_eq!(dropped.await, Err(DeliveryError::ChannelClosed));

    // Delivered by flush; the wait window passing afterwards changes nothing.
    let sent = session.send_message("sent").await;
    session.connect("42").await.unwrap();
    let mut conn = server.accept().await.unwrap();
    assert_eq!(conn.next_json().await.unwrap()["content"], "sent");
    assert_eq!(sent.await, Ok(()));

    tokio::time::sleep(Duration::from_secs(30)).await;
    assert!(conn.try_next_sent().is_none());
    assert_eq!(session.snapshot().messages.len(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_timed_out_send_ends_the_exchange() {
    let (session, _server) = spawn_session();
    let stale = session.send_message("anyone there?").await;
    assert!(session.snapshot().status.is_active);

    let err = stale.await.unwrap_err();
    let mut state = session.state();
    let snapshot = state
        .wait_for(|s| !s.status.is_active)
        .await
        .unwrap()
        .clone();
    assert_eq!(snapshot.status.phase, Phase::Idle);
    assert_eq!(snapshot.last_error, Some(err.to_string()));
    assert!(snapshot.streaming.is_empty());

    tokio::time::sleep(Duration::from_secs(600)).await;
    assert!(!session.snapshot().status.is_active);
}

#[tokio::test(start_paused = true)]
async fn test_disconnect_ends_the_exchange_of_a_queued_send() {
    let (session, _server) = spawn_session();
    let queued = session.send_message("hello?").await;
    session.disconnect().await.unwrap();
    assert_eq!(queued.await, Err(DeliveryError::ChannelClosed));

    let snapshot = session.snapshot();
    assert!(!snapshot.status.is_active);
    assert_eq!(snapshot.status.phase, Phase::Idle);
    assert_eq!(
        snapshot.last_error,
        Some(DeliveryError::ChannelClosed.to_string())
    );
}

#[tokio::test(start_paused = true)]
async fn test_older_rejection_leaves_a_delivered_exchange_alone() {
    let (session, mut server) = spawn_session();
    let first = session.send_message("first").await;
    tokio::time::sleep(Duration::from_secs(5)).await;
    let second = session.send_message("second").await;

    // The first expires while the second is still in its window.
    tokio::time::sleep(Duration::from_secs(6)).await;
    assert_eq!(first.await, Err(DeliveryError::Timeout(Duration::from_secs(10))));
    assert!(session.snapshot().status.is_active);

    session.connect("42").await.unwrap();
    let mut conn = server.accept().await.unwrap();
    assert_eq!(conn.next_json().await.unwrap()["content"], "second");
    assert_eq!(second.await, Ok(()));
    assert!(session.snapshot().status.is_active);
    assert_eq!(session.snapshot().last_error, None);
}

#[tokio::test(start_paused = true)]
async fn test_disconnect_rejects_everything_queued() {
    let (session, mut server) = spawn_session();
    server.set_refusing(true);
    session.connect("42").await.unwrap();

    let a = session.send_message("a").await;
    let b = session.send_message("b").await;
    session.disconnect().await.unwrap();

    assert_eq!(a.await, Err(DeliveryError::ChannelClosed));
    assert_eq!(b.await, Err(DeliveryError::ChannelClosed));
    assert!(!DeliveryError::ChannelClosed.is_retryable());
}

#[tokio::test(start_paused = true)]
async fn test_switching_conversation_closes_the_old_channel_first() {
    let (session, mut server) = spawn_session();

    session.connect("a").await.unwrap();
    let mut old = server.accept().await.unwrap();
    session.handle().wait_connected(true).await.unwrap();

    session.connect("b").await.unwrap();
    // The old connection saw a normal closure before the new one was opened.
    match old.try_next_sent() {
        Some(WireMessage::Close { code, .. }) => assert_eq!(code, NORMAL_CLOSURE),
        other => panic!("expected a close frame, got {other:?}"),
    }
    let new = server.accept().await.unwrap();
    assert_eq!(new.url.path(), "/ws/chat/b");
    assert_eq!(server.attempts(), 2);
    assert_eq!(session.conversation_id().as_deref(), Some("b"));

    // Late frames from the old connection never reach the state.
    old.push_json(&json!({"type": "chunk", "content": "from a"}));
    new.push_json(&json!({"type": "chunk", "content": "from b"}));
    let mut state = session.state();
    state
        .wait_for(|s| !s.streaming.is_empty())
        .await
        .unwrap();
    assert_eq!(session.snapshot().streaming.as_str(), "from b");
}

#[tokio::test(start_paused = true)]
async fn test_send_while_connected_goes_straight_out() {
    let (session, mut server) = spawn_session();
    session.connect("42").await.unwrap();
    let mut conn = server.accept().await.unwrap();
    session.handle().wait_connected(true).await.unwrap();

    assert!(session.is_connected());
    assert_eq!(session.send_message("now").await.await, Ok(()));
    assert_eq!(conn.next_json().await.unwrap()["content"], "now");
}
