//! Signaling endpoint integration tests.
//!
//! Real `/ws` connections through `TestSignalingServer`, with the service
//! talking to `MockJanusServer` over the Janus WebSocket transport.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic, clippy::indexing_slicing)]

use serde_json::{json, Value};
use signaling_service::store::ParticipantStatus;
use signaling_test_utils::{
    MockJanusServer, SignalingClient, TestParticipant, TestRoom, TestSignalingServer,
};
use std::time::Duration;

struct Joined {
    client: SignalingClient,
    feed_id: Value,
    joined: Value,
}

/// Connect `participant` and wait for its `joined` message.
async fn join(server: &TestSignalingServer, participant: &TestParticipant) -> Joined {
    server.admit(participant).await;
    let mut client = SignalingClient::connect(&server.ws_url(Some(&participant.token)))
        .await
        .unwrap();

    let first = client.recv().await.expect("connection closed before ready");
    assert_eq!(first["type"], "connection-ready");

    let joined = client.recv_type("joined").await;
    Joined {
        client,
        feed_id: joined["data"]["feedId"].clone(),
        joined,
    }
}

async fn eventually<F, Fut>(mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while tokio::time::Instant::now() < deadline {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    false
}

#[tokio::test]
async fn test_missing_token_closes_with_4001() {
    let (server, _gateway) = TestSignalingServer::with_mock_gateway().await.unwrap();

    let mut client = SignalingClient::connect(&server.ws_url(None)).await.unwrap();
    let closed = client.closed().await;

    assert_eq!(closed.code, Some(4001));
}

#[tokio::test]
async fn test_unknown_token_closes_with_4002() {
    let (server, _gateway) = TestSignalingServer::with_mock_gateway().await.unwrap();

    let mut client = SignalingClient::connect(&server.ws_url(Some("no-such-token")))
        .await
        .unwrap();
    let closed = client.closed().await;

    assert_eq!(closed.code, Some(4002));
}

#[tokio::test]
async fn test_join_token_is_single_use() {
    let (server, _gateway) = TestSignalingServer::with_mock_gateway().await.unwrap();
    let alice = TestRoom::random().participant("alice");
    let _first = join(&server, &alice).await;

    let mut again = SignalingClient::connect(&server.ws_url(Some(&alice.token)))
        .await
        .unwrap();

    assert_eq!(again.closed().await.code, Some(4002));
}

#[tokio::test]
async fn test_first_joiner_sees_empty_room_and_becomes_active() {
    let janus = MockJanusServer::start().await;
    let server = TestSignalingServer::with_janus(&janus).await.unwrap();
    let room = TestRoom::random();
    let alice = room.participant("alice");

    let record_id = server.admit(&alice).await;
    let mut client = SignalingClient::connect(&server.ws_url(Some(&alice.token)))
        .await
        .unwrap();

    assert_eq!(client.recv().await.unwrap()["type"], "connection-ready");
    let joined = client.recv_type("joined").await;

    assert_eq!(joined["data"]["roomId"], room.id.as_str());
    assert!(joined["data"]["feedId"].is_u64());
    assert_eq!(joined["data"]["participants"], json!([]));

    assert_eq!(
        server.store().status(record_id).await,
        Some(ParticipantStatus::Active)
    );
    assert_eq!(janus.publisher_feeds(room.id.as_str()).await.len(), 1);
}

#[tokio::test]
async fn test_second_joiner_learns_existing_feed() {
    let janus = MockJanusServer::start().await;
    let server = TestSignalingServer::with_janus(&janus).await.unwrap();
    let room = TestRoom::random();

    let mut alice = join(&server, &room.participant("alice")).await;
    let bob = join(&server, &room.participant("bob")).await;

    let participants = bob.joined["data"]["participants"].as_array().unwrap();
    assert_eq!(participants.len(), 1);
    assert_eq!(participants[0]["feedId"], alice.feed_id);
    assert_eq!(participants[0]["userInfo"]["displayName"], "alice");

    let announced = alice.client.recv_type("participant-joined").await;
    assert_eq!(announced["data"]["feedId"], bob.feed_id);
    assert_eq!(announced["data"]["user"]["displayName"], "bob");
}

#[tokio::test]
async fn test_publish_offer_is_answered() {
    let janus = MockJanusServer::start().await;
    let server = TestSignalingServer::with_janus(&janus).await.unwrap();
    let mut alice = join(&server, &TestRoom::random().participant("alice")).await;

    alice
        .client
        .send(json!({
            "type": "publish",
            "data": {"jsep": {"type": "offer", "sdp": "v=0 alice"}},
        }))
        .await;

    let answer = alice.client.recv_type("sdp-answer").await;
    assert_eq!(answer["data"]["usage"], "publish");
    assert_eq!(answer["data"]["jsep"]["type"], "answer");
    assert_eq!(janus.plugin_request_count("publish").await, 1);
}

#[tokio::test]
async fn test_subscribe_round_trip() {
    let janus = MockJanusServer::start().await;
    let server = TestSignalingServer::with_janus(&janus).await.unwrap();
    let room = TestRoom::random();

    let alice = join(&server, &room.participant("alice")).await;
    let mut bob = join(&server, &room.participant("bob")).await;

    bob.client
        .send(json!({"type": "subscribe", "data": {"targetFeedId": alice.feed_id}}))
        .await;

    let offer = bob.client.recv_type("sdp-offer").await;
    assert_eq!(offer["data"]["usage"], "subscribe");
    assert_eq!(offer["data"]["targetFeedId"], alice.feed_id);
    assert_eq!(offer["data"]["jsep"]["type"], "offer");

    bob.client
        .send(json!({
            "type": "sdp-answer",
            "data": {
                "targetFeedId": alice.feed_id,
                "jsep": {"type": "answer", "sdp": "v=0 bob"},
            },
        }))
        .await;

    assert!(eventually(|| async { janus.plugin_request_count("start").await == 1 }).await);
}

#[tokio::test]
async fn test_subscribe_to_unknown_feed_reports_error() {
    let janus = MockJanusServer::start().await;
    let server = TestSignalingServer::with_janus(&janus).await.unwrap();
    let mut alice = join(&server, &TestRoom::random().participant("alice")).await;

    alice
        .client
        .send(json!({"type": "subscribe", "data": {"targetFeedId": 424242}}))
        .await;

    let error = alice.client.recv_type("error").await;
    assert_eq!(error["code"], "SUBSCRIBE_FAILED");
}

#[tokio::test]
async fn test_chat_reaches_others_but_not_sender() {
    let janus = MockJanusServer::start().await;
    let server = TestSignalingServer::with_janus(&janus).await.unwrap();
    let room = TestRoom::random();

    let mut alice = join(&server, &room.participant("alice")).await;
    let mut bob = join(&server, &room.participant("bob")).await;
    let mut carol = join(&server, &room.participant("carol")).await;

    alice
        .client
        .send(json!({"type": "send-message", "data": {"text": "hello"}}))
        .await;

    for receiver in [&mut bob.client, &mut carol.client] {
        let chat = receiver.recv_type("chat-message").await;
        assert_eq!(chat["data"]["text"], "hello");
        assert_eq!(chat["data"]["from"]["displayName"], "alice");
        assert_eq!(chat["data"]["roomId"], room.id.as_str());
    }

    alice
        .client
        .expect_no_type("chat-message", Duration::from_millis(200))
        .await;
}

#[tokio::test]
async fn test_unknown_message_type_is_reported() {
    let (server, _gateway) = TestSignalingServer::with_mock_gateway().await.unwrap();
    let mut alice = join(&server, &TestRoom::random().participant("alice")).await;

    alice
        .client
        .send(json!({"type": "dance", "data": {}}))
        .await;

    let error = alice.client.recv_type("error").await;
    assert_eq!(error["code"], "UNKNOWN_MESSAGE_TYPE");
}

#[tokio::test]
async fn test_leaving_notifies_room_and_releases_state() {
    let janus = MockJanusServer::start().await;
    let server = TestSignalingServer::with_janus(&janus).await.unwrap();
    let room = TestRoom::random();
    let bob_fixture = room.participant("bob");

    let mut alice = join(&server, &room.participant("alice")).await;
    let bob = join(&server, &bob_fixture).await;
    let bob_feed = bob.feed_id.clone();

    bob.client.close().await;

    let left = alice.client.recv_type("participant-left").await;
    assert_eq!(left["data"]["feedId"], bob_feed);
    assert_eq!(left["data"]["userId"], json!(bob_fixture.user_id));
    assert_eq!(left["data"]["reason"], "left");

    alice.client.close().await;

    assert!(eventually(|| async { server.registry().room_count().await == 0 }).await);
    assert!(eventually(|| async { janus.publisher_feeds(room.id.as_str()).await.is_empty() }).await);
}

#[tokio::test]
async fn test_server_shutdown_closes_connections() {
    let (server, _gateway) = TestSignalingServer::with_mock_gateway().await.unwrap();
    let mut alice = join(&server, &TestRoom::random().participant("alice")).await;

    server.shutdown();

    alice.client.closed().await;
    assert!(eventually(|| async { server.registry().room_count().await == 0 }).await);
}

#[tokio::test]
async fn test_shutdown_waits_for_connection_teardown() {
    let janus = MockJanusServer::start().await;
    let server = TestSignalingServer::with_janus(&janus).await.unwrap();
    let room = TestRoom::random();
    let alice = room.participant("alice");

    let record_id = server.admit(&alice).await;
    let mut client = SignalingClient::connect(&server.ws_url(Some(&alice.token)))
        .await
        .unwrap();
    client.recv_type("joined").await;

    tokio::time::timeout(Duration::from_secs(5), server.shutdown_and_wait())
        .await
        .expect("connections should finish their teardown");

    // Nothing is polled here: teardown has already run to completion
    assert_eq!(
        server.store().status(record_id).await,
        Some(ParticipantStatus::Left)
    );
    assert_eq!(server.registry().room_count().await, 0);
    assert!(janus.publisher_feeds(room.id.as_str()).await.is_empty());
    client.closed().await;
}

#[tokio::test]
async fn test_chat_context_follows_room_lifetime() {
    let (server, _gateway) = TestSignalingServer::with_mock_gateway().await.unwrap();
    let room = TestRoom::random();
    let room_id = room.id.clone();

    let mut alice = join(&server, &room.participant("alice")).await;
    let mut bob = join(&server, &room.participant("bob")).await;

    alice
        .client
        .send(json!({"type": "send-message", "data": {"text": "hello"}}))
        .await;
    bob.client.recv_type("chat-message").await;
    bob.client
        .send(json!({"type": "ai-query", "data": {"query": "summarize"}}))
        .await;
    bob.client.recv_type("ai-error").await;

    let context = server.chat_context().get_context(&room_id).await;
    let contents: Vec<&str> = context.iter().map(|m| m.content.as_str()).collect();
    assert_eq!(contents, vec!["hello", "summarize"]);

    alice.client.close().await;
    bob.client.close().await;

    assert!(
        eventually(|| async { server.chat_context().get_context(&room_id).await.is_empty() })
            .await
    );
}
