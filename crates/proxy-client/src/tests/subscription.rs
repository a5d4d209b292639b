//! Subscribe / unsubscribe / send through the client facade.

use super::harness::{eventually, fast_config, MockProxy};
use crate::client::ProxyClient;
use crate::messages::{InboundMessage, OutboundMessage};
use crate::session::SessionState;
use serde_json::json;
use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

fn set(names: &[&str]) -> BTreeSet<String> {
    names.iter().map(|s| s.to_string()).collect()
}

#[tokio::test]
async fn subscribe_announces_full_protocol_set() {
    let proxy = MockProxy::start().await;
    let client = ProxyClient::new(fast_config(&proxy));

    client.subscribe_sync("a", |_| {}).await.unwrap();
    client.subscribe_sync("b", |_| {}).await.unwrap();

    assert!(eventually(|| proxy.subscriptions_on(0).len() == 2).await);
    assert_eq!(proxy.subscriptions_on(0), vec![set(&["a"]), set(&["a", "b"])]);

    // One socket shared by the read loop and every sender.
    assert_eq!(proxy.connection_count(), 1);
    assert!(client.session().is_listening());
}

#[tokio::test]
async fn resubscribing_same_protocol_replaces_handler_without_duplicates() {
    let proxy = MockProxy::start().await;
    let client = ProxyClient::new(fast_config(&proxy));

    client.subscribe_sync("a", |_| {}).await.unwrap();
    client.subscribe_sync("a", |_| {}).await.unwrap();

    assert!(eventually(|| proxy.subscriptions_on(0).len() == 2).await);
    assert_eq!(proxy.subscriptions_on(0), vec![set(&["a"]), set(&["a"])]);
    assert_eq!(client.protocols().await, vec!["a".to_string()]);
}

#[tokio::test]
async fn unsubscribe_announces_remaining_protocols() {
    let proxy = MockProxy::start().await;
    let client = ProxyClient::new(fast_config(&proxy));

    client.subscribe_sync("a", |_| {}).await.unwrap();
    client.subscribe_sync("b", |_| {}).await.unwrap();
    client.unsubscribe("a").await.unwrap();

    assert!(eventually(|| proxy.subscriptions_on(0).len() == 3).await);
    assert_eq!(proxy.last_subscription(), Some(set(&["b"])));
    assert_ne!(client.state(), SessionState::Closed);
    assert!(proxy.is_open(0));
}

#[tokio::test]
async fn unsubscribing_last_protocol_closes_session() {
    let proxy = MockProxy::start().await;
    let client = ProxyClient::new(fast_config(&proxy));

    client.subscribe_sync("p", |_| {}).await.unwrap();
    client.unsubscribe("p").await.unwrap();

    assert!(eventually(|| proxy.last_subscription() == Some(set(&[]))).await);
    assert!(eventually(|| client.state() == SessionState::Closed).await);
    assert!(eventually(|| !proxy.is_open(0)).await);
    assert!(!client.session().is_listening());

    // No reconnect follows an explicit close.
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(proxy.connection_count(), 1);
}

#[tokio::test]
async fn subscribe_right_after_unsubscribing_last_keeps_delivering() {
    let proxy = MockProxy::start().await;
    let client = ProxyClient::new(fast_config(&proxy));
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();

    client.subscribe_sync("p", |_| {}).await.unwrap();
    assert!(eventually(|| client.state() == SessionState::Listening).await);

    // No pause between the close and the next subscribe.
    client.unsubscribe("p").await.unwrap();
    client
        .subscribe_sync("q", move |msg: InboundMessage| sink.lock().unwrap().push(msg.data))
        .await
        .unwrap();

    assert!(eventually(|| proxy.subscriptions_on(1) == vec![set(&["q"])]).await);
    assert!(eventually(|| client.state() == SessionState::Listening).await);

    proxy.send_json(1, json!({ "protocol": "q", "data": "hello" }));

    assert!(eventually(|| seen.lock().unwrap().len() == 1).await);
    assert_eq!(*seen.lock().unwrap(), vec![json!("hello")]);
    assert!(client.session().is_listening());
    assert_eq!(proxy.connection_count(), 2);
}

#[tokio::test]
async fn subscribe_after_close_starts_a_new_read_loop() {
    let proxy = MockProxy::start().await;
    let client = ProxyClient::new(fast_config(&proxy));
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();

    client
        .subscribe_sync("a", move |msg: InboundMessage| sink.lock().unwrap().push(msg.data))
        .await
        .unwrap();
    assert!(eventually(|| client.state() == SessionState::Listening).await);

    client.close().await;
    client.subscribe_sync("b", |_| {}).await.unwrap();

    assert!(eventually(|| proxy.subscriptions_on(1) == vec![set(&["a", "b"])]).await);
    proxy.send_json(1, json!({ "protocol": "a", "data": 7 }));

    assert!(eventually(|| seen.lock().unwrap().len() == 1).await);
    assert_eq!(*seen.lock().unwrap(), vec![json!(7)]);
    assert!(client.session().is_listening());
}

#[tokio::test]
async fn unsubscribe_all_always_closes() {
    let proxy = MockProxy::start().await;
    let client = ProxyClient::new(fast_config(&proxy));

    client.subscribe_sync("a", |_| {}).await.unwrap();
    client.subscribe_sync("b", |_| {}).await.unwrap();
    client.unsubscribe_all().await.unwrap();

    assert!(eventually(|| proxy.last_subscription() == Some(set(&[]))).await);
    assert!(client.protocols().await.is_empty());
    assert!(eventually(|| client.state() == SessionState::Closed).await);
    assert!(eventually(|| !proxy.is_open(0)).await);
}

#[tokio::test]
async fn unsubscribe_all_on_empty_registry_still_closes() {
    let proxy = MockProxy::start().await;
    let client = ProxyClient::new(fast_config(&proxy));

    client.unsubscribe_all().await.unwrap();
    assert_eq!(client.state(), SessionState::Closed);

    // Idempotent: a second call lazily connects, announces nothing and closes again.
    client.unsubscribe_all().await.unwrap();
    assert_eq!(client.state(), SessionState::Closed);

    assert!(eventually(|| proxy.connection_count() == 2 && proxy.open_connections() == 0).await);
    assert!(eventually(|| proxy.subscriptions_on(1).len() == 1).await);
    assert_eq!(proxy.subscriptions_on(0), vec![set(&[])]);
    assert_eq!(proxy.subscriptions_on(1), vec![set(&[])]);
}

#[tokio::test]
async fn send_encodes_data_message() {
    let proxy = MockProxy::start().await;
    let client = ProxyClient::new(fast_config(&proxy));

    client
        .send(
            OutboundMessage::new("/chat/1.0.0", json!({ "text": "hello" }))
                .to_peer("12D3KooWServer")
                .save_data(true),
        )
        .await
        .unwrap();
    client.send_data("plain", "/chat/1.0.0", None, false).await.unwrap();

    assert!(eventually(|| proxy.data_frames().len() == 2).await);
    let frames = proxy.data_frames();
    assert_eq!(
        frames[0],
        json!({
            "protocol": "/chat/1.0.0",
            "serverPeerId": "12D3KooWServer",
            "data": { "text": "hello" },
            "save_data": true
        })
    );
    assert_eq!(frames[1]["data"], "plain");
    assert_eq!(frames[1]["serverPeerId"], "");
    assert_eq!(frames[1]["save_data"], false);

    // Sending alone opens a socket but never starts the read loop.
    assert_eq!(client.state(), SessionState::ConnectedIdle);
    assert!(!client.session().is_listening());
}

#[tokio::test]
async fn send_after_close_reconnects_lazily() {
    let proxy = MockProxy::start().await;
    let client = ProxyClient::new(fast_config(&proxy));

    client.send_data(1, "a", None, false).await.unwrap();
    client.close().await;
    assert_eq!(client.state(), SessionState::Closed);

    client.send_data(2, "a", None, false).await.unwrap();
    assert_eq!(client.state(), SessionState::ConnectedIdle);

    assert!(eventually(|| proxy.data_frames().len() == 2).await);
    assert_eq!(proxy.connection_count(), 2);
    assert_eq!(proxy.frames_on(1)[0]["data"], 2);
}

#[tokio::test]
async fn concurrent_senders_share_one_socket() {
    let proxy = MockProxy::start().await;
    let client = ProxyClient::new(fast_config(&proxy));

    let mut tasks = Vec::new();
    for n in 0..20 {
        let client = client.clone();
        tasks.push(tokio::spawn(async move {
            client.send_data(n, "bulk", None, false).await
        }));
    }
    for task in tasks {
        task.await.unwrap().unwrap();
    }

    assert!(eventually(|| proxy.data_frames().len() == 20).await);
    assert_eq!(proxy.connection_count(), 1);
}
