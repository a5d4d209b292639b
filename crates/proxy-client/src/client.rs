//! Application-facing proxy client.

use crate::config::ProxyConfig;
use crate::error::ProxyResult;
use crate::messages::{InboundMessage, MessageCodec, OutboundMessage};
use crate::registry::{Handler, ProtocolRegistry, SharedRegistry};
use crate::session::{PeerIdCallback, Session, SessionOptions, SessionState};
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, Span};

/// Builder for [`ProxyClient`].
pub struct ProxyClientBuilder {
    config: ProxyConfig,
    options: SessionOptions,
}

impl ProxyClientBuilder {
    /// Called with the peer id the proxy assigns to this connection.
    pub fn on_peer_id<F>(mut self, callback: F) -> Self
    where
        F: Fn(String) + Send + Sync + 'static,
    {
        let callback: PeerIdCallback = Arc::new(callback);
        self.options.peer_id_callback = Some(callback);
        self
    }

    /// Replace the JSON wire codec.
    pub fn codec(mut self, codec: Arc<dyn MessageCodec>) -> Self {
        self.options.codec = codec;
        self
    }

    /// Parent span for the session's log events.
    pub fn span(mut self, span: Span) -> Self {
        self.options.span = Some(span);
        self
    }

    pub fn build(self) -> ProxyClient {
        let registry = ProtocolRegistry::shared();
        let session = Session::with_options(self.config, registry.clone(), self.options);
        ProxyClient { registry, session }
    }
}

/// Subscribe to protocols and exchange messages through a libp2p proxy.
///
/// ```rust,ignore
/// let client = ProxyClient::new(ProxyConfig::new("ws://127.0.0.1:8888")?);
/// client
///     .subscribe_sync("/chat/1.0.0", |msg| println!("{}", msg.data))
///     .await?;
/// client.send(OutboundMessage::new("/chat/1.0.0", "hello")).await?;
/// ```
#[derive(Clone)]
pub struct ProxyClient {
    registry: SharedRegistry,
    session: Session,
}

impl ProxyClient {
    pub fn new(config: ProxyConfig) -> Self {
        Self::builder(config).build()
    }

    pub fn builder(config: ProxyConfig) -> ProxyClientBuilder {
        ProxyClientBuilder {
            config,
            options: SessionOptions::default(),
        }
    }

    /// Register `handler` for `protocol` and announce the new protocol set.
    pub async fn subscribe(&self, protocol: impl Into<String>, handler: Handler) -> ProxyResult<()> {
        self.session.ensure_listening();

        let mut registry = self.registry.lock().await;
        registry.add(protocol, handler);
        let protocols = registry.list();
        self.session.send_subscribe_request(&protocols).await
    }

    /// Subscribe with a synchronous callback.
    pub async fn subscribe_sync<F>(&self, protocol: impl Into<String>, callback: F) -> ProxyResult<()>
    where
        F: Fn(InboundMessage) + Send + Sync + 'static,
    {
        self.subscribe(protocol, Handler::sync(callback)).await
    }

    /// Subscribe with an asynchronous callback.
    pub async fn subscribe_async<F, Fut>(&self, protocol: impl Into<String>, callback: F) -> ProxyResult<()>
    where
        F: Fn(InboundMessage) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.subscribe(protocol, Handler::from_async(callback)).await
    }

    /// Drop `protocol`; closes the session when nothing is left.
    pub async fn unsubscribe(&self, protocol: &str) -> ProxyResult<()> {
        let mut registry = self.registry.lock().await;
        if !registry.contains(protocol) {
            debug!(protocol, "Unsubscribing from a protocol that was never subscribed");
        }
        registry.remove(protocol);
        let protocols = registry.list();
        let sent = self.session.send_subscribe_request(&protocols).await;

        if registry.is_empty() {
            self.session.close().await;
        }
        sent
    }

    /// Drop every protocol and close the session.
    pub async fn unsubscribe_all(&self) -> ProxyResult<()> {
        let mut registry = self.registry.lock().await;
        registry.remove_all();
        let sent = self.session.send_subscribe_request(&[]).await;
        self.session.close().await;
        sent
    }

    /// Send a message to the proxy.
    pub async fn send(&self, message: OutboundMessage) -> ProxyResult<()> {
        self.session.send_data(&message).await
    }

    /// Send `data` on `protocol`, optionally to a specific peer.
    pub async fn send_data(
        &self,
        data: impl Into<Value>,
        protocol: &str,
        server_peer_id: Option<&str>,
        save_data: bool,
    ) -> ProxyResult<()> {
        let mut message = OutboundMessage::new(protocol, data).save_data(save_data);
        if let Some(peer_id) = server_peer_id {
            message = message.to_peer(peer_id);
        }
        self.send(message).await
    }

    /// Currently registered protocol names.
    pub async fn protocols(&self) -> Vec<String> {
        self.registry.lock().await.list()
    }

    pub fn peer_id(&self) -> Option<String> {
        self.session.peer_id()
    }

    pub fn state(&self) -> SessionState {
        self.session.state()
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    /// Close the connection without touching subscriptions.
    pub async fn close(&self) {
        self.session.close().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn test_client_initial_state() {
        let client = ProxyClient::new(ProxyConfig::default());
        assert_eq!(client.state(), SessionState::Disconnected);
        assert!(client.protocols().await.is_empty());
        assert!(client.peer_id().is_none());
    }

    #[tokio::test]
    async fn test_builder_keeps_config() {
        let config = ProxyConfig::new("ws://proxy.local:9999").unwrap();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();

        let client = ProxyClient::builder(config)
            .on_peer_id(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            })
            .build();

        assert_eq!(client.session().config().url, "ws://proxy.local:9999");
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_send_without_server_returns_error() {
        let client = ProxyClient::new(ProxyConfig::new("ws://127.0.0.1:1").unwrap());
        let result = client.send_data("hi", "chat", None, false).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_unsubscribe_all_closes_even_when_send_fails() {
        let client = ProxyClient::new(ProxyConfig::new("ws://127.0.0.1:1").unwrap());
        let result = client.unsubscribe_all().await;
        assert!(result.is_err());
        assert_eq!(client.state(), SessionState::Closed);
    }
}
