//! Protocol name to handler mapping.

use crate::messages::InboundMessage;
use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::Mutex;

type HandlerFn = dyn Fn(InboundMessage) -> BoxFuture<'static, ()> + Send + Sync;

/// Callback for messages delivered to a protocol.
///
/// Every handler runs under one asynchronous contract; synchronous closures
/// are wrapped into it when the handler is built.
#[derive(Clone)]
pub struct Handler {
    inner: Arc<HandlerFn>,
}

impl Handler {
    /// Wrap a synchronous callback.
    pub fn sync<F>(f: F) -> Self
    where
        F: Fn(InboundMessage) + Send + Sync + 'static,
    {
        Self {
            inner: Arc::new(move |msg: InboundMessage| -> BoxFuture<'static, ()> {
                f(msg);
                futures_util::future::ready(()).boxed()
            }),
        }
    }

    /// Wrap an asynchronous callback.
    pub fn from_async<F, Fut>(f: F) -> Self
    where
        F: Fn(InboundMessage) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        Self {
            inner: Arc::new(move |msg: InboundMessage| -> BoxFuture<'static, ()> { f(msg).boxed() }),
        }
    }

    /// Invoke the handler with one message.
    pub async fn call(&self, message: InboundMessage) {
        (self.inner)(message).await
    }
}

impl fmt::Debug for Handler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Handler").finish_non_exhaustive()
    }
}

/// Registered protocols and their handlers.
///
/// Has no locking of its own; share it as [`SharedRegistry`] and hold the
/// lock across a mutation and the subscribe request that announces it.
#[derive(Debug, Default)]
pub struct ProtocolRegistry {
    protocols: HashMap<String, Handler>,
}

/// Registry shared between the facade and the session's read loop.
pub type SharedRegistry = Arc<Mutex<ProtocolRegistry>>;

impl ProtocolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wrap a new registry for sharing.
    pub fn shared() -> SharedRegistry {
        Arc::new(Mutex::new(Self::new()))
    }

    /// Insert or replace the handler for `name`.
    pub fn add(&mut self, name: impl Into<String>, handler: Handler) {
        self.protocols.insert(name.into(), handler);
    }

    /// Remove `name`; absent names are ignored.
    pub fn remove(&mut self, name: &str) {
        self.protocols.remove(name);
    }

    pub fn remove_all(&mut self) {
        self.protocols.clear();
    }

    /// Snapshot of the registered names.
    pub fn list(&self) -> Vec<String> {
        self.protocols.keys().cloned().collect()
    }

    pub fn get(&self, name: &str) -> Option<Handler> {
        self.protocols.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.protocols.contains_key(name)
    }

    pub fn is_empty(&self) -> bool {
        self.protocols.is_empty()
    }
}
