//! Proxy websocket session.
//!
//! Owns the single socket to the proxy server, the read loop that dispatches
//! inbound frames, and the reconnect-and-resubscribe cycle.
//!
//! Lock order everywhere is registry, then socket slot, then sink.

use crate::config::{DecodeErrorPolicy, ProxyConfig};
use crate::error::{ProxyError, ProxyResult};
use crate::messages::{InboundFrame, JsonCodec, MessageCodec, OutboundMessage};
use crate::registry::SharedRegistry;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::sync::{watch, Mutex, Notify};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, info_span, warn, Instrument, Span};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, Message>;
type WsSource = SplitStream<WsStream>;

/// Callback for the proxy's peer identity announcement.
pub type PeerIdCallback = Arc<dyn Fn(String) + Send + Sync>;

/// Session connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// No socket.
    Disconnected,
    /// Websocket handshake in progress.
    Connecting,
    /// Socket open, nobody reading it.
    ConnectedIdle,
    /// Socket open and the read loop is consuming frames.
    Listening,
    /// Socket lost; waiting before the next connect attempt.
    Reconnecting,
    /// Explicitly closed. The session can still be reused.
    Closed,
}

/// Optional collaborators for a [`Session`].
pub struct SessionOptions {
    pub codec: Arc<dyn MessageCodec>,
    pub peer_id_callback: Option<PeerIdCallback>,
    /// Span that parents every event the session logs.
    pub span: Option<Span>,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            codec: Arc::new(JsonCodec),
            peer_id_callback: None,
            span: None,
        }
    }
}

/// Why a read loop pass ended without an error.
enum ReadExit {
    /// Clean close from either side.
    Closed,
    /// The listening flag was cleared.
    Stopped,
}

/// Listening flag plus the generation of the read loop it belongs to.
///
/// Every start and every stop bumps `epoch`, so a loop only keeps running
/// while the epoch it was started with is still current.
#[derive(Default)]
struct ListenState {
    active: bool,
    epoch: u64,
}

/// One live websocket.
struct Connection {
    id: u64,
    sink: Mutex<WsSink>,
    source: parking_lot::Mutex<Option<WsSource>>,
    closing: AtomicBool,
}

impl Connection {
    fn is_closing(&self) -> bool {
        self.closing.load(Ordering::SeqCst)
    }

    fn take_source(&self) -> Option<WsSource> {
        self.source.lock().take()
    }

    fn restore_source(&self, source: WsSource) {
        *self.source.lock() = Some(source);
    }

    async fn send_text(&self, text: String) -> ProxyResult<()> {
        if self.is_closing() {
            return Err(ProxyError::Closed);
        }
        self.sink.lock().await.send(Message::Text(text.into())).await?;
        Ok(())
    }

    async fn close(&self) -> ProxyResult<()> {
        self.closing.store(true, Ordering::SeqCst);
        match self.sink.lock().await.close().await {
            Ok(()) | Err(tungstenite::Error::ConnectionClosed) | Err(tungstenite::Error::AlreadyClosed) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

struct Inner {
    config: ProxyConfig,
    codec: Arc<dyn MessageCodec>,
    registry: SharedRegistry,
    peer_id_callback: Option<PeerIdCallback>,
    span: Span,
    socket: Mutex<Option<Arc<Connection>>>,
    next_connection_id: AtomicU64,
    listen: parking_lot::Mutex<ListenState>,
    /// Set by an explicit close, cleared by the next successful handshake.
    closed: AtomicBool,
    /// Held by the read loop for its whole lifetime.
    reader: Mutex<()>,
    stop: Notify,
    state: watch::Sender<SessionState>,
    peer_id: parking_lot::RwLock<Option<String>>,
}

/// Connection and dispatch engine for one proxy server.
///
/// Cheap to clone; clones share the same socket and read loop.
#[derive(Clone)]
pub struct Session {
    inner: Arc<Inner>,
}

impl Session {
    /// Create a session with the JSON codec and no identity callback.
    pub fn new(config: ProxyConfig, registry: SharedRegistry) -> Self {
        Self::with_options(config, registry, SessionOptions::default())
    }

    /// Create a session with explicit collaborators.
    pub fn with_options(config: ProxyConfig, registry: SharedRegistry, options: SessionOptions) -> Self {
        let span = options
            .span
            .unwrap_or_else(|| info_span!("proxy_session", url = %config.url));
        let (state, _) = watch::channel(SessionState::Disconnected);
        // Fails when the application already installed a provider, which is fine.
        let _ = rustls::crypto::ring::default_provider().install_default();

        Self {
            inner: Arc::new(Inner {
                config,
                codec: options.codec,
                registry,
                peer_id_callback: options.peer_id_callback,
                span,
                socket: Mutex::new(None),
                next_connection_id: AtomicU64::new(1),
                listen: parking_lot::Mutex::new(ListenState::default()),
                closed: AtomicBool::new(false),
                reader: Mutex::new(()),
                stop: Notify::new(),
                state,
                peer_id: parking_lot::RwLock::new(None),
            }),
        }
    }

    pub fn config(&self) -> &ProxyConfig {
        &self.inner.config
    }

    /// Current connection state.
    pub fn state(&self) -> SessionState {
        *self.inner.state.borrow()
    }

    /// Watch state transitions.
    pub fn watch_state(&self) -> watch::Receiver<SessionState> {
        self.inner.state.subscribe()
    }

    /// Wait until the state satisfies `pred` and return it.
    pub async fn wait_for_state(&self, pred: impl FnMut(&SessionState) -> bool) -> SessionState {
        let mut rx = self.inner.state.subscribe();
        let state = match rx.wait_for(pred).await {
            Ok(state) => *state,
            // The sender lives as long as `self`.
            Err(_) => self.state(),
        };
        state
    }

    /// Whether a read loop is active (or about to reconnect).
    pub fn is_listening(&self) -> bool {
        self.inner.listen.lock().active
    }

    /// Whether the loop started at `epoch` should keep running.
    fn is_current(&self, epoch: u64) -> bool {
        let listen = self.inner.listen.lock();
        listen.active && listen.epoch == epoch
    }

    /// Clear the listening flag if it still belongs to the loop at `epoch`.
    fn finish_listening(&self, epoch: u64) {
        let mut listen = self.inner.listen.lock();
        if listen.epoch == epoch {
            listen.active = false;
        }
    }

    /// Peer id most recently announced by the proxy.
    pub fn peer_id(&self) -> Option<String> {
        self.inner.peer_id.read().clone()
    }

    /// Start the read loop unless one is already running.
    pub fn ensure_listening(&self) {
        let epoch = {
            let mut listen = self.inner.listen.lock();
            if listen.active {
                debug!(parent: &self.inner.span, "Read loop already running");
                return;
            }
            listen.active = true;
            listen.epoch += 1;
            listen.epoch
        };

        let session = self.clone();
        tokio::spawn(async move { session.run_listener(epoch).await }.instrument(self.inner.span.clone()));
    }

    /// Clear the listening flag.
    ///
    /// The read loop exits at its next suspension point and a pending
    /// reconnect is abandoned. The socket stays open.
    pub fn stop_listening(&self) {
        let was_active = {
            let mut listen = self.inner.listen.lock();
            let was_active = listen.active;
            listen.active = false;
            listen.epoch += 1;
            was_active
        };
        if was_active {
            debug!(parent: &self.inner.span, "Stopping read loop");
        }
        self.inner.stop.notify_waiters();
    }

    /// Announce the full set of protocols this client wants routed to it.
    pub async fn send_subscribe_request(&self, protocols: &[String]) -> ProxyResult<()> {
        let frame = self.inner.codec.encode_subscribe(protocols)?;
        async {
            debug!(?protocols, "Subscribing");
            self.send_frame(frame).await
        }
        .instrument(self.inner.span.clone())
        .await
    }

    /// Send an application message.
    pub async fn send_data(&self, message: &OutboundMessage) -> ProxyResult<()> {
        let frame = self.inner.codec.encode_data(message)?;
        async {
            debug!(protocol = %message.protocol, save_data = message.save_data, "Sending data");
            self.send_frame(frame).await
        }
        .instrument(self.inner.span.clone())
        .await
    }

    /// Close the socket if one is open.
    ///
    /// The read loop ends and a pending reconnect is abandoned, so a close
    /// is never undone by the reconnect cycle. Later sends connect again.
    pub async fn close(&self) {
        async {
            let conn = self.inner.socket.lock().await.take();
            self.inner.closed.store(true, Ordering::SeqCst);
            self.set_state(SessionState::Closed);
            self.stop_listening();

            if let Some(conn) = conn {
                info!(connection = conn.id, "Closing proxy connection");
                if let Err(e) = conn.close().await {
                    warn!(connection = conn.id, error = %e, "Error while closing proxy connection");
                }
            }
        }
        .instrument(self.inner.span.clone())
        .await
    }

    /// Return the live connection, opening one if there is none.
    async fn ensure_connected(&self) -> ProxyResult<Arc<Connection>> {
        let mut slot = self.inner.socket.lock().await;
        if let Some(conn) = slot.as_ref() {
            return Ok(conn.clone());
        }

        let conn = match self.connect().await {
            Ok(conn) => conn,
            Err(e) => {
                self.set_state(SessionState::Disconnected);
                return Err(e);
            }
        };
        *slot = Some(conn.clone());
        self.set_state(SessionState::ConnectedIdle);
        Ok(conn)
    }

    /// Websocket handshake. Callers hold the socket slot.
    async fn connect(&self) -> ProxyResult<Arc<Connection>> {
        self.set_state(SessionState::Connecting);
        info!(url = %self.inner.config.url, "Connecting to proxy");

        let timeout = self.inner.config.connect_timeout;
        let (ws_stream, _) = tokio::time::timeout(timeout, connect_async(self.inner.config.url.as_str()))
            .await
            .map_err(|_| ProxyError::Connection(format!("handshake timed out after {:?}", timeout)))??;
        let (sink, source) = ws_stream.split();

        let id = self.inner.next_connection_id.fetch_add(1, Ordering::SeqCst);
        self.inner.closed.store(false, Ordering::SeqCst);
        info!(connection = id, "Connected to proxy");

        Ok(Arc::new(Connection {
            id,
            sink: Mutex::new(sink),
            source: parking_lot::Mutex::new(Some(source)),
            closing: AtomicBool::new(false),
        }))
    }

    async fn send_frame(&self, frame: String) -> ProxyResult<()> {
        let conn = self.ensure_connected().await?;
        if let Err(e) = conn.send_text(frame).await {
            if e.is_connection_error() {
                warn!(connection = conn.id, error = %e, "Send failed, dropping connection");
                self.forget_connection(&conn).await;
            }
            return Err(e);
        }
        Ok(())
    }

    /// Clear the socket slot if it still holds `conn`.
    async fn forget_connection(&self, conn: &Connection) {
        let mut slot = self.inner.socket.lock().await;
        if slot.as_ref().is_some_and(|current| current.id == conn.id) {
            *slot = None;
        }
    }

    /// Connect if needed and resend the registered protocols before any
    /// other caller can use the socket.
    async fn reconnect(&self) -> ProxyResult<Arc<Connection>> {
        let registry = self.inner.registry.lock().await;
        let mut slot = self.inner.socket.lock().await;

        let conn = match slot.as_ref() {
            Some(conn) => conn.clone(),
            None => self.connect().await?,
        };

        let protocols = registry.list();
        info!(connection = conn.id, ?protocols, "Resubscribing after reconnect");
        let frame = self.inner.codec.encode_subscribe(&protocols)?;
        if let Err(e) = conn.send_text(frame).await {
            *slot = None;
            return Err(e);
        }

        *slot = Some(conn.clone());
        self.set_state(SessionState::ConnectedIdle);
        Ok(conn)
    }

    async fn run_listener(&self, epoch: u64) {
        let _reader = self.inner.reader.lock().await;
        debug!(epoch, "Read loop started");

        let mut attempt: u32 = 0;
        let mut resubscribe = false;

        while self.is_current(epoch) {
            let connected = if resubscribe {
                self.reconnect().await
            } else {
                self.ensure_connected().await
            };

            let conn = match connected {
                Ok(conn) => conn,
                Err(e) => {
                    attempt += 1;
                    error!(error = %e, attempt, "Failed to connect to proxy");
                    resubscribe = true;
                    if !self.backoff(epoch, attempt).await {
                        break;
                    }
                    continue;
                }
            };
            attempt = 0;

            let Some(source) = conn.take_source() else {
                // Another reader consumed this socket; start over on a fresh one.
                warn!(connection = conn.id, "Socket has no read half, reconnecting");
                self.forget_connection(&conn).await;
                resubscribe = true;
                continue;
            };

            if !self.is_current(epoch) {
                conn.restore_source(source);
                break;
            }
            self.set_state(SessionState::Listening);
            match self.read_frames(epoch, &conn, source).await {
                Ok(ReadExit::Closed) => {
                    info!(connection = conn.id, "Proxy connection closed");
                    self.forget_connection(&conn).await;
                    self.finish_listening(epoch);
                    break;
                }
                Ok(ReadExit::Stopped) => break,
                Err(e) => {
                    error!(connection = conn.id, error = %e, "Proxy connection lost");
                    self.forget_connection(&conn).await;
                    attempt += 1;
                    resubscribe = true;
                    if !self.backoff(epoch, attempt).await {
                        break;
                    }
                }
            }
        }

        let has_socket = self.inner.socket.lock().await.is_some();
        if has_socket {
            self.set_state(SessionState::ConnectedIdle);
        } else if self.inner.closed.load(Ordering::SeqCst) {
            self.set_state(SessionState::Closed);
        } else {
            self.set_state(SessionState::Disconnected);
        }
        debug!(epoch, "Read loop finished");
    }

    /// Wait before the next connect attempt. Returns false when the loop
    /// should stop instead.
    async fn backoff(&self, epoch: u64, attempt: u32) -> bool {
        let delay = self.inner.config.reconnect.delay_for(attempt);

        let stopped = self.inner.stop.notified();
        tokio::pin!(stopped);
        stopped.as_mut().enable();

        if !self.is_current(epoch) {
            return false;
        }

        self.set_state(SessionState::Reconnecting);
        info!(attempt, delay_ms = delay.as_millis() as u64, "Scheduling reconnect");

        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = &mut stopped => {
                debug!("Reconnect abandoned");
            }
        }
        self.is_current(epoch)
    }

    async fn read_frames(&self, epoch: u64, conn: &Connection, mut source: WsSource) -> ProxyResult<ReadExit> {
        loop {
            let stopped = self.inner.stop.notified();
            tokio::pin!(stopped);
            stopped.as_mut().enable();

            if !self.is_current(epoch) {
                conn.restore_source(source);
                return Ok(ReadExit::Stopped);
            }

            let next = tokio::select! {
                next = source.next() => next,
                _ = &mut stopped => continue,
            };

            match next {
                Some(Ok(Message::Text(text))) => {
                    debug!(connection = conn.id, len = text.len(), "Received frame");
                    if let Err(e) = self.dispatch(text.as_str()).await {
                        match self.inner.config.decode_error_policy {
                            DecodeErrorPolicy::Drop => {
                                warn!(connection = conn.id, error = %e, "Dropping undecodable frame");
                            }
                            DecodeErrorPolicy::Reconnect => return Err(e),
                        }
                    }
                }
                Some(Ok(Message::Close(frame))) => {
                    if conn.is_closing() || is_clean_close(frame.as_ref()) {
                        return Ok(ReadExit::Closed);
                    }
                    let detail = frame
                        .map(|f| format!("{} {}", u16::from(f.code), f.reason.as_str()))
                        .unwrap_or_default();
                    return Err(ProxyError::Connection(format!("proxy closed the connection: {}", detail)));
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    if conn.is_closing() {
                        return Ok(ReadExit::Closed);
                    }
                    return Err(e.into());
                }
                None => {
                    if conn.is_closing() {
                        return Ok(ReadExit::Closed);
                    }
                    return Err(ProxyError::Connection(
                        "stream ended without a close frame".to_string(),
                    ));
                }
            }
        }
    }

    /// Route one inbound frame.
    async fn dispatch(&self, frame: &str) -> ProxyResult<()> {
        match self.inner.codec.decode(frame)? {
            InboundFrame::Identity { peer_id } => {
                info!(peer_id = %peer_id, "Proxy announced peer id");
                *self.inner.peer_id.write() = Some(peer_id.clone());
                if let Some(callback) = &self.inner.peer_id_callback {
                    callback(peer_id);
                }
            }
            InboundFrame::Routed(message) => {
                let handler = self.inner.registry.lock().await.get(&message.protocol);
                match handler {
                    Some(handler) => handler.call(message).await,
                    None => {
                        debug!(protocol = %message.protocol, "Dropping message for unregistered protocol");
                    }
                }
            }
            InboundFrame::Unroutable(value) => {
                debug!(frame = %value, "Dropping frame without protocol");
            }
        }
        Ok(())
    }

    fn set_state(&self, state: SessionState) {
        let previous = self.inner.state.send_replace(state);
        if previous != state {
            debug!(parent: &self.inner.span, from = ?previous, to = ?state, "Session state changed");
        }
    }
}

fn is_clean_close(frame: Option<&CloseFrame>) -> bool {
    match frame {
        None => true,
        Some(frame) => matches!(frame.code, CloseCode::Normal | CloseCode::Away),
    }
}
