//! WebSocket client for a libp2p proxy server.
//!
//! The proxy does the peer-to-peer networking; this crate multiplexes named
//! protocols over one websocket to it.
//!
//! This crate provides:
//! - Lazy connection to the proxy, shared by every sender
//! - A single read loop dispatching frames to per-protocol handlers
//! - Automatic reconnection that re-announces every registered protocol
//! - Peer identity announcements routed to a dedicated callback
//!
//! # Architecture
//!
//! ```text
//! ProxyClient ──subscribe/send──> Session ──ws──> proxy server
//!      │                            │
//!      └──> ProtocolRegistry <──dispatch── read loop
//! ```

mod client;
mod config;
mod error;
mod messages;
mod registry;
mod session;

#[cfg(test)]
mod tests;

pub use client::{ProxyClient, ProxyClientBuilder};
pub use config::{
    DecodeErrorPolicy, ProxyConfig, ReconnectConfig, DEFAULT_CONNECT_TIMEOUT, DEFAULT_PROXY_URL, DEFAULT_RECONNECT_DELAY,
};
pub use error::{ProxyError, ProxyResult};
pub use messages::{InboundFrame, InboundMessage, JsonCodec, MessageCodec, OutboundMessage, SubscribeRequest};
pub use registry::{Handler, ProtocolRegistry, SharedRegistry};
pub use session::{PeerIdCallback, Session, SessionOptions, SessionState};
