//! Proxy wire messages and the codec that shapes them.

use crate::error::{ProxyError, ProxyResult};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Control message declaring the full set of protocols to route to this client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscribeRequest {
    pub protocols_to_listen: Vec<String>,
}

/// Application data addressed to a protocol, optionally on a specific peer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboundMessage {
    pub protocol: String,
    /// Target peer; empty means "let the proxy decide".
    #[serde(rename = "serverPeerId", default)]
    pub server_peer_id: String,
    pub data: Value,
    /// Ask the proxy to persist the message.
    #[serde(default)]
    pub save_data: bool,
}

impl OutboundMessage {
    /// Create a message for `protocol` with no target peer.
    pub fn new(protocol: impl Into<String>, data: impl Into<Value>) -> Self {
        Self {
            protocol: protocol.into(),
            server_peer_id: String::new(),
            data: data.into(),
            save_data: false,
        }
    }

    /// Address the message to a specific peer.
    pub fn to_peer(mut self, peer_id: impl Into<String>) -> Self {
        self.server_peer_id = peer_id.into();
        self
    }

    /// Request server-side persistence.
    pub fn save_data(mut self, save: bool) -> Self {
        self.save_data = save;
        self
    }
}

/// An inbound message routed to a protocol handler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InboundMessage {
    pub protocol: String,
    #[serde(default)]
    pub data: Value,
    /// Any other fields the proxy attached to the frame.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl InboundMessage {
    /// Deserialize the payload.
    ///
    /// Peers commonly send JSON documents as strings; a string payload that
    /// does not deserialize directly is parsed as JSON first.
    pub fn data_as<T: DeserializeOwned>(&self) -> ProxyResult<T> {
        match serde_json::from_value(self.data.clone()) {
            Ok(value) => Ok(value),
            Err(err) => match &self.data {
                Value::String(raw) => Ok(serde_json::from_str(raw)?),
                _ => Err(err.into()),
            },
        }
    }
}

/// A decoded inbound frame.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundFrame {
    /// The proxy announcing the peer id assigned to this connection.
    Identity { peer_id: String },
    /// A message for a subscribed protocol.
    Routed(InboundMessage),
    /// A well-formed frame with neither an identity nor a protocol.
    Unroutable(Value),
}

/// Encodes outbound requests and decodes inbound frames.
pub trait MessageCodec: Send + Sync {
    fn encode_subscribe(&self, protocols: &[String]) -> ProxyResult<String>;
    fn encode_data(&self, message: &OutboundMessage) -> ProxyResult<String>;
    fn decode(&self, frame: &str) -> ProxyResult<InboundFrame>;
}

/// The JSON schema spoken by the libp2p proxy server.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl MessageCodec for JsonCodec {
    fn encode_subscribe(&self, protocols: &[String]) -> ProxyResult<String> {
        let request = SubscribeRequest {
            protocols_to_listen: protocols.to_vec(),
        };
        Ok(serde_json::to_string(&request)?)
    }

    fn encode_data(&self, message: &OutboundMessage) -> ProxyResult<String> {
        Ok(serde_json::to_string(message)?)
    }

    fn decode(&self, frame: &str) -> ProxyResult<InboundFrame> {
        let value: Value =
            serde_json::from_str(frame).map_err(|e| ProxyError::Decode(e.to_string()))?;

        let Value::Object(mut fields) = value else {
            return Err(ProxyError::Decode(format!(
                "expected a JSON object, got {}",
                json_kind(&value)
            )));
        };

        if let Some(peer_id) = fields.get("peerId") {
            let peer_id = match peer_id {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            return Ok(InboundFrame::Identity { peer_id });
        }

        match fields.remove("protocol") {
            Some(Value::String(protocol)) => {
                let data = fields.remove("data").unwrap_or(Value::Null);
                Ok(InboundFrame::Routed(InboundMessage {
                    protocol,
                    data,
                    extra: fields,
                }))
            }
            Some(other) => {
                fields.insert("protocol".to_string(), other);
                Ok(InboundFrame::Unroutable(Value::Object(fields)))
            }
            None => Ok(InboundFrame::Unroutable(Value::Object(fields))),
        }
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}
