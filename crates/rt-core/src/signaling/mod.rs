//! Signaling Channel
//!
//! Named-event messaging with the relay server that pairs the two tunnel
//! peers. [`socketio`] speaks Socket.IO over a WebSocket; [`memory`] pairs
//! clients inside one process.

pub mod memory;
pub mod socketio;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc;

use crate::error::{Result, TunnelError};
use crate::protocol::{IceServer, TunnelMessage, ICE_SERVER_EVENT, SECRET_KEY_EVENT, TUNNEL_EVENT};

pub use memory::{MemoryRelay, MemorySignaling};
pub use socketio::{SocketIoClient, SocketIoConfig};

/// Something that happened on the signaling connection
#[derive(Debug, Clone, PartialEq)]
pub enum SignalingEvent {
    /// (Re)connected and ready to emit
    Connected,
    /// A named event from the server
    Event { name: String, payload: Value },
    Disconnected { reason: String },
}

pub type SignalingEvents = mpsc::UnboundedReceiver<SignalingEvent>;

/// Client side of the signaling server
#[async_trait]
pub trait SignalingClient: Send + Sync {
    /// Send a named event
    async fn emit(&self, event: &str, payload: Value) -> Result<()>;

    /// Send a named event without payload and wait for the server's reply
    async fn request(&self, event: &str) -> Result<Value>;

    /// Take the event receiver. Only the first call returns `Some`.
    fn take_events(&self) -> Option<SignalingEvents>;

    /// Disconnect for good
    async fn close(&self);
}

/// Register with the server under the shared secret
pub async fn send_secret_key(client: &dyn SignalingClient, secret_key: &str) -> Result<()> {
    client
        .emit(SECRET_KEY_EVENT, Value::String(secret_key.to_string()))
        .await
}

pub async fn send_tunnel_message(client: &dyn SignalingClient, message: &TunnelMessage) -> Result<()> {
    client.emit(TUNNEL_EVENT, serde_json::to_value(message)?).await
}

/// Fetch STUN/TURN servers from the signaling server
pub async fn request_ice_servers(client: &dyn SignalingClient) -> Result<Vec<IceServer>> {
    let reply = client.request(ICE_SERVER_EVENT).await?;
    if reply.is_null() {
        return Ok(Vec::new());
    }
    serde_json::from_value(reply).map_err(|e| TunnelError::SignalingRequest {
        event: ICE_SERVER_EVENT.to_string(),
        reason: e.to_string(),
    })
}

/// Parse a `tunnel` payload; `None` for unknown or malformed messages
pub fn parse_tunnel_message(payload: &Value) -> Option<TunnelMessage> {
    serde_json::from_value(payload.clone()).ok()
}
