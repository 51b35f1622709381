//! Socket.IO Client
//!
//! Minimal Socket.IO v5 client over the Engine.IO v4 WebSocket transport.
//! Supports what the tunnel needs: events on the default namespace,
//! acknowledged requests and ping replies. Reconnects after a fixed delay
//! until closed.

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{SignalingClient, SignalingEvent, SignalingEvents};
use crate::error::{Result, TunnelError};
use crate::sync::lock;

pub const DEFAULT_PATH: &str = "/socket.io";
pub const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_millis(3000);
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Where and how to connect
#[derive(Debug, Clone)]
pub struct SocketIoConfig {
    /// Server URL (`http`, `https`, `ws` or `wss`)
    pub url: String,

    /// Socket.IO endpoint path
    pub path: String,

    pub reconnect_delay: Duration,

    /// How long a request waits for its acknowledgement
    pub request_timeout: Duration,
}

impl SocketIoConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            path: DEFAULT_PATH.to_string(),
            reconnect_delay: DEFAULT_RECONNECT_DELAY,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }

    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        self.path = path.into();
        self
    }

    pub fn with_reconnect_delay(mut self, delay: Duration) -> Self {
        self.reconnect_delay = delay;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }
}

/// WebSocket URL of the Engine.IO endpoint for `url` and `path`
pub fn websocket_url(url: &str, path: &str) -> Result<String> {
    let base = if let Some(rest) = url.strip_prefix("http://") {
        format!("ws://{}", rest)
    } else if let Some(rest) = url.strip_prefix("https://") {
        format!("wss://{}", rest)
    } else if url.starts_with("ws://") || url.starts_with("wss://") {
        url.to_string()
    } else {
        return Err(TunnelError::SignalingConnection(format!(
            "unsupported server url '{}'",
            url
        )));
    };

    let path = path.trim_matches('/');
    let path = if path.is_empty() { DEFAULT_PATH.trim_start_matches('/') } else { path };
    Ok(format!(
        "{}/{}/?EIO=4&transport=websocket",
        base.trim_end_matches('/'),
        path
    ))
}

// ─────────────────────────────────────────────────────────────────────────────
// Packets
// ─────────────────────────────────────────────────────────────────────────────

/// A decoded Engine.IO / Socket.IO frame
#[derive(Debug, Clone, PartialEq)]
pub enum Packet {
    /// Engine.IO handshake
    Open(Value),
    Close,
    Ping,
    Pong,
    Noop,
    /// Socket.IO namespace connected
    Connect(Value),
    Disconnect,
    Event {
        name: String,
        payload: Value,
        ack: Option<u64>,
    },
    Ack { id: u64, args: Vec<Value> },
    ConnectError(Value),
}

fn parse_json(text: &str) -> Result<Value> {
    if text.is_empty() {
        return Ok(Value::Null);
    }
    serde_json::from_str(text).map_err(|e| TunnelError::SignalingPacket(e.to_string()))
}

/// Decode one WebSocket text frame
pub fn decode_packet(frame: &str) -> Result<Packet> {
    let mut chars = frame.chars();
    let engine = chars
        .next()
        .ok_or_else(|| TunnelError::SignalingPacket("empty frame".to_string()))?;
    let rest = chars.as_str();

    match engine {
        '0' => Ok(Packet::Open(parse_json(rest)?)),
        '1' => Ok(Packet::Close),
        '2' => Ok(Packet::Ping),
        '3' => Ok(Packet::Pong),
        '6' => Ok(Packet::Noop),
        '4' => decode_socket_packet(rest),
        other => Err(TunnelError::SignalingPacket(format!(
            "unknown engine packet type '{}'",
            other
        ))),
    }
}

fn decode_socket_packet(frame: &str) -> Result<Packet> {
    let mut chars = frame.chars();
    let kind = chars
        .next()
        .ok_or_else(|| TunnelError::SignalingPacket("empty message".to_string()))?;
    let mut rest = chars.as_str();

    // Only the default namespace is used
    if rest.starts_with('/') {
        rest = rest.split_once(',').map(|(_, tail)| tail).unwrap_or("");
    }

    let digits = rest.find(|c: char| !c.is_ascii_digit()).unwrap_or(rest.len());
    let id = if digits > 0 { rest[..digits].parse::<u64>().ok() } else { None };
    let body = &rest[digits..];

    match kind {
        '0' => Ok(Packet::Connect(parse_json(body)?)),
        '1' => Ok(Packet::Disconnect),
        '2' => {
            let mut args = match parse_json(body)? {
                Value::Array(args) => args.into_iter(),
                _ => return Err(TunnelError::SignalingPacket("event is not an array".to_string())),
            };
            let name = match args.next() {
                Some(Value::String(name)) => name,
                _ => return Err(TunnelError::SignalingPacket("event has no name".to_string())),
            };
            Ok(Packet::Event {
                name,
                payload: args.next().unwrap_or(Value::Null),
                ack: id,
            })
        }
        '3' => {
            let id = id.ok_or_else(|| TunnelError::SignalingPacket("ack without id".to_string()))?;
            let args = match parse_json(body)? {
                Value::Array(args) => args,
                Value::Null => Vec::new(),
                other => vec![other],
            };
            Ok(Packet::Ack { id, args })
        }
        '4' => Ok(Packet::ConnectError(parse_json(body)?)),
        other => Err(TunnelError::SignalingPacket(format!(
            "unsupported socket packet type '{}'",
            other
        ))),
    }
}

/// Socket.IO connect request for the default namespace
pub fn encode_connect() -> String {
    "40".to_string()
}

/// Encode an event; `payload` is omitted when `None`
pub fn encode_event(name: &str, payload: Option<&Value>, ack: Option<u64>) -> Result<String> {
    let mut args = vec![Value::String(name.to_string())];
    if let Some(payload) = payload {
        args.push(payload.clone());
    }
    let body = serde_json::to_string(&args)?;
    Ok(match ack {
        Some(id) => format!("42{}{}", id, body),
        None => format!("42{}", body),
    })
}

// ─────────────────────────────────────────────────────────────────────────────
// Client
// ─────────────────────────────────────────────────────────────────────────────

struct ClientInner {
    config: SocketIoConfig,
    /// Writer of the current connection; `None` while disconnected
    outbound: Mutex<Option<mpsc::UnboundedSender<String>>>,
    pending: Mutex<HashMap<u64, oneshot::Sender<Vec<Value>>>>,
    next_ack: AtomicU64,
    event_tx: mpsc::UnboundedSender<SignalingEvent>,
    cancel: CancellationToken,
}

/// Reconnecting Socket.IO client
pub struct SocketIoClient {
    inner: Arc<ClientInner>,
    events: Mutex<Option<SignalingEvents>>,
}

impl SocketIoClient {
    /// Start connecting in the background
    pub fn connect(config: SocketIoConfig) -> Self {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let inner = Arc::new(ClientInner {
            config,
            outbound: Mutex::new(None),
            pending: Mutex::new(HashMap::new()),
            next_ack: AtomicU64::new(0),
            event_tx,
            cancel: CancellationToken::new(),
        });

        tokio::spawn(connection_loop(Arc::clone(&inner)));

        Self {
            inner,
            events: Mutex::new(Some(event_rx)),
        }
    }

    fn sender(&self) -> Result<mpsc::UnboundedSender<String>> {
        lock(&self.inner.outbound)
            .clone()
            .ok_or_else(|| TunnelError::SignalingConnection("not connected".to_string()))
    }
}

#[async_trait]
impl SignalingClient for SocketIoClient {
    async fn emit(&self, event: &str, payload: Value) -> Result<()> {
        let frame = encode_event(event, Some(&payload), None)?;
        self.sender()?
            .send(frame)
            .map_err(|_| TunnelError::SignalingConnection("connection lost".to_string()))
    }

    async fn request(&self, event: &str) -> Result<Value> {
        let sender = self.sender()?;
        let id = self.inner.next_ack.fetch_add(1, Ordering::Relaxed);
        let (reply_tx, reply_rx) = oneshot::channel();
        lock(&self.inner.pending).insert(id, reply_tx);

        let failed = |reason: &str| TunnelError::SignalingRequest {
            event: event.to_string(),
            reason: reason.to_string(),
        };

        if sender.send(encode_event(event, None, Some(id))?).is_err() {
            lock(&self.inner.pending).remove(&id);
            return Err(failed("connection lost"));
        }

        match tokio::time::timeout(self.inner.config.request_timeout, reply_rx).await {
            Ok(Ok(args)) => Ok(args.into_iter().next().unwrap_or(Value::Null)),
            Ok(Err(_)) => Err(failed("connection lost")),
            Err(_) => {
                lock(&self.inner.pending).remove(&id);
                Err(failed("timed out"))
            }
        }
    }

    fn take_events(&self) -> Option<SignalingEvents> {
        lock(&self.events).take()
    }

    async fn close(&self) {
        self.inner.cancel.cancel();
    }
}

impl Drop for SocketIoClient {
    fn drop(&mut self) {
        self.inner.cancel.cancel();
    }
}

async fn connection_loop(inner: Arc<ClientInner>) {
    loop {
        let reason = match run_connection(&inner).await {
            Ok(()) => "connection closed".to_string(),
            Err(e) => {
                warn!("Signaling connection error: {}", e);
                e.to_string()
            }
        };

        // Pending requests fail once their reply senders are dropped
        *lock(&inner.outbound) = None;
        lock(&inner.pending).clear();
        let _ = inner.event_tx.send(SignalingEvent::Disconnected { reason });

        tokio::select! {
            _ = inner.cancel.cancelled() => break,
            _ = tokio::time::sleep(inner.config.reconnect_delay) => {}
        }
        info!("Reconnecting to {}", inner.config.url);
    }
    debug!("Signaling client stopped");
}

async fn run_connection(inner: &ClientInner) -> Result<()> {
    let url = websocket_url(&inner.config.url, &inner.config.path)?;
    let (ws, _) = tokio::select! {
        _ = inner.cancel.cancelled() => return Ok(()),
        result = tokio_tungstenite::connect_async(url.as_str()) => result?,
    };
    debug!("WebSocket connected to {}", url);

    let (mut write, mut read) = ws.split();
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<String>();

    loop {
        tokio::select! {
            _ = inner.cancel.cancelled() => {
                let _ = write.send(Message::Close(None)).await;
                return Ok(());
            }
            Some(frame) = out_rx.recv() => {
                write.send(Message::Text(frame.into())).await?;
            }
            message = read.next() => {
                let text = match message {
                    Some(Ok(Message::Text(text))) => text,
                    Some(Ok(Message::Close(_))) | None => return Ok(()),
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => return Err(e.into()),
                };

                let packet = match decode_packet(text.as_str()) {
                    Ok(packet) => packet,
                    Err(e) => {
                        debug!("Ignoring signaling frame: {}", e);
                        continue;
                    }
                };

                match packet {
                    Packet::Open(_) => write.send(Message::Text(encode_connect().into())).await?,
                    Packet::Ping => write.send(Message::Text("3".into())).await?,
                    Packet::Connect(_) => {
                        info!("Connected to signaling server {}", inner.config.url);
                        *lock(&inner.outbound) = Some(out_tx.clone());
                        let _ = inner.event_tx.send(SignalingEvent::Connected);
                    }
                    Packet::Event { name, payload, .. } => {
                        let _ = inner.event_tx.send(SignalingEvent::Event { name, payload });
                    }
                    Packet::Ack { id, args } => {
                        let waiter = lock(&inner.pending).remove(&id);
                        if let Some(waiter) = waiter {
                            let _ = waiter.send(args);
                        }
                    }
                    Packet::ConnectError(reason) => {
                        return Err(TunnelError::SignalingConnection(reason.to_string()));
                    }
                    Packet::Disconnect | Packet::Close => return Ok(()),
                    Packet::Pong | Packet::Noop => {}
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_websocket_url() {
        assert_eq!(
            websocket_url("http://example.com:3000", "/socket.io").unwrap(),
            "ws://example.com:3000/socket.io/?EIO=4&transport=websocket"
        );
        assert_eq!(
            websocket_url("https://example.com/", "/tunnel/").unwrap(),
            "wss://example.com/tunnel/?EIO=4&transport=websocket"
        );
        assert_eq!(
            websocket_url("ws://127.0.0.1:9000", "").unwrap(),
            "ws://127.0.0.1:9000/socket.io/?EIO=4&transport=websocket"
        );
        assert!(websocket_url("ftp://example.com", "/socket.io").is_err());
    }

    #[test]
    fn test_decode_engine_packets() {
        assert_eq!(
            decode_packet(r#"0{"sid":"abc","pingInterval":25000}"#).unwrap(),
            Packet::Open(json!({"sid": "abc", "pingInterval": 25000}))
        );
        assert_eq!(decode_packet("2").unwrap(), Packet::Ping);
        assert_eq!(decode_packet("6").unwrap(), Packet::Noop);
        assert!(decode_packet("").is_err());
        assert!(decode_packet("9").is_err());
    }

    #[test]
    fn test_decode_socket_packets() {
        assert_eq!(
            decode_packet(r#"40{"sid":"xyz"}"#).unwrap(),
            Packet::Connect(json!({"sid": "xyz"}))
        );
        assert_eq!(
            decode_packet(r#"42["tunnel",{"type":"answer"}]"#).unwrap(),
            Packet::Event {
                name: "tunnel".to_string(),
                payload: json!({"type": "answer"}),
                ack: None,
            }
        );
        assert_eq!(
            decode_packet(r#"4312[[{"urls":"stun:stun.example.com"}]]"#).unwrap(),
            Packet::Ack {
                id: 12,
                args: vec![json!([{"urls": "stun:stun.example.com"}])],
            }
        );
        assert_eq!(decode_packet("41").unwrap(), Packet::Disconnect);
        assert!(matches!(
            decode_packet(r#"44{"message":"nope"}"#).unwrap(),
            Packet::ConnectError(_)
        ));
        assert!(decode_packet(r#"42{"not":"an array"}"#).is_err());
    }

    #[test]
    fn test_decode_namespaced_event() {
        assert_eq!(
            decode_packet(r#"42/admin,7["hello",1]"#).unwrap(),
            Packet::Event {
                name: "hello".to_string(),
                payload: json!(1),
                ack: Some(7),
            }
        );
    }

    #[test]
    fn test_encode_event() {
        assert_eq!(
            encode_event("secretKey", Some(&json!("s3cret")), None).unwrap(),
            r#"42["secretKey","s3cret"]"#
        );
        assert_eq!(encode_event("iceServer", None, Some(3)).unwrap(), r#"423["iceServer"]"#);
    }

    #[tokio::test]
    async fn test_emit_before_connect_fails() {
        let client = SocketIoClient::connect(
            SocketIoConfig::new("http://127.0.0.1:1").with_reconnect_delay(Duration::from_secs(60)),
        );
        assert!(client.emit("secretKey", json!("x")).await.is_err());
        assert!(client.request("iceServer").await.is_err());
        client.close().await;
    }
}
