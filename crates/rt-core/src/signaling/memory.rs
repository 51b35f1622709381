//! In-Process Signaling Relay
//!
//! Behaves like the signaling server for clients in the same process: clients
//! register with `secretKey`, `tunnel` events reach every other client that
//! registered the same key, and `iceServer` requests return a fixed list.

use async_trait::async_trait;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use tokio::sync::mpsc;

use super::{SignalingClient, SignalingEvent, SignalingEvents};
use crate::error::{Result, TunnelError};
use crate::protocol::{IceServer, ICE_SERVER_EVENT, SECRET_KEY_EVENT, TUNNEL_EVENT};
use crate::sync::lock;

/// Shared rendezvous for [`MemorySignaling`] clients
#[derive(Clone, Default)]
pub struct MemoryRelay {
    inner: Arc<RelayInner>,
}

#[derive(Default)]
struct RelayInner {
    clients: Mutex<Vec<Weak<ClientShared>>>,
    ice_servers: Mutex<Vec<IceServer>>,
}

impl MemoryRelay {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder pattern: servers returned to `iceServer` requests
    pub fn with_ice_servers(self, servers: Vec<IceServer>) -> Self {
        *lock(&self.inner.ice_servers) = servers;
        self
    }

    /// A new client, already connected
    pub fn client(&self) -> MemorySignaling {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let shared = Arc::new(ClientShared {
            relay: Arc::downgrade(&self.inner),
            event_tx,
            secret_key: Mutex::new(None),
            emitted: Mutex::new(Vec::new()),
            connected: AtomicBool::new(true),
        });
        let _ = shared.event_tx.send(SignalingEvent::Connected);
        lock(&self.inner.clients).push(Arc::downgrade(&shared));

        MemorySignaling {
            shared,
            events: Mutex::new(Some(event_rx)),
        }
    }
}

impl RelayInner {
    fn forward(&self, from: &ClientShared, name: &str, payload: &Value) {
        let Some(key) = lock(&from.secret_key).clone() else {
            return;
        };
        let clients: Vec<Arc<ClientShared>> = lock(&self.clients)
            .iter()
            .filter_map(Weak::upgrade)
            .collect();

        for client in clients {
            if std::ptr::eq(client.as_ref(), from) || !client.connected.load(Ordering::SeqCst) {
                continue;
            }
            if lock(&client.secret_key).as_deref() == Some(key.as_str()) {
                let _ = client.event_tx.send(SignalingEvent::Event {
                    name: name.to_string(),
                    payload: payload.clone(),
                });
            }
        }
    }
}

struct ClientShared {
    relay: Weak<RelayInner>,
    event_tx: mpsc::UnboundedSender<SignalingEvent>,
    secret_key: Mutex<Option<String>>,
    emitted: Mutex<Vec<(String, Value)>>,
    connected: AtomicBool,
}

/// One client of a [`MemoryRelay`]
pub struct MemorySignaling {
    shared: Arc<ClientShared>,
    events: Mutex<Option<SignalingEvents>>,
}

impl MemorySignaling {
    /// Every event emitted so far, in order
    pub fn emitted(&self) -> Vec<(String, Value)> {
        lock(&self.shared.emitted).clone()
    }

    /// Drop the connection; the server forgets the registration
    pub fn disconnect(&self, reason: &str) {
        if self.shared.connected.swap(false, Ordering::SeqCst) {
            *lock(&self.shared.secret_key) = None;
            let _ = self.shared.event_tx.send(SignalingEvent::Disconnected {
                reason: reason.to_string(),
            });
        }
    }

    pub fn reconnect(&self) {
        if !self.shared.connected.swap(true, Ordering::SeqCst) {
            let _ = self.shared.event_tx.send(SignalingEvent::Connected);
        }
    }

    fn ensure_connected(&self) -> Result<()> {
        if self.shared.connected.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(TunnelError::SignalingConnection("not connected".to_string()))
        }
    }
}

#[async_trait]
impl SignalingClient for MemorySignaling {
    async fn emit(&self, event: &str, payload: Value) -> Result<()> {
        self.ensure_connected()?;
        lock(&self.shared.emitted).push((event.to_string(), payload.clone()));

        match event {
            SECRET_KEY_EVENT => {
                *lock(&self.shared.secret_key) = payload.as_str().map(str::to_string);
            }
            TUNNEL_EVENT => {
                if let Some(relay) = self.shared.relay.upgrade() {
                    relay.forward(&self.shared, event, &payload);
                }
            }
            _ => {}
        }
        Ok(())
    }

    async fn request(&self, event: &str) -> Result<Value> {
        self.ensure_connected()?;
        let relay = self.shared.relay.upgrade().ok_or_else(|| {
            TunnelError::SignalingConnection("relay is gone".to_string())
        })?;

        match event {
            ICE_SERVER_EVENT => Ok(serde_json::to_value(&*lock(&relay.ice_servers))?),
            other => Err(TunnelError::SignalingRequest {
                event: other.to_string(),
                reason: "no handler".to_string(),
            }),
        }
    }

    fn take_events(&self) -> Option<SignalingEvents> {
        lock(&self.events).take()
    }

    async fn close(&self) {
        self.disconnect("closed");
    }
}
