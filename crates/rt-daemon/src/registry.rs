//! Session Registry
//!
//! Live endpoints by session id, one table per role.

use rt_core::{ListenEndpoint, SendEndpoint, SessionRole};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Shared tables of live sessions
#[derive(Clone, Default)]
pub struct SessionRegistry {
    listen: Arc<RwLock<HashMap<String, Arc<ListenEndpoint>>>>,
    send: Arc<RwLock<HashMap<String, Arc<SendEndpoint>>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert_listen(&self, endpoint: Arc<ListenEndpoint>) {
        self.listen
            .write()
            .await
            .insert(endpoint.id().to_string(), endpoint);
    }

    /// Register a sending session; returns the one it replaced, if any
    pub async fn insert_send(&self, endpoint: Arc<SendEndpoint>) -> Option<Arc<SendEndpoint>> {
        self.send
            .write()
            .await
            .insert(endpoint.id().to_string(), endpoint)
    }

    pub async fn listen(&self, id: &str) -> Option<Arc<ListenEndpoint>> {
        self.listen.read().await.get(id).cloned()
    }

    pub async fn send(&self, id: &str) -> Option<Arc<SendEndpoint>> {
        self.send.read().await.get(id).cloned()
    }

    /// Forget the session under `id` if it has closed.
    ///
    /// A live endpoint that replaced a closed one under the same id is kept.
    pub async fn remove_closed(&self, role: SessionRole, id: &str) -> bool {
        match role {
            SessionRole::Listen => {
                let mut listen = self.listen.write().await;
                let closed = listen.get(id).is_some_and(|endpoint| endpoint.is_closed());
                closed && listen.remove(id).is_some()
            }
            SessionRole::Send => {
                let mut send = self.send.write().await;
                let closed = send.get(id).is_some_and(|endpoint| endpoint.is_closed());
                closed && send.remove(id).is_some()
            }
        }
    }

    pub async fn listen_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.listen.read().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub async fn send_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.send.read().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub async fn len(&self) -> usize {
        self.listen.read().await.len() + self.send.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Close one session of either role; returns false if unknown
    pub async fn close(&self, id: &str, reason: &str) -> bool {
        if let Some(endpoint) = self.listen(id).await {
            endpoint.close(reason).await;
            return true;
        }
        if let Some(endpoint) = self.send(id).await {
            endpoint.close(reason).await;
            return true;
        }
        false
    }

    /// Remove and close every session
    pub async fn close_all(&self, reason: &str) {
        let listen: Vec<_> = self.listen.write().await.drain().map(|(_, e)| e).collect();
        let send: Vec<_> = self.send.write().await.drain().map(|(_, e)| e).collect();

        for endpoint in listen {
            endpoint.close(reason).await;
        }
        for endpoint in send {
            endpoint.close(reason).await;
        }
    }
}
