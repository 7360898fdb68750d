//! Connection registry for active WebSocket clients.
//!
//! Each connection owns a bounded outbound buffer; broadcast iterates over a
//! copy of the active set so a slow consumer never blocks the registry. An
//! event flagged drop-if-slow is discarded when its target's buffer is full;
//! anything else is handed to a detached task so the broadcaster itself never
//! stalls.

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use log::{debug, warn};
use serde_json::Value;
use tokio::sync::mpsc;

use super::authorize::ConnectionAuth;
use super::protocol::EventFrame;

/// Size of the per-connection outbound buffer.
const OUTBOUND_BUFFER_SIZE: usize = 64;

/// Messages flowing to a connection's writer task.
#[derive(Debug, Clone)]
pub enum Outbound {
    /// A serialized frame to write as one text message.
    Text(String),
    /// Ask the writer task to close the socket.
    Close,
}

/// One connected client.
#[derive(Debug)]
pub struct ClientHandle {
    pub conn_id: u64,
    pub auth: ConnectionAuth,
    pub source_ip: Option<String>,
    sender: mpsc::Sender<Outbound>,
}

impl ClientHandle {
    pub fn tenant_id(&self) -> Option<&str> {
        self.auth.tenant_id.as_deref()
    }

    /// Queue an outbound message. With `drop_if_slow`, a full buffer drops
    /// the message; otherwise delivery is retried off the caller's task.
    pub fn send(&self, message: Outbound, drop_if_slow: bool) {
        match self.sender.try_send(message) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(message)) => {
                if drop_if_slow {
                    debug!("conn {}: outbound buffer full, dropping event", self.conn_id);
                    return;
                }
                let sender = self.sender.clone();
                let conn_id = self.conn_id;
                tokio::spawn(async move {
                    if sender.send(message).await.is_err() {
                        debug!("conn {conn_id}: closed before queued message was delivered");
                    }
                });
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!("conn {}: send after close ignored", self.conn_id);
            }
        }
    }

    pub fn send_text(&self, text: String, drop_if_slow: bool) {
        self.send(Outbound::Text(text), drop_if_slow);
    }

    /// Ask the connection's writer to shut the socket down.
    pub fn close(&self) {
        self.send(Outbound::Close, false);
    }
}

/// Registry of active connections.
#[derive(Clone, Default)]
pub struct ConnectionRegistry {
    clients: Arc<DashMap<u64, Arc<ClientHandle>>>,
    next_id: Arc<AtomicU64>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new connection, returning its handle and the receiving end
    /// of its outbound buffer for the writer task.
    pub fn add_client(
        &self,
        auth: ConnectionAuth,
        source_ip: Option<String>,
    ) -> (Arc<ClientHandle>, mpsc::Receiver<Outbound>) {
        let (sender, receiver) = mpsc::channel(OUTBOUND_BUFFER_SIZE);
        let conn_id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let handle = Arc::new(ClientHandle {
            conn_id,
            auth,
            source_ip,
            sender,
        });
        self.clients.insert(conn_id, handle.clone());
        debug!("conn {conn_id}: registered");
        (handle, receiver)
    }

    pub fn remove_client(&self, conn_id: u64) {
        if self.clients.remove(&conn_id).is_some() {
            debug!("conn {conn_id}: removed");
        }
    }

    pub fn get(&self, conn_id: u64) -> Option<Arc<ClientHandle>> {
        self.clients.get(&conn_id).map(|c| c.clone())
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }

    /// Copy-on-iterate view of all clients.
    pub fn snapshot(&self) -> Vec<Arc<ClientHandle>> {
        self.clients.iter().map(|c| c.clone()).collect()
    }

    pub fn for_each_client(&self, mut f: impl FnMut(&ClientHandle)) {
        for client in self.snapshot() {
            f(&client);
        }
    }

    pub fn clients_by_ip(&self, ip: &str) -> Vec<Arc<ClientHandle>> {
        self.snapshot()
            .into_iter()
            .filter(|c| c.source_ip.as_deref() == Some(ip))
            .collect()
    }

    /// True if any client, tenant or not, connected from the given IP.
    pub fn has_authorized_client_for_ip(&self, ip: &str) -> bool {
        !self.clients_by_ip(ip).is_empty()
    }

    /// Fan an event out to every connection.
    pub fn broadcast(&self, event: &str, payload: Value, drop_if_slow: bool) {
        let frame = EventFrame::new(event, payload);
        let Ok(text) = serde_json::to_string(&frame) else {
            warn!("unserializable broadcast event '{event}'");
            return;
        };
        for client in self.snapshot() {
            client.send_text(text.clone(), drop_if_slow);
        }
    }

    /// Fan an event out to the given connection ids only.
    pub fn broadcast_to_conn_ids(
        &self,
        event: &str,
        payload: Value,
        conn_ids: &HashSet<u64>,
        drop_if_slow: bool,
    ) {
        let frame = EventFrame::new(event, payload);
        let Ok(text) = serde_json::to_string(&frame) else {
            warn!("unserializable broadcast event '{event}'");
            return;
        };
        for conn_id in conn_ids {
            if let Some(client) = self.get(*conn_id) {
                client.send_text(text.clone(), drop_if_slow);
            }
        }
    }

    /// Close and drop every connection authenticated as the given tenant.
    /// Invoked when a tenant is disabled or removed.
    pub fn evict_tenant(&self, tenant_id: &str) -> usize {
        let victims: Vec<Arc<ClientHandle>> = self
            .snapshot()
            .into_iter()
            .filter(|c| c.tenant_id() == Some(tenant_id))
            .collect();
        for client in &victims {
            client.close();
            self.clients.remove(&client.conn_id);
        }
        victims.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::authorize::Role;
    use serde_json::json;

    fn tenant_auth(tenant_id: &str) -> ConnectionAuth {
        ConnectionAuth {
            role: Some(Role::Operator),
            scopes: vec!["operator.write".to_string()],
            tenant_id: Some(tenant_id.to_string()),
        }
    }

    #[tokio::test]
    async fn test_broadcast_to_conn_ids_restricts_targets() {
        let registry = ConnectionRegistry::new();
        let (a, mut rx_a) = registry.add_client(tenant_auth("a"), None);
        let (_b, mut rx_b) = registry.add_client(tenant_auth("b"), None);

        let mut only_a = HashSet::new();
        only_a.insert(a.conn_id);
        registry.broadcast_to_conn_ids("terminal.output", json!({"data": "x"}), &only_a, true);

        let got = rx_a.recv().await.unwrap();
        assert!(matches!(got, Outbound::Text(t) if t.contains("terminal.output")));
        assert!(rx_b.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_drop_if_slow_discards_on_full_buffer() {
        let registry = ConnectionRegistry::new();
        let (client, mut rx) = registry.add_client(tenant_auth("a"), None);
        // Fill the buffer without draining it.
        for i in 0..OUTBOUND_BUFFER_SIZE {
            client.send_text(format!("m{i}"), false);
        }
        client.send_text("dropped".to_string(), true);

        let mut seen = Vec::new();
        while let Ok(Outbound::Text(t)) = rx.try_recv() {
            seen.push(t);
        }
        assert_eq!(seen.len(), OUTBOUND_BUFFER_SIZE);
        assert!(!seen.iter().any(|t| t == "dropped"));
    }

    #[tokio::test]
    async fn test_evict_tenant_closes_connections() {
        let registry = ConnectionRegistry::new();
        let (_a, mut rx_a) = registry.add_client(tenant_auth("a"), Some("10.0.0.1".into()));
        registry.add_client(tenant_auth("b"), Some("10.0.0.2".into()));

        assert_eq!(registry.evict_tenant("a"), 1);
        assert_eq!(registry.len(), 1);
        assert!(matches!(rx_a.recv().await, Some(Outbound::Close)));
        assert!(!registry.has_authorized_client_for_ip("10.0.0.1"));
        assert!(registry.has_authorized_client_for_ip("10.0.0.2"));
    }
}
