//! Remote queue managers: proxy namespaces for peer brokers.
//!
//! A [`RemoteManager`] mirrors one peer's queue list as [`RemoteQueue`]
//! proxies that forward `put`/`get` over a pooled connection instead of
//! storing messages locally. The proxy set stays empty until a sys-state
//! notification supplies the peer's current list.

use crate::manager::{QueueHandle, QueueManager};
use crate::queue::canonical_name;
use crate::wire;
use async_trait::async_trait;
use dashmap::DashMap;
use ferrumq_core::message::keys;
use ferrumq_core::{
    CompletionCode, Error, Message, Priority, Properties, RequestType, Result,
};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Marker property on forwarded requests whose payload embeds a full message.
pub const EMBEDDED: &str = "embedded";

/// Client side of a peer connection with a small connection pool.
///
/// Connections are returned to the pool after a successful exchange and
/// dropped on any error; a fresh connect replaces them on demand.
#[derive(Debug, Clone)]
pub struct PeerClient {
    addr: String,
    pool: Arc<Mutex<Vec<TcpStream>>>,
}

impl PeerClient {
    /// Create a client for the given `host:port` address.
    #[must_use]
    pub fn new(addr: impl Into<String>) -> Self {
        Self { addr: addr.into(), pool: Arc::new(Mutex::new(Vec::new())) }
    }

    /// Peer address.
    #[must_use]
    pub fn addr(&self) -> &str {
        &self.addr
    }

    async fn checkout(&self) -> Result<TcpStream> {
        if let Some(stream) = self.pool.lock().await.pop() {
            return Ok(stream);
        }
        TcpStream::connect(&self.addr).await.map_err(|e| Error::Network {
            message: format!("cannot connect to peer {}: {e}", self.addr),
        })
    }

    /// Send a request over a pooled connection and wait for the reply.
    ///
    /// # Errors
    /// Returns an error if the peer is unreachable or closes mid-exchange.
    pub async fn call(&self, request: &Message) -> Result<Message> {
        let mut stream = self.checkout().await?;
        wire::write_message(&mut stream, request).await?;
        match wire::read_message(&mut stream).await? {
            Some(reply) => {
                self.pool.lock().await.push(stream);
                Ok(reply)
            },
            None => Err(Error::Network {
                message: format!("peer {} closed the connection mid-request", self.addr),
            }),
        }
    }

    /// Send a notification over a short-lived connection, waiting for the
    /// acknowledging reply but never pooling the connection.
    ///
    /// # Errors
    /// Returns an error if the peer is unreachable.
    pub async fn notify(&self, request: &Message) -> Result<Message> {
        let mut stream = TcpStream::connect(&self.addr).await.map_err(|e| Error::Network {
            message: format!("cannot connect to peer {}: {e}", self.addr),
        })?;
        wire::write_message(&mut stream, request).await?;
        wire::read_message(&mut stream).await?.ok_or_else(|| Error::Network {
            message: format!("peer {} closed the connection mid-notification", self.addr),
        })
    }
}

/// Proxy for one queue owned by a peer manager.
#[derive(Debug)]
pub struct RemoteQueue {
    name: String,
    manager: String,
    threshold: usize,
    client: PeerClient,
}

impl RemoteQueue {
    fn new(name: &str, manager: &str, threshold: usize, client: PeerClient) -> Self {
        Self { name: canonical_name(name), manager: manager.to_string(), threshold, client }
    }

    /// Queue name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Owning manager name.
    #[must_use]
    pub fn manager(&self) -> &str {
        &self.manager
    }

    /// Threshold as advertised by the owning manager.
    #[must_use]
    pub const fn threshold(&self) -> usize {
        self.threshold
    }

    /// Forward a put to the owning peer.
    ///
    /// Returns `Ok(false)` when the peer reports the queue full or missing.
    ///
    /// # Errors
    /// Returns an error if the peer is unreachable.
    pub async fn put(&self, message: &Message) -> Result<bool> {
        let mut request = Message::builder()
            .priority(message.priority().value())
            .request(RequestType::MessagePut)
            .property(keys::QUEUE, self.name.as_str())
            .property(EMBEDDED, true)
            .build()?;
        wire::embed_message(&mut request, message)?;

        let reply = self.client.call(&request).await?;
        let delivered = reply
            .completion
            .as_ref()
            .is_some_and(|c| c.code == CompletionCode::Ok);
        if !delivered {
            debug!(queue = %self.name, peer = %self.manager, "remote put not delivered");
        }
        Ok(delivered)
    }

    /// Forward a timed get to the owning peer.
    ///
    /// Returns `Ok(None)` when the peer reports a timeout (WARN reply).
    ///
    /// # Errors
    /// Returns an error if the peer is unreachable or replies FAIL.
    pub async fn get(
        &self,
        priority: Priority,
        timeout_ms: u64,
        interval_ms: u64,
    ) -> Result<Option<Message>> {
        let request = Message::builder()
            .priority(priority.value())
            .request(RequestType::MessageGet)
            .property(keys::QUEUE, self.name.as_str())
            .property(keys::TIMEOUT_MS, i64::try_from(timeout_ms).unwrap_or(i64::MAX))
            .property(keys::INTERVAL_MS, i64::try_from(interval_ms).unwrap_or(i64::MAX))
            .build()?;

        let reply = self.client.call(&request).await?;
        match reply.completion.as_ref().map(|c| c.code) {
            Some(CompletionCode::Ok) => Ok(Some(wire::extract_message(&reply)?)),
            Some(CompletionCode::Warn) => Ok(None),
            _ => Err(Error::Network {
                message: format!(
                    "peer {} failed get on {}: {}",
                    self.manager,
                    self.name,
                    reply.completion.map_or_else(String::new, |c| c.description)
                ),
            }),
        }
    }
}

/// Proxy namespace representing the queues owned by one peer manager.
#[derive(Debug)]
pub struct RemoteManager {
    name: String,
    client: PeerClient,
    queues: DashMap<String, Arc<RemoteQueue>>,
    active: AtomicBool,
}

impl RemoteManager {
    /// Create a proxy manager for the peer at `addr`. Starts inactive; it
    /// becomes active only when a sys-state notification arrives.
    #[must_use]
    pub fn new(name: &str, addr: &str) -> Self {
        Self {
            name: name.to_string(),
            client: PeerClient::new(addr),
            queues: DashMap::new(),
            active: AtomicBool::new(false),
        }
    }

    /// Peer address.
    #[must_use]
    pub fn addr(&self) -> &str {
        self.client.addr()
    }

    /// Replace the proxy set from a `queue.<NAME> = threshold` property list.
    pub fn set_queues(&self, properties: &Properties) {
        self.queues.clear();
        for (name, value) in properties.subset(keys::QUEUE_LIST_PREFIX) {
            let threshold = value.as_i64().and_then(|v| usize::try_from(v).ok()).unwrap_or(0);
            let queue = Arc::new(RemoteQueue::new(&name, &self.name, threshold, self.client.clone()));
            self.queues.insert(queue.name().to_string(), queue);
        }
        info!(peer = %self.name, "ingested queue list with {} entries", self.queues.len());
    }

    /// Add a single proxy queue. No-op returning `None` while inactive.
    pub fn add_queue(&self, name: &str, threshold: usize) -> Option<Arc<RemoteQueue>> {
        if !self.is_active() {
            return None;
        }
        let queue =
            Arc::new(RemoteQueue::new(name, &self.name, threshold, self.client.clone()));
        self.queues.insert(queue.name().to_string(), Arc::clone(&queue));
        Some(queue)
    }

    /// Remove a proxy queue. No-op returning `None` while inactive.
    pub fn remove_queue(&self, name: &str) -> Option<Arc<RemoteQueue>> {
        if !self.is_active() {
            return None;
        }
        self.queues.remove(&canonical_name(name)).map(|(_, queue)| queue)
    }

    /// Mark the peer inactive, keeping the proxy set for a later
    /// reactivation.
    pub fn mark_inactive(&self) {
        self.active.store(false, Ordering::Release);
        warn!(peer = %self.name, "remote manager marked inactive");
    }
}

#[async_trait]
impl QueueManager for RemoteManager {
    fn name(&self) -> &str {
        &self.name
    }

    fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    async fn activate(&self) -> Result<()> {
        self.active.store(true, Ordering::Release);
        info!(peer = %self.name, "remote manager active");
        Ok(())
    }

    async fn deactivate(&self) -> Result<()> {
        self.mark_inactive();
        Ok(())
    }

    fn get_queue(&self, name: &str) -> Option<QueueHandle> {
        if !self.is_active() {
            return None;
        }
        self.queues.get(&canonical_name(name)).map(|q| QueueHandle::Remote(Arc::clone(&q)))
    }

    fn query_queues(
        &self,
        pattern: &str,
        is_prefix: bool,
        verbose: bool,
    ) -> BTreeMap<String, String> {
        if !self.is_active() {
            return BTreeMap::new();
        }
        let pattern = canonical_name(pattern);
        self.queues
            .iter()
            .filter(|e| {
                if is_prefix {
                    e.key().starts_with(&pattern)
                } else {
                    e.key() == &pattern
                }
            })
            .map(|e| {
                let description = if verbose {
                    format!("remote@{} threshold={}", self.name, e.value().threshold())
                } else {
                    format!("remote@{}", self.name)
                };
                (e.key().clone(), description)
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer_queue_list() -> Properties {
        let mut props = Properties::new();
        props.set("queue.ORDERS", 100i64);
        props.set("queue.billing", 50i64);
        props
    }

    #[tokio::test]
    async fn test_starts_inactive_with_empty_queue_set() {
        let manager = RemoteManager::new("QMGR2", "127.0.0.1:7475");
        assert!(!manager.is_active());
        assert!(manager.get_queue("ORDERS").is_none());
        assert!(manager.add_queue("ORDERS", 10).is_none());
        assert!(manager.remove_queue("ORDERS").is_none());
        assert!(manager.query_queues("", true, false).is_empty());
    }

    #[tokio::test]
    async fn test_set_queues_parses_property_list() {
        let manager = RemoteManager::new("QMGR2", "127.0.0.1:7475");
        manager.activate().await.unwrap();
        manager.set_queues(&peer_queue_list());

        let handle = manager.get_queue("orders").unwrap();
        assert!(!handle.is_local());
        assert_eq!(handle.name(), "ORDERS");
        // Names from the list are canonicalized.
        assert!(manager.get_queue("BILLING").is_some());
    }

    #[tokio::test]
    async fn test_add_remove_when_active() {
        let manager = RemoteManager::new("QMGR2", "127.0.0.1:7475");
        manager.activate().await.unwrap();

        assert!(manager.add_queue("NEW", 25).is_some());
        assert!(manager.get_queue("NEW").is_some());
        assert!(manager.remove_queue("NEW").is_some());
        assert!(manager.get_queue("NEW").is_none());
    }

    #[tokio::test]
    async fn test_deactivate_hides_queues() {
        let manager = RemoteManager::new("QMGR2", "127.0.0.1:7475");
        manager.activate().await.unwrap();
        manager.set_queues(&peer_queue_list());

        manager.deactivate().await.unwrap();
        assert!(manager.get_queue("ORDERS").is_none());
        assert!(manager.query_queues("ORDERS", false, false).is_empty());
    }

    #[tokio::test]
    async fn test_query_describes_remote_queues() {
        let manager = RemoteManager::new("QMGR2", "127.0.0.1:7475");
        manager.activate().await.unwrap();
        manager.set_queues(&peer_queue_list());

        let results = manager.query_queues("ORDERS", false, true);
        assert_eq!(results.get("ORDERS").unwrap(), "remote@QMGR2 threshold=100");
    }
}
