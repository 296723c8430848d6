//! The repository: one local manager plus the remote managers for every
//! configured peer, behind a single lookup/query API.
//!
//! The repository lives for the process lifetime. It owns the dead-letter
//! queue reference, runs the cross-manager synchronization protocol after
//! local topology changes, and applies incoming sys-state notifications.

use crate::config::BrokerConfig;
use crate::manager::{LocalManager, PeerClient, QueueHandle, QueueManager, RemoteManager};
use crate::queue::{canonical_name, Queue};
use crate::session::SessionRegistry;
use dashmap::DashMap;
use ferrumq_core::message::keys::{self, actions};
use ferrumq_core::{Error, Message, Properties, RequestType, Result, SessionId};
use std::collections::BTreeMap;
use std::sync::{Arc, OnceLock};
use tracing::{debug, info, warn};

/// Facade unifying the local manager and all remote managers.
#[derive(Debug)]
pub struct Repository {
    config: Arc<BrokerConfig>,
    local: Arc<LocalManager>,
    remotes: DashMap<String, Arc<RemoteManager>>,
    sessions: Arc<SessionRegistry>,
    dead_letter: OnceLock<Arc<Queue>>,
}

impl Repository {
    /// Construct the repository: one local manager, one inactive remote
    /// manager per configured peer. Called exactly once by the hosting
    /// process.
    #[must_use]
    pub fn new(config: Arc<BrokerConfig>, sessions: Arc<SessionRegistry>) -> Self {
        let local = Arc::new(LocalManager::new(Arc::clone(&config)));
        let remotes = DashMap::new();
        for (peer, addr) in &config.peers {
            remotes.insert(peer.clone(), Arc::new(RemoteManager::new(peer, addr)));
        }
        Self { config, local, remotes, sessions, dead_letter: OnceLock::new() }
    }

    /// Broker configuration.
    #[must_use]
    pub fn config(&self) -> &BrokerConfig {
        &self.config
    }

    /// This manager's name.
    #[must_use]
    pub fn manager_name(&self) -> &str {
        self.local.name()
    }

    /// The local manager.
    #[must_use]
    pub fn local(&self) -> &Arc<LocalManager> {
        &self.local
    }

    /// The session registry serving this repository.
    #[must_use]
    pub fn sessions(&self) -> &Arc<SessionRegistry> {
        &self.sessions
    }

    /// Activate the local manager and cache the dead-letter queue.
    ///
    /// # Errors
    /// Returns an error if local activation fails; the repository is then
    /// unusable.
    pub async fn activate(&self) -> Result<()> {
        self.local.activate().await?;
        let dlq = self.local.queue(&self.config.dead_letter_queue).ok_or_else(|| {
            Error::Internal {
                message: format!(
                    "dead-letter queue {} missing after activation",
                    self.config.dead_letter_queue
                ),
            }
        })?;
        let _ = self.dead_letter.set(dlq);
        info!(manager = %self.manager_name(), "repository active");
        Ok(())
    }

    /// Deactivate the local manager, persisting all local queues.
    ///
    /// # Errors
    /// Returns an error if deactivation fails outright; individual backup
    /// failures are logged per queue.
    pub async fn deactivate(&self) -> Result<()> {
        self.local.deactivate().await
    }

    /// Resolve a queue: the local manager first, then the remote managers in
    /// unspecified order.
    #[must_use]
    pub fn get_queue(&self, name: &str) -> Option<QueueHandle> {
        if let Some(handle) = self.local.get_queue(name) {
            return Some(handle);
        }
        self.remotes.iter().find_map(|entry| entry.value().get_queue(name))
    }

    /// Query queues across all managers. Results from remote managers are
    /// merged first, then the local manager's, so local entries overwrite
    /// remote entries of the same name: locality wins on collision.
    #[must_use]
    pub fn query_queues(
        &self,
        pattern: &str,
        is_prefix: bool,
        verbose: bool,
    ) -> BTreeMap<String, String> {
        let mut results = BTreeMap::new();
        for entry in self.remotes.iter() {
            results.extend(entry.value().query_queues(pattern, is_prefix, verbose));
        }
        results.extend(self.local.query_queues(pattern, is_prefix, verbose));
        results
    }

    /// Define a queue on the local manager.
    ///
    /// Returns `None` if a local queue of that name already exists.
    pub fn define_local_queue(&self, name: &str, threshold: usize) -> Option<Arc<Queue>> {
        self.local.define_queue(name, threshold)
    }

    /// Delete a queue from the local manager, returning it if it existed.
    pub fn delete_local_queue(&self, name: &str) -> Option<Arc<Queue>> {
        self.local.delete_queue(name)
    }

    /// Record a queue addition in the named peer's proxy set.
    pub fn define_remote_queue(&self, peer: &str, name: &str, threshold: usize) -> bool {
        self.remotes
            .get(peer)
            .is_some_and(|remote| remote.add_queue(name, threshold).is_some())
    }

    /// Record a queue removal in the named peer's proxy set.
    pub fn delete_remote_queue(&self, peer: &str, name: &str) -> bool {
        self.remotes.get(peer).is_some_and(|remote| remote.remove_queue(name).is_some())
    }

    /// The remote manager for a peer, if configured.
    #[must_use]
    pub fn remote(&self, peer: &str) -> Option<Arc<RemoteManager>> {
        self.remotes.get(peer).map(|entry| Arc::clone(entry.value()))
    }

    /// Whether the named peer is configured but currently inactive.
    #[must_use]
    pub fn is_peer_inactive(&self, peer: &str) -> bool {
        self.remotes.get(peer).is_some_and(|remote| !remote.is_active())
    }

    /// The dead-letter queue. Available once the repository is active.
    #[must_use]
    pub fn dead_letter_queue(&self) -> Option<Arc<Queue>> {
        self.dead_letter.get().cloned()
    }

    /// Divert a message that could not reach its destination to the
    /// dead-letter queue. Returns `false` if the message was lost because
    /// the dead-letter queue itself is unavailable or full.
    pub fn divert_to_dead_letter(&self, message: Message) -> bool {
        match self.dead_letter_queue() {
            Some(dlq) => match dlq.put(message) {
                Ok(()) => true,
                Err(_) => {
                    warn!("dead-letter queue at threshold; message lost");
                    false
                },
            },
            None => {
                warn!("dead-letter queue unavailable; message lost");
                false
            },
        }
    }

    /// Build the `queue.<NAME> = threshold` property list describing the
    /// local queues, used to establish topology with peers.
    #[must_use]
    pub fn local_queue_properties(&self) -> Properties {
        let mut props = Properties::new();
        for (name, threshold) in self.local.queue_list() {
            props.set(
                format!("{}{name}", keys::QUEUE_LIST_PREFIX),
                i64::try_from(threshold).unwrap_or(i64::MAX),
            );
        }
        props
    }

    /// Notify every configured peer of a local queue definition or deletion.
    ///
    /// Sequential and best-effort, at-most-once: an unreachable peer is
    /// logged and skipped, never rolling back the local mutation.
    pub async fn notify_peers(&self, queue_name: &str, added: bool) {
        let action = if added { actions::QUEUE_ADDED } else { actions::QUEUE_REMOVED };
        for (peer, addr) in &self.config.peers {
            let mut request = Message::request(RequestType::SysState);
            request.properties.set(keys::MANAGER, self.manager_name());
            request.properties.set(keys::QUEUE, canonical_name(queue_name));
            request.properties.set(keys::ACTION, action);

            match PeerClient::new(addr.clone()).notify(&request).await {
                Ok(_) => debug!(peer = %peer, "notified {action} for {queue_name}"),
                Err(e) => warn!(peer = %peer, "notification skipped: {e}"),
            }
        }
    }

    /// Announce this manager's activation to every configured peer.
    ///
    /// The notification carries our queue list; the acknowledging reply
    /// carries the peer's, so federation is established in one exchange.
    /// Sequential and best-effort: an unreachable peer is logged and skipped,
    /// to be picked up later by the self-healing query path.
    pub async fn broadcast_activation(&self) {
        for (peer, addr) in &self.config.peers {
            let mut request = Message::request(RequestType::SysState);
            request.properties.set(keys::MANAGER, self.manager_name());
            request.properties.set(keys::ACTION, actions::ACTIVATED);
            for (key, value) in self.local_queue_properties().iter() {
                request.properties.set(key.clone(), value.clone());
            }

            let reply = match PeerClient::new(addr.clone()).notify(&request).await {
                Ok(reply) => reply,
                Err(e) => {
                    warn!(peer = %peer, "activation notification skipped: {e}");
                    continue;
                },
            };
            if reply.properties.get_str(keys::MANAGER, "") != *peer {
                warn!(peer = %peer, "activation reply from unexpected manager, ignoring");
                continue;
            }
            if let Some(remote) = self.remote(peer) {
                if remote.activate().await.is_ok() {
                    remote.set_queues(&reply.properties);
                    info!(peer = %peer, "federation established");
                }
            }
        }
    }

    /// Announce this manager's deactivation to every configured peer.
    ///
    /// The notification lists our live session ids so peers can terminate
    /// the sessions that were serving us. Best-effort, like
    /// [`Repository::broadcast_activation`].
    pub async fn broadcast_deactivation(&self) {
        let session_ids = self.sessions.ids();
        for (peer, addr) in &self.config.peers {
            let mut request = Message::request(RequestType::SysState);
            request.properties.set(keys::MANAGER, self.manager_name());
            request.properties.set(keys::ACTION, actions::DEACTIVATED);
            for (n, id) in session_ids.iter().enumerate() {
                request
                    .properties
                    .set(format!("{}{n}", keys::SESSION_LIST_PREFIX), id.to_string());
            }

            match PeerClient::new(addr.clone()).notify(&request).await {
                Ok(_) => debug!(peer = %peer, "deactivation announced"),
                Err(e) => warn!(peer = %peer, "deactivation notification skipped: {e}"),
            }
        }
    }

    /// Apply a sys-state notification from a peer.
    ///
    /// # Errors
    /// Returns an error for an unknown peer or action; the caller turns it
    /// into a FAIL reply.
    pub async fn handle_sys_state(
        &self,
        manager: &str,
        action: &str,
        properties: &Properties,
    ) -> Result<()> {
        let Some(remote) = self.remote(manager) else {
            return Err(Error::InvalidMessage {
                message: format!("sys-state from unknown peer {manager}"),
            });
        };

        match action {
            actions::ACTIVATED => {
                remote.activate().await?;
                remote.set_queues(properties);
                Ok(())
            },
            actions::DEACTIVATED => {
                remote.mark_inactive();
                for (_, value) in properties.subset(keys::SESSION_LIST_PREFIX) {
                    let Some(raw) = value.as_str() else { continue };
                    match SessionId::parse(raw) {
                        Ok(id) => {
                            if self.sessions.terminate(id) {
                                info!(session = %id, peer = %manager, "terminated session for deactivated peer");
                            }
                        },
                        Err(e) => warn!(peer = %manager, "ignoring bad session id: {e}"),
                    }
                }
                Ok(())
            },
            actions::QUEUE_ADDED => {
                let name = properties.get_str(keys::QUEUE, "");
                let threshold = properties.get_i64(
                    keys::THRESHOLD,
                    i64::try_from(self.config.default_threshold).unwrap_or(i64::MAX),
                );
                remote.add_queue(&name, usize::try_from(threshold).unwrap_or(0));
                Ok(())
            },
            actions::QUEUE_REMOVED => {
                let name = properties.get_str(keys::QUEUE, "");
                remote.remove_queue(&name);
                Ok(())
            },
            other => Err(Error::InvalidMessage {
                message: format!("unknown sys-state action {other:?}"),
            }),
        }
    }

    /// Purge expired messages from every local queue.
    pub fn purge_expired(&self) -> usize {
        self.local.purge_expired()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ferrumq_core::{Payload, Priority};
    use tempfile::TempDir;

    fn test_repository(dir: &TempDir) -> Repository {
        let mut config = BrokerConfig::default();
        config.storage.backup_dir = dir.path().to_path_buf();
        config.peers.insert("QMGR2".to_string(), "127.0.0.1:1".to_string());
        Repository::new(Arc::new(config), Arc::new(SessionRegistry::new()))
    }

    fn text_message(text: &str) -> Message {
        let mut message = Message::new(Priority::MIN);
        message.payload = Payload::Text(text.to_string());
        message
    }

    async fn activate_peer(repository: &Repository, peer: &str, props: &Properties) {
        repository
            .handle_sys_state(peer, actions::ACTIVATED, props)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_lookup_prefers_local() {
        let dir = TempDir::new().unwrap();
        let repository = test_repository(&dir);
        repository.activate().await.unwrap();

        let mut peer_list = Properties::new();
        peer_list.set("queue.SHARED", 10i64);
        activate_peer(&repository, "QMGR2", &peer_list).await;

        // Only remote at first.
        assert!(!repository.get_queue("SHARED").unwrap().is_local());

        repository.define_local_queue("SHARED", 20).unwrap();
        assert!(repository.get_queue("SHARED").unwrap().is_local());
    }

    #[tokio::test]
    async fn test_query_locality_wins() {
        let dir = TempDir::new().unwrap();
        let repository = test_repository(&dir);
        repository.activate().await.unwrap();

        let mut peer_list = Properties::new();
        peer_list.set("queue.SHARED", 10i64);
        peer_list.set("queue.REMOTE.ONLY", 10i64);
        activate_peer(&repository, "QMGR2", &peer_list).await;
        repository.define_local_queue("SHARED", 20).unwrap();

        let results = repository.query_queues("", true, false);
        assert!(results.get("SHARED").unwrap().contains("depth="));
        assert!(results.get("REMOTE.ONLY").unwrap().contains("remote@QMGR2"));
    }

    #[tokio::test]
    async fn test_divert_to_dead_letter() {
        let dir = TempDir::new().unwrap();
        let repository = test_repository(&dir);
        repository.activate().await.unwrap();

        assert!(repository.divert_to_dead_letter(text_message("lost")));
        let dlq = repository.dead_letter_queue().unwrap();
        assert_eq!(dlq.size(), 1);
    }

    #[tokio::test]
    async fn test_sys_state_deactivation_terminates_sessions() {
        let dir = TempDir::new().unwrap();
        let repository = test_repository(&dir);
        repository.activate().await.unwrap();

        let mut peer_list = Properties::new();
        peer_list.set("queue.ORDERS", 10i64);
        activate_peer(&repository, "QMGR2", &peer_list).await;
        assert!(!repository.is_peer_inactive("QMGR2"));

        let first = repository.sessions().register();
        let second = repository.sessions().register();
        let untouched = repository.sessions().register();

        let mut props = Properties::new();
        props.set("session.1", first.id().to_string());
        props.set("session.2", second.id().to_string());
        repository
            .handle_sys_state("QMGR2", actions::DEACTIVATED, &props)
            .await
            .unwrap();

        assert!(repository.is_peer_inactive("QMGR2"));
        assert!(first.is_stopped());
        assert!(second.is_stopped());
        assert!(!untouched.is_stopped());
        assert!(repository.get_queue("ORDERS").is_none());
    }

    #[tokio::test]
    async fn test_sys_state_queue_add_remove() {
        let dir = TempDir::new().unwrap();
        let repository = test_repository(&dir);
        repository.activate().await.unwrap();
        activate_peer(&repository, "QMGR2", &Properties::new()).await;

        let mut props = Properties::new();
        props.set(keys::QUEUE, "NEWQ");
        props.set(keys::THRESHOLD, 40i64);
        repository.handle_sys_state("QMGR2", actions::QUEUE_ADDED, &props).await.unwrap();
        assert!(repository.get_queue("NEWQ").is_some());

        repository
            .handle_sys_state("QMGR2", actions::QUEUE_REMOVED, &props)
            .await
            .unwrap();
        assert!(repository.get_queue("NEWQ").is_none());
    }

    #[tokio::test]
    async fn test_sys_state_rejects_unknown_peer_and_action() {
        let dir = TempDir::new().unwrap();
        let repository = test_repository(&dir);
        repository.activate().await.unwrap();

        let props = Properties::new();
        assert!(repository
            .handle_sys_state("GHOST", actions::ACTIVATED, &props)
            .await
            .is_err());
        assert!(repository.handle_sys_state("QMGR2", "explode", &props).await.is_err());
    }
}
