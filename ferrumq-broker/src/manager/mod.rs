//! Queue managers: owners of queue namespaces.
//!
//! A queue manager owns a name→queue map. The [`local::LocalManager`] hosts
//! real queues in this process; each [`remote::RemoteManager`] is a proxy
//! namespace for the queues owned by one peer broker. The
//! [`Repository`](crate::repository::Repository) unifies them.

pub mod local;
pub mod remote;

use crate::queue::Queue;
use async_trait::async_trait;
use ferrumq_core::{Message, Priority, Result};
use remote::RemoteQueue;
use std::collections::BTreeMap;
use std::sync::Arc;

pub use local::LocalManager;
pub use remote::{PeerClient, RemoteManager};

/// Minimal interface shared by local and remote queue managers.
#[async_trait]
pub trait QueueManager: Send + Sync {
    /// Manager name.
    fn name(&self) -> &str;

    /// Whether the manager is currently active.
    fn is_active(&self) -> bool;

    /// Bring the manager online.
    async fn activate(&self) -> Result<()>;

    /// Take the manager offline.
    async fn deactivate(&self) -> Result<()>;

    /// Look up a queue by canonical name.
    fn get_queue(&self, name: &str) -> Option<QueueHandle>;

    /// Query queues by exact name or prefix, returning an ordered
    /// name→description mapping.
    fn query_queues(&self, pattern: &str, is_prefix: bool, verbose: bool)
        -> BTreeMap<String, String>;
}

/// Outcome of a put through a [`QueueHandle`].
///
/// A message that could not be delivered comes back with the outcome so the
/// caller can divert it to the dead-letter queue.
#[derive(Debug)]
pub enum PutOutcome {
    /// The destination accepted the message.
    Delivered,
    /// The destination is at its threshold or the peer refused the message.
    Rejected(Message),
    /// The owning peer could not be reached.
    Unreachable(Message),
}

/// Handle to a queue resolved through a manager: either a locally hosted
/// queue or a proxy forwarding to a peer.
#[derive(Debug, Clone)]
pub enum QueueHandle {
    /// Queue hosted by this process
    Local(Arc<Queue>),
    /// Proxy to a queue owned by a peer manager
    Remote(Arc<RemoteQueue>),
}

impl QueueHandle {
    /// Get the queue name.
    #[must_use]
    pub fn name(&self) -> &str {
        match self {
            Self::Local(queue) => queue.name(),
            Self::Remote(queue) => queue.name(),
        }
    }

    /// Whether the queue is hosted locally.
    #[must_use]
    pub const fn is_local(&self) -> bool {
        matches!(self, Self::Local(_))
    }

    /// Enqueue a message. Never an error: an undeliverable message is handed
    /// back inside the outcome.
    pub async fn put(&self, message: Message) -> PutOutcome {
        match self {
            Self::Local(queue) => match queue.put(message) {
                Ok(()) => PutOutcome::Delivered,
                Err(rejected) => PutOutcome::Rejected(rejected),
            },
            Self::Remote(queue) => match queue.put(&message).await {
                Ok(true) => PutOutcome::Delivered,
                Ok(false) => PutOutcome::Rejected(message),
                Err(e) => {
                    tracing::warn!(queue = %queue.name(), "remote put failed: {e}");
                    PutOutcome::Unreachable(message)
                },
            },
        }
    }

    /// Dequeue from the given priority lane, polling until `timeout_ms`.
    ///
    /// # Errors
    /// Returns an error only for remote queues whose peer is unreachable.
    pub async fn get_timed(
        &self,
        priority: Priority,
        timeout_ms: u64,
        interval_ms: u64,
    ) -> Result<Option<Message>> {
        match self {
            Self::Local(queue) => Ok(queue.get_timed(priority, timeout_ms, interval_ms).await),
            Self::Remote(queue) => queue.get(priority, timeout_ms, interval_ms).await,
        }
    }

    /// Record last-access metadata. No-op for remote proxies; the owning
    /// manager records the access on its side.
    pub fn touch(&self, user: &str, operation: &str) {
        if let Self::Local(queue) = self {
            queue.touch(user, operation);
        }
    }
}
