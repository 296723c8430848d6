//! Priority-partitioned message queue with optional backup persistence.
//!
//! A queue holds ten FIFO lanes, one per [`Priority`]. Producers and
//! consumers on different sessions operate concurrently without external
//! locking: lanes are individually locked for the duration of a push/pop and
//! the total depth is tracked by an atomic counter so `put` can enforce the
//! capacity threshold without taking every lane lock.

use crate::config::RotationConfig;
use crate::storage;
use ferrumq_core::{Message, Priority, QueueId, Result, Timestamp};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::Notify;
use tracing::{debug, info, warn};

/// Canonical (upper-case, trimmed) form of a queue name.
#[must_use]
pub fn canonical_name(name: &str) -> String {
    name.trim().to_uppercase()
}

/// Last-access metadata recorded on client operations.
#[derive(Debug, Clone)]
pub struct LastAccess {
    /// Acting user
    pub user: String,
    /// Operation name
    pub operation: String,
    /// When the access happened
    pub at: Timestamp,
}

/// A named, priority-partitioned, optionally-persisted message store.
#[derive(Debug)]
pub struct Queue {
    name: String,
    id: QueueId,
    threshold: usize,
    lanes: [Mutex<VecDeque<Message>>; Priority::COUNT],
    depth: AtomicUsize,
    notify: Notify,
    last_access: Mutex<Option<LastAccess>>,
    backup_path: Option<PathBuf>,
    rotation: RotationConfig,
    max_write_errors: u32,
    write_errors: AtomicU32,
    writer_enabled: AtomicBool,
}

impl Queue {
    /// Create a new in-memory queue without a backing file.
    #[must_use]
    pub fn new(name: &str, threshold: usize) -> Self {
        Self::with_backup(name, threshold, None, RotationConfig::default(), u32::MAX)
    }

    /// Create a queue with an optional backup file and rotation policy.
    #[must_use]
    pub fn with_backup(
        name: &str,
        threshold: usize,
        backup_path: Option<PathBuf>,
        rotation: RotationConfig,
        max_write_errors: u32,
    ) -> Self {
        Self {
            name: canonical_name(name),
            id: QueueId::new(),
            threshold,
            lanes: std::array::from_fn(|_| Mutex::new(VecDeque::new())),
            depth: AtomicUsize::new(0),
            notify: Notify::new(),
            last_access: Mutex::new(None),
            backup_path,
            rotation,
            max_write_errors,
            write_errors: AtomicU32::new(0),
            writer_enabled: AtomicBool::new(true),
        }
    }

    /// Get the canonical queue name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Get the surrogate queue id.
    #[must_use]
    pub const fn id(&self) -> QueueId {
        self.id
    }

    /// Get the capacity threshold.
    #[must_use]
    pub const fn threshold(&self) -> usize {
        self.threshold
    }

    /// Get the total number of enqueued messages across all lanes.
    #[must_use]
    pub fn size(&self) -> usize {
        self.depth.load(Ordering::Acquire)
    }

    /// Check whether the queue is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }

    /// Append a message to the lane matching its priority.
    ///
    /// A full queue rejects without blocking and without an error: the
    /// message comes back as `Err` so the caller can dispose of it
    /// (typically by diversion to the dead-letter queue).
    pub fn put(&self, message: Message) -> std::result::Result<(), Message> {
        // Reserve a slot first so two racing puts cannot both squeeze past
        // the threshold.
        let reserved = self
            .depth
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                (current < self.threshold).then_some(current + 1)
            })
            .is_ok();
        if !reserved {
            debug!(queue = %self.name, "put rejected: queue at threshold {}", self.threshold);
            return Err(message);
        }

        let lane = message.priority().lane();
        self.lanes[lane].lock().push_back(message);
        self.notify.notify_waiters();
        Ok(())
    }

    /// Remove the oldest message from exactly the given priority lane.
    ///
    /// There is no automatic scan across other lanes: the caller picks the
    /// lane explicitly.
    #[must_use]
    pub fn get(&self, priority: Priority) -> Option<Message> {
        let message = self.lanes[priority.lane()].lock().pop_front();
        if message.is_some() {
            self.depth.fetch_sub(1, Ordering::AcqRel);
        }
        message
    }

    /// Poll the given lane until a message appears or the accumulated wait
    /// reaches `timeout_ms`, sleeping `interval_ms` between attempts.
    ///
    /// Returns `None` on timeout; "no message" is never an error.
    pub async fn get_timed(
        &self,
        priority: Priority,
        timeout_ms: u64,
        interval_ms: u64,
    ) -> Option<Message> {
        let interval = interval_ms.max(1);
        let mut waited = 0u64;
        loop {
            if let Some(message) = self.get(priority) {
                return Some(message);
            }
            if waited >= timeout_ms {
                return None;
            }
            let sleep_ms = interval.min(timeout_ms - waited);
            tokio::time::sleep(Duration::from_millis(sleep_ms)).await;
            waited += sleep_ms;
        }
    }

    /// Wait indefinitely for a message on the given lane.
    ///
    /// Trusted internal callers only; client-facing paths use [`get_timed`].
    ///
    /// [`get_timed`]: Self::get_timed
    pub async fn get_blocking(&self, priority: Priority) -> Message {
        loop {
            let notified = self.notify.notified();
            if let Some(message) = self.get(priority) {
                return message;
            }
            notified.await;
        }
    }

    /// Enqueue without the threshold check. Restore-only path.
    fn enqueue_unchecked(&self, message: Message) {
        let lane = message.priority().lane();
        self.lanes[lane].lock().push_back(message);
        self.depth.fetch_add(1, Ordering::AcqRel);
        self.notify.notify_waiters();
    }

    /// Record the acting user and operation of the latest client access.
    pub fn touch(&self, user: &str, operation: &str) {
        *self.last_access.lock() = Some(LastAccess {
            user: user.to_string(),
            operation: operation.to_string(),
            at: chrono::Utc::now(),
        });
    }

    /// Get the last-access metadata, if any client has touched the queue.
    #[must_use]
    pub fn last_access(&self) -> Option<LastAccess> {
        self.last_access.lock().clone()
    }

    /// Drain every lane, lowest priority first, preserving per-lane order.
    fn drain_all(&self) -> Vec<Message> {
        let mut drained = Vec::with_capacity(self.size());
        for lane in &self.lanes {
            let mut lane = lane.lock();
            while let Some(message) = lane.pop_front() {
                self.depth.fetch_sub(1, Ordering::AcqRel);
                drained.push(message);
            }
        }
        drained
    }

    /// Discard all enqueued messages, returning how many were dropped.
    pub fn clear(&self) -> usize {
        self.drain_all().len()
    }

    /// Remove expired messages from every lane.
    ///
    /// Returns the number of messages purged.
    pub fn purge_expired(&self) -> usize {
        let now = chrono::Utc::now();
        let mut purged = 0;
        for lane in &self.lanes {
            let mut lane = lane.lock();
            let before = lane.len();
            lane.retain(|m| !m.is_expired(now));
            purged += before - lane.len();
        }
        if purged > 0 {
            self.depth.fetch_sub(purged, Ordering::AcqRel);
            debug!(queue = %self.name, "purged {purged} expired messages");
        }
        purged
    }

    /// Serialize the queue's contents to its backup file, draining the queue.
    ///
    /// Idempotent no-op (`Ok(false)`) when the queue is empty, has no backing
    /// file, or its writer has been disabled by repeated write errors. On a
    /// write failure the drained messages are re-enqueued and the per-queue
    /// error counter advances; once it exceeds the configured maximum the
    /// writer is disabled for the queue's remaining lifetime.
    ///
    /// # Errors
    /// Returns the underlying storage error; callers log it, clients never
    /// see it.
    pub fn backup(&self) -> Result<bool> {
        let Some(path) = &self.backup_path else {
            return Ok(false);
        };
        if !self.writer_enabled.load(Ordering::Acquire) {
            warn!(queue = %self.name, "backup skipped: writer disabled after repeated errors");
            return Ok(false);
        }
        if self.is_empty() {
            return Ok(false);
        }

        let messages = self.drain_all();
        match storage::write_backup(path, &self.rotation, &messages) {
            Ok(()) => {
                info!(queue = %self.name, "backed up {} messages to {}", messages.len(), path.display());
                Ok(true)
            },
            Err(e) => {
                for message in messages {
                    self.enqueue_unchecked(message);
                }
                let errors = self.write_errors.fetch_add(1, Ordering::AcqRel) + 1;
                if errors > self.max_write_errors {
                    self.writer_enabled.store(false, Ordering::Release);
                    warn!(queue = %self.name, "backup writer disabled after {errors} errors");
                }
                Err(e)
            },
        }
    }

    /// Re-enqueue the contents of the backup file, if one exists.
    ///
    /// Records are read until end-of-stream or the first decode error.
    /// Already-restored messages are kept either way; the file is deleted
    /// only after a fully clean read, and left in place for inspection
    /// otherwise.
    ///
    /// # Errors
    /// Returns an error if the backup file exists but cannot be opened or
    /// removed.
    pub fn restore(&self) -> Result<bool> {
        let Some(path) = &self.backup_path else {
            return Ok(false);
        };
        if !path.exists() {
            return Ok(false);
        }

        let (messages, clean) = storage::read_backup(path)?;
        let count = messages.len();
        for message in messages {
            self.enqueue_unchecked(message);
        }

        if clean {
            std::fs::remove_file(path)?;
            info!(queue = %self.name, "restored {count} messages from {}", path.display());
            Ok(true)
        } else {
            warn!(
                queue = %self.name,
                "partial restore of {count} messages; {} kept for inspection",
                path.display()
            );
            Ok(false)
        }
    }

    /// One-line description used by query operations.
    #[must_use]
    pub fn describe(&self, verbose: bool) -> String {
        if verbose {
            let access = self.last_access().map_or_else(
                || "never accessed".to_string(),
                |a| format!("last {} by {} at {}", a.operation, a.user, a.at.to_rfc3339()),
            );
            format!(
                "id={} depth={} threshold={} {}",
                self.id,
                self.size(),
                self.threshold,
                access
            )
        } else {
            format!("depth={} threshold={}", self.size(), self.threshold)
        }
    }
}
