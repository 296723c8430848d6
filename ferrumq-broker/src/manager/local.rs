//! The local queue manager: owns the queues hosted by this process.

use crate::config::BrokerConfig;
use crate::manager::{QueueHandle, QueueManager};
use crate::queue::{canonical_name, Queue};
use async_trait::async_trait;
use dashmap::DashMap;
use ferrumq_core::{Error, Result};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{error, info, warn};

/// Extension used for active backup files.
const BACKUP_EXTENSION: &str = "bak";

/// Owns the queues hosted by this process and persists them across restarts.
#[derive(Debug)]
pub struct LocalManager {
    name: String,
    config: Arc<BrokerConfig>,
    queues: DashMap<String, Arc<Queue>>,
    active: AtomicBool,
}

impl LocalManager {
    /// Create the local manager. Created once at repository construction.
    #[must_use]
    pub fn new(config: Arc<BrokerConfig>) -> Self {
        Self {
            name: config.manager_name.clone(),
            config,
            queues: DashMap::new(),
            active: AtomicBool::new(false),
        }
    }

    fn backup_path(&self, name: &str) -> PathBuf {
        self.config.storage.backup_dir.join(format!("{name}.{BACKUP_EXTENSION}"))
    }

    fn make_queue(&self, name: &str, threshold: usize) -> Arc<Queue> {
        Arc::new(Queue::with_backup(
            name,
            threshold,
            Some(self.backup_path(&canonical_name(name))),
            self.config.storage.rotation.clone(),
            self.config.storage.max_write_errors,
        ))
    }

    /// Define a new queue.
    ///
    /// Returns `None` if a queue of that name already exists: when two
    /// defines race, exactly one wins and the other observes the existing
    /// queue.
    pub fn define_queue(&self, name: &str, threshold: usize) -> Option<Arc<Queue>> {
        let canonical = canonical_name(name);
        match self.queues.entry(canonical.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => None,
            dashmap::mapref::entry::Entry::Vacant(entry) => {
                let queue = self.make_queue(&canonical, threshold);
                entry.insert(Arc::clone(&queue));
                info!(manager = %self.name, "defined queue {canonical} (threshold {threshold})");
                Some(queue)
            },
        }
    }

    /// Define a queue only if absent, returning the existing or new queue.
    fn ensure_queue(&self, name: &str, threshold: usize) -> Arc<Queue> {
        let canonical = canonical_name(name);
        if let Some(queue) = self.queues.get(&canonical) {
            return Arc::clone(&queue);
        }
        self.define_queue(&canonical, threshold)
            .unwrap_or_else(|| Arc::clone(&self.queues.get(&canonical).expect("queue exists")))
    }

    /// Delete a queue, returning it if it existed.
    pub fn delete_queue(&self, name: &str) -> Option<Arc<Queue>> {
        let canonical = canonical_name(name);
        let removed = self.queues.remove(&canonical).map(|(_, queue)| queue);
        if removed.is_some() {
            info!(manager = %self.name, "deleted queue {canonical}");
        }
        removed
    }

    /// Look up a locally hosted queue.
    #[must_use]
    pub fn queue(&self, name: &str) -> Option<Arc<Queue>> {
        self.queues.get(&canonical_name(name)).map(|q| Arc::clone(&q))
    }

    /// List all locally hosted queues as (name, threshold) pairs.
    #[must_use]
    pub fn queue_list(&self) -> Vec<(String, usize)> {
        self.queues.iter().map(|e| (e.key().clone(), e.value().threshold())).collect()
    }

    /// Number of locally hosted queues.
    #[must_use]
    pub fn queue_count(&self) -> usize {
        self.queues.len()
    }

    /// Purge expired messages from every local queue.
    pub fn purge_expired(&self) -> usize {
        self.queues.iter().map(|e| e.value().purge_expired()).sum()
    }

    /// Restore every recognized backup file in the backup directory.
    fn restore_from_backups(&self) -> Result<()> {
        let dir = &self.config.storage.backup_dir;
        for entry in std::fs::read_dir(dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some(BACKUP_EXTENSION) {
                continue;
            }
            let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            let name = canonical_name(stem);
            let queue = self.ensure_queue(&name, self.config.default_threshold);
            if let Err(e) = queue.restore() {
                error!(manager = %self.name, "restore of {name} failed: {e}");
                return Err(e);
            }
        }
        Ok(())
    }
}

#[async_trait]
impl QueueManager for LocalManager {
    fn name(&self) -> &str {
        &self.name
    }

    fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// Bring the manager online: ensure the backup directory, reconstruct
    /// queues from backup files, define the dead-letter, admin, and
    /// statically configured queues. The manager becomes active only if all
    /// of this succeeds.
    async fn activate(&self) -> Result<()> {
        let dir = &self.config.storage.backup_dir;
        if dir.exists() && !dir.is_dir() {
            return Err(Error::Storage {
                message: format!("backup path {} exists but is not a directory", dir.display()),
            });
        }
        std::fs::create_dir_all(dir)?;

        self.restore_from_backups()?;

        self.ensure_queue(&self.config.dead_letter_queue, self.config.default_threshold);
        self.ensure_queue(&self.config.admin_queue, self.config.default_threshold);
        for predefined in &self.config.predefined_queues {
            self.ensure_queue(&predefined.name, predefined.threshold);
        }

        self.active.store(true, Ordering::Release);
        info!(manager = %self.name, "local manager active with {} queues", self.queues.len());
        Ok(())
    }

    /// Take the manager offline, backing up every owned queue. A failed
    /// backup is logged and counted against that queue; the remaining queues
    /// are still persisted.
    async fn deactivate(&self) -> Result<()> {
        self.active.store(false, Ordering::Release);
        for entry in self.queues.iter() {
            if let Err(e) = entry.value().backup() {
                warn!(manager = %self.name, "backup of {} failed: {e}", entry.key());
            }
        }
        info!(manager = %self.name, "local manager deactivated");
        Ok(())
    }

    fn get_queue(&self, name: &str) -> Option<QueueHandle> {
        self.queue(name).map(QueueHandle::Local)
    }

    fn query_queues(
        &self,
        pattern: &str,
        is_prefix: bool,
        verbose: bool,
    ) -> BTreeMap<String, String> {
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
            .map(|e| (e.key().clone(), e.value().describe(verbose)))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PredefinedQueue;
    use ferrumq_core::{Message, Payload, Priority};
    use tempfile::TempDir;

    fn test_config(dir: &TempDir) -> Arc<BrokerConfig> {
        let mut config = BrokerConfig::default();
        config.storage.backup_dir = dir.path().to_path_buf();
        config.predefined_queues =
            vec![PredefinedQueue { name: "ORDERS".to_string(), threshold: 50 }];
        Arc::new(config)
    }

    fn text_message(text: &str) -> Message {
        let mut message = Message::new(Priority::MIN);
        message.payload = Payload::Text(text.to_string());
        message
    }

    #[tokio::test]
    async fn test_activate_defines_system_queues() {
        let dir = TempDir::new().unwrap();
        let manager = LocalManager::new(test_config(&dir));
        assert!(!manager.is_active());

        manager.activate().await.unwrap();
        assert!(manager.is_active());
        assert!(manager.queue("DEAD.LETTER.QUEUE").is_some());
        assert!(manager.queue("ADMIN.QUEUE").is_some());
        assert_eq!(manager.queue("ORDERS").unwrap().threshold(), 50);
    }

    #[tokio::test]
    async fn test_activate_fails_on_non_directory_path() {
        let dir = TempDir::new().unwrap();
        let file_path = dir.path().join("not-a-dir");
        std::fs::write(&file_path, b"x").unwrap();

        let mut config = BrokerConfig::default();
        config.storage.backup_dir = file_path;
        let manager = LocalManager::new(Arc::new(config));

        assert!(manager.activate().await.is_err());
        assert!(!manager.is_active());
    }

    #[test]
    fn test_define_race_single_winner() {
        let dir = TempDir::new().unwrap();
        let manager = LocalManager::new(test_config(&dir));

        let first = manager.define_queue("INVOICES", 10);
        assert!(first.is_some());
        let second = manager.define_queue("invoices", 20);
        assert!(second.is_none());

        // The existing queue is untouched by the losing define.
        assert_eq!(manager.queue("INVOICES").unwrap().threshold(), 10);
    }

    #[test]
    fn test_duplicate_define_leaves_size_unchanged() {
        let dir = TempDir::new().unwrap();
        let manager = LocalManager::new(test_config(&dir));

        let queue = manager.define_queue("DUP", 10).unwrap();
        assert!(queue.put(text_message("kept")).is_ok());
        assert!(manager.define_queue("DUP", 99).is_none());
        assert_eq!(manager.queue("DUP").unwrap().size(), 1);
    }

    #[tokio::test]
    async fn test_deactivate_then_activate_restores_queues() {
        let dir = TempDir::new().unwrap();
        let config = test_config(&dir);

        let manager = LocalManager::new(Arc::clone(&config));
        manager.activate().await.unwrap();
        let queue = manager.define_queue("PERSIST", 100).unwrap();
        for i in 0..6 {
            assert!(queue.put(text_message(&format!("m{i}"))).is_ok());
        }
        manager.deactivate().await.unwrap();

        // Fresh manager instance, same backup directory.
        let reborn = LocalManager::new(config);
        reborn.activate().await.unwrap();
        let restored = reborn.queue("PERSIST").unwrap();
        assert_eq!(restored.size(), 6);
        // Backup file consumed at restart.
        assert!(!dir.path().join("PERSIST.bak").exists());
    }

    #[test]
    fn test_query_exact_and_prefix() {
        let dir = TempDir::new().unwrap();
        let manager = LocalManager::new(test_config(&dir));
        manager.define_queue("APP.A", 10);
        manager.define_queue("APP.B", 10);
        manager.define_queue("OTHER", 10);

        let exact = manager.query_queues("APP.A", false, false);
        assert_eq!(exact.len(), 1);

        let by_prefix = manager.query_queues("APP.", true, false);
        assert_eq!(by_prefix.len(), 2);
        assert!(by_prefix.contains_key("APP.A"));
        assert!(by_prefix.contains_key("APP.B"));

        let verbose = manager.query_queues("OTHER", false, true);
        assert!(verbose.get("OTHER").unwrap().contains("id="));
    }
}
