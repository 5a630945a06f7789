use serde::{Deserialize, Serialize};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::mqtt::config::StoreSettings;
use crate::mqtt::message::{InboundMessage, Qos};
use crate::util::lock;

const INCOMING_TREE: &str = "incoming";
const OUTGOING_TREE: &str = "outgoing";

/// Journal record of one QoS 1 message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredMessage {
    pub topic: String,
    pub payload: Vec<u8>,
    pub qos: Qos,
    pub retain: bool,
}

impl StoredMessage {
    pub fn into_inbound(self) -> InboundMessage {
        InboundMessage::from_wire(self.topic, &self.payload, self.qos, self.retain)
    }
}

/// Incoming and outgoing journals of one session identity
pub struct SessionStore {
    path: PathBuf,
    incoming: Option<MessageStore>,
    outgoing: Option<MessageStore>,
}

impl SessionStore {
    /// Opens (or creates) the store under `settings.dir`.
    ///
    /// Compaction is scheduled right away when a tokio runtime is available.
    pub fn open(settings: &StoreSettings) -> Result<Self> {
        std::fs::create_dir_all(&settings.dir)?;
        let db = sled::open(&settings.dir)?;

        let incoming = if settings.persist_in {
            Some(MessageStore::open(&db, INCOMING_TREE)?)
        } else {
            None
        };
        let outgoing = if settings.persist_out {
            Some(MessageStore::open(&db, OUTGOING_TREE)?)
        } else {
            None
        };

        for store in incoming.iter().chain(outgoing.iter()) {
            store.set_compaction_interval(settings.compact_interval);
        }

        info!(
            "Opened session store at {} (incoming: {}, outgoing: {})",
            settings.dir.display(),
            incoming.is_some(),
            outgoing.is_some()
        );

        Ok(Self {
            path: settings.dir.clone(),
            incoming,
            outgoing,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn incoming(&self) -> Option<&MessageStore> {
        self.incoming.as_ref()
    }

    pub fn outgoing(&self) -> Option<&MessageStore> {
        self.outgoing.as_ref()
    }
}

impl std::fmt::Debug for SessionStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionStore")
            .field("path", &self.path)
            .field("incoming", &self.incoming.is_some())
            .field("outgoing", &self.outgoing.is_some())
            .finish()
    }
}

/// Removes a session store directory; a missing directory is not an error.
pub async fn purge(path: &Path) -> Result<()> {
    match tokio::fs::remove_dir_all(path).await {
        Ok(()) => {
            info!("Removed session store {}", path.display());
            Ok(())
        }
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// A single journal tree
pub struct MessageStore {
    name: &'static str,
    db: sled::Db,
    /// Shared weakly with the compaction task so dropping the store closes it
    tree: Arc<sled::Tree>,
    compaction: Mutex<Option<JoinHandle<()>>>,
}

impl MessageStore {
    fn open(db: &sled::Db, name: &'static str) -> Result<Self> {
        let tree = db.open_tree(name)?;
        Ok(Self {
            name,
            db: db.clone(),
            tree: Arc::new(tree),
            compaction: Mutex::new(None),
        })
    }

    /// Journals `message` and returns its key.
    pub fn put(&self, message: &StoredMessage) -> Result<u64> {
        let key = self.db.generate_id()?;
        let value = serde_json::to_vec(message)?;
        self.tree.insert(key.to_be_bytes(), value)?;
        Ok(key)
    }

    pub fn remove(&self, key: u64) -> Result<()> {
        self.tree.remove(key.to_be_bytes())?;
        Ok(())
    }

    /// Journaled messages in insertion order.
    pub fn pending(&self) -> Vec<(u64, StoredMessage)> {
        self.tree
            .iter()
            .filter_map(|entry| match entry {
                Ok(entry) => Some(entry),
                Err(e) => {
                    warn!("Failed to read {} journal entry: {}", self.name, e);
                    None
                }
            })
            .filter_map(|(key, value)| {
                let key: [u8; 8] = key.as_ref().try_into().ok()?;
                match serde_json::from_slice(&value) {
                    Ok(message) => Some((u64::from_be_bytes(key), message)),
                    Err(e) => {
                        warn!("Skipping unreadable {} journal entry: {}", self.name, e);
                        None
                    }
                }
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.tree.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tree.is_empty()
    }

    /// Flushes the journal to disk every `interval`; zero disables the task.
    ///
    /// Replaces any previously scheduled compaction.
    pub fn set_compaction_interval(&self, interval: Duration) {
        let mut slot = lock(&self.compaction);
        if let Some(task) = slot.take() {
            task.abort();
        }
        if interval.is_zero() {
            return;
        }

        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!(
                "No async runtime available, {} journal compaction disabled",
                self.name
            );
            return;
        };

        let tree = Arc::downgrade(&self.tree);
        let name = self.name;
        *slot = Some(runtime.spawn(async move {
            let start = tokio::time::Instant::now() + interval;
            let mut ticker = tokio::time::interval_at(start, interval);
            loop {
                ticker.tick().await;
                let Some(tree) = tree.upgrade() else {
                    debug!("{} journal closed, compaction stopped", name);
                    return;
                };
                match tree.flush_async().await {
                    Ok(bytes) => debug!("Compacted {} journal ({} bytes flushed)", name, bytes),
                    Err(e) => warn!("Failed to compact {} journal: {}", name, e),
                }
            }
        }));
    }
}

impl Drop for MessageStore {
    fn drop(&mut self) {
        if let Some(task) = lock(&self.compaction).take() {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn settings(dir: &Path, persist_in: bool, persist_out: bool) -> StoreSettings {
        StoreSettings {
            dir: dir.join("session"),
            persist_in,
            persist_out,
            compact_interval: Duration::ZERO,
        }
    }

    fn stored(topic: &str) -> StoredMessage {
        StoredMessage {
            topic: topic.to_string(),
            payload: b"reading".to_vec(),
            qos: Qos::AtLeastOnce,
            retain: false,
        }
    }

    #[test]
    fn toggles_select_trees() {
        let dir = tempdir().unwrap();
        let store = SessionStore::open(&settings(dir.path(), true, false)).unwrap();
        assert!(store.incoming().is_some());
        assert!(store.outgoing().is_none());
    }

    #[test]
    fn journal_keeps_order_until_removed() {
        let dir = tempdir().unwrap();
        let store = SessionStore::open(&settings(dir.path(), false, true)).unwrap();
        let outgoing = store.outgoing().unwrap();

        let first = outgoing.put(&stored("a")).unwrap();
        let second = outgoing.put(&stored("b")).unwrap();
        assert_eq!(outgoing.len(), 2);

        let topics: Vec<String> = outgoing.pending().into_iter().map(|(_, m)| m.topic).collect();
        assert_eq!(topics, vec!["a".to_string(), "b".to_string()]);

        outgoing.remove(first).unwrap();
        let pending = outgoing.pending();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].0, second);
    }

    #[test]
    fn journal_survives_reopen() {
        let dir = tempdir().unwrap();
        let settings = settings(dir.path(), true, true);
        {
            let store = SessionStore::open(&settings).unwrap();
            store.incoming().unwrap().put(&stored("in")).unwrap();
        }
        let store = SessionStore::open(&settings).unwrap();
        let pending = store.incoming().unwrap().pending();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].1.clone().into_inbound().topic, "in");
        assert!(store.outgoing().unwrap().is_empty());
    }

    #[tokio::test]
    async fn purge_removes_directory_and_tolerates_missing() {
        let dir = tempdir().unwrap();
        let settings = settings(dir.path(), true, true);
        {
            let store = SessionStore::open(&settings).unwrap();
            store.incoming().unwrap().set_compaction_interval(Duration::from_millis(10));
        }
        assert!(settings.dir.exists());
        purge(&settings.dir).await.unwrap();
        assert!(!settings.dir.exists());
        purge(&settings.dir).await.unwrap();
    }

    #[tokio::test]
    async fn scheduled_compaction_does_not_keep_the_store_open() {
        let dir = tempdir().unwrap();
        let mut settings = settings(dir.path(), true, true);
        settings.compact_interval = Duration::from_secs(60);

        let store = SessionStore::open(&settings).unwrap();
        store.outgoing().unwrap().put(&stored("out")).unwrap();
        drop(store);

        // The aborted task has not been polled again, yet the lock is free.
        let reopened = SessionStore::open(&settings).unwrap();
        assert_eq!(reopened.outgoing().unwrap().len(), 1);
    }
}
