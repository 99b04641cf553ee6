//! Persistence layer backed by `sled`
//!
//! Durable queue definitions live in the `queues` tree, keyed by queue name.
//! Persistent messages of a durable queue live in a tree of their own
//! (`queue:<name>`), keyed by the broker-wide message id in big-endian form so
//! iteration yields messages in publish order. A message is removed from disk
//! when it is acknowledged or dropped.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use sled::{Db, Tree};

const QUEUES_TREE: &str = "queues";

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct StoredQueue {
    pub name: String,
    pub durable: bool,
    pub created_at: i64,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct StoredMessage {
    pub id: u64,
    pub payload: Vec<u8>,
    pub timestamp: i64,
}

#[derive(Clone)]
pub struct Persistence {
    db: Db,
    #[cfg(test)]
    fail_removals: std::sync::Arc<std::sync::atomic::AtomicBool>,
}

impl Persistence {
    /// Open or create a sled database at `path`.
    pub fn open(path: &str) -> Result<Self, sled::Error> {
        let db = sled::open(path)?;
        Ok(Self {
            db,
            #[cfg(test)]
            fail_removals: Default::default(),
        })
    }

    /// Makes every later `remove_message` on this store (and its clones) fail.
    #[cfg(test)]
    pub(crate) fn fail_removals(&self) {
        self.fail_removals.store(true, std::sync::atomic::Ordering::SeqCst);
    }

    fn message_tree(&self, queue: &str) -> Result<Tree, sled::Error> {
        self.db.open_tree(format!("queue:{queue}"))
    }

    pub fn store_queue(&self, name: &str, durable: bool) -> Result<(), sled::Error> {
        let record = StoredQueue {
            name: name.to_string(),
            durable,
            created_at: Utc::now().timestamp_millis(),
        };
        let serialized = serde_json::to_vec(&record)
            .map_err(|e| sled::Error::Unsupported(format!("cannot encode queue '{name}': {e}")))?;
        self.db.open_tree(QUEUES_TREE)?.insert(name.as_bytes(), serialized)?;
        Ok(())
    }

    /// All stored queue definitions. Undecodable entries are skipped.
    pub fn load_queues(&self) -> Result<Vec<StoredQueue>, sled::Error> {
        let tree = self.db.open_tree(QUEUES_TREE)?;
        let mut queues = Vec::new();
        for entry in tree.iter() {
            let (key, value) = entry?;
            match serde_json::from_slice(&value) {
                Ok(queue) => queues.push(queue),
                Err(e) => tracing::warn!(
                    key = %String::from_utf8_lossy(&key),
                    "skipping undecodable queue record: {e}"
                ),
            }
        }
        Ok(queues)
    }

    pub fn store_message(&self, queue: &str, id: u64, payload: &[u8]) -> Result<(), sled::Error> {
        let msg = StoredMessage {
            id,
            payload: payload.to_vec(),
            timestamp: Utc::now().timestamp_millis(),
        };
        let serialized = serde_json::to_vec(&msg)
            .map_err(|e| sled::Error::Unsupported(format!("cannot encode message {id}: {e}")))?;
        self.message_tree(queue)?.insert(id.to_be_bytes(), serialized)?;
        Ok(())
    }

    pub fn remove_message(&self, queue: &str, id: u64) -> Result<(), sled::Error> {
        #[cfg(test)]
        if self.fail_removals.load(std::sync::atomic::Ordering::SeqCst) {
            return Err(sled::Error::Unsupported(format!("removal of message {id} disabled")));
        }
        self.message_tree(queue)?.remove(id.to_be_bytes())?;
        Ok(())
    }

    /// Messages of `queue` in publish order.
    pub fn load_messages(&self, queue: &str) -> Result<Vec<StoredMessage>, sled::Error> {
        let tree = self.message_tree(queue)?;
        let mut messages = Vec::new();
        for entry in tree.iter() {
            let (_, value) = entry?;
            match serde_json::from_slice(&value) {
                Ok(msg) => messages.push(msg),
                Err(e) => tracing::warn!(queue, "skipping undecodable message: {e}"),
            }
        }
        Ok(messages)
    }

    pub fn flush(&self) -> Result<(), sled::Error> {
        self.db.flush()?;
        Ok(())
    }
}

impl std::fmt::Debug for Persistence {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Persistence")
            .field("db", &"sled::Db")
            .finish()
    }
}
