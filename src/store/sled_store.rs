use std::collections::HashMap;
use std::marker::PhantomData;
use std::path::Path;

use log::{debug, info};
use serde::de::DeserializeOwned;
use serde::Serialize;
use sled::{Db, Tree};

use super::BacklogStore;
use crate::common::{Callback, WorkItem};
use crate::{QueueError, Result};

/// A durable backlog backed by a `sled` tree.
///
/// Keys are ids from `Db::generate_id`, stored big-endian so the tree's
/// natural order is submission order. Payloads are stored as JSON.
/// Callbacks cannot be persisted; they live in memory next to the tree
/// and are lost if the process exits, while the payloads survive and
/// are dispatched without a callback after the store is reopened.
pub struct SledStore<P, R> {
    db: Db,
    tree: Tree,
    /// Entry count; `Tree::len` walks the whole tree.
    len: usize,
    callbacks: HashMap<u64, Callback<R>>,
    _payload: PhantomData<fn() -> P>,
}

impl<P, R> SledStore<P, R> {
    /// Opens (or creates) the database at `path` and uses the tree named `queue`.
    pub fn open(path: impl AsRef<Path>, queue: &str) -> Result<Self> {
        Self::new(sled::open(path)?, queue)
    }

    /// Creates a store from an already-opened sled `Db`.
    pub fn new(db: Db, queue: &str) -> Result<Self> {
        let tree = db.open_tree(queue)?;
        let len = tree.len();
        if len > 0 {
            info!("Recovered {} backlog entries for '{}'", len, queue);
        }
        Ok(Self {
            db,
            tree,
            len,
            callbacks: HashMap::new(),
            _payload: PhantomData,
        })
    }
}

impl<P, R> BacklogStore<WorkItem<P, R>> for SledStore<P, R>
where
    P: Serialize + DeserializeOwned + Send + 'static,
    R: 'static,
{
    fn push(&mut self, item: WorkItem<P, R>) -> Result<()> {
        let (payload, callback) = item.into_parts();
        let id = self.db.generate_id()?;
        self.tree
            .insert(id.to_be_bytes(), serde_json::to_vec(&payload)?)?;
        self.len += 1;
        self.tree.flush()?;
        if let Some(callback) = callback {
            self.callbacks.insert(id, callback);
        }
        debug!("Persisted backlog entry {}", id);
        Ok(())
    }

    fn pop(&mut self) -> Result<Option<WorkItem<P, R>>> {
        let (key, value) = match self.tree.pop_min()? {
            Some(entry) => entry,
            None => return Ok(None),
        };
        self.len = self.len.saturating_sub(1);
        let id = <[u8; 8]>::try_from(key.as_ref())
            .map(u64::from_be_bytes)
            .map_err(|_| QueueError::CorruptEntry(format!("bad key length {}", key.len())))?;
        // The entry is gone from the tree, so its callback goes too, even on error.
        let callback = self.callbacks.remove(&id);
        self.tree.flush()?;
        let payload = serde_json::from_slice(&value)?;
        Ok(Some(WorkItem::from_parts(payload, callback)))
    }

    fn size(&self) -> usize {
        self.len
    }
}
