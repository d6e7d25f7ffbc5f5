//! Durable node-id cache.
//!
//! The only state shared across restarts: which node ids this bridge has
//! handed out. Restored at startup so previously known devices are not
//! re-announced as new, rewritten on every reservation and connection
//! state change.

use std::path::Path;

use chrono::Utc;
use redb::{Database, ReadableTable, TableDefinition};
use serde::{Deserialize, Serialize};

// key = node id, value = CachedNode (JSON)
const NODE_IDS_TABLE: TableDefinition<u8, &str> = TableDefinition::new("reserved_node_ids");

/// Result type alias for cache operations.
pub type CacheResult<T> = std::result::Result<T, CacheError>;

/// Cache storage errors.
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("cache storage error: {0}")]
    Storage(String),

    #[error("cache serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

fn storage_err(e: impl std::fmt::Display) -> CacheError {
    CacheError::Storage(e.to_string())
}

/// One persisted reservation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CachedNode {
    pub node_id: u8,
    /// Epoch seconds of the original reservation.
    pub reserved_at: i64,
    /// Epoch seconds of the last connection that saw this node.
    #[serde(default)]
    pub last_connected: Option<i64>,
}

/// redb-backed store of assigned node ids.
pub struct NodeIdCache {
    db: Database,
}

impl NodeIdCache {
    /// Open (or create) the cache file.
    pub fn open<P: AsRef<Path>>(path: P) -> CacheResult<Self> {
        let db = Database::create(path).map_err(storage_err)?;
        let cache = Self { db };
        cache.ensure_table()?;
        Ok(cache)
    }

    /// In-memory cache for tests and cache-less setups.
    pub fn memory() -> CacheResult<Self> {
        let db = Database::builder()
            .create_with_backend(redb::backends::InMemoryBackend::new())
            .map_err(storage_err)?;
        let cache = Self { db };
        cache.ensure_table()?;
        Ok(cache)
    }

    fn ensure_table(&self) -> CacheResult<()> {
        let write = self.db.begin_write().map_err(storage_err)?;
        write.open_table(NODE_IDS_TABLE).map_err(storage_err)?;
        write.commit().map_err(storage_err)?;
        Ok(())
    }

    /// All persisted reservations, ordered by node id.
    pub fn load(&self) -> CacheResult<Vec<CachedNode>> {
        let read = self.db.begin_read().map_err(storage_err)?;
        let table = read.open_table(NODE_IDS_TABLE).map_err(storage_err)?;
        let mut nodes = Vec::new();
        for entry in table.iter().map_err(storage_err)? {
            let (_, value) = entry.map_err(storage_err)?;
            nodes.push(serde_json::from_str(value.value())?);
        }
        nodes.sort_by_key(|n: &CachedNode| n.node_id);
        Ok(nodes)
    }

    /// Persist a fresh reservation. Overwrites an existing entry for the
    /// same id (the reservation timestamp is renewed).
    pub fn reserve(&self, node_id: u8) -> CacheResult<()> {
        let record = CachedNode {
            node_id,
            reserved_at: Utc::now().timestamp(),
            last_connected: None,
        };
        self.insert(&record)
    }

    /// Record that a connection saw this node; creates the entry if the id
    /// was assigned by someone else (e.g. static firmware ids).
    pub fn touch(&self, node_id: u8) -> CacheResult<()> {
        let now = Utc::now().timestamp();
        let record = match self.get(node_id)? {
            Some(mut existing) => {
                existing.last_connected = Some(now);
                existing
            }
            None => CachedNode {
                node_id,
                reserved_at: now,
                last_connected: Some(now),
            },
        };
        self.insert(&record)
    }

    /// One entry, if present.
    pub fn get(&self, node_id: u8) -> CacheResult<Option<CachedNode>> {
        let read = self.db.begin_read().map_err(storage_err)?;
        let table = read.open_table(NODE_IDS_TABLE).map_err(storage_err)?;
        match table.get(node_id).map_err(storage_err)? {
            Some(value) => Ok(Some(serde_json::from_str(value.value())?)),
            None => Ok(None),
        }
    }

    /// Drop one reservation.
    pub fn remove(&self, node_id: u8) -> CacheResult<()> {
        let write = self.db.begin_write().map_err(storage_err)?;
        {
            let mut table = write.open_table(NODE_IDS_TABLE).map_err(storage_err)?;
            table.remove(node_id).map_err(storage_err)?;
        }
        write.commit().map_err(storage_err)?;
        Ok(())
    }

    /// Drop everything.
    pub fn clear(&self) -> CacheResult<()> {
        let write = self.db.begin_write().map_err(storage_err)?;
        {
            let mut table = write.open_table(NODE_IDS_TABLE).map_err(storage_err)?;
            let ids: Vec<u8> = table
                .iter()
                .map_err(storage_err)?
                .filter_map(|entry| entry.ok().map(|(k, _)| k.value()))
                .collect();
            for id in ids {
                table.remove(id).map_err(storage_err)?;
            }
        }
        write.commit().map_err(storage_err)?;
        Ok(())
    }

    fn insert(&self, record: &CachedNode) -> CacheResult<()> {
        let json = serde_json::to_string(record)?;
        let write = self.db.begin_write().map_err(storage_err)?;
        {
            let mut table = write.open_table(NODE_IDS_TABLE).map_err(storage_err)?;
            table
                .insert(record.node_id, json.as_str())
                .map_err(storage_err)?;
        }
        write.commit().map_err(storage_err)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reserve_and_load() {
        let cache = NodeIdCache::memory().unwrap();
        cache.reserve(5).unwrap();
        cache.reserve(2).unwrap();

        let nodes = cache.load().unwrap();
        assert_eq!(
            nodes.iter().map(|n| n.node_id).collect::<Vec<_>>(),
            vec![2, 5]
        );
        assert!(nodes[0].last_connected.is_none());
    }

    #[test]
    fn touch_updates_last_connected() {
        let cache = NodeIdCache::memory().unwrap();
        cache.reserve(7).unwrap();
        cache.touch(7).unwrap();

        let entry = cache.get(7).unwrap().unwrap();
        assert!(entry.last_connected.is_some());

        // Touch on an id reserved elsewhere creates the entry.
        cache.touch(9).unwrap();
        assert!(cache.get(9).unwrap().is_some());
    }

    #[test]
    fn remove_and_clear() {
        let cache = NodeIdCache::memory().unwrap();
        for id in [1, 2, 3] {
            cache.reserve(id).unwrap();
        }
        cache.remove(2).unwrap();
        assert_eq!(cache.load().unwrap().len(), 2);

        cache.clear().unwrap();
        assert!(cache.load().unwrap().is_empty());
    }

    #[test]
    fn survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("node-ids.redb");

        {
            let cache = NodeIdCache::open(&path).unwrap();
            cache.reserve(42).unwrap();
        }

        let cache = NodeIdCache::open(&path).unwrap();
        let nodes = cache.load().unwrap();
        assert_eq!(nodes.len(), 1);
        assert_eq!(nodes[0].node_id, 42);
    }
}
