//! ResourceStore — redb-backed persistence for resource rows.
//!
//! The manager talks to storage through this narrow DAO: `create`
//! (insert, fails if present), `put` (upsert), `get`, and
//! `list_by_status`. Rows are JSON-serialized into redb's `&[u8]`
//! value column. Both on-disk and in-memory backends are supported
//! (the latter for testing).

use std::path::Path;
use std::sync::Arc;

use redb::{Database, ReadableDatabase, ReadableTable};
use tracing::debug;

use crate::error::{StateError, StateResult};
use crate::tables::RESOURCES;
use crate::types::{ResourceRecord, ResourceStatus};

/// Convert any `Display` error into a `StateError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| StateError::$variant(e.to_string())
    };
}

/// Thread-safe resource store backed by redb.
#[derive(Clone)]
pub struct ResourceStore {
    db: Arc<Database>,
}

impl ResourceStore {
    /// Open (or create) a persistent store at the given path.
    ///
    /// `ensure_table` requests idempotent create-if-absent of the
    /// resource table; deployments that manage schema out-of-band can
    /// pass `false`.
    pub fn open(path: &Path, ensure_table: bool) -> StateResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        if ensure_table {
            store.ensure_tables()?;
        }
        debug!(?path, "resource store opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory store (for testing).
    pub fn open_in_memory() -> StateResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!("in-memory resource store opened");
        Ok(store)
    }

    /// Create the resource table if it doesn't exist yet.
    fn ensure_tables(&self) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        // Opening a table in a write transaction creates it if absent.
        txn.open_table(RESOURCES).map_err(map_err!(Table))?;
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    /// Insert a new row. Fails with `AlreadyExists` if the id is taken.
    pub fn create_resource(&self, record: &ResourceRecord) -> StateResult<()> {
        let value = serde_json::to_vec(record).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(RESOURCES).map_err(map_err!(Table))?;
            let existing = table
                .get(record.resource_id.as_str())
                .map_err(map_err!(Read))?;
            if existing.is_some() {
                return Err(StateError::AlreadyExists(record.resource_id.clone()));
            }
            drop(existing);
            table
                .insert(record.resource_id.as_str(), value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(resource_id = %record.resource_id, "resource row created");
        Ok(())
    }

    /// Insert or update a row.
    pub fn put_resource(&self, record: &ResourceRecord) -> StateResult<()> {
        let value = serde_json::to_vec(record).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(RESOURCES).map_err(map_err!(Table))?;
            table
                .insert(record.resource_id.as_str(), value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    /// Get a row by resource id.
    pub fn get_resource(&self, resource_id: &str) -> StateResult<Option<ResourceRecord>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(RESOURCES).map_err(map_err!(Table))?;
        match table.get(resource_id).map_err(map_err!(Read))? {
            Some(guard) => {
                let record: ResourceRecord =
                    serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                Ok(Some(record))
            }
            None => Ok(None),
        }
    }

    /// List all rows whose status is in `statuses`. Unbounded.
    pub fn list_by_status(&self, statuses: &[ResourceStatus]) -> StateResult<Vec<ResourceRecord>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(RESOURCES).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (_, value) = entry.map_err(map_err!(Read))?;
            let record: ResourceRecord =
                serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
            if statuses.contains(&record.status) {
                results.push(record);
            }
        }
        Ok(results)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ResourceParam;

    fn test_record(id: &str, status: ResourceStatus) -> ResourceRecord {
        let mut r = ResourceRecord::new(
            id,
            "alice",
            ResourceParam {
                city: "sh".to_string(),
                platform: "linux".to_string(),
                image: "img:v1".to_string(),
                ..ResourceParam::default()
            },
            1000,
        );
        r.status = status;
        r
    }

    #[test]
    fn create_and_get() {
        let store = ResourceStore::open_in_memory().unwrap();
        let r = test_record("alice-job1", ResourceStatus::Init);

        store.create_resource(&r).unwrap();
        let back = store.get_resource("alice-job1").unwrap();
        assert_eq!(back, Some(r));
    }

    #[test]
    fn create_duplicate_rejected() {
        let store = ResourceStore::open_in_memory().unwrap();
        let r = test_record("alice-job1", ResourceStatus::Init);

        store.create_resource(&r).unwrap();
        let err = store.create_resource(&r).unwrap_err();
        assert!(matches!(err, StateError::AlreadyExists(_)));
    }

    #[test]
    fn get_nonexistent_returns_none() {
        let store = ResourceStore::open_in_memory().unwrap();
        assert!(store.get_resource("nope").unwrap().is_none());
    }

    #[test]
    fn put_updates_in_place() {
        let store = ResourceStore::open_in_memory().unwrap();
        let mut r = test_record("alice-job1", ResourceStatus::Init);
        store.create_resource(&r).unwrap();

        r.status = ResourceStatus::Deploying;
        r.request_instance = 3;
        r.no_ready_instance = 3;
        r.resource_block_key = "sh/linux".to_string();
        store.put_resource(&r).unwrap();

        let back = store.get_resource("alice-job1").unwrap().unwrap();
        assert_eq!(back.status, ResourceStatus::Deploying);
        assert_eq!(back.request_instance, 3);
        assert_eq!(back.resource_block_key, "sh/linux");
    }

    #[test]
    fn list_filters_by_status() {
        let store = ResourceStore::open_in_memory().unwrap();
        store
            .create_resource(&test_record("a", ResourceStatus::Init))
            .unwrap();
        store
            .create_resource(&test_record("b", ResourceStatus::Deploying))
            .unwrap();
        store
            .create_resource(&test_record("c", ResourceStatus::Running))
            .unwrap();
        store
            .create_resource(&test_record("d", ResourceStatus::Released))
            .unwrap();

        let live = store
            .list_by_status(&[
                ResourceStatus::Init,
                ResourceStatus::Deploying,
                ResourceStatus::Running,
            ])
            .unwrap();
        assert_eq!(live.len(), 3);
        assert!(live.iter().all(|r| r.status != ResourceStatus::Released));

        let released = store.list_by_status(&[ResourceStatus::Released]).unwrap();
        assert_eq!(released.len(), 1);
        assert_eq!(released[0].resource_id, "d");
    }

    #[test]
    fn persistence_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("corral.redb");

        {
            let store = ResourceStore::open(&db_path, true).unwrap();
            store
                .create_resource(&test_record("alice-job1", ResourceStatus::Running))
                .unwrap();
        }

        // Reopen the same database file.
        let store = ResourceStore::open(&db_path, true).unwrap();
        let back = store.get_resource("alice-job1").unwrap().unwrap();
        assert_eq!(back.status, ResourceStatus::Running);
        assert_eq!(back.init_time, 1000);
    }

    #[test]
    fn empty_store_lists_nothing() {
        let store = ResourceStore::open_in_memory().unwrap();
        assert!(store
            .list_by_status(&[ResourceStatus::Init, ResourceStatus::Running])
            .unwrap()
            .is_empty());
    }
}
