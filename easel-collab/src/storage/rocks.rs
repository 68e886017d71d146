//! RocksDB-backed outbox store.
//!
//! Column families:
//! - `queue`: one value per namespace holding the ordered record list,
//!   bincode-encoded and LZ4-compressed (size-prepended)
//!
//! The whole list is overwritten on every save, so a reader always sees
//! either the previous or the next complete queue.

use rocksdb::{
    ColumnFamilyDescriptor, DBCompressionType, DBWithThreadMode, Options, SingleThreaded,
    WriteOptions,
};
use std::path::{Path, PathBuf};

use super::{QueueStore, StoreError};
use crate::outbox::QueuedAction;

const CF_QUEUE: &str = "queue";

/// Store configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Database directory path
    pub path: PathBuf,
    /// Key the queue is stored under
    pub namespace: String,
    /// fsync on every save. Default: true.
    pub sync_writes: bool,
}

impl StoreConfig {
    pub const DEFAULT_NAMESPACE: &'static str = "easel:offline-queue";

    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            namespace: Self::DEFAULT_NAMESPACE.to_string(),
            sync_writes: true,
        }
    }

    /// Config for testing (no fsync).
    pub fn for_testing(path: impl Into<PathBuf>) -> Self {
        Self {
            sync_writes: false,
            ..Self::new(path)
        }
    }
}

impl From<rocksdb::Error> for StoreError {
    fn from(e: rocksdb::Error) -> Self {
        StoreError::Database(e.to_string())
    }
}

pub struct RocksQueueStore {
    /// RocksDB instance (single-threaded; the outbox serializes writes)
    db: DBWithThreadMode<SingleThreaded>,
    config: StoreConfig,
}

impl RocksQueueStore {
    /// Open the store, creating the database and column family if missing.
    pub fn open(config: StoreConfig) -> Result<Self, StoreError> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_keep_log_file_num(2);

        let mut cf_opts = Options::default();
        // Values are already LZ4 compressed.
        cf_opts.set_compression_type(DBCompressionType::None);
        cf_opts.optimize_for_point_lookup(8 * 1024 * 1024);

        let db = DBWithThreadMode::<SingleThreaded>::open_cf_descriptors(
            &db_opts,
            &config.path,
            vec![ColumnFamilyDescriptor::new(CF_QUEUE, cf_opts)],
        )?;

        Ok(Self { db, config })
    }

    pub fn path(&self) -> &Path {
        &self.config.path
    }

    pub fn namespace(&self) -> &str {
        &self.config.namespace
    }

    fn cf(&self) -> Result<&rocksdb::ColumnFamily, StoreError> {
        self.db
            .cf_handle(CF_QUEUE)
            .ok_or_else(|| StoreError::Database(format!("Column family '{CF_QUEUE}' not found")))
    }

    fn encode(actions: &[QueuedAction]) -> Result<Vec<u8>, StoreError> {
        let raw = bincode::serde::encode_to_vec(actions, bincode::config::standard())
            .map_err(|e| StoreError::Serialization(e.to_string()))?;
        Ok(lz4_flex::compress_prepend_size(&raw))
    }

    fn decode(bytes: &[u8]) -> Result<Vec<QueuedAction>, StoreError> {
        let raw = lz4_flex::decompress_size_prepended(bytes)
            .map_err(|e| StoreError::Compression(e.to_string()))?;
        let (actions, _) = bincode::serde::decode_from_slice(&raw, bincode::config::standard())
            .map_err(|e| StoreError::Deserialization(e.to_string()))?;
        Ok(actions)
    }
}

impl QueueStore for RocksQueueStore {
    fn load(&self) -> Result<Vec<QueuedAction>, StoreError> {
        let cf = self.cf()?;
        match self.db.get_cf(cf, self.config.namespace.as_bytes())? {
            Some(bytes) => Self::decode(&bytes),
            None => Ok(Vec::new()),
        }
    }

    fn save(&self, actions: &[QueuedAction]) -> Result<(), StoreError> {
        let cf = self.cf()?;
        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(self.config.sync_writes);

        let key = self.config.namespace.as_bytes();
        if actions.is_empty() {
            self.db.delete_cf_opt(cf, key, &write_opts)?;
        } else {
            self.db.put_cf_opt(cf, key, Self::encode(actions)?, &write_opts)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{Participant, Request};
    use tempfile::tempdir;

    fn action(n: u64) -> QueuedAction {
        let who = Participant::new("u1", "User", "#123456");
        QueuedAction::new(Request::lock(format!("elem-{n}"), &who), 1_000 + n)
    }

    #[test]
    fn test_empty_store_loads_nothing() {
        let dir = tempdir().unwrap();
        let store = RocksQueueStore::open(StoreConfig::for_testing(dir.path().join("db"))).unwrap();
        assert!(store.load().unwrap().is_empty());
        assert_eq!(store.namespace(), StoreConfig::DEFAULT_NAMESPACE);
    }

    #[test]
    fn test_save_load_preserves_order() {
        let dir = tempdir().unwrap();
        let store = RocksQueueStore::open(StoreConfig::for_testing(dir.path().join("db"))).unwrap();
        let actions: Vec<_> = (0..5).map(action).collect();

        store.save(&actions).unwrap();
        assert_eq!(store.load().unwrap(), actions);
    }

    #[test]
    fn test_save_overwrites_wholesale() {
        let dir = tempdir().unwrap();
        let store = RocksQueueStore::open(StoreConfig::for_testing(dir.path().join("db"))).unwrap();

        store.save(&[action(1), action(2), action(3)]).unwrap();
        store.save(&[action(9)]).unwrap();
        assert_eq!(store.load().unwrap(), vec![action(9)]);

        store.save(&[]).unwrap();
        assert!(store.load().unwrap().is_empty());
    }

    #[test]
    fn test_queue_survives_reopen() {
        let dir = tempdir().unwrap();
        let config = StoreConfig::for_testing(dir.path().join("db"));
        let actions = vec![action(1), action(2)];
        {
            let store = RocksQueueStore::open(config.clone()).unwrap();
            store.save(&actions).unwrap();
        }
        let store = RocksQueueStore::open(config).unwrap();
        assert_eq!(store.load().unwrap(), actions);
    }

    #[test]
    fn test_namespaces_are_isolated() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("db");
        {
            let store = RocksQueueStore::open(StoreConfig::for_testing(&path)).unwrap();
            store.save(&[action(1)]).unwrap();
        }
        let other = StoreConfig {
            namespace: "other-room".into(),
            ..StoreConfig::for_testing(&path)
        };
        let store = RocksQueueStore::open(other).unwrap();
        assert!(store.load().unwrap().is_empty());
    }

    #[test]
    fn test_corrupt_value_reports_error() {
        assert!(matches!(
            RocksQueueStore::decode(&[1, 2, 3]),
            Err(StoreError::Compression(_))
        ));
    }
}
