//! Storage layer using RocksDB
//!
//! # Column Families
//!
//! - `quanta` - Processed quantum envelopes (key: apex, big-endian)
//! - `effects` - Committed effects per quantum (key: apex, big-endian)
//! - `snapshots` - Confirmed snapshots (key: apex, big-endian)
//!
//! Values use the canonical message encoding.

use super::quantum_apex;
use crate::config::StorageConfig;
use crate::effects::Effect;
use crate::messages::{self, Envelope};
use crate::ports::Persistence;
use crate::snapshot::Snapshot;
use crate::{Error, Result};
use async_trait::async_trait;
use rocksdb::{
    ColumnFamily, ColumnFamilyDescriptor, DBCompactionStyle, Direction, IteratorMode, Options,
    WriteBatch, DB,
};
use std::sync::Arc;

/// Column family names
const CF_QUANTA: &str = "quanta";
const CF_EFFECTS: &str = "effects";
const CF_SNAPSHOTS: &str = "snapshots";

/// RocksDB-backed persistence
pub struct RocksDbPersistence {
    db: Arc<DB>,
}

impl std::fmt::Debug for RocksDbPersistence {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RocksDbPersistence")
            .field("path", &self.db.path())
            .finish()
    }
}

impl RocksDbPersistence {
    /// Open or create database
    pub fn open(config: &StorageConfig) -> Result<Self> {
        let path = &config.data_dir;
        std::fs::create_dir_all(path)?;

        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);

        db_opts.set_write_buffer_size(config.rocksdb.write_buffer_size_mb * 1024 * 1024);
        db_opts.set_max_write_buffer_number(config.rocksdb.max_write_buffer_number);
        db_opts.set_target_file_size_base(config.rocksdb.target_file_size_mb * 1024 * 1024);
        db_opts.set_max_background_jobs(config.rocksdb.max_background_jobs);
        db_opts.set_level_zero_file_num_compaction_trigger(
            config.rocksdb.level0_file_num_compaction_trigger,
        );

        // Append-only workload
        db_opts.set_compaction_style(DBCompactionStyle::Universal);

        if config.rocksdb.enable_statistics {
            db_opts.enable_statistics();
        }

        let cf_descriptors = vec![
            ColumnFamilyDescriptor::new(CF_QUANTA, Self::cf_options_log()),
            ColumnFamilyDescriptor::new(CF_EFFECTS, Self::cf_options_log()),
            ColumnFamilyDescriptor::new(CF_SNAPSHOTS, Self::cf_options_snapshots()),
        ];

        let db = DB::open_cf_descriptors(&db_opts, path, cf_descriptors)?;
        tracing::info!(path = ?path, "Opened RocksDB persistence");

        Ok(Self { db: Arc::new(db) })
    }

    fn cf_options_log() -> Options {
        let mut opts = Options::default();
        opts.set_compression_type(rocksdb::DBCompressionType::Lz4);
        opts
    }

    fn cf_options_snapshots() -> Options {
        let mut opts = Options::default();
        opts.set_compression_type(rocksdb::DBCompressionType::Zstd);
        opts
    }

    fn cf_handle(&self, name: &str) -> Result<&ColumnFamily> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| Error::Storage(format!("Column family {} not found", name)))
    }

    fn last_snapshot_apex(&self) -> Result<u64> {
        let cf = self.cf_handle(CF_SNAPSHOTS)?;
        match self.db.iterator_cf(cf, IteratorMode::End).next() {
            Some(item) => {
                let (key, _) = item?;
                decode_apex(&key)
            }
            None => Ok(0),
        }
    }

    fn scan_quanta(&self, from: u64, to: u64) -> Result<Vec<Envelope>> {
        let cf = self.cf_handle(CF_QUANTA)?;
        let start = from.to_be_bytes();
        let mut quanta = Vec::new();
        for item in self
            .db
            .iterator_cf(cf, IteratorMode::From(&start, Direction::Forward))
        {
            let (key, value) = item?;
            if decode_apex(&key)? > to {
                break;
            }
            quanta.push(messages::decode(&value)?);
        }
        Ok(quanta)
    }
}

fn decode_apex(key: &[u8]) -> Result<u64> {
    let bytes: [u8; 8] = key
        .try_into()
        .map_err(|_| Error::Storage(format!("Invalid apex key of {} bytes", key.len())))?;
    Ok(u64::from_be_bytes(bytes))
}

#[async_trait]
impl Persistence for RocksDbPersistence {
    async fn save_effects(&self, quantum: &Envelope, effects: &[Effect]) -> Result<()> {
        let apex = quantum_apex(quantum)?;
        let key = apex.to_be_bytes();
        if let Some(existing) = self.db.get_cf(self.cf_handle(CF_QUANTA)?, key)? {
            let existing: Envelope = messages::decode(&existing)?;
            if existing.message == quantum.message {
                return Ok(());
            }
            return Err(Error::Storage(format!(
                "A different quantum is already stored at apex {}",
                apex
            )));
        }
        let mut batch = WriteBatch::default();
        batch.put_cf(self.cf_handle(CF_QUANTA)?, key, messages::encode(quantum)?);
        batch.put_cf(self.cf_handle(CF_EFFECTS)?, key, messages::encode(&effects)?);
        self.db.write(batch)?;
        Ok(())
    }

    async fn save_snapshot(&self, snapshot: &Snapshot) -> Result<()> {
        let cf = self.cf_handle(CF_SNAPSHOTS)?;
        self.db
            .put_cf(cf, snapshot.apex.to_be_bytes(), messages::encode(snapshot)?)?;
        tracing::debug!(apex = snapshot.apex, "Snapshot stored");
        Ok(())
    }

    async fn get_last_snapshot(&self) -> Result<Option<Snapshot>> {
        let cf = self.cf_handle(CF_SNAPSHOTS)?;
        match self.db.iterator_cf(cf, IteratorMode::End).next() {
            Some(item) => {
                let (_, value) = item?;
                Ok(Some(messages::decode(&value)?))
            }
            None => Ok(None),
        }
    }

    async fn get_pending_quanta(&self) -> Result<Vec<Envelope>> {
        let after = self.last_snapshot_apex()?;
        self.scan_quanta(after + 1, u64::MAX)
    }

    async fn get_quanta(&self, from: u64, to: u64) -> Result<Vec<Envelope>> {
        if from > to {
            return Ok(Vec::new());
        }
        self.scan_quanta(from, to)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::{Message, Quantum, QuantumKind};
    use crate::snapshot::test_support::empty_snapshot;
    use tempfile::TempDir;

    fn test_config() -> (StorageConfig, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let config = StorageConfig {
            data_dir: temp_dir.path().to_path_buf(),
            ..StorageConfig::default()
        };
        (config, temp_dir)
    }

    fn quantum(apex: u64) -> Envelope {
        Envelope::new(Message::Quantum(Quantum {
            apex,
            timestamp: 0,
            kind: QuantumKind::Snapshot { hash: [0u8; 32] },
        }))
    }

    #[tokio::test]
    async fn test_quanta_and_snapshots() {
        let (config, _temp) = test_config();
        let store = RocksDbPersistence::open(&config).unwrap();
        for apex in [1, 2, 3, 256] {
            store.save_effects(&quantum(apex), &[]).await.unwrap();
        }
        assert_eq!(store.get_quanta(2, 3).await.unwrap(), vec![quantum(2), quantum(3)]);

        // Same message again is a no-op, a different one at a stored apex is refused
        store.save_effects(&quantum(3), &[]).await.unwrap();
        let conflicting = Envelope::new(Message::Quantum(Quantum {
            apex: 3,
            timestamp: 99,
            kind: QuantumKind::Snapshot { hash: [1u8; 32] },
        }));
        assert!(matches!(
            store.save_effects(&conflicting, &[]).await,
            Err(Error::Storage(_))
        ));
        assert_eq!(store.get_quanta(3, 3).await.unwrap(), vec![quantum(3)]);

        store.save_snapshot(&empty_snapshot(2, vec![])).await.unwrap();
        assert_eq!(store.get_last_snapshot().await.unwrap().unwrap().apex, 2);
        assert_eq!(
            store.get_pending_quanta().await.unwrap(),
            vec![quantum(3), quantum(256)]
        );
    }
}
