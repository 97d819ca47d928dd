//! LMDB-backed knowledge persistence.
//!
//! Uses the heed crate. Records live in the single unnamed database under
//! sequence-numbered keys, so a forward scan replays them in append order:
//!
//! ```text
//! b'e' ++ seq (u64, big-endian)  ->  JSON entity
//! b'r' ++ seq (u64, big-endian)  ->  JSON relation
//! ```

use crate::backend::{KnowledgeBackend, StoredRecords};
use armada_core::{KnowledgeEntity, KnowledgeRelation, StoreError};
use heed::types::Bytes;
use heed::{Database, Env, EnvOpenOptions};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};

const ENTITY_PREFIX: u8 = b'e';
const RELATION_PREFIX: u8 = b'r';

fn backend_error(e: impl std::fmt::Display) -> StoreError {
    StoreError::Backend {
        reason: e.to_string(),
    }
}

fn record_key(prefix: u8, seq: u64) -> [u8; 9] {
    let mut key = [0u8; 9];
    key[0] = prefix;
    key[1..].copy_from_slice(&seq.to_be_bytes());
    key
}

fn key_seq(key: &[u8]) -> Option<u64> {
    let bytes: [u8; 8] = key.get(1..9)?.try_into().ok()?;
    Some(u64::from_be_bytes(bytes))
}

/// Knowledge backend persisting to an LMDB environment.
pub struct LmdbBackend {
    env: Env,
    db: Database<Bytes, Bytes>,
    next_seq: AtomicU64,
}

impl LmdbBackend {
    /// Open (or create) the environment at `path`.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::Backend` if the directory cannot be created or
    /// the environment or database cannot be opened.
    pub fn open<P: AsRef<Path>>(path: P, max_size_mb: usize) -> Result<Self, StoreError> {
        std::fs::create_dir_all(&path).map_err(backend_error)?;

        let env = unsafe {
            EnvOpenOptions::new()
                .map_size(max_size_mb * 1024 * 1024)
                .max_dbs(1)
                .open(path.as_ref())
        }
        .map_err(backend_error)?;

        let mut wtxn = env.write_txn().map_err(backend_error)?;
        let db: Database<Bytes, Bytes> = env
            .create_database(&mut wtxn, None)
            .map_err(backend_error)?;
        wtxn.commit().map_err(backend_error)?;

        let backend = Self {
            env,
            db,
            next_seq: AtomicU64::new(0),
        };
        let next = backend.highest_seq()?.map(|s| s + 1).unwrap_or(0);
        backend.next_seq.store(next, Ordering::SeqCst);
        Ok(backend)
    }

    fn highest_seq(&self) -> Result<Option<u64>, StoreError> {
        let rtxn = self.env.read_txn().map_err(backend_error)?;
        let mut highest = None;
        for result in self.db.iter(&rtxn).map_err(backend_error)? {
            let (key, _) = result.map_err(backend_error)?;
            if let Some(seq) = key_seq(key) {
                highest = Some(highest.map_or(seq, |h: u64| h.max(seq)));
            }
        }
        Ok(highest)
    }
}

impl KnowledgeBackend for LmdbBackend {
    fn name(&self) -> &'static str {
        "lmdb"
    }

    fn load(&self) -> Result<StoredRecords, StoreError> {
        let rtxn = self.env.read_txn().map_err(backend_error)?;
        let mut records = StoredRecords::default();

        for result in self.db.iter(&rtxn).map_err(backend_error)? {
            let (key, value) = result.map_err(backend_error)?;
            match key.first() {
                Some(&ENTITY_PREFIX) => {
                    let entity: KnowledgeEntity = serde_json::from_slice(value).map_err(|e| {
                        StoreError::Serialization {
                            reason: e.to_string(),
                        }
                    })?;
                    records.entities.push(entity);
                }
                Some(&RELATION_PREFIX) => {
                    let relation: KnowledgeRelation =
                        serde_json::from_slice(value).map_err(|e| StoreError::Serialization {
                            reason: e.to_string(),
                        })?;
                    records.relations.push(relation);
                }
                _ => {
                    tracing::warn!(key_len = key.len(), "Skipping unrecognised knowledge record");
                }
            }
        }

        Ok(records)
    }

    fn append(
        &self,
        entities: &[KnowledgeEntity],
        relations: &[KnowledgeRelation],
    ) -> Result<(), StoreError> {
        if entities.is_empty() && relations.is_empty() {
            return Ok(());
        }

        let mut wtxn = self.env.write_txn().map_err(backend_error)?;
        let mut seq = self.next_seq.load(Ordering::SeqCst);

        for entity in entities {
            let bytes = serde_json::to_vec(entity).map_err(|e| StoreError::Serialization {
                reason: e.to_string(),
            })?;
            self.db
                .put(&mut wtxn, &record_key(ENTITY_PREFIX, seq), &bytes)
                .map_err(backend_error)?;
            seq += 1;
        }
        for relation in relations {
            let bytes = serde_json::to_vec(relation).map_err(|e| StoreError::Serialization {
                reason: e.to_string(),
            })?;
            self.db
                .put(&mut wtxn, &record_key(RELATION_PREFIX, seq), &bytes)
                .map_err(backend_error)?;
            seq += 1;
        }

        wtxn.commit().map_err(backend_error)?;
        self.next_seq.store(seq, Ordering::SeqCst);
        Ok(())
    }

    fn sync(&self) -> Result<(), StoreError> {
        self.env.force_sync().map_err(backend_error)
    }
}

impl std::fmt::Debug for LmdbBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LmdbBackend")
            .field("path", &self.env.path())
            .field("next_seq", &self.next_seq.load(Ordering::SeqCst))
            .finish()
    }
}
