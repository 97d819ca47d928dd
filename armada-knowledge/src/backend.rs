//! Persistence seam for the knowledge store.

use armada_core::{KnowledgeEntity, KnowledgeRelation, StoreError};
use std::sync::Mutex;

/// Everything a backend has persisted, in append order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StoredRecords {
    pub entities: Vec<KnowledgeEntity>,
    pub relations: Vec<KnowledgeRelation>,
}

/// Durable storage for knowledge records.
///
/// The store calls `append` only while holding its writer lock, so
/// implementations never see concurrent appends.
pub trait KnowledgeBackend: Send + Sync {
    /// Short backend name for logs.
    fn name(&self) -> &'static str;

    /// Load every persisted record in append order.
    fn load(&self) -> Result<StoredRecords, StoreError>;

    /// Persist a batch atomically.
    fn append(
        &self,
        entities: &[KnowledgeEntity],
        relations: &[KnowledgeRelation],
    ) -> Result<(), StoreError>;

    /// Flush everything to durable storage.
    fn sync(&self) -> Result<(), StoreError>;
}

/// Backend that keeps records in memory.
///
/// Sharing one instance between two stores (via `Arc`) behaves like
/// reopening a persistent store, which tests rely on.
#[derive(Debug, Default)]
pub struct MemoryBackend {
    records: Mutex<StoredRecords>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KnowledgeBackend for MemoryBackend {
    fn name(&self) -> &'static str {
        "memory"
    }

    fn load(&self) -> Result<StoredRecords, StoreError> {
        let records = self.records.lock().map_err(|_| StoreError::LockPoisoned)?;
        Ok(records.clone())
    }

    fn append(
        &self,
        entities: &[KnowledgeEntity],
        relations: &[KnowledgeRelation],
    ) -> Result<(), StoreError> {
        let mut records = self.records.lock().map_err(|_| StoreError::LockPoisoned)?;
        records.entities.extend_from_slice(entities);
        records.relations.extend_from_slice(relations);
        Ok(())
    }

    fn sync(&self) -> Result<(), StoreError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_backend_appends_in_order() {
        let backend = MemoryBackend::new();
        backend
            .append(&[KnowledgeEntity::new("a", "t")], &[])
            .unwrap();
        backend
            .append(
                &[KnowledgeEntity::new("b", "t")],
                &[KnowledgeRelation::new("a", "b", "next")],
            )
            .unwrap();

        let records = backend.load().unwrap();
        let ids: Vec<_> = records.entities.iter().map(|e| e.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b"]);
        assert_eq!(records.relations.len(), 1);
    }
}
