//! Knowledge store: single writer path, snapshot reads.

use crate::backend::{KnowledgeBackend, MemoryBackend};
use crate::lmdb::LmdbBackend;
use armada_core::{
    KnowledgeEntity, KnowledgeRelation, RejectedRelation, RelationOutcome, StoreConfig, StoreError,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard};
use std::time::Duration;
use tokio::sync::{Mutex, MutexGuard};
use tracing::{debug, info};

/// In-memory view of the graph. Entities are kept in insertion order so
/// recency ties resolve deterministically.
#[derive(Debug, Default)]
struct Graph {
    entities: Vec<KnowledgeEntity>,
    index: HashMap<String, usize>,
    relations: Vec<KnowledgeRelation>,
}

impl Graph {
    fn contains(&self, id: &str) -> bool {
        self.index.contains_key(id)
    }

    fn insert_entity(&mut self, entity: KnowledgeEntity) {
        if self.contains(&entity.id) {
            return;
        }
        self.index.insert(entity.id.clone(), self.entities.len());
        self.entities.push(entity);
    }

    fn has_relation(&self, relation: &KnowledgeRelation) -> bool {
        self.relations.iter().any(|r| r.same_edge(relation))
    }

    /// Entities newest first. Insertion order breaks timestamp ties.
    fn newest_first(&self, filter: impl Fn(&KnowledgeEntity) -> bool) -> Vec<&KnowledgeEntity> {
        let mut hits: Vec<(usize, &KnowledgeEntity)> = self
            .entities
            .iter()
            .enumerate()
            .filter(|(_, e)| filter(e))
            .collect();
        hits.sort_by(|(ia, a), (ib, b)| b.created_at.cmp(&a.created_at).then(ib.cmp(ia)));
        hits.into_iter().map(|(_, e)| e).collect()
    }
}

/// Append-only knowledge graph.
///
/// # Duplicate ids
///
/// The first write of an entity id wins. Later entities carrying the same id
/// are ignored and not counted; existing entities are never mutated.
pub struct KnowledgeStore {
    backend: Arc<dyn KnowledgeBackend>,
    graph: RwLock<Graph>,
    writer: Mutex<()>,
    write_timeout: Duration,
    closed: AtomicBool,
}

impl KnowledgeStore {
    /// Open the store described by `config`: LMDB when a path is set,
    /// memory otherwise.
    pub fn open(config: &StoreConfig) -> Result<Self, StoreError> {
        let backend: Arc<dyn KnowledgeBackend> = match &config.path {
            Some(path) => Arc::new(LmdbBackend::open(path, config.max_size_mb)?),
            None => Arc::new(MemoryBackend::new()),
        };
        Self::with_backend(backend, config.write_timeout)
    }

    /// In-memory store with the default write timeout.
    pub fn in_memory() -> Self {
        Self {
            backend: Arc::new(MemoryBackend::new()),
            graph: RwLock::new(Graph::default()),
            writer: Mutex::new(()),
            write_timeout: StoreConfig::default().write_timeout,
            closed: AtomicBool::new(false),
        }
    }

    /// Build a store over `backend`, replaying everything it holds.
    pub fn with_backend(
        backend: Arc<dyn KnowledgeBackend>,
        write_timeout: Duration,
    ) -> Result<Self, StoreError> {
        let records = backend.load()?;
        let mut graph = Graph::default();
        for entity in records.entities {
            graph.insert_entity(entity);
        }
        graph.relations = records.relations;

        info!(
            backend = backend.name(),
            entities = graph.entities.len(),
            relations = graph.relations.len(),
            "Knowledge store opened"
        );

        Ok(Self {
            backend,
            graph: RwLock::new(graph),
            writer: Mutex::new(()),
            write_timeout,
            closed: AtomicBool::new(false),
        })
    }

    /// Store entities whose ids are not yet present.
    ///
    /// Returns the number of entities newly stored.
    pub async fn create_entities(
        &self,
        entities: Vec<KnowledgeEntity>,
    ) -> Result<usize, StoreError> {
        let _writer = self.acquire_writer().await?;

        let fresh: Vec<KnowledgeEntity> = {
            let graph = self.snapshot()?;
            let mut seen = std::collections::HashSet::new();
            entities
                .into_iter()
                .filter(|e| !graph.contains(&e.id) && seen.insert(e.id.clone()))
                .collect()
        };

        if fresh.is_empty() {
            return Ok(0);
        }

        self.backend.append(&fresh, &[])?;

        let count = fresh.len();
        let mut graph = self.graph.write().map_err(|_| StoreError::LockPoisoned)?;
        for entity in fresh {
            graph.insert_entity(entity);
        }
        debug!(created = count, "Entities stored");
        Ok(count)
    }

    /// Store relations whose endpoints both exist.
    ///
    /// Relations naming an unknown endpoint are rejected individually; the
    /// rest of the batch is still stored. Exact duplicates of stored edges
    /// are counted but not stored again.
    pub async fn create_relations(
        &self,
        relations: Vec<KnowledgeRelation>,
    ) -> Result<RelationOutcome, StoreError> {
        let _writer = self.acquire_writer().await?;

        let mut outcome = RelationOutcome::default();
        let mut accepted: Vec<KnowledgeRelation> = Vec::new();
        {
            let graph = self.snapshot()?;
            for relation in relations {
                let missing = [&relation.from_id, &relation.to_id]
                    .into_iter()
                    .find(|id| !graph.contains(id))
                    .cloned();
                if let Some(missing) = missing {
                    let reason = StoreError::UnknownEndpoint {
                        from_id: relation.from_id.clone(),
                        to_id: relation.to_id.clone(),
                        relation_type: relation.relation_type.clone(),
                        missing,
                    };
                    outcome.rejected.push(RejectedRelation { relation, reason });
                } else if graph.has_relation(&relation)
                    || accepted.iter().any(|r| r.same_edge(&relation))
                {
                    outcome.duplicates += 1;
                } else {
                    accepted.push(relation);
                }
            }
        }

        if !accepted.is_empty() {
            self.backend.append(&[], &accepted)?;
            outcome.accepted = accepted.len();
            let mut graph = self.graph.write().map_err(|_| StoreError::LockPoisoned)?;
            graph.relations.extend(accepted);
        }

        debug!(
            accepted = outcome.accepted,
            duplicates = outcome.duplicates,
            rejected = outcome.rejected.len(),
            "Relations stored"
        );
        Ok(outcome)
    }

    /// Case-insensitive substring search over id, type and observations,
    /// most recently created first. An empty query matches everything.
    pub fn search(&self, query: &str, limit: usize) -> Result<Vec<KnowledgeEntity>, StoreError> {
        let needle = query.to_lowercase();
        let graph = self.snapshot()?;
        let hits: Vec<KnowledgeEntity> = graph
            .newest_first(|e| e.matches_lowercase(&needle))
            .into_iter()
            .take(limit)
            .cloned()
            .collect();
        Ok(hits)
    }

    pub fn get(&self, id: &str) -> Result<Option<KnowledgeEntity>, StoreError> {
        let graph = self.snapshot()?;
        let entity = graph.index.get(id).map(|&i| graph.entities[i].clone());
        Ok(entity)
    }

    /// Entities of one type, newest first.
    pub fn entities_of_type(&self, entity_type: &str) -> Result<Vec<KnowledgeEntity>, StoreError> {
        let graph = self.snapshot()?;
        let hits: Vec<KnowledgeEntity> = graph
            .newest_first(|e| e.entity_type == entity_type)
            .into_iter()
            .cloned()
            .collect();
        Ok(hits)
    }

    /// Relations with `id` at either end, in insertion order.
    pub fn relations_of(&self, id: &str) -> Result<Vec<KnowledgeRelation>, StoreError> {
        let graph = self.snapshot()?;
        let edges: Vec<KnowledgeRelation> = graph
            .relations
            .iter()
            .filter(|r| r.from_id == id || r.to_id == id)
            .cloned()
            .collect();
        Ok(edges)
    }

    pub fn entity_count(&self) -> Result<usize, StoreError> {
        Ok(self.snapshot()?.entities.len())
    }

    pub fn relation_count(&self) -> Result<usize, StoreError> {
        Ok(self.snapshot()?.relations.len())
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Flush the backend and reject further writes. Closing twice is a no-op.
    pub async fn close(&self) -> Result<(), StoreError> {
        let _writer = match self.acquire_writer().await {
            Ok(guard) => guard,
            Err(StoreError::Closed) => return Ok(()),
            Err(e) => return Err(e),
        };
        self.closed.store(true, Ordering::SeqCst);
        self.backend.sync()?;
        info!(backend = self.backend.name(), "Knowledge store closed");
        Ok(())
    }

    async fn acquire_writer(&self) -> Result<MutexGuard<'_, ()>, StoreError> {
        if self.is_closed() {
            return Err(StoreError::Closed);
        }
        let guard = tokio::time::timeout(self.write_timeout, self.writer.lock())
            .await
            .map_err(|_| StoreError::WriteTimeout {
                timeout: self.write_timeout,
            })?;
        // Closed while we waited.
        if self.is_closed() {
            return Err(StoreError::Closed);
        }
        Ok(guard)
    }

    fn snapshot(&self) -> Result<RwLockReadGuard<'_, Graph>, StoreError> {
        self.graph.read().map_err(|_| StoreError::LockPoisoned)
    }
}

impl std::fmt::Debug for KnowledgeStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KnowledgeStore")
            .field("backend", &self.backend.name())
            .field("write_timeout", &self.write_timeout)
            .field("closed", &self.is_closed())
            .finish()
    }
}
