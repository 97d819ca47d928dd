//! ARMADA Knowledge - Append-only knowledge graph
//!
//! Entities and typed relations produced by workflow cycles and the
//! orchestrator. Writes go through a single writer path; reads take a
//! consistent snapshot. Durability is provided by a [`KnowledgeBackend`]:
//!
//! - [`MemoryBackend`]: nothing survives the process
//! - [`LmdbBackend`]: records are appended to an LMDB environment and
//!   replayed on open

pub mod backend;
pub mod lmdb;
pub mod store;

pub use backend::{KnowledgeBackend, MemoryBackend, StoredRecords};
pub use lmdb::LmdbBackend;
pub use store::KnowledgeStore;
