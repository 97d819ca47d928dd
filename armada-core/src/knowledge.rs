//! Knowledge graph records

use crate::error::StoreError;
use crate::Timestamp;
use chrono::Utc;
use serde::{Deserialize, Serialize};

pub const ENTITY_CYCLE_RESULT: &str = "cycle_result";
pub const ENTITY_CYCLE_FAILURE: &str = "cycle_failure";
pub const ENTITY_WORKFLOW_CYCLE: &str = "workflow_cycle";
pub const ENTITY_ECOSYSTEM_SNAPSHOT: &str = "ecosystem_snapshot";
pub const RELATION_RECORDED_FOR: &str = "recorded_for";

/// An append-only knowledge entity. Newer entities supersede older ones;
/// existing entities are never mutated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KnowledgeEntity {
    pub id: String,
    pub entity_type: String,
    pub observations: Vec<String>,
    pub created_at: Timestamp,
}

impl KnowledgeEntity {
    pub fn new(id: impl Into<String>, entity_type: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            entity_type: entity_type.into(),
            observations: Vec::new(),
            created_at: Utc::now(),
        }
    }

    pub fn with_observation(mut self, observation: impl Into<String>) -> Self {
        self.observations.push(observation.into());
        self
    }

    pub fn with_observations<I, S>(mut self, observations: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.observations
            .extend(observations.into_iter().map(Into::into));
        self
    }

    pub fn created_at(mut self, at: Timestamp) -> Self {
        self.created_at = at;
        self
    }

    /// Case-insensitive substring match over id, type and observations.
    /// `needle` must already be lowercase.
    pub fn matches_lowercase(&self, needle: &str) -> bool {
        self.id.to_lowercase().contains(needle)
            || self.entity_type.to_lowercase().contains(needle)
            || self
                .observations
                .iter()
                .any(|o| o.to_lowercase().contains(needle))
    }
}

/// A directed, typed edge between two existing entities.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KnowledgeRelation {
    pub from_id: String,
    pub to_id: String,
    pub relation_type: String,
    pub created_at: Timestamp,
}

impl KnowledgeRelation {
    pub fn new(
        from_id: impl Into<String>,
        to_id: impl Into<String>,
        relation_type: impl Into<String>,
    ) -> Self {
        Self {
            from_id: from_id.into(),
            to_id: to_id.into(),
            relation_type: relation_type.into(),
            created_at: Utc::now(),
        }
    }

    /// Identity used for duplicate detection.
    pub fn same_edge(&self, other: &KnowledgeRelation) -> bool {
        self.from_id == other.from_id
            && self.to_id == other.to_id
            && self.relation_type == other.relation_type
    }
}

/// A relation that was not stored, with the reason.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RejectedRelation {
    pub relation: KnowledgeRelation,
    pub reason: StoreError,
}

/// Per-batch outcome of `create_relations`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RelationOutcome {
    /// Number of relations newly stored.
    pub accepted: usize,
    /// Exact duplicates of stored relations, ignored.
    pub duplicates: usize,
    pub rejected: Vec<RejectedRelation>,
}

impl RelationOutcome {
    pub fn is_complete(&self) -> bool {
        self.rejected.is_empty()
    }
}
