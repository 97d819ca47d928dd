//! Per-service status table.

use armada_core::{ServiceState, ServiceStatus};
use std::collections::BTreeMap;
use std::sync::RwLock;

/// Status of every registered service.
///
/// Reads hand out clones; only the health monitor mutates entries.
#[derive(Debug, Default)]
pub struct StatusBoard {
    entries: RwLock<BTreeMap<String, ServiceStatus>>,
}

impl StatusBoard {
    /// Board with one `unknown` entry per name.
    pub fn new<'a>(names: impl IntoIterator<Item = &'a str>) -> Self {
        let entries = names
            .into_iter()
            .map(|name| (name.to_string(), ServiceStatus::new(name)))
            .collect();
        Self {
            entries: RwLock::new(entries),
        }
    }

    pub fn get(&self, name: &str) -> Option<ServiceStatus> {
        self.entries
            .read()
            .ok()
            .and_then(|entries| entries.get(name).cloned())
    }

    pub fn state(&self, name: &str) -> Option<ServiceState> {
        self.get(name).map(|status| status.state)
    }

    /// All statuses ordered by service name.
    pub fn snapshot(&self) -> Vec<ServiceStatus> {
        self.entries
            .read()
            .map(|entries| entries.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Apply `f` to the entry for `name`, creating it if needed, and return
    /// what `f` returned.
    pub(crate) fn update<R>(&self, name: &str, f: impl FnOnce(&mut ServiceStatus) -> R) -> Option<R> {
        let mut entries = self.entries.write().ok()?;
        let status = entries
            .entry(name.to_string())
            .or_insert_with(|| ServiceStatus::new(name));
        Some(f(status))
    }
}
