//! Orchestrator-level ecosystem state

use serde::{Deserialize, Serialize};

/// Overall state of the orchestrated ecosystem. Exactly one per orchestrator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EcosystemState {
    Initializing,
    Active,
    Optimizing,
    Learning,
    Error,
    Shutdown,
}

impl EcosystemState {
    pub fn as_str(&self) -> &'static str {
        match self {
            EcosystemState::Initializing => "initializing",
            EcosystemState::Active => "active",
            EcosystemState::Optimizing => "optimizing",
            EcosystemState::Learning => "learning",
            EcosystemState::Error => "error",
            EcosystemState::Shutdown => "shutdown",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, EcosystemState::Shutdown)
    }

    /// Whether the ecosystem is up and serving, including transient
    /// learning/optimizing states.
    pub fn is_operational(&self) -> bool {
        matches!(
            self,
            EcosystemState::Active | EcosystemState::Learning | EcosystemState::Optimizing
        )
    }

    /// Allowed transitions.
    ///
    /// ```text
    /// initializing -> active
    /// active      <-> learning | optimizing
    /// learning    <-> optimizing   (overlapping tagged cycles)
    /// active|learning|optimizing -> error
    /// error -> active
    /// *     -> shutdown            (terminal)
    /// ```
    pub fn can_transition_to(&self, next: EcosystemState) -> bool {
        use EcosystemState::*;
        match (self, next) {
            (Shutdown, _) => false,
            (_, Shutdown) => true,
            (Initializing, Active) => true,
            (Active, Learning) | (Active, Optimizing) => true,
            (Learning, Active) | (Optimizing, Active) => true,
            (Learning, Optimizing) | (Optimizing, Learning) => true,
            (Active, Error) | (Learning, Error) | (Optimizing, Error) => true,
            (Error, Active) => true,
            _ => false,
        }
    }
}

impl std::fmt::Display for EcosystemState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
