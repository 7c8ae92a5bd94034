//! Cycle reports and the events published to the application

use serde::Serialize;

/// Outcome counts of one push or pull phase
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PhaseCounts {
    /// Rows accepted by the server (push) or written locally (pull)
    pub applied: usize,
    pub conflicts: usize,
    /// Conflicts settled by the default strategy
    pub auto_resolved: usize,
    pub errors: usize,
    /// Pulled items the client already held
    pub skipped: usize,
}

impl PhaseCounts {
    pub fn add(&mut self, other: Self) {
        self.applied += other.applied;
        self.conflicts += other.conflicts;
        self.auto_resolved += other.auto_resolved;
        self.errors += other.errors;
        self.skipped += other.skipped;
    }
}

/// What one cycle did for one entity type
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct EntityReport {
    pub entity_type: String,
    pub push: PhaseCounts,
    pub pull: PhaseCounts,
    /// Local failure that stopped this entity type
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Why a cycle stopped before visiting every entity type
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CycleAbort {
    pub entity_type: String,
    pub message: String,
    pub auth_required: bool,
    /// Entity types never visited
    pub skipped: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SyncReport {
    pub entities: Vec<EntityReport>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub aborted: Option<CycleAbort>,
    pub started_at: i64,
    pub finished_at: i64,
}

impl SyncReport {
    pub fn entity(&self, entity_type: &str) -> Option<&EntityReport> {
        self.entities
            .iter()
            .find(|entity| entity.entity_type == entity_type)
    }

    pub fn pushed(&self) -> usize {
        self.entities.iter().map(|entity| entity.push.applied).sum()
    }

    pub fn pulled(&self) -> usize {
        self.entities.iter().map(|entity| entity.pull.applied).sum()
    }

    pub fn conflicts(&self) -> usize {
        self.entities
            .iter()
            .map(|entity| entity.push.conflicts + entity.pull.conflicts)
            .sum()
    }

    pub fn errors(&self) -> usize {
        self.entities
            .iter()
            .map(|entity| entity.push.errors + entity.pull.errors)
            .sum()
    }

    /// Every entity type was visited without a phase failure
    pub fn is_complete(&self) -> bool {
        self.aborted.is_none() && self.entities.iter().all(|entity| entity.error.is_none())
    }
}

/// Notifications for views that depend on synced data
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncEvent {
    CycleCompleted(SyncReport),
    /// A conflict was recorded and waits for a manual choice
    ConflictDetected {
        conflict_id: i64,
        entity_type: String,
        local_id: String,
    },
    /// The credential was rejected; sign in again before the next cycle
    AuthRequired { message: String },
}
