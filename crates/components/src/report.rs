use serde::Serialize;
use std::path::PathBuf;

/// Status of one direct dependency.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct DependencyStatus {
    pub id: String,
    /// Known to the registry.
    pub available: bool,
    pub locally_available: bool,
    pub loaded: bool,
    /// Every sub-dependency is known to the registry.
    pub resolved: bool,
    pub sub_dependencies: Vec<String>,
}

/// One level deep view of a component's dependencies.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct DependencyReport {
    pub component_id: String,
    pub total_dependencies: usize,
    pub all_resolved: bool,
    pub dependencies: Vec<DependencyStatus>,
}

/// Outcome of a full resynchronization.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SyncReport {
    pub backup_path: Option<PathBuf>,
    pub updated: Vec<String>,
    pub failed: Vec<String>,
    pub backed_up: Vec<String>,
    pub removed_backups: Vec<PathBuf>,
    pub error: Option<String>,
}

impl SyncReport {
    pub fn success(&self) -> bool {
        self.error.is_none() && self.failed.is_empty()
    }
}

/// A component currently in the loaded set.
#[derive(Debug, Clone, Serialize)]
pub struct LoadedInfo {
    pub id: String,
    pub kind: alfred_core::ComponentKind,
    /// Position in load order, increasing across the manager's lifetime.
    pub load_seq: u64,
    pub loaded_at: chrono::DateTime<chrono::Utc>,
}
