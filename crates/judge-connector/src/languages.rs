use std::sync::{Arc, RwLock};

use judge_protocol::{LanguageSpec, LanguageTable};
use tracing::info;

use crate::error::JudgeError;

/// Immutable language table as seen by one task.
#[derive(Debug, Default)]
pub struct LanguageSnapshot {
    pub version: u64,
    pub table: LanguageTable,
}

impl LanguageSnapshot {
    pub fn get(&self, id: &str) -> Result<&LanguageSpec, JudgeError> {
        self.table.get(id).ok_or_else(|| {
            JudgeError::system_with("Unsupported language {0}", vec![id.to_string()])
        })
    }
}

/// Shared, atomically replaced language table. Tasks capture a snapshot
/// at dispatch time and keep it even if the table changes mid-task.
#[derive(Debug, Default)]
pub struct LanguageCatalog {
    current: RwLock<Arc<LanguageSnapshot>>,
}

impl LanguageCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn replace(&self, table: LanguageTable) {
        let mut current = self.current.write().unwrap_or_else(|e| e.into_inner());
        let version = current.version + 1;
        info!(version, languages = table.len(), "language table updated");
        *current = Arc::new(LanguageSnapshot { version, table });
    }

    pub fn snapshot(&self) -> Arc<LanguageSnapshot> {
        let current = self.current.read().unwrap_or_else(|e| e.into_inner());
        Arc::clone(&current)
    }
}
