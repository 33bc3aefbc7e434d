//! Persisted ingestion state
//!
//! The catalog, checkpoints and migration log are saved together as one
//! JSON document so a restart sees a consistent view of all three.

use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::checkpoint::CheckpointStore;
use crate::migration::MigrationRegistry;
use crate::schema::SchemaCatalog;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IngestState {
    #[serde(default)]
    pub catalog: SchemaCatalog,
    #[serde(default)]
    pub checkpoints: CheckpointStore,
    #[serde(default)]
    pub migrations: MigrationRegistry,
}

/// JSON state file, replaced atomically on save
#[derive(Debug, Clone)]
pub struct StateFile {
    path: PathBuf,
}

impl StateFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the state; a missing file is an empty state
    pub fn load(&self) -> anyhow::Result<IngestState> {
        if !self.path.exists() {
            info!(path = %self.path.display(), "No state file, starting empty");
            return Ok(IngestState::default());
        }
        let raw = std::fs::read_to_string(&self.path)
            .with_context(|| format!("Failed to read state file {}", self.path.display()))?;
        let state = serde_json::from_str(&raw)
            .with_context(|| format!("Failed to parse state file {}", self.path.display()))?;
        debug!(path = %self.path.display(), "Loaded state");
        Ok(state)
    }

    /// Write to a sibling temporary file, then rename over the target
    pub fn save(&self, state: &IngestState) -> anyhow::Result<()> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create state directory {}", parent.display()))?;
        }
        let mut tmp = self.path.clone().into_os_string();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);

        let json = serde_json::to_string_pretty(state).context("Failed to serialize state")?;
        std::fs::write(&tmp, json).with_context(|| format!("Failed to write {}", tmp.display()))?;
        std::fs::rename(&tmp, &self.path)
            .with_context(|| format!("Failed to replace state file {}", self.path.display()))?;
        debug!(path = %self.path.display(), "Saved state");
        Ok(())
    }
}
