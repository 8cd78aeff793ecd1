use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::Path;

use crate::local_store::{LocalId, DEFAULT_PARENT_ID};

/// Persistent bidirectional correspondence between remote ids and local
/// node ids. This is what lets a pull detect renames and moves instead of
/// rebuilding the whole tree every time.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IdentityMap {
    /// remote collection id -> local folder id
    pub collections: HashMap<i64, LocalId>,
    /// remote item id -> local bookmark id
    pub items: HashMap<i64, LocalId>,
    pub root_folder_id: Option<LocalId>,
    pub unsorted_folder_id: Option<LocalId>,
}

impl IdentityMap {
    pub fn collection(&self, remote_id: i64) -> Option<&LocalId> {
        self.collections.get(&remote_id)
    }

    pub fn item(&self, remote_id: i64) -> Option<&LocalId> {
        self.items.get(&remote_id)
    }

    /// Drops everything, including the well-known root/unsorted slots.
    /// Used by "Reset & Re-pull".
    pub fn clear(&mut self) {
        self.collections.clear();
        self.items.clear();
        self.root_folder_id = None;
        self.unsorted_folder_id = None;
    }

    pub fn is_empty(&self) -> bool {
        self.collections.is_empty() && self.items.is_empty() && self.root_folder_id.is_none()
    }
}

/// Where the mirror root lives and what it is called.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RootFolderSettings {
    pub parent_folder_id: LocalId,
    pub root_folder_name: String,
}

impl Default for RootFolderSettings {
    fn default() -> Self {
        Self {
            parent_folder_id: DEFAULT_PARENT_ID.to_string(),
            root_folder_name: "Cloud Bookmarks".to_string(),
        }
    }
}

/// The whole persisted engine state, one JSON document on disk.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MirrorState {
    pub identity: IdentityMap,
    pub settings: RootFolderSettings,
    pub last_pulled_at: Option<DateTime<Utc>>,
}

impl MirrorState {
    /// Load state from file. A missing file means a first run.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read state file {}", path.display()))?;
        let state: MirrorState = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse state file {}", path.display()))?;
        Ok(state)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let content = serde_json::to_string_pretty(self)?;
        fs::write(path, content)
            .with_context(|| format!("Failed to write state file {}", path.display()))?;
        Ok(())
    }
}
