use anyhow::{bail, Result};
use std::path::Path;
use tracing::info;

use crate::local_store::LocalStore;
use crate::state::MirrorState;

/// Moves the mirror root under a new parent folder, immediately and outside
/// of any pull. Idempotent: the current parent is a no-op.
pub fn apply_parent_folder_change<S: LocalStore>(
    store: &mut S,
    state: &mut MirrorState,
    state_path: &Path,
    new_parent_id: &str,
) -> Result<()> {
    if state.settings.parent_folder_id == new_parent_id {
        info!("Parent folder already set to {}, nothing to do", new_parent_id);
        return Ok(());
    }
    if store.get_folder(new_parent_id).is_none() {
        bail!("Folder {} does not exist in the local store", new_parent_id);
    }

    if let Some(root_id) = state.identity.root_folder_id.clone() {
        if store.get_folder(&root_id).is_some() {
            store.move_node(&root_id, new_parent_id)?;
            info!("📁 Moved mirror root under {}", new_parent_id);
        }
    }

    state.settings.parent_folder_id = new_parent_id.to_string();
    state.save(state_path)?;
    Ok(())
}

/// Renames the mirror root folder, immediately and outside of any pull.
/// Idempotent: the current name is a no-op.
pub fn apply_root_folder_rename<S: LocalStore>(
    store: &mut S,
    state: &mut MirrorState,
    state_path: &Path,
    new_name: &str,
) -> Result<()> {
    if state.settings.root_folder_name == new_name {
        info!("Mirror root already named '{}', nothing to do", new_name);
        return Ok(());
    }

    if let Some(root_id) = state.identity.root_folder_id.clone() {
        if store.get_folder(&root_id).is_some() {
            store.rename(&root_id, new_name)?;
            info!("📁 Renamed mirror root to '{}'", new_name);
        }
    }

    state.settings.root_folder_name = new_name.to_string();
    state.save(state_path)?;
    Ok(())
}
