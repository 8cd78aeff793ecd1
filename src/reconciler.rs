use std::collections::{HashMap, HashSet, VecDeque};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use crate::error::{StoreError, SyncError};
use crate::local_store::{LocalId, LocalStore};
use crate::remote::{RemoteForest, RemoteItem, RemoteNode, UNSORTED_COLLECTION_ID};
use crate::state::MirrorState;

/// Per-run mutation counters. Ephemeral; returned to the caller and fed to
/// the notifier.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MirrorStats {
    pub folders_created: u32,
    pub folders_removed: u32,
    pub bookmarks_created: u32,
    pub bookmarks_updated: u32,
    pub bookmarks_moved: u32,
    pub bookmarks_deleted: u32,
}

impl MirrorStats {
    pub fn is_empty(&self) -> bool {
        *self == MirrorStats::default()
    }

    pub fn summary(&self) -> String {
        if self.is_empty() {
            return "no changes".to_string();
        }
        let mut parts = Vec::new();
        for (count, label) in [
            (self.folders_created, "folders created"),
            (self.folders_removed, "folders removed"),
            (self.bookmarks_created, "bookmarks created"),
            (self.bookmarks_updated, "bookmarks updated"),
            (self.bookmarks_moved, "bookmarks moved"),
            (self.bookmarks_deleted, "bookmarks deleted"),
        ] {
            if count > 0 {
                parts.push(format!("{} {}", count, label));
            }
        }
        parts.join(", ")
    }
}

/// Shared URL-normalization rule: scheme and host compared
/// case-insensitively, trailing slash and dangling `?` trimmed, everything
/// else byte-exact.
pub fn normalize_url(raw: &str) -> String {
    let trimmed = raw.trim();
    let mut normalized = match trimmed.split_once("://") {
        Some((scheme, rest)) => {
            let (host, tail) = match rest.find(['/', '?', '#']) {
                Some(idx) => (&rest[..idx], &rest[idx..]),
                None => (rest, ""),
            };
            format!(
                "{}://{}{}",
                scheme.to_ascii_lowercase(),
                host.to_ascii_lowercase(),
                tail
            )
        }
        None => trimmed.to_string(),
    };
    while normalized.ends_with('/') || normalized.ends_with('?') {
        normalized.pop();
    }
    normalized
}

fn dedup_key(url: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(normalize_url(url).as_bytes());
    format!("{:x}", hasher.finalize())
}

/// The diff-and-apply walk converging the local tree toward the fetched
/// remote snapshot.
///
/// Mutations are applied directly as the walk proceeds rather than buffered
/// into one batch, so an interrupted run leaves the tree consistent but
/// partial and the next pull picks up where this one stopped. Store errors
/// mid-walk are collected, not fatal; only a failed mirror-root resolution
/// aborts the run.
pub struct Reconciler<'a, S: LocalStore> {
    store: &'a mut S,
    state: &'a mut MirrorState,
    stats: MirrorStats,
    first_error: Option<StoreError>,
}

impl<'a, S: LocalStore> Reconciler<'a, S> {
    pub fn new(store: &'a mut S, state: &'a mut MirrorState) -> Self {
        Self {
            store,
            state,
            stats: MirrorStats::default(),
            first_error: None,
        }
    }

    pub fn reconcile(mut self, forest: &RemoteForest) -> Result<MirrorStats, SyncError> {
        let root = self.resolve_mirror_root().map_err(|source| SyncError::LocalStore {
            source,
            partial: self.stats,
        })?;

        let resolved = self.folder_pass(forest, &root);
        self.sweep_folders(forest);
        let surviving = self.item_pass(forest, &resolved);
        self.sweep_items(&surviving);

        match self.first_error.take() {
            Some(source) => Err(SyncError::LocalStore {
                source,
                partial: self.stats,
            }),
            None => Ok(self.stats),
        }
    }

    fn record_error(&mut self, context: &str, error: StoreError) {
        warn!("⚠️  {}: {}", context, error);
        self.first_error.get_or_insert(error);
    }

    /// Ensures the mirror-root folder exists under the configured parent,
    /// falling back to the store's default parent when the configured one
    /// vanished. The corrected setting is persisted with the rest of the
    /// state after the run.
    fn resolve_mirror_root(&mut self) -> Result<LocalId, StoreError> {
        let parent = if self
            .store
            .get_folder(&self.state.settings.parent_folder_id)
            .is_some()
        {
            self.state.settings.parent_folder_id.clone()
        } else {
            let fallback = self.store.default_parent();
            warn!(
                "⚠️  Configured parent folder {} no longer exists, falling back to {}",
                self.state.settings.parent_folder_id, fallback
            );
            self.state.settings.parent_folder_id = fallback.clone();
            fallback
        };

        let name = self.state.settings.root_folder_name.clone();
        if let Some(root_id) = self.state.identity.root_folder_id.clone() {
            if let Some(folder) = self.store.get_folder(&root_id) {
                if folder.parent_id.as_deref() != Some(parent.as_str()) {
                    self.store.move_node(&root_id, &parent)?;
                }
                if folder.title != name {
                    self.store.rename(&root_id, &name)?;
                }
                return Ok(root_id);
            }
        }

        let root_id = self.store.create_folder(&parent, &name)?;
        info!("📁 Created mirror root '{}' ({})", name, root_id);
        self.state.identity.root_folder_id = Some(root_id.clone());
        Ok(root_id)
    }

    /// Top-down, breadth-first folder pass: every collection gets exactly
    /// one local folder, created, moved or renamed as needed. Parents are
    /// always resolved before their children. Returns the remote-id ->
    /// local-id resolution for this run.
    fn folder_pass(&mut self, forest: &RemoteForest, root: &LocalId) -> HashMap<i64, LocalId> {
        let mut resolved = HashMap::new();
        let mut queue: VecDeque<i64> =
            forest.children_of(None).iter().map(|n| n.id).collect();

        while let Some(id) = queue.pop_front() {
            let node = &forest.nodes[&id];
            let parent_local = match node.parent_id {
                Some(p) if forest.nodes.contains_key(&p) => match resolved.get(&p) {
                    Some(local) => local,
                    // Parent folder failed to materialize; skip the subtree,
                    // the next pull retries it.
                    None => continue,
                },
                _ => root,
            }
            .clone();

            if let Some(local) = self.ensure_folder(node, &parent_local) {
                resolved.insert(id, local);
                for child in forest.children_of(Some(id)) {
                    queue.push_back(child.id);
                }
            }
        }
        resolved
    }

    fn ensure_folder(&mut self, node: &RemoteNode, parent_local: &str) -> Option<LocalId> {
        if let Some(local) = self.state.identity.collection(node.id).cloned() {
            if let Some(folder) = self.store.get_folder(&local) {
                if folder.parent_id.as_deref() != Some(parent_local) {
                    // Folder moves share no dedicated counter; only
                    // created/removed are tracked for folders.
                    if let Err(e) = self.store.move_node(&local, parent_local) {
                        self.record_error("Failed to move folder", e);
                    }
                }
                if folder.title != node.title {
                    match self.store.rename(&local, &node.title) {
                        Ok(()) => debug!("Renamed folder {} -> '{}'", local, node.title),
                        Err(e) => self.record_error("Failed to rename folder", e),
                    }
                }
                return Some(local);
            }
            // Mapping points at a folder that no longer exists; heal by
            // recreating it.
            self.state.identity.collections.remove(&node.id);
        }

        match self.store.create_folder(parent_local, &node.title) {
            Ok(local) => {
                debug!("Created folder '{}' for collection {}", node.title, node.id);
                self.state.identity.collections.insert(node.id, local.clone());
                if node.id == UNSORTED_COLLECTION_ID {
                    self.state.identity.unsorted_folder_id = Some(local.clone());
                }
                self.stats.folders_created += 1;
                Some(local)
            }
            Err(e) => {
                self.record_error("Failed to create folder", e);
                None
            }
        }
    }

    /// Removes local folders whose collection vanished from the fetch.
    /// Every stale mapping counts, descendants included; only subtree tops
    /// need an actual store removal.
    fn sweep_folders(&mut self, forest: &RemoteForest) {
        let stale: Vec<i64> = self
            .state
            .identity
            .collections
            .keys()
            .filter(|id| !forest.nodes.contains_key(*id))
            .copied()
            .collect();
        if stale.is_empty() {
            return;
        }

        let stale_locals: HashSet<LocalId> = stale
            .iter()
            .filter_map(|id| self.state.identity.collection(*id).cloned())
            .collect();

        for id in stale {
            let Some(local) = self.state.identity.collections.remove(&id) else {
                continue;
            };
            if self.store.get_folder(&local).is_some()
                && !self.has_stale_ancestor(&local, &stale_locals)
            {
                match self.store.remove(&local) {
                    Ok(()) => debug!("Removed folder {} (collection {} gone)", local, id),
                    Err(e) => self.record_error("Failed to remove folder", e),
                }
            }
            if self.state.identity.unsorted_folder_id.as_deref() == Some(local.as_str()) {
                self.state.identity.unsorted_folder_id = None;
            }
            self.stats.folders_removed += 1;
        }
    }

    fn has_stale_ancestor(&self, local: &str, stale_locals: &HashSet<LocalId>) -> bool {
        let mut current = self
            .store
            .get_folder(local)
            .and_then(|f| f.parent_id);
        while let Some(id) = current {
            if stale_locals.contains(&id) {
                return true;
            }
            current = self.store.get_folder(&id).and_then(|f| f.parent_id);
        }
        false
    }

    /// Per-folder item pass. Items are deduplicated by normalized URL
    /// before diffing, so one collection never yields two bookmarks with
    /// the same normalized URL. Returns the ids of every item present in
    /// the fetch after dedup; anything mapped but absent from this set is
    /// swept afterwards.
    fn item_pass(
        &mut self,
        forest: &RemoteForest,
        resolved: &HashMap<i64, LocalId>,
    ) -> HashSet<i64> {
        let mut surviving = HashSet::new();
        let mut collection_ids: Vec<i64> = forest.nodes.keys().copied().collect();
        collection_ids.sort_unstable();

        for collection_id in collection_ids {
            let Some(items) = forest.items.get(&collection_id) else {
                continue;
            };

            let mut seen = HashSet::new();
            let deduped: Vec<&RemoteItem> = items
                .iter()
                .filter(|item| {
                    if seen.insert(dedup_key(&item.url)) {
                        true
                    } else {
                        debug!(
                            "Skipping duplicate URL in collection {}: {}",
                            collection_id, item.url
                        );
                        false
                    }
                })
                .collect();
            surviving.extend(deduped.iter().map(|i| i.id));

            // Items of a folder that failed to resolve keep their mappings;
            // the next pull reconciles them.
            if let Some(folder_local) = resolved.get(&collection_id) {
                let folder_local = folder_local.clone();
                for item in deduped {
                    self.ensure_bookmark(item, &folder_local);
                }
            }
        }
        surviving
    }

    fn ensure_bookmark(&mut self, item: &RemoteItem, folder_local: &str) {
        if let Some(local) = self.state.identity.item(item.id).cloned() {
            if let Some(bookmark) = self.store.get_bookmark(&local) {
                let moved = bookmark.parent_id.as_deref() != Some(folder_local);
                let changed = bookmark.title != item.title || bookmark.url != item.url;

                if moved {
                    match self.store.move_node(&local, folder_local) {
                        Ok(()) => {
                            if changed {
                                if let Err(e) =
                                    self.store.update_bookmark(&local, &item.title, &item.url)
                                {
                                    self.record_error("Failed to update moved bookmark", e);
                                }
                            }
                            self.stats.bookmarks_moved += 1;
                        }
                        Err(e) => self.record_error("Failed to move bookmark", e),
                    }
                } else if changed {
                    match self.store.update_bookmark(&local, &item.title, &item.url) {
                        Ok(()) => self.stats.bookmarks_updated += 1,
                        Err(e) => self.record_error("Failed to update bookmark", e),
                    }
                }
                return;
            }
            // Stale mapping; recreate below.
            self.state.identity.items.remove(&item.id);
        }

        match self
            .store
            .create_bookmark(folder_local, &item.title, &item.url)
        {
            Ok(local) => {
                self.state.identity.items.insert(item.id, local);
                self.stats.bookmarks_created += 1;
            }
            Err(e) => self.record_error("Failed to create bookmark", e),
        }
    }

    /// Deletes bookmarks whose remote item is gone. Bookmarks that already
    /// vanished with a removed folder subtree still count as deleted.
    fn sweep_items(&mut self, surviving: &HashSet<i64>) {
        let stale: Vec<i64> = self
            .state
            .identity
            .items
            .keys()
            .filter(|id| !surviving.contains(*id))
            .copied()
            .collect();

        for id in stale {
            let Some(local) = self.state.identity.items.remove(&id) else {
                continue;
            };
            if self.store.get_bookmark(&local).is_some() {
                if let Err(e) = self.store.remove(&local) {
                    self.record_error("Failed to remove bookmark", e);
                }
            }
            self.stats.bookmarks_deleted += 1;
        }
    }
}
