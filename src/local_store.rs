use std::collections::HashMap;
use std::path::Path;

use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

use crate::error::StoreError;

/// Opaque local-store-assigned node id.
pub type LocalId = String;

/// Well-known root folder every store exposes. The mirror root defaults to
/// living directly under it.
pub const DEFAULT_PARENT_ID: &str = "toolbar";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocalFolder {
    pub id: LocalId,
    pub title: String,
    pub parent_id: Option<LocalId>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocalBookmark {
    pub id: LocalId,
    pub title: String,
    pub url: String,
    pub parent_id: Option<LocalId>,
}

#[derive(Debug, Clone)]
pub enum LocalNode {
    Folder(LocalFolder),
    Bookmark(LocalBookmark),
}

impl LocalNode {
    pub fn id(&self) -> &str {
        match self {
            LocalNode::Folder(f) => &f.id,
            LocalNode::Bookmark(b) => &b.id,
        }
    }

    pub fn title(&self) -> &str {
        match self {
            LocalNode::Folder(f) => &f.title,
            LocalNode::Bookmark(b) => &b.title,
        }
    }
}

/// Primitive verbs of the local bookmark tree. The reconciler is the only
/// writer under the mirror root; everything it does goes through this trait.
pub trait LocalStore: Send {
    /// Fallback parent used when the configured one no longer exists.
    fn default_parent(&self) -> LocalId;

    fn create_folder(&mut self, parent_id: &str, title: &str) -> Result<LocalId, StoreError>;
    fn create_bookmark(&mut self, parent_id: &str, title: &str, url: &str)
        -> Result<LocalId, StoreError>;

    /// Moves a folder or bookmark under a new parent. Rejects moves that
    /// would place a folder inside its own subtree.
    fn move_node(&mut self, id: &str, new_parent_id: &str) -> Result<(), StoreError>;

    fn rename(&mut self, id: &str, new_title: &str) -> Result<(), StoreError>;
    fn update_bookmark(&mut self, id: &str, title: &str, url: &str) -> Result<(), StoreError>;

    /// Removes a node; folders are removed recursively.
    fn remove(&mut self, id: &str) -> Result<(), StoreError>;

    fn get_folder(&self, id: &str) -> Option<LocalFolder>;
    fn get_bookmark(&self, id: &str) -> Option<LocalBookmark>;
    fn get_children(&self, id: &str) -> Result<Vec<LocalNode>, StoreError>;

    /// Preorder listing of every descendant of `id` (excluding `id` itself).
    fn get_subtree(&self, id: &str) -> Result<Vec<LocalNode>, StoreError> {
        let mut out = Vec::new();
        let mut queue = vec![id.to_string()];
        while let Some(current) = queue.pop() {
            for child in self.get_children(&current)? {
                if matches!(child, LocalNode::Folder(_)) {
                    queue.push(child.id().to_string());
                }
                out.push(child);
            }
        }
        Ok(out)
    }
}

#[derive(Debug, Clone)]
struct MemoryRec {
    title: String,
    url: Option<String>,
    parent_id: Option<String>,
    folder: bool,
    seq: u64,
}

/// In-memory bookmark tree. Used by tests and dry inspection; mirrors the
/// semantics of [`SqliteStore`] exactly.
#[derive(Debug, Default)]
pub struct MemoryStore {
    nodes: HashMap<String, MemoryRec>,
    next_seq: u64,
}

impl MemoryStore {
    pub fn new() -> Self {
        let mut store = Self::default();
        store.nodes.insert(
            DEFAULT_PARENT_ID.to_string(),
            MemoryRec {
                title: "Bookmarks Toolbar".to_string(),
                url: None,
                parent_id: None,
                folder: true,
                seq: 0,
            },
        );
        store.next_seq = 1;
        store
    }

    fn insert(&mut self, parent_id: &str, title: &str, url: Option<String>) -> Result<LocalId, StoreError> {
        match self.nodes.get(parent_id) {
            Some(rec) if rec.folder => {}
            Some(_) => return Err(StoreError::NotAFolder(parent_id.to_string())),
            None => return Err(StoreError::NotFound(parent_id.to_string())),
        }
        let id = Uuid::new_v4().to_string();
        let folder = url.is_none();
        self.nodes.insert(
            id.clone(),
            MemoryRec {
                title: title.to_string(),
                url,
                parent_id: Some(parent_id.to_string()),
                folder,
                seq: self.next_seq,
            },
        );
        self.next_seq += 1;
        Ok(id)
    }

    fn is_descendant(&self, candidate: &str, ancestor: &str) -> bool {
        let mut current = Some(candidate.to_string());
        while let Some(id) = current {
            if id == ancestor {
                return true;
            }
            current = self.nodes.get(&id).and_then(|r| r.parent_id.clone());
        }
        false
    }
}

impl LocalStore for MemoryStore {
    fn default_parent(&self) -> LocalId {
        DEFAULT_PARENT_ID.to_string()
    }

    fn create_folder(&mut self, parent_id: &str, title: &str) -> Result<LocalId, StoreError> {
        self.insert(parent_id, title, None)
    }

    fn create_bookmark(
        &mut self,
        parent_id: &str,
        title: &str,
        url: &str,
    ) -> Result<LocalId, StoreError> {
        self.insert(parent_id, title, Some(url.to_string()))
    }

    fn move_node(&mut self, id: &str, new_parent_id: &str) -> Result<(), StoreError> {
        if !self.nodes.contains_key(id) {
            return Err(StoreError::NotFound(id.to_string()));
        }
        match self.nodes.get(new_parent_id) {
            Some(rec) if rec.folder => {}
            Some(_) => return Err(StoreError::NotAFolder(new_parent_id.to_string())),
            None => return Err(StoreError::NotFound(new_parent_id.to_string())),
        }
        if self.is_descendant(new_parent_id, id) {
            return Err(StoreError::InvalidMove(format!(
                "{} is inside the subtree of {}",
                new_parent_id, id
            )));
        }
        let seq = self.next_seq;
        self.next_seq += 1;
        let rec = self.nodes.get_mut(id).unwrap();
        rec.parent_id = Some(new_parent_id.to_string());
        rec.seq = seq;
        Ok(())
    }

    fn rename(&mut self, id: &str, new_title: &str) -> Result<(), StoreError> {
        let rec = self
            .nodes
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        rec.title = new_title.to_string();
        Ok(())
    }

    fn update_bookmark(&mut self, id: &str, title: &str, url: &str) -> Result<(), StoreError> {
        let rec = self
            .nodes
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        if rec.folder {
            return Err(StoreError::NotAFolder(format!("{} is a folder", id)));
        }
        rec.title = title.to_string();
        rec.url = Some(url.to_string());
        Ok(())
    }

    fn remove(&mut self, id: &str) -> Result<(), StoreError> {
        if !self.nodes.contains_key(id) {
            return Err(StoreError::NotFound(id.to_string()));
        }
        if id == DEFAULT_PARENT_ID {
            return Err(StoreError::InvalidMove("cannot remove the store root".to_string()));
        }
        let doomed: Vec<String> = self
            .nodes
            .keys()
            .filter(|k| self.is_descendant(k, id))
            .cloned()
            .collect();
        for k in doomed {
            self.nodes.remove(&k);
        }
        Ok(())
    }

    fn get_folder(&self, id: &str) -> Option<LocalFolder> {
        self.nodes.get(id).filter(|r| r.folder).map(|r| LocalFolder {
            id: id.to_string(),
            title: r.title.clone(),
            parent_id: r.parent_id.clone(),
        })
    }

    fn get_bookmark(&self, id: &str) -> Option<LocalBookmark> {
        self.nodes
            .get(id)
            .filter(|r| !r.folder)
            .map(|r| LocalBookmark {
                id: id.to_string(),
                title: r.title.clone(),
                url: r.url.clone().unwrap_or_default(),
                parent_id: r.parent_id.clone(),
            })
    }

    fn get_children(&self, id: &str) -> Result<Vec<LocalNode>, StoreError> {
        if !self.nodes.contains_key(id) {
            return Err(StoreError::NotFound(id.to_string()));
        }
        let mut children: Vec<(&String, &MemoryRec)> = self
            .nodes
            .iter()
            .filter(|(_, r)| r.parent_id.as_deref() == Some(id))
            .collect();
        children.sort_by_key(|(_, r)| r.seq);
        Ok(children
            .into_iter()
            .map(|(cid, r)| {
                if r.folder {
                    LocalNode::Folder(LocalFolder {
                        id: cid.clone(),
                        title: r.title.clone(),
                        parent_id: r.parent_id.clone(),
                    })
                } else {
                    LocalNode::Bookmark(LocalBookmark {
                        id: cid.clone(),
                        title: r.title.clone(),
                        url: r.url.clone().unwrap_or_default(),
                        parent_id: r.parent_id.clone(),
                    })
                }
            })
            .collect())
    }
}

/// SQLite-backed local bookmark tree. One `nodes` table, folders and
/// bookmarks distinguished by `is_folder`, sibling order by `seq`.
pub struct SqliteStore {
    conn: Connection,
}

impl SqliteStore {
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    StoreError::NotFound(format!("cannot create {}: {}", parent.display(), e))
                })?;
            }
        }
        let conn = Connection::open(path)?;
        Self::init(conn)
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, StoreError> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS nodes (
                id        TEXT PRIMARY KEY,
                parent_id TEXT,
                title     TEXT NOT NULL,
                url       TEXT,
                is_folder INTEGER NOT NULL,
                seq       INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_nodes_parent ON nodes(parent_id);",
        )?;
        conn.execute(
            "INSERT OR IGNORE INTO nodes (id, parent_id, title, url, is_folder, seq)
             VALUES (?1, NULL, 'Bookmarks Toolbar', NULL, 1, 0)",
            params![DEFAULT_PARENT_ID],
        )?;
        debug!("Local bookmark store opened");
        Ok(Self { conn })
    }

    fn next_seq(&self) -> Result<i64, StoreError> {
        let seq: i64 = self
            .conn
            .query_row("SELECT COALESCE(MAX(seq), 0) + 1 FROM nodes", [], |row| row.get(0))?;
        Ok(seq)
    }

    fn require_folder(&self, id: &str) -> Result<(), StoreError> {
        let is_folder: Option<bool> = self
            .conn
            .query_row("SELECT is_folder FROM nodes WHERE id = ?1", params![id], |row| {
                row.get(0)
            })
            .optional()?;
        match is_folder {
            Some(true) => Ok(()),
            Some(false) => Err(StoreError::NotAFolder(id.to_string())),
            None => Err(StoreError::NotFound(id.to_string())),
        }
    }

    fn parent_of(&self, id: &str) -> Result<Option<String>, StoreError> {
        let parent: Option<Option<String>> = self
            .conn
            .query_row("SELECT parent_id FROM nodes WHERE id = ?1", params![id], |row| {
                row.get(0)
            })
            .optional()?;
        parent.ok_or_else(|| StoreError::NotFound(id.to_string()))
    }

    fn is_descendant(&self, candidate: &str, ancestor: &str) -> Result<bool, StoreError> {
        let mut current = Some(candidate.to_string());
        while let Some(id) = current {
            if id == ancestor {
                return Ok(true);
            }
            current = self.parent_of(&id)?;
        }
        Ok(false)
    }

    fn row_to_node(row: &rusqlite::Row<'_>) -> rusqlite::Result<LocalNode> {
        let id: String = row.get(0)?;
        let parent_id: Option<String> = row.get(1)?;
        let title: String = row.get(2)?;
        let url: Option<String> = row.get(3)?;
        let is_folder: bool = row.get(4)?;
        Ok(if is_folder {
            LocalNode::Folder(LocalFolder { id, title, parent_id })
        } else {
            LocalNode::Bookmark(LocalBookmark {
                id,
                title,
                url: url.unwrap_or_default(),
                parent_id,
            })
        })
    }
}

impl LocalStore for SqliteStore {
    fn default_parent(&self) -> LocalId {
        DEFAULT_PARENT_ID.to_string()
    }

    fn create_folder(&mut self, parent_id: &str, title: &str) -> Result<LocalId, StoreError> {
        self.require_folder(parent_id)?;
        let id = Uuid::new_v4().to_string();
        let seq = self.next_seq()?;
        self.conn.execute(
            "INSERT INTO nodes (id, parent_id, title, url, is_folder, seq)
             VALUES (?1, ?2, ?3, NULL, 1, ?4)",
            params![id, parent_id, title, seq],
        )?;
        Ok(id)
    }

    fn create_bookmark(
        &mut self,
        parent_id: &str,
        title: &str,
        url: &str,
    ) -> Result<LocalId, StoreError> {
        self.require_folder(parent_id)?;
        let id = Uuid::new_v4().to_string();
        let seq = self.next_seq()?;
        self.conn.execute(
            "INSERT INTO nodes (id, parent_id, title, url, is_folder, seq)
             VALUES (?1, ?2, ?3, ?4, 0, ?5)",
            params![id, parent_id, title, url, seq],
        )?;
        Ok(id)
    }

    fn move_node(&mut self, id: &str, new_parent_id: &str) -> Result<(), StoreError> {
        self.parent_of(id)?;
        self.require_folder(new_parent_id)?;
        if self.is_descendant(new_parent_id, id)? {
            return Err(StoreError::InvalidMove(format!(
                "{} is inside the subtree of {}",
                new_parent_id, id
            )));
        }
        let seq = self.next_seq()?;
        self.conn.execute(
            "UPDATE nodes SET parent_id = ?1, seq = ?2 WHERE id = ?3",
            params![new_parent_id, seq, id],
        )?;
        Ok(())
    }

    fn rename(&mut self, id: &str, new_title: &str) -> Result<(), StoreError> {
        let changed = self.conn.execute(
            "UPDATE nodes SET title = ?1 WHERE id = ?2",
            params![new_title, id],
        )?;
        if changed == 0 {
            return Err(StoreError::NotFound(id.to_string()));
        }
        Ok(())
    }

    fn update_bookmark(&mut self, id: &str, title: &str, url: &str) -> Result<(), StoreError> {
        let changed = self.conn.execute(
            "UPDATE nodes SET title = ?1, url = ?2 WHERE id = ?3 AND is_folder = 0",
            params![title, url, id],
        )?;
        if changed == 0 {
            return Err(StoreError::NotFound(id.to_string()));
        }
        Ok(())
    }

    fn remove(&mut self, id: &str) -> Result<(), StoreError> {
        if id == DEFAULT_PARENT_ID {
            return Err(StoreError::InvalidMove("cannot remove the store root".to_string()));
        }
        self.parent_of(id)?;
        self.conn.execute(
            "WITH RECURSIVE subtree(id) AS (
                 SELECT id FROM nodes WHERE id = ?1
                 UNION ALL
                 SELECT n.id FROM nodes n JOIN subtree s ON n.parent_id = s.id
             )
             DELETE FROM nodes WHERE id IN (SELECT id FROM subtree)",
            params![id],
        )?;
        Ok(())
    }

    fn get_folder(&self, id: &str) -> Option<LocalFolder> {
        self.conn
            .query_row(
                "SELECT id, parent_id, title, url, is_folder FROM nodes
                 WHERE id = ?1 AND is_folder = 1",
                params![id],
                Self::row_to_node,
            )
            .optional()
            .ok()
            .flatten()
            .and_then(|node| match node {
                LocalNode::Folder(f) => Some(f),
                _ => None,
            })
    }

    fn get_bookmark(&self, id: &str) -> Option<LocalBookmark> {
        self.conn
            .query_row(
                "SELECT id, parent_id, title, url, is_folder FROM nodes
                 WHERE id = ?1 AND is_folder = 0",
                params![id],
                Self::row_to_node,
            )
            .optional()
            .ok()
            .flatten()
            .and_then(|node| match node {
                LocalNode::Bookmark(b) => Some(b),
                _ => None,
            })
    }

    fn get_children(&self, id: &str) -> Result<Vec<LocalNode>, StoreError> {
        self.parent_of(id)?;
        let mut stmt = self.conn.prepare(
            "SELECT id, parent_id, title, url, is_folder FROM nodes
             WHERE parent_id = ?1 ORDER BY seq",
        )?;
        let rows = stmt.query_map(params![id], Self::row_to_node)?;
        let mut children = Vec::new();
        for row in rows {
            children.push(row?);
        }
        Ok(children)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stores() -> Vec<Box<dyn LocalStore>> {
        vec![
            Box::new(MemoryStore::new()),
            Box::new(SqliteStore::open_in_memory().unwrap()),
        ]
    }

    #[test]
    fn test_create_and_lookup() {
        for mut store in stores() {
            let root = store.default_parent();
            let folder = store.create_folder(&root, "Work").unwrap();
            let bookmark = store
                .create_bookmark(&folder, "Example", "https://example.com")
                .unwrap();

            let f = store.get_folder(&folder).unwrap();
            assert_eq!(f.title, "Work");
            assert_eq!(f.parent_id.as_deref(), Some(root.as_str()));

            let b = store.get_bookmark(&bookmark).unwrap();
            assert_eq!(b.url, "https://example.com");
            assert_eq!(b.parent_id.as_deref(), Some(folder.as_str()));

            // A bookmark is not a folder and vice versa
            assert!(store.get_folder(&bookmark).is_none());
            assert!(store.get_bookmark(&folder).is_none());
        }
    }

    #[test]
    fn test_recursive_remove() {
        for mut store in stores() {
            let root = store.default_parent();
            let a = store.create_folder(&root, "A").unwrap();
            let b = store.create_folder(&a, "B").unwrap();
            let x = store.create_bookmark(&b, "X", "http://x.com").unwrap();

            store.remove(&a).unwrap();
            assert!(store.get_folder(&a).is_none());
            assert!(store.get_folder(&b).is_none());
            assert!(store.get_bookmark(&x).is_none());
        }
    }

    #[test]
    fn test_move_rejects_own_subtree() {
        for mut store in stores() {
            let root = store.default_parent();
            let a = store.create_folder(&root, "A").unwrap();
            let b = store.create_folder(&a, "B").unwrap();

            let err = store.move_node(&a, &b).unwrap_err();
            assert!(matches!(err, StoreError::InvalidMove(_)));
        }
    }

    #[test]
    fn test_children_keep_insertion_order() {
        for mut store in stores() {
            let root = store.default_parent();
            let folder = store.create_folder(&root, "F").unwrap();
            store.create_bookmark(&folder, "first", "http://a.com").unwrap();
            store.create_bookmark(&folder, "second", "http://b.com").unwrap();
            store.create_bookmark(&folder, "third", "http://c.com").unwrap();

            let titles: Vec<String> = store
                .get_children(&folder)
                .unwrap()
                .iter()
                .map(|n| n.title().to_string())
                .collect();
            assert_eq!(titles, vec!["first", "second", "third"]);
        }
    }

    #[test]
    fn test_cannot_remove_store_root() {
        for mut store in stores() {
            let root = store.default_parent();
            assert!(store.remove(&root).is_err());
        }
    }

    #[test]
    fn test_sqlite_store_persists_across_open() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bookmarks.db");

        let folder = {
            let mut store = SqliteStore::open(&path).unwrap();
            let root = store.default_parent();
            store.create_folder(&root, "Persisted").unwrap()
        };

        let store = SqliteStore::open(&path).unwrap();
        assert_eq!(store.get_folder(&folder).unwrap().title, "Persisted");
    }

    #[test]
    fn test_get_subtree_lists_descendants() {
        for mut store in stores() {
            let root = store.default_parent();
            let a = store.create_folder(&root, "A").unwrap();
            let b = store.create_folder(&a, "B").unwrap();
            store.create_bookmark(&b, "X", "http://x.com").unwrap();

            let subtree = store.get_subtree(&a).unwrap();
            assert_eq!(subtree.len(), 2);
        }
    }
}
