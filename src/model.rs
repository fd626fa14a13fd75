//! `Node` and `File` domain rows. These are the durable-database view of
//! the world; `DatabaseOperation` (see `database.rs`) is the only thing
//! allowed to write them.

use std::path::{Path, PathBuf};

use crate::types::{FileId, NodeId, RelativeFilePath, Sha256};

/// A remote project selected for sync.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Node {
    pub id: NodeId,
    pub title: String,
    pub parent_id: Option<NodeId>,
    pub sync: bool,
    /// Filesystem path relative to the user folder, computed from the
    /// project hierarchy (`<ancestor titles>/.../<title>`).
    pub rel_path: RelativeFilePath,
}

/// A file or folder belonging to a Node's storage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct File {
    pub id: FileId,
    pub name: String,
    pub is_folder: bool,
    /// Storage provider name; always `osfstorage` in this spec.
    pub provider: String,
    pub parent: Option<FileId>,
    /// `None` for folders, `Some` for files.
    pub sha256: Option<Sha256>,
    pub node_id: NodeId,
    /// Local name used when `name` is illegal on the local filesystem.
    pub alias: Option<String>,
    /// Path (relative to the user folder) at which this entry lives in the
    /// database's own bookkeeping, independent of `name`/`alias` — used to
    /// reconstruct `rel_path`/`rel_path_unaliased` without re-walking the
    /// Node hierarchy for every row.
    pub parent_rel_path: RelativeFilePath,
}

impl File {
    /// `sha256` must be `Some` for files and `None` for folders.
    pub fn is_consistent(&self) -> bool {
        self.is_folder == self.sha256.is_none()
    }

    /// Path using the alias where present (what's actually on the local
    /// filesystem).
    pub fn rel_path(&self) -> RelativeFilePath {
        let effective_name = self.alias.as_deref().unwrap_or(&self.name);
        self.join_name(effective_name)
    }

    /// Path using the real (remote) name, ignoring any local alias.
    pub fn rel_path_unaliased(&self) -> RelativeFilePath {
        self.join_name(&self.name)
    }

    fn join_name(&self, name: &str) -> RelativeFilePath {
        let mut path = PathBuf::from(&self.parent_rel_path);
        path.push(name);
        let mut s = path.to_string_lossy().into_owned();
        if self.is_folder && !s.ends_with(std::path::MAIN_SEPARATOR) {
            s.push(std::path::MAIN_SEPARATOR);
        }
        s
    }
}

/// Computes a Node's `rel_path` from its ancestor chain of titles, joining
/// sanitized titles into nested project folder names.
pub fn node_rel_path(ancestors_then_self_titles: &[&str]) -> RelativeFilePath {
    let mut path = PathBuf::new();
    for title in ancestors_then_self_titles {
        path.push(sanitize_title(title));
    }
    path.to_string_lossy().into_owned()
}

fn sanitize_title(title: &str) -> String {
    title.replace(std::path::MAIN_SEPARATOR, "_")
}

pub fn storage_root(node: &Node, storage_folder: &str) -> RelativeFilePath {
    Path::new(&node.rel_path)
        .join(storage_folder)
        .to_string_lossy()
        .into_owned()
}
