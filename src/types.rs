//! Opaque identifiers and path aliases shared across the reconciliation
//! core's Node/File identity model.

use std::fmt;

pub type AbsoluteFilePath = String;
pub type RelativeFilePath = String;
pub type RevisionId = String;
pub type Sha256 = String;

/// Remote node (project) identifier. Opaque string.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize)]
pub struct NodeId(pub String);

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Remote file/folder identifier, stable across renames and moves.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize)]
pub struct FileId(pub String);

impl fmt::Display for FileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Whether a `File` row is a plain file or a folder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentKind {
    File,
    Folder,
}

impl ContentKind {
    pub fn is_folder(self) -> bool {
        matches!(self, ContentKind::Folder)
    }
}
