//! `Location`, `EventType`, `Audit`, `ModificationEvent`, `OperationContext`
//! — the shared vocabulary between the Watcher, the Auditor, the
//! Coordinator and the Intervention broker.

use std::path::PathBuf;

use crate::client::RemoteEntry;
use crate::model::File;
use crate::types::{FileId, RelativeFilePath, Sha256};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Location {
    Local,
    Remote,
}

impl Location {
    pub fn opposite(self) -> Self {
        match self {
            Location::Local => Location::Remote,
            Location::Remote => Location::Local,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventType {
    Create,
    Delete,
    Move,
    Update,
}

pub const ALL_EVENT_TYPES: [EventType; 4] = [
    EventType::Create,
    EventType::Delete,
    EventType::Move,
    EventType::Update,
];

/// One of the three per-path views compared by the Auditor. `fobj` is
/// `None` for the sentinel null audit.
#[derive(Debug, Clone)]
pub struct Audit {
    pub fid: Option<FileId>,
    pub sha256: Option<Sha256>,
    pub fobj: FObj,
}

/// The concrete per-view representation behind an `Audit`: a filesystem
/// path, a DB File row, or a remote storage object.
#[derive(Debug, Clone)]
pub enum FObj {
    None,
    LocalPath(RelativeFilePath),
    Db(File),
    Remote(RemoteEntry),
}

impl Audit {
    pub fn null() -> Self {
        Self {
            fid: None,
            sha256: None,
            fobj: FObj::None,
        }
    }

    pub fn new(fid: Option<FileId>, sha256: Option<Sha256>, fobj: FObj) -> Self {
        Self { fid, sha256, fobj }
    }
}

/// `(local_path, db_file, remote_file)` — each component may be absent.
#[derive(Debug, Clone, Default)]
pub struct OperationContext {
    pub local: Option<PathBuf>,
    pub db: Option<File>,
    pub remote: Option<RemoteEntry>,
}

impl OperationContext {
    pub fn new(local: Option<PathBuf>, db: Option<File>, remote: Option<RemoteEntry>) -> Self {
        Self { local, db, remote }
    }
}

/// `(location, event_type, context, src_path, dest_path?)`. Equality/hashing
/// use `(event_type, src_path, is_directory)` so two events about the same
/// terminal path state collapse.
#[derive(Debug, Clone)]
pub struct ModificationEvent {
    pub location: Location,
    pub event_type: EventType,
    pub contexts: Vec<OperationContext>,
    pub src_path: RelativeFilePath,
    pub dest_path: Option<RelativeFilePath>,
    pub is_directory: bool,
}

impl ModificationEvent {
    pub fn new(
        location: Location,
        event_type: EventType,
        contexts: Vec<OperationContext>,
        src_path: RelativeFilePath,
        dest_path: Option<RelativeFilePath>,
    ) -> Self {
        let is_directory = src_path.ends_with(std::path::MAIN_SEPARATOR) || src_path.is_empty();
        Self {
            location,
            event_type,
            contexts,
            src_path,
            dest_path,
            is_directory,
        }
    }

    /// First (or only) context.
    pub fn context(&self) -> &OperationContext {
        &self.contexts[0]
    }

    pub fn key(&self) -> (EventType, &str, bool) {
        (self.event_type, self.src_path.as_str(), self.is_directory)
    }
}

impl PartialEq for ModificationEvent {
    fn eq(&self, other: &Self) -> bool {
        self.key() == other.key()
    }
}
impl Eq for ModificationEvent {}

impl std::hash::Hash for ModificationEvent {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.key().hash(state);
    }
}
