//! The Local Filesystem Watcher and its event consolidator, wired to raw
//! OS events via `notify::watcher`.
//!
//! A single dedicated thread owns the consolidation state and blocks on
//! `recv_timeout(debounce)`: every inbound raw event both mutates the
//! state and restarts the wait, and a timeout means "quiet for the
//! debounce period". Dispatch and flush are naturally mutually exclusive
//! since one thread does both, so there's no lock to share.

use std::path::{Path, PathBuf};
use std::sync::mpsc::{channel, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use notify::{watcher, DebouncedEvent, RecursiveMode, Watcher as NotifyWatcher};
use rusqlite::Connection;

use crate::database::DatabaseOperation;
use crate::error::Error;
use crate::event::{EventType, Location, ModificationEvent, OperationContext};
use crate::util;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RawKind {
    Created,
    Modified,
    Deleted,
    Moved,
}

/// A raw filesystem event, augmented with the `(basename, sha256)` pair
/// the merge rules need.
#[derive(Debug, Clone)]
pub struct RawEvent {
    pub kind: RawKind,
    pub src_path: String,
    pub dest_path: Option<String>,
    pub is_directory: bool,
    pub basename: String,
    pub sha256: Option<String>,
}

impl RawEvent {
    fn created(src_path: String, is_directory: bool) -> Self {
        Self {
            kind: RawKind::Created,
            basename: util::string_path_file_name(&src_path).unwrap_or_default(),
            src_path,
            dest_path: None,
            is_directory,
            sha256: None,
        }
    }

    fn modified(src_path: String, is_directory: bool) -> Self {
        Self {
            kind: RawKind::Modified,
            basename: util::string_path_file_name(&src_path).unwrap_or_default(),
            src_path,
            dest_path: None,
            is_directory,
            sha256: None,
        }
    }

    fn deleted(src_path: String, is_directory: bool) -> Self {
        Self {
            kind: RawKind::Deleted,
            basename: util::string_path_file_name(&src_path).unwrap_or_default(),
            src_path,
            dest_path: None,
            is_directory,
            sha256: None,
        }
    }

    fn moved(src_path: String, dest_path: String, is_directory: bool) -> Self {
        Self {
            kind: RawKind::Moved,
            basename: util::string_path_file_name(&dest_path).unwrap_or_default(),
            src_path,
            dest_path: Some(dest_path),
            is_directory,
            sha256: None,
        }
    }
}

/// A single ordered map keyed by full path: consolidation rules only need
/// linear scans and exact-key lookup, so there's no need for a tree.
#[derive(Default)]
struct TreeDict {
    entries: Vec<(String, RawEvent)>,
}

impl TreeDict {
    fn get(&self, key: &str) -> Option<&RawEvent> {
        self.entries.iter().find(|(k, _)| k == key).map(|(_, v)| v)
    }

    fn contains(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    /// `OrderedDict.__setitem__`: updates in place if the key already
    /// exists, otherwise appends.
    fn set(&mut self, key: String, value: RawEvent) {
        if let Some(slot) = self.entries.iter_mut().find(|(k, _)| *k == key) {
            slot.1 = value;
        } else {
            self.entries.push((key, value));
        }
    }

    fn remove(&mut self, key: &str) -> Option<RawEvent> {
        if let Some(idx) = self.entries.iter().position(|(k, _)| k == key) {
            Some(self.entries.remove(idx).1)
        } else {
            None
        }
    }

    fn find_key<F: Fn(&RawEvent) -> bool>(&self, pred: F) -> Option<String> {
        self.entries
            .iter()
            .find(|(_, v)| pred(v))
            .map(|(k, _)| k.clone())
    }

    fn values(&self) -> impl Iterator<Item = &RawEvent> {
        self.entries.iter().map(|(_, v)| v)
    }

    fn drain_in_order(&mut self) -> Vec<RawEvent> {
        std::mem::take(&mut self.entries)
            .into_iter()
            .map(|(_, v)| v)
            .collect()
    }
}

/// Owns the debounce state: the `TreeDict` plus the pending-create cache.
struct Consolidator {
    tree: TreeDict,
    create_cache: Vec<RawEvent>,
}

impl Consolidator {
    fn new() -> Self {
        Self {
            tree: TreeDict::default(),
            create_cache: Vec::new(),
        }
    }

    /// Applies the consolidation rules below to an already-augmented event.
    fn merge(&mut self, event: RawEvent) {
        match event.kind {
            RawKind::Modified => {
                // Rule 2: modified on a folder is discarded.
                if event.is_directory {
                    return;
                }
                // Rule 3: modified whose src matches a pending move's dest
                // is discarded (the move already captures the change).
                if self
                    .tree
                    .values()
                    .any(|e| e.kind == RawKind::Moved && e.dest_path.as_deref() == Some(event.src_path.as_str()))
                {
                    return;
                }
                self.store_or_upgrade(event);
            }
            RawKind::Deleted => {
                // Rule 4: delete matched by an earlier create of equal
                // basename and sha256 collapses into a Move.
                if let Some(create_key) = self.tree.find_key(|e| {
                    e.kind == RawKind::Created && e.basename == event.basename && e.sha256 == event.sha256
                }) {
                    let create = self.tree.remove(&create_key).expect("just found");
                    self.tree.set(
                        create_key,
                        RawEvent::moved(create.src_path, event.src_path, event.is_directory),
                    );
                    return;
                }
                // Rule 5: delete matched by an earlier Move whose dest
                // equals the delete's src_path, and that move's src is
                // still in the create cache, collapses create/move/delete
                // into a single Modify on the original create path, since
                // the net effect is one file changing in place.
                if let Some(move_key) = self
                    .tree
                    .find_key(|e| e.kind == RawKind::Moved && e.dest_path.as_deref() == Some(event.src_path.as_str()))
                {
                    let mv = self.tree.get(&move_key).cloned_event();
                    if let Some(create_idx) = self
                        .create_cache
                        .iter()
                        .position(|c| c.src_path == mv.src_path)
                    {
                        self.tree.remove(&move_key);
                        self.create_cache.remove(create_idx);
                        self.tree
                            .set(mv.src_path.clone(), RawEvent::modified(mv.src_path, mv.is_directory));
                        return;
                    }
                }
                self.store_or_upgrade(event);
            }
            RawKind::Created => {
                // Rule 6: create lands where the TreeDict already holds a
                // Delete at the same path: rewrite to Modify.
                if let Some(existing) = self.tree.get(&event.src_path) {
                    if existing.kind == RawKind::Deleted {
                        self.tree.set(
                            event.src_path.clone(),
                            RawEvent::modified(event.src_path, event.is_directory),
                        );
                        return;
                    }
                }
                // Rule 7: create matched by an earlier delete of equal
                // basename and sha256 collapses into a Move.
                if let Some(delete_key) = self.tree.find_key(|e| {
                    e.kind == RawKind::Deleted && e.basename == event.basename && e.sha256 == event.sha256
                }) {
                    let delete_evt = self.tree.remove(&delete_key).expect("just found");
                    self.tree.set(
                        delete_key,
                        RawEvent::moved(delete_evt.src_path, event.src_path, event.is_directory),
                    );
                    return;
                }
                // Rule 8: otherwise append to the create cache, unless a
                // pending move's dest is a prefix of this create's src
                // (child of a renamed folder).
                if self
                    .tree
                    .values()
                    .any(|e| e.kind == RawKind::Moved && event.src_path.starts_with(e.dest_path.as_deref().unwrap_or("\0")))
                {
                    return;
                }
                self.push_create(event);
            }
            RawKind::Moved => {
                self.store_or_upgrade(event);
            }
        }
    }

    /// Rules 9/10: an event landing on a slot whose current content is a
    /// Delete gets rewritten to Modify (non-directory only); otherwise it's
    /// stored as-is.
    fn store_or_upgrade(&mut self, event: RawEvent) {
        let key = event.src_path.clone();
        if let Some(existing) = self.tree.get(&key) {
            if existing.kind == RawKind::Deleted && !event.is_directory {
                self.tree
                    .set(key, RawEvent::modified(event.src_path, event.is_directory));
                return;
            }
        }
        self.tree.set(key, event);
    }

    /// Dedupes the create cache by `(src_path, is_directory)` on insertion,
    /// since a duplicate create in the same debounce window would otherwise
    /// surface twice.
    fn push_create(&mut self, event: RawEvent) {
        let already_present = self
            .create_cache
            .iter()
            .any(|c| c.src_path == event.src_path && c.is_directory == event.is_directory);
        if !already_present {
            self.create_cache.push(event);
        }
    }

    /// Emits the TreeDict in insertion order, then the create cache sorted
    /// by ascending parent count so parents precede children.
    fn flush(&mut self) -> Vec<RawEvent> {
        let mut out = self.tree.drain_in_order();
        let mut creates = std::mem::take(&mut self.create_cache);
        creates.sort_by_key(|e| util::parent_count(&e.src_path));
        out.extend(creates);
        out
    }
}

trait ClonedEvent {
    fn cloned_event(self) -> RawEvent;
}
impl ClonedEvent for Option<&RawEvent> {
    fn cloned_event(self) -> RawEvent {
        self.expect("just found").clone()
    }
}

/// Intake half: subscribes to OS filesystem events under the user folder
/// and feeds them to the consolidation thread.
pub struct LocalWatcher {
    workspace_folder_path: PathBuf,
    raw_sender: Sender<RawEvent>,
}

impl LocalWatcher {
    pub fn new(workspace_folder_path: PathBuf, raw_sender: Sender<RawEvent>) -> Result<Self, Error> {
        Ok(Self {
            workspace_folder_path: std::fs::canonicalize(&workspace_folder_path)?,
            raw_sender,
        })
    }

    /// Blocks forever, dispatching OS events. Intended to run on its own
    /// thread.
    pub fn listen(&self) -> Result<(), Error> {
        let (inotify_sender, inotify_receiver) = channel();
        let mut inotify_watcher = watcher(inotify_sender, Duration::from_secs(1))?;
        inotify_watcher.watch(&self.workspace_folder_path, RecursiveMode::Recursive)?;

        loop {
            match inotify_receiver.recv() {
                Ok(event) => {
                    if let Err(error) = self.digest_event(&event) {
                        log::error!("Error when digesting event {:?} : {:?}", &event, error);
                    }
                }
                Err(e) => {
                    log::error!("Watch error: {:?}", e);
                    return Ok(());
                }
            }
        }
    }

    fn digest_event(&self, event: &DebouncedEvent) -> Result<(), Error> {
        log::debug!("Local raw event: {:?}", event);

        let raw = match event {
            DebouncedEvent::Create(absolute_path) => Some(RawEvent::created(
                util::path_to_string(absolute_path.strip_prefix(&self.workspace_folder_path)?)?,
                absolute_path.is_dir(),
            )),
            DebouncedEvent::Write(absolute_path) => Some(RawEvent::modified(
                util::path_to_string(absolute_path.strip_prefix(&self.workspace_folder_path)?)?,
                absolute_path.is_dir(),
            )),
            DebouncedEvent::Remove(absolute_path) => Some(RawEvent::deleted(
                util::path_to_string(absolute_path.strip_prefix(&self.workspace_folder_path)?)?,
                false,
            )),
            DebouncedEvent::Rename(src, dest) => Some(RawEvent::moved(
                util::path_to_string(src.strip_prefix(&self.workspace_folder_path)?)?,
                util::path_to_string(dest.strip_prefix(&self.workspace_folder_path)?)?,
                dest.is_dir(),
            )),
            DebouncedEvent::NoticeWrite(_)
            | DebouncedEvent::NoticeRemove(_)
            | DebouncedEvent::Chmod(_)
            | DebouncedEvent::Rescan => None,
            DebouncedEvent::Error(err, path) => {
                log::error!("Error {:?} on {:?}", err, path);
                None
            }
        };

        if let Some(raw) = raw {
            if self.raw_sender.send(raw).is_err() {
                log::error!("Consolidation thread is gone, dropping local event");
            }
        }

        Ok(())
    }
}

/// Runs the consolidation loop on the calling thread: drain augment +
/// merge on every raw event; emit a flush whenever `debounce` elapses with
/// no further input.
pub fn run_consolidation(
    raw_receiver: Receiver<RawEvent>,
    conn: Arc<Mutex<Connection>>,
    user_folder: PathBuf,
    ignored_names: Vec<String>,
    ignored_patterns: globset::GlobSet,
    debounce: Duration,
    out: Sender<ModificationEvent>,
) {
    let mut consolidator = Consolidator::new();
    loop {
        match raw_receiver.recv_timeout(debounce) {
            Ok(event) => {
                if is_ignored(&event.basename, &ignored_names, &ignored_patterns) {
                    continue;
                }
                let event = augment(event, &conn, &user_folder);
                consolidator.merge(event);
            }
            Err(RecvTimeoutError::Timeout) => {
                let flushed = consolidator.flush();
                for raw in flushed {
                    let me = to_modification_event(raw, &conn, &user_folder);
                    if out.send(me).is_err() {
                        return;
                    }
                }
            }
            Err(RecvTimeoutError::Disconnected) => return,
        }
    }
}

/// Whether a raw event's basename matches the configured ignored names or
/// ignore glob patterns, and should never reach the consolidator.
fn is_ignored(basename: &str, ignored_names: &[String], ignored_patterns: &globset::GlobSet) -> bool {
    ignored_names.iter().any(|n| n == basename) || ignored_patterns.is_match(basename)
}

/// Augments an event with basename (already set) and sha256 — for
/// delete events, derived from the DB row at `src_path`; for create
/// events, by hashing the file on disk; otherwise left as computed.
fn augment(mut event: RawEvent, conn: &Arc<Mutex<Connection>>, user_folder: &Path) -> RawEvent {
    event.sha256 = match event.kind {
        RawKind::Deleted => {
            let guard = conn.lock().expect("db connection poisoned");
            DatabaseOperation::new(&guard)
                .all_files()
                .ok()
                .and_then(|files| {
                    files
                        .into_iter()
                        .find(|f| f.rel_path() == event.src_path || f.rel_path_unaliased() == event.src_path)
                        .and_then(|f| f.sha256)
                })
        }
        RawKind::Created if !event.is_directory => {
            util::hash_file(&user_folder.join(&event.src_path))
        }
        _ => None,
    };
    event
}

fn to_modification_event(
    raw: RawEvent,
    conn: &Arc<Mutex<Connection>>,
    user_folder: &Path,
) -> ModificationEvent {
    let event_type = match raw.kind {
        RawKind::Created => EventType::Create,
        RawKind::Modified => EventType::Update,
        RawKind::Deleted => EventType::Delete,
        RawKind::Moved => EventType::Move,
    };

    let build_context = |path: &str| -> OperationContext {
        let db_file = {
            let guard = conn.lock().expect("db connection poisoned");
            DatabaseOperation::new(&guard)
                .all_files()
                .ok()
                .and_then(|files| {
                    files
                        .into_iter()
                        .find(|f| f.rel_path() == path || f.rel_path_unaliased() == path)
                })
        };
        OperationContext::new(Some(user_folder.join(path)), db_file, None)
    };

    let contexts = match &raw.dest_path {
        Some(dest) => vec![build_context(&raw.src_path), build_context(dest)],
        None => vec![build_context(&raw.src_path)],
    };

    ModificationEvent::new(Location::Local, event_type, contexts, raw.src_path, raw.dest_path)
}

/// Spawns the intake thread and the consolidation thread, wiring them
/// together with the channel pair `run_consolidation` expects.
pub fn spawn(
    user_folder: PathBuf,
    conn: Arc<Mutex<Connection>>,
    ignored_names: Vec<String>,
    ignored_patterns: globset::GlobSet,
    debounce: Duration,
    out: Sender<ModificationEvent>,
) -> Result<thread::JoinHandle<()>, Error> {
    let (raw_sender, raw_receiver) = channel();
    let watcher = LocalWatcher::new(user_folder.clone(), raw_sender)?;

    thread::spawn(move || {
        if let Err(error) = watcher.listen() {
            log::error!("Local watcher stopped: {:?}", error);
        }
    });

    Ok(thread::spawn(move || {
        run_consolidation(
            raw_receiver,
            conn,
            user_folder,
            ignored_names,
            ignored_patterns,
            debounce,
            out,
        )
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn created(path: &str) -> RawEvent {
        RawEvent::created(path.to_string(), false)
    }

    fn created_with_sha(path: &str, sha: &str) -> RawEvent {
        let mut e = created(path);
        e.sha256 = Some(sha.to_string());
        e
    }

    fn deleted_with_sha(path: &str, sha: &str) -> RawEvent {
        let mut e = RawEvent::deleted(path.to_string(), false);
        e.sha256 = Some(sha.to_string());
        e
    }

    fn glob_set(patterns: &[&str]) -> globset::GlobSet {
        let mut builder = globset::GlobSetBuilder::new();
        for pattern in patterns {
            builder.add(globset::Glob::new(pattern).unwrap());
        }
        builder.build().unwrap()
    }

    /// Ignore glob patterns are applied by the Watcher to raw events,
    /// independent of the exact-match ignored-names set.
    #[test]
    fn ignored_patterns_match_by_glob() {
        let patterns = glob_set(&["*.tmp", "~*"]);
        assert!(is_ignored("draft.tmp", &[], &patterns));
        assert!(is_ignored("~lock", &[], &patterns));
        assert!(!is_ignored("keep.txt", &[], &patterns));
    }

    /// An atomic save pattern — create `/x.tmp` (sha X), move `/x.tmp ->
    /// /x`, delete `/x` (db sha X) — collapses to a single Modify(`/x`).
    #[test]
    fn atomic_save_collapses_to_single_modify() {
        let mut c = Consolidator::new();
        c.merge(created_with_sha("x.tmp", "X"));
        c.merge(RawEvent::moved("x.tmp".into(), "x".into(), false));
        c.merge(deleted_with_sha("x", "X"));

        let flushed = c.flush();
        assert_eq!(flushed.len(), 1);
        assert_eq!(flushed[0].kind, RawKind::Modified);
        assert_eq!(flushed[0].src_path, "x.tmp");
    }

    /// Create of path P with sha S followed by a delete of P with sha S
    /// collapses to Modify (no-op create discarded).
    #[test]
    fn create_then_delete_same_path_same_sha_is_modify() {
        let mut c = Consolidator::new();
        c.merge(created_with_sha("a.txt", "S"));
        c.merge(deleted_with_sha("a.txt", "S"));

        let flushed = c.flush();
        assert_eq!(flushed.len(), 1);
        assert_eq!(flushed[0].kind, RawKind::Modified);
        assert_eq!(flushed[0].src_path, "a.txt");
    }

    /// Delete of P followed by create of P' with identical basename and
    /// sha256 in the same window is a single Move(P -> P').
    #[test]
    fn delete_then_create_same_basename_and_sha_is_move() {
        let mut c = Consolidator::new();
        c.merge(deleted_with_sha("foo.txt", "abc"));
        c.merge(created_with_sha("bar/foo.txt", "abc"));

        let flushed = c.flush();
        assert_eq!(flushed.len(), 1);
        assert_eq!(flushed[0].kind, RawKind::Moved);
        assert_eq!(flushed[0].src_path, "foo.txt");
        assert_eq!(flushed[0].dest_path.as_deref(), Some("bar/foo.txt"));
    }

    #[test]
    fn modified_folder_is_discarded() {
        let mut c = Consolidator::new();
        let mut folder_modified = RawEvent::modified("dir".into(), true);
        folder_modified.is_directory = true;
        c.merge(folder_modified);

        assert!(c.flush().is_empty());
    }

    #[test]
    fn create_cache_dedupes_by_path_and_kind() {
        let mut c = Consolidator::new();
        c.merge(created_with_sha("new.txt", "S1"));
        c.merge(created_with_sha("new.txt", "S1"));

        assert_eq!(c.create_cache.len(), 1);
    }

    #[test]
    fn create_under_pending_move_dest_is_discarded() {
        let mut c = Consolidator::new();
        c.merge(RawEvent::moved("old_dir".into(), "new_dir".into(), true));
        c.merge(created("new_dir/child.txt"));

        // Only the folder move remains; the child create was a child of
        // the renamed folder and must not surface separately.
        let flushed = c.flush();
        assert_eq!(flushed.len(), 1);
        assert_eq!(flushed[0].kind, RawKind::Moved);
    }

    /// Parent-folder creates must be emitted before their descendants.
    #[test]
    fn flush_orders_create_cache_by_depth() {
        let mut c = Consolidator::new();
        c.push_create(created("a/b/c.txt"));
        c.push_create(created("a"));
        c.push_create(created("a/b"));

        let flushed = c.flush();
        let paths: Vec<&str> = flushed.iter().map(|e| e.src_path.as_str()).collect();
        assert_eq!(paths, vec!["a", "a/b", "a/b/c.txt"]);
    }
}
