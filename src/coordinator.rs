//! The Sync Coordinator: the only component that decides what actually
//! happens to a changed path. Pairs the Auditor's two event maps, resolves
//! conflicts through the Intervention broker, and also drains the
//! Watcher's incremental stream between audits. One loop owns both input
//! streams directly — there is no cross-thread state to race since
//! everything funnels through one `OperationQueue::put`.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{Receiver, RecvTimeoutError};
use std::sync::Arc;
use std::time::{Duration, Instant};

use rusqlite::Connection;

use crate::auditor;
use crate::client::Client;
use crate::config::Settings;
use crate::event::{EventType, Location, ModificationEvent};
use crate::intervention::{InterventionBroker, RemoteFolderDeleted, RemoteLocalFileConflict};
use crate::notification::Notification;
use crate::operation::Operation;
use crate::queue::OperationQueue;
use crate::types::RelativeFilePath;
use crate::util;

/// How often the remote sync loop re-invokes the Auditor absent an
/// explicit fresh-sync request from a resolved Intervention. Five minutes
/// keeps remote API traffic modest for a background sync client.
const DEFAULT_AUDIT_INTERVAL: Duration = Duration::from_secs(300);

/// How often the loop checks the Watcher channel and the stop flag
/// between full audits.
const POLL_INTERVAL: Duration = Duration::from_millis(500);

pub struct SyncCoordinator {
    conn: Connection,
    client: Client,
    settings: Settings,
    broker: InterventionBroker,
    queue: OperationQueue,
    notification: Notification,
}

impl SyncCoordinator {
    pub fn new(
        conn: Connection,
        client: Client,
        settings: Settings,
        broker: InterventionBroker,
        queue: OperationQueue,
        notification: Notification,
    ) -> Self {
        Self {
            conn,
            client,
            settings,
            broker,
            queue,
            notification,
        }
    }

    /// Runs until `stop` is set, interleaving periodic full audits with
    /// incremental Watcher events on the calling thread: both only ever
    /// enqueue `Operation`s, and neither blocks the other's progress for
    /// long.
    pub fn run(&self, watcher_events: &Receiver<ModificationEvent>, stop: &Arc<AtomicBool>) {
        let mut audit_due = true;
        let mut last_audit = Instant::now();

        loop {
            if stop.load(Ordering::Relaxed) {
                break;
            }

            if audit_due || last_audit.elapsed() >= DEFAULT_AUDIT_INTERVAL {
                self.notification.sync_status(crate::notification::SyncStatus::Sync);
                audit_due = self.run_audit();
                last_audit = Instant::now();
                self.notification.sync_status(crate::notification::SyncStatus::Normal);
            }

            match watcher_events.recv_timeout(POLL_INTERVAL) {
                Ok(event) => self.ingest_watcher_event(event),
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }
    }

    /// A Watcher event only knows about the local side, so it always takes
    /// the "exactly one event" path: the Watcher itself never sees the
    /// remote view.
    fn ingest_watcher_event(&self, event: ModificationEvent) {
        self.queue.put(Operation::from_event(&event));
    }

    /// Runs one full audit cycle and reconciles its two event maps. Returns
    /// whether a resolved Intervention (a "keep both" or "restore folder"
    /// decision) asked for an immediate re-audit.
    fn run_audit(&self) -> bool {
        let (local_events, remote_events) = auditor::audit(&self.conn, &self.client, &self.settings);
        self.reconcile(local_events, remote_events)
    }

    fn reconcile(
        &self,
        local_events: HashMap<RelativeFilePath, ModificationEvent>,
        remote_events: HashMap<RelativeFilePath, ModificationEvent>,
    ) -> bool {
        let mut request_fresh_sync = false;
        let mut handled: HashSet<RelativeFilePath> = HashSet::new();

        // Remote folder deletions with surviving local descendants take
        // priority over path-by-path pairing: the whole subtree resolves
        // through one Intervention.
        let folder_deletions: Vec<RelativeFilePath> = remote_events
            .iter()
            .filter(|(_, event)| event.event_type == EventType::Delete && event.is_directory)
            .map(|(path, _)| path.clone())
            .collect();

        for folder_path in folder_deletions {
            if handled.contains(&folder_path) {
                continue;
            }
            let subtree_keys: Vec<RelativeFilePath> = local_events
                .keys()
                .chain(remote_events.keys())
                .filter(|k| *k != &folder_path && k.starts_with(folder_path.as_str()))
                .cloned()
                .collect();
            let has_surviving_local_change = local_events
                .iter()
                .any(|(k, e)| k.starts_with(folder_path.as_str()) && e.event_type != EventType::Delete);
            if !has_surviving_local_change {
                continue;
            }

            let remote_event = &remote_events[&folder_path];
            let intervention = RemoteFolderDeleted {
                context: remote_event.context().clone(),
                subtree_event_keys: subtree_keys.clone(),
            };
            let resolution = match self.broker.resolve(&intervention) {
                Ok(resolution) => resolution,
                Err(error) => {
                    log::error!("RemoteFolderDeleted intervention failed for {} : {:?}", folder_path, error);
                    continue;
                }
            };
            for operation in resolution.operations {
                self.queue.put(operation);
            }
            request_fresh_sync |= resolution.request_fresh_sync;

            handled.insert(folder_path.clone());
            for key in subtree_keys {
                handled.insert(key);
            }
            for dropped in &resolution.dropped_event_keys {
                handled.insert(dropped.clone());
            }
        }

        for path in dispatch_order(&local_events, &remote_events) {
            if handled.contains(&path) {
                continue;
            }

            match (local_events.get(&path), remote_events.get(&path)) {
                (Some(local), None) => self.queue.put(Operation::from_event(local)),
                (None, Some(remote)) => self.queue.put(Operation::from_event(remote)),
                (Some(local), Some(remote)) => {
                    if self.events_converged(local, remote) {
                        self.queue.put(Operation::database_converged(local));
                    } else {
                        request_fresh_sync |= self.resolve_file_conflict(&path, local, remote);
                    }
                }
                (None, None) => unreachable!("path collected from one of the two maps"),
            }
        }

        request_fresh_sync
    }

    /// Events on both sides with the same type and identical sha256 mean
    /// the state already converged independently; for folders there's no
    /// content hash, so matching event types alone is enough.
    fn events_converged(&self, local: &ModificationEvent, remote: &ModificationEvent) -> bool {
        if local.event_type != remote.event_type {
            return false;
        }
        if local.is_directory || remote.is_directory {
            return true;
        }
        let local_sha = local
            .context()
            .local
            .as_ref()
            .and_then(|path| util::hash_file(path));
        let remote_sha = remote.context().remote.as_ref().and_then(|r| r.sha256.clone());
        local_sha.is_some() && local_sha == remote_sha
    }

    fn resolve_file_conflict(&self, path: &str, local: &ModificationEvent, remote: &ModificationEvent) -> bool {
        let intervention = RemoteLocalFileConflict {
            context: local.context().clone(),
            local_event_type: local.event_type,
            remote_event_type: remote.event_type,
        };
        let resolution = match self.broker.resolve(&intervention) {
            Ok(resolution) => resolution,
            Err(error) => {
                log::error!("RemoteLocalFileConflict intervention failed for {} : {:?}", path, error);
                return false;
            }
        };
        for operation in resolution.operations {
            self.queue.put(operation);
        }
        resolution.request_fresh_sync
    }
}

/// Orders the union of both event maps' paths for dispatch: deletes move to
/// the tail so a delete that's really one half of a move never races the
/// create it depends on, and within each group parents sort before their
/// children instead of relying on alphabetical order (which can place
/// "z/" before "a.txt" and so enqueue a delete ahead of the create it
/// should follow).
fn dispatch_order(
    local_events: &HashMap<RelativeFilePath, ModificationEvent>,
    remote_events: &HashMap<RelativeFilePath, ModificationEvent>,
) -> Vec<RelativeFilePath> {
    let mut paths: Vec<RelativeFilePath> = local_events
        .keys()
        .chain(remote_events.keys())
        .cloned()
        .collect();
    paths.sort_by_key(|p| util::parent_count(p));
    paths.dedup();

    let is_delete = |path: &str| {
        local_events.get(path).map(|e| e.event_type) == Some(EventType::Delete)
            || remote_events.get(path).map(|e| e.event_type) == Some(EventType::Delete)
    };
    let (deletes, creates): (Vec<_>, Vec<_>) = paths.into_iter().partition(|p| is_delete(p));
    creates.into_iter().chain(deletes).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::RemoteEntry;
    use crate::event::OperationContext;
    use crate::types::{ContentKind, FileId, NodeId};
    use std::path::PathBuf;

    fn local_event(path: &str, event_type: EventType, local_sha: Option<&str>) -> ModificationEvent {
        let _ = local_sha;
        ModificationEvent::new(
            Location::Local,
            event_type,
            vec![OperationContext::new(Some(PathBuf::from(path)), None, None)],
            path.to_string(),
            None,
        )
    }

    fn remote_event_with_sha(path: &str, event_type: EventType, sha: Option<&str>) -> ModificationEvent {
        let remote = RemoteEntry {
            id: FileId("1".into()),
            name: path.to_string(),
            kind: ContentKind::File,
            parent: None,
            sha256: sha.map(|s| s.to_string()),
            node_id: NodeId("n".into()),
            current_revision_id: String::new(),
        };
        ModificationEvent::new(
            Location::Remote,
            event_type,
            vec![OperationContext::new(Some(PathBuf::from(path)), None, Some(remote))],
            path.to_string(),
            None,
        )
    }

    /// Folder-typed events with the same event type are converged without
    /// any content hash comparison.
    #[test]
    fn folder_events_of_same_type_are_converged() {
        let conn = crate::database::open_in_memory().unwrap();
        let client = Client::new("http://example.invalid".into(), "t".into()).unwrap();
        let settings = test_settings();
        let coordinator = SyncCoordinator::new(
            conn,
            client,
            settings,
            InterventionBroker::headless(),
            OperationQueue::start(
                crate::database::open_in_memory().unwrap(),
                Client::new("http://example.invalid".into(), "t".into()).unwrap(),
                test_settings(),
                Notification::logging(),
            ),
            Notification::logging(),
        );

        let mut local = local_event("a/", EventType::Create, None);
        local.is_directory = true;
        let mut remote = remote_event_with_sha("a/", EventType::Create, None);
        remote.is_directory = true;

        assert!(coordinator.events_converged(&local, &remote));
    }

    /// Files with differing content are not converged even when the event
    /// type matches on both sides.
    #[test]
    fn file_events_with_differing_sha_are_not_converged() {
        let conn = crate::database::open_in_memory().unwrap();
        let client = Client::new("http://example.invalid".into(), "t".into()).unwrap();
        let settings = test_settings();
        let coordinator = SyncCoordinator::new(
            conn,
            client,
            settings,
            InterventionBroker::headless(),
            OperationQueue::start(
                crate::database::open_in_memory().unwrap(),
                Client::new("http://example.invalid".into(), "t".into()).unwrap(),
                test_settings(),
                Notification::logging(),
            ),
            Notification::logging(),
        );

        let local = local_event("nonexistent.txt", EventType::Update, None);
        let remote = remote_event_with_sha("nonexistent.txt", EventType::Update, Some("abc"));

        assert!(!coordinator.events_converged(&local, &remote));
    }

    /// A remote delete of a file and a remote create of a later-sorting
    /// folder must dispatch create before delete, not alphabetically.
    #[test]
    fn dispatch_order_puts_deletes_after_creates() {
        let mut remote_events = HashMap::new();
        remote_events.insert(
            "a/osfstorage/a.txt".to_string(),
            remote_event_with_sha("a/osfstorage/a.txt", EventType::Delete, None),
        );
        let mut folder_create = remote_event_with_sha("a/osfstorage/z/", EventType::Create, None);
        folder_create.is_directory = true;
        remote_events.insert("a/osfstorage/z/".to_string(), folder_create);

        let order = dispatch_order(&HashMap::new(), &remote_events);
        assert_eq!(
            order,
            vec!["a/osfstorage/z/".to_string(), "a/osfstorage/a.txt".to_string()]
        );
    }

    /// Parent folders dispatch before their children within the non-delete
    /// group.
    #[test]
    fn dispatch_order_sorts_parents_before_children() {
        let mut local_events = HashMap::new();
        local_events.insert("a/b/c.txt".to_string(), local_event("a/b/c.txt", EventType::Create, None));
        local_events.insert("a/".to_string(), local_event("a/", EventType::Create, None));
        local_events.insert("a/b/".to_string(), local_event("a/b/", EventType::Create, None));

        let order = dispatch_order(&local_events, &HashMap::new());
        assert_eq!(
            order,
            vec!["a/".to_string(), "a/b/".to_string(), "a/b/c.txt".to_string()]
        );
    }

    fn test_settings() -> Settings {
        Settings {
            user_folder: std::env::temp_dir(),
            event_debounce: Duration::from_secs(5),
            osf_storage_folder: "osfstorage".to_string(),
            ignored_names: Vec::new(),
            ignored_patterns: Vec::new(),
            dry: true,
            remote_base_url: "http://example.invalid".to_string(),
            remote_token: "t".to_string(),
        }
    }
}
