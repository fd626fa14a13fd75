//! The three-way diff engine.
//!
//! Three views are collected independently (`collect_all_db`,
//! `collect_all_remote`, `collect_all_local`), each a `{path: Audit}` map,
//! then diffed twice against the database (the common ancestor) to produce
//! a local-origin and a remote-origin `ModificationEvent` map.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::thread;

use rusqlite::Connection;
use walkdir::WalkDir;

use crate::client::Client;
use crate::config::Settings;
use crate::database::DatabaseOperation;
use crate::event::{Audit, EventType, FObj, Location, ModificationEvent, OperationContext};
use crate::model::{self, File};
use crate::types::{FileId, RelativeFilePath};
use crate::util;

type AuditMap = HashMap<RelativeFilePath, Audit>;

/// `db_map`: every File row, keyed both by its real (unaliased) path and,
/// when an alias shadows the name, by the aliased path too.
pub fn collect_all_db(conn: &Connection) -> AuditMap {
    let db = DatabaseOperation::new(conn);
    let files = match db.all_files() {
        Ok(files) => files,
        Err(e) => {
            log::error!("Failed to collect DB audit map: {:?}", e);
            return HashMap::new();
        }
    };

    let mut map = HashMap::new();
    for file in files {
        let audit = Audit::new(Some(file.id.clone()), file.sha256.clone(), FObj::Db(file.clone()));
        let unaliased = file.rel_path_unaliased();
        let aliased = file.rel_path();
        map.insert(unaliased.clone(), audit.clone());
        if aliased != unaliased {
            map.insert(aliased, audit);
        }
    }
    map
}

/// `remote_map`: walks every synced Node's storage tree. Node walks run
/// with bounded concurrency (a fan-out pool of at most 5 workers); a node
/// whose walk fails logs and is skipped, never aborting the whole audit.
pub fn collect_all_remote(conn: &Connection, client: &Client, settings: &Settings) -> AuditMap {
    let db = DatabaseOperation::new(conn);
    let nodes = match db.synced_nodes() {
        Ok(nodes) => nodes,
        Err(e) => {
            log::error!("Failed to list synced nodes for remote audit: {:?}", e);
            return HashMap::new();
        }
    };

    const MAX_WORKERS: usize = 5;
    let mut combined = HashMap::new();
    for chunk in nodes.chunks(MAX_WORKERS) {
        thread::scope(|scope| {
            let handles: Vec<_> = chunk
                .iter()
                .map(|node| {
                    scope.spawn(move || {
                        walk_remote_node(client, settings, node).map_err(|e| (node.id.0.clone(), e))
                    })
                })
                .collect();

            for handle in handles {
                match handle.join() {
                    Ok(Ok(map)) => combined.extend(map),
                    Ok(Err((node_id, e))) => {
                        log::error!("Remote walk failed for node {} : {}", node_id, e);
                    }
                    Err(_) => log::error!("Remote walk thread panicked"),
                }
            }
        });
    }
    combined
}

fn walk_remote_node(
    client: &Client,
    settings: &Settings,
    node: &model::Node,
) -> Result<AuditMap, crate::error::ClientError> {
    let mut map = HashMap::new();
    let storage_root = model::storage_root(node, &settings.osf_storage_folder);
    let mut stack: Vec<(Option<FileId>, String)> = vec![(None, storage_root)];

    while let Some((folder_id, prefix)) = stack.pop() {
        let children = client.list_children(&node.id, folder_id.as_ref())?;
        for child in children {
            if settings.ignored_names.iter().any(|n| n == &child.name) {
                continue;
            }
            let rel_buf = Path::new(&prefix).join(&child.name);
            let rel_no_sep = rel_buf.to_string_lossy().into_owned();
            if child.kind.is_folder() {
                let mut rel = rel_no_sep.clone();
                rel.push(std::path::MAIN_SEPARATOR);
                let audit = Audit::new(Some(child.id.clone()), None, FObj::Remote(child.clone()));
                map.insert(rel, audit);
                stack.push((Some(child.id.clone()), rel_no_sep));
            } else {
                let audit = Audit::new(Some(child.id.clone()), child.sha256.clone(), FObj::Remote(child));
                map.insert(rel_no_sep, audit);
            }
        }
    }

    Ok(map)
}

/// `local_map`: walks the local folder under every synced Node. Files get
/// their content hashed; since the local filesystem has no native stable
/// identifier, a file's `fid` is borrowed from the DB row whose path
/// matches directly (including via alias) or, failing that, whose
/// `sha256` matches, letting `diff` recognize a rename even though the
/// path changed. Folders have no content hash, so their `fid` is only
/// assigned on a direct (possibly aliased) path match.
pub fn collect_all_local(conn: &Connection, settings: &Settings) -> AuditMap {
    let db = DatabaseOperation::new(conn);
    let nodes = match db.synced_nodes() {
        Ok(nodes) => nodes,
        Err(e) => {
            log::error!("Failed to list synced nodes for local audit: {:?}", e);
            return HashMap::new();
        }
    };
    let known_files = db.all_files().unwrap_or_default();

    let mut map = HashMap::new();
    for node in &nodes {
        let storage_root = model::storage_root(node, &settings.osf_storage_folder);
        let abs_root = settings.user_folder.join(&storage_root);
        if !abs_root.exists() {
            continue;
        }

        for entry in WalkDir::new(&abs_root)
            .min_depth(1)
            .into_iter()
            .filter_entry(|e| {
                e.file_name()
                    .to_str()
                    .map(|n| !settings.ignored_names.iter().any(|i| i == n))
                    .unwrap_or(true)
            })
        {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    log::warn!("Skipping unreadable local entry during audit: {:?}", e);
                    continue;
                }
            };

            let abs_path = entry.path();
            let rel_path = match abs_path.strip_prefix(&settings.user_folder) {
                Ok(p) => p.to_string_lossy().into_owned(),
                Err(_) => continue,
            };
            let is_dir = entry.file_type().is_dir();

            if is_dir {
                let matched = find_db_file_by_path(&known_files, &rel_path);
                let fid = matched.map(|f| f.id.clone());
                let key = matched.map(|f| f.rel_path_unaliased()).unwrap_or(rel_path.clone());
                let mut key = key;
                if !key.ends_with(std::path::MAIN_SEPARATOR) {
                    key.push(std::path::MAIN_SEPARATOR);
                }
                map.insert(key, Audit::new(fid, None, FObj::LocalPath(rel_path)));
            } else {
                let sha256 = util::hash_file(abs_path);
                let direct_match = find_db_file_by_path(&known_files, &rel_path);
                let matched = direct_match.or_else(|| {
                    sha256
                        .as_deref()
                        .and_then(|sha| find_db_file_by_sha(&known_files, sha))
                });
                let fid = matched.map(|f| f.id.clone());
                let key = matched.map(|f| f.rel_path_unaliased()).unwrap_or_else(|| rel_path.clone());
                map.insert(key, Audit::new(fid, sha256, FObj::LocalPath(rel_path)));
            }
        }
    }
    map
}

fn find_db_file_by_path<'a>(files: &'a [File], rel_path: &str) -> Option<&'a File> {
    files
        .iter()
        .find(|f| f.rel_path() == rel_path || f.rel_path_unaliased() == rel_path)
}

fn find_db_file_by_sha<'a>(files: &'a [File], sha: &str) -> Option<&'a File> {
    files.iter().find(|f| f.sha256.as_deref() == Some(sha))
}

/// Result of `diff(source, target)`.
#[derive(Debug, Default)]
pub struct DiffResult {
    pub created: HashSet<RelativeFilePath>,
    pub deleted: HashSet<RelativeFilePath>,
    pub moved: Vec<(RelativeFilePath, RelativeFilePath)>,
    pub modified: HashSet<RelativeFilePath>,
}

/// Symmetric in the sense that `diff(A,B).created == diff(B,A).deleted`
/// ignoring identity-based move extraction; a matching `fid` across maps
/// is reported as a move, not a create+delete pair.
pub fn diff(source: &AuditMap, target: &AuditMap) -> DiffResult {
    let mut created: HashSet<RelativeFilePath> =
        source.keys().filter(|k| !target.contains_key(*k)).cloned().collect();
    let mut deleted: HashSet<RelativeFilePath> =
        target.keys().filter(|k| !source.contains_key(*k)).cloned().collect();

    for (path, s) in source.iter() {
        if let Some(t) = target.get(path) {
            if s.fid != t.fid {
                created.insert(path.clone());
                deleted.insert(path.clone());
            }
        }
    }

    let mut moved = Vec::new();
    let mut resolved_created = HashSet::new();
    let mut resolved_deleted = HashSet::new();

    for del_path in deleted.iter() {
        if let Some(fid) = target.get(del_path).and_then(|a| a.fid.clone()) {
            if let Some((new_path, _)) = source
                .iter()
                .find(|(p, a)| created.contains(*p) && a.fid.as_ref() == Some(&fid))
            {
                moved.push((del_path.clone(), new_path.clone()));
                resolved_deleted.insert(del_path.clone());
                resolved_created.insert(new_path.clone());
            }
        }
    }
    for new_path in created.iter() {
        if resolved_created.contains(new_path) {
            continue;
        }
        if let Some(fid) = source.get(new_path).and_then(|a| a.fid.clone()) {
            if let Some((old_path, _)) = target.iter().find(|(p, a)| {
                deleted.contains(*p) && !resolved_deleted.contains(*p) && a.fid.as_ref() == Some(&fid)
            }) {
                moved.push((old_path.clone(), new_path.clone()));
                resolved_deleted.insert(old_path.clone());
                resolved_created.insert(new_path.clone());
            }
        }
    }

    created.retain(|p| !resolved_created.contains(p));
    deleted.retain(|p| !resolved_deleted.contains(p));

    let mut modified = HashSet::new();
    for (path, s) in source.iter() {
        if created.contains(path) || deleted.contains(path) {
            continue;
        }
        if let Some(t) = target.get(path) {
            if s.sha256.is_some() && t.sha256.is_some() && s.sha256 != t.sha256 {
                modified.insert(path.clone());
            }
        }
    }
    for (old, new) in &moved {
        if let (Some(s), Some(t)) = (source.get(new), target.get(old)) {
            if s.sha256.is_some() && t.sha256.is_some() && s.sha256 != t.sha256 {
                modified.insert(new.clone());
            }
        }
    }

    DiffResult {
        created,
        deleted,
        moved,
        modified,
    }
}

/// Builds `OperationContext(local=user_folder/path, db=db_map[path]?.fobj,
/// remote=remote_map[path]?.fobj)`.
fn build_context(path: &str, db_map: &AuditMap, remote_map: &AuditMap, user_folder: &Path) -> OperationContext {
    let local = Some(user_folder.join(path));
    let db = db_map.get(path).and_then(|a| match &a.fobj {
        FObj::Db(f) => Some(f.clone()),
        _ => None,
    });
    let remote = remote_map.get(path).and_then(|a| match &a.fobj {
        FObj::Remote(r) => Some(r.clone()),
        _ => None,
    });
    OperationContext::new(local, db, remote)
}

/// Every ancestor directory (with trailing separator) of `path`, down to
/// and including its node's storage-root folder: used to synthesize a
/// parent-folder update event for each, so a changed file's ancestors are
/// always touched too.
fn ancestor_chain(path: &str, storage_roots: &[String]) -> Vec<String> {
    let root = match storage_roots.iter().find(|r| path.starts_with(r.as_str())) {
        Some(r) => r.clone(),
        None => return Vec::new(),
    };

    let mut chain = Vec::new();
    let mut current = PathBuf::from(path.trim_end_matches(std::path::MAIN_SEPARATOR));
    loop {
        let parent = match current.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            _ => break,
        };
        let mut s = parent.to_string_lossy().into_owned();
        if !s.ends_with(std::path::MAIN_SEPARATOR) {
            s.push(std::path::MAIN_SEPARATOR);
        }
        if s.len() < root.len() {
            break;
        }
        chain.push(s.clone());
        current = parent;
        if s == root {
            break;
        }
    }
    chain
}

#[allow(clippy::too_many_arguments)]
fn synthesize_events(
    location: Location,
    diff_result: &DiffResult,
    db_map: &AuditMap,
    remote_map: &AuditMap,
    storage_roots: &[String],
    settings: &Settings,
) -> HashMap<RelativeFilePath, ModificationEvent> {
    let user_folder = &settings.user_folder;
    let mut events = HashMap::new();

    for path in &diff_result.created {
        let ctx = build_context(path, db_map, remote_map, user_folder);
        events.insert(
            path.clone(),
            ModificationEvent::new(location, EventType::Create, vec![ctx], path.clone(), None),
        );
    }
    for path in &diff_result.deleted {
        let ctx = build_context(path, db_map, remote_map, user_folder);
        events.insert(
            path.clone(),
            ModificationEvent::new(location, EventType::Delete, vec![ctx], path.clone(), None),
        );
    }
    for (old, new) in &diff_result.moved {
        let src_ctx = build_context(old, db_map, remote_map, user_folder);
        let dest_ctx = build_context(new, db_map, remote_map, user_folder);
        events.insert(
            old.clone(),
            ModificationEvent::new(
                location,
                EventType::Move,
                vec![src_ctx, dest_ctx],
                old.clone(),
                Some(new.clone()),
            ),
        );
    }
    for path in &diff_result.modified {
        let ctx = build_context(path, db_map, remote_map, user_folder);
        events.insert(
            path.clone(),
            ModificationEvent::new(location, EventType::Update, vec![ctx], path.clone(), None),
        );
    }

    let changed_paths: Vec<String> = diff_result
        .created
        .iter()
        .chain(diff_result.deleted.iter())
        .chain(diff_result.modified.iter())
        .cloned()
        .chain(diff_result.moved.iter().flat_map(|(o, n)| vec![o.clone(), n.clone()]))
        .collect();

    for path in changed_paths {
        for ancestor in ancestor_chain(&path, storage_roots) {
            if !events.contains_key(&ancestor) {
                let ctx = build_context(&ancestor, db_map, remote_map, user_folder);
                events.insert(
                    ancestor.clone(),
                    ModificationEvent::new(location, EventType::Update, vec![ctx], ancestor, None),
                );
            }
        }
    }

    events
}

/// Runs a full audit cycle: collects the three views, diffs each side
/// against the DB, and returns `(local_events, remote_events)`.
pub fn audit(
    conn: &Connection,
    client: &Client,
    settings: &Settings,
) -> (
    HashMap<RelativeFilePath, ModificationEvent>,
    HashMap<RelativeFilePath, ModificationEvent>,
) {
    let db_map = collect_all_db(conn);
    let remote_map = collect_all_remote(conn, client, settings);
    let local_map = collect_all_local(conn, settings);

    let storage_roots: Vec<String> = {
        let db = DatabaseOperation::new(conn);
        db.synced_nodes()
            .unwrap_or_default()
            .iter()
            .map(|n| model::storage_root(n, &settings.osf_storage_folder))
            .collect()
    };

    let local_diff = diff(&local_map, &db_map);
    let remote_diff = diff(&remote_map, &db_map);

    let local_events = synthesize_events(
        Location::Local,
        &local_diff,
        &db_map,
        &remote_map,
        &storage_roots,
        settings,
    );
    let remote_events = synthesize_events(
        Location::Remote,
        &remote_diff,
        &db_map,
        &remote_map,
        &storage_roots,
        settings,
    );

    (local_events, remote_events)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::NodeId;

    fn db_file(id: &str, path: &str, sha: &str) -> File {
        File {
            id: FileId(id.to_string()),
            name: path.rsplit(std::path::MAIN_SEPARATOR).next().unwrap().to_string(),
            is_folder: false,
            provider: "osfstorage".to_string(),
            parent: None,
            sha256: Some(sha.to_string()),
            node_id: NodeId("node".to_string()),
            alias: None,
            parent_rel_path: Path::new(path)
                .parent()
                .map(|p| p.to_string_lossy().into_owned() + "/")
                .unwrap_or_default(),
        }
    }

    fn audit_of(file: &File) -> Audit {
        Audit::new(Some(file.id.clone()), file.sha256.clone(), FObj::Db(file.clone()))
    }

    /// Identical maps produce no diff.
    #[test]
    fn identical_maps_produce_no_diff() {
        let f = db_file("1", "a/osfstorage/foo.txt", "abc");
        let mut map = HashMap::new();
        map.insert(f.rel_path(), audit_of(&f));

        let result = diff(&map, &map);
        assert!(result.created.is_empty());
        assert!(result.deleted.is_empty());
        assert!(result.moved.is_empty());
        assert!(result.modified.is_empty());
    }

    /// db has foo.txt (fid=7, sha=abc); the source map has bar.txt at the
    /// same fid via content-hash identity resolution. `diff` must report a
    /// move, not a create+delete pair.
    #[test]
    fn rename_detected_via_matching_fid() {
        let mut db_map = HashMap::new();
        let db_file_row = db_file("7", "a/osfstorage/foo.txt", "abc");
        db_map.insert(db_file_row.rel_path(), audit_of(&db_file_row));

        let mut source_map = HashMap::new();
        source_map.insert(
            "a/osfstorage/bar.txt".to_string(),
            Audit::new(
                Some(FileId("7".to_string())),
                Some("abc".to_string()),
                FObj::LocalPath("a/osfstorage/bar.txt".to_string()),
            ),
        );

        let result = diff(&source_map, &db_map);
        assert!(result.created.is_empty());
        assert!(result.deleted.is_empty());
        assert_eq!(result.moved, vec![("a/osfstorage/foo.txt".to_string(), "a/osfstorage/bar.txt".to_string())]);
    }

    /// A moved pair whose content also changed is reported in `modified`
    /// keyed by the new path.
    #[test]
    fn moved_pair_with_differing_sha_is_also_modified() {
        let mut target = HashMap::new();
        target.insert(
            "old.txt".to_string(),
            Audit::new(Some(FileId("1".into())), Some("aaa".into()), FObj::None),
        );
        let mut source = HashMap::new();
        source.insert(
            "new.txt".to_string(),
            Audit::new(Some(FileId("1".into())), Some("bbb".into()), FObj::None),
        );

        let result = diff(&source, &target);
        assert_eq!(result.moved, vec![("old.txt".to_string(), "new.txt".to_string())]);
        assert!(result.modified.contains("new.txt"));
    }

    #[test]
    fn plain_create_and_delete_with_no_fid_overlap() {
        let mut target = HashMap::new();
        target.insert("gone.txt".to_string(), Audit::null());
        let mut source = HashMap::new();
        source.insert("fresh.txt".to_string(), Audit::null());

        let result = diff(&source, &target);
        assert_eq!(result.created, HashSet::from(["fresh.txt".to_string()]));
        assert_eq!(result.deleted, HashSet::from(["gone.txt".to_string()]));
        assert!(result.moved.is_empty());
    }
}
