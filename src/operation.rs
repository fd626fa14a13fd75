//! The `Operation` value type and its executor: one variant exists for
//! every `(target, event_type, kind)` triple the Coordinator can select.
//! Modeled as a small typed struct matched on in `run`, one explicit match
//! arm per event kind, across three targets (local, remote, database).

use std::fs;
use std::path::{Path, PathBuf};

use rusqlite::Connection;

use crate::client::Client;
use crate::config::Settings;
use crate::database::DatabaseOperation;
use crate::error::Error;
use crate::event::{EventType, Location, ModificationEvent, OperationContext};
use crate::types::{FileId, NodeId};
use crate::util;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Target {
    Local,
    Remote,
    Database,
}

/// `(target, event_type, kind)` plus the `OperationContext`(s) the Auditor
/// or Coordinator collected for the affected path(s). `contexts` holds one
/// entry except for `Move`, which holds `[source, destination]`.
#[derive(Debug, Clone)]
pub struct Operation {
    pub target: Target,
    pub event_type: EventType,
    pub is_directory: bool,
    pub contexts: Vec<OperationContext>,
}

impl Operation {
    /// A local-originated event produces a remote mutation and vice versa.
    pub fn from_event(event: &ModificationEvent) -> Self {
        Self {
            target: match event.location.opposite() {
                Location::Local => Target::Local,
                Location::Remote => Target::Remote,
            },
            event_type: event.event_type,
            is_directory: event.is_directory,
            contexts: event.contexts.clone(),
        }
    }

    /// Events on both sides, same type, identical sha256 → state converged
    /// externally; only the DB needs to catch up.
    pub fn database_converged(event: &ModificationEvent) -> Self {
        Self {
            target: Target::Database,
            event_type: event.event_type,
            is_directory: event.is_directory,
            contexts: event.contexts.clone(),
        }
    }

    pub fn database_create(context: OperationContext, is_directory: bool) -> Self {
        Self {
            target: Target::Database,
            event_type: EventType::Create,
            is_directory,
            contexts: vec![context],
        }
    }

    pub fn database_delete(context: OperationContext, is_directory: bool) -> Self {
        Self {
            target: Target::Database,
            event_type: EventType::Delete,
            is_directory,
            contexts: vec![context],
        }
    }

    fn context(&self) -> &OperationContext {
        &self.contexts[0]
    }

    /// `(file_name, project_title)` for the user-visible notification
    /// raised when an Operation fails.
    pub fn describe(&self) -> (String, String) {
        let ctx = self.context();
        let name = ctx
            .local
            .as_ref()
            .and_then(|p| p.file_name())
            .map(|n| n.to_string_lossy().into_owned())
            .or_else(|| ctx.db.as_ref().map(|f| f.name.clone()))
            .or_else(|| ctx.remote.as_ref().map(|r| r.name.clone()))
            .unwrap_or_else(|| "<unknown file>".to_string());
        let project = ctx
            .db
            .as_ref()
            .map(|f| f.node_id.0.clone())
            .or_else(|| ctx.remote.as_ref().map(|r| r.node_id.0.clone()))
            .unwrap_or_else(|| "<unknown project>".to_string());
        (name, project)
    }

    pub fn run(&self, deps: &OperationDeps, dry: bool) -> Result<(), Error> {
        if dry {
            log::info!(
                "[dry-run] would execute {:?} on {:?}",
                self.target,
                self.event_type
            );
            return Ok(());
        }
        match self.target {
            Target::Local => self.run_local(deps),
            Target::Remote => self.run_remote(deps),
            Target::Database => self.run_database(deps),
        }
    }

    // --- Local --------------------------------------------------------

    fn run_local(&self, deps: &OperationDeps) -> Result<(), Error> {
        match self.event_type {
            EventType::Create | EventType::Update => {
                let ctx = self.context();
                let local_path = ctx
                    .local
                    .as_ref()
                    .ok_or_else(|| Error::UnexpectedError("missing local path".into()))?;
                if self.is_directory {
                    fs::create_dir_all(local_path)?;
                } else {
                    let remote = ctx
                        .remote
                        .as_ref()
                        .ok_or_else(|| Error::NodeNotFound(format!("{:?}", local_path)))?;
                    let response = deps
                        .client
                        .get_file_content(&remote.node_id, &remote.id)
                        .map_err(Error::from)?;
                    crate::client::copy_to_file(response, local_path)?;
                }
                Ok(())
            }
            EventType::Delete => {
                let ctx = self.context();
                let local_path = ctx
                    .local
                    .as_ref()
                    .ok_or_else(|| Error::UnexpectedError("missing local path".into()))?;
                if !local_path.exists() {
                    return Ok(());
                }
                if self.is_directory {
                    fs::remove_dir_all(local_path)?;
                } else {
                    fs::remove_file(local_path)?;
                }
                Ok(())
            }
            EventType::Move => {
                let src = self.contexts[0]
                    .local
                    .as_ref()
                    .ok_or_else(|| Error::UnexpectedError("missing src local path".into()))?;
                let dest = self.contexts[1]
                    .local
                    .as_ref()
                    .ok_or_else(|| Error::UnexpectedError("missing dest local path".into()))?;
                if let Some(parent) = dest.parent() {
                    fs::create_dir_all(parent)?;
                }
                fs::rename(src, dest)?;
                Ok(())
            }
        }
    }

    // --- Remote ---------------------------------------------------------

    fn run_remote(&self, deps: &OperationDeps) -> Result<(), Error> {
        match self.event_type {
            EventType::Create => {
                let ctx = self.context();
                let local_path = ctx
                    .local
                    .as_ref()
                    .ok_or_else(|| Error::UnexpectedError("missing local path".into()))?;
                let (node_id, remote_path) = deps.node_and_remote_path(local_path)?;
                if self.is_directory {
                    deps.client
                        .create_folder(&node_id, &deps.settings.osf_storage_folder, &remote_path)
                        .map_err(Error::from)?;
                } else {
                    deps.client
                        .upload(
                            &node_id,
                            &deps.settings.osf_storage_folder,
                            &remote_path,
                            local_path,
                        )
                        .map_err(Error::from)?;
                }
                Ok(())
            }
            EventType::Update => {
                let ctx = self.context();
                let local_path = ctx
                    .local
                    .as_ref()
                    .ok_or_else(|| Error::UnexpectedError("missing local path".into()))?;
                if self.is_directory {
                    return Ok(());
                }
                let (node_id, remote_path) = deps.node_and_remote_path(local_path)?;
                deps.client
                    .upload(
                        &node_id,
                        &deps.settings.osf_storage_folder,
                        &remote_path,
                        local_path,
                    )
                    .map_err(Error::from)?;
                Ok(())
            }
            EventType::Delete => {
                let ctx = self.context();
                let file_id = ctx
                    .db
                    .as_ref()
                    .map(|f| f.id.clone())
                    .or_else(|| ctx.remote.as_ref().map(|r| r.id.clone()))
                    .ok_or_else(|| Error::NodeNotFound("unknown remote id for delete".into()))?;
                let node_id = ctx
                    .db
                    .as_ref()
                    .map(|f| f.node_id.clone())
                    .or_else(|| ctx.remote.as_ref().map(|r| r.node_id.clone()))
                    .ok_or_else(|| Error::NodeNotFound("unknown node for delete".into()))?;
                deps.client.trash(&node_id, &file_id).map_err(Error::from)?;
                Ok(())
            }
            EventType::Move => {
                let src_ctx = &self.contexts[0];
                let dest_ctx = &self.contexts[1];
                let dest_local = dest_ctx
                    .local
                    .as_ref()
                    .ok_or_else(|| Error::UnexpectedError("missing dest local path".into()))?;
                let (node_id, dest_remote_path) = deps.node_and_remote_path(dest_local)?;
                let src_local = src_ctx
                    .local
                    .as_ref()
                    .ok_or_else(|| Error::UnexpectedError("missing src local path".into()))?;
                let (src_node_id, src_remote_path) = deps.node_and_remote_path(src_local)?;
                deps.client
                    .move_or_copy(
                        &deps.settings.osf_storage_folder,
                        &src_node_id,
                        &src_remote_path,
                        &node_id,
                        &dest_remote_path,
                        None,
                    )
                    .map_err(Error::from)?;
                Ok(())
            }
        }
    }

    // --- Database ------------------------------------------------------

    fn run_database(&self, deps: &OperationDeps) -> Result<(), Error> {
        let db = DatabaseOperation::new(deps.conn);
        match self.event_type {
            EventType::Create => {
                let ctx = self.context();
                let local_path = ctx
                    .local
                    .as_ref()
                    .ok_or_else(|| Error::UnexpectedError("missing local path".into()))?;
                let relative_path = deps.relative_path(local_path)?;
                let file_info =
                    util::FileInfos::from(&deps.settings.user_folder, relative_path.clone())?;
                let file_id = ctx
                    .remote
                    .as_ref()
                    .map(|r| r.id.clone())
                    .or_else(|| ctx.db.as_ref().map(|f| f.id.clone()))
                    .unwrap_or_else(|| FileId(relative_path.clone()));
                let node_id = ctx
                    .remote
                    .as_ref()
                    .map(|r| r.node_id.clone())
                    .or_else(|| ctx.db.as_ref().map(|f| f.node_id.clone()))
                    .ok_or_else(|| Error::NodeNotFound(relative_path.clone()))?;
                db.insert_new_file(
                    relative_path,
                    self.is_directory,
                    node_id,
                    file_id,
                    file_info.last_modified_timestamp,
                    ctx.remote
                        .as_ref()
                        .map(|r| r.current_revision_id.clone())
                        .unwrap_or_default(),
                )?;
                Ok(())
            }
            EventType::Update => {
                let ctx = self.context();
                let local_path = ctx
                    .local
                    .as_ref()
                    .ok_or_else(|| Error::UnexpectedError("missing local path".into()))?;
                let relative_path = deps.relative_path(local_path)?;
                if let Ok(file_info) =
                    util::FileInfos::from(&deps.settings.user_folder, relative_path.clone())
                {
                    db.update_last_modified_timestamp(
                        relative_path.clone(),
                        file_info.last_modified_timestamp,
                    )?;
                }
                if let Some(remote) = &ctx.remote {
                    db.update_revision_id(relative_path, remote.current_revision_id.clone())?;
                }
                Ok(())
            }
            EventType::Delete => {
                let ctx = self.context();
                let file_id = ctx
                    .db
                    .as_ref()
                    .map(|f| f.id.clone())
                    .ok_or_else(|| Error::NodeNotFound("missing db row for delete".into()))?;
                if self.is_directory {
                    db.delete_folder(file_id)?;
                } else {
                    db.delete_file(file_id)?;
                }
                Ok(())
            }
            EventType::Move => {
                let dest_ctx = &self.contexts[1];
                let file_id = dest_ctx
                    .db
                    .as_ref()
                    .or(self.contexts[0].db.as_ref())
                    .map(|f| f.id.clone())
                    .ok_or_else(|| Error::NodeNotFound("missing db row for move".into()))?;
                let dest_local = dest_ctx
                    .local
                    .as_ref()
                    .ok_or_else(|| Error::UnexpectedError("missing dest local path".into()))?;
                let relative_path = deps.relative_path(dest_local)?;
                db.update_relative_path(file_id, relative_path)?;
                Ok(())
            }
        }
    }
}

/// Dependencies an `Operation::run` needs, bundled so the queue worker can
/// own one instance and hand out `&OperationDeps` per job.
pub struct OperationDeps<'a> {
    pub conn: &'a Connection,
    pub client: &'a Client,
    pub settings: &'a Settings,
}

impl<'a> OperationDeps<'a> {
    fn relative_path(&self, local_path: &Path) -> Result<String, Error> {
        util::path_to_string(
            local_path
                .strip_prefix(&self.settings.user_folder)
                .map_err(Error::from)?,
        )
    }

    /// Resolves `(node_id, remote_path)` for a local path by finding which
    /// synced Node's folder it falls under.
    fn node_and_remote_path(&self, local_path: &Path) -> Result<(NodeId, String), Error> {
        let relative_path = self.relative_path(local_path)?;
        let db = DatabaseOperation::new(self.conn);
        for node in db.synced_nodes()? {
            if relative_path.starts_with(&node.rel_path) {
                let storage_root =
                    crate::model::storage_root(&node, &self.settings.osf_storage_folder);
                if let Some(remote_path) = relative_path.strip_prefix(&storage_root) {
                    return Ok((
                        node.id,
                        remote_path
                            .trim_start_matches(std::path::MAIN_SEPARATOR)
                            .to_string(),
                    ));
                }
            }
        }
        Err(Error::NodeNotFound(relative_path))
    }
}

/// `"<stem> (<n>)<suffix>"` helper re-exported for the Intervention
/// broker's "keep both" resolution.
pub fn conflict_rename_target(local_path: &Path) -> PathBuf {
    let parent = local_path.parent().unwrap_or_else(|| Path::new(""));
    let stem = local_path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let suffix = local_path
        .extension()
        .map(|e| format!(".{}", e.to_string_lossy()))
        .unwrap_or_default();
    util::first_free_conflict_name(parent, &stem, &suffix)
}
