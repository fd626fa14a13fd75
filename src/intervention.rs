//! The Intervention Broker: resolves a conflict that cannot be reconciled
//! automatically by asking a callback for a `Decision`, or falling back to
//! a safe default. An explicit owned handle threaded through the
//! Coordinator rather than a process-wide singleton, so there's no hidden
//! global state to reason about.

use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

use crate::error::Error;
use crate::event::{EventType, OperationContext};
use crate::operation::{conflict_rename_target, Operation};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    KeepMine,
    KeepTheirs,
    KeepBoth,
    RestoreFolder,
    Cancel,
}

/// What the Coordinator should do once an `Intervention` resolves: enqueue
/// `operations`, optionally trigger a fresh audit, and drop any pending
/// event-map entries under `dropped_event_keys` that the conflict subsumed.
#[derive(Debug, Default)]
pub struct Resolution {
    pub operations: Vec<Operation>,
    pub request_fresh_sync: bool,
    pub dropped_event_keys: Vec<String>,
}

pub trait Intervention: Send + Sync {
    fn title(&self) -> String;
    fn description(&self) -> String;
    fn allowed_decisions(&self) -> Vec<Decision>;
    fn default_decision(&self) -> Decision;
    fn resolve(&self, decision: Decision) -> Result<Resolution, Error>;
}

/// Both sides modified, or both sides created, the same file with
/// differing content.
pub struct RemoteLocalFileConflict {
    pub context: OperationContext,
    pub local_event_type: EventType,
    pub remote_event_type: EventType,
}

impl RemoteLocalFileConflict {
    fn is_create_create(&self) -> bool {
        self.local_event_type == EventType::Create && self.remote_event_type == EventType::Create
    }
}

impl Intervention for RemoteLocalFileConflict {
    fn title(&self) -> String {
        "File changed on both sides".to_string()
    }

    fn description(&self) -> String {
        let name = self
            .context
            .local
            .as_ref()
            .and_then(|p| p.file_name())
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "<unknown file>".to_string());
        format!(
            "\"{}\" was changed both locally and remotely with different content.",
            name
        )
    }

    fn allowed_decisions(&self) -> Vec<Decision> {
        vec![Decision::KeepMine, Decision::KeepTheirs, Decision::KeepBoth]
    }

    fn default_decision(&self) -> Decision {
        // Conservative default: don't clobber either side silently.
        Decision::KeepBoth
    }

    fn resolve(&self, decision: Decision) -> Result<Resolution, Error> {
        let mut operations = Vec::new();
        let create_create = self.is_create_create();

        match decision {
            Decision::KeepMine => {
                if create_create {
                    operations.push(Operation::database_create(self.context.clone(), false));
                }
                operations.push(Operation {
                    target: crate::operation::Target::Remote,
                    event_type: EventType::Update,
                    is_directory: false,
                    contexts: vec![self.context.clone()],
                });
                Ok(Resolution {
                    operations,
                    request_fresh_sync: false,
                    dropped_event_keys: Vec::new(),
                })
            }
            Decision::KeepTheirs => {
                if create_create {
                    operations.push(Operation::database_create(self.context.clone(), false));
                }
                operations.push(Operation {
                    target: crate::operation::Target::Local,
                    event_type: EventType::Update,
                    is_directory: false,
                    contexts: vec![self.context.clone()],
                });
                Ok(Resolution {
                    operations,
                    request_fresh_sync: false,
                    dropped_event_keys: Vec::new(),
                })
            }
            Decision::KeepBoth => {
                let local_path = self
                    .context
                    .local
                    .as_ref()
                    .ok_or_else(|| Error::UnexpectedError("conflict has no local path".into()))?;
                let renamed: PathBuf = conflict_rename_target(local_path);
                if local_path.exists() {
                    fs::rename(local_path, &renamed)?;
                }
                // Identity is forgotten; a fresh audit re-creates it under the new name.
                if !create_create && self.local_event_type != EventType::Create && self.context.db.is_some() {
                    operations.push(Operation::database_delete(self.context.clone(), false));
                }
                Ok(Resolution {
                    operations,
                    request_fresh_sync: true,
                    dropped_event_keys: Vec::new(),
                })
            }
            other => Err(Error::UnexpectedError(format!(
                "Decision {:?} is not valid for RemoteLocalFileConflict",
                other
            ))),
        }
    }
}

/// Remote deleted a folder that still has local modifications beneath it.
pub struct RemoteFolderDeleted {
    pub context: OperationContext,
    /// Keys (in the side's event map) of the local child changes and the
    /// remote deletion events under this subtree, discarded on either
    /// decision.
    pub subtree_event_keys: Vec<String>,
}

impl Intervention for RemoteFolderDeleted {
    fn title(&self) -> String {
        "Folder deleted remotely but changed locally".to_string()
    }

    fn description(&self) -> String {
        let name = self
            .context
            .local
            .as_ref()
            .and_then(|p| p.file_name())
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "<unknown folder>".to_string());
        format!(
            "\"{}\" was deleted on the remote service but still has local changes underneath it.",
            name
        )
    }

    fn allowed_decisions(&self) -> Vec<Decision> {
        vec![Decision::RestoreFolder, Decision::Cancel]
    }

    fn default_decision(&self) -> Decision {
        Decision::Cancel
    }

    fn resolve(&self, decision: Decision) -> Result<Resolution, Error> {
        match decision {
            Decision::RestoreFolder => Ok(Resolution {
                operations: Vec::new(),
                request_fresh_sync: true,
                dropped_event_keys: self.subtree_event_keys.clone(),
            }),
            Decision::Cancel => Ok(Resolution {
                operations: Vec::new(),
                request_fresh_sync: false,
                dropped_event_keys: self.subtree_event_keys.clone(),
            }),
            other => Err(Error::UnexpectedError(format!(
                "Decision {:?} is not valid for RemoteFolderDeleted",
                other
            ))),
        }
    }
}

/// Resolves interventions via a user-supplied callback; falls back to each
/// intervention's own default decision when no callback is attached or the
/// callback returns something outside `allowed_decisions()`.
#[derive(Clone)]
pub struct InterventionBroker {
    callback: Option<Arc<dyn Fn(&dyn Intervention) -> Decision + Send + Sync>>,
}

impl InterventionBroker {
    pub fn new(callback: Arc<dyn Fn(&dyn Intervention) -> Decision + Send + Sync>) -> Self {
        Self {
            callback: Some(callback),
        }
    }

    /// No UI attached: every intervention auto-resolves to its default.
    pub fn headless() -> Self {
        Self { callback: None }
    }

    pub fn decide(&self, intervention: &dyn Intervention) -> Decision {
        let decision = match &self.callback {
            Some(callback) => callback(intervention),
            None => intervention.default_decision(),
        };
        if intervention.allowed_decisions().contains(&decision) {
            decision
        } else {
            log::warn!(
                "Intervention callback returned an invalid decision for \"{}\", using default",
                intervention.title()
            );
            intervention.default_decision()
        }
    }

    pub fn resolve(&self, intervention: &dyn Intervention) -> Result<Resolution, Error> {
        let decision = self.decide(intervention);
        intervention.resolve(decision)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bare_context() -> OperationContext {
        OperationContext::new(Some(PathBuf::from("/tmp/does-not-exist.txt")), None, None)
    }

    #[test]
    fn headless_broker_uses_default_decision() {
        let conflict = RemoteLocalFileConflict {
            context: bare_context(),
            local_event_type: EventType::Update,
            remote_event_type: EventType::Update,
        };
        let broker = InterventionBroker::headless();
        assert_eq!(broker.decide(&conflict), Decision::KeepBoth);
    }

    #[test]
    fn invalid_callback_decision_falls_back_to_default() {
        let deleted = RemoteFolderDeleted {
            context: bare_context(),
            subtree_event_keys: vec!["a/b/".to_string()],
        };
        let broker = InterventionBroker::new(Arc::new(|_: &dyn Intervention| Decision::KeepMine));
        assert_eq!(broker.decide(&deleted), Decision::Cancel);
    }

    #[test]
    fn cancel_drops_subtree_events_without_operations() {
        let deleted = RemoteFolderDeleted {
            context: bare_context(),
            subtree_event_keys: vec!["a/b/".to_string(), "a/b/c.txt".to_string()],
        };
        let resolution = deleted.resolve(Decision::Cancel).unwrap();
        assert!(resolution.operations.is_empty());
        assert!(!resolution.request_fresh_sync);
        assert_eq!(resolution.dropped_event_keys.len(), 2);
    }
}
