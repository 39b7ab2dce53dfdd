//! The staged work for one source changelist: per-revision intents, the
//! integration operations each carries, and the resolve directives the
//! workspace executor will apply.

use crate::client::records::{ChangeInfo, FileType};

/// What a staged resolve should do with an opened file.
///
/// One directive is applied per open file, through the session's resolver
/// contract.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IntegrationDirective {
    /// Take the integrated source as-is (clean branch/copy).
    AcceptTheirs,
    /// Keep the target content, recording the integration (ignored).
    AcceptYours,
    /// Take the engine's merge result (clean merge).
    AcceptMerged,
    /// Overwrite with explicit content fetched from the source revision
    /// (dirty merges/branches, edit-from records).
    AcceptEdit(Vec<u8>),
    /// Resolve an action (non-content) conflict with the named result.
    ActionResolve(String),
}

impl IntegrationDirective {
    /// Directives that finish with known content bytes in the workspace.
    pub fn content(&self) -> Option<&[u8]> {
        match self {
            IntegrationDirective::AcceptEdit(bytes) => Some(bytes),
            _ => None,
        }
    }
}

/// Which integrate flavor to request from the target server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntegrateKind {
    Branch,
    Copy,
    Merge,
    Ignore,
    Delete,
}

/// One staged integrate + resolve pair.
#[derive(Debug, Clone, PartialEq)]
pub struct StagedIntegration {
    /// Source-side partner path, for diagnostics.
    pub source_partner: String,
    /// Target-side partner path the integrate reads from.
    pub target_partner: String,
    /// Target-side revision range, exclusive start.
    pub start_rev: u32,
    pub end_rev: u32,
    pub kind: IntegrateKind,
    pub directive: IntegrationDirective,
    /// Set when the target's integration engine refused once already, or
    /// when the record kind needs force from the start (re-branch over a
    /// deleted head).
    pub force: bool,
}

/// The primary target-side operation for one revision.
#[derive(Debug, Clone, PartialEq)]
pub enum IntentAction {
    Add,
    Edit,
    Delete,
    /// A paired move; `from_target` is the move/delete side translated to
    /// the target.
    MovePair {
        from_source: String,
        from_target: String,
    },
    /// Integration-only revision (branch/copy/merge/ignore); the staged
    /// integrations carry the real work.
    Integrate,
}

impl IntentAction {
    /// Execution ordering within one change: deletes before re-adds,
    /// move pairs before plain content, integrations last so paired files
    /// already exist.
    pub fn stage_order(&self) -> u8 {
        match self {
            IntentAction::Delete => 0,
            IntentAction::MovePair { .. } => 1,
            IntentAction::Add | IntentAction::Edit => 2,
            IntentAction::Integrate => 3,
        }
    }
}

/// Everything the executor needs to reproduce one file revision.
#[derive(Debug, Clone, PartialEq)]
pub struct RevisionIntent {
    pub source_path: String,
    pub source_rev: u32,
    pub target_path: String,
    pub action: IntentAction,
    pub file_type: FileType,
    /// Staged in resolution order; the last directive wins the content.
    pub integrations: Vec<StagedIntegration>,
    /// Source content digest, for post-execution verification.
    pub digest: Option<String>,
    /// An edit pass is required after the integrations (dirty integrate).
    pub edit_after_integrate: bool,
    /// The source action was add on top of a deleted head; retry the open
    /// with the downgrade flag if the server refuses.
    pub re_add_after_delete: bool,
}

/// One source changelist staged for replication, built in memory and
/// discarded after the target change is submitted.
#[derive(Debug, Clone)]
pub struct ChangeRecord {
    pub source_change: u64,
    pub source_user: String,
    pub source_client: String,
    pub source_description: String,
    pub source_time: i64,
    pub intents: Vec<RevisionIntent>,
}

impl ChangeRecord {
    pub fn new(info: &ChangeInfo, intents: Vec<RevisionIntent>) -> ChangeRecord {
        ChangeRecord {
            source_change: info.number,
            source_user: info.user.clone(),
            source_client: info.client.clone(),
            source_description: info.description.clone(),
            source_time: info.time,
            intents,
        }
    }

    /// Intents in dependency order for staging.
    pub fn ordered_intents(&self) -> Vec<&RevisionIntent> {
        let mut ordered: Vec<&RevisionIntent> = self.intents.iter().collect();
        ordered.sort_by_key(|intent| intent.action.stage_order());
        ordered
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::records::FileType;

    fn intent(action: IntentAction, path: &str) -> RevisionIntent {
        RevisionIntent {
            source_path: path.to_string(),
            source_rev: 1,
            target_path: path.replace("inside", "import"),
            action,
            file_type: FileType::text(),
            integrations: Vec::new(),
            digest: None,
            edit_after_integrate: false,
            re_add_after_delete: false,
        }
    }

    /// Deletes stage first, then moves, content, integrations.
    #[test]
    fn staging_order_is_dependency_safe() {
        let record = ChangeRecord {
            source_change: 7,
            source_user: "alice".to_string(),
            source_client: "ws".to_string(),
            source_description: "mixed change".to_string(),
            source_time: 0,
            intents: vec![
                intent(IntentAction::Integrate, "//depot/inside/d"),
                intent(IntentAction::Add, "//depot/inside/a"),
                intent(IntentAction::Delete, "//depot/inside/b"),
                intent(
                    IntentAction::MovePair {
                        from_source: "//depot/inside/old".to_string(),
                        from_target: "//depot/import/old".to_string(),
                    },
                    "//depot/inside/new",
                ),
            ],
        };
        let order: Vec<u8> = record
            .ordered_intents()
            .iter()
            .map(|i| i.action.stage_order())
            .collect();
        assert_eq!(order, vec![0, 1, 2, 3]);
    }
}
