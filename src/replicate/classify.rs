//! Revision classification: from one source file revision to the target
//! action that reproduces it, with the staged integrations attached.
//!
//! The classification follows the head action after all integration records
//! have been considered. Degradations (out-of-scope move partners, dropped
//! integration sources, archived ancestors) happen here and each leaves a
//! log line behind.

use regex::Regex;
use tracing::{debug, warn};

use crate::client::records::{FileAction, FileRevision, HowCode};
use crate::client::{SourceSession, TargetSession};
use crate::errors::RelayError;
use crate::replicate::intent::{IntentAction, RevisionIntent};
use crate::replicate::resolve::stage_integrations;
use crate::view::ViewMap;

/// Classify one revision of one change. Returns `None` when the revision
/// contributes nothing to the target change.
pub fn classify(
    revision: &FileRevision,
    view: &ViewMap,
    ignore_filters: &[Regex],
    source: &mut dyn SourceSession,
    target: &mut dyn TargetSession,
) -> Result<Option<RevisionIntent>, RelayError> {
    if ignore_filters
        .iter()
        .any(|re| re.is_match(&revision.depot_path))
    {
        debug!(path = %revision.depot_path, "revision matches ignore_files; skipping");
        return Ok(None);
    }
    if !view.in_scope(&revision.depot_path) {
        return Ok(None);
    }
    let target_path = view
        .to_target(&revision.depot_path)
        .ok_or_else(|| RelayError::InvalidDepotPath(revision.depot_path.clone()))?;

    let intent = |action: IntentAction| RevisionIntent {
        source_path: revision.depot_path.clone(),
        source_rev: revision.rev,
        target_path: target_path.clone(),
        action,
        file_type: revision.file_type.clone(),
        integrations: Vec::new(),
        digest: revision.digest.clone(),
        edit_after_integrate: false,
        re_add_after_delete: false,
    };

    match revision.action {
        FileAction::Purge => {
            debug!(path = %revision.depot_path, rev = revision.rev, "purged revision; not replicated");
            Ok(None)
        }
        FileAction::Archive => {
            // An archived revision may still be named by later integration
            // records; those degrade through the resolver when they hit it.
            warn!(
                path = %revision.depot_path,
                rev = revision.rev,
                "archived revision skipped; later integrations from it will degrade"
            );
            Ok(None)
        }
        FileAction::MoveDelete => {
            let partner = revision
                .integrations
                .iter()
                .find(|r| r.how == HowCode::MovedInto)
                .map(|r| r.other_path.clone());
            match partner {
                Some(partner) if view.in_scope(&partner) => {
                    // Replicated as a pair from the move/add side.
                    Ok(None)
                }
                _ => {
                    warn!(
                        path = %revision.depot_path,
                        "move partner out of scope; degrading to delete"
                    );
                    Ok(Some(intent(IntentAction::Delete)))
                }
            }
        }
        FileAction::MoveAdd => {
            let partner = revision
                .integrations
                .iter()
                .find(|r| r.how == HowCode::MovedFrom)
                .map(|r| r.other_path.clone());
            match partner {
                Some(partner) if view.in_scope(&partner) => {
                    let from_target = view
                        .to_target(&partner)
                        .ok_or_else(|| RelayError::InvalidDepotPath(partner.clone()))?;
                    Ok(Some(intent(IntentAction::MovePair {
                        from_source: partner,
                        from_target,
                    })))
                }
                _ => {
                    warn!(
                        path = %revision.depot_path,
                        "move partner out of scope; degrading to add"
                    );
                    Ok(Some(intent(IntentAction::Add)))
                }
            }
        }
        FileAction::Delete => {
            let staged = stage_integrations(revision, view, source, target)?;
            let mut delete = intent(IntentAction::Delete);
            delete.integrations = staged.integrations;
            Ok(Some(delete))
        }
        FileAction::Add | FileAction::Import => {
            let staged = stage_integrations(revision, view, source, target)?;
            let mut add = intent(IntentAction::Add);
            add.integrations = staged.integrations;
            add.re_add_after_delete = revision.rev > 1;
            Ok(Some(add))
        }
        FileAction::Edit => {
            let staged = stage_integrations(revision, view, source, target)?;
            let mut edit = intent(IntentAction::Edit);
            edit.edit_after_integrate = !staged.is_empty();
            edit.integrations = staged.integrations;
            Ok(Some(edit))
        }
        FileAction::Branch => {
            let staged = stage_integrations(revision, view, source, target)?;
            if staged.is_empty() {
                if staged.sole_source_dropped {
                    warn!(
                        path = %revision.depot_path,
                        rev = revision.rev,
                        "branch source unavailable; promoting to add"
                    );
                }
                let mut add = intent(IntentAction::Add);
                add.re_add_after_delete = revision.rev > 1;
                return Ok(Some(add));
            }
            let mut integrate = intent(IntentAction::Integrate);
            integrate.integrations = staged.integrations;
            Ok(Some(integrate))
        }
        FileAction::Integrate => {
            let staged = stage_integrations(revision, view, source, target)?;
            if staged.is_empty() {
                if staged.sole_source_dropped {
                    warn!(
                        path = %revision.depot_path,
                        rev = revision.rev,
                        "integration source unavailable; degrading to content"
                    );
                }
                // First revision of the path materializes as an add, later
                // ones as an edit.
                let action = if revision.rev == 1 {
                    IntentAction::Add
                } else {
                    IntentAction::Edit
                };
                let mut degraded = intent(action);
                degraded.re_add_after_delete = revision.rev > 1;
                return Ok(Some(degraded));
            }
            let mut integrate = intent(IntentAction::Integrate);
            integrate.integrations = staged.integrations;
            Ok(Some(integrate))
        }
    }
}
