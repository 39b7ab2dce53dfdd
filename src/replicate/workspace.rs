//! The workspace executor: stages one `ChangeRecord` against a freshly
//! reverted target workspace.
//!
//! Operations run in dependency order (deletes, move pairs, content,
//! integrations). Each staged operation carries its own fallback: forced
//! re-integrate when the target engine refuses a record, delete + add when
//! the server cannot move, explicit content when an ancestor is gone. After
//! staging, the opened set is verified against the intents and every
//! content-bearing file is digest-checked against the source.

use tracing::{debug, warn};

use crate::client::records::FileType;
use crate::client::{Capabilities, IntegrateRequest, SourceSession, TargetSession};
use crate::digest::canonical_digest;
use crate::errors::RelayError;
use crate::replicate::intent::{
    ChangeRecord, IntegrateKind, IntentAction, RevisionIntent, StagedIntegration,
};

/// Stage the whole change into a new pending change and return its number.
/// Nothing is submitted here.
pub fn stage_change(
    source: &mut dyn SourceSession,
    target: &mut dyn TargetSession,
    record: &ChangeRecord,
    description: &str,
    capabilities: &Capabilities,
) -> Result<u64, RelayError> {
    target.revert_all()?;
    let change = target.create_change(description)?;
    for intent in record.ordered_intents() {
        stage_intent(source, target, change, intent, capabilities)?;
    }
    verify_opened(target, change, record)?;
    Ok(change)
}

fn fetch_content(
    source: &mut dyn SourceSession,
    intent: &RevisionIntent,
) -> Result<Vec<u8>, RelayError> {
    source.print(&intent.source_path, intent.source_rev)
}

/// Open for add, honoring the commit-server exclusive-lock ordering and
/// the downgrade retry for re-adds the server refuses.
fn open_add_with_fallbacks(
    target: &mut dyn TargetSession,
    change: u64,
    intent: &RevisionIntent,
    capabilities: &Capabilities,
) -> Result<(), RelayError> {
    let late_exclusive = capabilities.commit_server && intent.file_type.exclusive;
    let open_type: FileType = if late_exclusive {
        intent.file_type.without_exclusive()
    } else {
        intent.file_type.clone()
    };
    let first = target.open_add(change, &intent.target_path, &open_type, false);
    if first.is_err() {
        debug!(
            path = %intent.target_path,
            re_add = intent.re_add_after_delete,
            "add refused; retrying with downgrade"
        );
        target.open_add(change, &intent.target_path, &open_type, true)?;
    }
    if late_exclusive {
        target.reopen_type(change, &intent.target_path, &intent.file_type)?;
    }
    Ok(())
}

fn stage_intent(
    source: &mut dyn SourceSession,
    target: &mut dyn TargetSession,
    change: u64,
    intent: &RevisionIntent,
    capabilities: &Capabilities,
) -> Result<(), RelayError> {
    match &intent.action {
        IntentAction::Delete => {
            if intent.integrations.is_empty() {
                return target.open_delete(change, &intent.target_path);
            }
            if let Err(error) = stage_integrations(target, change, intent) {
                warn!(
                    path = %intent.target_path,
                    %error,
                    "delete integration failed; degrading to plain delete"
                );
                target.open_delete(change, &intent.target_path)?;
            }
            Ok(())
        }
        IntentAction::MovePair {
            from_target,
            from_source: _,
        } => {
            let head = target.filelog(from_target)?.len() as u32;
            target.sync_file(from_target, head)?;
            target.open_edit(change, from_target)?;
            match target.open_move(change, from_target, &intent.target_path) {
                Ok(()) => {}
                Err(RelayError::MoveRefused { detail, .. }) => {
                    warn!(
                        from = %from_target,
                        to = %intent.target_path,
                        detail,
                        "server refused move; falling back to delete + add"
                    );
                    target.revert_file(from_target)?;
                    target.open_delete(change, from_target)?;
                    open_add_with_fallbacks(target, change, intent, capabilities)?;
                }
                Err(other) => return Err(other),
            }
            let content = fetch_content(source, intent)?;
            target.write_workspace_file(&intent.target_path, &content)?;
            ensure_file_type(target, change, intent)?;
            Ok(())
        }
        IntentAction::Add => {
            let content = fetch_content(source, intent)?;
            target.write_workspace_file(&intent.target_path, &content)?;
            open_add_with_fallbacks(target, change, intent, capabilities)?;
            if !intent.integrations.is_empty() {
                stage_integrations(target, change, intent)?;
            }
            verify_content(source, target, intent)
        }
        IntentAction::Edit => {
            let head = target.filelog(&intent.target_path)?.len() as u32;
            target.sync_file(&intent.target_path, head)?;
            if intent.integrations.is_empty() {
                target.open_edit(change, &intent.target_path)?;
                let content = fetch_content(source, intent)?;
                target.write_workspace_file(&intent.target_path, &content)?;
            } else {
                // Integrations carry the content; a residual mismatch is
                // patched by the digest check below.
                stage_integrations(target, change, intent)?;
            }
            ensure_file_type(target, change, intent)?;
            verify_content(source, target, intent)
        }
        IntentAction::Integrate => {
            let head = target.filelog(&intent.target_path)?.len() as u32;
            if head > 0 {
                target.sync_file(&intent.target_path, head)?;
            }
            if let Err(error) = stage_integrations(target, change, intent) {
                // Obliterated or refused ancestry: materialize from content.
                warn!(
                    path = %intent.target_path,
                    %error,
                    "integration failed; materializing from content"
                );
                target.revert_file(&intent.target_path)?;
                let content = fetch_content(source, intent)?;
                target.write_workspace_file(&intent.target_path, &content)?;
                let head_deleted = target
                    .filelog(&intent.target_path)?
                    .last()
                    .is_none_or(|r| r.action.is_delete());
                if head == 0 || head_deleted {
                    open_add_with_fallbacks(target, change, intent, capabilities)?;
                } else {
                    target.open_edit(change, &intent.target_path)?;
                }
            }
            ensure_file_type(target, change, intent)?;
            verify_content(source, target, intent)
        }
    }
}

/// Run the staged integrate + resolve pairs of one intent, retrying each
/// refused integrate once with the force flag.
fn stage_integrations(
    target: &mut dyn TargetSession,
    change: u64,
    intent: &RevisionIntent,
) -> Result<(), RelayError> {
    for staged in &intent.integrations {
        integrate_one(target, change, &intent.target_path, staged)?;
        target.resolve(&intent.target_path, &staged.directive)?;
    }
    Ok(())
}

fn integrate_one(
    target: &mut dyn TargetSession,
    change: u64,
    target_path: &str,
    staged: &StagedIntegration,
) -> Result<(), RelayError> {
    let mut request = IntegrateRequest {
        from_path: staged.target_partner.clone(),
        to_path: target_path.to_string(),
        start_rev: staged.start_rev,
        end_rev: staged.end_rev,
        force: staged.force,
        for_delete: staged.kind == IntegrateKind::Delete,
    };
    match target.integrate(change, &request) {
        Ok(()) => Ok(()),
        Err(RelayError::IntegrateRefused { detail, .. }) if !request.force => {
            debug!(
                from = %request.from_path,
                to = %request.to_path,
                detail,
                "integrate refused; restaging with force"
            );
            request.force = true;
            target.integrate(change, &request)
        }
        Err(other) => Err(other),
    }
}

/// Reopen with the source revision's type when the open landed with a
/// different one. Applied at most once per file.
fn ensure_file_type(
    target: &mut dyn TargetSession,
    change: u64,
    intent: &RevisionIntent,
) -> Result<(), RelayError> {
    let current = target
        .filelog(&intent.target_path)?
        .last()
        .map(|r| r.file_type.clone());
    if current.as_ref() != Some(&intent.file_type) {
        target.reopen_type(change, &intent.target_path, &intent.file_type)?;
    }
    Ok(())
}

/// Compare the staged workspace content against the source digest and
/// overwrite with explicit content when they disagree.
fn verify_content(
    source: &mut dyn SourceSession,
    target: &mut dyn TargetSession,
    intent: &RevisionIntent,
) -> Result<(), RelayError> {
    let Some(expected) = intent.digest.as_deref() else {
        return Ok(());
    };
    let keyword = intent.file_type.keyword_expansion();
    let staged = target.read_workspace_file(&intent.target_path).ok();
    let matches = staged
        .as_deref()
        .is_some_and(|bytes| canonical_digest(bytes, keyword).0 == expected);
    if !matches {
        warn!(
            path = %intent.target_path,
            "staged content does not match the source digest; overwriting"
        );
        let content = fetch_content(source, intent)?;
        target.write_workspace_file(&intent.target_path, &content)?;
    }
    Ok(())
}

/// The opened set must equal the intended set: missing opens are a
/// failure, extra opens are reverted.
fn verify_opened(
    target: &mut dyn TargetSession,
    change: u64,
    record: &ChangeRecord,
) -> Result<(), RelayError> {
    let mut intended: Vec<&str> = Vec::new();
    for intent in &record.intents {
        intended.push(&intent.target_path);
        if let IntentAction::MovePair { from_target, .. } = &intent.action {
            intended.push(from_target);
        }
    }

    let opened: Vec<String> = target
        .opened(change)?
        .map(|open| open.depot_path)
        .collect();
    for extra in opened.iter().filter(|o| !intended.contains(&o.as_str())) {
        warn!(path = %extra, "unexpected open; reverting");
        target.revert_file(extra)?;
    }
    let missing: Vec<&&str> = intended
        .iter()
        .filter(|i| !opened.iter().any(|o| o == **i))
        .collect();
    if !missing.is_empty() {
        return Err(RelayError::OpenedSetMismatch(format!(
            "missing opens for {missing:?} in change {change}"
        )));
    }
    Ok(())
}
