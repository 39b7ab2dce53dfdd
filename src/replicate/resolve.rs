//! Integration graph resolution: turn the integration records of one
//! source revision into the staged integrate + resolve operations that
//! reproduce the same lineage on the target.
//!
//! The records arrive in mirrored from/into pairs; only the "from" side of
//! the revision being reproduced is consumed here. For each record the
//! resolver translates the partner into the target namespace, maps the
//! source revision range onto target revision numbers (digest match first,
//! position second), and selects a resolve directive. Records whose partner
//! falls outside the view are dropped: silently when other records still
//! supply the content, with a promotion signal when they were the sole
//! source.

use tracing::{debug, warn};

use crate::client::records::{FileRevision, HowCode, IntegrationRecord};
use crate::client::{SourceSession, TargetSession};
use crate::errors::RelayError;
use crate::replicate::intent::{IntegrateKind, IntegrationDirective, StagedIntegration};
use crate::view::ViewMap;

/// The result of resolving one revision's records.
#[derive(Debug, Default)]
pub struct StagedSet {
    pub integrations: Vec<StagedIntegration>,
    /// The revision's only content-supplying record was dropped
    /// (out-of-scope partner, obliterated ancestor, unmappable revision);
    /// the classifier promotes the action instead.
    pub sole_source_dropped: bool,
}

impl StagedSet {
    pub fn is_empty(&self) -> bool {
        self.integrations.is_empty()
    }
}

/// Stage the integrations of `revision` against the target.
pub fn stage_integrations(
    revision: &FileRevision,
    view: &ViewMap,
    source: &mut dyn SourceSession,
    target: &mut dyn TargetSession,
) -> Result<StagedSet, RelayError> {
    let from_records: Vec<&IntegrationRecord> = revision
        .integrations
        .iter()
        .filter(|r| r.how.is_from())
        .collect();
    let content_sources = from_records
        .iter()
        .filter(|r| r.how.supplies_content())
        .count();

    let mut staged = Vec::new();
    let mut dropped_content_sources = 0usize;

    for record in &from_records {
        // Move pairing is handled by the classifier, not as a resolve.
        if record.how == HowCode::MovedFrom {
            continue;
        }
        let Some(target_partner) = view.to_target(&record.other_path) else {
            if record.how.supplies_content() {
                dropped_content_sources += 1;
                debug!(
                    path = %revision.depot_path,
                    rev = revision.rev,
                    partner = %record.other_path,
                    how = %record.how,
                    "integration partner out of scope"
                );
            }
            continue;
        };

        let Some((target_start, target_end)) =
            map_revision_range(record, source, target, &target_partner)?
        else {
            if record.how.supplies_content() {
                dropped_content_sources += 1;
            }
            warn!(
                path = %revision.depot_path,
                rev = revision.rev,
                partner = %record.other_path,
                how = %record.how,
                "cannot map partner revisions onto the target; dropping record"
            );
            continue;
        };

        let (kind, directive) =
            select_directive(revision, record, source, target, &target_partner, target_end)?;
        staged.push(StagedIntegration {
            source_partner: record.other_path.clone(),
            target_partner,
            start_rev: target_start,
            end_rev: target_end,
            kind,
            directive,
            force: false,
        });
    }

    // Stage so the last directive wins the content: copy/merge/branch
    // first, edit variants next, ignored last.
    staged.sort_by_key(|s| match (&s.kind, &s.directive) {
        (IntegrateKind::Ignore, _) => 2,
        (_, IntegrationDirective::AcceptEdit(_)) => 1,
        _ => 0,
    });

    Ok(StagedSet {
        integrations: staged,
        sole_source_dropped: content_sources > 0 && dropped_content_sources == content_sources,
    })
}

/// Map a record's source-side partner revision range onto target revision
/// numbers. Returns `None` when no target revision can be identified
/// (partner never replicated, pre-history, or obliterated on the source).
fn map_revision_range(
    record: &IntegrationRecord,
    source: &mut dyn SourceSession,
    target: &mut dyn TargetSession,
    target_partner: &str,
) -> Result<Option<(u32, u32)>, RelayError> {
    let target_log = target.filelog(target_partner)?;
    if target_log.is_empty() {
        return Ok(None);
    }
    let source_log = match source.filelog(&record.other_path) {
        Ok(log) => log,
        Err(RelayError::ObliteratedRevision { .. }) => Vec::new(),
        Err(RelayError::Server(_)) => Vec::new(),
        Err(other) => return Err(other),
    };

    let end = record.end_rev.max(1);
    let source_digest = source_log
        .get((end - 1) as usize)
        .and_then(|r| r.digest.as_deref());

    let mapped_end = match source_digest {
        Some(digest) => target_log
            .iter()
            .rev()
            .find(|r| r.digest.as_deref() == Some(digest))
            .map(|r| r.rev),
        None => None,
    };
    // Positional fallback: the target pre-existed or digests are absent.
    let mapped_end = mapped_end.or_else(|| {
        if end <= target_log.len() as u32 {
            Some(end)
        } else {
            None
        }
    });
    let Some(mapped_end) = mapped_end else {
        return Ok(None);
    };

    let span = record.end_rev.saturating_sub(record.start_rev);
    let mapped_start = mapped_end.saturating_sub(span);
    Ok(Some((mapped_start, mapped_end)))
}

/// Select the integrate flavor and resolve directive for one record,
/// upgrading clean branch/copy/merge records to explicit content when the
/// digests say the source revision was post-edited ("dirty").
fn select_directive(
    revision: &FileRevision,
    record: &IntegrationRecord,
    source: &mut dyn SourceSession,
    target: &mut dyn TargetSession,
    target_partner: &str,
    target_end: u32,
) -> Result<(IntegrateKind, IntegrationDirective), RelayError> {
    match record.how {
        HowCode::Ignored => Ok((IntegrateKind::Ignore, IntegrationDirective::AcceptYours)),
        HowCode::DeleteFrom => Ok((IntegrateKind::Delete, IntegrationDirective::AcceptTheirs)),
        HowCode::EditFrom => {
            let content = source.print(&revision.depot_path, revision.rev)?;
            Ok((IntegrateKind::Merge, IntegrationDirective::AcceptEdit(content)))
        }
        HowCode::BranchFrom | HowCode::CopyFrom | HowCode::AddFrom | HowCode::MergeFrom => {
            let kind = match record.how {
                HowCode::MergeFrom => IntegrateKind::Merge,
                HowCode::CopyFrom => IntegrateKind::Copy,
                _ => IntegrateKind::Branch,
            };
            let clean = if revision.digest.is_none() {
                // No digest to compare (ancient revision): trust the record.
                true
            } else {
                let partner_digest = target
                    .filelog(target_partner)?
                    .into_iter()
                    .find(|r| r.rev == target_end)
                    .and_then(|r| r.digest);
                partner_digest.as_deref() == revision.digest.as_deref()
            };
            if clean {
                let directive = if record.how == HowCode::MergeFrom {
                    IntegrationDirective::AcceptMerged
                } else {
                    IntegrationDirective::AcceptTheirs
                };
                Ok((kind, directive))
            } else {
                debug!(
                    path = %revision.depot_path,
                    rev = revision.rev,
                    how = %record.how,
                    "post-resolve content differs from partner; escalating to explicit content"
                );
                let content = source.print(&revision.depot_path, revision.rev)?;
                Ok((kind, IntegrationDirective::AcceptEdit(content)))
            }
        }
        // "into" codes and move records never reach this point.
        other => Err(RelayError::InvalidHowCode(other.to_string())),
    }
}
