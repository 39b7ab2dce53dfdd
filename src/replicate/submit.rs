//! Change submission: description templating, the submit retry policy and
//! the durable source→target marker.
//!
//! The description of every replicated change embeds
//! `Transferred from <sourcePort>@<sourceChange>`; that marker is the
//! source of truth for the change mapping and for recovery, so composing
//! and parsing it live side by side here.

use std::sync::OnceLock;
use std::thread;
use std::time::Duration;

use regex::Regex;
use tracing::{info, warn};

use crate::client::TargetSession;
use crate::errors::RelayError;
use crate::replicate::intent::ChangeRecord;

/// Default description template, applied when the configuration names none.
pub const DEFAULT_TEMPLATE: &str =
    "$sourceDescription\n\nTransferred from $sourcePort@$sourceChange";

fn marker_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"Transferred from (\S+)@(\d+)").expect("marker pattern is valid")
    })
}

/// Expand the description template for one change. Recognized variables
/// are `$sourceChange`, `$sourceUser`, `$sourceDescription` and
/// `$sourcePort`; anything else stays literal.
pub fn compose_description(
    template: Option<&str>,
    record: &ChangeRecord,
    source_port: &str,
) -> String {
    template
        .unwrap_or(DEFAULT_TEMPLATE)
        .replace("$sourceDescription", record.source_description.trim_end())
        .replace("$sourceChange", &record.source_change.to_string())
        .replace("$sourceUser", &record.source_user)
        .replace("$sourcePort", source_port)
}

/// Extract the source marker from a target change description. When the
/// source description itself carried a marker (chained transfers), the
/// last one is ours.
pub fn parse_marker(description: &str) -> Option<(String, u64)> {
    let captures = marker_pattern()
        .captures_iter(description)
        .last()?;
    let port = captures.get(1)?.as_str().to_string();
    let change = captures.get(2)?.as_str().parse().ok()?;
    Some((port, change))
}

/// Submit a staged pending change, handling the two recoverable failure
/// shapes: keyword digest mismatches (reopen without keywords, resubmit)
/// and trigger rejections (bounded backoff).
pub fn submit_with_retries(
    target: &mut dyn TargetSession,
    pending: u64,
    record: &ChangeRecord,
    retries: u64,
) -> Result<u64, RelayError> {
    let mut attempt = 0u64;
    loop {
        match target.submit(pending) {
            Ok(submitted) => {
                info!(
                    source_change = record.source_change,
                    target_change = submitted,
                    "submitted"
                );
                return Ok(submitted);
            }
            Err(RelayError::KeywordDigestMismatch { path }) => {
                // Not counted against the retry budget: the reopen changes
                // the staged state, it does not repeat it.
                warn!(%path, "keyword digest mismatch; reopening without keyword expansion");
                target.reopen_nokeywords(pending, &path)?;
            }
            Err(RelayError::TriggerRejection(detail)) => {
                attempt += 1;
                if attempt > retries {
                    return Err(RelayError::SubmitFailed {
                        source_change: record.source_change,
                        detail,
                    });
                }
                warn!(
                    attempt,
                    retries, detail, "submit rejected by trigger; backing off"
                );
                thread::sleep(Duration::from_millis(250 * attempt));
            }
            Err(other) => {
                return Err(RelayError::SubmitFailed {
                    source_change: record.source_change,
                    detail: other.to_string(),
                });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::memory::MemoryServer;
    use crate::client::records::FileType;

    fn record() -> ChangeRecord {
        ChangeRecord {
            source_change: 42,
            source_user: "alice".to_string(),
            source_client: "ws".to_string(),
            source_description: "fix the frobnicator\n".to_string(),
            source_time: 0,
            intents: Vec::new(),
        }
    }

    /// The default template appends the marker to the source description.
    #[test]
    fn default_template_appends_marker() {
        let description = compose_description(None, &record(), "src:1666");
        assert_eq!(
            description,
            "fix the frobnicator\n\nTransferred from src:1666@42"
        );
        assert_eq!(
            parse_marker(&description),
            Some(("src:1666".to_string(), 42))
        );
    }

    /// Unrecognized variables stay literal.
    #[test]
    fn unknown_variables_stay_literal() {
        let description = compose_description(
            Some("$sourceUser did $sourceChange ($fred)"),
            &record(),
            "src:1666",
        );
        assert_eq!(description, "alice did 42 ($fred)");
    }

    /// A chained transfer keeps one unambiguous marker: the last.
    #[test]
    fn chained_marker_takes_last() {
        let description =
            "original\n\nTransferred from far:1666@7\n\nTransferred from src:1666@42";
        assert_eq!(
            parse_marker(description),
            Some(("src:1666".to_string(), 42))
        );
        assert_eq!(parse_marker("no marker here"), None);
    }

    /// Trigger rejections retry with bounded attempts.
    #[test]
    fn trigger_rejection_retries_then_fails() {
        let mut target = MemoryServer::new("targ:1666");
        target
            .write_workspace_file("//depot/import/f", b"x\n")
            .unwrap();
        let pending = target.create_change("try").unwrap();
        target
            .open_add(pending, "//depot/import/f", &FileType::text(), false)
            .unwrap();
        target.reject_submits(1);
        let submitted = submit_with_retries(&mut target, pending, &record(), 3).unwrap();
        assert!(submitted > 0);

        // Exhausted budget surfaces as a submit failure.
        let mut target = MemoryServer::new("targ:1666");
        target
            .write_workspace_file("//depot/import/f", b"x\n")
            .unwrap();
        let pending = target.create_change("try").unwrap();
        target
            .open_add(pending, "//depot/import/f", &FileType::text(), false)
            .unwrap();
        target.reject_submits(10);
        let error = submit_with_retries(&mut target, pending, &record(), 2).unwrap_err();
        assert!(matches!(
            error,
            RelayError::SubmitFailed {
                source_change: 42,
                ..
            }
        ));
    }

    /// A keyword digest mismatch reopens the file and resubmits.
    #[test]
    fn keyword_mismatch_reopens_and_resubmits() {
        let mut target = MemoryServer::new("targ:1666");
        let keyworded: FileType = "text+k".parse().unwrap();
        target
            .write_workspace_file("//depot/import/k", b"$Id$\n")
            .unwrap();
        let pending = target.create_change("keyworded").unwrap();
        target
            .open_add(pending, "//depot/import/k", &keyworded, false)
            .unwrap();
        target.fail_keyword_digest("//depot/import/k");
        let submitted = submit_with_retries(&mut target, pending, &record(), 3).unwrap();
        assert!(submitted > 0);
    }
}
