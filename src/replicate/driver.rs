//! The replication loop: one change at a time, counter forward, in
//! strictly increasing source-change order.
//!
//! The loop is single-threaded and cooperative; its only suspension points
//! are the server round trips. The persistent high-water counter on the
//! target is the sole serializing lock; two loops against the same
//! counter are unsafe and unsupported.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use chrono::Local;
use tracing::{debug, info, warn};

use crate::client::{Capabilities, SourceSession, TargetSession};
use crate::config::Config;
use crate::errors::RelayError;
use crate::logging::RotatingWriter;
use crate::replicate::changemap::{ChangeMapAppender, ChangeMapEntry};
use crate::replicate::classify::classify;
use crate::replicate::intent::ChangeRecord;
use crate::replicate::setup::run_setup;
use crate::replicate::submit::{compose_description, submit_with_retries};
use crate::replicate::workspace::stage_change;
use crate::view::ViewMap;

/// Command-line overrides layered on top of the configuration.
#[derive(Debug, Default, Clone)]
pub struct DriverOptions {
    /// Stop after this many replicated changes.
    pub max_changes: Option<u64>,
    /// Treat any submit failure as fatal (exit status 1).
    pub stop_on_error: bool,
    /// Strip keyword expansion from every replicated file type.
    pub nokeywords: bool,
    /// Override for the configured reconnect frequency.
    pub reset_connection: Option<u64>,
    /// Override for the configured wall-clock cutoff.
    pub end_datetime: Option<chrono::NaiveDateTime>,
}

/// Counts reported at batch boundaries and at the end of a run.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RunSummary {
    /// Source changes that produced a target change.
    pub transferred: u64,
    /// Source changes that advanced the counter without a target change.
    pub skipped: u64,
}

/// The replication driver. Owns no connections; both sessions are borrowed
/// for the duration of the run.
pub struct Replicator<'a> {
    config: &'a Config,
    source: &'a mut dyn SourceSession,
    target: &'a mut dyn TargetSession,
    options: DriverOptions,
    log: Option<RotatingWriter>,
    stop: Arc<AtomicBool>,
}

impl<'a> Replicator<'a> {
    pub fn new(
        config: &'a Config,
        source: &'a mut dyn SourceSession,
        target: &'a mut dyn TargetSession,
        options: DriverOptions,
    ) -> Replicator<'a> {
        Replicator {
            config,
            source,
            target,
            options,
            log: None,
            stop: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Attach the log writer rotated at batch boundaries.
    pub fn with_log(mut self, log: Option<RotatingWriter>) -> Replicator<'a> {
        self.log = log;
        self
    }

    /// A handle external code may set to stop the loop between changes.
    pub fn stop_flag(&self) -> Arc<AtomicBool> {
        self.stop.clone()
    }

    /// Run until the source is exhausted (or the poll cutoff is reached).
    pub fn run(&mut self) -> Result<RunSummary, RelayError> {
        let setup = run_setup(self.config, self.source, self.target)?;
        let view = setup.view;
        let capabilities = setup.capabilities;
        let mut counter = setup.starting_counter;

        let batch_size = self.config.change_batch_size()?.max(1);
        let retries = self.config.retries()?;
        let poll_interval = self.config.poll_interval()?;
        let report_interval = Duration::from_secs(self.config.report_interval()?);
        let mut last_report = std::time::Instant::now();
        let reset_every = match self.options.reset_connection {
            Some(n) => Some(n),
            None => self.config.reset_connection()?,
        };
        let end_datetime = match self.options.end_datetime {
            Some(dt) => Some(dt),
            None => self.config.end_datetime()?,
        };
        let ignore_filters = self.config.ignore_filters();
        let mut change_map = self
            .config
            .change_map_file
            .as_deref()
            .map(|file| ChangeMapAppender::new(file, &view))
            .transpose()?;

        let mut summary = RunSummary::default();
        let mut in_batch = 0u64;

        loop {
            if self.stop.load(Ordering::Relaxed) {
                info!("stop requested; ending run");
                break;
            }
            if let Some(cutoff) = end_datetime
                && Local::now().naive_local() >= cutoff
            {
                info!(%cutoff, "end datetime reached; ending run");
                break;
            }
            if let Some(max) = self.options.max_changes
                && summary.transferred >= max
            {
                info!(max, "max changes reached; ending run");
                break;
            }

            let pending = self.source.changes_in_view(counter)?;
            let Some(&next) = pending.first() else {
                match poll_interval {
                    Some(seconds) if !self.stop.load(Ordering::Relaxed) => {
                        if let Some(map) = change_map.as_mut() {
                            map.flush(self.target)?;
                        }
                        debug!(seconds, "nothing to do; polling");
                        thread::sleep(Duration::from_secs(seconds));
                        continue;
                    }
                    _ => break,
                }
            };

            match self.replicate_one(next, &view, &capabilities, &ignore_filters, retries) {
                Ok(Some(target_change)) => {
                    counter = next;
                    self.write_counter(counter)?;
                    summary.transferred += 1;
                    in_batch += 1;
                    if let Some(map) = change_map.as_mut() {
                        map.record(ChangeMapEntry {
                            source_port: self.source.port().to_string(),
                            source_change: next,
                            target_change,
                        });
                    }
                }
                Ok(None) => {
                    // Nothing in scope: the counter still moves.
                    counter = next;
                    self.write_counter(counter)?;
                    summary.skipped += 1;
                }
                Err(error) if self.options.stop_on_error => return Err(error),
                Err(error) if error.is_transient() && poll_interval.is_some() => {
                    warn!(%error, change = next, "change failed; will retry after poll interval");
                    thread::sleep(Duration::from_secs(poll_interval.unwrap_or(60)));
                    continue;
                }
                Err(error) => return Err(error),
            }

            if last_report.elapsed() >= report_interval {
                self.report_batch(&summary);
                last_report = std::time::Instant::now();
            }
            if in_batch >= batch_size {
                self.report_batch(&summary);
                if let Some(map) = change_map.as_mut() {
                    map.flush(self.target)?;
                }
                if let Some(log) = &self.log {
                    let index = log.rotate()?;
                    info!(index, "rotated log file");
                }
                in_batch = 0;
            }
            if let Some(every) = reset_every
                && every > 0
                && (summary.transferred + summary.skipped) % every == 0
            {
                debug!("resetting connections");
                self.source.reset()?;
                self.target.reset()?;
            }
        }

        if let Some(map) = change_map.as_mut() {
            map.flush(self.target)?;
        }
        self.report_batch(&summary);
        Ok(summary)
    }

    /// Replicate one source change. `Ok(None)` means nothing was in scope.
    fn replicate_one(
        &mut self,
        change: u64,
        view: &ViewMap,
        capabilities: &Capabilities,
        ignore_filters: &[regex::Regex],
        retries: u64,
    ) -> Result<Option<u64>, RelayError> {
        let info = self.source.describe(change)?;
        debug!(
            change,
            files = info.revisions.len(),
            user = %info.user,
            "replicating"
        );

        let mut intents = Vec::new();
        for revision in &info.revisions {
            if let Some(mut intent) =
                classify(revision, view, ignore_filters, self.source, self.target)?
            {
                if self.options.nokeywords {
                    intent.file_type = intent.file_type.without_keyword();
                }
                intents.push(intent);
            }
        }
        if intents.is_empty() {
            info!(change, "no revisions in scope; advancing counter only");
            return Ok(None);
        }

        let record = ChangeRecord::new(&info, intents);
        let description = compose_description(
            self.config.change_description_format.as_deref(),
            &record,
            self.source.port(),
        );
        let pending = stage_change(self.source, self.target, &record, &description, capabilities)?;
        let submitted = submit_with_retries(self.target, pending, &record, retries)?;
        self.post_submit_verify(&record, submitted);
        Ok(Some(submitted))
    }

    fn write_counter(&mut self, value: u64) -> Result<(), RelayError> {
        self.target
            .set_counter(&self.config.counter_name, value, self.config.is_superuser())
    }

    /// Compare submitted head digests against the source. Mismatches are
    /// logged, never rolled back.
    fn post_submit_verify(&mut self, record: &ChangeRecord, target_change: u64) {
        for intent in &record.intents {
            let Some(expected) = intent.digest.as_deref() else {
                continue;
            };
            let submitted = match self.target.filelog(&intent.target_path) {
                Ok(log) => log.into_iter().next_back(),
                Err(_) => None,
            };
            let submitted_digest = submitted.and_then(|r| r.digest);
            if let Some(actual) = submitted_digest
                && actual != expected
            {
                warn!(
                    path = %intent.target_path,
                    target_change,
                    expected,
                    actual,
                    "post-submit digest mismatch"
                );
            }
        }
    }

    fn report_batch(&self, summary: &RunSummary) {
        info!(
            transferred = summary.transferred,
            skipped = summary.skipped,
            "batch summary"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::memory::MemoryServer;
    use crate::client::records::FileType;
    use crate::config::{ServerConfig, ViewEntry};
    use std::path::PathBuf;

    fn config() -> Config {
        Config {
            source: ServerConfig {
                p4port: "src:1666".to_string(),
                p4user: "transfer".to_string(),
                p4client: "transfer".to_string(),
            },
            target: ServerConfig {
                p4port: "targ:1666".to_string(),
                p4user: "transfer".to_string(),
                p4client: "transfer".to_string(),
            },
            workspace_root: PathBuf::from("/tmp/depot-relay-driver-ws"),
            transfer_client: "transfer".to_string(),
            logfile: None,
            counter_name: "depot_relay".to_string(),
            views: vec![ViewEntry {
                src: "//depot/inside/...".to_string(),
                targ: "//depot/import/...".to_string(),
            }],
            stream_views: Vec::new(),
            transfer_target_stream: None,
            historical_start_change: None,
            change_batch_size: "1000".to_string(),
            change_description_format: None,
            change_map_file: None,
            ignore_files: Vec::new(),
            case_sensitive: true,
            poll_interval: None,
            report_interval: "30".to_string(),
            retries: "3".to_string(),
            superuser: "y".to_string(),
            reset_connection: None,
            end_datetime: None,
        }
    }

    #[test]
    fn basic_add_advances_counter() {
        let config = config();
        let mut source = MemoryServer::new("src:1666");
        let mut target = MemoryServer::new("targ:1666");
        let change = source.seed_add("//depot/inside/inside_file1", FileType::text(), b"hello\n");

        let summary = Replicator::new(
            &config,
            &mut source,
            &mut target,
            DriverOptions::default(),
        )
        .run()
        .unwrap();

        assert_eq!(summary.transferred, 1);
        assert_eq!(target.counter_value("depot_relay"), change);
        assert_eq!(
            target.head_content("//depot/import/inside_file1").unwrap(),
            b"hello\n"
        );
    }

    /// Running again with no source activity is an idempotent tail.
    #[test]
    fn idempotent_tail() {
        let config = config();
        let mut source = MemoryServer::new("src:1666");
        let mut target = MemoryServer::new("targ:1666");
        source.seed_add("//depot/inside/file1", FileType::text(), b"x\n");

        Replicator::new(&config, &mut source, &mut target, DriverOptions::default())
            .run()
            .unwrap();
        let counter = target.counter_value("depot_relay");
        let changes = target.submitted_changes().len();

        let summary =
            Replicator::new(&config, &mut source, &mut target, DriverOptions::default())
                .run()
                .unwrap();
        assert_eq!(summary.transferred, 0);
        assert_eq!(target.counter_value("depot_relay"), counter);
        assert_eq!(target.submitted_changes().len(), changes);
    }

    /// max_changes bounds the run.
    #[test]
    fn max_changes_stops_early() {
        let config = config();
        let mut source = MemoryServer::new("src:1666");
        let mut target = MemoryServer::new("targ:1666");
        source.seed_add("//depot/inside/a", FileType::text(), b"1\n");
        source.seed_edit("//depot/inside/a", b"2\n");
        source.seed_edit("//depot/inside/a", b"3\n");

        let options = DriverOptions {
            max_changes: Some(2),
            ..DriverOptions::default()
        };
        let summary = Replicator::new(&config, &mut source, &mut target, options)
            .run()
            .unwrap();
        assert_eq!(summary.transferred, 2);
    }

    /// ignore_files skips revisions but still advances the counter.
    #[test]
    fn ignored_change_advances_counter_without_target_change() {
        let mut config = config();
        config.ignore_files = vec![r"\.tmp$".to_string()];
        let mut source = MemoryServer::new("src:1666");
        let mut target = MemoryServer::new("targ:1666");
        let skipped = source.seed_add("//depot/inside/scratch.tmp", FileType::text(), b"x\n");

        let summary =
            Replicator::new(&config, &mut source, &mut target, DriverOptions::default())
                .run()
                .unwrap();
        assert_eq!(summary.transferred, 0);
        assert_eq!(summary.skipped, 1);
        assert_eq!(target.counter_value("depot_relay"), skipped);
        assert!(target.submitted_changes().is_empty());
    }

    /// Connections reset every N processed changes.
    #[test]
    fn connections_reset_on_schedule() {
        let mut config = config();
        config.reset_connection = Some("2".to_string());
        let mut source = MemoryServer::new("src:1666");
        let mut target = MemoryServer::new("targ:1666");
        source.seed_add("//depot/inside/a", FileType::text(), b"1\n");
        source.seed_edit("//depot/inside/a", b"2\n");
        source.seed_edit("//depot/inside/a", b"3\n");
        source.seed_edit("//depot/inside/a", b"4\n");

        Replicator::new(&config, &mut source, &mut target, DriverOptions::default())
            .run()
            .unwrap();
        assert_eq!(source.reset_count(), 2);
        assert_eq!(target.reset_count(), 2);
    }
}
