//! Start-of-run setup: workspace provisioning on both servers, stream
//! realization, the capability probe, pending-change reclamation and the
//! starting counter computation.

use tracing::{info, warn};

use crate::client::records::StreamSpec;
use crate::client::{Capabilities, SourceSession, TargetSession};
use crate::config::Config;
use crate::errors::RelayError;
use crate::replicate::submit::parse_marker;
use crate::view::{ViewMap, wildcard_translate};

/// Everything the driver needs after setup succeeded.
#[derive(Debug)]
pub struct SetupOutcome {
    pub view: ViewMap,
    pub capabilities: Capabilities,
    pub starting_counter: u64,
}

/// Validate, provision and probe. Fatal errors here never touch the
/// counter.
pub fn run_setup(
    config: &Config,
    source: &mut dyn SourceSession,
    target: &mut dyn TargetSession,
) -> Result<SetupOutcome, RelayError> {
    config.validate()?;
    std::fs::create_dir_all(&config.workspace_root)?;

    source.connect()?;
    target.connect()?;

    let view = if !config.views.is_empty() {
        ViewMap::classical(&config.views, config.case_sensitive)?
    } else {
        provision_streams(config, source, target)?;
        ViewMap::streams(&config.stream_views, config.case_sensitive)?
    };

    let client = &config.transfer_client;
    source.install_client(client, &config.workspace_root, &view.source_client_view(client))?;
    if config.views.is_empty() {
        let stream = config
            .transfer_target_stream
            .as_deref()
            .ok_or_else(|| RelayError::config("transfer_target_stream missing"))?;
        target.install_stream_client(client, &config.workspace_root, stream)?;
    } else {
        target.install_client(client, &config.workspace_root, &view.target_client_view(client))?;
    }

    let capabilities = target.capabilities()?;
    if capabilities.commit_server {
        info!("target is a commit server; exclusive-lock opens will be reordered");
    }

    if target.has_foreign_opens()? {
        return Err(RelayError::Precondition(
            "target workspace has files opened by another process".to_string(),
        ));
    }

    // Reclaim change numbers a crashed run left allocated but empty.
    for (change, opens) in target.pending_changes()? {
        if opens == 0 {
            info!(change, "reclaiming empty pending change");
            target.delete_change(change)?;
        }
    }

    let starting_counter = compute_starting_counter(config, source, target)?;
    Ok(SetupOutcome {
        view,
        capabilities,
        starting_counter,
    })
}

/// Realize target streams for every source stream the configured globs
/// match, then leave the workspace pointed at the transfer target stream.
fn provision_streams(
    config: &Config,
    source: &mut dyn SourceSession,
    target: &mut dyn TargetSession,
) -> Result<(), RelayError> {
    for entry in &config.stream_views {
        let matched = source.list_streams(&entry.src)?;
        if matched.is_empty() {
            warn!(glob = %entry.src, "no source streams match the stream view");
        }
        for stream in matched {
            let Some(target_name) = wildcard_translate(
                &entry.src,
                &entry.targ,
                &stream.name,
                config.case_sensitive,
            )?
            else {
                continue;
            };
            let exists = target
                .list_streams(&target_name)?
                .iter()
                .any(|s| s.name == target_name);
            if !exists {
                info!(source = %stream.name, target = %target_name, "creating target stream");
                target.create_stream(&StreamSpec {
                    name: target_name,
                    stream_type: entry.stream_type.clone(),
                    parent: Some(entry.parent.clone()),
                })?;
            }
        }
    }
    Ok(())
}

/// The starting counter: the stored counter, repaired from description
/// markers after a lost counter, or seeded from `historical_start_change`
/// on a first run.
fn compute_starting_counter(
    config: &Config,
    source: &mut dyn SourceSession,
    target: &mut dyn TargetSession,
) -> Result<u64, RelayError> {
    let counter = target.get_counter(&config.counter_name)?;
    let marker_high = target
        .change_descriptions()?
        .iter()
        .filter_map(|(_, description)| parse_marker(description))
        .filter(|(port, _)| port == source.port())
        .map(|(_, change)| change)
        .max()
        .unwrap_or(0);

    if counter > 0 {
        if counter < marker_high {
            return Err(RelayError::Precondition(format!(
                "counter {counter} is behind already replicated change {marker_high}"
            )));
        }
        return Ok(counter);
    }

    if marker_high > 0 {
        // Counter lost but history present: recover from the markers.
        info!(marker_high, "recovering counter from change markers");
        target.set_counter(&config.counter_name, marker_high, config.is_superuser())?;
        return Ok(marker_high);
    }

    if let Some(historical) = config.historical_start_change {
        if historical == 0 {
            return Err(RelayError::config(
                "historical_start_change must be positive",
            ));
        }
        let seeded = historical - 1;
        info!(seeded, "seeding counter for historical start");
        target.set_counter(&config.counter_name, seeded, config.is_superuser())?;
        return Ok(seeded);
    }

    Ok(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::memory::MemoryServer;
    use crate::client::records::FileType;
    use crate::config::{ServerConfig, StreamViewEntry, ViewEntry};
    use std::path::PathBuf;

    fn base_config() -> Config {
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
            workspace_root: PathBuf::from("/tmp/depot-relay-test-ws"),
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
    fn setup_installs_views_and_probes() {
        let config = base_config();
        let mut source = MemoryServer::new("src:1666");
        let mut target = MemoryServer::new("targ:1666");
        let outcome = run_setup(&config, &mut source, &mut target).unwrap();
        assert_eq!(outcome.starting_counter, 0);
        assert!(outcome.view.in_scope("//depot/inside/x"));
        assert!(!outcome.capabilities.commit_server);
    }

    #[test]
    fn historical_start_seeds_counter() {
        let mut config = base_config();
        config.historical_start_change = Some(100);
        let mut source = MemoryServer::new("src:1666");
        let mut target = MemoryServer::new("targ:1666");
        let outcome = run_setup(&config, &mut source, &mut target).unwrap();
        assert_eq!(outcome.starting_counter, 99);
        assert_eq!(target.counter_value("depot_relay"), 99);
    }

    /// A lost counter is recovered from the description markers.
    #[test]
    fn counter_recovers_from_markers() {
        let config = base_config();
        let mut source = MemoryServer::new("src:1666");
        let mut target = MemoryServer::new("targ:1666");
        let change = target.create_change("x\n\nTransferred from src:1666@17").unwrap();
        TargetSession::write_workspace_file(&mut target, "//depot/import/a", b"x\n").unwrap();
        target
            .open_add(change, "//depot/import/a", &FileType::text(), false)
            .unwrap();
        target.submit(change).unwrap();

        let outcome = run_setup(&config, &mut source, &mut target).unwrap();
        assert_eq!(outcome.starting_counter, 17);
    }

    /// A counter behind existing replicated history is fatal.
    #[test]
    fn stale_counter_is_a_precondition_failure() {
        let config = base_config();
        let mut source = MemoryServer::new("src:1666");
        let mut target = MemoryServer::new("targ:1666");
        let change = target.create_change("x\n\nTransferred from src:1666@17").unwrap();
        TargetSession::write_workspace_file(&mut target, "//depot/import/a", b"x\n").unwrap();
        target
            .open_add(change, "//depot/import/a", &FileType::text(), false)
            .unwrap();
        target.submit(change).unwrap();
        target.set_counter("depot_relay", 5, true).unwrap();

        let error = run_setup(&config, &mut source, &mut target).unwrap_err();
        assert!(matches!(error, RelayError::Precondition(_)));
    }

    /// Foreign opens in the transfer workspace are fatal.
    #[test]
    fn foreign_opens_are_fatal() {
        let config = base_config();
        let mut source = MemoryServer::new("src:1666");
        let mut target = MemoryServer::new("targ:1666");
        target.set_foreign_opens(true);
        let error = run_setup(&config, &mut source, &mut target).unwrap_err();
        assert!(matches!(error, RelayError::Precondition(_)));
    }

    /// Stream provisioning creates one target stream per matched source
    /// stream.
    #[test]
    fn streams_are_provisioned_per_match() {
        let mut config = base_config();
        config.views = Vec::new();
        config.stream_views = vec![StreamViewEntry {
            src: "//src_streams/*".to_string(),
            targ: "//targ_streams/*".to_string(),
            stream_type: "development".to_string(),
            parent: "//targ_streams/main".to_string(),
        }];
        config.transfer_target_stream = Some("//targ_streams/transfer".to_string());

        let mut source = MemoryServer::new("src:1666");
        let mut target = MemoryServer::new("targ:1666");
        for name in ["//src_streams/main", "//src_streams/rel1", "//src_streams/rel2"] {
            TargetSession::create_stream(
                &mut source,
                &StreamSpec {
                    name: name.to_string(),
                    stream_type: "development".to_string(),
                    parent: None,
                },
            )
            .unwrap();
        }
        TargetSession::create_stream(
            &mut target,
            &StreamSpec {
                name: "//targ_streams/transfer".to_string(),
                stream_type: "mainline".to_string(),
                parent: None,
            },
        )
        .unwrap();

        run_setup(&config, &mut source, &mut target).unwrap();
        let created = TargetSession::list_streams(&mut target, "//targ_streams/*").unwrap();
        let names: Vec<&str> = created.iter().map(|s| s.name.as_str()).collect();
        assert!(names.contains(&"//targ_streams/main"));
        assert!(names.contains(&"//targ_streams/rel1"));
        assert!(names.contains(&"//targ_streams/rel2"));
    }
}
