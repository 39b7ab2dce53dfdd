//! End-to-end replication scenarios against the in-process server pair:
//! each test seeds source history, runs the replicator to completion and
//! checks the target's filelogs, contents, markers and counter.

use std::path::PathBuf;

use depot_relay::client::memory::MemoryServer;
use depot_relay::client::records::{FileAction, FileType, HowCode, StreamSpec};
use depot_relay::client::{SourceSession, TargetSession};
use depot_relay::config::{Config, ServerConfig, StreamViewEntry, ViewEntry};
use depot_relay::replicate::driver::{DriverOptions, Replicator, RunSummary};
use depot_relay::replicate::intent::IntegrationDirective;
use depot_relay::replicate::submit::parse_marker;

fn base_config() -> Config {
    let root = tempfile::tempdir().expect("temp workspace root");
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
        workspace_root: PathBuf::from(root.keep()),
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

fn replicate(config: &Config, source: &mut MemoryServer, target: &mut MemoryServer) -> RunSummary {
    Replicator::new(config, source, target, DriverOptions::default())
        .run()
        .expect("replication run")
}

fn text() -> FileType {
    FileType::text()
}

/// Every in-scope source revision must have a target revision with the
/// same canonical digest, and every target marker must be unique.
fn assert_invariants(source: &mut MemoryServer, target: &mut MemoryServer, paths: &[(&str, &str)]) {
    for (source_path, target_path) in paths {
        let source_log = SourceSession::filelog(source, source_path).expect("source filelog");
        let target_log = TargetSession::filelog(target, target_path).expect("target filelog");
        assert_eq!(
            source_log.len(),
            target_log.len(),
            "revision counts differ for {source_path}"
        );
        for (s, t) in source_log.iter().zip(target_log.iter()) {
            assert_eq!(
                s.digest, t.digest,
                "digest mismatch at {source_path}#{}",
                s.rev
            );
        }
    }
    let mut seen = std::collections::HashSet::new();
    for (_, description) in TargetSession::change_descriptions(target).expect("descriptions") {
        if let Some((_, source_change)) = parse_marker(&description) {
            assert!(
                seen.insert(source_change),
                "marker for source change {source_change} is not unique"
            );
        }
    }
}

/// Scenario: a single add lands on the mapped path and the counter equals
/// the source change number.
#[test]
fn basic_add() {
    let config = base_config();
    let mut source = MemoryServer::new("src:1666");
    let mut target = MemoryServer::new("targ:1666");
    let change = source.seed_add("//depot/inside/inside_file1", text(), b"Test content\n");
    assert_eq!(change, 1);

    let summary = replicate(&config, &mut source, &mut target);
    assert_eq!(summary.transferred, 1);
    assert_eq!(target.counter_value("depot_relay"), 1);

    let head = target.head("//depot/import/inside_file1").expect("replicated file");
    assert_eq!(head.action, FileAction::Add);
    assert_eq!(
        target.head_content("//depot/import/inside_file1").unwrap(),
        b"Test content\n"
    );
    let description = target.change_description(1).unwrap();
    assert_eq!(parse_marker(description), Some(("src:1666".to_string(), 1)));
}

/// Scenario: add, edit, delete, re-add produce four target changes and the
/// final revision is an add with the source digest.
#[test]
fn edit_delete_re_add() {
    let config = base_config();
    let mut source = MemoryServer::new("src:1666");
    let mut target = MemoryServer::new("targ:1666");
    source.seed_add("//depot/inside/file1", text(), b"rev one\n");
    source.seed_edit("//depot/inside/file1", b"rev two\n");
    source.seed_delete("//depot/inside/file1");
    let last = source.seed_add("//depot/inside/file1", text(), b"rev four\n");

    let summary = replicate(&config, &mut source, &mut target);
    assert_eq!(summary.transferred, 4);
    assert_eq!(target.counter_value("depot_relay"), last);

    let log = TargetSession::filelog(&mut target, "//depot/import/file1").unwrap();
    assert_eq!(log.len(), 4);
    assert_eq!(log[2].action, FileAction::Delete);
    assert_eq!(log[3].action, FileAction::Add);
    assert_invariants(
        &mut source,
        &mut target,
        &[("//depot/inside/file1", "//depot/import/file1")],
    );
}

/// Scenario: a move produces the paired move/add + move/delete records and
/// the target filelog shows the moved-from lineage.
#[test]
fn move_pair() {
    let config = base_config();
    let mut source = MemoryServer::new("src:1666");
    let mut target = MemoryServer::new("targ:1666");
    source.seed_add("//depot/inside/a", text(), b"moving content\n");
    source.seed_move("//depot/inside/a", "//depot/inside/b");

    let summary = replicate(&config, &mut source, &mut target);
    assert_eq!(summary.transferred, 2);

    let log_b = TargetSession::filelog(&mut target, "//depot/import/b").unwrap();
    assert_eq!(log_b[0].action, FileAction::MoveAdd);
    let moved_from = &log_b[0].integrations[0];
    assert_eq!(moved_from.how, HowCode::MovedFrom);
    assert_eq!(moved_from.other_path, "//depot/import/a");

    let log_a = TargetSession::filelog(&mut target, "//depot/import/a").unwrap();
    assert_eq!(log_a.last().unwrap().action, FileAction::MoveDelete);
    assert_eq!(
        target.head_content("//depot/import/b").unwrap(),
        b"moving content\n"
    );
}

/// Scenario: a cherry-picked merge with a content edit lands as `edit
/// from` with the exact source range and content.
#[test]
fn cherry_pick_merge_with_edit() {
    let config = base_config();
    let mut source = MemoryServer::new("src:1666");
    let mut target = MemoryServer::new("targ:1666");
    source.seed_add("//depot/inside/file1", text(), b"l1\n");
    source.seed_edit("//depot/inside/file1", b"l1\nl2\n");
    source.seed_edit("//depot/inside/file1", b"l1\nl2\nl3\n");
    source.seed_add("//depot/inside/file2", text(), b"other\n");
    let merged = b"other\nl3 picked\n".to_vec();
    source.seed_integrate_range(
        "//depot/inside/file1",
        2,
        3,
        "//depot/inside/file2",
        IntegrationDirective::AcceptEdit(merged.clone()),
    );

    replicate(&config, &mut source, &mut target);

    let log = TargetSession::filelog(&mut target, "//depot/import/file2").unwrap();
    let head = log.last().unwrap();
    let record = head
        .integrations
        .iter()
        .find(|r| r.how == HowCode::EditFrom)
        .expect("edit from record");
    assert_eq!(record.other_path, "//depot/import/file1");
    assert_eq!(record.start_rev, 2);
    assert_eq!(record.end_rev, 3);
    assert_eq!(target.head_content("//depot/import/file2").unwrap(), merged);
    assert_invariants(
        &mut source,
        &mut target,
        &[
            ("//depot/inside/file1", "//depot/import/file1"),
            ("//depot/inside/file2", "//depot/import/file2"),
        ],
    );
}

/// Scenario: a branch the server claims is clean, but whose stored content
/// was tampered with (journal-patched), replicates with the actual source
/// content.
#[test]
fn dirty_branch_from_injected_records() {
    let config = base_config();
    let mut source = MemoryServer::new("src:1666");
    let mut target = MemoryServer::new("targ:1666");
    source.seed_add("//depot/inside/file1", text(), b"original\n");
    source.seed_integrate(
        "//depot/inside/file1",
        "//depot/inside/file2",
        IntegrationDirective::AcceptTheirs,
    );
    source.tamper_content("//depot/inside/file2", 1, b"secretly edited\n");

    replicate(&config, &mut source, &mut target);

    assert_eq!(
        target.head_content("//depot/import/file2").unwrap(),
        b"secretly edited\n"
    );
    // The lineage survives as an integration record, not a plain add.
    let head = target.head("//depot/import/file2").unwrap();
    assert!(
        head.integrations
            .iter()
            .any(|r| r.other_path == "//depot/import/file1"),
        "expected an integration record from file1"
    );
    assert_invariants(
        &mut source,
        &mut target,
        &[("//depot/inside/file2", "//depot/import/file2")],
    );
}

/// Scenario: a multi-wildcard stream view provisions one target stream per
/// matching source stream and replicates their heads.
#[test]
fn streams_multi_wildcard() {
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

    source.seed_add("//src_streams/main/file1", text(), b"main\n");
    source.seed_add("//src_streams/rel1/file1", text(), b"rel1\n");
    let last = source.seed_add("//src_streams/rel2/file1", text(), b"rel2\n");

    let summary = replicate(&config, &mut source, &mut target);
    assert_eq!(summary.transferred, 3);
    assert_eq!(target.counter_value("depot_relay"), last);

    let streams = TargetSession::list_streams(&mut target, "//targ_streams/*").unwrap();
    let names: Vec<&str> = streams.iter().map(|s| s.name.as_str()).collect();
    for expected in ["//targ_streams/main", "//targ_streams/rel1", "//targ_streams/rel2"] {
        assert!(names.contains(&expected), "missing stream {expected}");
    }
    assert_eq!(
        target.head_content("//targ_streams/rel2/file1").unwrap(),
        b"rel2\n"
    );
}

/// An in-scope branch leaves the mirrored `branch into` record on the
/// target partner.
#[test]
fn integration_mirror_records() {
    let config = base_config();
    let mut source = MemoryServer::new("src:1666");
    let mut target = MemoryServer::new("targ:1666");
    source.seed_add("//depot/inside/file1", text(), b"one\n");
    source.seed_integrate(
        "//depot/inside/file1",
        "//depot/inside/file2",
        IntegrationDirective::AcceptTheirs,
    );

    replicate(&config, &mut source, &mut target);

    let log1 = TargetSession::filelog(&mut target, "//depot/import/file1").unwrap();
    let mirror = log1[0]
        .integrations
        .iter()
        .find(|r| r.how == HowCode::BranchInto)
        .expect("branch into mirror");
    assert_eq!(mirror.other_path, "//depot/import/file2");
}

/// Filenames with reserved characters replicate and keep their decoded
/// names end to end.
#[test]
fn special_characters_round_trip() {
    let config = base_config();
    let mut source = MemoryServer::new("src:1666");
    let mut target = MemoryServer::new("targ:1666");
    for name in [
        "//depot/inside/file@home.txt",
        "//depot/inside/100%done.txt",
        "//depot/inside/issue#42.txt",
        "//depot/inside/star*name.txt",
        "//depot/inside/C#/program.cs",
    ] {
        source.seed_add(name, text(), b"data\n");
    }

    let summary = replicate(&config, &mut source, &mut target);
    assert_eq!(summary.transferred, 5);
    assert_eq!(
        target
            .head_content("//depot/import/C#/program.cs")
            .unwrap(),
        b"data\n"
    );
    assert_eq!(
        target.head_content("//depot/import/file@home.txt").unwrap(),
        b"data\n"
    );
}

/// The change map lands as its own change and records every transfer.
#[test]
fn change_map_is_written_per_batch() {
    let mut config = base_config();
    config.change_map_file = Some("depot/inside/change_map.csv".to_string());
    let mut source = MemoryServer::new("src:1666");
    let mut target = MemoryServer::new("targ:1666");
    source.seed_add("//depot/inside/a", text(), b"1\n");
    source.seed_edit("//depot/inside/a", b"2\n");

    let summary = replicate(&config, &mut source, &mut target);
    assert_eq!(summary.transferred, 2);

    // Two replicated changes plus the change map's own change.
    assert_eq!(target.submitted_changes().len(), 3);
    let csv = target.head_content("//depot/import/change_map.csv").unwrap();
    let text = String::from_utf8(csv).unwrap();
    let mut lines = text.lines();
    assert_eq!(lines.next(), Some("sourceP4Port,sourceChangeNo,targetChangeNo"));
    assert_eq!(lines.clone().count(), 2);
    assert!(lines.all(|l| l.starts_with("src:1666,")));
}

/// A custom description template expands the recognized variables and
/// leaves unknown ones literal.
#[test]
fn custom_description_template() {
    let mut config = base_config();
    config.change_description_format =
        Some("$sourceDescription [by $sourceUser, $fred]\n\nTransferred from $sourcePort@$sourceChange".to_string());
    let mut source = MemoryServer::new("src:1666");
    source.set_user("alice");
    let mut target = MemoryServer::new("targ:1666");
    source.seed_add("//depot/inside/a", text(), b"x\n");

    replicate(&config, &mut source, &mut target);

    let description = target.change_description(1).unwrap();
    assert!(description.contains("[by alice, $fred]"), "{description}");
    assert_eq!(parse_marker(description), Some(("src:1666".to_string(), 1)));
}

/// Case-insensitive mode folds path comparison in the view.
#[test]
fn case_insensitive_paths() {
    let mut config = base_config();
    config.case_sensitive = false;
    let mut source = MemoryServer::new("src:1666");
    source.set_case_insensitive();
    let mut target = MemoryServer::new("targ:1666");
    source.seed_add("//Depot/Inside/File1", text(), b"x\n");

    let summary = replicate(&config, &mut source, &mut target);
    assert_eq!(summary.transferred, 1);
    assert_eq!(
        target.head_content("//depot/import/File1").unwrap(),
        b"x\n"
    );
}

/// A submit-time keyword digest failure is recovered by reopening the
/// file without keyword expansion.
#[test]
fn keyword_digest_mismatch_recovers() {
    let config = base_config();
    let mut source = MemoryServer::new("src:1666");
    let mut target = MemoryServer::new("targ:1666");
    let keyworded: FileType = "text+k".parse().unwrap();
    source.seed_add("//depot/inside/k.c", keyworded, b"/* $Id$ */\n");
    target.fail_keyword_digest("//depot/import/k.c");

    let summary = replicate(&config, &mut source, &mut target);
    assert_eq!(summary.transferred, 1);
    assert_eq!(
        target.head_content("//depot/import/k.c").unwrap(),
        b"/* $Id$ */\n"
    );
}

/// Trigger rejections retry and eventually land without advancing the
/// counter past the failure.
#[test]
fn trigger_rejection_is_retried() {
    let config = base_config();
    let mut source = MemoryServer::new("src:1666");
    let mut target = MemoryServer::new("targ:1666");
    source.seed_add("//depot/inside/a", text(), b"x\n");
    target.reject_submits(2);

    let summary = replicate(&config, &mut source, &mut target);
    assert_eq!(summary.transferred, 1);
    assert_eq!(target.counter_value("depot_relay"), 1);
}

/// A chain of integrations across several changes keeps every digest and
/// the counter invariant.
#[test]
fn mixed_history_keeps_invariants() {
    let config = base_config();
    let mut source = MemoryServer::new("src:1666");
    let mut target = MemoryServer::new("targ:1666");
    source.seed_add("//depot/inside/main.c", text(), b"int main() {}\n");
    source.seed_edit("//depot/inside/main.c", b"int main() { return 0; }\n");
    source.seed_integrate(
        "//depot/inside/main.c",
        "//depot/inside/rel/main.c",
        IntegrationDirective::AcceptTheirs,
    );
    source.seed_edit("//depot/inside/rel/main.c", b"int main() { return 1; }\n");
    source.seed_integrate(
        "//depot/inside/rel/main.c",
        "//depot/inside/main.c",
        IntegrationDirective::AcceptMerged,
    );
    let last = source.seed_delete("//depot/inside/rel/main.c");

    let summary = replicate(&config, &mut source, &mut target);
    assert_eq!(summary.transferred, 6);
    assert_eq!(target.counter_value("depot_relay"), last);
    assert_invariants(
        &mut source,
        &mut target,
        &[
            ("//depot/inside/main.c", "//depot/import/main.c"),
            ("//depot/inside/rel/main.c", "//depot/import/rel/main.c"),
        ],
    );
}
