//! Concrete sessions over the command-line client.
//!
//! Every request spawns the `p4` binary with tagged output (`-ztag`) and
//! parses the `... field value` records it prints. One subprocess per
//! request keeps the transport stateless; the connection-reset hooks are
//! no-ops beyond dropping cached server info.

use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use tracing::debug;

use crate::client::records::{
    ChangeInfo, FileRevision, FileType, HowCode, IntegrationRecord, OpenedFile, StreamSpec,
};
use crate::client::{Capabilities, IntegrateRequest, SourceSession, TargetSession};
use crate::errors::RelayError;
use crate::paths::{decode_wire, encode_wire};
use crate::replicate::intent::IntegrationDirective;

/// One tagged record from `-ztag` output.
pub type TaggedRecord = BTreeMap<String, String>;

/// Parse `-ztag` output into records. Records are separated by blank
/// lines; each field line is `... name value`.
pub fn parse_ztag(output: &str) -> Vec<TaggedRecord> {
    let mut records = Vec::new();
    let mut current = TaggedRecord::new();
    for line in output.lines() {
        if line.is_empty() {
            if !current.is_empty() {
                records.push(std::mem::take(&mut current));
            }
            continue;
        }
        if let Some(rest) = line.strip_prefix("... ") {
            let (name, value) = match rest.split_once(' ') {
                Some((n, v)) => (n, v),
                None => (rest, ""),
            };
            current.insert(name.to_string(), value.to_string());
        } else if let Some((_, last)) = current.iter_mut().next_back() {
            // Continuation of a multi-line value (descriptions).
            last.push('\n');
            last.push_str(line);
        }
    }
    if !current.is_empty() {
        records.push(current);
    }
    records
}

fn field<'a>(record: &'a TaggedRecord, name: &str) -> Result<&'a str, RelayError> {
    record
        .get(name)
        .map(String::as_str)
        .ok_or_else(|| RelayError::MissingField(name.to_string()))
}

/// Spawns the client binary with fixed connection settings.
#[derive(Debug, Clone)]
pub struct P4Runner {
    port: String,
    user: String,
    client: String,
}

impl P4Runner {
    pub fn new(port: &str, user: &str, client: &str) -> P4Runner {
        P4Runner {
            port: port.to_string(),
            user: user.to_string(),
            client: client.to_string(),
        }
    }

    fn command(&self, tagged: bool) -> Command {
        let mut cmd = Command::new("p4");
        if tagged {
            cmd.arg("-ztag");
        }
        cmd.args(["-p", &self.port, "-u", &self.user, "-c", &self.client]);
        cmd
    }

    /// Run a tagged command, feeding `input` to stdin when given.
    pub fn run(&self, args: &[&str], input: Option<&[u8]>) -> Result<Vec<TaggedRecord>, RelayError> {
        let output = self.capture(true, args, input)?;
        let text = String::from_utf8_lossy(&output);
        Ok(parse_ztag(&text))
    }

    /// Run an untagged command and return raw stdout.
    pub fn run_raw(&self, args: &[&str], input: Option<&[u8]>) -> Result<Vec<u8>, RelayError> {
        self.capture(false, args, input)
    }

    fn capture(
        &self,
        tagged: bool,
        args: &[&str],
        input: Option<&[u8]>,
    ) -> Result<Vec<u8>, RelayError> {
        debug!(port = %self.port, ?args, "p4");
        let mut cmd = self.command(tagged);
        cmd.args(args)
            .stdin(if input.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        let mut child = cmd.spawn().map_err(|e| RelayError::Connection {
            server: self.port.clone(),
            detail: format!("cannot spawn p4: {e}"),
        })?;
        if let Some(bytes) = input
            && let Some(stdin) = child.stdin.as_mut()
        {
            stdin.write_all(bytes)?;
        }
        let output = child.wait_with_output().map_err(|e| RelayError::Connection {
            server: self.port.clone(),
            detail: e.to_string(),
        })?;
        if !output.status.success() {
            let message = String::from_utf8_lossy(&output.stderr).trim().to_string();
            return Err(classify_server_error(&self.port, &message));
        }
        Ok(output.stdout)
    }
}

/// Map a server error message onto the structured error the engine
/// dispatches on.
fn classify_server_error(port: &str, message: &str) -> RelayError {
    let lowered = message.to_ascii_lowercase();
    if lowered.contains("connect to server failed") || lowered.contains("tcp connect") {
        return RelayError::Connection {
            server: port.to_string(),
            detail: message.to_string(),
        };
    }
    if lowered.contains("submit validation failed")
        || lowered.contains("rejected your submit")
        || lowered.contains("submit aborted")
    {
        return RelayError::TriggerRejection(message.to_string());
    }
    RelayError::Server(message.to_string())
}

fn render_client_spec(client: &str, root: &Path, view_lines: &[String]) -> String {
    let mut spec = String::new();
    spec.push_str(&format!("Client:\t{client}\n\n"));
    spec.push_str(&format!("Root:\t{}\n\n", root.display()));
    spec.push_str("Options:\tnoallwrite clobber nocompress unlocked nomodtime rmdir\n\n");
    spec.push_str("LineEnd:\tunix\n\n");
    spec.push_str("View:\n");
    for line in view_lines {
        spec.push_str(&format!("\t{line}\n"));
    }
    spec
}

fn parse_filelog(records: &[TaggedRecord]) -> Result<Vec<FileRevision>, RelayError> {
    let mut revisions = Vec::new();
    for record in records {
        let depot_path = decode_wire(field(record, "depotFile")?);
        for index in 0.. {
            let Some(rev_text) = record.get(&format!("rev{index}")) else {
                break;
            };
            let rev: u32 = rev_text
                .parse()
                .map_err(|_| RelayError::Server(format!("bad rev `{rev_text}`")))?;
            let change: u64 = field(record, &format!("change{index}"))?
                .parse()
                .map_err(|_| RelayError::MissingField(format!("change{index}")))?;
            let action = field(record, &format!("action{index}"))?.parse()?;
            let file_type: FileType = field(record, &format!("type{index}"))?.parse()?;
            let digest = record.get(&format!("digest{index}")).cloned();
            let file_size = record
                .get(&format!("fileSize{index}"))
                .and_then(|s| s.parse().ok())
                .unwrap_or(0);
            let mut integrations = Vec::new();
            for j in 0.. {
                let Some(how_text) = record.get(&format!("how{index},{j}")) else {
                    break;
                };
                let how: HowCode = how_text.parse()?;
                let other = decode_wire(field(record, &format!("file{index},{j}"))?);
                let start_rev = parse_rev_marker(field(record, &format!("srev{index},{j}"))?);
                let end_rev = parse_rev_marker(field(record, &format!("erev{index},{j}"))?);
                integrations.push(IntegrationRecord::new(how, &other, start_rev, end_rev));
            }
            revisions.push(FileRevision {
                depot_path: depot_path.clone(),
                rev,
                change,
                action,
                file_type,
                digest,
                file_size,
                integrations,
            });
        }
    }
    revisions.sort_by_key(|r| r.rev);
    Ok(revisions)
}

/// Filelog revision markers are `#none`, `#head` or `#N`.
fn parse_rev_marker(text: &str) -> u32 {
    match text.trim_start_matches('#') {
        "none" => 0,
        value => value.parse().unwrap_or(0),
    }
}

/// Read-only source connection over the CLI transport.
pub struct P4Source {
    runner: P4Runner,
    port: String,
}

impl P4Source {
    pub fn new(port: &str, user: &str, client: &str) -> P4Source {
        P4Source {
            runner: P4Runner::new(port, user, client),
            port: port.to_string(),
        }
    }

    fn client_path(&self) -> String {
        format!("//{}/...", self.runner.client)
    }
}

impl SourceSession for P4Source {
    fn port(&self) -> &str {
        &self.port
    }

    fn connect(&mut self) -> Result<(), RelayError> {
        self.runner.run(&["info"], None).map(|_| ())
    }

    fn reset(&mut self) -> Result<(), RelayError> {
        // Stateless transport: nothing cached between requests.
        Ok(())
    }

    fn install_client(
        &mut self,
        client: &str,
        root: &Path,
        view_lines: &[String],
    ) -> Result<(), RelayError> {
        let spec = render_client_spec(client, root, view_lines);
        self.runner
            .run(&["client", "-i"], Some(spec.as_bytes()))
            .map(|_| ())
    }

    fn changes_in_view(&mut self, above: u64) -> Result<Vec<u64>, RelayError> {
        let range = format!("{}@{},#head", self.client_path(), above + 1);
        let records = self
            .runner
            .run(&["changes", "-l", "-s", "submitted", &range], None)?;
        let mut numbers = Vec::with_capacity(records.len());
        for record in &records {
            numbers.push(
                field(record, "change")?
                    .parse()
                    .map_err(|_| RelayError::MissingField("change".to_string()))?,
            );
        }
        numbers.sort_unstable();
        Ok(numbers)
    }

    fn describe(&mut self, change: u64) -> Result<ChangeInfo, RelayError> {
        let number = change.to_string();
        let records = self.runner.run(&["describe", "-s", &number], None)?;
        let record = records
            .first()
            .ok_or_else(|| RelayError::Server(format!("no such change {change}")))?;
        let mut revisions = Vec::new();
        for index in 0.. {
            let Some(path) = record.get(&format!("depotFile{index}")) else {
                break;
            };
            let path = decode_wire(path);
            let rev: u32 = field(record, &format!("rev{index}"))?
                .parse()
                .map_err(|_| RelayError::MissingField(format!("rev{index}")))?;
            let filelog = self.filelog(&path)?;
            let revision = filelog
                .into_iter()
                .find(|r| r.rev == rev)
                .ok_or_else(|| RelayError::Server(format!("`{path}#{rev}` missing from filelog")))?;
            revisions.push(revision);
        }
        Ok(ChangeInfo {
            number: change,
            user: field(record, "user")?.to_string(),
            client: field(record, "client")?.to_string(),
            description: field(record, "desc")?.to_string(),
            time: field(record, "time")?.parse().unwrap_or(0),
            revisions,
        })
    }

    fn filelog(&mut self, path: &str) -> Result<Vec<FileRevision>, RelayError> {
        let wire = encode_wire(path);
        let records = self.runner.run(&["filelog", "-l", &wire], None)?;
        parse_filelog(&records)
    }

    fn print(&mut self, path: &str, rev: u32) -> Result<Vec<u8>, RelayError> {
        let spec = format!("{}#{rev}", encode_wire(path));
        match self.runner.run_raw(&["print", "-q", &spec], None) {
            Ok(bytes) => Ok(bytes),
            Err(RelayError::Server(message)) if message.contains("no such file") => {
                Err(RelayError::ObliteratedRevision {
                    path: path.to_string(),
                    rev,
                })
            }
            Err(other) => Err(other),
        }
    }

    fn list_streams(&mut self, glob: &str) -> Result<Vec<StreamSpec>, RelayError> {
        let records = self.runner.run(&["streams", glob], None)?;
        let mut streams = Vec::with_capacity(records.len());
        for record in &records {
            streams.push(StreamSpec {
                name: field(record, "Stream")?.to_string(),
                stream_type: field(record, "Type")?.to_string(),
                parent: record.get("Parent").filter(|p| *p != "none").cloned(),
            });
        }
        Ok(streams)
    }
}

/// Read-write target connection over the CLI transport.
pub struct P4Target {
    runner: P4Runner,
    port: String,
    workspace_root: PathBuf,
}

impl P4Target {
    pub fn new(port: &str, user: &str, client: &str, workspace_root: &Path) -> P4Target {
        P4Target {
            runner: P4Runner::new(port, user, client),
            port: port.to_string(),
            workspace_root: workspace_root.to_path_buf(),
        }
    }

    fn client_path(&self) -> String {
        format!("//{}/...", self.runner.client)
    }

    /// Local path backing a depot path, per the view installed by setup
    /// (depot syntax mirrored under the workspace root).
    fn local_path(&self, depot_path: &str) -> PathBuf {
        self.workspace_root.join(depot_path.trim_start_matches('/'))
    }

    fn open_args(&self, change: u64) -> String {
        change.to_string()
    }
}

impl TargetSession for P4Target {
    fn port(&self) -> &str {
        &self.port
    }

    fn connect(&mut self) -> Result<(), RelayError> {
        self.runner.run(&["info"], None).map(|_| ())
    }

    fn reset(&mut self) -> Result<(), RelayError> {
        Ok(())
    }

    fn capabilities(&mut self) -> Result<Capabilities, RelayError> {
        let records = self.runner.run(&["info"], None)?;
        let record = records
            .first()
            .ok_or_else(|| RelayError::Server("empty info response".to_string()))?;
        let services = record.get("serverServices").cloned().unwrap_or_default();
        // Move pairs arrived with the 2009.1 server; parse the release
        // year out of "P4D/LINUX26X86_64/2020.1/...".
        let supports_move = record
            .get("serverVersion")
            .and_then(|version| version.split('/').nth(2))
            .and_then(|release| release.split('.').next())
            .and_then(|year| year.parse::<u32>().ok())
            .map(|year| year >= 2009)
            .unwrap_or(true);
        Ok(Capabilities {
            commit_server: services.contains("commit-server"),
            supports_move,
        })
    }

    fn get_counter(&mut self, name: &str) -> Result<u64, RelayError> {
        let records = self.runner.run(&["counter", name], None)?;
        let value = records
            .first()
            .and_then(|r| r.get("value"))
            .map(String::as_str)
            .unwrap_or("0");
        Ok(value.parse().unwrap_or(0))
    }

    fn set_counter(&mut self, name: &str, value: u64, force: bool) -> Result<(), RelayError> {
        let value = value.to_string();
        let args: Vec<&str> = if force {
            vec!["counter", "-f", name, &value]
        } else {
            vec!["counter", name, &value]
        };
        self.runner.run(&args, None).map(|_| ())
    }

    fn install_client(
        &mut self,
        client: &str,
        root: &Path,
        view_lines: &[String],
    ) -> Result<(), RelayError> {
        let spec = render_client_spec(client, root, view_lines);
        self.runner
            .run(&["client", "-i"], Some(spec.as_bytes()))
            .map(|_| ())
    }

    fn install_stream_client(
        &mut self,
        client: &str,
        root: &Path,
        stream: &str,
    ) -> Result<(), RelayError> {
        let mut spec = String::new();
        spec.push_str(&format!("Client:\t{client}\n\n"));
        spec.push_str(&format!("Root:\t{}\n\n", root.display()));
        spec.push_str(&format!("Stream:\t{stream}\n"));
        self.runner
            .run(&["client", "-i"], Some(spec.as_bytes()))
            .map(|_| ())
    }

    fn list_streams(&mut self, glob: &str) -> Result<Vec<StreamSpec>, RelayError> {
        let records = self.runner.run(&["streams", glob], None)?;
        let mut streams = Vec::with_capacity(records.len());
        for record in &records {
            streams.push(StreamSpec {
                name: field(record, "Stream")?.to_string(),
                stream_type: field(record, "Type")?.to_string(),
                parent: record.get("Parent").filter(|p| *p != "none").cloned(),
            });
        }
        Ok(streams)
    }

    fn create_stream(&mut self, spec: &StreamSpec) -> Result<(), RelayError> {
        let mut text = String::new();
        text.push_str(&format!("Stream:\t{}\n\n", spec.name));
        text.push_str(&format!("Type:\t{}\n\n", spec.stream_type));
        let parent = spec.parent.as_deref().unwrap_or("none");
        text.push_str(&format!("Parent:\t{parent}\n\n"));
        let name = spec
            .name
            .rsplit('/')
            .next()
            .unwrap_or(&spec.name)
            .to_string();
        text.push_str(&format!("Name:\t{name}\n\n"));
        text.push_str("Paths:\n\tshare ...\n");
        self.runner
            .run(&["stream", "-i"], Some(text.as_bytes()))
            .map(|_| ())
    }

    fn switch_stream(&mut self, stream: &str) -> Result<(), RelayError> {
        self.runner
            .run(&["client", "-s", "-S", stream], None)
            .map(|_| ())
    }

    fn filelog(&mut self, path: &str) -> Result<Vec<FileRevision>, RelayError> {
        let wire = encode_wire(path);
        match self.runner.run(&["filelog", "-l", &wire], None) {
            Ok(records) => parse_filelog(&records),
            Err(RelayError::Server(message)) if message.contains("no such file") => Ok(Vec::new()),
            Err(other) => Err(other),
        }
    }

    fn print(&mut self, path: &str, rev: u32) -> Result<Vec<u8>, RelayError> {
        let spec = format!("{}#{rev}", encode_wire(path));
        self.runner.run_raw(&["print", "-q", &spec], None)
    }

    fn change_descriptions(&mut self) -> Result<Vec<(u64, String)>, RelayError> {
        let path = self.client_path();
        let records = self
            .runner
            .run(&["changes", "-l", "-s", "submitted", &path], None)?;
        let mut changes = Vec::with_capacity(records.len());
        for record in &records {
            let number = field(record, "change")?
                .parse()
                .map_err(|_| RelayError::MissingField("change".to_string()))?;
            changes.push((number, field(record, "desc")?.to_string()));
        }
        changes.sort_by_key(|(n, _)| *n);
        Ok(changes)
    }

    fn revert_all(&mut self) -> Result<(), RelayError> {
        let path = self.client_path();
        match self.runner.run(&["revert", "-k", &path], None) {
            Ok(_) => Ok(()),
            Err(RelayError::Server(message)) if message.contains("not opened") => Ok(()),
            Err(other) => Err(other),
        }
    }

    fn has_foreign_opens(&mut self) -> Result<bool, RelayError> {
        let path = self.client_path();
        let records = match self.runner.run(&["opened", "-a", &path], None) {
            Ok(records) => records,
            Err(RelayError::Server(message)) if message.contains("not opened") => Vec::new(),
            Err(other) => return Err(other),
        };
        Ok(records.iter().any(|r| {
            r.get("client")
                .is_some_and(|client| client != &self.runner.client)
        }))
    }

    fn create_change(&mut self, description: &str) -> Result<u64, RelayError> {
        let mut spec = String::new();
        spec.push_str("Change:\tnew\n\n");
        spec.push_str("Description:\n");
        for line in description.lines() {
            spec.push_str(&format!("\t{line}\n"));
        }
        let output = self.runner.run_raw(&["change", "-i"], Some(spec.as_bytes()))?;
        let text = String::from_utf8_lossy(&output);
        // "Change 1234 created."
        text.split_whitespace()
            .nth(1)
            .and_then(|n| n.parse().ok())
            .ok_or_else(|| RelayError::Server(format!("unexpected change output: {text}")))
    }

    fn pending_changes(&mut self) -> Result<Vec<(u64, usize)>, RelayError> {
        let client = self.runner.client.clone();
        let records = self
            .runner
            .run(&["changes", "-s", "pending", "-c", &client], None)?;
        let mut pending = Vec::with_capacity(records.len());
        for record in &records {
            let number: u64 = field(record, "change")?
                .parse()
                .map_err(|_| RelayError::MissingField("change".to_string()))?;
            let opens = self.opened(number)?.count();
            pending.push((number, opens));
        }
        Ok(pending)
    }

    fn delete_change(&mut self, change: u64) -> Result<(), RelayError> {
        let number = change.to_string();
        self.runner.run(&["change", "-d", &number], None).map(|_| ())
    }

    fn sync_file(&mut self, path: &str, rev: u32) -> Result<(), RelayError> {
        let spec = format!("{}#{rev}", encode_wire(path));
        match self.runner.run(&["sync", "-f", &spec], None) {
            Ok(_) => Ok(()),
            Err(RelayError::Server(message)) if message.contains("up-to-date") => Ok(()),
            Err(other) => Err(other),
        }
    }

    fn write_workspace_file(&mut self, path: &str, content: &[u8]) -> Result<(), RelayError> {
        let local = self.local_path(path);
        if let Some(parent) = local.parent() {
            std::fs::create_dir_all(parent)?;
        }
        // Opened files may be read-only until the open lands; clobber.
        if local.exists() {
            let mut perms = std::fs::metadata(&local)?.permissions();
            if perms.readonly() {
                #[allow(clippy::permissions_set_readonly_false)]
                perms.set_readonly(false);
                std::fs::set_permissions(&local, perms)?;
            }
        }
        std::fs::write(local, content)?;
        Ok(())
    }

    fn read_workspace_file(&mut self, path: &str) -> Result<Vec<u8>, RelayError> {
        Ok(std::fs::read(self.local_path(path))?)
    }

    fn open_add(
        &mut self,
        change: u64,
        path: &str,
        file_type: &FileType,
        downgrade: bool,
    ) -> Result<(), RelayError> {
        let change = self.open_args(change);
        let type_text = file_type.to_string();
        let local = self.local_path(path);
        let local = local.to_string_lossy().to_string();
        let mut args = vec!["add", "-f", "-t", &type_text, "-c", &change];
        if downgrade {
            args.push("-d");
        }
        args.push(&local);
        self.runner.run(&args, None).map(|_| ())
    }

    fn open_edit(&mut self, change: u64, path: &str) -> Result<(), RelayError> {
        let change = self.open_args(change);
        let wire = encode_wire(path);
        self.runner
            .run(&["edit", "-c", &change, &wire], None)
            .map(|_| ())
    }

    fn open_delete(&mut self, change: u64, path: &str) -> Result<(), RelayError> {
        let change = self.open_args(change);
        let wire = encode_wire(path);
        self.runner
            .run(&["delete", "-v", "-c", &change, &wire], None)
            .map(|_| ())
    }

    fn open_move(&mut self, change: u64, from: &str, to: &str) -> Result<(), RelayError> {
        let change = self.open_args(change);
        let from_wire = encode_wire(from);
        let to_wire = encode_wire(to);
        match self
            .runner
            .run(&["move", "-c", &change, &from_wire, &to_wire], None)
        {
            Ok(_) => Ok(()),
            Err(RelayError::Server(message)) => Err(RelayError::MoveRefused {
                from: from.to_string(),
                to: to.to_string(),
                detail: message,
            }),
            Err(other) => Err(other),
        }
    }

    fn integrate(&mut self, change: u64, request: &IntegrateRequest) -> Result<(), RelayError> {
        let change = self.open_args(change);
        let from = format!(
            "{}#{},#{}",
            encode_wire(&request.from_path),
            request.start_rev + 1,
            request.end_rev
        );
        let to = encode_wire(&request.to_path);
        let mut args = vec!["integrate", "-c", &change];
        if request.force {
            args.push("-f");
        }
        if request.for_delete {
            args.push("-Ds");
        }
        args.push(&from);
        args.push(&to);
        match self.runner.run(&args, None) {
            Ok(_) => Ok(()),
            Err(RelayError::Server(message)) => Err(RelayError::IntegrateRefused {
                path: request.to_path.clone(),
                detail: message,
            }),
            Err(other) => Err(other),
        }
    }

    fn resolve(&mut self, path: &str, directive: &IntegrationDirective) -> Result<(), RelayError> {
        let wire = encode_wire(path);
        let flag = match directive {
            IntegrationDirective::AcceptTheirs => "-at",
            IntegrationDirective::AcceptYours => "-ay",
            IntegrationDirective::AcceptMerged => "-am",
            // Explicit content: take theirs, then overwrite below.
            IntegrationDirective::AcceptEdit(_) => "-at",
            IntegrationDirective::ActionResolve(_) => "-at",
        };
        self.runner.run(&["resolve", flag, &wire], None)?;
        if let Some(content) = directive.content() {
            self.write_workspace_file(path, content)?;
        }
        Ok(())
    }

    fn reopen_type(
        &mut self,
        change: u64,
        path: &str,
        file_type: &FileType,
    ) -> Result<(), RelayError> {
        let change = self.open_args(change);
        let type_text = file_type.to_string();
        let wire = encode_wire(path);
        self.runner
            .run(&["reopen", "-c", &change, "-t", &type_text, &wire], None)
            .map(|_| ())
    }

    fn reopen_nokeywords(&mut self, change: u64, path: &str) -> Result<(), RelayError> {
        let change = self.open_args(change);
        let wire = encode_wire(path);
        self.runner
            .run(&["edit", "-k", "-c", &change, &wire], None)
            .map(|_| ())
    }

    fn revert_file(&mut self, path: &str) -> Result<(), RelayError> {
        let wire = encode_wire(path);
        self.runner.run(&["revert", &wire], None).map(|_| ())
    }

    fn opened(
        &mut self,
        change: u64,
    ) -> Result<Box<dyn Iterator<Item = OpenedFile> + Send>, RelayError> {
        let number = change.to_string();
        let records = self.runner.run(&["opened", "-c", &number], None)?;
        let mut files = Vec::with_capacity(records.len());
        for record in &records {
            files.push(OpenedFile {
                depot_path: decode_wire(field(record, "depotFile")?),
                action: field(record, "action")?.parse()?,
            });
        }
        Ok(Box::new(files.into_iter()))
    }

    fn submit(&mut self, change: u64) -> Result<u64, RelayError> {
        let number = change.to_string();
        let records = match self.runner.run(&["submit", "-c", &number], None) {
            Ok(records) => records,
            Err(RelayError::Server(message)) if message.to_ascii_lowercase().contains("digest") => {
                let path = message
                    .split_whitespace()
                    .find(|w| w.starts_with("//"))
                    .unwrap_or("")
                    .to_string();
                return Err(RelayError::KeywordDigestMismatch { path });
            }
            Err(other) => return Err(other),
        };
        for record in &records {
            if let Some(submitted) = record.get("submittedChange") {
                return submitted
                    .parse()
                    .map_err(|_| RelayError::MissingField("submittedChange".to_string()));
            }
        }
        Err(RelayError::Server(format!(
            "submit of change {change} reported no submitted number"
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Tagged output parses into records split on blank lines, with
    /// multi-line values folded back together.
    #[test]
    fn ztag_parsing() {
        let output = "... change 42\n... desc first line\nsecond line\n\n... change 43\n";
        let records = parse_ztag(output);
        assert_eq!(records.len(), 2);
        assert_eq!(records[0]["change"], "42");
        assert_eq!(records[0]["desc"], "first line\nsecond line");
        assert_eq!(records[1]["change"], "43");
    }

    /// Filelog fields map onto revisions with integration records.
    #[test]
    fn filelog_parsing() {
        let output = concat!(
            "... depotFile //depot/import/file2\n",
            "... rev0 1\n",
            "... change0 9\n",
            "... action0 branch\n",
            "... type0 text\n",
            "... digest0 6CD3556DEB0DA54BCA060B4C39479839\n",
            "... fileSize0 14\n",
            "... how0,0 branch from\n",
            "... file0,0 //depot/import/file1\n",
            "... srev0,0 #none\n",
            "... erev0,0 #3\n",
        );
        let records = parse_ztag(output);
        let revisions = parse_filelog(&records).unwrap();
        assert_eq!(revisions.len(), 1);
        let rev = &revisions[0];
        assert_eq!(rev.depot_path, "//depot/import/file2");
        assert_eq!(rev.integrations.len(), 1);
        assert_eq!(rev.integrations[0].how, HowCode::BranchFrom);
        assert_eq!(rev.integrations[0].start_rev, 0);
        assert_eq!(rev.integrations[0].end_rev, 3);
    }

    #[test]
    fn rev_markers() {
        assert_eq!(parse_rev_marker("#none"), 0);
        assert_eq!(parse_rev_marker("#7"), 7);
        assert_eq!(parse_rev_marker("3"), 3);
    }

    #[test]
    fn client_spec_rendering() {
        let spec = render_client_spec(
            "transfer",
            Path::new("/work/ws"),
            &["//depot/import/... //transfer/depot/import/...".to_string()],
        );
        assert!(spec.contains("Client:\ttransfer"));
        assert!(spec.contains("Root:\t/work/ws"));
        assert!(spec.contains("\t//depot/import/... //transfer/depot/import/..."));
    }
}
