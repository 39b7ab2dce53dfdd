//! An in-process server pair for the test suite.
//!
//! `MemoryServer` models one depot server: filelogs with integration
//! records, pending changes, a transfer workspace, counters and streams.
//! It implements both session traits, so a test builds source history
//! through the same write path the engine uses against the target, which
//! keeps the simulated integration records consistent with what the engine
//! itself produces.
//!
//! Fault injection lives here too: `override_integrations` substitutes the
//! integration records of one revision (standing in for journal patching),
//! and the `refuse_*`/`fail_*` knobs exercise the executor's fallbacks.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::Path;

use crate::client::records::{
    ChangeInfo, FileAction, FileRevision, FileType, HowCode, IntegrationRecord, OpenedFile,
    StreamSpec,
};
use crate::client::{Capabilities, IntegrateRequest, SourceSession, TargetSession};
use crate::digest::canonical_digest;
use crate::errors::RelayError;
use crate::replicate::intent::IntegrationDirective;
use crate::view::wildcard_translate;

#[derive(Debug, Clone)]
struct StoredRev {
    action: FileAction,
    file_type: FileType,
    content: Vec<u8>,
    change: u64,
    integrations: Vec<IntegrationRecord>,
}

#[derive(Debug, Clone)]
struct StagedInteg {
    from_path: String,
    start_rev: u32,
    end_rev: u32,
    for_delete: bool,
    directive: Option<IntegrationDirective>,
}

#[derive(Debug, Clone)]
struct PendingOpen {
    action: FileAction,
    file_type: FileType,
    move_from: Option<String>,
    integrations: Vec<StagedInteg>,
    nokeywords: bool,
}

#[derive(Debug, Clone, Default)]
struct PendingChange {
    description: String,
    opens: BTreeMap<String, PendingOpen>,
}

/// One simulated depot server.
pub struct MemoryServer {
    port: String,
    user: String,
    depot: BTreeMap<String, Vec<StoredRev>>,
    changes: BTreeMap<u64, (String, String, i64)>, // number -> (user, description, time)
    pending: BTreeMap<u64, PendingChange>,
    next_change: u64,
    counters: HashMap<String, u64>,
    streams: BTreeMap<String, StreamSpec>,
    workspace: HashMap<String, Vec<u8>>,
    have: HashMap<String, u32>,
    view_depot_lines: Vec<(bool, String)>,
    clock: i64,
    case_sensitive: bool,
    capabilities: Capabilities,

    // Fault-injection knobs.
    integration_overrides: HashMap<(String, u32), Vec<IntegrationRecord>>,
    obliterated: HashSet<(String, u32)>,
    refuse_integrate_unforced: HashSet<(String, String)>,
    fail_keyword_digest: HashSet<String>,
    trigger_rejections: u32,
    foreign_opens: bool,
    reset_count: u32,
}

impl MemoryServer {
    pub fn new(port: &str) -> MemoryServer {
        MemoryServer {
            port: port.to_string(),
            user: "transfer".to_string(),
            depot: BTreeMap::new(),
            changes: BTreeMap::new(),
            pending: BTreeMap::new(),
            next_change: 1,
            counters: HashMap::new(),
            streams: BTreeMap::new(),
            workspace: HashMap::new(),
            have: HashMap::new(),
            view_depot_lines: Vec::new(),
            clock: 1_700_000_000,
            case_sensitive: true,
            capabilities: Capabilities {
                commit_server: false,
                supports_move: true,
            },
            integration_overrides: HashMap::new(),
            obliterated: HashSet::new(),
            refuse_integrate_unforced: HashSet::new(),
            fail_keyword_digest: HashSet::new(),
            trigger_rejections: 0,
            foreign_opens: false,
            reset_count: 0,
        }
    }

    pub fn set_user(&mut self, user: &str) {
        self.user = user.to_string();
    }

    pub fn set_capabilities(&mut self, capabilities: Capabilities) {
        self.capabilities = capabilities;
    }

    /// Model a server initialized case-insensitive (`-C1`).
    pub fn set_case_insensitive(&mut self) {
        self.case_sensitive = false;
    }

    /// Substitute the integration records of one source revision: the
    /// stand-in for journal patching in the original tool's fault tests.
    pub fn override_integrations(
        &mut self,
        path: &str,
        rev: u32,
        records: Vec<IntegrationRecord>,
    ) {
        self.integration_overrides
            .insert((path.to_string(), rev), records);
    }

    /// Replace the stored content of one revision without touching its
    /// digest-bearing metadata consumers; pairs with
    /// `override_integrations` to fabricate dirty branches.
    pub fn tamper_content(&mut self, path: &str, rev: u32, content: &[u8]) {
        if let Some(revs) = self.depot.get_mut(path)
            && let Some(stored) = revs.get_mut((rev - 1) as usize)
        {
            stored.content = content.to_vec();
        }
    }

    /// Mark a revision obliterated: prints fail, filelog omits nothing.
    pub fn obliterate(&mut self, path: &str, rev: u32) {
        self.obliterated.insert((path.to_string(), rev));
    }

    /// Refuse unforced integrates for a from/to pair.
    pub fn refuse_integrate_unforced(&mut self, from: &str, to: &str) {
        self.refuse_integrate_unforced
            .insert((from.to_string(), to.to_string()));
    }

    /// Fail the next submits carrying this keyworded path until it is
    /// reopened without keyword expansion.
    pub fn fail_keyword_digest(&mut self, path: &str) {
        self.fail_keyword_digest.insert(path.to_string());
    }

    /// Reject the next `n` submits with a trigger error.
    pub fn reject_submits(&mut self, n: u32) {
        self.trigger_rejections = n;
    }

    pub fn set_foreign_opens(&mut self, value: bool) {
        self.foreign_opens = value;
    }

    pub fn reset_count(&self) -> u32 {
        self.reset_count
    }

    /// The have-list revision of one workspace file (0 = not synced).
    pub fn have_rev(&self, path: &str) -> u32 {
        self.have.get(path).copied().unwrap_or(0)
    }

    pub fn change_description(&self, change: u64) -> Option<&str> {
        self.changes.get(&change).map(|(_, d, _)| d.as_str())
    }

    pub fn submitted_changes(&self) -> Vec<u64> {
        self.changes.keys().copied().collect()
    }

    pub fn head(&self, path: &str) -> Option<FileRevision> {
        let revs = self.depot.get(path)?;
        let rev = revs.len() as u32;
        Some(self.file_revision(path, rev))
    }

    pub fn head_content(&self, path: &str) -> Option<Vec<u8>> {
        let revs = self.depot.get(path)?;
        let last = revs.last()?;
        if last.action.is_delete() {
            None
        } else {
            Some(last.content.clone())
        }
    }

    fn file_revision(&self, path: &str, rev: u32) -> FileRevision {
        let stored = &self.depot[path][(rev - 1) as usize];
        let integrations = self
            .integration_overrides
            .get(&(path.to_string(), rev))
            .cloned()
            .unwrap_or_else(|| stored.integrations.clone());
        let (digest, file_size) = if stored.action.has_content() {
            let (digest, size) =
                canonical_digest(&stored.content, stored.file_type.keyword_expansion());
            (Some(digest), size)
        } else {
            (None, 0)
        };
        FileRevision {
            depot_path: path.to_string(),
            rev,
            change: stored.change,
            action: stored.action,
            file_type: stored.file_type.clone(),
            digest,
            file_size,
            integrations,
        }
    }

    fn head_rev(&self, path: &str) -> u32 {
        self.depot.get(path).map(|r| r.len() as u32).unwrap_or(0)
    }

    fn head_deleted(&self, path: &str) -> bool {
        self.depot
            .get(path)
            .and_then(|r| r.last())
            .is_some_and(|r| r.action.is_delete())
    }

    fn path_in_view(&self, path: &str) -> bool {
        let mut verdict = false;
        for (exclude, pattern) in &self.view_depot_lines {
            if let Ok(Some(_)) = wildcard_translate(pattern, pattern, path, self.case_sensitive) {
                verdict = !exclude;
            }
        }
        verdict
    }

    fn open_mut(&mut self, change: u64, path: &str) -> Result<&mut PendingOpen, RelayError> {
        self.pending
            .get_mut(&change)
            .and_then(|p| p.opens.get_mut(path))
            .ok_or_else(|| RelayError::Server(format!("`{path}` is not opened in change {change}")))
    }

    /// The how code a staged integration submits as, given the final open
    /// action and the resolve directive.
    fn how_for(open_action: FileAction, staged: &StagedInteg) -> HowCode {
        if staged.for_delete {
            return HowCode::DeleteFrom;
        }
        match staged.directive.as_ref() {
            Some(IntegrationDirective::AcceptYours) => HowCode::Ignored,
            Some(IntegrationDirective::AcceptMerged) => HowCode::MergeFrom,
            Some(IntegrationDirective::AcceptEdit(_)) => HowCode::EditFrom,
            Some(IntegrationDirective::AcceptTheirs)
            | Some(IntegrationDirective::ActionResolve(_))
            | None => match open_action {
                FileAction::Branch => HowCode::BranchFrom,
                FileAction::Add => HowCode::AddFrom,
                _ => HowCode::CopyFrom,
            },
        }
    }

    // --- test-facing history builders (wrap the target write path) ---

    fn one_file_change(
        &mut self,
        description: &str,
        stage: impl FnOnce(&mut Self, u64) -> Result<(), RelayError>,
    ) -> u64 {
        let change = self
            .create_change(description)
            .expect("create change in simulator");
        stage(self, change).expect("stage simulator change");
        self.submit(change).expect("submit simulator change")
    }

    pub fn seed_add(&mut self, path: &str, file_type: FileType, content: &[u8]) -> u64 {
        let path = path.to_string();
        let content = content.to_vec();
        self.one_file_change(&format!("add {path}"), |server, change| {
            server.write_workspace_file(&path, &content)?;
            server.open_add(change, &path, &file_type, false)
        })
    }

    pub fn seed_edit(&mut self, path: &str, content: &[u8]) -> u64 {
        let path = path.to_string();
        let content = content.to_vec();
        self.one_file_change(&format!("edit {path}"), |server, change| {
            server.sync_file(&path, server.head_rev(&path))?;
            server.open_edit(change, &path)?;
            server.write_workspace_file(&path, &content)
        })
    }

    pub fn seed_delete(&mut self, path: &str) -> u64 {
        let path = path.to_string();
        self.one_file_change(&format!("delete {path}"), |server, change| {
            server.open_delete(change, &path)
        })
    }

    pub fn seed_move(&mut self, from: &str, to: &str) -> u64 {
        let from = from.to_string();
        let to = to.to_string();
        self.one_file_change(&format!("move {from} to {to}"), |server, change| {
            server.sync_file(&from, server.head_rev(&from))?;
            server.open_edit(change, &from)?;
            server.open_move(change, &from, &to)
        })
    }

    /// Integrate `from`'s full range into `to` and resolve with the given
    /// directive.
    pub fn seed_integrate(
        &mut self,
        from: &str,
        to: &str,
        directive: IntegrationDirective,
    ) -> u64 {
        let end = self.head_rev(from);
        self.seed_integrate_range(from, 0, end, to, directive)
    }

    pub fn seed_integrate_range(
        &mut self,
        from: &str,
        start_rev: u32,
        end_rev: u32,
        to: &str,
        directive: IntegrationDirective,
    ) -> u64 {
        let from = from.to_string();
        let to = to.to_string();
        self.one_file_change(&format!("integrate {from} to {to}"), |server, change| {
            let request = IntegrateRequest {
                from_path: from.clone(),
                to_path: to.clone(),
                start_rev,
                end_rev,
                force: false,
                for_delete: false,
            };
            server.integrate(change, &request)?;
            server.resolve(&to, &directive)
        })
    }

    pub fn counter_value(&self, name: &str) -> u64 {
        self.counters.get(name).copied().unwrap_or(0)
    }
}

impl SourceSession for MemoryServer {
    fn port(&self) -> &str {
        &self.port
    }

    fn connect(&mut self) -> Result<(), RelayError> {
        Ok(())
    }

    fn reset(&mut self) -> Result<(), RelayError> {
        self.reset_count += 1;
        Ok(())
    }

    fn install_client(
        &mut self,
        _client: &str,
        _root: &Path,
        view_lines: &[String],
    ) -> Result<(), RelayError> {
        self.view_depot_lines = view_lines
            .iter()
            .filter_map(|line| {
                let depot = line.split_whitespace().next()?;
                match depot.strip_prefix('-') {
                    Some(stripped) => Some((true, stripped.to_string())),
                    None => Some((false, depot.to_string())),
                }
            })
            .collect();
        Ok(())
    }

    fn changes_in_view(&mut self, above: u64) -> Result<Vec<u64>, RelayError> {
        let mut numbers = Vec::new();
        for &change in self.changes.keys() {
            if change <= above {
                continue;
            }
            let touches_view = self.depot.iter().any(|(path, revs)| {
                revs.iter().any(|r| r.change == change) && self.path_in_view(path)
            });
            if touches_view {
                numbers.push(change);
            }
        }
        Ok(numbers)
    }

    fn describe(&mut self, change: u64) -> Result<ChangeInfo, RelayError> {
        let (user, description, time) = self
            .changes
            .get(&change)
            .cloned()
            .ok_or_else(|| RelayError::Server(format!("no such change {change}")))?;
        let mut revisions = Vec::new();
        for (path, revs) in &self.depot {
            for (index, stored) in revs.iter().enumerate() {
                if stored.change == change {
                    revisions.push(self.file_revision(path, (index + 1) as u32));
                }
            }
        }
        Ok(ChangeInfo {
            number: change,
            user,
            client: "transfer".to_string(),
            description,
            time,
            revisions,
        })
    }

    fn filelog(&mut self, path: &str) -> Result<Vec<FileRevision>, RelayError> {
        let count = self.head_rev(path);
        Ok((1..=count).map(|rev| self.file_revision(path, rev)).collect())
    }

    fn print(&mut self, path: &str, rev: u32) -> Result<Vec<u8>, RelayError> {
        if self.obliterated.contains(&(path.to_string(), rev)) {
            return Err(RelayError::ObliteratedRevision {
                path: path.to_string(),
                rev,
            });
        }
        let revs = self
            .depot
            .get(path)
            .ok_or_else(|| RelayError::Server(format!("no such file `{path}`")))?;
        let stored = revs
            .get((rev.max(1) - 1) as usize)
            .ok_or_else(|| RelayError::Server(format!("no revision `{path}#{rev}`")))?;
        if !stored.action.has_content() {
            return Err(RelayError::Server(format!(
                "no content at `{path}#{rev}` ({})",
                stored.action
            )));
        }
        Ok(stored.content.clone())
    }

    fn list_streams(&mut self, glob: &str) -> Result<Vec<StreamSpec>, RelayError> {
        let mut matched = Vec::new();
        for spec in self.streams.values() {
            if wildcard_translate(glob, glob, &spec.name, true)?.is_some() {
                matched.push(spec.clone());
            }
        }
        Ok(matched)
    }
}

impl TargetSession for MemoryServer {
    fn port(&self) -> &str {
        &self.port
    }

    fn connect(&mut self) -> Result<(), RelayError> {
        Ok(())
    }

    fn reset(&mut self) -> Result<(), RelayError> {
        self.reset_count += 1;
        Ok(())
    }

    fn capabilities(&mut self) -> Result<Capabilities, RelayError> {
        Ok(self.capabilities)
    }

    fn get_counter(&mut self, name: &str) -> Result<u64, RelayError> {
        Ok(self.counter_value(name))
    }

    fn set_counter(&mut self, name: &str, value: u64, _force: bool) -> Result<(), RelayError> {
        self.counters.insert(name.to_string(), value);
        Ok(())
    }

    fn install_client(
        &mut self,
        client: &str,
        root: &Path,
        view_lines: &[String],
    ) -> Result<(), RelayError> {
        SourceSession::install_client(self, client, root, view_lines)
    }

    fn install_stream_client(
        &mut self,
        _client: &str,
        _root: &Path,
        stream: &str,
    ) -> Result<(), RelayError> {
        self.switch_stream(stream)
    }

    fn list_streams(&mut self, glob: &str) -> Result<Vec<StreamSpec>, RelayError> {
        SourceSession::list_streams(self, glob)
    }

    fn create_stream(&mut self, spec: &StreamSpec) -> Result<(), RelayError> {
        self.streams.insert(spec.name.clone(), spec.clone());
        Ok(())
    }

    fn switch_stream(&mut self, stream: &str) -> Result<(), RelayError> {
        if !self.streams.contains_key(stream) {
            return Err(RelayError::Server(format!("no such stream `{stream}`")));
        }
        self.view_depot_lines = vec![(false, format!("{stream}/..."))];
        Ok(())
    }

    fn filelog(&mut self, path: &str) -> Result<Vec<FileRevision>, RelayError> {
        SourceSession::filelog(self, path)
    }

    fn print(&mut self, path: &str, rev: u32) -> Result<Vec<u8>, RelayError> {
        SourceSession::print(self, path, rev)
    }

    fn change_descriptions(&mut self) -> Result<Vec<(u64, String)>, RelayError> {
        Ok(self
            .changes
            .iter()
            .map(|(&n, (_, d, _))| (n, d.clone()))
            .collect())
    }

    fn revert_all(&mut self) -> Result<(), RelayError> {
        for pending in self.pending.values_mut() {
            pending.opens.clear();
        }
        Ok(())
    }

    fn has_foreign_opens(&mut self) -> Result<bool, RelayError> {
        Ok(self.foreign_opens)
    }

    fn create_change(&mut self, description: &str) -> Result<u64, RelayError> {
        let number = self.next_change;
        self.next_change += 1;
        self.pending.insert(
            number,
            PendingChange {
                description: description.to_string(),
                opens: BTreeMap::new(),
            },
        );
        Ok(number)
    }

    fn pending_changes(&mut self) -> Result<Vec<(u64, usize)>, RelayError> {
        Ok(self
            .pending
            .iter()
            .map(|(&n, p)| (n, p.opens.len()))
            .collect())
    }

    fn delete_change(&mut self, change: u64) -> Result<(), RelayError> {
        match self.pending.remove(&change) {
            Some(p) if p.opens.is_empty() => Ok(()),
            Some(p) => {
                self.pending.insert(change, p);
                Err(RelayError::Server(format!(
                    "change {change} has open files"
                )))
            }
            None => Err(RelayError::Server(format!("no pending change {change}"))),
        }
    }

    fn sync_file(&mut self, path: &str, rev: u32) -> Result<(), RelayError> {
        if rev == 0 {
            self.have.remove(path);
            self.workspace.remove(path);
            return Ok(());
        }
        let revs = self
            .depot
            .get(path)
            .ok_or_else(|| RelayError::Server(format!("no such file `{path}`")))?;
        let stored = revs
            .get((rev - 1) as usize)
            .ok_or_else(|| RelayError::Server(format!("no revision `{path}#{rev}`")))?;
        self.have.insert(path.to_string(), rev);
        if stored.action.has_content() {
            self.workspace.insert(path.to_string(), stored.content.clone());
        } else {
            self.workspace.remove(path);
        }
        Ok(())
    }

    fn write_workspace_file(&mut self, path: &str, content: &[u8]) -> Result<(), RelayError> {
        self.workspace.insert(path.to_string(), content.to_vec());
        Ok(())
    }

    fn read_workspace_file(&mut self, path: &str) -> Result<Vec<u8>, RelayError> {
        self.workspace
            .get(path)
            .cloned()
            .ok_or_else(|| RelayError::Server(format!("`{path}` is not in the workspace")))
    }

    fn open_add(
        &mut self,
        change: u64,
        path: &str,
        file_type: &FileType,
        downgrade: bool,
    ) -> Result<(), RelayError> {
        if self.head_rev(path) > 0 && !self.head_deleted(path) && !downgrade {
            return Err(RelayError::Server(format!(
                "can't add existing file `{path}`"
            )));
        }
        let open = PendingOpen {
            action: FileAction::Add,
            file_type: file_type.clone(),
            move_from: None,
            integrations: Vec::new(),
            nokeywords: false,
        };
        self.pending
            .get_mut(&change)
            .ok_or_else(|| RelayError::Server(format!("no pending change {change}")))?
            .opens
            .insert(path.to_string(), open);
        Ok(())
    }

    fn open_edit(&mut self, change: u64, path: &str) -> Result<(), RelayError> {
        if self.head_rev(path) == 0 || self.head_deleted(path) {
            return Err(RelayError::Server(format!(
                "`{path}` - file(s) not on client"
            )));
        }
        let file_type = self.depot[path].last().unwrap().file_type.clone();
        self.pending
            .get_mut(&change)
            .ok_or_else(|| RelayError::Server(format!("no pending change {change}")))?
            .opens
            .insert(
                path.to_string(),
                PendingOpen {
                    action: FileAction::Edit,
                    file_type,
                    move_from: None,
                    integrations: Vec::new(),
                    nokeywords: false,
                },
            );
        Ok(())
    }

    fn open_delete(&mut self, change: u64, path: &str) -> Result<(), RelayError> {
        if self.head_rev(path) == 0 || self.head_deleted(path) {
            return Err(RelayError::Server(format!(
                "`{path}` - file(s) not on client"
            )));
        }
        let file_type = self.depot[path].last().unwrap().file_type.clone();
        self.pending
            .get_mut(&change)
            .ok_or_else(|| RelayError::Server(format!("no pending change {change}")))?
            .opens
            .insert(
                path.to_string(),
                PendingOpen {
                    action: FileAction::Delete,
                    file_type,
                    move_from: None,
                    integrations: Vec::new(),
                    nokeywords: false,
                },
            );
        self.workspace.remove(path);
        Ok(())
    }

    fn open_move(&mut self, change: u64, from: &str, to: &str) -> Result<(), RelayError> {
        if !self.capabilities.supports_move {
            return Err(RelayError::MoveRefused {
                from: from.to_string(),
                to: to.to_string(),
                detail: "server does not support move".to_string(),
            });
        }
        let pending = self
            .pending
            .get_mut(&change)
            .ok_or_else(|| RelayError::Server(format!("no pending change {change}")))?;
        let from_open = pending.opens.remove(from).ok_or_else(|| {
            RelayError::Server(format!("`{from}` must be opened for edit before move"))
        })?;
        pending.opens.insert(
            from.to_string(),
            PendingOpen {
                action: FileAction::MoveDelete,
                move_from: None,
                integrations: Vec::new(),
                nokeywords: false,
                file_type: from_open.file_type.clone(),
            },
        );
        pending.opens.insert(
            to.to_string(),
            PendingOpen {
                action: FileAction::MoveAdd,
                move_from: Some(from.to_string()),
                integrations: Vec::new(),
                nokeywords: false,
                file_type: from_open.file_type,
            },
        );
        if let Some(content) = self.workspace.remove(from) {
            self.workspace.insert(to.to_string(), content);
        }
        Ok(())
    }

    fn integrate(&mut self, change: u64, request: &IntegrateRequest) -> Result<(), RelayError> {
        let key = (request.from_path.clone(), request.to_path.clone());
        if self.refuse_integrate_unforced.contains(&key) && !request.force {
            return Err(RelayError::IntegrateRefused {
                path: request.to_path.clone(),
                detail: "integration engine refused the record".to_string(),
            });
        }
        let from_head = self.head_rev(&request.from_path);
        if from_head < request.end_rev {
            return Err(RelayError::IntegrateRefused {
                path: request.to_path.clone(),
                detail: format!(
                    "`{}#{}` does not exist on the target",
                    request.from_path, request.end_rev
                ),
            });
        }
        let pending = self
            .pending
            .get_mut(&change)
            .ok_or_else(|| RelayError::Server(format!("no pending change {change}")))?;
        let staged = StagedInteg {
            from_path: request.from_path.clone(),
            start_rev: request.start_rev,
            end_rev: request.end_rev,
            for_delete: request.for_delete,
            directive: None,
        };
        let entry = pending
            .opens
            .entry(request.to_path.clone())
            .or_insert_with(|| {
                let target_exists =
                    self.depot.get(&request.to_path).is_some_and(|revs| {
                        revs.last().is_some_and(|r| !r.action.is_delete())
                    });
                let action = if request.for_delete {
                    FileAction::Delete
                } else if target_exists {
                    FileAction::Integrate
                } else {
                    FileAction::Branch
                };
                let file_type = self.depot[&request.from_path]
                    .last()
                    .unwrap()
                    .file_type
                    .clone();
                PendingOpen {
                    action,
                    file_type,
                    move_from: None,
                    integrations: Vec::new(),
                    nokeywords: false,
                }
            });
        entry.integrations.push(staged);
        Ok(())
    }

    fn resolve(&mut self, path: &str, directive: &IntegrationDirective) -> Result<(), RelayError> {
        // Compute the content effect before borrowing the open mutably.
        let pending_change = self
            .pending
            .iter()
            .find(|(_, p)| p.opens.contains_key(path))
            .map(|(&n, _)| n)
            .ok_or_else(|| RelayError::Server(format!("`{path}` has nothing to resolve")))?;
        let staged = {
            let open = self.open_mut(pending_change, path)?;
            open.integrations
                .iter()
                .find(|s| s.directive.is_none())
                .cloned()
                .ok_or_else(|| {
                    RelayError::Server(format!("`{path}` has no unresolved integration"))
                })?
        };
        let new_content = match directive {
            IntegrationDirective::AcceptTheirs | IntegrationDirective::AcceptMerged => {
                if staged.for_delete {
                    None
                } else {
                    let revs = self.depot.get(&staged.from_path).ok_or_else(|| {
                        RelayError::Server(format!("no such file `{}`", staged.from_path))
                    })?;
                    Some(
                        revs.get((staged.end_rev.max(1) - 1) as usize)
                            .map(|r| r.content.clone())
                            .unwrap_or_default(),
                    )
                }
            }
            IntegrationDirective::AcceptEdit(bytes) => Some(bytes.clone()),
            IntegrationDirective::AcceptYours | IntegrationDirective::ActionResolve(_) => None,
        };
        {
            let open = self.open_mut(pending_change, path)?;
            if let Some(slot) = open
                .integrations
                .iter_mut()
                .find(|s| s.directive.is_none())
            {
                slot.directive = Some(directive.clone());
            }
        }
        if let Some(content) = new_content {
            self.workspace.insert(path.to_string(), content);
        }
        Ok(())
    }

    fn reopen_type(
        &mut self,
        change: u64,
        path: &str,
        file_type: &FileType,
    ) -> Result<(), RelayError> {
        let open = self.open_mut(change, path)?;
        open.file_type = file_type.clone();
        Ok(())
    }

    fn reopen_nokeywords(&mut self, change: u64, path: &str) -> Result<(), RelayError> {
        let open = self.open_mut(change, path)?;
        open.nokeywords = true;
        Ok(())
    }

    fn revert_file(&mut self, path: &str) -> Result<(), RelayError> {
        for pending in self.pending.values_mut() {
            pending.opens.remove(path);
        }
        Ok(())
    }

    fn opened(
        &mut self,
        change: u64,
    ) -> Result<Box<dyn Iterator<Item = OpenedFile> + Send>, RelayError> {
        let pending = self
            .pending
            .get(&change)
            .ok_or_else(|| RelayError::Server(format!("no pending change {change}")))?;
        let files: Vec<OpenedFile> = pending
            .opens
            .iter()
            .map(|(path, open)| OpenedFile {
                depot_path: path.clone(),
                action: open.action,
            })
            .collect();
        Ok(Box::new(files.into_iter()))
    }

    fn submit(&mut self, change: u64) -> Result<u64, RelayError> {
        let pending = self
            .pending
            .get(&change)
            .ok_or_else(|| RelayError::Server(format!("no pending change {change}")))?;
        if pending.opens.is_empty() {
            return Err(RelayError::Server(format!(
                "no files to submit in change {change}"
            )));
        }
        if self.trigger_rejections > 0 {
            self.trigger_rejections -= 1;
            return Err(RelayError::TriggerRejection(
                "submit validation failed".to_string(),
            ));
        }
        for (path, open) in &pending.opens {
            if open.file_type.keyword_expansion()
                && !open.nokeywords
                && self.fail_keyword_digest.contains(path)
            {
                return Err(RelayError::KeywordDigestMismatch { path: path.clone() });
            }
        }

        let pending = self.pending.remove(&change).unwrap();
        // The server renumbers at commit when a later change got submitted
        // in the meantime.
        let last_submitted = self.changes.keys().next_back().copied().unwrap_or(0);
        let submitted = if change > last_submitted {
            change
        } else {
            let n = self.next_change;
            self.next_change += 1;
            n
        };

        // Head revisions before anything in this submit is appended, so
        // move pairs land their records at stable numbers regardless of
        // staging order.
        let pre_heads: HashMap<String, u32> = pending
            .opens
            .keys()
            .map(|p| (p.clone(), self.head_rev(p)))
            .collect();

        let mut mirrors: Vec<(String, u32, IntegrationRecord)> = Vec::new();
        for (path, open) in &pending.opens {
            let new_rev = self.head_rev(path) + 1;
            let content = if open.action.has_content() {
                self.workspace.get(path).cloned().unwrap_or_default()
            } else {
                Vec::new()
            };
            let mut integrations = Vec::new();
            if let Some(from) = &open.move_from {
                let from_head = pre_heads.get(from).copied().unwrap_or(0);
                integrations.push(IntegrationRecord::new(
                    HowCode::MovedFrom,
                    from,
                    0,
                    from_head,
                ));
                mirrors.push((
                    from.clone(),
                    from_head + 1,
                    IntegrationRecord::new(HowCode::MovedInto, path, new_rev - 1, new_rev),
                ));
            }
            for staged in &open.integrations {
                let how = MemoryServer::how_for(open.action, staged);
                integrations.push(IntegrationRecord::new(
                    how,
                    &staged.from_path,
                    staged.start_rev,
                    staged.end_rev,
                ));
                mirrors.push((
                    staged.from_path.clone(),
                    staged.end_rev,
                    IntegrationRecord::new(how.mirror(), path, new_rev - 1, new_rev),
                ));
            }
            self.depot.entry(path.clone()).or_default().push(StoredRev {
                action: open.action,
                file_type: open.file_type.clone(),
                content,
                change: submitted,
                integrations,
            });
            self.have.insert(path.clone(), new_rev);
        }
        for (path, rev, record) in mirrors {
            if let Some(revs) = self.depot.get_mut(&path)
                && let Some(stored) = revs.get_mut((rev.max(1) - 1) as usize)
            {
                stored.integrations.push(record);
            }
        }

        self.changes.insert(
            submitted,
            (self.user.clone(), pending.description.clone(), self.clock),
        );
        self.clock += 60;
        Ok(submitted)
    }
}
