//! Session interfaces the replication engine consumes.
//!
//! The engine never talks wire protocol itself: it drives a read-only
//! [`SourceSession`] and a read-write [`TargetSession`]. `p4.rs` implements
//! both over the command-line transport; `memory.rs` provides a
//! deterministic in-process pair for the test suite.
//!
//! All depot paths crossing these interfaces are in decoded (local) form;
//! implementations apply the wire encoding of [`crate::paths::encode_wire`]
//! themselves.

pub mod memory;
pub mod p4;
pub mod records;

use std::path::Path;

use crate::errors::RelayError;
use crate::replicate::intent::IntegrationDirective;
use records::{ChangeInfo, FileRevision, FileType, OpenedFile, StreamSpec};

/// Target server traits discovered by a one-shot probe at setup.
#[derive(Debug, Clone, Copy, Default)]
pub struct Capabilities {
    /// Commit servers require exclusive-lock (`+l`) types to be set only
    /// after the initial open.
    pub commit_server: bool,
    /// Old integration engines refuse `move` pairs entirely.
    pub supports_move: bool,
}

/// One staged integrate request against the target.
#[derive(Debug, Clone)]
pub struct IntegrateRequest {
    pub from_path: String,
    pub to_path: String,
    /// Exclusive start of the partner revision range.
    pub start_rev: u32,
    pub end_rev: u32,
    /// Re-stage with the server's force flag.
    pub force: bool,
    /// Propagate a delete through the integration.
    pub for_delete: bool,
}

/// Read-only view of the source server.
pub trait SourceSession {
    /// The address the server was reached at, as used in change markers.
    fn port(&self) -> &str;

    fn connect(&mut self) -> Result<(), RelayError>;

    /// Drop and reopen the connection (proxy recovery).
    fn reset(&mut self) -> Result<(), RelayError>;

    /// Install the transfer workspace with the given view lines.
    fn install_client(
        &mut self,
        client: &str,
        root: &Path,
        view_lines: &[String],
    ) -> Result<(), RelayError>;

    /// Submitted change numbers above `above` touching the transfer
    /// workspace view, in ascending order.
    fn changes_in_view(&mut self, above: u64) -> Result<Vec<u64>, RelayError>;

    /// Full change metadata with every revision's filelog attached.
    fn describe(&mut self, change: u64) -> Result<ChangeInfo, RelayError>;

    /// The ordered revision list of one depot path.
    fn filelog(&mut self, path: &str) -> Result<Vec<FileRevision>, RelayError>;

    /// Content of one revision. Returns
    /// [`RelayError::ObliteratedRevision`] when the revision is gone.
    fn print(&mut self, path: &str, rev: u32) -> Result<Vec<u8>, RelayError>;

    /// Streams matching a wildcard pattern.
    fn list_streams(&mut self, glob: &str) -> Result<Vec<StreamSpec>, RelayError>;
}

/// Read-write session against the target server and its workspace.
pub trait TargetSession {
    fn port(&self) -> &str;

    fn connect(&mut self) -> Result<(), RelayError>;

    fn reset(&mut self) -> Result<(), RelayError>;

    /// One-shot probe for server traits; called once at setup.
    fn capabilities(&mut self) -> Result<Capabilities, RelayError>;

    // --- counter ---

    /// Read the named counter; 0 when unset.
    fn get_counter(&mut self, name: &str) -> Result<u64, RelayError>;

    /// Write the counter. `force` selects the superuser write path.
    fn set_counter(&mut self, name: &str, value: u64, force: bool) -> Result<(), RelayError>;

    // --- provisioning ---

    fn install_client(
        &mut self,
        client: &str,
        root: &Path,
        view_lines: &[String],
    ) -> Result<(), RelayError>;

    /// Point the transfer workspace at a stream instead of a view.
    fn install_stream_client(
        &mut self,
        client: &str,
        root: &Path,
        stream: &str,
    ) -> Result<(), RelayError>;

    fn list_streams(&mut self, glob: &str) -> Result<Vec<StreamSpec>, RelayError>;

    fn create_stream(&mut self, spec: &StreamSpec) -> Result<(), RelayError>;

    /// Switch the workspace to the named stream before executing a change
    /// against that stream's files.
    fn switch_stream(&mut self, stream: &str) -> Result<(), RelayError>;

    // --- target history ---

    fn filelog(&mut self, path: &str) -> Result<Vec<FileRevision>, RelayError>;

    fn print(&mut self, path: &str, rev: u32) -> Result<Vec<u8>, RelayError>;

    /// Descriptions of submitted changes, ascending by change number.
    fn change_descriptions(&mut self) -> Result<Vec<(u64, String)>, RelayError>;

    // --- workspace staging ---

    /// Revert every open file in the transfer workspace.
    fn revert_all(&mut self) -> Result<(), RelayError>;

    /// Are there opens in the workspace owned by another process?
    fn has_foreign_opens(&mut self) -> Result<bool, RelayError>;

    /// Allocate a pending change with the given description.
    fn create_change(&mut self, description: &str) -> Result<u64, RelayError>;

    /// Pending changes of the transfer workspace with their open counts.
    fn pending_changes(&mut self) -> Result<Vec<(u64, usize)>, RelayError>;

    /// Delete an (empty) pending change.
    fn delete_change(&mut self, change: u64) -> Result<(), RelayError>;

    /// Sync one file to the given revision (0 = none).
    fn sync_file(&mut self, path: &str, rev: u32) -> Result<(), RelayError>;

    /// Write content to the workspace file backing a depot path.
    fn write_workspace_file(&mut self, path: &str, content: &[u8]) -> Result<(), RelayError>;

    fn read_workspace_file(&mut self, path: &str) -> Result<Vec<u8>, RelayError>;

    /// Open for add. `downgrade` retries an add the server refused over a
    /// deleted head.
    fn open_add(
        &mut self,
        change: u64,
        path: &str,
        file_type: &FileType,
        downgrade: bool,
    ) -> Result<(), RelayError>;

    fn open_edit(&mut self, change: u64, path: &str) -> Result<(), RelayError>;

    fn open_delete(&mut self, change: u64, path: &str) -> Result<(), RelayError>;

    /// Open a move pair (the from-side must already be open for edit).
    /// Returns [`RelayError::MoveRefused`] when the server cannot move.
    fn open_move(&mut self, change: u64, from: &str, to: &str) -> Result<(), RelayError>;

    /// Stage an integrate. Returns [`RelayError::IntegrateRefused`] when
    /// the target's integration engine declines the record.
    fn integrate(&mut self, change: u64, request: &IntegrateRequest) -> Result<(), RelayError>;

    /// Apply one resolve directive to an open file.
    fn resolve(&mut self, path: &str, directive: &IntegrationDirective) -> Result<(), RelayError>;

    /// Change the opened file type. Applied at most once per file.
    fn reopen_type(&mut self, change: u64, path: &str, file_type: &FileType)
    -> Result<(), RelayError>;

    /// Reopen with keyword expansion disabled after a submit-time digest
    /// mismatch.
    fn reopen_nokeywords(&mut self, change: u64, path: &str) -> Result<(), RelayError>;

    fn revert_file(&mut self, path: &str) -> Result<(), RelayError>;

    /// The files opened in a pending change, as a finite restartable
    /// stream so large changes need not be collected eagerly.
    fn opened(&mut self, change: u64)
    -> Result<Box<dyn Iterator<Item = OpenedFile> + Send>, RelayError>;

    /// Submit the pending change; returns the (possibly renumbered)
    /// submitted change number. Structured errors:
    /// [`RelayError::TriggerRejection`] and
    /// [`RelayError::KeywordDigestMismatch`].
    fn submit(&mut self, change: u64) -> Result<u64, RelayError>;
}
