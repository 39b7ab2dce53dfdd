//! Error types for the depot-relay crate.
//!
//! This module defines a unified error enumeration used across configuration
//! loading, view mapping, revision classification, workspace execution and
//! change submission. It integrates with `thiserror` to provide rich
//! `Display` implementations and error source chaining where applicable.
//!
//! Notes:
//! - Each variant carries contextual details via its message payload.
//! - Variants that drive fallback behavior in the workspace executor
//!   (`IntegrateRefused`, `MoveRefused`, `KeywordDigestMismatch`,
//!   `TriggerRejection`, `ObliteratedRevision`) are matched structurally,
//!   never by message text.

use thiserror::Error;

#[derive(Error, Debug)]
/// Unified error enumeration for the depot-relay crate.
pub enum RelayError {
    /// Configuration file missing, unparseable, or failing validation.
    /// Fatal at startup; the process exits with status 2.
    #[error("Config error: {0}")]
    Config(String),

    /// A view mapping line is malformed or its wildcards do not pair up.
    #[error("Invalid view mapping: {0}")]
    InvalidView(String),

    /// A depot path failed to parse or encode.
    #[error("The `{0}` is not a valid depot path.")]
    InvalidDepotPath(String),

    /// Unknown file action token in server metadata.
    #[error("The `{0}` is not a valid file action.")]
    InvalidFileAction(String),

    /// Unknown file type token in server metadata.
    #[error("The `{0}` is not a valid file type.")]
    InvalidFileType(String),

    /// Unknown integration `how` token in a filelog record.
    #[error("The `{0}` is not a valid integration kind.")]
    InvalidHowCode(String),

    /// A tagged server response was missing a required field.
    #[error("Malformed server response: missing field `{0}`")]
    MissingField(String),

    /// The server refused an integrate that the engine staged.
    /// The executor retries once with the force flag before giving up.
    #[error("Integrate refused for `{path}`: {detail}")]
    IntegrateRefused { path: String, detail: String },

    /// The server refused a move pair (old integration engine, or a move
    /// across incompatible types). The executor degrades to delete + add.
    #[error("Move refused for `{from}` -> `{to}`: {detail}")]
    MoveRefused {
        from: String,
        to: String,
        detail: String,
    },

    /// Submit-time keyword digest mismatch; the offending file is reopened
    /// with keyword expansion disabled and the change resubmitted.
    #[error("Keyword digest mismatch on `{path}` at submit")]
    KeywordDigestMismatch { path: String },

    /// Submit rejected by a server trigger; retryable with bounded backoff.
    #[error("Submit rejected by trigger: {0}")]
    TriggerRejection(String),

    /// The staged integration source no longer exists on the source server.
    #[error("Revision `{path}#{rev}` has been obliterated")]
    ObliteratedRevision { path: String, rev: u32 },

    /// A change failed to submit and strict mode is in effect.
    #[error("Change {source_change} failed to submit: {detail}")]
    SubmitFailed { source_change: u64, detail: String },

    /// The opened set on the target does not match the staged intents.
    #[error("Opened files on target do not match staged change: {0}")]
    OpenedSetMismatch(String),

    /// The high-water counter moved underneath us, or the target workspace
    /// has opened files belonging to another process. Fatal.
    #[error("Precondition violated: {0}")]
    Precondition(String),

    /// Transport-level failure talking to a server.
    #[error("Connection error ({server}): {detail}")]
    Connection { server: String, detail: String },

    /// The server returned an error the engine has no handling for.
    #[error("Server error: {0}")]
    Server(String),

    /// I/O error from the workspace or log files.
    #[error("IO Error: {0}")]
    Io(#[from] std::io::Error),
}

impl RelayError {
    /// Build a config error from anything displayable.
    pub fn config(msg: impl std::fmt::Display) -> Self {
        RelayError::Config(msg.to_string())
    }

    /// True when the error is worth retrying at the operation level.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            RelayError::Connection { .. } | RelayError::TriggerRejection(_)
        )
    }
}
