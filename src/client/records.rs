//! The metadata records the engine reads from a server: per-revision
//! actions, file types with their modifiers, integration records and change
//! descriptions.
//!
//! Every enum here carries the exact wire token set of the server family;
//! parsing is strict so an unrecognized token surfaces as an error instead
//! of being silently misclassified.

use std::fmt::{self, Display};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::errors::RelayError;

/// Head action of one file revision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FileAction {
    Add,
    Edit,
    Delete,
    Branch,
    Integrate,
    MoveAdd,
    MoveDelete,
    Purge,
    Archive,
    Import,
}

impl FileAction {
    /// Does this action leave content at the head revision?
    pub fn has_content(&self) -> bool {
        !matches!(
            self,
            FileAction::Delete | FileAction::MoveDelete | FileAction::Purge | FileAction::Archive
        )
    }

    /// Actions that remove the file from the head.
    pub fn is_delete(&self) -> bool {
        matches!(self, FileAction::Delete | FileAction::MoveDelete)
    }
}

impl FromStr for FileAction {
    type Err = RelayError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "add" => Ok(FileAction::Add),
            "edit" => Ok(FileAction::Edit),
            "delete" => Ok(FileAction::Delete),
            "branch" => Ok(FileAction::Branch),
            "integrate" => Ok(FileAction::Integrate),
            "move/add" => Ok(FileAction::MoveAdd),
            "move/delete" => Ok(FileAction::MoveDelete),
            "purge" => Ok(FileAction::Purge),
            "archive" => Ok(FileAction::Archive),
            "import" => Ok(FileAction::Import),
            _ => Err(RelayError::InvalidFileAction(s.to_string())),
        }
    }
}

impl Display for FileAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let token = match self {
            FileAction::Add => "add",
            FileAction::Edit => "edit",
            FileAction::Delete => "delete",
            FileAction::Branch => "branch",
            FileAction::Integrate => "integrate",
            FileAction::MoveAdd => "move/add",
            FileAction::MoveDelete => "move/delete",
            FileAction::Purge => "purge",
            FileAction::Archive => "archive",
            FileAction::Import => "import",
        };
        f.write_str(token)
    }
}

/// Base storage type of a file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BaseType {
    Text,
    Binary,
    Symlink,
    Unicode,
    Utf16,
    Apple,
}

impl BaseType {
    pub fn as_str(&self) -> &'static str {
        match self {
            BaseType::Text => "text",
            BaseType::Binary => "binary",
            BaseType::Symlink => "symlink",
            BaseType::Unicode => "unicode",
            BaseType::Utf16 => "utf16",
            BaseType::Apple => "apple",
        }
    }
}

/// A file type with its modifiers, e.g. `text+klx` or `binary+S4`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FileType {
    pub base: BaseType,
    /// `+k` (or `+ko`): keyword expansion on sync.
    pub keyword: bool,
    /// `+x`: executable bit.
    pub exec: bool,
    /// `+l`: exclusive open.
    pub exclusive: bool,
    /// `+m`: preserve modtime.
    pub modtime: bool,
    /// `+S` / `+Sn`: limited stored revisions.
    pub stored: Option<u32>,
    /// `+w`: always writable in the workspace.
    pub writable: bool,
}

impl FileType {
    pub fn new(base: BaseType) -> FileType {
        FileType {
            base,
            keyword: false,
            exec: false,
            exclusive: false,
            modtime: false,
            stored: None,
            writable: false,
        }
    }

    pub fn text() -> FileType {
        FileType::new(BaseType::Text)
    }

    pub fn binary() -> FileType {
        FileType::new(BaseType::Binary)
    }

    pub fn with_keyword(mut self) -> FileType {
        self.keyword = true;
        self
    }

    pub fn with_exclusive(mut self) -> FileType {
        self.exclusive = true;
        self
    }

    /// Does the target digest content in its keyword-canonical form?
    /// Only text-family bases expand keywords.
    pub fn keyword_expansion(&self) -> bool {
        self.keyword && matches!(self.base, BaseType::Text | BaseType::Unicode)
    }

    /// The same type with keyword expansion stripped, as produced by a
    /// nokeywords reopen.
    pub fn without_keyword(&self) -> FileType {
        let mut stripped = self.clone();
        stripped.keyword = false;
        stripped
    }

    /// The same type without the exclusive-open modifier. Commit-server
    /// targets only accept `+l` on a reopen, never on the initial open.
    pub fn without_exclusive(&self) -> FileType {
        let mut stripped = self.clone();
        stripped.exclusive = false;
        stripped
    }
}

impl FromStr for FileType {
    type Err = RelayError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (base_text, modifier_text) = match s.split_once('+') {
            Some((b, m)) => (b, m),
            None => (s, ""),
        };
        let base = match base_text {
            "text" | "ctext" | "ltext" => BaseType::Text,
            "binary" | "ubinary" | "xbinary" => BaseType::Binary,
            "symlink" => BaseType::Symlink,
            "unicode" | "utf8" => BaseType::Unicode,
            "utf16" => BaseType::Utf16,
            "apple" => BaseType::Apple,
            _ => return Err(RelayError::InvalidFileType(s.to_string())),
        };
        let mut file_type = FileType::new(base);
        let mut chars = modifier_text.chars().peekable();
        while let Some(c) = chars.next() {
            match c {
                'k' => {
                    file_type.keyword = true;
                    // `+ko` is a narrower keyword set; same canonical rule.
                    if chars.peek() == Some(&'o') {
                        chars.next();
                    }
                }
                'x' => file_type.exec = true,
                'l' => file_type.exclusive = true,
                'm' => file_type.modtime = true,
                'w' => file_type.writable = true,
                'S' => {
                    let mut digits = String::new();
                    while let Some(d) = chars.peek() {
                        if d.is_ascii_digit() {
                            digits.push(*d);
                            chars.next();
                        } else {
                            break;
                        }
                    }
                    let n = if digits.is_empty() {
                        1
                    } else {
                        digits
                            .parse()
                            .map_err(|_| RelayError::InvalidFileType(s.to_string()))?
                    };
                    file_type.stored = Some(n);
                }
                'C' | 'D' | 'F' => {} // server storage hints, not replicated
                _ => return Err(RelayError::InvalidFileType(s.to_string())),
            }
        }
        Ok(file_type)
    }
}

impl Display for FileType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.base.as_str())?;
        if self.keyword
            || self.exec
            || self.exclusive
            || self.modtime
            || self.writable
            || self.stored.is_some()
        {
            f.write_str("+")?;
            if self.keyword {
                f.write_str("k")?;
            }
            if self.exclusive {
                f.write_str("l")?;
            }
            if self.modtime {
                f.write_str("m")?;
            }
            if self.writable {
                f.write_str("w")?;
            }
            if self.exec {
                f.write_str("x")?;
            }
            match self.stored {
                Some(1) => f.write_str("S")?,
                Some(n) => write!(f, "S{n}")?,
                None => {}
            }
        }
        Ok(())
    }
}

/// The directed "how" of one integration record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum HowCode {
    BranchFrom,
    BranchInto,
    CopyFrom,
    CopyInto,
    MergeFrom,
    MergeInto,
    EditFrom,
    EditInto,
    Ignored,
    IgnoredBy,
    DeleteFrom,
    DeleteInto,
    MovedFrom,
    MovedInto,
    AddFrom,
    AddInto,
}

impl HowCode {
    /// "from" records describe where this revision came from; "into"
    /// records mirror them on the partner.
    pub fn is_from(&self) -> bool {
        matches!(
            self,
            HowCode::BranchFrom
                | HowCode::CopyFrom
                | HowCode::MergeFrom
                | HowCode::EditFrom
                | HowCode::Ignored
                | HowCode::DeleteFrom
                | HowCode::MovedFrom
                | HowCode::AddFrom
        )
    }

    /// The paired code on the partner revision.
    pub fn mirror(&self) -> HowCode {
        match self {
            HowCode::BranchFrom => HowCode::BranchInto,
            HowCode::BranchInto => HowCode::BranchFrom,
            HowCode::CopyFrom => HowCode::CopyInto,
            HowCode::CopyInto => HowCode::CopyFrom,
            HowCode::MergeFrom => HowCode::MergeInto,
            HowCode::MergeInto => HowCode::MergeFrom,
            HowCode::EditFrom => HowCode::EditInto,
            HowCode::EditInto => HowCode::EditFrom,
            HowCode::Ignored => HowCode::IgnoredBy,
            HowCode::IgnoredBy => HowCode::Ignored,
            HowCode::DeleteFrom => HowCode::DeleteInto,
            HowCode::DeleteInto => HowCode::DeleteFrom,
            HowCode::MovedFrom => HowCode::MovedInto,
            HowCode::MovedInto => HowCode::MovedFrom,
            HowCode::AddFrom => HowCode::AddInto,
            HowCode::AddInto => HowCode::AddFrom,
        }
    }

    /// "from" codes that supply the content of this revision. `Ignored`
    /// is deliberately absent: it records a discarded source.
    pub fn supplies_content(&self) -> bool {
        matches!(
            self,
            HowCode::BranchFrom
                | HowCode::CopyFrom
                | HowCode::MergeFrom
                | HowCode::EditFrom
                | HowCode::AddFrom
                | HowCode::MovedFrom
        )
    }
}

impl FromStr for HowCode {
    type Err = RelayError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "branch from" => Ok(HowCode::BranchFrom),
            "branch into" => Ok(HowCode::BranchInto),
            "copy from" => Ok(HowCode::CopyFrom),
            "copy into" => Ok(HowCode::CopyInto),
            "merge from" => Ok(HowCode::MergeFrom),
            "merge into" => Ok(HowCode::MergeInto),
            "edit from" => Ok(HowCode::EditFrom),
            "edit into" => Ok(HowCode::EditInto),
            "ignored" => Ok(HowCode::Ignored),
            "ignored by" => Ok(HowCode::IgnoredBy),
            "delete from" => Ok(HowCode::DeleteFrom),
            "delete into" => Ok(HowCode::DeleteInto),
            "moved from" => Ok(HowCode::MovedFrom),
            "moved into" => Ok(HowCode::MovedInto),
            "add from" => Ok(HowCode::AddFrom),
            "add into" => Ok(HowCode::AddInto),
            _ => Err(RelayError::InvalidHowCode(s.to_string())),
        }
    }
}

impl Display for HowCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let token = match self {
            HowCode::BranchFrom => "branch from",
            HowCode::BranchInto => "branch into",
            HowCode::CopyFrom => "copy from",
            HowCode::CopyInto => "copy into",
            HowCode::MergeFrom => "merge from",
            HowCode::MergeInto => "merge into",
            HowCode::EditFrom => "edit from",
            HowCode::EditInto => "edit into",
            HowCode::Ignored => "ignored",
            HowCode::IgnoredBy => "ignored by",
            HowCode::DeleteFrom => "delete from",
            HowCode::DeleteInto => "delete into",
            HowCode::MovedFrom => "moved from",
            HowCode::MovedInto => "moved into",
            HowCode::AddFrom => "add from",
            HowCode::AddInto => "add into",
        };
        f.write_str(token)
    }
}

/// One integration record attached to a revision.
///
/// The revision range is half-open the way the server stores it:
/// `start_rev` is exclusive, `end_rev` inclusive, so the record covers
/// partner revisions `start_rev + 1 ..= end_rev`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IntegrationRecord {
    pub how: HowCode,
    pub other_path: String,
    pub start_rev: u32,
    pub end_rev: u32,
}

impl IntegrationRecord {
    pub fn new(how: HowCode, other_path: &str, start_rev: u32, end_rev: u32) -> IntegrationRecord {
        IntegrationRecord {
            how,
            other_path: other_path.to_string(),
            start_rev,
            end_rev,
        }
    }

    /// Does the record's range cover the given partner revision?
    pub fn covers(&self, rev: u32) -> bool {
        rev > self.start_rev && rev <= self.end_rev
    }
}

/// One file revision with the metadata the engine consumes.
///
/// Revisions of a depot path are densely numbered `1..N`; `rev` is the
/// number within that sequence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileRevision {
    pub depot_path: String,
    pub rev: u32,
    pub change: u64,
    pub action: FileAction,
    pub file_type: FileType,
    /// Uppercase hex MD5 of canonical content; absent for purged or very
    /// old revisions.
    pub digest: Option<String>,
    pub file_size: u64,
    pub integrations: Vec<IntegrationRecord>,
}

/// One source changelist with its in-scope revisions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangeInfo {
    pub number: u64,
    pub user: String,
    pub client: String,
    pub description: String,
    /// Seconds since the epoch, as the server reports change times.
    pub time: i64,
    pub revisions: Vec<FileRevision>,
}

/// A stream known to a server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamSpec {
    pub name: String,
    pub stream_type: String,
    pub parent: Option<String>,
}

/// One file currently opened in a pending change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpenedFile {
    pub depot_path: String,
    pub action: FileAction,
}
