//! The change map: a CSV file versioned on the target recording every
//! `(source port, source change, target change)` triple.
//!
//! The file is appended and submitted as its own change after each batch,
//! never inside a replicated change. The markers embedded in target change
//! descriptions remain the source of truth; `rebuild` regenerates the file
//! from them.

use tracing::info;

use crate::client::TargetSession;
use crate::client::records::FileType;
use crate::errors::RelayError;
use crate::replicate::submit::parse_marker;
use crate::view::ViewMap;

/// CSV header line, fixed by the file format.
pub const CSV_HEADER: &str = "sourceP4Port,sourceChangeNo,targetChangeNo";

/// One mapping row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeMapEntry {
    pub source_port: String,
    pub source_change: u64,
    pub target_change: u64,
}

impl ChangeMapEntry {
    fn csv_line(&self) -> String {
        format!(
            "{},{},{}",
            self.source_port, self.source_change, self.target_change
        )
    }
}

/// Collects mapping rows during a batch and lands them on the target.
pub struct ChangeMapAppender {
    target_csv_path: String,
    pending: Vec<ChangeMapEntry>,
}

impl ChangeMapAppender {
    /// Build from the configured file option, which names the CSV by its
    /// source-side depot path (with or without the `//` prefix) so the
    /// regular view mapping places it on the target.
    pub fn new(change_map_file: &str, view: &ViewMap) -> Result<ChangeMapAppender, RelayError> {
        let source_path = if change_map_file.starts_with("//") {
            change_map_file.to_string()
        } else {
            format!("//{change_map_file}")
        };
        let target_csv_path = view.to_target(&source_path).ok_or_else(|| {
            RelayError::config(format!(
                "Option change_map_file `{change_map_file}` is not inside the transfer view"
            ))
        })?;
        Ok(ChangeMapAppender {
            target_csv_path,
            pending: Vec::new(),
        })
    }

    pub fn target_path(&self) -> &str {
        &self.target_csv_path
    }

    pub fn record(&mut self, entry: ChangeMapEntry) {
        self.pending.push(entry);
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Land the collected rows as one target change of their own. Returns
    /// the submitted change number, or `None` when nothing was pending.
    pub fn flush(&mut self, target: &mut dyn TargetSession) -> Result<Option<u64>, RelayError> {
        if self.pending.is_empty() {
            return Ok(None);
        }
        let log = target.filelog(&self.target_csv_path)?;
        let head = log.len() as u32;
        let exists = log.last().is_some_and(|r| !r.action.is_delete());

        let mut content = if exists {
            let bytes = target.print(&self.target_csv_path, head)?;
            String::from_utf8_lossy(&bytes).into_owned()
        } else {
            format!("{CSV_HEADER}\n")
        };
        for entry in &self.pending {
            content.push_str(&entry.csv_line());
            content.push('\n');
        }

        let change = target.create_change("Updated change map during transfer")?;
        if exists {
            target.sync_file(&self.target_csv_path, head)?;
            target.open_edit(change, &self.target_csv_path)?;
        } else {
            target.open_add(change, &self.target_csv_path, &FileType::text(), false)?;
        }
        target.write_workspace_file(&self.target_csv_path, content.as_bytes())?;
        let submitted = target.submit(change)?;
        info!(
            rows = self.pending.len(),
            change = submitted,
            path = %self.target_csv_path,
            "change map updated"
        );
        self.pending.clear();
        Ok(Some(submitted))
    }

    /// Regenerate the full CSV from the markers in target change
    /// descriptions, in ascending source-change order.
    pub fn rebuild(target: &mut dyn TargetSession) -> Result<String, RelayError> {
        let mut rows: Vec<ChangeMapEntry> = Vec::new();
        for (number, description) in target.change_descriptions()? {
            if let Some((port, source_change)) = parse_marker(&description) {
                rows.push(ChangeMapEntry {
                    source_port: port,
                    source_change,
                    target_change: number,
                });
            }
        }
        rows.sort_by_key(|r| r.source_change);
        let mut content = format!("{CSV_HEADER}\n");
        for row in rows {
            content.push_str(&row.csv_line());
            content.push('\n');
        }
        Ok(content)
    }
}
