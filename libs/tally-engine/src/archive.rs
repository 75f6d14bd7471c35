//! Day-directory archival: `<file_dir>/<label>/` → `<file_dir>/<label>.zip`.

use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use dashmap::DashSet;
use parking_lot::RwLock;

use crate::fsutil;

/// The date label currently being written to. Shared between the
/// scheduler (writer) and the archive pipeline (reader).
#[derive(Debug, Clone)]
pub struct ActiveDate(Arc<RwLock<String>>);

impl ActiveDate {
    pub fn new(label: impl Into<String>) -> Self {
        Self(Arc::new(RwLock::new(label.into())))
    }

    pub fn get(&self) -> String {
        self.0.read().clone()
    }

    pub fn is(&self, label: &str) -> bool {
        *self.0.read() == label
    }

    pub fn set(&self, label: impl Into<String>) {
        *self.0.write() = label.into();
    }
}

/// Outcome of one archive attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArchiveStatus {
    Archived { entries: usize },
    ActiveDate,
    NotFound,
    Hidden,
    Empty,
    Failed(String),
    InProgress,
    InvalidLabel,
}

impl ArchiveStatus {
    pub fn is_success(&self) -> bool {
        matches!(self, ArchiveStatus::Archived { .. })
    }

    /// Nothing left to do for this label: either archived or there is
    /// nothing that could ever be archived.
    pub fn is_settled(&self) -> bool {
        matches!(
            self,
            ArchiveStatus::Archived { .. }
                | ArchiveStatus::NotFound
                | ArchiveStatus::Hidden
                | ArchiveStatus::Empty
                | ArchiveStatus::InvalidLabel
        )
    }
}

impl fmt::Display for ArchiveStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ArchiveStatus::Archived { .. } => f.write_str("zip success"),
            ArchiveStatus::ActiveDate => f.write_str("cannot archive active date"),
            ArchiveStatus::NotFound => f.write_str("not found"),
            ArchiveStatus::Hidden => f.write_str("hidden, skipped"),
            ArchiveStatus::Empty => f.write_str("empty, skipped"),
            ArchiveStatus::Failed(err) => write!(f, "zip failed: {err}"),
            ArchiveStatus::InProgress => f.write_str("archive already in progress"),
            ArchiveStatus::InvalidLabel => f.write_str("invalid label"),
        }
    }
}

// ═══════════════════════════════════════════════════════════════
//  ArchivePipeline
// ═══════════════════════════════════════════════════════════════

pub struct ArchivePipeline {
    file_dir: PathBuf,
    active: ActiveDate,
    in_flight: DashSet<String>,
}

/// Marks a label as being archived; released on drop.
struct InFlight<'a> {
    set: &'a DashSet<String>,
    label: String,
}

impl<'a> InFlight<'a> {
    fn acquire(set: &'a DashSet<String>, label: &str) -> Option<Self> {
        set.insert(label.to_string()).then(|| InFlight {
            set,
            label: label.to_string(),
        })
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.set.remove(&self.label);
    }
}

impl ArchivePipeline {
    pub fn new(file_dir: impl Into<PathBuf>, active: ActiveDate) -> Self {
        Self {
            file_dir: file_dir.into(),
            active,
            in_flight: DashSet::new(),
        }
    }

    pub fn active_date(&self) -> &ActiveDate {
        &self.active
    }

    pub fn archive_path(&self, label: &str) -> PathBuf {
        self.file_dir.join(format!("{label}.zip"))
    }

    /// Archive one day directory. Blocking; run it on a blocking worker.
    pub fn archive(&self, label: &str) -> ArchiveStatus {
        if fsutil::validate_segment(label, "label").is_err() {
            tracing::warn!(label = %label, "rejected archive request");
            return ArchiveStatus::InvalidLabel;
        }
        if self.active.is(label) {
            return ArchiveStatus::ActiveDate;
        }
        let Some(_flight) = InFlight::acquire(&self.in_flight, label) else {
            tracing::debug!(label = %label, "archive already running");
            return ArchiveStatus::InProgress;
        };

        let status = self.archive_dir(label, &self.file_dir.join(label));
        match &status {
            ArchiveStatus::Archived { entries } => {
                tracing::info!(label = %label, entries, "archived");
            }
            ArchiveStatus::Failed(err) => {
                tracing::error!(label = %label, error = %err, "archive failed");
            }
            other => {
                tracing::warn!(label = %label, status = %other, "archive skipped");
            }
        }
        status
    }

    fn archive_dir(&self, label: &str, dir: &Path) -> ArchiveStatus {
        let metadata = match fs::metadata(dir) {
            Ok(m) if m.is_dir() => m,
            Ok(_) => return ArchiveStatus::NotFound,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return ArchiveStatus::NotFound,
            Err(e) => return ArchiveStatus::Failed(e.to_string()),
        };
        if fsutil::is_hidden(dir, &metadata) {
            return ArchiveStatus::Hidden;
        }
        match fsutil::is_empty_dir(dir) {
            Ok(true) => return ArchiveStatus::Empty,
            Ok(false) => {}
            Err(e) => return ArchiveStatus::Failed(e.to_string()),
        }
        match fsutil::zip_directory(dir, &self.archive_path(label)) {
            Ok(entries) => ArchiveStatus::Archived { entries },
            Err(e) => ArchiveStatus::Failed(e.to_string()),
        }
    }
}
