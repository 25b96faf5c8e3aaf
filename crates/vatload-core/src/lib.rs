//! Core domain model for the VAT report loader: dataset descriptors, the
//! in-memory row set, the per-file state machine and the error taxonomy.

use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const CRATE_NAME: &str = "vatload-core";

/// Token written for null cells; the bulk loaders are configured to read it back as NULL.
pub const NULL_MARKER: &str = "NULL";

pub const ROW_SEQUENCE_COLUMN: &str = "row_sequence";
pub const ROW_FINGERPRINT_COLUMN: &str = "row_fingerprint";

/// Placeholder kept in otherwise empty dataset folders; never deleted.
pub const PLACEHOLDER_FILE: &str = ".gitkeep";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatasetDescriptor {
    pub name: String,
    pub source_folder: PathBuf,
    pub staging_table: String,
    pub permanent_table: String,
    #[serde(default)]
    pub identity_columns: Vec<String>,
}

/// Fully materialized tabular file. `None` cells are nulls.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RowSet {
    columns: Vec<String>,
    rows: Vec<Vec<Option<String>>>,
}

impl RowSet {
    pub fn new(columns: Vec<String>) -> Self {
        Self {
            columns,
            rows: Vec::new(),
        }
    }

    /// Appends a row; returns it back when its width does not match the header.
    pub fn push_row(&mut self, row: Vec<Option<String>>) -> Result<(), Vec<Option<String>>> {
        if row.len() != self.columns.len() {
            return Err(row);
        }
        self.rows.push(row);
        Ok(())
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn rows(&self) -> &[Vec<Option<String>>] {
        &self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c == name)
    }

    pub fn cell(&self, row: usize, column: &str) -> Option<&str> {
        let idx = self.column_index(column)?;
        self.rows.get(row)?.get(idx)?.as_deref()
    }

    /// Rewrites every cell of `column` in place. Returns false when the column is absent.
    pub fn map_column<F>(&mut self, column: &str, mut f: F) -> bool
    where
        F: FnMut(Option<String>) -> Option<String>,
    {
        let Some(idx) = self.column_index(column) else {
            return false;
        };
        for row in &mut self.rows {
            let cell = row[idx].take();
            row[idx] = f(cell);
        }
        true
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileStage {
    Discovered,
    Corrected,
    StagingCleared,
    StagingLoaded,
    IndexAssigned,
    FingerprintAssigned,
    Merged,
    Cleaned,
}

impl FileStage {
    pub fn next(self) -> Option<Self> {
        use FileStage::*;
        match self {
            Discovered => Some(Corrected),
            Corrected => Some(StagingCleared),
            StagingCleared => Some(StagingLoaded),
            StagingLoaded => Some(IndexAssigned),
            IndexAssigned => Some(FingerprintAssigned),
            FingerprintAssigned => Some(Merged),
            Merged => Some(Cleaned),
            Cleaned => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Discovered => "discovered",
            Self::Corrected => "corrected",
            Self::StagingCleared => "staging_cleared",
            Self::StagingLoaded => "staging_loaded",
            Self::IndexAssigned => "index_assigned",
            Self::FingerprintAssigned => "fingerprint_assigned",
            Self::Merged => "merged",
            Self::Cleaned => "cleaned",
        }
    }
}

impl fmt::Display for FileStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreStep {
    ClearStaging,
    BulkLoad,
    AssignSequence,
    AssignFingerprint,
    Merge,
}

impl StoreStep {
    pub const ALL: [StoreStep; 5] = [
        StoreStep::ClearStaging,
        StoreStep::BulkLoad,
        StoreStep::AssignSequence,
        StoreStep::AssignFingerprint,
        StoreStep::Merge,
    ];

    pub fn template_name(self) -> &'static str {
        match self {
            Self::ClearStaging => "clear_staging",
            Self::BulkLoad => "bulk_load",
            Self::AssignSequence => "assign_sequence",
            Self::AssignFingerprint => "assign_fingerprint",
            Self::Merge => "merge",
        }
    }

    /// Stage a file reaches once this step has committed.
    pub fn completes(self) -> FileStage {
        match self {
            Self::ClearStaging => FileStage::StagingCleared,
            Self::BulkLoad => FileStage::StagingLoaded,
            Self::AssignSequence => FileStage::IndexAssigned,
            Self::AssignFingerprint => FileStage::FingerprintAssigned,
            Self::Merge => FileStage::Merged,
        }
    }
}

impl fmt::Display for StoreStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.template_name())
    }
}

/// The file could not be read as tab-delimited text with a header row.
#[derive(Debug, Error)]
pub enum FormatError {
    #[error("{}: file has no header row", .path.display())]
    MissingHeader { path: PathBuf },
    #[error("{}: header has a single column, expected tab-delimited text", .path.display())]
    NotDelimited { path: PathBuf },
    #[error("{}: line {line}: expected {expected} fields, found {found}", .path.display())]
    Ragged {
        path: PathBuf,
        line: u64,
        expected: usize,
        found: usize,
    },
    #[error("{}: line {line}: invalid UTF-8", .path.display())]
    Encoding { path: PathBuf, line: u64 },
    #[error("{}: identity column `{column}` is missing from the header", .path.display())]
    MissingIdentityColumn { path: PathBuf, column: String },
    #[error("{}: {message}", .path.display())]
    Malformed { path: PathBuf, message: String },
}

/// A staging or merge statement failed.
#[derive(Debug, Error)]
#[error("{step} on `{table}` failed: {source}")]
pub struct StoreError {
    pub step: StoreStep,
    pub table: String,
    #[source]
    pub source: Box<dyn std::error::Error + Send + Sync>,
}

impl StoreError {
    pub fn new(
        step: StoreStep,
        table: impl Into<String>,
        source: impl Into<Box<dyn std::error::Error + Send + Sync>>,
    ) -> Self {
        Self {
            step,
            table: table.into(),
            source: source.into(),
        }
    }
}

#[derive(Debug, Error)]
#[error("{}: {source}", .path.display())]
pub struct FilesystemError {
    pub path: PathBuf,
    #[source]
    pub source: std::io::Error,
}

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("format error: {0}")]
    Format(#[from] FormatError),
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("i/o error on {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl LoadError {
    pub fn kind(&self) -> FailureKind {
        match self {
            Self::Format(_) => FailureKind::Format,
            Self::Store(_) => FailureKind::Store,
            Self::Io { .. } => FailureKind::Io,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Format,
    Store,
    Io,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum FileState {
    Active { stage: FileStage },
    Failed {
        at: FileStage,
        kind: FailureKind,
        reason: String,
    },
}

impl Default for FileState {
    fn default() -> Self {
        Self::Active {
            stage: FileStage::Discovered,
        }
    }
}

impl FileState {
    pub fn discovered() -> Self {
        Self::default()
    }

    pub fn stage(&self) -> FileStage {
        match self {
            Self::Active { stage } => *stage,
            Self::Failed { at, .. } => *at,
        }
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, Self::Failed { .. })
    }

    pub fn is_cleaned(&self) -> bool {
        matches!(
            self,
            Self::Active {
                stage: FileStage::Cleaned
            }
        )
    }

    /// Moves one stage forward. Terminal states do not move.
    pub fn advance(&mut self) -> FileStage {
        if let Self::Active { stage } = self {
            if let Some(next) = stage.next() {
                *stage = next;
            }
        }
        self.stage()
    }

    pub fn fail(&mut self, error: &LoadError) {
        if self.is_failed() {
            return;
        }
        *self = Self::Failed {
            at: self.stage(),
            kind: error.kind(),
            reason: error.to_string(),
        };
    }
}
