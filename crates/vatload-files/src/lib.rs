//! Source file handling: discovery, date normalization, corrected copies and
//! guarded cleanup.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use chrono::NaiveDate;
use tracing::{debug, info, warn};
use uuid::Uuid;
use vatload_core::{FilesystemError, FormatError, LoadError, RowSet, NULL_MARKER, PLACEHOLDER_FILE};

pub const CRATE_NAME: &str = "vatload-files";

pub const DEFAULT_SOURCE_DATE_FORMAT: &str = "%d-%m-%Y";
pub const CANONICAL_DATE_FORMAT: &str = "%Y-%m-%d";
pub const DEFAULT_SOURCE_EXTENSION: &str = "txt";
pub const DEFAULT_CORRECTED_SUFFIX: &str = "_corrected";

pub const DEFAULT_DATE_COLUMNS: [&str; 5] = [
    "TAX_CALCULATION_DATE",
    "TRANSACTION_DEPART_DATE",
    "TRANSACTION_ARRIVAL_DATE",
    "TRANSACTION_COMPLETE_DATE",
    "VAT_INV_EXCHANGE_RATE_DATE",
];

const DELIMITER: u8 = b'\t';

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DateReport {
    pub columns: Vec<String>,
    pub rewritten: usize,
    pub nulled: usize,
}

/// Rewrites the known date columns from the source format to `YYYY-MM-DD`.
#[derive(Debug, Clone)]
pub struct DateNormalizer {
    columns: Vec<String>,
    source_format: String,
}

impl Default for DateNormalizer {
    fn default() -> Self {
        Self::new(DEFAULT_DATE_COLUMNS)
    }
}

impl DateNormalizer {
    pub fn new<I, S>(columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            columns: columns.into_iter().map(Into::into).collect(),
            source_format: DEFAULT_SOURCE_DATE_FORMAT.to_string(),
        }
    }

    pub fn with_source_format(mut self, format: impl Into<String>) -> Self {
        self.source_format = format.into();
        self
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    /// Canonical form of one cell, or `None` when it does not parse.
    pub fn normalize_cell(&self, raw: &str) -> Option<String> {
        NaiveDate::parse_from_str(raw.trim(), &self.source_format)
            .ok()
            .map(|date| date.format(CANONICAL_DATE_FORMAT).to_string())
    }

    /// Normalizes every known date column present in `rows`; absent columns are skipped.
    pub fn apply(&self, rows: &mut RowSet) -> DateReport {
        let mut report = DateReport::default();
        for column in &self.columns {
            let mut rewritten = 0usize;
            let mut nulled = 0usize;
            let present = rows.map_column(column, |cell| {
                let raw = cell?;
                match self.normalize_cell(&raw) {
                    Some(date) => {
                        rewritten += 1;
                        Some(date)
                    }
                    None => {
                        nulled += 1;
                        None
                    }
                }
            });
            if present {
                report.columns.push(column.clone());
                report.rewritten += rewritten;
                report.nulled += nulled;
            }
        }
        report
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceLayout {
    extension: String,
    corrected_suffix: String,
}

impl Default for SourceLayout {
    fn default() -> Self {
        Self::new(DEFAULT_SOURCE_EXTENSION, DEFAULT_CORRECTED_SUFFIX)
    }
}

impl SourceLayout {
    pub fn new(extension: impl Into<String>, corrected_suffix: impl Into<String>) -> Self {
        let extension = extension.into();
        Self {
            extension: extension.trim_start_matches('.').to_string(),
            corrected_suffix: corrected_suffix.into(),
        }
    }

    pub fn extension(&self) -> &str {
        &self.extension
    }

    pub fn corrected_suffix(&self) -> &str {
        &self.corrected_suffix
    }

    /// `dir/report.txt` -> `dir/report_corrected.txt`.
    pub fn corrected_path_for(&self, source: &Path) -> PathBuf {
        let stem = source
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        let name = match source.extension() {
            Some(ext) => format!("{stem}{}.{}", self.corrected_suffix, ext.to_string_lossy()),
            None => format!("{stem}{}", self.corrected_suffix),
        };
        source.with_file_name(name)
    }

    pub fn is_corrected(&self, path: &Path) -> bool {
        path.file_stem()
            .map(|stem| stem.to_string_lossy().ends_with(&self.corrected_suffix))
            .unwrap_or(false)
    }

    /// Source candidates carry the extension, are not corrected copies and are not placeholders.
    pub fn is_candidate(&self, path: &Path) -> bool {
        let Some(name) = path.file_name().map(|n| n.to_string_lossy()) else {
            return false;
        };
        if name.eq_ignore_ascii_case(PLACEHOLDER_FILE) || name.starts_with('.') {
            return false;
        }
        let has_extension = path
            .extension()
            .map(|ext| ext.to_string_lossy() == self.extension)
            .unwrap_or(false);
        has_extension && !self.is_corrected(path)
    }

    pub fn discover(&self, folder: &Path) -> Result<Vec<PathBuf>, FilesystemError> {
        let entries = fs::read_dir(folder).map_err(|source| FilesystemError {
            path: folder.to_path_buf(),
            source,
        })?;
        let mut files = entries
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.file_type().map(|ft| ft.is_file()).unwrap_or(false))
            .map(|entry| entry.path())
            .filter(|path| self.is_candidate(path))
            .collect::<Vec<_>>();
        files.sort();
        Ok(files)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FolderStatus {
    Missing,
    Empty,
    /// Absolute path of an existing folder with at least one non-placeholder entry.
    Ready(PathBuf),
}

pub fn inspect_folder(folder: &Path) -> Result<FolderStatus, FilesystemError> {
    if !folder.is_dir() {
        return Ok(FolderStatus::Missing);
    }
    let wrap = |source: io::Error| FilesystemError {
        path: folder.to_path_buf(),
        source,
    };
    let absolute = fs::canonicalize(folder).map_err(wrap)?;
    let has_entries = fs::read_dir(&absolute)
        .map_err(wrap)?
        .filter_map(|entry| entry.ok())
        .any(|entry| !entry.file_name().to_string_lossy().eq_ignore_ascii_case(PLACEHOLDER_FILE));
    if has_entries {
        Ok(FolderStatus::Ready(absolute))
    } else {
        Ok(FolderStatus::Empty)
    }
}

/// Removes a regular file unless it is a placeholder. Returns whether anything was removed.
pub fn remove_file_guarded(path: &Path) -> Result<bool, FilesystemError> {
    let is_placeholder = path
        .file_name()
        .map(|n| n.to_string_lossy().eq_ignore_ascii_case(PLACEHOLDER_FILE))
        .unwrap_or(false);
    if is_placeholder || !path.is_file() {
        return Ok(false);
    }
    fs::remove_file(path).map_err(|source| FilesystemError {
        path: path.to_path_buf(),
        source,
    })?;
    info!(path = %path.display(), "removed file");
    Ok(true)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CorrectedFile {
    pub source_path: PathBuf,
    pub corrected_path: PathBuf,
    pub columns: Vec<String>,
    pub row_count: usize,
    pub dates: DateReport,
}

#[derive(Debug, Clone, Default)]
pub struct FileCorrector {
    normalizer: DateNormalizer,
    layout: SourceLayout,
}

impl FileCorrector {
    pub fn new(normalizer: DateNormalizer, layout: SourceLayout) -> Self {
        Self { normalizer, layout }
    }

    pub fn layout(&self) -> &SourceLayout {
        &self.layout
    }

    pub fn correct(&self, source: &Path) -> Result<CorrectedFile, LoadError> {
        let mut rows = read_row_set(source)?;
        let dates = self.normalizer.apply(&mut rows);
        let corrected_path = self.layout.corrected_path_for(source);
        write_row_set(&corrected_path, &rows)?;
        debug!(
            source = %source.display(),
            corrected = %corrected_path.display(),
            rows = rows.len(),
            dates_rewritten = dates.rewritten,
            dates_nulled = dates.nulled,
            "wrote corrected file"
        );
        if dates.nulled > 0 {
            warn!(
                source = %source.display(),
                nulled = dates.nulled,
                "unparseable dates replaced with {NULL_MARKER}"
            );
        }
        Ok(CorrectedFile {
            source_path: source.to_path_buf(),
            corrected_path,
            columns: rows.columns().to_vec(),
            row_count: rows.len(),
            dates,
        })
    }
}

fn is_null_cell(value: &str) -> bool {
    value.is_empty() || value == NULL_MARKER
}

/// Parses a tab-delimited file with a header row. Empty and `NULL` cells become nulls.
pub fn read_row_set(path: &Path) -> Result<RowSet, LoadError> {
    let file = fs::File::open(path).map_err(|source| LoadError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let mut reader = csv::ReaderBuilder::new()
        .delimiter(DELIMITER)
        .has_headers(true)
        .flexible(false)
        .from_reader(io::BufReader::new(file));

    let headers = reader
        .headers()
        .map_err(|err| csv_error(path, err))?
        .iter()
        .enumerate()
        .map(|(i, h)| {
            let h = if i == 0 { h.trim_start_matches('\u{feff}') } else { h };
            h.to_string()
        })
        .collect::<Vec<_>>();
    if headers.is_empty() || headers.iter().all(|h| h.is_empty()) {
        return Err(FormatError::MissingHeader {
            path: path.to_path_buf(),
        }
        .into());
    }
    if headers.len() == 1 {
        return Err(FormatError::NotDelimited {
            path: path.to_path_buf(),
        }
        .into());
    }

    let mut rows = RowSet::new(headers);
    for record in reader.records() {
        let record = record.map_err(|err| csv_error(path, err))?;
        let line = record.position().map(|p| p.line()).unwrap_or(0);
        let cells = record
            .iter()
            .map(|v| (!is_null_cell(v)).then(|| v.to_string()))
            .collect::<Vec<_>>();
        if let Err(row) = rows.push_row(cells) {
            return Err(FormatError::Ragged {
                path: path.to_path_buf(),
                line,
                expected: rows.columns().len(),
                found: row.len(),
            }
            .into());
        }
    }
    Ok(rows)
}

pub fn write_row_set(path: &Path, rows: &RowSet) -> Result<(), LoadError> {
    let io_err = |path: &Path| {
        let path = path.to_path_buf();
        move |source: io::Error| LoadError::Io { path, source }
    };
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let temp_path = parent.join(format!(".{file_name}.{}.tmp", Uuid::new_v4()));

    let result = (|| {
        let file = fs::File::create(&temp_path).map_err(io_err(&temp_path))?;
        let mut writer = csv::WriterBuilder::new()
            .delimiter(DELIMITER)
            .quote_style(csv::QuoteStyle::Necessary)
            .terminator(csv::Terminator::Any(b'\n'))
            .from_writer(io::BufWriter::new(file));
        writer
            .write_record(rows.columns())
            .map_err(|err| csv_write_error(&temp_path, err))?;
        for row in rows.rows() {
            writer
                .write_record(row.iter().map(|cell| cell.as_deref().unwrap_or(NULL_MARKER)))
                .map_err(|err| csv_write_error(&temp_path, err))?;
        }
        writer.flush().map_err(io_err(&temp_path))?;
        fs::rename(&temp_path, path).map_err(io_err(path))
    })();

    if result.is_err() {
        let _ = fs::remove_file(&temp_path);
    }
    result
}

fn csv_error(path: &Path, err: csv::Error) -> LoadError {
    let path = path.to_path_buf();
    match err.into_kind() {
        csv::ErrorKind::Io(source) => LoadError::Io { path, source },
        csv::ErrorKind::Utf8 { pos, .. } => FormatError::Encoding {
            path,
            line: pos.map(|p| p.line()).unwrap_or(0),
        }
        .into(),
        csv::ErrorKind::UnequalLengths {
            pos,
            expected_len,
            len,
        } => FormatError::Ragged {
            path,
            line: pos.map(|p| p.line()).unwrap_or(0),
            expected: expected_len as usize,
            found: len as usize,
        }
        .into(),
        other => FormatError::Malformed {
            path,
            message: format!("{other:?}"),
        }
        .into(),
    }
}

fn csv_write_error(path: &Path, err: csv::Error) -> LoadError {
    let path = path.to_path_buf();
    match err.into_kind() {
        csv::ErrorKind::Io(source) => LoadError::Io { path, source },
        other => LoadError::Io {
            path,
            source: io::Error::other(format!("{other:?}")),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;
    use vatload_core::FailureKind;

    fn write(dir: &Path, name: &str, body: &str) -> PathBuf {
        let path = dir.join(name);
        fs::write(&path, body).expect("write fixture");
        path
    }

    #[test]
    fn normalizes_known_date_columns() {
        let normalizer = DateNormalizer::default();
        assert_eq!(normalizer.normalize_cell("01-02-2024").as_deref(), Some("2024-02-01"));
        assert_eq!(normalizer.normalize_cell(" 31-12-2023 ").as_deref(), Some("2023-12-31"));
        assert_eq!(normalizer.normalize_cell("2024-02-01"), None);
        assert_eq!(normalizer.normalize_cell("31-02-2024"), None);
        assert_eq!(normalizer.normalize_cell("soon"), None);
    }

    #[test]
    fn absent_columns_are_skipped_and_bad_cells_nulled() {
        let mut rows = RowSet::new(vec!["ID".into(), "TAX_CALCULATION_DATE".into()]);
        rows.push_row(vec![Some("1".into()), Some("01-02-2024".into())]).unwrap();
        rows.push_row(vec![Some("2".into()), Some("garbage".into())]).unwrap();
        rows.push_row(vec![Some("3".into()), None]).unwrap();

        let report = DateNormalizer::default().apply(&mut rows);
        assert_eq!(report.columns, vec!["TAX_CALCULATION_DATE".to_string()]);
        assert_eq!(report.rewritten, 1);
        assert_eq!(report.nulled, 1);
        assert_eq!(rows.cell(0, "TAX_CALCULATION_DATE"), Some("2024-02-01"));
        assert_eq!(rows.cell(1, "TAX_CALCULATION_DATE"), None);
        assert_eq!(rows.cell(2, "TAX_CALCULATION_DATE"), None);
        assert_eq!(rows.cell(1, "ID"), Some("2"));
    }

    #[test]
    fn corrected_file_rewrites_dates_and_nulls() {
        let dir = tempdir().expect("tempdir");
        let source = write(
            dir.path(),
            "report.txt",
            "ID\tTAX_CALCULATION_DATE\tAMOUNT\n1\t01-02-2024\t10.5\n2\t31-12-2023\t\n",
        );
        let corrected = FileCorrector::default().correct(&source).expect("correct");

        assert_eq!(corrected.corrected_path, dir.path().join("report_corrected.txt"));
        assert_eq!(corrected.row_count, 2);
        assert_eq!(corrected.columns, vec!["ID", "TAX_CALCULATION_DATE", "AMOUNT"]);
        let body = fs::read_to_string(&corrected.corrected_path).expect("read corrected");
        assert_eq!(
            body,
            "ID\tTAX_CALCULATION_DATE\tAMOUNT\n1\t2024-02-01\t10.5\n2\t2023-12-31\tNULL\n"
        );
        assert!(source.exists());
    }

    #[test]
    fn ragged_rows_are_format_errors() {
        let dir = tempdir().expect("tempdir");
        let source = write(dir.path(), "bad.txt", "ID\tTAX_CALCULATION_DATE\n1\t01-02-2024\textra\n");
        let err = FileCorrector::default().correct(&source).unwrap_err();
        assert_eq!(err.kind(), FailureKind::Format);
        assert!(matches!(err, LoadError::Format(FormatError::Ragged { expected: 2, found: 3, .. })));
        assert!(!dir.path().join("bad_corrected.txt").exists());
    }

    #[test]
    fn wrong_delimiter_and_bad_bytes_are_format_errors() {
        let dir = tempdir().expect("tempdir");
        let comma = write(dir.path(), "comma.txt", "ID,TAX_CALCULATION_DATE\n1,01-02-2024\n");
        let err = FileCorrector::default().correct(&comma).unwrap_err();
        assert!(matches!(err, LoadError::Format(FormatError::NotDelimited { .. })));

        let binary = dir.path().join("binary.txt");
        fs::write(&binary, b"ID\tNAME\n1\t\xff\xfe\n").expect("write");
        let err = FileCorrector::default().correct(&binary).unwrap_err();
        assert!(matches!(err, LoadError::Format(FormatError::Encoding { .. })));

        let empty = write(dir.path(), "empty.txt", "");
        let err = FileCorrector::default().correct(&empty).unwrap_err();
        assert!(matches!(err, LoadError::Format(FormatError::MissingHeader { .. })));
    }

    #[test]
    fn correcting_a_corrected_file_does_not_fail() {
        let dir = tempdir().expect("tempdir");
        let source = write(dir.path(), "r.txt", "ID\tTAX_CALCULATION_DATE\n1\t01-02-2024\n");
        let corrector = FileCorrector::default();
        let first = corrector.correct(&source).expect("first pass");
        let second = corrector.correct(&first.corrected_path).expect("second pass");
        assert_eq!(second.row_count, 1);
    }

    #[test]
    fn discovery_skips_corrected_copies_and_placeholders() {
        let dir = tempdir().expect("tempdir");
        write(dir.path(), "b.txt", "x");
        write(dir.path(), "a.txt", "x");
        write(dir.path(), "a_corrected.txt", "x");
        write(dir.path(), ".gitkeep", "");
        write(dir.path(), "notes.csv", "x");

        let layout = SourceLayout::default();
        let found = layout.discover(dir.path()).expect("discover");
        assert_eq!(found, vec![dir.path().join("a.txt"), dir.path().join("b.txt")]);
    }

    #[test]
    fn folder_inspection_and_guarded_removal() {
        let dir = tempdir().expect("tempdir");
        assert_eq!(inspect_folder(&dir.path().join("nope")).unwrap(), FolderStatus::Missing);

        let keep = write(dir.path(), ".gitkeep", "");
        assert_eq!(inspect_folder(dir.path()).unwrap(), FolderStatus::Empty);
        assert!(!remove_file_guarded(&keep).unwrap());
        assert!(keep.exists());

        let data = write(dir.path(), "a.txt", "x");
        assert!(matches!(inspect_folder(dir.path()).unwrap(), FolderStatus::Ready(p) if p.is_absolute()));
        assert!(remove_file_guarded(&data).unwrap());
        assert!(!data.exists());
        assert!(!remove_file_guarded(&data).unwrap());
    }
}
