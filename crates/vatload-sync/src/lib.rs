//! Load pipeline orchestration: configuration, the per-file state machine and
//! run reporting.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::fs;
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;
use vatload_core::{DatasetDescriptor, FailureKind, FileStage, FileState, LoadError, StoreStep};
use vatload_files::{
    inspect_folder, remove_file_guarded, DateNormalizer, FileCorrector, FolderStatus, SourceLayout,
    DEFAULT_CORRECTED_SUFFIX, DEFAULT_DATE_COLUMNS, DEFAULT_SOURCE_DATE_FORMAT,
    DEFAULT_SOURCE_EXTENSION,
};
use vatload_storage::{
    quote_table, Deduplicator, FingerprintPlan, MergeEngine, PgSession, StagingLoader,
    StatementContext, StatementSet, StoreSession,
};

pub const CRATE_NAME: &str = "vatload-sync";

#[derive(Debug, Clone)]
pub struct LoadConfig {
    pub database_url: Option<String>,
    pub workspace_root: PathBuf,
    pub datasets_file: PathBuf,
    /// Directory with `<template>.sql` overrides; bundled templates when unset.
    pub queries_dir: Option<PathBuf>,
    pub reports_dir: Option<PathBuf>,
}

impl LoadConfig {
    pub fn from_env() -> Self {
        Self {
            database_url: std::env::var("DATABASE_URL").ok(),
            workspace_root: std::env::var("VATLOAD_WORKSPACE_ROOT")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from(".")),
            datasets_file: std::env::var("VATLOAD_DATASETS")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("datasets.yaml")),
            queries_dir: std::env::var("VATLOAD_QUERIES_DIR").ok().map(PathBuf::from),
            reports_dir: std::env::var("VATLOAD_REPORTS_DIR").ok().map(PathBuf::from),
        }
    }

    pub fn resolve(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.workspace_root.join(path)
        }
    }

    pub fn load_datasets(&self) -> Result<DatasetsFile> {
        DatasetsFile::load(&self.resolve(&self.datasets_file))
    }

    pub fn load_statements(&self) -> Result<StatementSet> {
        match &self.queries_dir {
            Some(dir) => StatementSet::load_dir(&self.resolve(dir)),
            None => StatementSet::postgres_defaults().context("validating bundled templates"),
        }
    }
}

fn default_date_columns() -> Vec<String> {
    DEFAULT_DATE_COLUMNS.iter().map(|c| c.to_string()).collect()
}

fn default_source_date_format() -> String {
    DEFAULT_SOURCE_DATE_FORMAT.to_string()
}

fn default_source_extension() -> String {
    DEFAULT_SOURCE_EXTENSION.to_string()
}

fn default_corrected_suffix() -> String {
    DEFAULT_CORRECTED_SUFFIX.to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatasetsFile {
    #[serde(default = "default_date_columns")]
    pub date_columns: Vec<String>,
    #[serde(default = "default_source_date_format")]
    pub source_date_format: String,
    #[serde(default = "default_source_extension")]
    pub source_extension: String,
    #[serde(default = "default_corrected_suffix")]
    pub corrected_suffix: String,
    #[serde(default)]
    pub administrative_columns: Vec<String>,
    pub datasets: Vec<DatasetDescriptor>,
}

impl DatasetsFile {
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        Self::parse(&text).with_context(|| format!("parsing {}", path.display()))
    }

    pub fn parse(text: &str) -> Result<Self> {
        let parsed: Self = serde_yaml::from_str(text)?;
        parsed.validate()?;
        Ok(parsed)
    }

    fn validate(&self) -> Result<()> {
        if self.datasets.is_empty() {
            bail!("no datasets configured");
        }
        if self.corrected_suffix.is_empty() {
            bail!("corrected_suffix must not be empty");
        }
        let mut names = HashSet::new();
        for dataset in &self.datasets {
            if !names.insert(dataset.name.as_str()) {
                bail!("dataset `{}` is configured twice", dataset.name);
            }
            quote_table(&dataset.staging_table)
                .with_context(|| format!("dataset `{}` staging_table", dataset.name))?;
            quote_table(&dataset.permanent_table)
                .with_context(|| format!("dataset `{}` permanent_table", dataset.name))?;
            if dataset.staging_table == dataset.permanent_table {
                bail!("dataset `{}` stages into its permanent table", dataset.name);
            }
            if let Some(column) = dataset
                .identity_columns
                .iter()
                .find(|c| self.administrative_columns.contains(c))
            {
                bail!(
                    "dataset `{}` identity column `{column}` is also administrative",
                    dataset.name
                );
            }
        }
        Ok(())
    }

    pub fn corrector(&self) -> FileCorrector {
        FileCorrector::new(
            DateNormalizer::new(self.date_columns.iter().cloned())
                .with_source_format(self.source_date_format.clone()),
            SourceLayout::new(self.source_extension.clone(), self.corrected_suffix.clone()),
        )
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct FileReport {
    pub file: PathBuf,
    pub corrected_file: Option<PathBuf>,
    pub state: FileState,
    pub rows_corrected: usize,
    pub dates_nulled: usize,
    pub rows_staged: u64,
    pub rows_merged: u64,
    pub cleanup_warnings: Vec<String>,
}

impl FileReport {
    fn new(file: &Path) -> Self {
        Self {
            file: file.to_path_buf(),
            corrected_file: None,
            state: FileState::discovered(),
            rows_corrected: 0,
            dates_nulled: 0,
            rows_staged: 0,
            rows_merged: 0,
            cleanup_warnings: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct DatasetReport {
    pub dataset: String,
    pub skipped: Option<String>,
    pub files: Vec<FileReport>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub datasets: Vec<DatasetReport>,
}

impl RunSummary {
    fn files(&self) -> impl Iterator<Item = &FileReport> {
        self.datasets.iter().flat_map(|d| d.files.iter())
    }

    pub fn files_total(&self) -> usize {
        self.files().count()
    }

    pub fn files_cleaned(&self) -> usize {
        self.files().filter(|f| f.state.is_cleaned()).count()
    }

    pub fn files_failed(&self) -> usize {
        self.files().filter(|f| f.state.is_failed()).count()
    }

    pub fn rows_merged(&self) -> u64 {
        self.files().map(|f| f.rows_merged).sum()
    }

    pub fn has_failures(&self) -> bool {
        self.files_failed() > 0
    }

    /// Writes `<reports_dir>/<run_id>/load_summary.json`.
    pub async fn write_json(&self, reports_dir: &Path) -> Result<PathBuf> {
        let dir = reports_dir.join(self.run_id.to_string());
        fs::create_dir_all(&dir)
            .await
            .with_context(|| format!("creating {}", dir.display()))?;
        let path = dir.join("load_summary.json");
        let bytes = serde_json::to_vec_pretty(self).context("serializing run summary")?;
        fs::write(&path, bytes)
            .await
            .with_context(|| format!("writing {}", path.display()))?;
        Ok(path)
    }
}

pub struct LoadPipeline {
    datasets: Vec<DatasetDescriptor>,
    administrative_columns: Vec<String>,
    corrector: FileCorrector,
    statements: StatementSet,
    workspace_root: PathBuf,
}

impl LoadPipeline {
    pub fn new(datasets: &DatasetsFile, statements: StatementSet, workspace_root: impl Into<PathBuf>) -> Self {
        Self {
            datasets: datasets.datasets.clone(),
            administrative_columns: datasets.administrative_columns.clone(),
            corrector: datasets.corrector(),
            statements,
            workspace_root: workspace_root.into(),
        }
    }

    /// Runs every dataset, then releases the session whatever happened.
    pub async fn run_and_close<S: StoreSession>(&self, mut session: S) -> RunSummary {
        let summary = self.run(&mut session).await;
        if let Err(err) = session.close().await {
            warn!(error = %err, "failed to close store session");
        }
        summary
    }

    pub async fn run<S: StoreSession>(&self, session: &mut S) -> RunSummary {
        let started_at = Utc::now();
        let run_id = Uuid::new_v4();
        let mut datasets = Vec::with_capacity(self.datasets.len());
        for dataset in &self.datasets {
            let span = info_span!("dataset", %run_id, dataset = %dataset.name);
            datasets.push(self.run_dataset(session, dataset).instrument(span).await);
        }
        let summary = RunSummary {
            run_id,
            started_at,
            finished_at: Utc::now(),
            datasets,
        };
        info!(
            %run_id,
            files = summary.files_total(),
            cleaned = summary.files_cleaned(),
            failed = summary.files_failed(),
            rows_merged = summary.rows_merged(),
            "load run finished"
        );
        summary
    }

    fn source_folder(&self, dataset: &DatasetDescriptor) -> PathBuf {
        if dataset.source_folder.is_absolute() {
            dataset.source_folder.clone()
        } else {
            self.workspace_root.join(&dataset.source_folder)
        }
    }

    pub async fn run_dataset<S: StoreSession>(
        &self,
        session: &mut S,
        dataset: &DatasetDescriptor,
    ) -> DatasetReport {
        let mut report = DatasetReport {
            dataset: dataset.name.clone(),
            skipped: None,
            files: Vec::new(),
        };
        let folder = self.source_folder(dataset);
        let folder = match inspect_folder(&folder) {
            Ok(FolderStatus::Ready(folder)) => folder,
            Ok(FolderStatus::Missing) => {
                info!(folder = %folder.display(), "dataset folder does not exist; skipping");
                report.skipped = Some("folder missing".to_string());
                return report;
            }
            Ok(FolderStatus::Empty) => {
                info!(folder = %folder.display(), "dataset folder is empty; skipping");
                report.skipped = Some("folder empty".to_string());
                return report;
            }
            Err(err) => {
                warn!(error = %err, "cannot read dataset folder; skipping");
                report.skipped = Some(err.to_string());
                return report;
            }
        };

        let files = match self.corrector.layout().discover(&folder) {
            Ok(files) => files,
            Err(err) => {
                warn!(error = %err, "cannot list dataset folder; skipping");
                report.skipped = Some(err.to_string());
                return report;
            }
        };
        info!(folder = %folder.display(), candidates = files.len(), "discovered source files");

        for file in files {
            report.files.push(self.process_file(session, dataset, &file).await);
        }
        report
    }

    /// Takes one file from `Discovered` to `Cleaned`, or to `Failed` at the stage it reached.
    pub async fn process_file<S: StoreSession>(
        &self,
        session: &mut S,
        dataset: &DatasetDescriptor,
        file: &Path,
    ) -> FileReport {
        let file_name = file
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let span = info_span!("load_file", dataset = %dataset.name, file = %file_name);
        async move {
            let mut report = FileReport::new(file);
            match self.load_file(session, dataset, file, &mut report).await {
                Ok(()) => {
                    self.clean_up(&mut report);
                    report.state.advance();
                    info!(merged = report.rows_merged, "file loaded");
                }
                Err(err) => {
                    report.state.fail(&err);
                    let stage = report.state.stage();
                    match err.kind() {
                        FailureKind::Format => error!(
                            dataset = %dataset.name,
                            file = %file_name,
                            %stage,
                            error = %err,
                            "invalid file format; source file kept"
                        ),
                        FailureKind::Store | FailureKind::Io => error!(
                            dataset = %dataset.name,
                            file = %file_name,
                            %stage,
                            error = %err,
                            "failed to load file; source file kept"
                        ),
                    }
                }
            }
            report
        }
        .instrument(span)
        .await
    }

    async fn load_file<S: StoreSession>(
        &self,
        session: &mut S,
        dataset: &DatasetDescriptor,
        file: &Path,
        report: &mut FileReport,
    ) -> Result<(), LoadError> {
        let corrected = self.corrector.correct(file)?;
        report.corrected_file = Some(corrected.corrected_path.clone());
        report.rows_corrected = corrected.row_count;
        report.dates_nulled = corrected.dates.nulled;
        reach(&mut report.state, FileStage::Corrected);

        let plan = FingerprintPlan::build(
            &corrected.corrected_path,
            &corrected.columns,
            &dataset.identity_columns,
            &self.administrative_columns,
        )?;
        let context = StatementContext {
            dataset: dataset.name.clone(),
            staging_table: dataset.staging_table.clone(),
            permanent_table: dataset.permanent_table.clone(),
            file_path: absolute(&corrected.corrected_path)?,
            plan,
        };

        let loader = StagingLoader::new(&self.statements);
        let dedup = Deduplicator::new(&self.statements);
        let merge = MergeEngine::new(&self.statements);

        loader.clear(session, &context).await?;
        reach(&mut report.state, StoreStep::ClearStaging.completes());
        report.rows_staged = loader.bulk_load(session, &context).await?;
        reach(&mut report.state, StoreStep::BulkLoad.completes());
        dedup.assign_sequence(session, &context).await?;
        reach(&mut report.state, StoreStep::AssignSequence.completes());
        dedup.assign_fingerprint(session, &context).await?;
        reach(&mut report.state, StoreStep::AssignFingerprint.completes());
        report.rows_merged = merge.merge(session, &context).await?;
        reach(&mut report.state, StoreStep::Merge.completes());
        Ok(())
    }

    /// Deletion failures are recorded but do not change the file's outcome.
    fn clean_up(&self, report: &mut FileReport) {
        let mut targets = vec![report.file.clone()];
        targets.extend(report.corrected_file.clone());
        for path in targets {
            if let Err(err) = remove_file_guarded(&path) {
                warn!(error = %err, "could not remove file after load");
                report.cleanup_warnings.push(err.to_string());
            }
        }
    }
}

fn reach(state: &mut FileState, expected: FileStage) {
    let reached = state.advance();
    debug_assert_eq!(reached, expected, "file stages must advance in order");
}

fn absolute(path: &Path) -> Result<PathBuf, LoadError> {
    if path.is_absolute() {
        return Ok(path.to_path_buf());
    }
    std::env::current_dir()
        .map(|cwd| cwd.join(path))
        .map_err(|source| LoadError::Io {
            path: path.to_path_buf(),
            source,
        })
}

#[derive(Debug, Clone, Serialize)]
pub struct RenderedSample {
    pub dataset: String,
    pub step: StoreStep,
    pub sql: String,
}

/// Validates configuration and templates and renders every statement for every
/// dataset against a representative file header. Touches neither files nor the store.
pub fn check_config(config: &LoadConfig) -> Result<Vec<RenderedSample>> {
    let datasets = config.load_datasets()?;
    let statements = config.load_statements()?;
    let mut samples = Vec::new();
    for dataset in &datasets.datasets {
        let mut columns = dataset.identity_columns.clone();
        let dates = datasets
            .date_columns
            .iter()
            .filter(|c| !columns.contains(c))
            .cloned()
            .collect::<Vec<_>>();
        columns.extend(dates);
        let folder = config.resolve(&dataset.source_folder);
        let sample_file = datasets
            .corrector()
            .layout()
            .corrected_path_for(&folder.join(format!("sample.{}", datasets.source_extension)));
        let plan = FingerprintPlan::build(
            &sample_file,
            &columns,
            &dataset.identity_columns,
            &datasets.administrative_columns,
        )?;
        let context = StatementContext {
            dataset: dataset.name.clone(),
            staging_table: dataset.staging_table.clone(),
            permanent_table: dataset.permanent_table.clone(),
            file_path: sample_file,
            plan,
        };
        for step in StoreStep::ALL {
            let sql = statements
                .render(step, &context)
                .with_context(|| format!("rendering {step} for dataset `{}`", dataset.name))?;
            samples.push(RenderedSample {
                dataset: dataset.name.clone(),
                step,
                sql,
            });
        }
    }
    Ok(samples)
}

/// Loads configuration, opens one PostgreSQL session for the whole run, and
/// processes every dataset. Per-file failures are reported in the summary.
pub async fn run_once(config: &LoadConfig) -> Result<RunSummary> {
    let datasets = config.load_datasets()?;
    let statements = config.load_statements()?;
    let database_url = config
        .database_url
        .as_deref()
        .context("DATABASE_URL is not set")?;
    let session = PgSession::connect(database_url).await?;

    let pipeline = LoadPipeline::new(&datasets, statements, config.workspace_root.clone());
    let summary = pipeline.run_and_close(session).await;

    if let Some(dir) = &config.reports_dir {
        match summary.write_json(&config.resolve(dir)).await {
            Ok(path) => info!(path = %path.display(), "wrote run summary"),
            Err(err) => warn!(error = %err, "could not write run summary"),
        }
    }
    Ok(summary)
}
