//! Relational store plumbing: statement templates, the session seam, the
//! PostgreSQL session, and the staging/dedup/merge steps.

#[cfg(any(test, feature = "testing"))]
pub mod memory;

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use anyhow::Context;
use async_trait::async_trait;
use sha2::{Digest, Sha256};
use sqlx::{Connection, PgConnection};
use thiserror::Error;
use tracing::{debug, info_span, Instrument};
use vatload_core::{FormatError, StoreError, StoreStep, ROW_FINGERPRINT_COLUMN, ROW_SEQUENCE_COLUMN};

pub const CRATE_NAME: &str = "vatload-storage";

pub const FINGERPRINT_SEPARATOR: char = '\u{1f}';
pub const FINGERPRINT_NULL: &str = "\\N";

const DEFAULT_TEMPLATES: [(StoreStep, &str); 5] = [
    (StoreStep::ClearStaging, include_str!("../queries/clear_staging.sql")),
    (StoreStep::BulkLoad, include_str!("../queries/bulk_load.sql")),
    (StoreStep::AssignSequence, include_str!("../queries/assign_sequence.sql")),
    (StoreStep::AssignFingerprint, include_str!("../queries/assign_fingerprint.sql")),
    (StoreStep::Merge, include_str!("../queries/merge.sql")),
];

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TemplateError {
    #[error("template `{template}` is missing required placeholder {{{placeholder}}}")]
    MissingPlaceholder { template: String, placeholder: String },
    #[error("template `{template}` uses unsupported placeholder {{{placeholder}}}")]
    UnknownPlaceholder { template: String, placeholder: String },
    #[error("template `{0}` is not configured")]
    MissingTemplate(String),
    #[error("invalid table name `{0}`")]
    InvalidTable(String),
    #[error("empty column name")]
    EmptyColumn,
}

fn placeholder_rules(step: StoreStep) -> (&'static [&'static str], &'static [&'static str]) {
    match step {
        StoreStep::ClearStaging => (&["staging_table"], &[]),
        StoreStep::BulkLoad => (&["staging_table", "file_path"], &["file_columns"]),
        StoreStep::AssignSequence => (&["staging_table"], &[]),
        StoreStep::AssignFingerprint => (&["staging_table"], &["fingerprint_columns"]),
        StoreStep::Merge => (
            &["staging_table", "permanent_table"],
            &["file_columns", "identity_columns", "identity_match", "fingerprint_columns"],
        ),
    }
}

/// `{name}` tokens in `text`; braces around anything else are left alone.
fn scan_placeholders(text: &str) -> BTreeSet<String> {
    let mut found = BTreeSet::new();
    let mut rest = text;
    while let Some(open) = rest.find('{') {
        rest = &rest[open + 1..];
        if let Some(close) = rest.find('}') {
            let name = &rest[..close];
            if !name.is_empty() && name.chars().all(|c| c.is_ascii_lowercase() || c == '_') {
                found.insert(name.to_string());
                rest = &rest[close + 1..];
            }
        }
    }
    found
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatementTemplate {
    step: StoreStep,
    text: String,
    placeholders: BTreeSet<String>,
}

impl StatementTemplate {
    pub fn parse(step: StoreStep, text: impl Into<String>) -> Result<Self, TemplateError> {
        let text = text.into();
        let placeholders = scan_placeholders(&text);
        let (required, optional) = placeholder_rules(step);
        for name in required {
            if !placeholders.contains(*name) {
                return Err(TemplateError::MissingPlaceholder {
                    template: step.template_name().to_string(),
                    placeholder: (*name).to_string(),
                });
            }
        }
        if let Some(unknown) = placeholders
            .iter()
            .find(|p| !required.contains(&p.as_str()) && !optional.contains(&p.as_str()))
        {
            return Err(TemplateError::UnknownPlaceholder {
                template: step.template_name().to_string(),
                placeholder: unknown.clone(),
            });
        }
        Ok(Self {
            step,
            text,
            placeholders,
        })
    }

    pub fn step(&self) -> StoreStep {
        self.step
    }

    pub fn placeholders(&self) -> impl Iterator<Item = &str> {
        self.placeholders.iter().map(String::as_str)
    }

    /// Single pass, so substituted values are never rescanned.
    fn render(&self, values: &BTreeMap<&'static str, String>) -> String {
        let mut out = String::with_capacity(self.text.len());
        let mut rest = self.text.as_str();
        while let Some(open) = rest.find('{') {
            out.push_str(&rest[..open]);
            let after = &rest[open + 1..];
            let token = after
                .find('}')
                .and_then(|close| values.get(&after[..close]).map(|value| (value, close)));
            match token {
                Some((value, close)) => {
                    out.push_str(value);
                    rest = &after[close + 1..];
                }
                None => {
                    out.push('{');
                    rest = after;
                }
            }
        }
        out.push_str(rest);
        out
    }
}

#[derive(Debug, Clone)]
pub struct StatementSet {
    templates: BTreeMap<&'static str, StatementTemplate>,
}

impl StatementSet {
    pub fn from_texts<I, S>(texts: I) -> Result<Self, TemplateError>
    where
        I: IntoIterator<Item = (StoreStep, S)>,
        S: Into<String>,
    {
        let mut templates = BTreeMap::new();
        for (step, text) in texts {
            templates.insert(step.template_name(), StatementTemplate::parse(step, text)?);
        }
        for step in StoreStep::ALL {
            if !templates.contains_key(step.template_name()) {
                return Err(TemplateError::MissingTemplate(step.template_name().to_string()));
            }
        }
        Ok(Self { templates })
    }

    pub fn postgres_defaults() -> Result<Self, TemplateError> {
        Self::from_texts(DEFAULT_TEMPLATES)
    }

    pub fn load_dir(dir: &Path) -> anyhow::Result<Self> {
        let mut texts = Vec::with_capacity(StoreStep::ALL.len());
        for step in StoreStep::ALL {
            let path = dir.join(format!("{}.sql", step.template_name()));
            let text = std::fs::read_to_string(&path)
                .with_context(|| format!("reading statement template {}", path.display()))?;
            texts.push((step, text));
        }
        Self::from_texts(texts).with_context(|| format!("validating templates in {}", dir.display()))
    }

    pub fn template(&self, step: StoreStep) -> Option<&StatementTemplate> {
        self.templates.get(step.template_name())
    }

    pub fn render(
        &self,
        step: StoreStep,
        context: &StatementContext,
    ) -> Result<String, TemplateError> {
        let template = self
            .template(step)
            .ok_or_else(|| TemplateError::MissingTemplate(step.template_name().to_string()))?;
        Ok(template.render(&context.placeholder_values()?))
    }
}

fn quote_identifier(name: &str) -> Result<String, TemplateError> {
    if name.is_empty() {
        return Err(TemplateError::EmptyColumn);
    }
    Ok(format!("\"{}\"", name.replace('"', "\"\"")))
}

/// Quotes `schema.table` / `table`; only ASCII alphanumerics and `_` are accepted.
pub fn quote_table(name: &str) -> Result<String, TemplateError> {
    let valid_part = |part: &str| {
        !part.is_empty() && part.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
    };
    let parts = name.split('.').collect::<Vec<_>>();
    if parts.len() > 2 || !parts.iter().all(|p| valid_part(p)) {
        return Err(TemplateError::InvalidTable(name.to_string()));
    }
    Ok(parts
        .iter()
        .map(|p| format!("\"{p}\""))
        .collect::<Vec<_>>()
        .join("."))
}

fn quote_path_literal(path: &Path) -> String {
    let text = path.to_string_lossy().replace('\\', "/");
    format!("'{}'", text.replace('\'', "''"))
}

fn quote_list(columns: &[String]) -> Result<String, TemplateError> {
    Ok(columns
        .iter()
        .map(|c| quote_identifier(c))
        .collect::<Result<Vec<_>, _>>()?
        .join(", "))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FingerprintPlan {
    file_columns: Vec<String>,
    identity_columns: Vec<String>,
    business_columns: Vec<String>,
}

impl FingerprintPlan {
    /// Every identity column must appear in `file_columns`. Business columns are the
    /// file columns minus the administrative ones, sorted by name.
    pub fn build(
        path: &Path,
        file_columns: &[String],
        identity_columns: &[String],
        administrative_columns: &[String],
    ) -> Result<Self, FormatError> {
        for column in identity_columns {
            if !file_columns.contains(column) {
                return Err(FormatError::MissingIdentityColumn {
                    path: path.to_path_buf(),
                    column: column.clone(),
                });
            }
        }
        let mut business_columns = file_columns
            .iter()
            .filter(|c| {
                c.as_str() != ROW_SEQUENCE_COLUMN
                    && c.as_str() != ROW_FINGERPRINT_COLUMN
                    && !administrative_columns.contains(c)
            })
            .cloned()
            .collect::<Vec<_>>();
        business_columns.sort();
        business_columns.dedup();
        Ok(Self {
            file_columns: file_columns.to_vec(),
            identity_columns: identity_columns.to_vec(),
            business_columns,
        })
    }

    pub fn file_columns(&self) -> &[String] {
        &self.file_columns
    }

    pub fn identity_columns(&self) -> &[String] {
        &self.identity_columns
    }

    pub fn business_columns(&self) -> &[String] {
        &self.business_columns
    }

    /// Reference fingerprint of a row, looked up by column name.
    pub fn fingerprint(&self, row: &BTreeMap<String, Option<String>>) -> String {
        fingerprint_values(
            self.business_columns
                .iter()
                .map(|c| row.get(c).and_then(|v| v.as_deref())),
        )
    }

    pub fn identity_key(&self, row: &BTreeMap<String, Option<String>>) -> Vec<Option<String>> {
        self.identity_columns
            .iter()
            .map(|c| row.get(c).cloned().flatten())
            .collect()
    }
}

/// Lowercase hex SHA-256 of the values joined by U+001F, nulls encoded as `\N`.
pub fn fingerprint_values<'a>(values: impl IntoIterator<Item = Option<&'a str>>) -> String {
    let mut hasher = Sha256::new();
    let mut sep = [0u8; 4];
    for (i, value) in values.into_iter().enumerate() {
        if i > 0 {
            hasher.update(FINGERPRINT_SEPARATOR.encode_utf8(&mut sep).as_bytes());
        }
        hasher.update(value.unwrap_or(FINGERPRINT_NULL).as_bytes());
    }
    hex::encode(hasher.finalize())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatementContext {
    pub dataset: String,
    pub staging_table: String,
    pub permanent_table: String,
    /// Absolute path of the corrected file.
    pub file_path: PathBuf,
    pub plan: FingerprintPlan,
}

impl StatementContext {
    fn placeholder_values(&self) -> Result<BTreeMap<&'static str, String>, TemplateError> {
        let identity_match = if self.plan.identity_columns.is_empty() {
            "TRUE".to_string()
        } else {
            self.plan
                .identity_columns
                .iter()
                .map(|c| {
                    let q = quote_identifier(c)?;
                    Ok(format!("p.{q} IS NOT DISTINCT FROM s.{q}"))
                })
                .collect::<Result<Vec<_>, TemplateError>>()?
                .join(" AND ")
        };
        Ok(BTreeMap::from([
            ("staging_table", quote_table(&self.staging_table)?),
            ("permanent_table", quote_table(&self.permanent_table)?),
            ("file_path", quote_path_literal(&self.file_path)),
            ("file_columns", quote_list(&self.plan.file_columns)?),
            ("fingerprint_columns", quote_list(&self.plan.business_columns)?),
            ("identity_columns", quote_list(&self.plan.identity_columns)?),
            ("identity_match", identity_match),
        ]))
    }

    pub fn target_table(&self, step: StoreStep) -> &str {
        match step {
            StoreStep::Merge => &self.permanent_table,
            _ => &self.staging_table,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct RenderedStatement<'a> {
    pub step: StoreStep,
    pub sql: &'a str,
    pub context: &'a StatementContext,
}

/// Seam to the relational store: execute one statement, commit, report affected rows.
#[async_trait]
pub trait StoreSession: Send {
    async fn execute(&mut self, statement: RenderedStatement<'_>) -> Result<u64, StoreError>;

    async fn close(self) -> anyhow::Result<()>;
}

/// Single PostgreSQL connection held for the whole run. Statements run in
/// autocommit mode, so each step is durable on its own.
pub struct PgSession {
    conn: PgConnection,
}

impl PgSession {
    pub async fn connect(database_url: &str) -> anyhow::Result<Self> {
        let conn = PgConnection::connect(database_url)
            .await
            .context("connecting to the relational store")?;
        Ok(Self { conn })
    }
}

#[async_trait]
impl StoreSession for PgSession {
    async fn execute(&mut self, statement: RenderedStatement<'_>) -> Result<u64, StoreError> {
        let result = sqlx::Executor::execute(&mut self.conn, sqlx::raw_sql(statement.sql))
            .await
            .map_err(|err| {
                StoreError::new(
                    statement.step,
                    statement.context.target_table(statement.step),
                    err,
                )
            })?;
        Ok(result.rows_affected())
    }

    async fn close(self) -> anyhow::Result<()> {
        self.conn.close().await.context("closing store session")
    }
}

async fn execute_step<S: StoreSession>(
    statements: &StatementSet,
    session: &mut S,
    step: StoreStep,
    context: &StatementContext,
) -> Result<u64, StoreError> {
    let table = context.target_table(step);
    let sql = statements
        .render(step, context)
        .map_err(|err| StoreError::new(step, table, err))?;
    let span = info_span!("store_step", step = %step, dataset = %context.dataset, table);
    let affected = session
        .execute(RenderedStatement {
            step,
            sql: &sql,
            context,
        })
        .instrument(span)
        .await?;
    debug!(step = %step, table, affected, "step committed");
    Ok(affected)
}

#[derive(Debug, Clone, Copy)]
pub struct StagingLoader<'a> {
    statements: &'a StatementSet,
}

impl<'a> StagingLoader<'a> {
    pub fn new(statements: &'a StatementSet) -> Self {
        Self { statements }
    }

    pub async fn clear<S: StoreSession>(
        &self,
        session: &mut S,
        context: &StatementContext,
    ) -> Result<u64, StoreError> {
        execute_step(self.statements, session, StoreStep::ClearStaging, context).await
    }

    pub async fn bulk_load<S: StoreSession>(
        &self,
        session: &mut S,
        context: &StatementContext,
    ) -> Result<u64, StoreError> {
        execute_step(self.statements, session, StoreStep::BulkLoad, context).await
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Deduplicator<'a> {
    statements: &'a StatementSet,
}

impl<'a> Deduplicator<'a> {
    pub fn new(statements: &'a StatementSet) -> Self {
        Self { statements }
    }

    pub async fn assign_sequence<S: StoreSession>(
        &self,
        session: &mut S,
        context: &StatementContext,
    ) -> Result<u64, StoreError> {
        execute_step(self.statements, session, StoreStep::AssignSequence, context).await
    }

    pub async fn assign_fingerprint<S: StoreSession>(
        &self,
        session: &mut S,
        context: &StatementContext,
    ) -> Result<u64, StoreError> {
        execute_step(self.statements, session, StoreStep::AssignFingerprint, context).await
    }
}

/// Anti-join insert of unseen `(identity, fingerprint)` pairs into the permanent table.
#[derive(Debug, Clone, Copy)]
pub struct MergeEngine<'a> {
    statements: &'a StatementSet,
}

impl<'a> MergeEngine<'a> {
    pub fn new(statements: &'a StatementSet) -> Self {
        Self { statements }
    }

    pub async fn merge<S: StoreSession>(
        &self,
        session: &mut S,
        context: &StatementContext,
    ) -> Result<u64, StoreError> {
        execute_step(self.statements, session, StoreStep::Merge, context).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cols(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    fn context() -> StatementContext {
        let plan = FingerprintPlan::build(
            Path::new("/data/jcom2/r_corrected.txt"),
            &cols(&["TRANSACTION_EVENT_ID", "TAX_CALCULATION_DATE", "AMOUNT"]),
            &cols(&["TRANSACTION_EVENT_ID"]),
            &[],
        )
        .expect("plan");
        StatementContext {
            dataset: "jcom2".into(),
            staging_table: "t_temp_vat_jcom2_es".into(),
            permanent_table: "vat.t_informe_vat_jcom2_es".into(),
            file_path: PathBuf::from("/data/jcom2/o'brien_corrected.txt"),
            plan,
        }
    }

    #[test]
    fn default_templates_validate() {
        assert!(StatementSet::postgres_defaults().is_ok());
    }

    #[test]
    fn templates_require_and_restrict_placeholders() {
        let err = StatementTemplate::parse(StoreStep::BulkLoad, "COPY {staging_table} FROM stdin").unwrap_err();
        assert_eq!(
            err,
            TemplateError::MissingPlaceholder {
                template: "bulk_load".into(),
                placeholder: "file_path".into()
            }
        );

        let err = StatementTemplate::parse(StoreStep::ClearStaging, "DELETE FROM {staging_table} WHERE x = {file_path}")
            .unwrap_err();
        assert!(matches!(err, TemplateError::UnknownPlaceholder { placeholder, .. } if placeholder == "file_path"));

        let ok = StatementTemplate::parse(StoreStep::ClearStaging, "DELETE FROM {staging_table} WHERE j::jsonb ? '{Key}'");
        assert!(ok.is_ok());

        let missing = StatementSet::from_texts([(StoreStep::ClearStaging, "DELETE FROM {staging_table}")]);
        assert_eq!(missing.unwrap_err(), TemplateError::MissingTemplate("bulk_load".into()));
    }

    #[test]
    fn rendering_quotes_identifiers_and_paths() {
        let set = StatementSet::postgres_defaults().expect("defaults");
        let ctx = context();

        let clear = set.render(StoreStep::ClearStaging, &ctx).expect("render");
        assert!(clear.contains("DELETE FROM \"t_temp_vat_jcom2_es\";"));

        let load = set.render(StoreStep::BulkLoad, &ctx).expect("render");
        assert!(load.contains("FROM '/data/jcom2/o''brien_corrected.txt'"));
        assert!(load.contains("(\"TRANSACTION_EVENT_ID\", \"TAX_CALCULATION_DATE\", \"AMOUNT\")"));

        let fp = set.render(StoreStep::AssignFingerprint, &ctx).expect("render");
        assert!(fp.contains("ARRAY[\"AMOUNT\", \"TAX_CALCULATION_DATE\", \"TRANSACTION_EVENT_ID\"]"));

        let merge = set.render(StoreStep::Merge, &ctx).expect("render");
        assert!(merge.contains("INSERT INTO \"vat\".\"t_informe_vat_jcom2_es\""));
        assert!(merge.contains("p.\"TRANSACTION_EVENT_ID\" IS NOT DISTINCT FROM s.\"TRANSACTION_EVENT_ID\""));
        assert!(!merge.contains('{'));
    }

    #[test]
    fn substituted_values_are_not_rescanned() {
        let set = StatementSet::postgres_defaults().expect("defaults");
        let mut ctx = context();
        ctx.file_path = PathBuf::from("/data/{staging_table}.txt");
        let load = set.render(StoreStep::BulkLoad, &ctx).expect("render");
        assert!(load.contains("FROM '/data/{staging_table}.txt'"));
    }

    #[test]
    fn invalid_table_names_are_rejected() {
        let set = StatementSet::postgres_defaults().expect("defaults");
        let mut ctx = context();
        ctx.staging_table = "t; DROP TABLE x".into();
        assert!(matches!(
            set.render(StoreStep::ClearStaging, &ctx),
            Err(TemplateError::InvalidTable(_))
        ));
        assert!(quote_table("a.b.c").is_err());
        assert_eq!(quote_table("vat.t1").unwrap(), "\"vat\".\"t1\"");
    }

    #[test]
    fn fingerprint_ignores_column_order_and_administrative_columns() {
        let path = Path::new("x.txt");
        let a = FingerprintPlan::build(path, &cols(&["ID", "DATE", "LOADED_AT"]), &cols(&["ID"]), &cols(&["LOADED_AT"]))
            .expect("plan a");
        let b = FingerprintPlan::build(path, &cols(&["LOADED_AT", "DATE", "ID"]), &cols(&["ID"]), &cols(&["LOADED_AT"]))
            .expect("plan b");
        assert_eq!(a.business_columns(), &cols(&["DATE", "ID"])[..]);

        let row1 = BTreeMap::from([
            ("ID".to_string(), Some("1".to_string())),
            ("DATE".to_string(), Some("2024-02-01".to_string())),
            ("LOADED_AT".to_string(), Some("monday".to_string())),
        ]);
        let mut row2 = row1.clone();
        row2.insert("LOADED_AT".into(), Some("tuesday".into()));
        assert_eq!(a.fingerprint(&row1), b.fingerprint(&row2));

        let mut row3 = row1.clone();
        row3.insert("DATE".into(), None);
        assert_ne!(a.fingerprint(&row1), a.fingerprint(&row3));
        assert_eq!(a.identity_key(&row1), vec![Some("1".to_string())]);
    }

    #[test]
    fn fingerprint_matches_sql_definition() {
        // sha256("1\x1f\\N") in hex
        let expected = {
            let mut h = Sha256::new();
            h.update(b"1\x1f\\N");
            hex::encode(h.finalize())
        };
        assert_eq!(fingerprint_values([Some("1"), None]), expected);
        assert_ne!(fingerprint_values([Some("")]), fingerprint_values([None]));
    }

    #[test]
    fn pg_session_implements_the_session_seam() {
        fn assert_session<S: StoreSession>() {}
        assert_session::<PgSession>();
    }

    #[test]
    fn missing_identity_column_is_a_format_error() {
        let err = FingerprintPlan::build(Path::new("r.txt"), &cols(&["A", "B"]), &cols(&["ID"]), &[]).unwrap_err();
        assert!(matches!(err, FormatError::MissingIdentityColumn { column, .. } if column == "ID"));
    }
}
