//! In-process relational store. Each rendered step is interpreted with the
//! reference semantics (path-based load, dense sequence, SHA-256 fingerprint,
//! anti-join merge) instead of being sent to a database.

use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use vatload_core::{StoreError, StoreStep};
use vatload_files::read_row_set;

use crate::{RenderedStatement, StoreSession};

pub type Row = BTreeMap<String, Option<String>>;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StoredRow {
    pub values: Row,
    pub row_sequence: Option<u64>,
    pub row_fingerprint: Option<String>,
}

#[derive(Debug, Default)]
struct MemoryState {
    staging: BTreeMap<String, Vec<StoredRow>>,
    permanent: BTreeMap<String, Vec<StoredRow>>,
    executed: Vec<(StoreStep, String)>,
    closed: bool,
}

type FailurePredicate = dyn Fn(&RenderedStatement<'_>) -> bool + Send + Sync;

/// Cloneable handle; clones share the same tables.
#[derive(Clone, Default)]
pub struct MemoryStore {
    state: Arc<Mutex<MemoryState>>,
    fail_when: Option<Arc<FailurePredicate>>,
}

impl fmt::Debug for MemoryStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryStore")
            .field("state", &self.state)
            .field("fail_when", &self.fail_when.is_some())
            .finish()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every statement matching `predicate` fail before touching any table.
    pub fn failing_when<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&RenderedStatement<'_>) -> bool + Send + Sync + 'static,
    {
        self.fail_when = Some(Arc::new(predicate));
        self
    }

    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn permanent_rows(&self, table: &str) -> Vec<Row> {
        self.lock()
            .permanent
            .get(table)
            .map(|rows| rows.iter().map(|r| r.values.clone()).collect())
            .unwrap_or_default()
    }

    pub fn staging_rows(&self, table: &str) -> Vec<StoredRow> {
        self.lock().staging.get(table).cloned().unwrap_or_default()
    }

    /// Steps executed so far, with the table each one targeted.
    pub fn executed(&self) -> Vec<(StoreStep, String)> {
        self.lock().executed.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }
}

fn failure(step: StoreStep, table: &str, message: &str) -> StoreError {
    StoreError::new(step, table, message.to_string())
}

#[async_trait]
impl StoreSession for MemoryStore {
    async fn execute(&mut self, statement: RenderedStatement<'_>) -> Result<u64, StoreError> {
        let step = statement.step;
        let ctx = statement.context;
        let table = ctx.target_table(step);
        if let Some(predicate) = &self.fail_when {
            if predicate(&statement) {
                return Err(failure(step, table, "injected failure"));
            }
        }

        let mut guard = self.lock();
        let state = &mut *guard;
        if state.closed {
            return Err(failure(step, table, "session is closed"));
        }
        state.executed.push((step, table.to_string()));

        match step {
            StoreStep::ClearStaging => {
                let rows = state.staging.entry(ctx.staging_table.clone()).or_default();
                let removed = rows.len() as u64;
                rows.clear();
                Ok(removed)
            }
            StoreStep::BulkLoad => {
                let loaded =
                    read_row_set(&ctx.file_path).map_err(|err| StoreError::new(step, table, err))?;
                let rows = state.staging.entry(ctx.staging_table.clone()).or_default();
                for cells in loaded.rows() {
                    rows.push(StoredRow {
                        values: loaded.columns().iter().cloned().zip(cells.iter().cloned()).collect(),
                        ..StoredRow::default()
                    });
                }
                Ok(loaded.len() as u64)
            }
            StoreStep::AssignSequence => {
                let rows = state.staging.entry(ctx.staging_table.clone()).or_default();
                for (i, row) in rows.iter_mut().enumerate() {
                    row.row_sequence = Some(i as u64 + 1);
                }
                Ok(rows.len() as u64)
            }
            StoreStep::AssignFingerprint => {
                let rows = state.staging.entry(ctx.staging_table.clone()).or_default();
                for row in rows.iter_mut() {
                    row.row_fingerprint = Some(ctx.plan.fingerprint(&row.values));
                }
                Ok(rows.len() as u64)
            }
            StoreStep::Merge => {
                let mut staged = state
                    .staging
                    .get(&ctx.staging_table)
                    .cloned()
                    .unwrap_or_default();
                staged.sort_by_key(|r| r.row_sequence);
                let permanent = state.permanent.entry(ctx.permanent_table.clone()).or_default();

                let mut seen = permanent
                    .iter()
                    .filter_map(|r| {
                        let fp = r.row_fingerprint.clone()?;
                        Some((ctx.plan.identity_key(&r.values), fp))
                    })
                    .collect::<HashSet<_>>();
                let mut inserted = 0u64;
                for row in staged {
                    let Some(fp) = row.row_fingerprint.clone() else {
                        return Err(failure(step, table, "staged row has no row_fingerprint"));
                    };
                    if seen.insert((ctx.plan.identity_key(&row.values), fp.clone())) {
                        permanent.push(StoredRow {
                            values: row.values,
                            row_sequence: None,
                            row_fingerprint: Some(fp),
                        });
                        inserted += 1;
                    }
                }
                Ok(inserted)
            }
        }
    }

    async fn close(self) -> anyhow::Result<()> {
        self.lock().closed = true;
        Ok(())
    }
}
