use crate::reconcile::AccountResult;
use crate::snapshot::write_with_fallback;
use crate::ReconcileError;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::info;

pub const FOLLOWERS_ROW: &str = "followers";
pub const ITEMS_SCRAPED_ROW: &str = "items_scraped";

pub fn item_row(item_id: &str, metric: &str) -> String {
    format!("item_{}_{}", item_id, metric)
}

/// `account` as a single path component: anything outside `[A-Za-z0-9._-]`
/// becomes `_`, and all-dot or empty names cannot point at a parent directory.
pub fn path_component(account: &str) -> String {
    let safe: String = account
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') { c } else { '_' })
        .collect();
    if safe.chars().all(|c| c == '.') {
        return "_".repeat(safe.len().max(1));
    }
    safe
}

/// One account's history: rows are `item_<id>_<metric>` plus the summary
/// rows, columns are run timestamps in append order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AccountTable {
    pub account: String,
    pub columns: Vec<String>,
    pub rows: BTreeMap<String, BTreeMap<String, f64>>,
}

impl AccountTable {
    pub fn new(account: impl Into<String>) -> Self {
        Self {
            account: account.into(),
            ..Self::default()
        }
    }

    pub fn column_index(&self) -> FxHashMap<&str, usize> {
        self.columns.iter().enumerate().map(|(i, c)| (c.as_str(), i)).collect()
    }

    pub fn value(&self, row: &str, column: &str) -> Option<f64> {
        self.rows.get(row)?.get(column).copied()
    }

    /// Add `column` filled from `result`. An existing column is never touched.
    pub fn append(&mut self, column: &str, result: &AccountResult) -> Result<usize, ReconcileError> {
        if self.column_index().contains_key(column) {
            return Err(ReconcileError::PersistenceFailure(format!(
                "column {} already present for {}",
                column, self.account
            )));
        }
        self.columns.push(column.to_string());

        let mut cells = 0;
        let mut put = |row: String, value: f64| {
            self.rows.entry(row).or_default().insert(column.to_string(), value);
            cells += 1;
        };
        if let Some(followers) = result.followers {
            put(FOLLOWERS_ROW.to_string(), followers);
        }
        put(ITEMS_SCRAPED_ROW.to_string(), result.merged.len() as f64);
        for record in &result.merged {
            for (metric, value) in &record.metrics {
                if let Some(v) = value {
                    put(item_row(&record.item_id, metric), *v);
                }
            }
        }
        Ok(cells)
    }
}

/// A table with its new column already added and serialized, ready to write.
#[derive(Debug, Clone)]
pub struct StagedTable {
    pub account: String,
    pub column: String,
    pub cells: usize,
    json: Vec<u8>,
}

/// Append-only per-account tables under one directory.
pub struct Store {
    dir: PathBuf,
    fallback_dir: PathBuf,
}

impl Store {
    pub fn new(dir: impl Into<PathBuf>, fallback_dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            fallback_dir: fallback_dir.into(),
        }
    }

    fn file_name(account: &str) -> String {
        format!("{}.json", path_component(account))
    }

    pub fn path_for(&self, account: &str) -> PathBuf {
        self.dir.join(Self::file_name(account))
    }

    pub fn load(&self, account: &str) -> Result<Option<AccountTable>, ReconcileError> {
        let path = self.path_for(account);
        if !path.exists() {
            return Ok(None);
        }
        let text = fs::read_to_string(&path)?;
        Ok(Some(serde_json::from_str(&text)?))
    }

    /// `base`, suffixed if any of `accounts` already has a column by that name.
    pub fn free_column<'r>(
        &self,
        base: &str,
        accounts: impl IntoIterator<Item = &'r str>,
    ) -> Result<String, ReconcileError> {
        let mut taken = Vec::new();
        for account in accounts {
            if let Some(table) = self.load(account)? {
                taken.extend(table.columns);
            }
        }
        Ok(crate::run_state::disambiguate(base, |c| taken.iter().any(|t| t == c)))
    }

    /// Load `result`'s table and add `column` in memory. Nothing is written.
    pub fn stage(&self, column: &str, result: &AccountResult) -> Result<StagedTable, ReconcileError> {
        let mut table = self
            .load(&result.account)?
            .unwrap_or_else(|| AccountTable::new(&result.account));
        let cells = table.append(column, result)?;
        Ok(StagedTable {
            account: result.account.clone(),
            column: column.to_string(),
            cells,
            json: serde_json::to_vec_pretty(&table)?,
        })
    }

    pub fn commit(&self, staged: &StagedTable) -> Result<PathBuf, ReconcileError> {
        let path = write_with_fallback(
            &self.dir,
            &self.fallback_dir.join("store"),
            &Self::file_name(&staged.account),
            &staged.json,
        )?;
        info!(
            account = %staged.account,
            column = %staged.column,
            cells = staged.cells,
            path = %path.display(),
            "store column appended"
        );
        Ok(path)
    }

    /// Append one run column for `result` and return where the table landed.
    pub fn append(&self, column: &str, result: &AccountResult) -> Result<PathBuf, ReconcileError> {
        self.commit(&self.stage(column, result)?)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}
