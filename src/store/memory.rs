use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use anyhow::{bail, Result};
use parking_lot::Mutex;

use super::{Statement, Store, StoreError, TableDef};

/// One executed batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WrittenBatch {
    pub database: String,
    pub table: &'static str,
    pub rows: Vec<String>,
}

/// In-memory store. Records every batch unless built with
/// [`MemoryStore::dry_run`], which only logs batch sizes.
#[derive(Default)]
pub struct MemoryStore {
    dry_run: bool,
    batches: Mutex<Vec<WrittenBatch>>,
    initialized: Mutex<Vec<String>>,
    prepares: AtomicUsize,
    fail_init: AtomicBool,
    failing_tables: Mutex<HashSet<&'static str>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// A store that accepts and discards every batch.
    pub fn dry_run() -> Self {
        Self {
            dry_run: true,
            ..Self::default()
        }
    }

    pub fn batches(&self) -> Vec<WrittenBatch> {
        self.batches.lock().clone()
    }

    /// Batches written to `table`, in write order.
    pub fn batches_for(&self, table: &str) -> Vec<WrittenBatch> {
        self.batches
            .lock()
            .iter()
            .filter(|b| b.table == table)
            .cloned()
            .collect()
    }

    /// Databases initialised so far, in call order.
    pub fn initialized(&self) -> Vec<String> {
        self.initialized.lock().clone()
    }

    pub fn prepare_count(&self) -> usize {
        self.prepares.load(Ordering::Relaxed)
    }

    /// Makes every following `init_database` fail.
    pub fn fail_init(&self, fail: bool) {
        self.fail_init.store(fail, Ordering::Relaxed);
    }

    /// Makes writes to `table` fail until cleared.
    pub fn fail_table(&self, table: &'static str, fail: bool) {
        let mut failing = self.failing_tables.lock();
        if fail {
            failing.insert(table);
        } else {
            failing.remove(table);
        }
    }
}

impl Store for MemoryStore {
    async fn prepare(&self, database: &str, table: TableDef) -> Result<Statement, StoreError> {
        self.prepares.fetch_add(1, Ordering::Relaxed);
        Ok(Statement::new(database, table))
    }

    async fn execute(&self, statement: &Statement, rows: &[String]) -> Result<(), StoreError> {
        statement.ensure_open()?;
        if rows.is_empty() {
            return Ok(());
        }

        if self.failing_tables.lock().contains(statement.table()) {
            return Err(StoreError::Rejected {
                table: statement.table().to_string(),
                reason: "table marked failing".to_string(),
            });
        }

        if self.dry_run {
            tracing::info!(
                database = statement.database(),
                table = statement.table(),
                rows = rows.len(),
                "dry run batch"
            );
            return Ok(());
        }

        self.batches.lock().push(WrittenBatch {
            database: statement.database().to_string(),
            table: statement.table(),
            rows: rows.to_vec(),
        });
        Ok(())
    }

    async fn init_database(&self, database: &str) -> Result<()> {
        if self.fail_init.load(Ordering::Relaxed) {
            bail!("database {database} unavailable");
        }
        self.initialized.lock().push(database.to_string());
        Ok(())
    }
}
