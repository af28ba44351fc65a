//! Storage sink: compiled insert statements, their idle-evicting cache, row
//! encoders and the ClickHouse and in-memory backends.

pub mod clickhouse;
pub mod memory;
pub mod rows;
pub mod statement_cache;

pub use self::clickhouse::ClickHouseStore;
pub use memory::{MemoryStore, WrittenBatch};
pub use rows::TableRow;
pub use statement_cache::StatementCache;

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::model::RecordKind;

/// Columns of one store table, in insert order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TableDef {
    pub kind: RecordKind,
    pub columns: &'static [&'static str],
}

impl TableDef {
    pub const fn name(&self) -> &'static str {
        self.kind.table_name()
    }
}

/// Errors returned by a [`Store`].
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("clickhouse error on {table}: {source}")]
    Backend {
        table: String,
        #[source]
        source: clickhouse_rs::errors::Error,
    },

    #[error("table {database}.{table} does not exist")]
    UnknownTable { database: String, table: String },

    #[error("table {database}.{table} is missing columns: {missing:?}")]
    MissingColumns {
        database: String,
        table: String,
        missing: Vec<String>,
    },

    #[error("statement for {database}.{table} is closed")]
    StatementClosed { database: String, table: String },

    #[error("write to {table} rejected: {reason}")]
    Rejected { table: String, reason: String },
}

/// A compiled insert for one (database, table) pair.
///
/// Holds the insert prefix built once at prepare time. Closing is one-way;
/// a closed statement refuses further executions.
#[derive(Debug)]
pub struct Statement {
    database: String,
    table: &'static str,
    insert_prefix: String,
    closed: AtomicBool,
}

impl Statement {
    pub fn new(database: &str, table: TableDef) -> Self {
        let insert_prefix = format!(
            "INSERT INTO `{}`.{} ({}) VALUES ",
            rows::escape_identifier(database),
            table.name(),
            table.columns.join(", ")
        );
        Self {
            database: database.to_string(),
            table: table.name(),
            insert_prefix,
            closed: AtomicBool::new(false),
        }
    }

    pub fn database(&self) -> &str {
        &self.database
    }

    pub fn table(&self) -> &'static str {
        self.table
    }

    /// Full insert for a batch of encoded value tuples.
    pub fn render(&self, rows: &[String]) -> String {
        let len = rows.iter().map(|r| r.len() + 2).sum::<usize>();
        let mut sql = String::with_capacity(self.insert_prefix.len() + len);
        sql.push_str(&self.insert_prefix);
        for (idx, row) in rows.iter().enumerate() {
            if idx > 0 {
                sql.push_str(", ");
            }
            sql.push_str(row);
        }
        sql
    }

    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub(crate) fn ensure_open(&self) -> Result<(), StoreError> {
        if self.is_closed() {
            return Err(StoreError::StatementClosed {
                database: self.database.clone(),
                table: self.table.to_string(),
            });
        }
        Ok(())
    }
}

/// Storage backend consumed by the flush cycle.
pub trait Store: Send + Sync + 'static {
    /// Compile an insert statement for `table` in `database`.
    fn prepare(
        &self,
        database: &str,
        table: TableDef,
    ) -> impl Future<Output = Result<Statement, StoreError>> + Send;

    /// Write one batch of encoded rows. An empty batch is a no-op.
    fn execute(
        &self,
        statement: &Statement,
        rows: &[String],
    ) -> impl Future<Output = Result<(), StoreError>> + Send;

    /// Create `database` if missing and bring table settings up to date.
    fn init_database(&self, database: &str) -> impl Future<Output = anyhow::Result<()>> + Send;
}
