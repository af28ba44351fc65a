use std::collections::HashSet;

use anyhow::{Context, Result};
use clickhouse_rs::Pool;

use crate::config::ClickHouseConfig;

use super::rows::{escape_identifier, escape_sql, ALL_TABLES};
use super::{Statement, Store, StoreError, TableDef};

/// Sharding key for distributed tables without a hash override.
const DEFAULT_SHARDING_KEY: &str = "rand()";

/// The pool opens against this database; tenant databases may not exist
/// yet, so every statement names its target explicitly.
const CONNECT_DATABASE: &str = "default";

const POOL_OPTIONS: &str = "compression=lz4&pool_min=2&pool_max=10";

/// ClickHouse backend over the native TCP pool.
pub struct ClickHouseStore {
    pool: Pool,
    cfg: ClickHouseConfig,
}

impl ClickHouseStore {
    /// Opens the pool and pings the server once before accepting writes.
    pub async fn connect(cfg: ClickHouseConfig) -> Result<Self> {
        let pool = Pool::new(dsn(&cfg));

        let mut handle = pool
            .get_handle()
            .await
            .with_context(|| format!("connecting to {}", cfg.endpoint))?;
        handle.ping().await.context("pinging ClickHouse")?;

        tracing::info!(endpoint = %cfg.endpoint, database = %cfg.database, "ClickHouse connected");

        Ok(Self { pool, cfg })
    }

    fn on_cluster(&self) -> String {
        match &self.cfg.cluster {
            Some(cluster) if !cluster.is_empty() => {
                format!(" ON CLUSTER `{}`", escape_identifier(cluster))
            }
            _ => String::new(),
        }
    }

    /// Names returned by a single-column `name` query.
    async fn fetch_names(&self, sql: &str, table: &str) -> Result<HashSet<String>, StoreError> {
        let backend = |source| StoreError::Backend {
            table: table.to_string(),
            source,
        };

        let mut handle = self.pool.get_handle().await.map_err(backend)?;
        let block = handle.query(sql).fetch_all().await.map_err(backend)?;

        let mut names = HashSet::with_capacity(block.row_count());
        for row in block.rows() {
            let name: String = row.get("name").map_err(backend)?;
            names.insert(name);
        }
        Ok(names)
    }

    async fn existing_tables(&self, database: &str) -> Result<HashSet<String>> {
        let sql = format!(
            "SELECT name FROM system.tables WHERE database = '{}'",
            escape_sql(database)
        );
        self.fetch_names(&sql, "system.tables")
            .await
            .with_context(|| format!("listing tables of {database}"))
    }
}

impl Store for ClickHouseStore {
    /// Verifies the target table has every column the encoder writes before
    /// building the insert.
    async fn prepare(&self, database: &str, table: TableDef) -> Result<Statement, StoreError> {
        let sql = format!(
            "SELECT name FROM system.columns WHERE database = '{}' AND table = '{}'",
            escape_sql(database),
            table.name()
        );
        let columns = self.fetch_names(&sql, table.name()).await?;

        if columns.is_empty() {
            return Err(StoreError::UnknownTable {
                database: database.to_string(),
                table: table.name().to_string(),
            });
        }

        let missing: Vec<String> = table
            .columns
            .iter()
            .filter(|c| !columns.contains(**c))
            .map(|c| c.to_string())
            .collect();
        if !missing.is_empty() {
            return Err(StoreError::MissingColumns {
                database: database.to_string(),
                table: table.name().to_string(),
                missing,
            });
        }

        tracing::debug!(database, table = table.name(), "statement prepared");

        Ok(Statement::new(database, table))
    }

    async fn execute(&self, statement: &Statement, rows: &[String]) -> Result<(), StoreError> {
        statement.ensure_open()?;
        if rows.is_empty() {
            return Ok(());
        }

        let backend = |source| StoreError::Backend {
            table: statement.table().to_string(),
            source,
        };

        let sql = statement.render(rows);
        let mut handle = self.pool.get_handle().await.map_err(backend)?;
        handle.execute(sql.as_str()).await.map_err(backend)?;

        Ok(())
    }

    async fn init_database(&self, database: &str) -> Result<()> {
        let on_cluster = self.on_cluster();
        let db = escape_identifier(database);

        let mut handle = self
            .pool
            .get_handle()
            .await
            .context("getting ClickHouse handle for database init")?;

        handle
            .execute(format!("CREATE DATABASE IF NOT EXISTS `{db}`{on_cluster}").as_str())
            .await
            .with_context(|| format!("creating database {database}"))?;

        let existing = self.existing_tables(database).await?;

        for table in ALL_TABLES {
            let name = table.name();
            if !existing.contains(name) {
                continue;
            }
            let settings = self.cfg.table_settings(name);

            let ttl = format!(
                "ALTER TABLE `{db}`.{name}{on_cluster} MODIFY TTL toDateTime(timestamp) + toIntervalDay({})",
                settings.ttl_days
            );
            handle
                .execute(ttl.as_str())
                .await
                .with_context(|| format!("applying ttl to {database}.{name}"))?;

            if let Some(cluster) = self.cfg.cluster.as_deref().filter(|c| !c.is_empty()) {
                let distributed = format!("{name}_all");
                if existing.contains(&distributed) {
                    continue;
                }
                let sharding = settings.hash.as_deref().unwrap_or(DEFAULT_SHARDING_KEY);
                let ddl = format!(
                    "CREATE TABLE IF NOT EXISTS `{db}`.{distributed}{on_cluster} AS `{db}`.{name} \
                     ENGINE = Distributed('{}', '{}', '{name}', {sharding})",
                    escape_sql(cluster),
                    escape_sql(database),
                );
                handle
                    .execute(ddl.as_str())
                    .await
                    .with_context(|| format!("creating distributed table {database}.{distributed}"))?;
            }
        }

        tracing::info!(database, tables = existing.len(), "database initialized");

        Ok(())
    }
}

/// Native-protocol DSN: `tcp://[user[:password]@]endpoint/default?options`.
fn dsn(cfg: &ClickHouseConfig) -> String {
    let credentials = match (cfg.username.is_empty(), cfg.password.is_empty()) {
        (true, _) => String::new(),
        (false, true) => format!("{}@", cfg.username),
        (false, false) => format!("{}:{}@", cfg.username, cfg.password),
    };
    format!(
        "tcp://{credentials}{}/{CONNECT_DATABASE}?{POOL_OPTIONS}",
        cfg.endpoint
    )
}
