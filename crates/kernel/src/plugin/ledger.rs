//! Migration ledger and table registry.
//!
//! `{prefix}plugin_migrations` is append-only: one row per lifecycle
//! operation, inserted as `running` before any statement executes and
//! finished exactly once. `{prefix}plugin_tables` maps each plugin to the
//! physical tables its scripts created.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};

use super::error::PluginResult;

/// Kind of lifecycle operation a migration belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MigrationOperation {
    Install,
    Upgrade,
    Uninstall,
    Repair,
}

impl MigrationOperation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Install => "install",
            Self::Upgrade => "upgrade",
            Self::Uninstall => "uninstall",
            Self::Repair => "repair",
        }
    }
}

impl fmt::Display for MigrationOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MigrationOperation {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "install" => Ok(Self::Install),
            "upgrade" => Ok(Self::Upgrade),
            "uninstall" => Ok(Self::Uninstall),
            "repair" => Ok(Self::Repair),
            other => Err(format!("unknown migration operation '{other}'")),
        }
    }
}

/// State of one migration attempt: `running -> {completed | failed}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MigrationStatus {
    Running,
    Completed,
    Failed,
}

impl MigrationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for MigrationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MigrationStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            other => Err(format!("unknown migration status '{other}'")),
        }
    }
}

/// One attempt to apply a script to one plugin.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MigrationRecord {
    pub id: i64,
    pub plugin: String,
    pub version: String,
    pub operation: MigrationOperation,
    pub script_path: Option<PathBuf>,
    pub script_content: String,
    pub status: MigrationStatus,
    pub error: Option<String>,
    pub created_at: i64,
    pub completed_at: Option<i64>,
}

impl MigrationRecord {
    pub fn succeeded(&self) -> bool {
        self.status == MigrationStatus::Completed
    }

    fn from_row(row: &SqliteRow) -> PluginResult<Self> {
        let operation: String = row.try_get("operation")?;
        let status: String = row.try_get("status")?;

        Ok(Self {
            id: row.try_get("id")?,
            plugin: row.try_get("plugin_key")?,
            version: row.try_get("version")?,
            operation: operation
                .parse()
                .map_err(|e: String| sqlx::Error::Decode(e.into()))?,
            script_path: row
                .try_get::<Option<String>, _>("script_path")?
                .map(PathBuf::from),
            script_content: row.try_get("script_content")?,
            status: status
                .parse()
                .map_err(|e: String| sqlx::Error::Decode(e.into()))?,
            error: row.try_get("error")?,
            created_at: row.try_get("created_at")?,
            completed_at: row.try_get("completed_at")?,
        })
    }
}

/// A physical table owned by a plugin.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TableRegistration {
    pub plugin: String,
    pub table: String,
    pub version: String,
    pub create_statement: String,
    pub created_at: i64,
}

impl TableRegistration {
    fn from_row(row: &SqliteRow) -> PluginResult<Self> {
        Ok(Self {
            plugin: row.try_get("plugin_key")?,
            table: row.try_get("table_name")?,
            version: row.try_get("version")?,
            create_statement: row.try_get("create_statement")?,
            created_at: row.try_get("created_at")?,
        })
    }
}

const RECORD_COLUMNS: &str = "id, plugin_key, version, operation, script_path, script_content, \
                              status, error, created_at, completed_at";

const TABLE_COLUMNS: &str = "plugin_key, table_name, version, create_statement, created_at";

/// Store for migration records and table registrations.
#[derive(Clone)]
pub struct Ledger {
    pool: SqlitePool,
    migrations: String,
    tables: String,
}

impl Ledger {
    pub fn new(pool: SqlitePool, table_prefix: &str) -> Self {
        Self {
            pool,
            migrations: format!("{table_prefix}plugin_migrations"),
            tables: format!("{table_prefix}plugin_tables"),
        }
    }

    /// Physical names of the ledger and table-registry tables.
    pub fn tables(&self) -> (&str, &str) {
        (&self.migrations, &self.tables)
    }

    /// Create the ledger and table-registry tables if they do not exist.
    pub async fn ensure_tables(&self) -> PluginResult<()> {
        sqlx::raw_sql(&format!(
            "CREATE TABLE IF NOT EXISTS {migrations} (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                plugin_key TEXT NOT NULL,
                version TEXT NOT NULL,
                operation TEXT NOT NULL,
                script_path TEXT,
                script_content TEXT NOT NULL,
                status TEXT NOT NULL,
                error TEXT,
                created_at INTEGER NOT NULL,
                completed_at INTEGER
            );
            CREATE INDEX IF NOT EXISTS {migrations}_plugin_idx ON {migrations} (plugin_key);
            CREATE TABLE IF NOT EXISTS {tables} (
                plugin_key TEXT NOT NULL,
                table_name TEXT NOT NULL,
                version TEXT NOT NULL,
                create_statement TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                PRIMARY KEY (plugin_key, table_name)
            );",
            migrations = self.migrations,
            tables = self.tables,
        ))
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Open a `running` record. This is the checkpoint that lets an audit
    /// find attempts that never finished.
    pub async fn begin(
        &self,
        plugin: &str,
        version: &str,
        operation: MigrationOperation,
        script_path: Option<&str>,
        script_content: &str,
    ) -> PluginResult<MigrationRecord> {
        let now = chrono::Utc::now().timestamp();

        let result = sqlx::query(&format!(
            "INSERT INTO {} (plugin_key, version, operation, script_path, script_content, \
             status, error, created_at, completed_at) VALUES (?, ?, ?, ?, ?, ?, NULL, ?, NULL)",
            self.migrations
        ))
        .bind(plugin)
        .bind(version)
        .bind(operation.as_str())
        .bind(script_path)
        .bind(script_content)
        .bind(MigrationStatus::Running.as_str())
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(MigrationRecord {
            id: result.last_insert_rowid(),
            plugin: plugin.to_string(),
            version: version.to_string(),
            operation,
            script_path: script_path.map(PathBuf::from),
            script_content: script_content.to_string(),
            status: MigrationStatus::Running,
            error: None,
            created_at: now,
            completed_at: None,
        })
    }

    /// Finish a running record. Returns false if the record was already
    /// finished; finished records are never edited.
    pub async fn finish(
        &self,
        record: &mut MigrationRecord,
        status: MigrationStatus,
        error: Option<String>,
    ) -> PluginResult<bool> {
        let now = chrono::Utc::now().timestamp();

        let result = sqlx::query(&format!(
            "UPDATE {} SET status = ?, error = ?, completed_at = ? WHERE id = ? AND status = ?",
            self.migrations
        ))
        .bind(status.as_str())
        .bind(&error)
        .bind(now)
        .bind(record.id)
        .bind(MigrationStatus::Running.as_str())
        .execute(&self.pool)
        .await?;

        let updated = result.rows_affected() > 0;
        if updated {
            record.status = status;
            record.error = error;
            record.completed_at = Some(now);
        }
        Ok(updated)
    }

    /// Records for one plugin, oldest first.
    pub async fn records_for(&self, plugin: &str) -> PluginResult<Vec<MigrationRecord>> {
        let rows = sqlx::query(&format!(
            "SELECT {RECORD_COLUMNS} FROM {} WHERE plugin_key = ? ORDER BY id",
            self.migrations
        ))
        .bind(plugin)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(MigrationRecord::from_row).collect()
    }

    /// Every record, oldest first.
    pub async fn all_records(&self) -> PluginResult<Vec<MigrationRecord>> {
        let rows = sqlx::query(&format!(
            "SELECT {RECORD_COLUMNS} FROM {} ORDER BY id",
            self.migrations
        ))
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(MigrationRecord::from_row).collect()
    }

    /// Register (or refresh) a table created by a plugin script.
    pub async fn register_table(
        &self,
        plugin: &str,
        table: &str,
        version: &str,
        create_statement: &str,
    ) -> PluginResult<()> {
        let now = chrono::Utc::now().timestamp();

        sqlx::query(&format!(
            "INSERT INTO {} ({TABLE_COLUMNS}) VALUES (?, ?, ?, ?, ?) \
             ON CONFLICT (plugin_key, table_name) DO UPDATE SET \
             version = excluded.version, create_statement = excluded.create_statement",
            self.tables
        ))
        .bind(plugin)
        .bind(table)
        .bind(version)
        .bind(create_statement)
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Tables owned by one plugin, in registration order.
    pub async fn tables_for(&self, plugin: &str) -> PluginResult<Vec<TableRegistration>> {
        let rows = sqlx::query(&format!(
            "SELECT {TABLE_COLUMNS} FROM {} WHERE plugin_key = ? ORDER BY rowid",
            self.tables
        ))
        .bind(plugin)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(TableRegistration::from_row).collect()
    }

    /// Every table registration, grouped by plugin.
    pub async fn all_tables(&self) -> PluginResult<Vec<TableRegistration>> {
        let rows = sqlx::query(&format!(
            "SELECT {TABLE_COLUMNS} FROM {} ORDER BY plugin_key, rowid",
            self.tables
        ))
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(TableRegistration::from_row).collect()
    }

    /// Remove one table registration.
    pub async fn remove_table(&self, plugin: &str, table: &str) -> PluginResult<bool> {
        let result = sqlx::query(&format!(
            "DELETE FROM {} WHERE plugin_key = ? AND table_name = ?",
            self.tables
        ))
        .bind(plugin)
        .bind(table)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Remove every table registration of a plugin.
    pub async fn remove_tables_for(&self, plugin: &str) -> PluginResult<u64> {
        let result = sqlx::query(&format!("DELETE FROM {} WHERE plugin_key = ?", self.tables))
            .bind(plugin)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected())
    }
}
