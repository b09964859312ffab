//! Plugin migration runner.
//!
//! Applies a plugin's install/upgrade/uninstall/repair script against the
//! shared schema. Every attempt is recorded in the ledger before the first
//! statement runs and finished exactly once. Statements run one at a time
//! and execution stops at the first failure; DDL is not rolled back, which
//! is what the health audit is for.

use std::path::Path;

use serde::Serialize;
use sqlx::SqlitePool;
use tracing::{debug, info, warn};

use super::error::PluginResult;
use super::ledger::{Ledger, MigrationOperation, MigrationRecord, MigrationStatus};
use super::sql_split::{created_table, split_statements, substitute_prefix};
use crate::db::{quote_ident, table_exists};

/// Outcome of an uninstall: the ledger record plus per-table results.
#[derive(Debug, Clone, Serialize)]
pub struct UninstallReport {
    pub record: MigrationRecord,
    /// Registered tables that no longer exist.
    pub dropped: Vec<String>,
    /// Tables that could not be dropped, with the error text.
    pub failures: Vec<(String, String)>,
}

impl UninstallReport {
    pub fn is_complete(&self) -> bool {
        self.record.succeeded() && self.failures.is_empty()
    }
}

/// Executes migration scripts and keeps the ledger and table registry.
#[derive(Clone)]
pub struct MigrationEngine {
    pool: SqlitePool,
    ledger: Ledger,
    prefix: String,
}

impl MigrationEngine {
    pub fn new(pool: SqlitePool, ledger: Ledger, table_prefix: &str) -> Self {
        Self {
            pool,
            ledger,
            prefix: table_prefix.to_string(),
        }
    }

    pub fn ledger(&self) -> &Ledger {
        &self.ledger
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Apply a script file for one lifecycle operation.
    ///
    /// Returns the finished ledger record; a failed script is reported
    /// through the record's status, not as an `Err`. Uninstall without a
    /// script drops every registered table instead.
    pub async fn apply(
        &self,
        plugin: &str,
        version: &str,
        operation: MigrationOperation,
        script: Option<&Path>,
    ) -> PluginResult<MigrationRecord> {
        if operation == MigrationOperation::Uninstall {
            return Ok(self.uninstall(plugin, version, script).await?.record);
        }

        match script {
            None => self.run(plugin, version, operation, None, "").await,
            Some(path) => self.run_file(plugin, version, operation, path).await,
        }
    }

    /// Apply an in-memory script. `source` is stored as the script path.
    pub async fn apply_statements(
        &self,
        plugin: &str,
        version: &str,
        operation: MigrationOperation,
        source: &str,
        content: &str,
    ) -> PluginResult<MigrationRecord> {
        self.run(plugin, version, operation, Some(source), content)
            .await
    }

    /// Uninstall a plugin's schema.
    ///
    /// With a script, the script runs and the plugin's registrations are
    /// cleared on success. Without one, each registered table is dropped
    /// individually and failures are collected instead of aborting.
    pub async fn uninstall(
        &self,
        plugin: &str,
        version: &str,
        script: Option<&Path>,
    ) -> PluginResult<UninstallReport> {
        let Some(path) = script else {
            return self.drop_owned_tables(plugin, version).await;
        };

        let owned = self.ledger.tables_for(plugin).await?;
        let record = self
            .run_file(plugin, version, MigrationOperation::Uninstall, path)
            .await?;

        let mut dropped = Vec::new();
        if record.succeeded() {
            for registration in owned {
                if !table_exists(&self.pool, &registration.table).await? {
                    dropped.push(registration.table);
                }
            }
        }

        Ok(UninstallReport {
            record,
            dropped,
            failures: Vec::new(),
        })
    }

    async fn run_file(
        &self,
        plugin: &str,
        version: &str,
        operation: MigrationOperation,
        path: &Path,
    ) -> PluginResult<MigrationRecord> {
        let source = path.display().to_string();

        match tokio::fs::read_to_string(path).await {
            Ok(content) => {
                self.run(plugin, version, operation, Some(&source), &content)
                    .await
            }
            Err(e) => {
                warn!(plugin, script = %source, error = %e, "migration script unreadable");
                let mut record = self
                    .ledger
                    .begin(plugin, version, operation, Some(&source), "")
                    .await?;
                self.ledger
                    .finish(
                        &mut record,
                        MigrationStatus::Failed,
                        Some(format!("cannot read script {source}: {e}")),
                    )
                    .await?;
                Ok(record)
            }
        }
    }

    async fn run(
        &self,
        plugin: &str,
        version: &str,
        operation: MigrationOperation,
        source: Option<&str>,
        content: &str,
    ) -> PluginResult<MigrationRecord> {
        let mut record = self
            .ledger
            .begin(plugin, version, operation, source, content)
            .await?;

        let statements = split_statements(&substitute_prefix(content, &self.prefix));

        info!(
            plugin,
            %operation,
            version,
            statements = statements.len(),
            "applying migration"
        );

        for (index, statement) in statements.iter().enumerate() {
            debug!(plugin, %operation, statement = index + 1, "executing statement");

            if let Err(e) = sqlx::raw_sql(statement).execute(&self.pool).await {
                let details = format!("statement {}: {e}", index + 1);
                warn!(plugin, %operation, error = %details, "migration failed");
                self.ledger
                    .finish(&mut record, MigrationStatus::Failed, Some(details))
                    .await?;
                return Ok(record);
            }

            if let Some(table) = created_table(statement) {
                self.ledger
                    .register_table(plugin, &table, version, statement)
                    .await?;
                debug!(plugin, table = %table, "registered table");
            }
        }

        if operation == MigrationOperation::Uninstall {
            self.ledger.remove_tables_for(plugin).await?;
        }

        self.ledger
            .finish(&mut record, MigrationStatus::Completed, None)
            .await?;
        info!(plugin, %operation, "migration complete");
        Ok(record)
    }

    async fn drop_owned_tables(&self, plugin: &str, version: &str) -> PluginResult<UninstallReport> {
        let owned = self.ledger.tables_for(plugin).await?;
        let plan: Vec<String> = owned
            .iter()
            .map(|t| format!("DROP TABLE IF EXISTS {};", quote_ident(&t.table)))
            .collect();

        let mut record = self
            .ledger
            .begin(
                plugin,
                version,
                MigrationOperation::Uninstall,
                None,
                &plan.join("\n"),
            )
            .await?;

        let mut dropped = Vec::new();
        let mut failures = Vec::new();

        for registration in owned {
            let sql = format!("DROP TABLE IF EXISTS {}", quote_ident(&registration.table));
            match sqlx::query(&sql).execute(&self.pool).await {
                Ok(_) => {
                    self.ledger.remove_table(plugin, &registration.table).await?;
                    debug!(plugin, table = %registration.table, "dropped table");
                    dropped.push(registration.table);
                }
                Err(e) => {
                    warn!(plugin, table = %registration.table, error = %e, "failed to drop table");
                    failures.push((registration.table, e.to_string()));
                }
            }
        }

        if failures.is_empty() {
            self.ledger
                .finish(&mut record, MigrationStatus::Completed, None)
                .await?;
        } else {
            let details = failures
                .iter()
                .map(|(table, error)| format!("{table}: {error}"))
                .collect::<Vec<_>>()
                .join("; ");
            self.ledger
                .finish(
                    &mut record,
                    MigrationStatus::Failed,
                    Some(format!("could not drop: {details}")),
                )
                .await?;
        }

        info!(
            plugin,
            dropped = dropped.len(),
            failed = failures.len(),
            "dropped registered tables"
        );

        Ok(UninstallReport {
            record,
            dropped,
            failures,
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use sqlx::sqlite::SqlitePoolOptions;

    async fn engine() -> MigrationEngine {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        let ledger = Ledger::new(pool.clone(), "t_");
        ledger.ensure_tables().await.unwrap();
        MigrationEngine::new(pool, ledger, "t_")
    }

    #[tokio::test]
    async fn registers_created_tables_with_prefix() {
        let engine = engine().await;
        let record = engine
            .apply_statements(
                "novel",
                "1.0.0",
                MigrationOperation::Install,
                "inline",
                "CREATE TABLE IF NOT EXISTS {prefix}chapters (id INTEGER PRIMARY KEY, body TEXT);\n\
                 INSERT INTO {prefix}chapters (body) VALUES ('Once; upon a time');",
            )
            .await
            .unwrap();

        assert!(record.succeeded());
        let tables = engine.ledger().tables_for("novel").await.unwrap();
        assert_eq!(tables.len(), 1);
        assert_eq!(tables[0].table, "t_chapters");
        assert_eq!(tables[0].version, "1.0.0");
        assert!(tables[0].create_statement.starts_with("CREATE TABLE IF NOT EXISTS t_chapters"));
    }

    #[tokio::test]
    async fn stops_at_first_failing_statement() {
        let engine = engine().await;
        let record = engine
            .apply_statements(
                "novel",
                "1.0.0",
                MigrationOperation::Install,
                "inline",
                "CREATE TABLE a (id INTEGER); INSERT INTO nope VALUES (1); CREATE TABLE b (id INTEGER);",
            )
            .await
            .unwrap();

        assert_eq!(record.status, MigrationStatus::Failed);
        let error = record.error.unwrap();
        assert!(error.starts_with("statement 2:"), "{error}");
        assert!(error.contains("nope"));
        assert!(table_exists(engine.pool(), "a").await.unwrap());
        assert!(!table_exists(engine.pool(), "b").await.unwrap());
    }

    #[tokio::test]
    async fn finished_records_are_sealed() {
        let engine = engine().await;
        let mut record = engine
            .apply_statements("novel", "1.0.0", MigrationOperation::Install, "inline", "")
            .await
            .unwrap();
        assert!(record.succeeded());

        let updated = engine
            .ledger()
            .finish(&mut record, MigrationStatus::Failed, Some("late".to_string()))
            .await
            .unwrap();
        assert!(!updated);
        assert!(record.succeeded());

        let stored = engine.ledger().records_for("novel").await.unwrap();
        assert_eq!(stored[0].status, MigrationStatus::Completed);
        assert!(stored[0].error.is_none());
    }

    #[tokio::test]
    async fn unreadable_script_is_recorded_as_failed() {
        let engine = engine().await;
        let record = engine
            .apply(
                "novel",
                "1.0.0",
                MigrationOperation::Install,
                Some(Path::new("/nonexistent/install.sql")),
            )
            .await
            .unwrap();

        assert_eq!(record.status, MigrationStatus::Failed);
        assert!(record.error.unwrap().contains("cannot read script"));
    }

    #[tokio::test]
    async fn uninstall_without_script_drops_registered_tables() {
        let engine = engine().await;
        engine
            .apply_statements(
                "music",
                "1.0.0",
                MigrationOperation::Install,
                "inline",
                "CREATE TABLE {prefix}tracks (id INTEGER); CREATE TABLE {prefix}albums (id INTEGER);",
            )
            .await
            .unwrap();

        let report = engine.uninstall("music", "1.0.0", None).await.unwrap();
        assert!(report.is_complete());
        assert_eq!(report.dropped, vec!["t_tracks", "t_albums"]);
        assert!(!table_exists(engine.pool(), "t_tracks").await.unwrap());
        assert!(engine.ledger().tables_for("music").await.unwrap().is_empty());
        assert_eq!(report.record.operation, MigrationOperation::Uninstall);
        assert!(report.record.script_content.contains("DROP TABLE IF EXISTS \"t_tracks\""));
    }
}
