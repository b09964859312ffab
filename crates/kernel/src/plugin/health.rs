//! Health audit and repair.
//!
//! Compares what the registry and ledger believe against the physical
//! schema. Missing tables are issues; unfinished or failed migrations and
//! broken dependency closures are warnings.

use std::collections::HashMap;
use std::fmt;

use serde::Serialize;
use sqlx::SqlitePool;
use tracing::{debug, info, warn};

use super::dependency::DependencyGraph;
use super::error::{PluginError, PluginResult};
use super::ledger::{
    Ledger, MigrationOperation, MigrationRecord, MigrationStatus, TableRegistration,
};
use super::migration::MigrationEngine;
use super::status::{PluginRegistry, PluginStatus};
use crate::db::table_exists;

/// Overall verdict of an audit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthState {
    Healthy,
    Warning,
    Critical,
}

impl fmt::Display for HealthState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Healthy => "healthy",
            Self::Warning => "warning",
            Self::Critical => "critical",
        })
    }
}

/// A registered table that does not exist.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HealthIssue {
    pub plugin: String,
    pub table: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HealthWarning {
    pub plugin: String,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HealthReport {
    pub health: HealthState,
    pub issues: Vec<HealthIssue>,
    pub warnings: Vec<HealthWarning>,
    pub plugins_checked: usize,
    pub tables_checked: usize,
}

impl HealthReport {
    /// Plugins with at least one missing table, deduplicated, in report order.
    pub fn plugins_with_issues(&self) -> Vec<String> {
        let mut plugins: Vec<String> = Vec::new();
        for issue in &self.issues {
            if !plugins.contains(&issue.plugin) {
                plugins.push(issue.plugin.clone());
            }
        }
        plugins
    }

    pub fn is_healthy(&self) -> bool {
        self.health == HealthState::Healthy
    }
}

/// Result of a repair.
#[derive(Debug, Clone, Serialize)]
pub struct RepairOutcome {
    pub plugin: String,
    pub restored: Vec<String>,
    /// The last migration the repair ran.
    pub record: MigrationRecord,
}

#[derive(Clone)]
pub struct HealthService {
    pool: SqlitePool,
    registry: PluginRegistry,
    ledger: Ledger,
    engine: MigrationEngine,
}

impl HealthService {
    pub fn new(
        pool: SqlitePool,
        registry: PluginRegistry,
        ledger: Ledger,
        engine: MigrationEngine,
    ) -> Self {
        Self {
            pool,
            registry,
            ledger,
            engine,
        }
    }

    /// Audit every plugin that has been installed at least once and not removed.
    pub async fn audit(&self) -> PluginResult<HealthReport> {
        let plugins = self.registry.list().await?;
        let graph = DependencyGraph::from_records(&plugins);

        let mut tables: HashMap<String, Vec<String>> = HashMap::new();
        for registration in self.ledger.all_tables().await? {
            tables
                .entry(registration.plugin)
                .or_default()
                .push(registration.table);
        }

        let mut latest: HashMap<String, MigrationRecord> = HashMap::new();
        let mut warnings = Vec::new();
        for record in self.ledger.all_records().await? {
            if record.status == MigrationStatus::Running {
                warnings.push(HealthWarning {
                    plugin: record.plugin.clone(),
                    message: format!(
                        "{} attempt #{} for {} never finished",
                        record.operation, record.id, record.version
                    ),
                });
            }
            latest.insert(record.plugin.clone(), record);
        }

        let mut issues = Vec::new();
        let mut plugins_checked = 0;
        let mut tables_checked = 0;

        for plugin in &plugins {
            if matches!(plugin.status, PluginStatus::Discovered | PluginStatus::Removed) {
                continue;
            }
            plugins_checked += 1;

            for table in tables.get(&plugin.key).into_iter().flatten() {
                tables_checked += 1;
                if !table_exists(&self.pool, table).await? {
                    warn!(plugin = %plugin.key, table = %table, "registered table is missing");
                    issues.push(HealthIssue {
                        plugin: plugin.key.clone(),
                        table: table.clone(),
                    });
                }
            }

            if let Some(record) = latest.get(&plugin.key)
                && record.status == MigrationStatus::Failed
            {
                warnings.push(HealthWarning {
                    plugin: plugin.key.clone(),
                    message: format!(
                        "last {} attempt failed: {}",
                        record.operation,
                        record.error.as_deref().unwrap_or("unknown error")
                    ),
                });
            }

            if plugin.status == PluginStatus::Enabled {
                let check = graph.check(&plugin.key);
                if !check.satisfied {
                    warnings.push(HealthWarning {
                        plugin: plugin.key.clone(),
                        message: format!(
                            "enabled with unsatisfied dependencies: {}",
                            check.missing.join(", ")
                        ),
                    });
                }
            }
        }

        let health = if !issues.is_empty() {
            HealthState::Critical
        } else if !warnings.is_empty() {
            HealthState::Warning
        } else {
            HealthState::Healthy
        };

        info!(
            %health,
            plugins = plugins_checked,
            tables = tables_checked,
            issues = issues.len(),
            warnings = warnings.len(),
            "health audit finished"
        );

        Ok(HealthReport {
            health,
            issues,
            warnings,
            plugins_checked,
            tables_checked,
        })
    }

    /// Recreate a plugin's missing tables.
    ///
    /// Re-runs the install script as a repair when the plugin has one, then
    /// replays the stored creation statements of any table still missing.
    /// Fails if a registered table is missing afterwards. A `failed` plugin
    /// becomes `installed` on success.
    pub async fn repair(&self, key: &str) -> PluginResult<RepairOutcome> {
        let plugin = self
            .registry
            .get(key)
            .await?
            .ok_or_else(|| PluginError::NotRegistered {
                plugin: key.to_string(),
            })?;

        if !plugin.status.can_uninstall() {
            return Err(PluginError::invalid_transition(key, "repair", plugin.status));
        }

        let mut missing = Vec::new();
        for registration in self.ledger.tables_for(key).await? {
            if !table_exists(&self.pool, &registration.table).await? {
                missing.push(registration);
            }
        }

        if missing.is_empty() {
            return Err(PluginError::NothingToRepair {
                plugin: key.to_string(),
            });
        }

        info!(plugin = key, missing = missing.len(), "repairing plugin");

        let mut record = match plugin.scripts.install.as_deref() {
            Some(script) => {
                self.engine
                    .apply(key, &plugin.version, MigrationOperation::Repair, Some(script))
                    .await?
            }
            None => self.replay(key, &plugin.version, &missing).await?,
        };
        ensure_succeeded(key, &record)?;

        // Tables added by upgrade scripts are not in the install script.
        if plugin.scripts.install.is_some() {
            let mut leftover = Vec::new();
            for registration in &missing {
                if !table_exists(&self.pool, &registration.table).await? {
                    leftover.push(registration.clone());
                }
            }
            if !leftover.is_empty() {
                debug!(plugin = key, tables = leftover.len(), "replaying registered statements");
                record = self.replay(key, &plugin.version, &leftover).await?;
                ensure_succeeded(key, &record)?;
            }
        }

        let mut restored = Vec::new();
        let mut still_missing = Vec::new();
        for registration in missing {
            if table_exists(&self.pool, &registration.table).await? {
                restored.push(registration.table);
            } else {
                still_missing.push(registration.table);
            }
        }

        if !still_missing.is_empty() {
            warn!(plugin = key, tables = ?still_missing, "repair left tables missing");
            return Err(PluginError::ScriptExecutionFailed {
                plugin: key.to_string(),
                operation: MigrationOperation::Repair.to_string(),
                details: format!("tables still missing: {}", still_missing.join(", ")),
            });
        }

        if plugin.status == PluginStatus::Failed {
            self.registry.set_status(key, PluginStatus::Installed).await?;
        }

        info!(plugin = key, restored = restored.len(), "repair finished");

        Ok(RepairOutcome {
            plugin: key.to_string(),
            restored,
            record,
        })
    }

    async fn replay(
        &self,
        key: &str,
        version: &str,
        tables: &[TableRegistration],
    ) -> PluginResult<MigrationRecord> {
        let script = tables
            .iter()
            .map(|r| format!("{};", r.create_statement))
            .collect::<Vec<_>>()
            .join("\n");
        self.engine
            .apply_statements(
                key,
                version,
                MigrationOperation::Repair,
                "registered create statements",
                &script,
            )
            .await
    }

    /// Drop registrations whose table no longer exists. Returns the removed pairs.
    pub async fn cleanup_orphans(&self) -> PluginResult<Vec<(String, String)>> {
        let mut removed = Vec::new();

        for registration in self.ledger.all_tables().await? {
            if table_exists(&self.pool, &registration.table).await? {
                continue;
            }
            if self
                .ledger
                .remove_table(&registration.plugin, &registration.table)
                .await?
            {
                info!(plugin = %registration.plugin, table = %registration.table, "removed orphan registration");
                removed.push((registration.plugin, registration.table));
            }
        }

        Ok(removed)
    }
}

fn ensure_succeeded(key: &str, record: &MigrationRecord) -> PluginResult<()> {
    if record.succeeded() {
        return Ok(());
    }
    Err(PluginError::ScriptExecutionFailed {
        plugin: key.to_string(),
        operation: MigrationOperation::Repair.to_string(),
        details: record.error.clone().unwrap_or_default(),
    })
}
