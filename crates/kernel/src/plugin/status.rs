//! Plugin registry and lifecycle status.
//!
//! Manages the `{prefix}plugin_registry` table, the durable record of every
//! plugin the engine has seen: its metadata, its registered version, and
//! where it sits in the lifecycle. Rows are never deleted; uninstalling a
//! plugin moves it to [`PluginStatus::Removed`].

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use tracing::debug;

use super::error::PluginResult;
use super::info_parser::{PluginInfo, ScriptPaths};

/// Lifecycle status of a registered plugin.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PluginStatus {
    /// Manifest found, schema never applied.
    Discovered,
    /// Schema applied, not active.
    Installed,
    /// Installed and active.
    Enabled,
    /// Installed, switched off by an operator.
    Disabled,
    /// Last migration attempt did not complete.
    Failed,
    /// Uninstalled. History is kept.
    Removed,
}

impl PluginStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Discovered => "discovered",
            Self::Installed => "installed",
            Self::Enabled => "enabled",
            Self::Disabled => "disabled",
            Self::Failed => "failed",
            Self::Removed => "removed",
        }
    }

    /// Schema has been applied and the plugin has not been uninstalled.
    pub fn has_schema(&self) -> bool {
        matches!(self, Self::Installed | Self::Enabled | Self::Disabled)
    }

    /// Whether a dependent may rely on a plugin in this status.
    pub fn satisfies_dependency(&self) -> bool {
        matches!(self, Self::Installed | Self::Enabled)
    }

    pub fn can_install(&self) -> bool {
        matches!(self, Self::Discovered | Self::Failed | Self::Removed)
    }

    pub fn can_uninstall(&self) -> bool {
        self.has_schema() || *self == Self::Failed
    }
}

impl fmt::Display for PluginStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PluginStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "discovered" => Ok(Self::Discovered),
            "installed" => Ok(Self::Installed),
            "enabled" => Ok(Self::Enabled),
            "disabled" => Ok(Self::Disabled),
            "failed" => Ok(Self::Failed),
            "removed" => Ok(Self::Removed),
            other => Err(format!("unknown plugin status '{other}'")),
        }
    }
}

/// A row from the plugin registry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PluginRecord {
    pub key: String,
    pub name: String,
    pub version: String,
    pub kind: String,
    pub category: Option<String>,
    pub description: String,
    pub dependencies: Vec<String>,
    pub root_path: PathBuf,
    pub scripts: ScriptPaths,
    pub status: PluginStatus,
    pub created_at: i64,
    pub updated_at: i64,
}

impl PluginRecord {
    fn from_row(row: &SqliteRow) -> PluginResult<Self> {
        let dependencies: String = row.try_get("dependencies")?;
        let status: String = row.try_get("status")?;
        let path = |column: &str| -> PluginResult<Option<PathBuf>> {
            Ok(row.try_get::<Option<String>, _>(column)?.map(PathBuf::from))
        };

        Ok(Self {
            key: row.try_get("plugin_key")?,
            name: row.try_get("name")?,
            version: row.try_get("version")?,
            kind: row.try_get("kind")?,
            category: row.try_get("category")?,
            description: row.try_get("description")?,
            dependencies: serde_json::from_str(&dependencies)
                .map_err(|e| sqlx::Error::Decode(Box::new(e)))?,
            root_path: PathBuf::from(row.try_get::<String, _>("root_path")?),
            scripts: ScriptPaths {
                install: path("install_script")?,
                upgrade: path("upgrade_script")?,
                uninstall: path("uninstall_script")?,
            },
            status: status
                .parse()
                .map_err(|e: String| sqlx::Error::Decode(e.into()))?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

/// What [`PluginRegistry::upsert`] did with a manifest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum UpsertOutcome {
    Inserted,
    Updated,
    Unchanged,
}

/// Durable store of record for plugins. Holds no business rules.
#[derive(Clone)]
pub struct PluginRegistry {
    pool: SqlitePool,
    table: String,
}

const COLUMNS: &str = "plugin_key, name, version, kind, category, description, dependencies, \
                       root_path, install_script, upgrade_script, uninstall_script, status, \
                       created_at, updated_at";

impl PluginRegistry {
    pub fn new(pool: SqlitePool, table_prefix: &str) -> Self {
        Self {
            pool,
            table: format!("{table_prefix}plugin_registry"),
        }
    }

    /// Physical name of the registry table.
    pub fn table(&self) -> &str {
        &self.table
    }

    /// Create the registry table if it does not exist.
    pub async fn ensure_table(&self) -> PluginResult<()> {
        sqlx::query(&format!(
            "CREATE TABLE IF NOT EXISTS {} (
                plugin_key TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                version TEXT NOT NULL,
                kind TEXT NOT NULL,
                category TEXT,
                description TEXT NOT NULL DEFAULT '',
                dependencies TEXT NOT NULL DEFAULT '[]',
                root_path TEXT NOT NULL,
                install_script TEXT,
                upgrade_script TEXT,
                uninstall_script TEXT,
                status TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            )",
            self.table
        ))
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Insert or refresh a plugin from its manifest.
    ///
    /// Re-registering an installed plugin at the same version is a no-op.
    /// For installed plugins the stored version is left alone even when the
    /// manifest moved ahead; bumping it is the upgrade path's job.
    pub async fn upsert(&self, info: &PluginInfo, root: &Path) -> PluginResult<UpsertOutcome> {
        let mut tx = self.pool.begin().await?;
        let now = chrono::Utc::now().timestamp();

        let existing = sqlx::query(&format!(
            "SELECT {COLUMNS} FROM {} WHERE plugin_key = ?",
            self.table
        ))
        .bind(&info.name)
        .fetch_optional(&mut *tx)
        .await?
        .map(|row| PluginRecord::from_row(&row))
        .transpose()?;

        let scripts = info.scripts.resolve(root);
        let dependencies = serde_json::to_string(&info.dependencies)
            .map_err(|e| sqlx::Error::Encode(Box::new(e)))?;

        let outcome = match existing {
            None => {
                sqlx::query(&format!(
                    "INSERT INTO {} ({COLUMNS}) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
                    self.table
                ))
                .bind(&info.name)
                .bind(&info.display_name)
                .bind(&info.version)
                .bind(&info.kind)
                .bind(&info.category)
                .bind(&info.description)
                .bind(&dependencies)
                .bind(root.display().to_string())
                .bind(path_str(&scripts.install))
                .bind(path_str(&scripts.upgrade))
                .bind(path_str(&scripts.uninstall))
                .bind(PluginStatus::Discovered.as_str())
                .bind(now)
                .bind(now)
                .execute(&mut *tx)
                .await?;
                UpsertOutcome::Inserted
            }
            Some(current) => {
                let status = match current.status {
                    PluginStatus::Removed => PluginStatus::Discovered,
                    other => other,
                };
                let version = if current.status.has_schema() {
                    current.version.clone()
                } else {
                    info.version.clone()
                };

                let unchanged = current.status == status
                    && current.version == version
                    && current.name == info.display_name
                    && current.kind == info.kind
                    && current.category == info.category
                    && current.description == info.description
                    && current.dependencies == info.dependencies
                    && current.root_path == root
                    && current.scripts == scripts;

                if unchanged {
                    UpsertOutcome::Unchanged
                } else {
                    sqlx::query(&format!(
                        "UPDATE {} SET name = ?, version = ?, kind = ?, category = ?, \
                         description = ?, dependencies = ?, root_path = ?, install_script = ?, \
                         upgrade_script = ?, uninstall_script = ?, status = ?, updated_at = ? \
                         WHERE plugin_key = ?",
                        self.table
                    ))
                    .bind(&info.display_name)
                    .bind(&version)
                    .bind(&info.kind)
                    .bind(&info.category)
                    .bind(&info.description)
                    .bind(&dependencies)
                    .bind(root.display().to_string())
                    .bind(path_str(&scripts.install))
                    .bind(path_str(&scripts.upgrade))
                    .bind(path_str(&scripts.uninstall))
                    .bind(status.as_str())
                    .bind(now)
                    .bind(&info.name)
                    .execute(&mut *tx)
                    .await?;
                    UpsertOutcome::Updated
                }
            }
        };

        tx.commit().await?;
        debug!(plugin = %info.name, outcome = ?outcome, "registry upsert");
        Ok(outcome)
    }

    /// Get a plugin by key.
    pub async fn get(&self, key: &str) -> PluginResult<Option<PluginRecord>> {
        let row = sqlx::query(&format!(
            "SELECT {COLUMNS} FROM {} WHERE plugin_key = ?",
            self.table
        ))
        .bind(key)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|r| PluginRecord::from_row(&r)).transpose()
    }

    /// All plugins, ordered by key.
    pub async fn list(&self) -> PluginResult<Vec<PluginRecord>> {
        let rows = sqlx::query(&format!(
            "SELECT {COLUMNS} FROM {} ORDER BY plugin_key",
            self.table
        ))
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(PluginRecord::from_row).collect()
    }

    /// Set a plugin's status. Returns false if the key is unknown.
    pub async fn set_status(&self, key: &str, status: PluginStatus) -> PluginResult<bool> {
        let now = chrono::Utc::now().timestamp();

        let result = sqlx::query(&format!(
            "UPDATE {} SET status = ?, updated_at = ? WHERE plugin_key = ?",
            self.table
        ))
        .bind(status.as_str())
        .bind(now)
        .bind(key)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Set a plugin's registered version. Returns false if the key is unknown.
    pub async fn set_version(&self, key: &str, version: &str) -> PluginResult<bool> {
        let now = chrono::Utc::now().timestamp();

        let result = sqlx::query(&format!(
            "UPDATE {} SET version = ?, updated_at = ? WHERE plugin_key = ?",
            self.table
        ))
        .bind(version)
        .bind(now)
        .bind(key)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }
}

fn path_str(path: &Option<PathBuf>) -> Option<String> {
    path.as_ref().map(|p| p.display().to_string())
}
