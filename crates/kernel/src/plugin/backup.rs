//! Plugin data backup and restore.
//!
//! A backup captures every row of every table a plugin owns as typed cells,
//! writes it as a self-contained JSON file and stamps it with a SHA-256
//! checksum of the table payload. Restore replaces table contents inside a
//! single transaction.

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool, TypeInfo, ValueRef};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::error::{PluginError, PluginResult};
use super::ledger::Ledger;
use super::status::PluginRegistry;
use crate::db::{quote_ident, table_columns, table_exists};

/// One column value, tagged with its SQLite storage class.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "lowercase")]
pub enum Cell {
    Null,
    Integer(i64),
    Real(f64),
    Text(String),
    Blob(#[serde(with = "base64_bytes")] Vec<u8>),
}

mod base64_bytes {
    use base64::Engine;
    use base64::engine::general_purpose::STANDARD;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD.decode(encoded).map_err(serde::de::Error::custom)
    }
}

/// Contents of one table.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TableDump {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Cell>>,
}

/// A point-in-time copy of a plugin's data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackupSnapshot {
    pub id: Uuid,
    pub plugin: String,
    pub version: String,
    pub created_at: i64,
    /// Hex SHA-256 of the serialized `tables`.
    pub checksum: String,
    pub tables: BTreeMap<String, TableDump>,
}

impl BackupSnapshot {
    /// Build a snapshot and stamp its checksum.
    pub fn new(
        plugin: &str,
        version: &str,
        tables: BTreeMap<String, TableDump>,
    ) -> Result<Self, serde_json::Error> {
        let checksum = checksum(&tables)?;
        Ok(Self {
            id: Uuid::now_v7(),
            plugin: plugin.to_string(),
            version: version.to_string(),
            created_at: chrono::Utc::now().timestamp(),
            checksum,
            tables,
        })
    }

    /// Whether the stored checksum matches the table payload.
    pub fn verify(&self) -> bool {
        checksum(&self.tables).is_ok_and(|actual| actual == self.checksum)
    }

    pub fn row_count(&self) -> usize {
        self.tables.values().map(|t| t.rows.len()).sum()
    }
}

fn checksum(tables: &BTreeMap<String, TableDump>) -> Result<String, serde_json::Error> {
    let payload = serde_json::to_vec(tables)?;
    Ok(hex::encode(Sha256::digest(&payload)))
}

/// A snapshot together with the file it was written to.
#[derive(Debug, Clone, Serialize)]
pub struct BackupArtifact {
    pub path: PathBuf,
    pub snapshot: BackupSnapshot,
}

/// Writes and restores plugin backups under one directory.
#[derive(Clone)]
pub struct BackupManager {
    pool: SqlitePool,
    registry: PluginRegistry,
    ledger: Ledger,
    dir: PathBuf,
}

impl BackupManager {
    pub fn new(pool: SqlitePool, registry: PluginRegistry, ledger: Ledger, dir: PathBuf) -> Self {
        Self {
            pool,
            registry,
            ledger,
            dir,
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Snapshot every owned table that still exists and write it to disk.
    pub async fn backup(&self, key: &str) -> PluginResult<BackupArtifact> {
        let record = self
            .registry
            .get(key)
            .await?
            .ok_or_else(|| PluginError::NotRegistered {
                plugin: key.to_string(),
            })?;

        let mut tables = BTreeMap::new();
        for registration in self.ledger.tables_for(key).await? {
            if !table_exists(&self.pool, &registration.table).await? {
                warn!(plugin = key, table = %registration.table, "skipping missing table in backup");
                continue;
            }
            let dump = self.dump_table(&registration.table).await?;
            debug!(plugin = key, table = %registration.table, rows = dump.rows.len(), "captured table");
            tables.insert(registration.table, dump);
        }

        let snapshot = BackupSnapshot::new(key, &record.version, tables)
            .map_err(|e| backup_failed(key, e))?;
        let path = self.write(&snapshot).await?;

        info!(
            plugin = key,
            tables = snapshot.tables.len(),
            rows = snapshot.row_count(),
            path = %path.display(),
            "backup written"
        );

        Ok(BackupArtifact { path, snapshot })
    }

    async fn dump_table(&self, table: &str) -> PluginResult<TableDump> {
        let columns = table_columns(&self.pool, table).await?;
        if columns.is_empty() {
            return Ok(TableDump::default());
        }

        let select = format!(
            "SELECT {} FROM {}",
            columns
                .iter()
                .map(|c| quote_ident(c))
                .collect::<Vec<_>>()
                .join(", "),
            quote_ident(table)
        );

        let rows = sqlx::query(&select).fetch_all(&self.pool).await?;
        let rows = rows
            .iter()
            .map(|row| (0..columns.len()).map(|i| decode_cell(row, i)).collect())
            .collect::<Result<Vec<Vec<Cell>>, sqlx::Error>>()?;

        Ok(TableDump { columns, rows })
    }

    async fn write(&self, snapshot: &BackupSnapshot) -> PluginResult<PathBuf> {
        let dir = self.dir.join(&snapshot.plugin);
        let stamp = chrono::DateTime::from_timestamp(snapshot.created_at, 0)
            .unwrap_or_default()
            .format("%Y%m%dT%H%M%SZ");
        let path = dir.join(format!("{stamp}-{}.json", snapshot.id.simple()));

        let json =
            serde_json::to_vec_pretty(snapshot).map_err(|e| backup_failed(&snapshot.plugin, e))?;

        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| backup_failed(&snapshot.plugin, format!("{}: {e}", dir.display())))?;
        tokio::fs::write(&path, json)
            .await
            .map_err(|e| backup_failed(&snapshot.plugin, format!("{}: {e}", path.display())))?;

        Ok(path)
    }

    /// Read a backup file and verify its checksum.
    pub async fn load(&self, path: &Path) -> PluginResult<BackupSnapshot> {
        let label = path.display().to_string();

        let bytes = tokio::fs::read(path)
            .await
            .map_err(|e| restore_failed(&label, e))?;
        let snapshot: BackupSnapshot =
            serde_json::from_slice(&bytes).map_err(|e| restore_failed(&label, e))?;

        if !snapshot.verify() {
            return Err(restore_failed(
                &snapshot.plugin,
                format!("checksum mismatch in {label}"),
            ));
        }

        Ok(snapshot)
    }

    /// Backup files for one plugin, newest first.
    pub async fn list(&self, key: &str) -> PluginResult<Vec<PathBuf>> {
        let dir = self.dir.join(key);
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(_) => return Ok(Vec::new()),
        };

        let mut files = Vec::new();
        while let Ok(Some(entry)) = entries.next_entry().await {
            let path = entry.path();
            if path.extension().is_some_and(|ext| ext == "json") {
                files.push(path);
            }
        }

        // File names start with a UTC timestamp followed by a v7 UUID.
        files.sort();
        files.reverse();
        Ok(files)
    }

    /// Replace the contents of every table in the snapshot.
    ///
    /// Every table must be registered to the snapshot's plugin and exist.
    pub async fn restore(&self, snapshot: &BackupSnapshot) -> PluginResult<usize> {
        let plugin = snapshot.plugin.as_str();

        if !snapshot.verify() {
            return Err(restore_failed(plugin, "checksum mismatch"));
        }

        let owned: HashSet<String> = self
            .ledger
            .tables_for(plugin)
            .await?
            .into_iter()
            .map(|r| r.table)
            .collect();

        for (table, dump) in &snapshot.tables {
            if !owned.contains(table) {
                return Err(restore_failed(
                    plugin,
                    format!("table {table} is not registered to {plugin}"),
                ));
            }
            if !table_exists(&self.pool, table).await? {
                return Err(restore_failed(plugin, format!("table {table} does not exist")));
            }
            if let Some(row) = dump.rows.iter().find(|r| r.len() != dump.columns.len()) {
                return Err(restore_failed(
                    plugin,
                    format!(
                        "table {table}: row has {} cells for {} columns",
                        row.len(),
                        dump.columns.len()
                    ),
                ));
            }
        }

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| restore_failed(plugin, e))?;

        let mut restored = 0;
        for (table, dump) in &snapshot.tables {
            sqlx::query(&format!("DELETE FROM {}", quote_ident(table)))
                .execute(&mut *tx)
                .await
                .map_err(|e| restore_failed(plugin, format!("{table}: {e}")))?;

            if dump.rows.is_empty() {
                continue;
            }

            let insert = format!(
                "INSERT INTO {} ({}) VALUES ({})",
                quote_ident(table),
                dump.columns
                    .iter()
                    .map(|c| quote_ident(c))
                    .collect::<Vec<_>>()
                    .join(", "),
                vec!["?"; dump.columns.len()].join(", ")
            );

            for row in &dump.rows {
                let mut query = sqlx::query(&insert);
                for cell in row {
                    query = match cell {
                        Cell::Null => query.bind(None::<String>),
                        Cell::Integer(v) => query.bind(*v),
                        Cell::Real(v) => query.bind(*v),
                        Cell::Text(v) => query.bind(v.as_str()),
                        Cell::Blob(v) => query.bind(v.as_slice()),
                    };
                }
                query
                    .execute(&mut *tx)
                    .await
                    .map_err(|e| restore_failed(plugin, format!("{table}: {e}")))?;
                restored += 1;
            }
        }

        tx.commit().await.map_err(|e| restore_failed(plugin, e))?;

        info!(plugin, backup = %snapshot.id, rows = restored, "backup restored");
        Ok(restored)
    }
}

/// Read one column by storage class.
fn decode_cell(row: &SqliteRow, index: usize) -> Result<Cell, sqlx::Error> {
    let type_name = {
        let raw = row.try_get_raw(index)?;
        if raw.is_null() {
            return Ok(Cell::Null);
        }
        raw.type_info().name().to_string()
    };

    Ok(match type_name.as_str() {
        "INTEGER" | "BOOLEAN" => Cell::Integer(row.try_get_unchecked(index)?),
        "REAL" | "NUMERIC" => Cell::Real(row.try_get_unchecked(index)?),
        "BLOB" => Cell::Blob(row.try_get_unchecked(index)?),
        _ => Cell::Text(row.try_get_unchecked(index)?),
    })
}

fn backup_failed(plugin: &str, details: impl ToString) -> PluginError {
    PluginError::BackupWriteFailed {
        plugin: plugin.to_string(),
        details: details.to_string(),
    }
}

fn restore_failed(plugin: &str, details: impl ToString) -> PluginError {
    PluginError::RestoreFailed {
        plugin: plugin.to_string(),
        details: details.to_string(),
    }
}
