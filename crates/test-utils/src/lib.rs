//! Atelier test utilities.
//!
//! Helpers for integration testing: in-memory databases and a builder that
//! writes plugin manifests and SQL scripts into a temporary plugins tree.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde::Serialize;
use sqlx::SqlitePool;
use sqlx::sqlite::SqlitePoolOptions;
use tempfile::TempDir;

/// Create a fresh in-memory SQLite database.
///
/// The pool holds exactly one connection that is never recycled, since
/// each SQLite in-memory connection is its own database.
pub async fn memory_pool() -> Result<SqlitePool, sqlx::Error> {
    SqlitePoolOptions::new()
        .max_connections(1)
        .idle_timeout(None)
        .max_lifetime(None)
        .connect("sqlite::memory:")
        .await
}

/// A plugin manifest plus scripts, written to disk on demand.
#[derive(Debug, Clone)]
pub struct PluginFixture {
    pub name: String,
    pub version: String,
    pub display_name: Option<String>,
    pub description: String,
    pub kind: Option<String>,
    pub category: Option<String>,
    pub dependencies: Vec<String>,
    pub install_sql: Option<String>,
    pub upgrade_sql: Option<String>,
    pub uninstall_sql: Option<String>,
}

#[derive(Serialize)]
struct ManifestFile<'a> {
    name: &'a str,
    version: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    display_name: Option<&'a str>,
    description: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    kind: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    category: Option<&'a str>,
    dependencies: &'a [String],
    scripts: ScriptsTable,
}

#[derive(Serialize)]
struct ScriptsTable {
    #[serde(skip_serializing_if = "Option::is_none")]
    install: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    upgrade: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    uninstall: Option<&'static str>,
}

const INSTALL_PATH: &str = "sql/install.sql";
const UPGRADE_PATH: &str = "sql/upgrade.sql";
const UNINSTALL_PATH: &str = "sql/uninstall.sql";

impl PluginFixture {
    /// A module plugin at version 1.0.0 with no scripts.
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            version: "1.0.0".to_string(),
            display_name: None,
            description: format!("Test plugin {name}"),
            kind: None,
            category: None,
            dependencies: Vec::new(),
            install_sql: None,
            upgrade_sql: None,
            uninstall_sql: None,
        }
    }

    pub fn with_version(mut self, version: &str) -> Self {
        self.version = version.to_string();
        self
    }

    pub fn with_kind(mut self, kind: &str) -> Self {
        self.kind = Some(kind.to_string());
        self
    }

    pub fn with_category(mut self, category: &str) -> Self {
        self.category = Some(category.to_string());
        self
    }

    pub fn with_description(mut self, description: &str) -> Self {
        self.description = description.to_string();
        self
    }

    /// Declare dependencies, in order.
    pub fn depends_on(mut self, dependencies: &[&str]) -> Self {
        self.dependencies = dependencies.iter().map(|d| d.to_string()).collect();
        self
    }

    pub fn with_install_sql(mut self, sql: &str) -> Self {
        self.install_sql = Some(sql.to_string());
        self
    }

    pub fn with_upgrade_sql(mut self, sql: &str) -> Self {
        self.upgrade_sql = Some(sql.to_string());
        self
    }

    pub fn with_uninstall_sql(mut self, sql: &str) -> Self {
        self.uninstall_sql = Some(sql.to_string());
        self
    }

    /// Render the `.info.toml` manifest.
    pub fn manifest(&self) -> Result<String, toml::ser::Error> {
        let manifest = ManifestFile {
            name: &self.name,
            version: &self.version,
            display_name: self.display_name.as_deref(),
            description: &self.description,
            kind: self.kind.as_deref(),
            category: self.category.as_deref(),
            dependencies: &self.dependencies,
            scripts: ScriptsTable {
                install: self.install_sql.as_ref().map(|_| INSTALL_PATH),
                upgrade: self.upgrade_sql.as_ref().map(|_| UPGRADE_PATH),
                uninstall: self.uninstall_sql.as_ref().map(|_| UNINSTALL_PATH),
            },
        };
        toml::to_string(&manifest)
    }

    /// Write the plugin directory under `root`, replacing any earlier copy
    /// of the manifest and scripts. Returns the plugin directory.
    pub fn write(&self, root: &Path) -> io::Result<PathBuf> {
        let dir = root.join(&self.name);
        fs::create_dir_all(dir.join("sql"))?;

        let manifest = self
            .manifest()
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        fs::write(dir.join(format!("{}.info.toml", self.name)), manifest)?;

        for (sql, path) in [
            (&self.install_sql, INSTALL_PATH),
            (&self.upgrade_sql, UPGRADE_PATH),
            (&self.uninstall_sql, UNINSTALL_PATH),
        ] {
            if let Some(sql) = sql {
                fs::write(dir.join(path), sql)?;
            }
        }

        Ok(dir)
    }
}

/// A temporary plugins root plus a backup directory, removed on drop.
pub struct PluginTree {
    dir: TempDir,
}

impl PluginTree {
    pub fn new() -> io::Result<Self> {
        Ok(Self {
            dir: TempDir::new()?,
        })
    }

    /// Directory holding plugin subdirectories.
    pub fn plugins_dir(&self) -> PathBuf {
        self.dir.path().join("plugins")
    }

    /// Directory for backup files.
    pub fn backup_dir(&self) -> PathBuf {
        self.dir.path().join("backups")
    }

    /// Write a fixture into the plugins directory.
    pub fn add(&self, fixture: &PluginFixture) -> io::Result<PathBuf> {
        fixture.write(&self.plugins_dir())
    }

    /// Write a raw manifest file into its own plugin directory.
    pub fn add_raw(&self, dir_name: &str, file_name: &str, content: &str) -> io::Result<PathBuf> {
        let dir = self.plugins_dir().join(dir_name);
        fs::create_dir_all(&dir)?;
        fs::write(dir.join(file_name), content)?;
        Ok(dir)
    }
}
