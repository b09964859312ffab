#![allow(clippy::unwrap_used, clippy::expect_used)]
//! Common test utilities for integration tests.
//!
//! Every test builds its own engine over a fresh in-memory database and a
//! temporary plugins tree, so tests never share state.

#![allow(dead_code)]

use sqlx::{Row, SqlitePool};

use atelier_kernel::db;
use atelier_kernel::plugin::{DiscoveryReport, EngineOptions, PluginManager, PluginStatus};
use atelier_test_utils::{PluginFixture, PluginTree, memory_pool};

/// Table prefix used by every test engine.
pub const PREFIX: &str = "t_";

/// An engine wired to a private database and plugins directory.
pub struct TestEngine {
    pub tree: PluginTree,
    pub pool: SqlitePool,
    pub manager: PluginManager,
}

/// Build an engine that takes a backup before every upgrade.
pub async fn engine() -> TestEngine {
    engine_with(true).await
}

pub async fn engine_with(backup_before_upgrade: bool) -> TestEngine {
    let tree = PluginTree::new().expect("temp plugins tree");
    let pool = memory_pool().await.expect("in-memory database");
    let options = EngineOptions {
        table_prefix: PREFIX.to_string(),
        backup_dir: tree.backup_dir(),
        backup_before_upgrade,
    };
    let manager = PluginManager::new(pool.clone(), options)
        .await
        .expect("engine bootstrap");

    TestEngine {
        tree,
        pool,
        manager,
    }
}

impl TestEngine {
    /// Write fixtures into the plugins tree.
    pub fn add(&self, fixtures: &[PluginFixture]) {
        for fixture in fixtures {
            self.tree.add(fixture).expect("write fixture");
        }
    }

    /// Run discovery over the plugins tree.
    pub async fn discover(&self) -> DiscoveryReport {
        self.manager
            .discover_and_register(&self.tree.plugins_dir())
            .await
            .expect("discovery")
    }

    pub async fn status(&self, key: &str) -> PluginStatus {
        self.manager
            .registry()
            .get(key)
            .await
            .unwrap()
            .unwrap_or_else(|| panic!("{key} is registered"))
            .status
    }

    pub async fn version(&self, key: &str) -> String {
        self.manager.registry().get(key).await.unwrap().unwrap().version
    }

    pub async fn table_exists(&self, table: &str) -> bool {
        db::table_exists(&self.pool, table).await.unwrap()
    }

    pub async fn count(&self, table: &str) -> i64 {
        sqlx::query(&format!("SELECT COUNT(*) AS n FROM {}", db::quote_ident(table)))
            .fetch_one(&self.pool)
            .await
            .unwrap()
            .get("n")
    }

    pub async fn execute(&self, sql: &str) {
        sqlx::raw_sql(sql).execute(&self.pool).await.unwrap();
    }
}

/// Shared media library every content plugin builds on.
pub fn core_media() -> PluginFixture {
    PluginFixture::new("core_media")
        .with_kind("library")
        .with_install_sql(
            "CREATE TABLE IF NOT EXISTS {prefix}media_assets (\n\
             \x20   id INTEGER PRIMARY KEY,\n\
             \x20   path TEXT NOT NULL UNIQUE,\n\
             \x20   mime TEXT NOT NULL\n\
             );",
        )
}

/// Novel chapters: depends on core_media, ships all three scripts.
pub fn novel_chapters() -> PluginFixture {
    PluginFixture::new("novel_chapters")
        .with_kind("content")
        .with_category("novel")
        .depends_on(&["core_media"])
        .with_install_sql(
            "CREATE TABLE IF NOT EXISTS {prefix}chapters (\n\
             \x20   id INTEGER PRIMARY KEY,\n\
             \x20   title TEXT NOT NULL,\n\
             \x20   body TEXT NOT NULL DEFAULT ''\n\
             );\n\
             INSERT OR IGNORE INTO {prefix}chapters (id, title) VALUES (1, 'Prologue; or, the beginning');",
        )
        .with_uninstall_sql("DROP TABLE IF EXISTS {prefix}chapters;")
}

/// Music tracks: no uninstall script, so uninstall drops registered tables.
pub fn music_tracks() -> PluginFixture {
    PluginFixture::new("music_tracks")
        .with_kind("content")
        .with_category("music")
        .depends_on(&["core_media"])
        .with_install_sql(
            "CREATE TABLE IF NOT EXISTS {prefix}tracks (\n\
             \x20   id INTEGER PRIMARY KEY,\n\
             \x20   title TEXT,\n\
             \x20   seconds REAL,\n\
             \x20   waveform BLOB\n\
             );\n\
             CREATE TABLE IF NOT EXISTS {prefix}albums (id INTEGER PRIMARY KEY, name TEXT NOT NULL);",
        )
}
