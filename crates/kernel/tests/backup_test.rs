//! Integration tests for plugin backup and restore.

#![allow(clippy::unwrap_used, clippy::expect_used)]

mod common;

use std::collections::BTreeMap;

use sqlx::Row;

use atelier_kernel::plugin::{BackupSnapshot, Cell, PluginError, TableDump};
use atelier_test_utils::PluginFixture;
use common::{TestEngine, core_media, engine, music_tracks};

async fn installed_music() -> TestEngine {
    let t = engine().await;
    t.add(&[core_media(), music_tracks()]);
    t.discover().await;
    t.manager.install_all().await.unwrap();
    t.execute(
        "INSERT INTO t_tracks (id, title, seconds, waveform) VALUES \
         (1, 'Overture; Act I', 183.25, X'00FF10'), \
         (2, 'It''s quiet', 0.1, NULL), \
         (3, NULL, NULL, X'7F');
         INSERT INTO t_albums (id, name) VALUES (1, 'Debut');",
    )
    .await;
    t
}

async fn track_rows(t: &TestEngine) -> Vec<(i64, Option<String>, Option<f64>, Option<Vec<u8>>)> {
    sqlx::query("SELECT id, title, seconds, waveform FROM t_tracks ORDER BY id")
        .fetch_all(&t.pool)
        .await
        .unwrap()
        .iter()
        .map(|r| (r.get("id"), r.get("title"), r.get("seconds"), r.get("waveform")))
        .collect()
}

/// Test that restore brings back every row exactly as captured.
#[tokio::test]
async fn restore_round_trips_rows() {
    let t = installed_music().await;
    let original = track_rows(&t).await;

    let artifact = t.manager.backup_plugin("music_tracks").await.unwrap();
    assert_eq!(artifact.snapshot.tables.len(), 2);
    assert_eq!(artifact.snapshot.row_count(), 4);
    assert!(artifact.path.starts_with(t.tree.backup_dir().join("music_tracks")));

    let dump = &artifact.snapshot.tables["t_tracks"];
    assert_eq!(dump.columns, vec!["id", "title", "seconds", "waveform"]);
    assert_eq!(dump.rows[0][3], Cell::Blob(vec![0x00, 0xFF, 0x10]));
    assert_eq!(dump.rows[1][3], Cell::Null);
    assert_eq!(dump.rows[2][1], Cell::Null);

    t.execute(
        "DELETE FROM t_tracks WHERE id = 1;
         UPDATE t_tracks SET title = 'changed' WHERE id = 2;
         INSERT INTO t_tracks (id, title) VALUES (99, 'intruder');
         DELETE FROM t_albums;",
    )
    .await;

    let snapshot = t.manager.restore_file(&artifact.path).await.unwrap();
    assert_eq!(snapshot.id, artifact.snapshot.id);

    assert_eq!(track_rows(&t).await, original);
    assert_eq!(t.count("t_albums").await, 1);
}

/// Test that editing a backup file is detected before anything is restored.
#[tokio::test]
async fn tampered_backup_is_rejected() {
    let t = installed_music().await;
    let artifact = t.manager.backup_plugin("music_tracks").await.unwrap();

    let content = std::fs::read_to_string(&artifact.path).unwrap();
    let tampered = content.replace("Debut", "Bootleg");
    assert_ne!(content, tampered);
    std::fs::write(&artifact.path, tampered).unwrap();

    t.execute("DELETE FROM t_albums;").await;

    let err = t.manager.restore_file(&artifact.path).await.unwrap_err();
    match err {
        PluginError::RestoreFailed { details, .. } => {
            assert!(details.contains("checksum mismatch"), "{details}");
        }
        other => panic!("expected RestoreFailed, got {other:?}"),
    }
    assert_eq!(t.count("t_albums").await, 0);
}

/// Test that a failure part-way through a restore rolls everything back.
#[tokio::test]
async fn failed_restore_rolls_back() {
    let t = engine().await;
    t.add(&[PluginFixture::new("ledgers").with_install_sql(
        "CREATE TABLE {prefix}a (id INTEGER PRIMARY KEY, v TEXT);\n\
         CREATE TABLE {prefix}b (id INTEGER PRIMARY KEY, v TEXT NOT NULL);\n\
         INSERT INTO {prefix}a VALUES (1, 'keep');",
    )]);
    t.discover().await;
    t.manager.install_plugin("ledgers").await.unwrap();

    let mut tables = BTreeMap::new();
    tables.insert(
        "t_a".to_string(),
        TableDump {
            columns: vec!["id".into(), "v".into()],
            rows: vec![vec![Cell::Integer(7), Cell::Text("replacement".into())]],
        },
    );
    tables.insert(
        "t_b".to_string(),
        TableDump {
            columns: vec!["id".into(), "v".into()],
            rows: vec![vec![Cell::Integer(1), Cell::Null]],
        },
    );
    let snapshot = BackupSnapshot::new("ledgers", "1.0.0", tables).unwrap();

    let err = t.manager.restore(&snapshot).await.unwrap_err();
    assert!(matches!(err, PluginError::RestoreFailed { .. }));
    assert!(err.to_string().contains("t_b"));

    let kept: String = sqlx::query("SELECT v FROM t_a WHERE id = 1")
        .fetch_one(&t.pool)
        .await
        .unwrap()
        .get("v");
    assert_eq!(kept, "keep");
    assert_eq!(t.count("t_a").await, 1);
}

/// Test that backups are listed newest first and missing tables are skipped.
#[tokio::test]
async fn backups_are_listed_newest_first() {
    let t = installed_music().await;

    let first = t.manager.backup_plugin("music_tracks").await.unwrap();
    t.execute("DROP TABLE t_albums;").await;
    let second = t.manager.backup_plugin("music_tracks").await.unwrap();

    assert_eq!(second.snapshot.tables.len(), 1);
    assert!(second.snapshot.tables.contains_key("t_tracks"));

    let listed = t.manager.backups("music_tracks").await.unwrap();
    assert_eq!(listed, vec![second.path, first.path]);
    assert!(t.manager.backups("core_media").await.unwrap().is_empty());
}

/// Test that backup-all covers every plugin that owns schema.
#[tokio::test]
async fn backup_all_covers_installed_plugins() {
    let t = installed_music().await;
    t.add(&[PluginFixture::new("unused")]);
    t.discover().await;

    let report = t.manager.backup_all().await.unwrap();
    assert!(report.is_clean());
    assert_eq!(report.succeeded, vec!["core_media", "music_tracks"]);

    let err = t.manager.backup_plugin("ghost").await.unwrap_err();
    assert!(matches!(err, PluginError::NotRegistered { .. }));
}

/// Test that restore refuses tables the snapshot's plugin does not own.
#[tokio::test]
async fn restore_refuses_foreign_tables() {
    let t = installed_music().await;
    t.add(&[PluginFixture::new("bare_theme").with_kind("theme")]);
    t.discover().await;
    t.manager.install_plugin("bare_theme").await.unwrap();
    let registry_rows = t.count("t_plugin_registry").await;
    assert!(registry_rows > 0);

    let mut tables = BTreeMap::new();
    tables.insert("t_plugin_registry".to_string(), TableDump::default());
    tables.insert(
        "t_albums".to_string(),
        TableDump {
            columns: vec!["id".into(), "name".into()],
            rows: vec![vec![Cell::Integer(2), Cell::Text("Forged".into())]],
        },
    );
    let snapshot = BackupSnapshot::new("bare_theme", "1.0.0", tables).unwrap();

    let err = t.manager.restore(&snapshot).await.unwrap_err();
    match err {
        PluginError::RestoreFailed { details, .. } => {
            assert!(details.contains("not registered to bare_theme"), "{details}");
        }
        other => panic!("expected RestoreFailed, got {other:?}"),
    }

    assert_eq!(t.count("t_plugin_registry").await, registry_rows);
    let name: String = sqlx::query("SELECT name FROM t_albums WHERE id = 1")
        .fetch_one(&t.pool)
        .await
        .unwrap()
        .get("name");
    assert_eq!(name, "Debut");
    assert_eq!(t.count("t_albums").await, 1);
}
