//! Integration tests for discovery, dependency resolution and the
//! install/enable/disable/uninstall lifecycle.

#![allow(clippy::unwrap_used, clippy::expect_used)]

mod common;

use atelier_kernel::plugin::{
    MigrationOperation, MigrationStatus, PluginError, PluginStatus, UpsertOutcome,
};
use atelier_test_utils::PluginFixture;
use common::{core_media, engine, music_tracks, novel_chapters};

/// Test that running discovery twice over an unchanged tree changes nothing.
#[tokio::test]
async fn discovery_is_idempotent() {
    let t = engine().await;
    t.add(&[core_media(), novel_chapters()]);

    let first = t.discover().await;
    assert_eq!(
        first.registered,
        vec![
            ("core_media".to_string(), UpsertOutcome::Inserted),
            ("novel_chapters".to_string(), UpsertOutcome::Inserted),
        ]
    );

    let before = t.manager.list_plugins().await.unwrap();
    let second = t.discover().await;
    assert!(second.changed().is_empty());
    assert!(
        second
            .registered
            .iter()
            .all(|(_, outcome)| *outcome == UpsertOutcome::Unchanged)
    );
    assert_eq!(t.manager.list_plugins().await.unwrap(), before);
}

/// Test that bad manifests are reported without blocking the rest.
#[tokio::test]
async fn discovery_reports_bad_manifests_and_continues() {
    let t = engine().await;
    t.add(&[core_media()]);
    t.tree
        .add_raw("broken", "broken.info.toml", "name = \"broken\"\nversion = [")
        .unwrap();
    t.tree
        .add_raw("nameless", "nameless.info.toml", "version = \"1.0.0\"\n")
        .unwrap();
    t.add(&[PluginFixture::new("odd_kind").with_kind("widget")]);
    t.add(&[PluginFixture::new("uncategorised").with_kind("content")]);

    let report = t.discover().await;

    assert_eq!(report.registered.len(), 1);
    assert_eq!(report.registered[0].0, "core_media");
    assert_eq!(report.errors.len(), 4);

    let reasons: Vec<&str> = report.errors.iter().map(|e| e.reason.as_str()).collect();
    assert!(reasons.iter().any(|r| r.contains("missing required field 'name'")));
    assert!(reasons.iter().any(|r| r.contains("unknown kind 'widget'")));
    assert!(reasons.iter().any(|r| r.contains("category")));
}

/// Test that a removed plugin returns to `discovered` on the next scan.
#[tokio::test]
async fn rediscovering_removed_plugin_resets_status() {
    let t = engine().await;
    t.add(&[PluginFixture::new("standalone")]);
    t.discover().await;

    t.manager.install_plugin("standalone").await.unwrap();
    t.manager.uninstall_plugin("standalone").await.unwrap();
    assert_eq!(t.status("standalone").await, PluginStatus::Removed);

    let report = t.discover().await;
    assert_eq!(report.registered[0].1, UpsertOutcome::Updated);
    assert_eq!(t.status("standalone").await, PluginStatus::Discovered);
}

/// Test cycle detection: A->B->C->A is a cycle, A->B->C is not.
#[tokio::test]
async fn detects_cycles() {
    let t = engine().await;
    t.add(&[
        PluginFixture::new("a").depends_on(&["b"]),
        PluginFixture::new("b").depends_on(&["c"]),
        PluginFixture::new("c").depends_on(&["a"]),
        PluginFixture::new("x").depends_on(&["y"]),
        PluginFixture::new("y").depends_on(&["z"]),
        PluginFixture::new("z"),
    ]);
    t.discover().await;

    let resolver = t.manager.resolver();
    assert!(resolver.detect_cycle("a").await.unwrap());
    assert!(!resolver.detect_cycle("x").await.unwrap());

    let err = t.manager.install_plugin("a").await.unwrap_err();
    match err {
        PluginError::CircularDependency { cycle } => {
            assert_eq!(cycle, "a -> b -> c -> a");
        }
        other => panic!("expected CircularDependency, got {other:?}"),
    }
    assert_eq!(t.status("a").await, PluginStatus::Discovered);
}

/// Test that resolution puts dependencies first and is stable across calls.
#[tokio::test]
async fn resolution_order_is_stable() {
    let t = engine().await;
    t.add(&[
        PluginFixture::new("base"),
        PluginFixture::new("left").depends_on(&["base"]),
        PluginFixture::new("right").depends_on(&["base"]),
        PluginFixture::new("top").depends_on(&["right", "left"]),
    ]);
    t.discover().await;

    let resolver = t.manager.resolver();
    let order = resolver.resolve("top").await.unwrap();
    assert_eq!(order, vec!["base", "right", "left", "top"]);
    assert_eq!(resolver.resolve("top").await.unwrap(), order);
    assert_eq!(resolver.cached(), 1);

    resolver.invalidate();
    assert_eq!(resolver.cached(), 0);
    assert_eq!(resolver.resolve("top").await.unwrap(), order);
}

/// Test that an unregistered dependency is named explicitly.
#[tokio::test]
async fn missing_dependency_is_explicit() {
    let t = engine().await;
    t.add(&[PluginFixture::new("orphan").depends_on(&["ghost"])]);
    t.discover().await;

    let err = t.manager.install_plugin("orphan").await.unwrap_err();
    match err {
        PluginError::MissingDependency { plugin, dependency } => {
            assert_eq!(plugin, "orphan");
            assert_eq!(dependency, "ghost");
        }
        other => panic!("expected MissingDependency, got {other:?}"),
    }

    let check = t.manager.check_dependencies("orphan").await.unwrap();
    assert!(!check.satisfied);
    assert_eq!(check.missing, vec!["ghost"]);
}

/// Test that install refuses while a dependency is only discovered.
#[tokio::test]
async fn install_requires_installed_dependencies() {
    let t = engine().await;
    t.add(&[core_media(), novel_chapters()]);
    t.discover().await;

    let err = t.manager.install_plugin("novel_chapters").await.unwrap_err();
    assert!(
        matches!(
            &err,
            PluginError::DependencyNotSatisfied { dependency, status, .. }
                if dependency == "core_media" && status == "discovered"
        ),
        "unexpected error: {err}"
    );
    assert!(err.to_string().contains("atelier install core_media"));
    assert!(!t.table_exists("t_chapters").await);
}

/// Test install-all: dependencies first, library kinds end up enabled.
#[tokio::test]
async fn install_all_follows_dependency_order() {
    let t = engine().await;
    t.add(&[novel_chapters(), music_tracks(), core_media()]);
    t.discover().await;

    let report = t.manager.install_all().await.unwrap();
    assert!(report.is_clean(), "{:?}", report.failures);
    assert_eq!(
        report.succeeded,
        vec!["core_media", "music_tracks", "novel_chapters"]
    );

    assert_eq!(t.status("core_media").await, PluginStatus::Enabled);
    assert_eq!(t.status("novel_chapters").await, PluginStatus::Installed);
    assert_eq!(t.status("music_tracks").await, PluginStatus::Installed);

    assert!(t.table_exists("t_media_assets").await);
    assert!(t.table_exists("t_chapters").await);
    assert_eq!(t.count("t_chapters").await, 1);

    let tables = t.manager.ledger().tables_for("music_tracks").await.unwrap();
    let names: Vec<&str> = tables.iter().map(|r| r.table.as_str()).collect();
    assert_eq!(names, vec!["t_tracks", "t_albums"]);
    assert!(tables[0].create_statement.contains("waveform BLOB"));
}

/// Test that a failing install script leaves the plugin `failed` with the error recorded.
#[tokio::test]
async fn failed_install_is_recorded() {
    let t = engine().await;
    t.add(&[PluginFixture::new("broken").with_install_sql(
        "CREATE TABLE {prefix}ok (id INTEGER);\nINSERT INTO {prefix}missing VALUES (1);",
    )]);
    t.discover().await;

    let err = t.manager.install_plugin("broken").await.unwrap_err();
    assert!(matches!(err, PluginError::ScriptExecutionFailed { .. }));
    assert_eq!(t.status("broken").await, PluginStatus::Failed);

    let history = t.manager.history("broken").await.unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].operation, MigrationOperation::Install);
    assert_eq!(history[0].status, MigrationStatus::Failed);
    let error = history[0].error.as_deref().unwrap();
    assert!(error.starts_with("statement 2:"), "{error}");
    assert!(error.contains("t_missing"));

    // The first statement ran; DDL is not rolled back.
    assert!(t.table_exists("t_ok").await);
}

/// Test that uninstall is refused while an installed plugin depends on the target.
#[tokio::test]
async fn uninstall_refused_while_dependents_installed() {
    let t = engine().await;
    t.add(&[core_media(), novel_chapters()]);
    t.discover().await;
    t.manager.install_all().await.unwrap();

    let err = t.manager.uninstall_plugin("core_media").await.unwrap_err();
    match err {
        PluginError::HasDependents {
            plugin, dependents, ..
        } => {
            assert_eq!(plugin, "core_media");
            assert_eq!(dependents, "novel_chapters");
        }
        other => panic!("expected HasDependents, got {other:?}"),
    }
    assert_eq!(t.status("core_media").await, PluginStatus::Enabled);

    t.manager.uninstall_plugin("novel_chapters").await.unwrap();
    assert!(!t.table_exists("t_chapters").await);
    assert!(
        t.manager
            .ledger()
            .tables_for("novel_chapters")
            .await
            .unwrap()
            .is_empty()
    );

    t.manager.uninstall_plugin("core_media").await.unwrap();
    assert_eq!(t.status("core_media").await, PluginStatus::Removed);
}

/// Test that uninstall without a script drops each registered table.
#[tokio::test]
async fn uninstall_without_script_drops_registered_tables() {
    let t = engine().await;
    t.add(&[core_media(), music_tracks()]);
    t.discover().await;
    t.manager.install_all().await.unwrap();

    let report = t.manager.uninstall_plugin("music_tracks").await.unwrap();
    assert_eq!(report.dropped, vec!["t_tracks", "t_albums"]);
    assert!(report.failures.is_empty());
    assert!(!t.table_exists("t_tracks").await);
    assert!(!t.table_exists("t_albums").await);
    assert_eq!(t.status("music_tracks").await, PluginStatus::Removed);

    // History survives removal.
    let history = t.manager.history("music_tracks").await.unwrap();
    let ops: Vec<MigrationOperation> = history.iter().map(|r| r.operation).collect();
    assert_eq!(
        ops,
        vec![MigrationOperation::Install, MigrationOperation::Uninstall]
    );
}

/// Test enable/disable transitions and the enabled-dependents guard.
#[tokio::test]
async fn enable_and_disable_respect_dependents() {
    let t = engine().await;
    t.add(&[core_media(), novel_chapters()]);
    t.discover().await;
    t.manager.install_all().await.unwrap();

    let err = t.manager.disable_plugin("novel_chapters").await.unwrap_err();
    assert!(matches!(err, PluginError::InvalidTransition { .. }));

    t.manager.enable_plugin("novel_chapters").await.unwrap();
    assert_eq!(t.status("novel_chapters").await, PluginStatus::Enabled);

    let err = t.manager.disable_plugin("core_media").await.unwrap_err();
    assert!(matches!(err, PluginError::HasDependents { .. }));

    t.manager.disable_plugin("novel_chapters").await.unwrap();
    t.manager.disable_plugin("core_media").await.unwrap();
    assert_eq!(t.status("core_media").await, PluginStatus::Disabled);

    // A disabled dependency no longer satisfies an enable.
    let err = t.manager.enable_plugin("novel_chapters").await.unwrap_err();
    assert!(matches!(
        err,
        PluginError::DependencyNotSatisfied { ref status, .. } if status == "disabled"
    ));
}

/// Test that lifecycle actions check the current status.
#[tokio::test]
async fn invalid_transitions_are_refused() {
    let t = engine().await;
    t.add(&[PluginFixture::new("solo")]);
    t.discover().await;

    assert!(matches!(
        t.manager.enable_plugin("solo").await.unwrap_err(),
        PluginError::InvalidTransition { .. }
    ));
    assert!(matches!(
        t.manager.uninstall_plugin("solo").await.unwrap_err(),
        PluginError::InvalidTransition { .. }
    ));

    t.manager.install_plugin("solo").await.unwrap();
    let err = t.manager.install_plugin("solo").await.unwrap_err();
    assert_eq!(err.to_string(), "cannot install plugin 'solo' while it is installed");

    assert!(matches!(
        t.manager.install_plugin("nobody").await.unwrap_err(),
        PluginError::NotRegistered { .. }
    ));
}

/// Test that themes install without scripts.
#[tokio::test]
async fn theme_installs_without_schema() {
    let t = engine().await;
    t.add(&[PluginFixture::new("studio_theme").with_kind("theme")]);
    t.discover().await;

    let outcome = t.manager.install_plugin("studio_theme").await.unwrap();
    assert_eq!(outcome.status, PluginStatus::Installed);
    let record = outcome.record.unwrap();
    assert!(record.succeeded());
    assert!(record.script_path.is_none());
    assert!(
        t.manager
            .ledger()
            .tables_for("studio_theme")
            .await
            .unwrap()
            .is_empty()
    );
}
