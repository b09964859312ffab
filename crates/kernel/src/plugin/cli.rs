//! CLI command implementations for plugin management.
//!
//! Each command drives one [`PluginManager`] operation and prints a plain
//! table or summary. Single-plugin actions can print an [`OperationResult`]
//! as JSON instead, for scripts and admin tooling. Failures surface as
//! `anyhow` errors so the binary exits non-zero.

use std::path::Path;

use anyhow::{Context, Result, bail};

use super::health::{HealthReport, HealthState};
use super::manager::PluginManager;
use super::outcome::{BatchReport, OperationResult};

/// List every registered plugin and its status.
pub async fn cmd_list(manager: &PluginManager) -> Result<()> {
    let plugins = manager.list_plugins().await?;

    if plugins.is_empty() {
        println!("No plugins registered. Run `atelier discover` first.");
        return Ok(());
    }

    println!(
        "{:<22} {:<10} {:<11} {:<9} {:<10} {}",
        "PLUGIN", "VERSION", "STATUS", "KIND", "CATEGORY", "DEPENDENCIES"
    );
    println!("{}", "-".repeat(80));

    for plugin in &plugins {
        println!(
            "{:<22} {:<10} {:<11} {:<9} {:<10} {}",
            plugin.key,
            plugin.version,
            plugin.status,
            plugin.kind,
            plugin.category.as_deref().unwrap_or("-"),
            if plugin.dependencies.is_empty() {
                "-".to_string()
            } else {
                plugin.dependencies.join(", ")
            }
        );
    }

    Ok(())
}

/// Scan the plugins directory and register what it finds.
pub async fn cmd_discover(manager: &PluginManager, plugins_dir: &Path) -> Result<()> {
    let report = manager.discover_and_register(plugins_dir).await?;

    for (key, outcome) in &report.registered {
        println!("  {key:<22} {outcome:?}");
    }
    for error in &report.errors {
        println!("  skipped {}: {}", error.path.display(), error.reason);
    }

    println!(
        "Discovered {} plugin(s), {} changed, {} skipped.",
        report.registered.len(),
        report.changed().len(),
        report.errors.len()
    );
    Ok(())
}

pub async fn cmd_install(manager: &PluginManager, key: &str, json: bool) -> Result<()> {
    let result = manager.install_plugin(key).await;
    emit(
        &OperationResult::from_result(&result, |outcome| {
            format!("Plugin '{key}' installed ({}).", outcome.status)
        }),
        json,
    )
}

pub async fn cmd_install_all(manager: &PluginManager) -> Result<()> {
    let report = manager.install_all().await?;
    print_batch(&report, "installed")
}

pub async fn cmd_uninstall(manager: &PluginManager, key: &str, json: bool) -> Result<()> {
    let result = manager.uninstall_plugin(key).await;
    emit(
        &OperationResult::from_result(&result, |report| {
            if report.dropped.is_empty() {
                format!("Plugin '{key}' removed.")
            } else {
                format!("Plugin '{key}' removed, dropped {}.", report.dropped.join(", "))
            }
        }),
        json,
    )
}

pub async fn cmd_enable(manager: &PluginManager, key: &str, json: bool) -> Result<()> {
    let result = manager.enable_plugin(key).await;
    emit(
        &OperationResult::from_result(&result, |_| format!("Plugin '{key}' enabled.")),
        json,
    )
}

pub async fn cmd_disable(manager: &PluginManager, key: &str, json: bool) -> Result<()> {
    let result = manager.disable_plugin(key).await;
    emit(
        &OperationResult::from_result(&result, |_| format!("Plugin '{key}' disabled.")),
        json,
    )
}

/// Show install order and dependency availability for one plugin.
pub async fn cmd_deps(manager: &PluginManager, key: &str) -> Result<()> {
    let order = manager
        .resolver()
        .resolve(key)
        .await
        .with_context(|| format!("failed to resolve dependencies of '{key}'"))?;
    let check = manager.check_dependencies(key).await?;

    println!("Install order: {}", order.join(" -> "));
    if check.satisfied {
        println!("All dependencies are installed.");
    } else {
        println!("Not yet installed: {}", check.missing.join(", "));
    }
    Ok(())
}

/// Upgrade every plugin with a newer manifest, or only report with `check_only`.
pub async fn cmd_upgrade(manager: &PluginManager, check_only: bool) -> Result<()> {
    if check_only {
        let batch = manager.check_upgrades().await?;
        println!("{:<22} {:<10} {:<10} {}", "PLUGIN", "CURRENT", "CANDIDATE", "STATUS");
        println!("{}", "-".repeat(60));
        for check in &batch.checks {
            println!(
                "{:<22} {:<10} {:<10} {}",
                check.plugin, check.current, check.candidate, check.reason
            );
        }
        for (plugin, error) in &batch.errors {
            println!("{plugin:<22} error: {error}");
        }
        println!("{} upgrade(s) available.", batch.pending().count());
        return Ok(());
    }

    let report = manager.upgrade_all().await?;
    print_batch(&report, "upgraded")
}

pub async fn cmd_health(manager: &PluginManager) -> Result<()> {
    let report = manager.run_health_check().await?;
    print_health(&report);
    if report.health == HealthState::Critical {
        bail!("{} registered table(s) are missing", report.issues.len());
    }
    Ok(())
}

/// Repair one plugin, or every plugin with missing tables.
pub async fn cmd_repair(manager: &PluginManager, key: Option<&str>, json: bool) -> Result<()> {
    match key {
        Some(key) => {
            let result = manager.repair(key).await;
            emit(
                &OperationResult::from_result(&result, |outcome| {
                    format!(
                        "Plugin '{key}' repaired: {} table(s) restored.",
                        outcome.restored.len()
                    )
                }),
                json,
            )
        }
        None => {
            let report = manager.repair_all().await?;
            print_batch(&report, "repaired")
        }
    }
}

pub async fn cmd_cleanup_orphans(manager: &PluginManager) -> Result<()> {
    let removed = manager.cleanup_orphans().await?;
    for (plugin, table) in &removed {
        println!("  {plugin}: {table}");
    }
    println!("Removed {} orphan registration(s).", removed.len());
    Ok(())
}

/// Back up one plugin, or every plugin that owns tables.
pub async fn cmd_backup(manager: &PluginManager, key: Option<&str>, json: bool) -> Result<()> {
    match key {
        Some(key) => {
            let result = manager.backup_plugin(key).await;
            emit(
                &OperationResult::from_result(&result, |artifact| {
                    format!(
                        "Backed up '{key}': {} table(s), {} row(s) -> {}",
                        artifact.snapshot.tables.len(),
                        artifact.snapshot.row_count(),
                        artifact.path.display()
                    )
                }),
                json,
            )
        }
        None => {
            let report = manager.backup_all().await?;
            print_batch(&report, "backed up")
        }
    }
}

pub async fn cmd_restore(manager: &PluginManager, path: &Path, json: bool) -> Result<()> {
    let result = manager.restore_file(path).await;
    let op = OperationResult::from_result(&result, |snapshot| {
        format!(
            "Restored '{}' from backup {} ({} row(s)).",
            snapshot.plugin,
            snapshot.id,
            snapshot.row_count()
        )
    });
    // Detail carries the snapshot identity, not its rows.
    let op = match &result {
        Ok(snapshot) => op.with_detail(&serde_json::json!({
            "id": snapshot.id,
            "plugin": snapshot.plugin,
            "version": snapshot.version,
            "rows": snapshot.row_count(),
        })),
        Err(_) => op,
    };
    emit(&op, json).with_context(|| format!("failed to restore {}", path.display()))
}

/// Show the ledger for one plugin.
pub async fn cmd_history(manager: &PluginManager, key: &str) -> Result<()> {
    let records = manager.history(key).await?;
    if records.is_empty() {
        println!("No migrations recorded for '{key}'.");
        return Ok(());
    }

    println!(
        "{:<6} {:<10} {:<10} {:<10} {:<20} {}",
        "ID", "OPERATION", "VERSION", "STATUS", "STARTED", "ERROR"
    );
    println!("{}", "-".repeat(80));

    for record in &records {
        let started = chrono::DateTime::from_timestamp(record.created_at, 0)
            .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
            .unwrap_or_default();
        println!(
            "{:<6} {:<10} {:<10} {:<10} {:<20} {}",
            record.id,
            record.operation,
            record.version,
            record.status,
            started,
            record.error.as_deref().unwrap_or("")
        );
    }
    Ok(())
}

/// Run discovery, upgrades, audit and repair in one pass.
pub async fn cmd_maintain(manager: &PluginManager, plugins_dir: &Path) -> Result<()> {
    let report = manager.full_maintenance(plugins_dir).await?;

    println!(
        "Discovery: {} registered, {} changed, {} skipped",
        report.discovery.registered.len(),
        report.discovery.changed().len(),
        report.discovery.errors.len()
    );
    println!(
        "Upgrades:  {} succeeded, {} failed",
        report.upgrades.succeeded.len(),
        report.upgrades.failures.len()
    );
    println!("Audit:     {}", report.audit.health);
    println!(
        "Repairs:   {} succeeded, {} failed",
        report.repairs.succeeded.len(),
        report.repairs.failures.len()
    );
    print_health(&report.final_audit);

    let failures = report.upgrades.failures.len() + report.repairs.failures.len();
    if failures > 0 {
        for failure in report.upgrades.failures.iter().chain(&report.repairs.failures) {
            println!("  {}: {}", failure.plugin, failure.reason);
        }
        bail!("maintenance finished with {failures} failure(s)");
    }
    Ok(())
}

/// Print a single-plugin result and turn a failure into an error.
fn emit(op: &OperationResult, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(op)?);
    } else if op.success {
        println!("{}", op.message);
    }

    if !op.success {
        bail!("{}", op.message);
    }
    Ok(())
}

fn print_batch(report: &BatchReport, verb: &str) -> Result<()> {
    for plugin in &report.succeeded {
        println!("  {verb}: {plugin}");
    }
    for failure in &report.failures {
        println!("  failed: {}: {}", failure.plugin, failure.reason);
    }
    println!(
        "{} plugin(s) {verb}, {} failed.",
        report.succeeded.len(),
        report.failures.len()
    );

    if !report.is_clean() {
        bail!("{} plugin(s) failed", report.failures.len());
    }
    Ok(())
}

fn print_health(report: &HealthReport) {
    println!(
        "Health: {} ({} plugin(s), {} table(s) checked)",
        report.health, report.plugins_checked, report.tables_checked
    );
    for issue in &report.issues {
        println!("  missing table: {} ({})", issue.table, issue.plugin);
    }
    for warning in &report.warnings {
        println!("  warning: {}: {}", warning.plugin, warning.message);
    }
}
