//! Plugin engine facade.
//!
//! `PluginManager` owns every engine component around one pool and exposes
//! the coarse operations that admin tools, scheduled jobs and the CLI call.
//! Single operations return typed outcomes or a [`PluginError`]; batch
//! operations never abort and name every failure in their report.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use sqlx::SqlitePool;
use tracing::{info, warn};

use super::backup::{BackupArtifact, BackupManager, BackupSnapshot};
use super::dependency::{DependencyCheck, DependencyResolver};
use super::error::{PluginError, PluginResult};
use super::health::{HealthReport, HealthService, RepairOutcome};
use super::info_parser::discover_plugins;
use super::kind::KindRegistry;
use super::ledger::{Ledger, MigrationOperation, MigrationRecord};
use super::migration::{MigrationEngine, UninstallReport};
use super::outcome::{
    BatchReport, DiscoveryError, DiscoveryReport, LifecycleOutcome, MaintenanceReport,
};
use super::status::{PluginRecord, PluginRegistry, PluginStatus, UpsertOutcome};
use super::version::{BatchCheck, UpgradeCheck, UpgradeOutcome, VersionManager};

/// Deployment settings for the engine.
#[derive(Debug, Clone)]
pub struct EngineOptions {
    /// Prefix for engine tables and the `{prefix}` script placeholder.
    pub table_prefix: String,
    /// Root directory for backup files.
    pub backup_dir: PathBuf,
    /// Take a backup before each upgrade.
    pub backup_before_upgrade: bool,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            table_prefix: "atelier_".to_string(),
            backup_dir: PathBuf::from("./backups"),
            backup_before_upgrade: true,
        }
    }
}

/// Entry point to the plugin lifecycle and migration engine.
pub struct PluginManager {
    options: EngineOptions,
    kinds: KindRegistry,
    registry: PluginRegistry,
    ledger: Ledger,
    resolver: DependencyResolver,
    engine: MigrationEngine,
    versions: VersionManager,
    backups: BackupManager,
    health: HealthService,
}

impl PluginManager {
    /// Build the engine with the built-in plugin kinds.
    pub async fn new(pool: SqlitePool, options: EngineOptions) -> PluginResult<Self> {
        Self::with_kinds(pool, options, KindRegistry::builtin()).await
    }

    /// Build the engine with a caller-supplied kind registry.
    ///
    /// Creates the registry, ledger and table-registry tables if needed.
    pub async fn with_kinds(
        pool: SqlitePool,
        options: EngineOptions,
        kinds: KindRegistry,
    ) -> PluginResult<Self> {
        let registry = PluginRegistry::new(pool.clone(), &options.table_prefix);
        let ledger = Ledger::new(pool.clone(), &options.table_prefix);
        registry.ensure_table().await?;
        ledger.ensure_tables().await?;

        let engine = MigrationEngine::new(pool.clone(), ledger.clone(), &options.table_prefix);
        let backups = BackupManager::new(
            pool.clone(),
            registry.clone(),
            ledger.clone(),
            options.backup_dir.clone(),
        );
        let versions = VersionManager::new(
            registry.clone(),
            engine.clone(),
            backups.clone(),
            options.backup_before_upgrade,
        );
        let health = HealthService::new(pool, registry.clone(), ledger.clone(), engine.clone());
        let resolver = DependencyResolver::new(registry.clone());

        info!(
            prefix = %options.table_prefix,
            kinds = ?kinds.known(),
            "plugin engine ready"
        );

        Ok(Self {
            options,
            kinds,
            registry,
            ledger,
            resolver,
            engine,
            versions,
            backups,
            health,
        })
    }

    pub fn options(&self) -> &EngineOptions {
        &self.options
    }

    pub fn kinds(&self) -> &KindRegistry {
        &self.kinds
    }

    pub fn registry(&self) -> &PluginRegistry {
        &self.registry
    }

    pub fn ledger(&self) -> &Ledger {
        &self.ledger
    }

    pub fn resolver(&self) -> &DependencyResolver {
        &self.resolver
    }

    pub fn engine(&self) -> &MigrationEngine {
        &self.engine
    }

    async fn require(&self, key: &str) -> PluginResult<PluginRecord> {
        self.registry
            .get(key)
            .await?
            .ok_or_else(|| PluginError::NotRegistered {
                plugin: key.to_string(),
            })
    }

    // -------------------------------------------------------------------------
    // Discovery
    // -------------------------------------------------------------------------

    /// Scan `root` and sync every valid manifest into the registry.
    ///
    /// Invalid manifests, unknown kinds and duplicate keys are reported and
    /// skipped. The dependency cache is dropped if any row changed.
    pub async fn discover_and_register(&self, root: &Path) -> PluginResult<DiscoveryReport> {
        let discovery = discover_plugins(root);
        let mut report = DiscoveryReport::default();

        for (path, error) in discovery.errors {
            report.errors.push(DiscoveryError {
                path,
                reason: error.to_string(),
            });
        }

        let mut seen = HashSet::new();
        for plugin in discovery.plugins {
            let key = plugin.info.name.clone();

            if !seen.insert(key.clone()) {
                warn!(plugin = %key, dir = %plugin.dir.display(), "duplicate plugin key, skipping");
                report.errors.push(DiscoveryError {
                    reason: PluginError::invalid_manifest(
                        plugin.dir.display().to_string(),
                        format!("plugin key '{key}' is already provided by another directory"),
                    )
                    .to_string(),
                    path: plugin.dir,
                });
                continue;
            }

            if let Err(details) = self.kinds.validate(&plugin.info) {
                warn!(plugin = %key, error = %details, "manifest rejected by kind");
                report.errors.push(DiscoveryError {
                    reason: PluginError::invalid_manifest(plugin.dir.display().to_string(), details)
                        .to_string(),
                    path: plugin.dir,
                });
                continue;
            }

            let outcome = self.registry.upsert(&plugin.info, &plugin.dir).await?;
            report.registered.push((key, outcome));
        }

        if report
            .registered
            .iter()
            .any(|(_, outcome)| *outcome != UpsertOutcome::Unchanged)
        {
            self.resolver.invalidate();
        }

        info!(
            registered = report.registered.len(),
            changed = report.changed().len(),
            errors = report.errors.len(),
            root = %root.display(),
            "discovery finished"
        );
        Ok(report)
    }

    pub async fn list_plugins(&self) -> PluginResult<Vec<PluginRecord>> {
        self.registry.list().await
    }

    // -------------------------------------------------------------------------
    // Lifecycle
    // -------------------------------------------------------------------------

    /// Install one plugin. Every dependency must already be installed or enabled.
    pub async fn install_plugin(&self, key: &str) -> PluginResult<LifecycleOutcome> {
        let plugin = self.require(key).await?;
        if !plugin.status.can_install() {
            return Err(PluginError::invalid_transition(key, "install", plugin.status));
        }

        let order = self.resolver.resolve(key).await?;
        let graph = self.resolver.graph().await?;
        for dependency in order.iter().filter(|d| d.as_str() != key) {
            let status = graph.status(dependency);
            if !status.is_some_and(|s| s.satisfies_dependency()) {
                return Err(PluginError::DependencyNotSatisfied {
                    plugin: key.to_string(),
                    dependency: dependency.clone(),
                    status: status.map_or_else(|| "not registered".to_string(), |s| s.to_string()),
                });
            }
        }

        info!(plugin = key, version = %plugin.version, kind = %plugin.kind, "installing plugin");

        let record = self
            .engine
            .apply(
                key,
                &plugin.version,
                MigrationOperation::Install,
                plugin.scripts.install.as_deref(),
            )
            .await?;

        if !record.succeeded() {
            self.registry.set_status(key, PluginStatus::Failed).await?;
            return Err(PluginError::ScriptExecutionFailed {
                plugin: key.to_string(),
                operation: MigrationOperation::Install.to_string(),
                details: record.error.unwrap_or_default(),
            });
        }

        let status = if self.kinds.enable_on_install(&plugin.kind) {
            PluginStatus::Enabled
        } else {
            PluginStatus::Installed
        };
        self.registry.set_status(key, status).await?;
        info!(plugin = key, %status, "plugin installed");

        Ok(LifecycleOutcome {
            plugin: key.to_string(),
            status,
            record: Some(record),
        })
    }

    /// Install every `discovered` plugin, dependencies first.
    pub async fn install_all(&self) -> PluginResult<BatchReport> {
        let mut report = BatchReport::default();
        let mut order: Vec<String> = Vec::new();

        for plugin in self.registry.list().await? {
            if plugin.status != PluginStatus::Discovered {
                continue;
            }
            match self.resolver.resolve(&plugin.key).await {
                Ok(closure) => {
                    for key in closure {
                        if !order.contains(&key) {
                            order.push(key);
                        }
                    }
                }
                Err(e) => report.record_failure(plugin.key, e),
            }
        }

        for key in order {
            let Some(plugin) = self.registry.get(&key).await? else {
                continue;
            };
            if plugin.status != PluginStatus::Discovered {
                continue;
            }
            let result = self.install_plugin(&key).await;
            report.record(&key, &result);
        }

        info!(
            installed = report.succeeded.len(),
            failed = report.failures.len(),
            "install-all finished"
        );
        Ok(report)
    }

    /// Uninstall a plugin. Refused while installed plugins depend on it.
    pub async fn uninstall_plugin(&self, key: &str) -> PluginResult<UninstallReport> {
        let plugin = self.require(key).await?;
        if !plugin.status.can_uninstall() {
            return Err(PluginError::invalid_transition(key, "uninstall", plugin.status));
        }

        let graph = self.resolver.graph().await?;
        let dependents: Vec<String> = graph
            .dependents(key)
            .into_iter()
            .filter(|d| graph.status(d).is_some_and(|s| s.has_schema()))
            .collect();
        if !dependents.is_empty() {
            return Err(PluginError::has_dependents(key, "uninstall", &dependents));
        }

        info!(plugin = key, version = %plugin.version, "uninstalling plugin");

        let report = self
            .engine
            .uninstall(key, &plugin.version, plugin.scripts.uninstall.as_deref())
            .await?;

        if !report.is_complete() {
            self.registry.set_status(key, PluginStatus::Failed).await?;
            return Err(PluginError::ScriptExecutionFailed {
                plugin: key.to_string(),
                operation: MigrationOperation::Uninstall.to_string(),
                details: report.record.error.clone().unwrap_or_default(),
            });
        }

        self.registry.set_status(key, PluginStatus::Removed).await?;
        info!(plugin = key, dropped = report.dropped.len(), "plugin removed");
        Ok(report)
    }

    /// Enable an installed or disabled plugin whose dependencies are usable.
    pub async fn enable_plugin(&self, key: &str) -> PluginResult<LifecycleOutcome> {
        let plugin = self.require(key).await?;
        if !matches!(plugin.status, PluginStatus::Installed | PluginStatus::Disabled) {
            return Err(PluginError::invalid_transition(key, "enable", plugin.status));
        }

        let graph = self.resolver.graph().await?;
        let check = graph.check(key);
        if let Some(dependency) = check.missing.first() {
            return Err(PluginError::DependencyNotSatisfied {
                plugin: key.to_string(),
                dependency: dependency.clone(),
                status: graph
                    .status(dependency)
                    .map_or_else(|| "not registered".to_string(), |s| s.to_string()),
            });
        }

        self.registry.set_status(key, PluginStatus::Enabled).await?;
        info!(plugin = key, "plugin enabled");

        Ok(LifecycleOutcome {
            plugin: key.to_string(),
            status: PluginStatus::Enabled,
            record: None,
        })
    }

    /// Disable an enabled plugin. Refused while enabled plugins depend on it.
    pub async fn disable_plugin(&self, key: &str) -> PluginResult<LifecycleOutcome> {
        let plugin = self.require(key).await?;
        if plugin.status != PluginStatus::Enabled {
            return Err(PluginError::invalid_transition(key, "disable", plugin.status));
        }

        let graph = self.resolver.graph().await?;
        let dependents: Vec<String> = graph
            .dependents(key)
            .into_iter()
            .filter(|d| graph.status(d) == Some(PluginStatus::Enabled))
            .collect();
        if !dependents.is_empty() {
            return Err(PluginError::has_dependents(key, "disable", &dependents));
        }

        self.registry.set_status(key, PluginStatus::Disabled).await?;
        info!(plugin = key, "plugin disabled");

        Ok(LifecycleOutcome {
            plugin: key.to_string(),
            status: PluginStatus::Disabled,
            record: None,
        })
    }

    pub async fn check_dependencies(&self, key: &str) -> PluginResult<DependencyCheck> {
        self.require(key).await?;
        self.resolver.check(key).await
    }

    // -------------------------------------------------------------------------
    // Upgrades
    // -------------------------------------------------------------------------

    pub async fn check_upgrades(&self) -> PluginResult<BatchCheck> {
        self.versions.batch_check().await
    }

    pub async fn check_upgrade(&self, key: &str, candidate: &str) -> PluginResult<UpgradeCheck> {
        self.versions.check_upgrade(key, candidate).await
    }

    /// Upgrade one plugin to `candidate` with an explicit script.
    pub async fn upgrade_plugin(
        &self,
        key: &str,
        candidate: &str,
        script: Option<&Path>,
    ) -> PluginResult<UpgradeOutcome> {
        self.versions.upgrade(key, candidate, script).await
    }

    /// Upgrade every installed plugin whose manifest carries a newer version.
    pub async fn upgrade_all(&self) -> PluginResult<BatchReport> {
        self.versions.batch_upgrade().await
    }

    // -------------------------------------------------------------------------
    // Health
    // -------------------------------------------------------------------------

    pub async fn run_health_check(&self) -> PluginResult<HealthReport> {
        self.health.audit().await
    }

    pub async fn repair(&self, key: &str) -> PluginResult<RepairOutcome> {
        self.health.repair(key).await
    }

    /// Repair every plugin the audit reports missing tables for.
    pub async fn repair_all(&self) -> PluginResult<BatchReport> {
        let audit = self.health.audit().await?;
        Ok(self.repair_plugins(&audit.plugins_with_issues()).await)
    }

    async fn repair_plugins(&self, plugins: &[String]) -> BatchReport {
        let mut report = BatchReport::default();
        for key in plugins {
            let result = self.health.repair(key).await;
            if let Err(e) = &result {
                warn!(plugin = %key, error = %e, "repair failed");
            }
            report.record(key, &result);
        }
        report
    }

    pub async fn cleanup_orphans(&self) -> PluginResult<Vec<(String, String)>> {
        self.health.cleanup_orphans().await
    }

    // -------------------------------------------------------------------------
    // Backups
    // -------------------------------------------------------------------------

    pub async fn backup_plugin(&self, key: &str) -> PluginResult<BackupArtifact> {
        self.backups.backup(key).await
    }

    /// Back up every plugin that currently owns schema.
    pub async fn backup_all(&self) -> PluginResult<BatchReport> {
        let mut report = BatchReport::default();
        for plugin in self.registry.list().await? {
            if !plugin.status.has_schema() {
                continue;
            }
            let result = self.backups.backup(&plugin.key).await;
            report.record(&plugin.key, &result);
        }
        Ok(report)
    }

    pub async fn backups(&self, key: &str) -> PluginResult<Vec<PathBuf>> {
        self.backups.list(key).await
    }

    /// Restore a snapshot into a registered plugin's tables.
    pub async fn restore(&self, snapshot: &BackupSnapshot) -> PluginResult<usize> {
        self.require(&snapshot.plugin).await?;
        self.backups.restore(snapshot).await
    }

    /// Load a backup file, verify it and restore it.
    pub async fn restore_file(&self, path: &Path) -> PluginResult<BackupSnapshot> {
        let snapshot = self.backups.load(path).await?;
        self.restore(&snapshot).await?;
        Ok(snapshot)
    }

    /// Ledger entries for one plugin, oldest first.
    pub async fn history(&self, key: &str) -> PluginResult<Vec<MigrationRecord>> {
        self.ledger.records_for(key).await
    }

    // -------------------------------------------------------------------------
    // Maintenance
    // -------------------------------------------------------------------------

    /// Discover, upgrade, audit, repair plugins with issues, then audit again.
    pub async fn full_maintenance(&self, root: &Path) -> PluginResult<MaintenanceReport> {
        info!(root = %root.display(), "starting full maintenance");

        let discovery = self.discover_and_register(root).await?;
        let upgrades = self.upgrade_all().await?;
        let audit = self.health.audit().await?;
        let repairs = self.repair_plugins(&audit.plugins_with_issues()).await;
        let final_audit = self.health.audit().await?;

        info!(health = %final_audit.health, "full maintenance finished");

        Ok(MaintenanceReport {
            discovery,
            upgrades,
            audit,
            repairs,
            final_audit,
        })
    }
}
