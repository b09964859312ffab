//! Version comparison and upgrade orchestration.
//!
//! Versions follow semver precedence. Manifests in the wild often carry
//! `1.2` or `v1.2.0`, so both are accepted and normalised before parsing.

use std::cmp::Ordering;
use std::path::{Path, PathBuf};

use semver::Version;
use serde::Serialize;
use tracing::{info, warn};

use super::backup::BackupManager;
use super::error::{PluginError, PluginResult};
use super::info_parser::PluginInfo;
use super::ledger::{MigrationOperation, MigrationRecord};
use super::migration::MigrationEngine;
use super::outcome::BatchReport;
use super::status::{PluginRegistry, PluginStatus};

/// Parse a version, padding missing minor/patch components with zero.
pub fn parse_version(raw: &str) -> PluginResult<Version> {
    let trimmed = raw.trim();
    let trimmed = trimmed.strip_prefix('v').unwrap_or(trimmed);

    let invalid = |details: String| PluginError::InvalidVersion {
        version: raw.to_string(),
        details,
    };

    // Split off pre-release/build metadata before counting components.
    let split = trimmed.find(['-', '+']).unwrap_or(trimmed.len());
    let (core, suffix) = trimmed.split_at(split);

    let parts = core.split('.').count();
    let padded = match parts {
        1 => format!("{core}.0.0{suffix}"),
        2 => format!("{core}.0{suffix}"),
        _ => trimmed.to_string(),
    };

    Version::parse(&padded).map_err(|e| invalid(e.to_string()))
}

/// Compare two version strings by semver precedence.
pub fn compare_versions(a: &str, b: &str) -> PluginResult<Ordering> {
    Ok(parse_version(a)?.cmp_precedence(&parse_version(b)?))
}

/// Whether `candidate` should replace `current`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UpgradeCheck {
    pub plugin: String,
    pub current: String,
    pub candidate: String,
    pub needs_upgrade: bool,
    pub reason: String,
}

impl UpgradeCheck {
    fn new(plugin: &str, current: &str, candidate: &str) -> PluginResult<Self> {
        let (needs_upgrade, reason) = match compare_versions(candidate, current)? {
            Ordering::Greater => (true, format!("{current} -> {candidate}")),
            Ordering::Equal => (false, format!("already at {current}")),
            Ordering::Less => (
                false,
                format!("candidate {candidate} is older than registered {current}"),
            ),
        };

        Ok(Self {
            plugin: plugin.to_string(),
            current: current.to_string(),
            candidate: candidate.to_string(),
            needs_upgrade,
            reason,
        })
    }
}

/// A completed upgrade.
#[derive(Debug, Clone, Serialize)]
pub struct UpgradeOutcome {
    pub plugin: String,
    pub from: String,
    pub to: String,
    pub record: MigrationRecord,
    pub backup: Option<PathBuf>,
}

/// Per-plugin result of scanning installed plugins for newer manifests.
#[derive(Debug, Clone, Serialize)]
pub struct BatchCheck {
    pub checks: Vec<UpgradeCheck>,
    pub errors: Vec<(String, String)>,
}

impl BatchCheck {
    pub fn pending(&self) -> impl Iterator<Item = &UpgradeCheck> {
        self.checks.iter().filter(|c| c.needs_upgrade)
    }
}

/// Drives upgrades: backup, migration, then version bump.
#[derive(Clone)]
pub struct VersionManager {
    registry: PluginRegistry,
    engine: MigrationEngine,
    backups: BackupManager,
    backup_before_upgrade: bool,
}

impl VersionManager {
    pub fn new(
        registry: PluginRegistry,
        engine: MigrationEngine,
        backups: BackupManager,
        backup_before_upgrade: bool,
    ) -> Self {
        Self {
            registry,
            engine,
            backups,
            backup_before_upgrade,
        }
    }

    /// Compare a candidate version against the registered one.
    pub async fn check_upgrade(&self, key: &str, candidate: &str) -> PluginResult<UpgradeCheck> {
        let record = self
            .registry
            .get(key)
            .await?
            .ok_or_else(|| PluginError::NotRegistered {
                plugin: key.to_string(),
            })?;

        UpgradeCheck::new(key, &record.version, candidate)
    }

    /// Upgrade an installed plugin to `candidate`.
    ///
    /// The registered version only changes after the upgrade migration
    /// completes. A failed migration marks the plugin `failed`.
    pub async fn upgrade(
        &self,
        key: &str,
        candidate: &str,
        script: Option<&Path>,
    ) -> PluginResult<UpgradeOutcome> {
        let record = self
            .registry
            .get(key)
            .await?
            .ok_or_else(|| PluginError::NotRegistered {
                plugin: key.to_string(),
            })?;

        if !record.status.has_schema() {
            return Err(PluginError::invalid_transition(key, "upgrade", record.status));
        }

        let check = UpgradeCheck::new(key, &record.version, candidate)?;
        if !check.needs_upgrade {
            return Err(PluginError::NoUpgradeAvailable {
                plugin: key.to_string(),
                current: record.version,
                candidate: candidate.to_string(),
            });
        }

        let backup = if self.backup_before_upgrade {
            Some(self.backups.backup(key).await?.path)
        } else {
            None
        };

        info!(plugin = key, from = %record.version, to = candidate, "upgrading plugin");

        let migration = self
            .engine
            .apply(key, candidate, MigrationOperation::Upgrade, script)
            .await?;

        if !migration.succeeded() {
            self.registry.set_status(key, PluginStatus::Failed).await?;
            warn!(plugin = key, to = candidate, "upgrade failed, version left unchanged");
            return Err(PluginError::ScriptExecutionFailed {
                plugin: key.to_string(),
                operation: MigrationOperation::Upgrade.to_string(),
                details: migration.error.unwrap_or_default(),
            });
        }

        self.registry.set_version(key, candidate).await?;
        info!(plugin = key, version = candidate, "plugin upgraded");

        Ok(UpgradeOutcome {
            plugin: key.to_string(),
            from: record.version,
            to: candidate.to_string(),
            record: migration,
            backup,
        })
    }

    /// Check every installed plugin against its on-disk manifest.
    pub async fn batch_check(&self) -> PluginResult<BatchCheck> {
        let mut batch = BatchCheck {
            checks: Vec::new(),
            errors: Vec::new(),
        };

        for record in self.registry.list().await? {
            if !record.status.has_schema() {
                continue;
            }

            let check = PluginInfo::from_dir(&record.root_path)
                .and_then(|info| UpgradeCheck::new(&record.key, &record.version, &info.version));

            match check {
                Ok(check) => batch.checks.push(check),
                Err(e) => {
                    warn!(plugin = %record.key, error = %e, "upgrade check failed");
                    batch.errors.push((record.key, e.to_string()));
                }
            }
        }

        Ok(batch)
    }

    /// Upgrade every plugin whose manifest is newer than its registration.
    pub async fn batch_upgrade(&self) -> PluginResult<BatchReport> {
        let batch = self.batch_check().await?;
        let mut report = BatchReport::default();

        for (plugin, reason) in &batch.errors {
            report.record_failure(plugin.as_str(), reason);
        }

        for check in batch.pending() {
            let result = self.upgrade_from_manifest(&check.plugin).await;
            report.record(&check.plugin, &result);
        }

        info!(
            upgraded = report.succeeded.len(),
            failed = report.failures.len(),
            "batch upgrade finished"
        );
        Ok(report)
    }

    async fn upgrade_from_manifest(&self, key: &str) -> PluginResult<UpgradeOutcome> {
        let record = self
            .registry
            .get(key)
            .await?
            .ok_or_else(|| PluginError::NotRegistered {
                plugin: key.to_string(),
            })?;
        let info = PluginInfo::from_dir(&record.root_path)?;
        let scripts = info.scripts.resolve(&record.root_path);

        self.upgrade(key, &info.version, scripts.upgrade.as_deref())
            .await
    }
}
