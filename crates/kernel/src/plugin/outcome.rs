//! Result objects handed back to callers of the plugin engine.

use std::path::PathBuf;

use serde::Serialize;

use super::error::{PluginError, PluginResult};
use super::health::HealthReport;
use super::ledger::MigrationRecord;
use super::status::{PluginStatus, UpsertOutcome};

/// Uniform success/failure envelope for single operations.
#[derive(Debug, Clone, Serialize)]
pub struct OperationResult {
    pub success: bool,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<serde_json::Value>,
}

impl OperationResult {
    pub fn ok(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: message.into(),
            detail: None,
        }
    }

    pub fn failed(error: &PluginError) -> Self {
        Self {
            success: false,
            message: error.to_string(),
            detail: None,
        }
    }

    /// Attach a serializable payload. Values that fail to serialize are dropped.
    pub fn with_detail<T: Serialize>(mut self, detail: &T) -> Self {
        self.detail = serde_json::to_value(detail).ok();
        self
    }

    /// Build from any operation outcome.
    pub fn from_result<T: Serialize>(
        result: &PluginResult<T>,
        message: impl FnOnce(&T) -> String,
    ) -> Self {
        match result {
            Ok(value) => Self::ok(message(value)).with_detail(value),
            Err(e) => Self::failed(e),
        }
    }
}

/// Where a single lifecycle action left a plugin.
#[derive(Debug, Clone, Serialize)]
pub struct LifecycleOutcome {
    pub plugin: String,
    pub status: PluginStatus,
    /// Ledger entry, for actions that ran a migration.
    pub record: Option<MigrationRecord>,
}

/// A plugin that failed inside a batch, with the reason.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BatchFailure {
    pub plugin: String,
    pub reason: String,
}

/// Aggregate result of a batch operation. Batches never abort early.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BatchReport {
    pub succeeded: Vec<String>,
    pub failures: Vec<BatchFailure>,
}

impl BatchReport {
    pub fn record_success(&mut self, plugin: impl Into<String>) {
        self.succeeded.push(plugin.into());
    }

    pub fn record_failure(&mut self, plugin: impl Into<String>, reason: impl ToString) {
        self.failures.push(BatchFailure {
            plugin: plugin.into(),
            reason: reason.to_string(),
        });
    }

    /// Record the outcome of one plugin's operation.
    pub fn record<T>(&mut self, plugin: &str, result: &PluginResult<T>) {
        match result {
            Ok(_) => self.record_success(plugin),
            Err(e) => self.record_failure(plugin, e),
        }
    }

    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }

    pub fn total(&self) -> usize {
        self.succeeded.len() + self.failures.len()
    }
}

/// A manifest that could not be registered.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DiscoveryError {
    pub path: PathBuf,
    pub reason: String,
}

/// Result of scanning the plugins root and syncing the registry.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DiscoveryReport {
    pub registered: Vec<(String, UpsertOutcome)>,
    pub errors: Vec<DiscoveryError>,
}

impl DiscoveryReport {
    /// Keys whose registry row was inserted or updated.
    pub fn changed(&self) -> Vec<&str> {
        self.registered
            .iter()
            .filter(|(_, outcome)| *outcome != UpsertOutcome::Unchanged)
            .map(|(key, _)| key.as_str())
            .collect()
    }
}

/// Every intermediate report produced by a maintenance run.
#[derive(Debug, Clone, Serialize)]
pub struct MaintenanceReport {
    pub discovery: DiscoveryReport,
    pub upgrades: BatchReport,
    pub audit: HealthReport,
    pub repairs: BatchReport,
    pub final_audit: HealthReport,
}
