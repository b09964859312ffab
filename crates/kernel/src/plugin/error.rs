//! Plugin engine error types with clear, actionable messages.
//!
//! All errors include the plugin key (or manifest path, for discovery-time
//! failures) so that operators can identify the offending plugin from a
//! batch report without digging through logs.

use thiserror::Error;

/// Errors raised by the plugin lifecycle and migration engine.
#[derive(Debug, Error)]
pub enum PluginError {
    /// Plugin directory has no `.info.toml` manifest.
    #[error("no .info.toml manifest found in {path}")]
    ManifestMissing { path: String },

    /// Manifest exists but could not be read or parsed, or fails validation.
    #[error("invalid manifest at {path}: {details}")]
    ManifestInvalid { path: String, details: String },

    /// Manifest parsed but lacks a required identity field.
    #[error("manifest at {path} is missing required field '{field}'")]
    ManifestIncomplete { path: String, field: String },

    /// Operation targeted a key that was never registered.
    #[error("plugin '{plugin}' is not registered. Run discovery first.")]
    NotRegistered { plugin: String },

    /// Plugin depends on a key that is not in the registry.
    #[error("plugin '{plugin}': depends on '{dependency}' which is not registered")]
    MissingDependency { plugin: String, dependency: String },

    /// Dependency graph contains a cycle.
    #[error("circular dependency detected: {cycle}")]
    CircularDependency { cycle: String },

    /// Dependency is registered but not installed or enabled.
    #[error(
        "plugin '{plugin}': dependency '{dependency}' is {status}. Install it first with: atelier install {dependency}"
    )]
    DependencyNotSatisfied {
        plugin: String,
        dependency: String,
        status: String,
    },

    /// Other plugins still rely on this one.
    #[error("cannot {action} plugin '{plugin}': required by {dependents}")]
    HasDependents {
        plugin: String,
        action: String,
        dependents: String,
    },

    /// Lifecycle action is not allowed from the plugin's current status.
    #[error("cannot {action} plugin '{plugin}' while it is {status}")]
    InvalidTransition {
        plugin: String,
        action: String,
        status: String,
    },

    /// A migration script did not run to completion.
    #[error("plugin '{plugin}': {operation} script failed: {details}")]
    ScriptExecutionFailed {
        plugin: String,
        operation: String,
        details: String,
    },

    /// Version string does not follow major.minor.patch.
    #[error("invalid version '{version}': {details}")]
    InvalidVersion { version: String, details: String },

    /// Upgrade requested to a version that does not exceed the registered one.
    #[error("plugin '{plugin}': no upgrade from {current} to {candidate}")]
    NoUpgradeAvailable {
        plugin: String,
        current: String,
        candidate: String,
    },

    /// Repair requested for a plugin whose tables are all present.
    #[error("plugin '{plugin}': nothing to repair, all registered tables exist")]
    NothingToRepair { plugin: String },

    /// Backup snapshot could not be written.
    #[error("plugin '{plugin}': backup failed: {details}")]
    BackupWriteFailed { plugin: String, details: String },

    /// Backup snapshot could not be loaded or applied.
    #[error("plugin '{plugin}': restore failed: {details}")]
    RestoreFailed { plugin: String, details: String },

    /// Bookkeeping query failed.
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// Result type alias for engine operations.
pub type PluginResult<T> = Result<T, PluginError>;

impl PluginError {
    /// Create an invalid manifest error.
    pub fn invalid_manifest(path: impl Into<String>, details: impl Into<String>) -> Self {
        Self::ManifestInvalid {
            path: path.into(),
            details: details.into(),
        }
    }

    /// Create an invalid transition error.
    pub fn invalid_transition(
        plugin: impl Into<String>,
        action: impl Into<String>,
        status: impl std::fmt::Display,
    ) -> Self {
        Self::InvalidTransition {
            plugin: plugin.into(),
            action: action.into(),
            status: status.to_string(),
        }
    }

    /// Create a has-dependents error listing every dependent.
    pub fn has_dependents(
        plugin: impl Into<String>,
        action: impl Into<String>,
        dependents: &[String],
    ) -> Self {
        Self::HasDependents {
            plugin: plugin.into(),
            action: action.into(),
            dependents: dependents.join(", "),
        }
    }

    /// Whether this error came from reading a manifest.
    pub fn is_manifest_error(&self) -> bool {
        matches!(
            self,
            Self::ManifestMissing { .. }
                | Self::ManifestInvalid { .. }
                | Self::ManifestIncomplete { .. }
        )
    }
}
