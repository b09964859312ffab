//! Plugin lifecycle and migration engine.
//!
//! This module handles:
//! - Parsing plugin metadata from `.info.toml` files
//! - Tracking plugin status in the registry
//! - Resolving dependency closures and detecting cycles
//! - Applying install, upgrade, uninstall and repair scripts
//! - Backing up and restoring plugin data
//! - Auditing registered tables against the live schema

mod backup;
pub mod cli;
mod dependency;
mod error;
mod health;
mod info_parser;
mod kind;
mod ledger;
mod manager;
mod migration;
mod outcome;
mod sql_split;
mod status;
mod version;

pub use backup::{BackupArtifact, BackupManager, BackupSnapshot, Cell, TableDump};
pub use dependency::{DependencyCheck, DependencyGraph, DependencyResolver};
pub use error::{PluginError, PluginResult};
pub use health::{HealthIssue, HealthReport, HealthService, HealthState, HealthWarning, RepairOutcome};
pub use info_parser::{
    DEFAULT_KIND, DiscoveredPlugin, Discovery, PluginInfo, ScriptConfig, ScriptPaths,
    discover_plugins, find_manifest,
};
pub use kind::{KindConstructor, KindRegistry, PluginKind};
pub use ledger::{Ledger, MigrationOperation, MigrationRecord, MigrationStatus, TableRegistration};
pub use manager::{EngineOptions, PluginManager};
pub use migration::{MigrationEngine, UninstallReport};
pub use outcome::{
    BatchFailure, BatchReport, DiscoveryError, DiscoveryReport, LifecycleOutcome,
    MaintenanceReport, OperationResult,
};
pub use sql_split::{PREFIX_PLACEHOLDER, created_table, split_statements, substitute_prefix};
pub use status::{PluginRecord, PluginRegistry, PluginStatus, UpsertOutcome};
pub use version::{
    BatchCheck, UpgradeCheck, UpgradeOutcome, VersionManager, compare_versions, parse_version,
};
