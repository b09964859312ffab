//! Configuration loaded from environment variables.

use std::env;
use std::path::PathBuf;

use anyhow::{Context, Result, bail};

use crate::plugin::EngineOptions;

/// Application configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// SQLite connection URL (e.g. `sqlite://atelier.db?mode=rwc`).
    pub database_url: String,

    /// Maximum database connections in pool (default: 5).
    pub database_max_connections: u32,

    /// Path to plugins directory (default: ./plugins).
    pub plugins_dir: PathBuf,

    /// Path where backup snapshots are written (default: ./backups).
    pub backup_dir: PathBuf,

    /// Prefix for every table the engine and plugin scripts create (default: atelier_).
    pub table_prefix: String,

    /// Take a backup before each upgrade (default: true).
    pub backup_before_upgrade: bool,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        let database_url =
            env::var("DATABASE_URL").context("DATABASE_URL environment variable is required")?;

        let database_max_connections = env::var("DATABASE_MAX_CONNECTIONS")
            .unwrap_or_else(|_| "5".to_string())
            .parse()
            .context("DATABASE_MAX_CONNECTIONS must be a valid u32")?;

        let plugins_dir = env::var("PLUGINS_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("./plugins"));

        let backup_dir = env::var("BACKUP_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("./backups"));

        let table_prefix = env::var("TABLE_PREFIX").unwrap_or_else(|_| "atelier_".to_string());
        validate_prefix(&table_prefix)?;

        let backup_before_upgrade = parse_bool(
            &env::var("BACKUP_BEFORE_UPGRADE").unwrap_or_else(|_| "true".to_string()),
        )
        .context("BACKUP_BEFORE_UPGRADE must be true or false")?;

        Ok(Self {
            database_url,
            database_max_connections,
            plugins_dir,
            backup_dir,
            table_prefix,
            backup_before_upgrade,
        })
    }

    /// Options for building the plugin engine.
    pub fn engine_options(&self) -> EngineOptions {
        EngineOptions {
            table_prefix: self.table_prefix.clone(),
            backup_dir: self.backup_dir.clone(),
            backup_before_upgrade: self.backup_before_upgrade,
        }
    }
}

/// Table prefixes are spliced into SQL, so only identifier characters pass.
pub fn validate_prefix(prefix: &str) -> Result<()> {
    if !prefix
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_')
    {
        bail!("TABLE_PREFIX '{prefix}' may only contain letters, digits and underscores");
    }
    Ok(())
}

fn parse_bool(value: &str) -> Result<bool> {
    match value.trim().to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => bail!("invalid boolean '{other}'"),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn prefix_validation() {
        assert!(validate_prefix("atelier_").is_ok());
        assert!(validate_prefix("").is_ok());
        assert!(validate_prefix("tenant42_").is_ok());
        assert!(validate_prefix("bad-prefix").is_err());
        assert!(validate_prefix("x; DROP TABLE y").is_err());
    }

    #[test]
    fn bool_parsing() {
        assert!(parse_bool("TRUE").unwrap());
        assert!(parse_bool(" on ").unwrap());
        assert!(!parse_bool("0").unwrap());
        assert!(parse_bool("maybe").is_err());
    }

    #[test]
    fn engine_options_mirror_config() {
        let config = Config {
            database_url: "sqlite::memory:".to_string(),
            database_max_connections: 1,
            plugins_dir: PathBuf::from("plugins"),
            backup_dir: PathBuf::from("/tmp/backups"),
            table_prefix: "t1_".to_string(),
            backup_before_upgrade: false,
        };
        let options = config.engine_options();
        assert_eq!(options.table_prefix, "t1_");
        assert_eq!(options.backup_dir, PathBuf::from("/tmp/backups"));
        assert!(!options.backup_before_upgrade);
    }
}
