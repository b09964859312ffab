//! Atelier plugin administration tool.
//!
//! Discovers, installs, upgrades, backs up and repairs plugins against the
//! configured database.

use std::path::PathBuf;

use anyhow::{Context, Result};
use atelier_kernel::config::Config;
use atelier_kernel::db;
use atelier_kernel::plugin::{PluginManager, cli};
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

/// Atelier plugin lifecycle and migration engine.
#[derive(Parser, Debug)]
#[command(name = "atelier", author, version, about, long_about = None)]
struct Args {
    /// Plugins directory (overrides PLUGINS_DIR).
    #[arg(long, global = true)]
    plugins_dir: Option<PathBuf>,

    /// Print single-plugin results as JSON.
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List registered plugins.
    List,
    /// Scan the plugins directory and register manifests.
    Discover,
    /// Install one plugin.
    Install { key: String },
    /// Install every discovered plugin in dependency order.
    InstallAll,
    /// Uninstall one plugin.
    Uninstall { key: String },
    /// Enable an installed plugin.
    Enable { key: String },
    /// Disable an enabled plugin.
    Disable { key: String },
    /// Show the install order and dependency status of a plugin.
    Deps { key: String },
    /// Upgrade plugins whose manifest carries a newer version.
    Upgrade {
        /// Only report available upgrades.
        #[arg(long)]
        check: bool,
    },
    /// Audit registered tables against the database.
    Health,
    /// Recreate missing tables for one plugin, or all plugins with issues.
    Repair { key: Option<String> },
    /// Drop registrations whose table no longer exists.
    CleanupOrphans,
    /// Back up one plugin, or every installed plugin.
    Backup { key: Option<String> },
    /// Restore a backup file.
    Restore { file: PathBuf },
    /// Show the migration history of a plugin.
    History { key: String },
    /// Discover, upgrade, audit and repair in one run.
    Maintain,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present
    dotenvy::dotenv().ok();

    init_tracing();

    let args = Args::parse();

    let mut config = Config::from_env().context("failed to load configuration")?;
    if let Some(dir) = args.plugins_dir {
        config.plugins_dir = dir;
    }
    info!(
        plugins_dir = %config.plugins_dir.display(),
        prefix = %config.table_prefix,
        "configuration loaded"
    );

    let pool = db::create_pool(&config).await?;
    if !db::check_health(&pool).await {
        anyhow::bail!("database at {} is not responding", config.database_url);
    }
    let manager = PluginManager::new(pool, config.engine_options())
        .await
        .context("failed to initialise plugin engine")?;

    let plugins_dir = config.plugins_dir.as_path();
    let json = args.json;

    match args.command {
        Command::List => cli::cmd_list(&manager).await,
        Command::Discover => cli::cmd_discover(&manager, plugins_dir).await,
        Command::Install { key } => cli::cmd_install(&manager, &key, json).await,
        Command::InstallAll => cli::cmd_install_all(&manager).await,
        Command::Uninstall { key } => cli::cmd_uninstall(&manager, &key, json).await,
        Command::Enable { key } => cli::cmd_enable(&manager, &key, json).await,
        Command::Disable { key } => cli::cmd_disable(&manager, &key, json).await,
        Command::Deps { key } => cli::cmd_deps(&manager, &key).await,
        Command::Upgrade { check } => cli::cmd_upgrade(&manager, check).await,
        Command::Health => cli::cmd_health(&manager).await,
        Command::Repair { key } => cli::cmd_repair(&manager, key.as_deref(), json).await,
        Command::CleanupOrphans => cli::cmd_cleanup_orphans(&manager).await,
        Command::Backup { key } => cli::cmd_backup(&manager, key.as_deref(), json).await,
        Command::Restore { file } => cli::cmd_restore(&manager, &file, json).await,
        Command::History { key } => cli::cmd_history(&manager, &key).await,
        Command::Maintain => cli::cmd_maintain(&manager, plugins_dir).await,
    }
}

/// Initialize tracing subscriber with environment filter.
fn init_tracing() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,sqlx=warn"));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}
