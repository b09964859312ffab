//! Parser for plugin `.info.toml` manifest files.
//!
//! Each plugin directory holds exactly one `{name}.info.toml` file that
//! declares:
//! - name (the stable plugin key), version, display name, description
//! - kind and category
//! - dependencies (other plugin keys, in install order)
//! - install/upgrade/uninstall script paths, relative to the plugin directory

use std::path::{Component, Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::error::{PluginError, PluginResult};
use super::version::parse_version;

/// Kind assumed when a manifest does not declare one.
pub const DEFAULT_KIND: &str = "module";

/// Plugin metadata parsed from `.info.toml`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PluginInfo {
    /// Plugin key (must be unique across the deployment).
    pub name: String,

    /// Human-readable name, defaults to the key.
    pub display_name: String,

    /// Version string (e.g., "1.0.0").
    pub version: String,

    /// Human-readable description.
    pub description: String,

    /// Plugin kind, resolved through the kind registry.
    pub kind: String,

    /// Free-form category label (e.g., "novel", "music").
    pub category: Option<String>,

    /// Other plugins this one depends on, in declaration order.
    pub dependencies: Vec<String>,

    /// Lifecycle scripts.
    pub scripts: ScriptConfig,
}

/// Script paths declared under `[scripts]`, relative to the plugin directory.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct ScriptConfig {
    #[serde(default)]
    pub install: Option<String>,

    #[serde(default)]
    pub upgrade: Option<String>,

    #[serde(default)]
    pub uninstall: Option<String>,
}

impl ScriptConfig {
    /// Resolve declared scripts against the plugin directory.
    pub fn resolve(&self, plugin_dir: &Path) -> ScriptPaths {
        ScriptPaths {
            install: self.install.as_ref().map(|p| plugin_dir.join(p)),
            upgrade: self.upgrade.as_ref().map(|p| plugin_dir.join(p)),
            uninstall: self.uninstall.as_ref().map(|p| plugin_dir.join(p)),
        }
    }

    fn iter(&self) -> impl Iterator<Item = (&'static str, &String)> {
        [
            ("scripts.install", self.install.as_ref()),
            ("scripts.upgrade", self.upgrade.as_ref()),
            ("scripts.uninstall", self.uninstall.as_ref()),
        ]
        .into_iter()
        .filter_map(|(field, value)| value.map(|v| (field, v)))
    }
}

/// Absolute script locations for a registered plugin.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ScriptPaths {
    pub install: Option<PathBuf>,
    pub upgrade: Option<PathBuf>,
    pub uninstall: Option<PathBuf>,
}

/// On-disk shape of the manifest. Identity fields are optional here so
/// that a missing field can be told apart from malformed TOML.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawManifest {
    name: Option<String>,
    version: Option<String>,
    #[serde(default)]
    display_name: Option<String>,
    #[serde(default)]
    description: String,
    #[serde(default)]
    kind: Option<String>,
    #[serde(default)]
    category: Option<String>,
    #[serde(default)]
    dependencies: Vec<String>,
    #[serde(default)]
    scripts: ScriptConfig,
}

impl PluginInfo {
    /// Locate and parse the manifest inside a plugin directory.
    pub fn from_dir(plugin_dir: &Path) -> PluginResult<Self> {
        let path = find_manifest(plugin_dir)?;
        Self::parse(&path)
    }

    /// Parse a plugin info file from the given path.
    pub fn parse(path: &Path) -> PluginResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            PluginError::invalid_manifest(path.display().to_string(), format!("unreadable: {e}"))
        })?;

        Self::parse_str(&content, path)
    }

    /// Parse plugin info from a TOML string.
    pub fn parse_str(content: &str, path: &Path) -> PluginResult<Self> {
        let location = path.display().to_string();
        let raw: RawManifest = toml::from_str(content)
            .map_err(|e| PluginError::invalid_manifest(&location, e.message()))?;

        let name = required(raw.name, "name", &location)?;
        let version = required(raw.version, "version", &location)?;

        let info = PluginInfo {
            display_name: raw
                .display_name
                .filter(|d| !d.trim().is_empty())
                .unwrap_or_else(|| name.clone()),
            name,
            version,
            description: raw.description,
            kind: raw.kind.unwrap_or_else(|| DEFAULT_KIND.to_string()),
            category: raw.category.filter(|c| !c.trim().is_empty()),
            dependencies: raw.dependencies,
            scripts: raw.scripts,
        };

        info.validate(&location)?;
        Ok(info)
    }

    /// Validate the parsed plugin info.
    fn validate(&self, location: &str) -> PluginResult<()> {
        if !is_valid_key(&self.name) {
            return Err(PluginError::invalid_manifest(
                location,
                format!(
                    "name '{}' may only contain lowercase letters, digits and underscores",
                    self.name
                ),
            ));
        }

        parse_version(&self.version)
            .map_err(|e| PluginError::invalid_manifest(location, e.to_string()))?;

        for dep in &self.dependencies {
            if dep == &self.name {
                return Err(PluginError::invalid_manifest(
                    location,
                    format!("plugin '{}' lists itself as a dependency", self.name),
                ));
            }
            if !is_valid_key(dep) {
                return Err(PluginError::invalid_manifest(
                    location,
                    format!("dependency '{dep}' is not a valid plugin key"),
                ));
            }
        }

        for (field, script) in self.scripts.iter() {
            validate_path_safety(script, field)
                .map_err(|details| PluginError::invalid_manifest(location, details))?;
        }

        Ok(())
    }
}

fn required(value: Option<String>, field: &str, location: &str) -> PluginResult<String> {
    match value {
        Some(v) if !v.trim().is_empty() => Ok(v.trim().to_string()),
        _ => Err(PluginError::ManifestIncomplete {
            path: location.to_string(),
            field: field.to_string(),
        }),
    }
}

/// Plugin keys double as table-name fragments, so keep them conservative.
fn is_valid_key(key: &str) -> bool {
    !key.is_empty()
        && key
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
}

/// Reject absolute paths and any `..` component.
fn validate_path_safety(value: &str, field: &str) -> Result<(), String> {
    let path = Path::new(value);
    if path.is_absolute() {
        return Err(format!("{field} must be relative, got '{value}'"));
    }
    if path
        .components()
        .any(|c| matches!(c, Component::ParentDir | Component::RootDir | Component::Prefix(_)))
    {
        return Err(format!("{field} must stay inside the plugin directory, got '{value}'"));
    }
    Ok(())
}

/// Find the single `.info.toml` file in a plugin directory.
pub fn find_manifest(plugin_dir: &Path) -> PluginResult<PathBuf> {
    let entries = std::fs::read_dir(plugin_dir).map_err(|_| PluginError::ManifestMissing {
        path: plugin_dir.display().to_string(),
    })?;

    let mut manifests: Vec<PathBuf> = entries
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| {
            p.is_file()
                && p.file_name()
                    .and_then(|n| n.to_str())
                    .is_some_and(|n| n.ends_with(".info.toml"))
        })
        .collect();

    match manifests.len() {
        0 => Err(PluginError::ManifestMissing {
            path: plugin_dir.display().to_string(),
        }),
        1 => Ok(manifests.remove(0)),
        _ => Err(PluginError::invalid_manifest(
            plugin_dir.display().to_string(),
            "multiple .info.toml files found, expected exactly one",
        )),
    }
}

/// A manifest found on disk together with its plugin directory.
#[derive(Debug, Clone)]
pub struct DiscoveredPlugin {
    pub info: PluginInfo,
    pub dir: PathBuf,
}

/// Result of scanning a plugins root.
#[derive(Debug, Default)]
pub struct Discovery {
    pub plugins: Vec<DiscoveredPlugin>,
    pub errors: Vec<(PathBuf, PluginError)>,
}

/// Scan every immediate subdirectory of `root` for a plugin manifest.
///
/// Directories are visited in sorted order. A directory whose manifest
/// fails to parse is reported in `errors` and does not stop the scan.
/// A missing root yields an empty discovery.
pub fn discover_plugins(root: &Path) -> Discovery {
    let mut discovery = Discovery::default();

    let entries = match std::fs::read_dir(root) {
        Ok(entries) => entries,
        Err(_) => {
            info!(root = %root.display(), "plugins directory does not exist, skipping");
            return discovery;
        }
    };

    let mut dirs: Vec<PathBuf> = entries
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| p.is_dir())
        .collect();
    dirs.sort();

    for dir in dirs {
        match PluginInfo::from_dir(&dir) {
            Ok(info) => {
                debug!(plugin = %info.name, version = %info.version, "found manifest");
                discovery.plugins.push(DiscoveredPlugin { info, dir });
            }
            Err(e) => {
                warn!(plugin_dir = %dir.display(), error = %e, "skipping plugin directory");
                discovery.errors.push((dir, e));
            }
        }
    }

    discovery
}
