//! Plugin kinds.
//!
//! A manifest's `kind` field selects kind-specific behaviour through a
//! lookup table of constructors, populated once when the engine is built.

use std::collections::BTreeMap;

use super::info_parser::{DEFAULT_KIND, PluginInfo};

/// Behaviour attached to a plugin kind.
pub trait PluginKind: Send + Sync {
    /// Name used in manifests.
    fn name(&self) -> &'static str;

    /// Kind-specific manifest rules, checked at discovery.
    fn validate(&self, _info: &PluginInfo) -> Result<(), String> {
        Ok(())
    }

    /// Whether a successful install should leave the plugin enabled.
    fn enable_on_install(&self) -> bool {
        false
    }
}

/// Constructor stored in the kind registry.
pub type KindConstructor = fn() -> Box<dyn PluginKind>;

/// General-purpose plugin.
struct ModuleKind;

impl PluginKind for ModuleKind {
    fn name(&self) -> &'static str {
        DEFAULT_KIND
    }
}

/// Shared building blocks that only exist to serve dependents.
struct LibraryKind;

impl PluginKind for LibraryKind {
    fn name(&self) -> &'static str {
        "library"
    }

    fn enable_on_install(&self) -> bool {
        true
    }
}

/// Authoring content types (novels, anime, music).
struct ContentKind;

impl PluginKind for ContentKind {
    fn name(&self) -> &'static str {
        "content"
    }

    fn validate(&self, info: &PluginInfo) -> Result<(), String> {
        if info.category.is_none() {
            return Err(format!(
                "content plugin '{}' must declare a category",
                info.name
            ));
        }
        Ok(())
    }
}

/// Presentation-only plugins. They own no tables.
struct ThemeKind;

impl PluginKind for ThemeKind {
    fn name(&self) -> &'static str {
        "theme"
    }

    fn validate(&self, info: &PluginInfo) -> Result<(), String> {
        if info.scripts.install.is_some() || info.scripts.upgrade.is_some() {
            return Err(format!(
                "theme '{}' cannot declare install or upgrade scripts",
                info.name
            ));
        }
        Ok(())
    }
}

/// Lookup from kind name to constructor.
pub struct KindRegistry {
    constructors: BTreeMap<&'static str, KindConstructor>,
}

impl KindRegistry {
    /// Empty registry.
    pub fn empty() -> Self {
        Self {
            constructors: BTreeMap::new(),
        }
    }

    /// Registry with the built-in kinds.
    pub fn builtin() -> Self {
        let mut registry = Self::empty();
        registry.register("module", || Box::new(ModuleKind));
        registry.register("library", || Box::new(LibraryKind));
        registry.register("content", || Box::new(ContentKind));
        registry.register("theme", || Box::new(ThemeKind));
        registry
    }

    /// Register (or replace) a kind.
    pub fn register(&mut self, name: &'static str, constructor: KindConstructor) {
        self.constructors.insert(name, constructor);
    }

    /// Instantiate the behaviour for a kind.
    pub fn create(&self, name: &str) -> Option<Box<dyn PluginKind>> {
        self.constructors.get(name).map(|ctor| ctor())
    }

    /// Known kind names, sorted.
    pub fn known(&self) -> Vec<&'static str> {
        self.constructors.keys().copied().collect()
    }

    /// Check a manifest against its kind.
    pub fn validate(&self, info: &PluginInfo) -> Result<(), String> {
        match self.create(&info.kind) {
            Some(kind) => kind.validate(info),
            None => Err(format!(
                "plugin '{}' declares unknown kind '{}'. Known kinds: {}",
                info.name,
                info.kind,
                self.known().join(", ")
            )),
        }
    }

    /// Whether plugins of this kind are enabled straight after install.
    pub fn enable_on_install(&self, kind: &str) -> bool {
        self.create(kind).is_some_and(|k| k.enable_on_install())
    }
}

impl Default for KindRegistry {
    fn default() -> Self {
        Self::builtin()
    }
}
