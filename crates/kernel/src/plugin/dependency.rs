//! Plugin dependency resolution.
//!
//! Computes the transitive dependency closure of a plugin in install order
//! (dependencies before dependents, following each manifest's declaration
//! order) and detects cycles with a depth-first walk. Closures are cached
//! per plugin key until [`DependencyResolver::invalidate`] is called.

use std::collections::{HashMap, HashSet, VecDeque};

use parking_lot::Mutex;
use serde::Serialize;
use tracing::debug;

use super::error::{PluginError, PluginResult};
use super::status::{PluginRecord, PluginRegistry, PluginStatus};

/// Snapshot of the declared dependency graph.
#[derive(Debug, Clone, Default)]
pub struct DependencyGraph {
    edges: HashMap<String, Vec<String>>,
    status: HashMap<String, PluginStatus>,
}

impl DependencyGraph {
    /// Build a graph from registry rows.
    pub fn from_records(records: &[PluginRecord]) -> Self {
        let mut graph = Self::default();
        for record in records {
            graph.insert(&record.key, record.dependencies.clone(), record.status);
        }
        graph
    }

    /// Add or replace a node.
    pub fn insert(&mut self, key: &str, dependencies: Vec<String>, status: PluginStatus) {
        self.edges.insert(key.to_string(), dependencies);
        self.status.insert(key.to_string(), status);
    }

    pub fn contains(&self, key: &str) -> bool {
        self.edges.contains_key(key)
    }

    pub fn status(&self, key: &str) -> Option<PluginStatus> {
        self.status.get(key).copied()
    }

    fn dependencies(&self, key: &str) -> &[String] {
        self.edges.get(key).map(Vec::as_slice).unwrap_or_default()
    }

    /// Plugins that declare `key` as a direct dependency, sorted.
    pub fn dependents(&self, key: &str) -> Vec<String> {
        let mut dependents: Vec<String> = self
            .edges
            .iter()
            .filter(|(_, deps)| deps.iter().any(|d| d == key))
            .map(|(name, _)| name.clone())
            .collect();
        dependents.sort();
        dependents
    }

    /// Breadth-first expansion of the dependency lists reachable from `key`,
    /// excluding `key` itself. Fails on the first unregistered dependency.
    pub fn closure(&self, key: &str) -> PluginResult<Vec<String>> {
        if !self.contains(key) {
            return Err(PluginError::NotRegistered {
                plugin: key.to_string(),
            });
        }

        let mut seen: HashSet<&str> = HashSet::from([key]);
        let mut queue: VecDeque<&str> = VecDeque::from([key]);
        let mut closure = Vec::new();

        while let Some(current) = queue.pop_front() {
            for dep in self.dependencies(current) {
                if !self.contains(dep) {
                    return Err(PluginError::MissingDependency {
                        plugin: current.to_string(),
                        dependency: dep.clone(),
                    });
                }
                if seen.insert(dep) {
                    closure.push(dep.clone());
                    queue.push_back(dep);
                }
            }
        }

        Ok(closure)
    }

    /// Find a dependency cycle reachable from `key`.
    ///
    /// Returns the cycle as a path that starts and ends on the same plugin.
    /// Unregistered dependencies are treated as leaves.
    pub fn find_cycle(&self, key: &str) -> Option<Vec<String>> {
        let mut walk = CycleWalk::default();
        self.visit(key, &mut walk)
    }

    fn visit<'a>(&'a self, node: &'a str, walk: &mut CycleWalk<'a>) -> Option<Vec<String>> {
        if walk.on_stack.contains(node) {
            let pos = walk.path.iter().position(|n| *n == node)?;
            let mut cycle: Vec<String> = walk.path[pos..].iter().map(|s| s.to_string()).collect();
            cycle.push(node.to_string());
            return Some(cycle);
        }
        if walk.done.contains(node) {
            return None;
        }

        walk.on_stack.insert(node);
        walk.path.push(node);
        for dep in self.dependencies(node) {
            if let Some(cycle) = self.visit(dep, walk) {
                return Some(cycle);
            }
        }
        walk.path.pop();
        walk.on_stack.remove(node);
        walk.done.insert(node);
        None
    }

    /// Install order for `key`: its closure followed by `key` itself.
    ///
    /// Each dependency is placed after everything it depends on; ties keep
    /// the order in which manifests declare them.
    pub fn install_order(&self, key: &str) -> PluginResult<Vec<String>> {
        if let Some(cycle) = self.find_cycle(key) {
            return Err(PluginError::CircularDependency {
                cycle: cycle.join(" -> "),
            });
        }
        // Validates presence of every transitive dependency.
        self.closure(key)?;

        let mut order = Vec::new();
        let mut placed: HashSet<&str> = HashSet::new();
        self.post_order(key, &mut placed, &mut order);
        Ok(order)
    }

    fn post_order<'a>(&'a self, node: &'a str, placed: &mut HashSet<&'a str>, order: &mut Vec<String>) {
        if !placed.insert(node) {
            return;
        }
        for dep in self.dependencies(node) {
            self.post_order(dep, placed, order);
        }
        order.push(node.to_string());
    }

    /// Report closure members that are unregistered or not installed/enabled.
    pub fn check(&self, key: &str) -> DependencyCheck {
        let mut missing = Vec::new();
        let mut seen: HashSet<&str> = HashSet::from([key]);
        let mut queue: VecDeque<&str> = VecDeque::from([key]);

        while let Some(current) = queue.pop_front() {
            for dep in self.dependencies(current) {
                if !seen.insert(dep) {
                    continue;
                }
                match self.status(dep) {
                    Some(status) if status.satisfies_dependency() => {}
                    _ => missing.push(dep.clone()),
                }
                queue.push_back(dep);
            }
        }

        DependencyCheck {
            plugin: key.to_string(),
            satisfied: missing.is_empty(),
            missing,
        }
    }
}

/// DFS state for cycle detection: finished nodes, the current path and its
/// members.
#[derive(Default)]
struct CycleWalk<'a> {
    done: HashSet<&'a str>,
    on_stack: HashSet<&'a str>,
    path: Vec<&'a str>,
}

/// Result of checking whether a plugin's dependencies are usable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DependencyCheck {
    pub plugin: String,
    pub satisfied: bool,
    pub missing: Vec<String>,
}

/// Registry-backed resolver with a per-key closure cache.
pub struct DependencyResolver {
    registry: PluginRegistry,
    cache: Mutex<HashMap<String, Vec<String>>>,
}

impl DependencyResolver {
    pub fn new(registry: PluginRegistry) -> Self {
        Self {
            registry,
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Load the current dependency graph from the registry.
    pub async fn graph(&self) -> PluginResult<DependencyGraph> {
        Ok(DependencyGraph::from_records(&self.registry.list().await?))
    }

    /// Install-ordered closure of `key`, ending with `key`.
    pub async fn resolve(&self, key: &str) -> PluginResult<Vec<String>> {
        if let Some(order) = self.cache.lock().get(key) {
            return Ok(order.clone());
        }

        let order = self.graph().await?.install_order(key)?;
        debug!(plugin = key, order = ?order, "resolved dependency closure");
        self.cache.lock().insert(key.to_string(), order.clone());
        Ok(order)
    }

    /// Whether a cycle is reachable from `key`.
    pub async fn detect_cycle(&self, key: &str) -> PluginResult<bool> {
        Ok(self.graph().await?.find_cycle(key).is_some())
    }

    /// Check dependency availability without failing on unknown keys.
    pub async fn check(&self, key: &str) -> PluginResult<DependencyCheck> {
        Ok(self.graph().await?.check(key))
    }

    /// Drop every cached closure. Call whenever a manifest changes.
    pub fn invalidate(&self) {
        self.cache.lock().clear();
    }

    /// Number of cached closures.
    pub fn cached(&self) -> usize {
        self.cache.lock().len()
    }
}
