//! Module descriptor store
//!
//! Parses the declarative module manifest into typed descriptors. The store
//! is built once at startup and read-only afterwards.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use crate::error::RuntimeError;

/// Modules with a load order below this threshold are "core": they are never
/// evicted by the inactivity sweep.
pub const CORE_PRIORITY_THRESHOLD: i32 = 100;

fn default_enabled() -> bool {
    true
}

fn default_load_order() -> i32 {
    1000
}

/// Static, declarative configuration describing how to find and load one
/// module. Immutable after parse.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModuleDescriptor {
    /// Unique module name (the registry key).
    pub name: String,
    /// Human-readable display name.
    #[serde(default)]
    pub display_name: String,
    /// Free-form description.
    #[serde(default)]
    pub description: String,
    /// Path to the module artifact.
    pub artifact: PathBuf,
    /// Entry-point identifier (the exported constructor symbol).
    pub entry_point: String,
    /// Declared version string.
    #[serde(default)]
    pub version: String,
    /// Module author.
    #[serde(default)]
    pub author: Option<String>,
    /// Category used for grouped discovery.
    #[serde(default)]
    pub category: String,
    /// Icon identifier for the host UI.
    #[serde(default)]
    pub icon: Option<String>,
    /// Whether the module may be loaded at all.
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Load-order priority; values below [`CORE_PRIORITY_THRESHOLD`] mark the
    /// module as core.
    #[serde(default = "default_load_order")]
    pub load_order: i32,
    /// Names of modules that must be loaded first.
    #[serde(default)]
    pub dependencies: Vec<String>,
    /// Role required to access the module's surface (consumed by the
    /// excluded auth layer, carried through untouched).
    #[serde(default)]
    pub required_role: Option<String>,
    /// Free-form configuration map handed to the module.
    #[serde(default)]
    pub settings: HashMap<String, serde_json::Value>,
}

impl ModuleDescriptor {
    /// Whether the module's priority marks it as core.
    pub fn is_core(&self) -> bool {
        self.load_order < CORE_PRIORITY_THRESHOLD
    }
}

/// The manifest document: the list of configured modules.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ModuleManifest {
    /// Configured modules.
    #[serde(default)]
    pub modules: Vec<ModuleDescriptor>,
}

/// Read-only store of parsed module descriptors, keyed by name.
#[derive(Debug, Default)]
pub struct DescriptorStore {
    descriptors: HashMap<String, ModuleDescriptor>,
}

impl DescriptorStore {
    /// Build a store from an already-parsed descriptor list.
    pub fn from_descriptors(descriptors: Vec<ModuleDescriptor>) -> Self {
        let descriptors = descriptors
            .into_iter()
            .map(|d| (d.name.clone(), d))
            .collect();
        Self { descriptors }
    }

    /// Parse a manifest document. Malformed input is a fatal
    /// [`RuntimeError::Configuration`].
    pub fn parse(source: &str) -> Result<Self, RuntimeError> {
        let manifest: ModuleManifest = serde_json::from_str(source)
            .map_err(|e| RuntimeError::Configuration(format!("invalid module manifest: {e}")))?;

        info!(modules = manifest.modules.len(), "Parsed module manifest");
        Ok(Self::from_descriptors(manifest.modules))
    }

    /// Load a manifest from disk. A missing or unreadable manifest degrades
    /// to an empty store; only a malformed document fails startup.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, RuntimeError> {
        let path = path.as_ref();
        match std::fs::read_to_string(path) {
            Ok(source) => Self::parse(&source),
            Err(e) => {
                warn!(?path, error = %e, "Module manifest unreadable, no modules configured");
                Ok(Self::default())
            }
        }
    }

    /// Look up a descriptor by module name.
    pub fn get(&self, name: &str) -> Option<&ModuleDescriptor> {
        self.descriptors.get(name)
    }

    /// Whether a descriptor exists for the name.
    pub fn contains(&self, name: &str) -> bool {
        self.descriptors.contains_key(name)
    }

    /// Number of configured modules.
    pub fn len(&self) -> usize {
        self.descriptors.len()
    }

    /// Whether the store is empty.
    pub fn is_empty(&self) -> bool {
        self.descriptors.is_empty()
    }

    /// All descriptors ordered by load-order priority.
    pub fn all(&self) -> Vec<&ModuleDescriptor> {
        let mut all: Vec<&ModuleDescriptor> = self.descriptors.values().collect();
        all.sort_by_key(|d| d.load_order);
        all
    }

    /// Names of all enabled core modules.
    pub fn core_names(&self) -> Vec<String> {
        self.all()
            .into_iter()
            .filter(|d| d.enabled && d.is_core())
            .map(|d| d.name.clone())
            .collect()
    }

    /// Names of all enabled modules.
    pub fn enabled_names(&self) -> Vec<String> {
        self.all()
            .into_iter()
            .filter(|d| d.enabled)
            .map(|d| d.name.clone())
            .collect()
    }

    /// Walk the declared dependency graph from `name` and return the chain of
    /// a circular dependency if one is reachable.
    ///
    /// The check runs on the immutable descriptor graph before any lock is
    /// taken, so per-module lock acquisition always follows the edges of a
    /// DAG and cannot deadlock across tasks.
    pub fn find_cycle(&self, name: &str) -> Option<Vec<String>> {
        let mut chain = Vec::new();
        self.find_cycle_from(name, &mut chain)
    }

    fn find_cycle_from(&self, name: &str, chain: &mut Vec<String>) -> Option<Vec<String>> {
        if chain.iter().any(|n| n == name) {
            let mut cycle = chain.clone();
            cycle.push(name.to_string());
            return Some(cycle);
        }

        let Some(descriptor) = self.descriptors.get(name) else {
            // Missing dependencies fail the load elsewhere.
            return None;
        };

        chain.push(name.to_string());
        for dep in &descriptor.dependencies {
            if let Some(cycle) = self.find_cycle_from(dep, chain) {
                return Some(cycle);
            }
        }
        chain.pop();

        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptor(name: &str, deps: &[&str]) -> ModuleDescriptor {
        ModuleDescriptor {
            name: name.to_string(),
            display_name: name.to_string(),
            description: String::new(),
            artifact: PathBuf::from(format!("/opt/modules/{name}.so")),
            entry_point: "_module_create".to_string(),
            version: "1.0.0".to_string(),
            author: None,
            category: "general".to_string(),
            icon: None,
            enabled: true,
            load_order: 1000,
            dependencies: deps.iter().map(|d| d.to_string()).collect(),
            required_role: None,
            settings: HashMap::new(),
        }
    }

    #[test]
    fn test_parse_manifest() {
        let source = r#"{
            "modules": [
                {
                    "name": "analytics",
                    "display_name": "Analytics",
                    "description": "Aggregated usage analytics",
                    "artifact": "/opt/modules/analytics.so",
                    "entry_point": "_module_create",
                    "version": "1.2.0",
                    "author": "Platform Team",
                    "category": "reporting",
                    "icon": "chart",
                    "enabled": true,
                    "load_order": 10,
                    "dependencies": ["storage"],
                    "required_role": "analyst",
                    "settings": { "retention_days": 30 }
                },
                {
                    "name": "storage",
                    "artifact": "/opt/modules/storage.so",
                    "entry_point": "_module_create"
                }
            ]
        }"#;

        let store = DescriptorStore::parse(source).unwrap();
        assert_eq!(store.len(), 2);

        let analytics = store.get("analytics").unwrap();
        assert_eq!(analytics.version, "1.2.0");
        assert_eq!(analytics.dependencies, vec!["storage".to_string()]);
        assert_eq!(analytics.required_role.as_deref(), Some("analyst"));
        assert!(analytics.is_core());

        // Defaults kick in for omitted fields.
        let storage = store.get("storage").unwrap();
        assert!(storage.enabled);
        assert_eq!(storage.load_order, 1000);
        assert!(!storage.is_core());
    }

    #[test]
    fn test_parse_malformed_manifest_is_fatal() {
        let err = DescriptorStore::parse("{ not json").unwrap_err();
        assert!(matches!(err, RuntimeError::Configuration(_)));
    }

    #[test]
    fn test_load_missing_manifest_degrades_to_empty() {
        let store = DescriptorStore::load("/nonexistent/modules.json").unwrap();
        assert!(store.is_empty());
    }

    #[test]
    fn test_all_ordered_by_priority() {
        let mut low = descriptor("low", &[]);
        low.load_order = 5;
        let mut mid = descriptor("mid", &[]);
        mid.load_order = 50;
        let mut off = descriptor("off", &[]);
        off.load_order = 10;
        off.enabled = false;
        let high = descriptor("high", &[]);

        let store = DescriptorStore::from_descriptors(vec![high, low, off, mid]);
        let names: Vec<&str> = store.all().iter().map(|d| d.name.as_str()).collect();
        assert_eq!(names, vec!["low", "off", "mid", "high"]);

        // A disabled module is never a preload candidate, core or not.
        assert_eq!(store.core_names(), vec!["low", "mid"]);
        assert_eq!(store.enabled_names(), vec!["low", "mid", "high"]);
    }

    #[test]
    fn test_find_cycle() {
        let store = DescriptorStore::from_descriptors(vec![
            descriptor("a", &["b"]),
            descriptor("b", &["c"]),
            descriptor("c", &["a"]),
        ]);

        let cycle = store.find_cycle("a").unwrap();
        assert_eq!(cycle.first().map(String::as_str), Some("a"));
        assert_eq!(cycle.last().map(String::as_str), Some("a"));

        // An acyclic chain reports no cycle.
        let dag = DescriptorStore::from_descriptors(vec![
            descriptor("a", &["b"]),
            descriptor("b", &["c"]),
            descriptor("c", &[]),
        ]);
        assert!(dag.find_cycle("a").is_none());

        // Self-dependency is the smallest cycle.
        let selfy = DescriptorStore::from_descriptors(vec![descriptor("x", &["x"])]);
        assert!(selfy.find_cycle("x").is_some());
    }
}
