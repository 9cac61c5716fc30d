//! Module registry
//!
//! The authoritative map of currently loaded module instances. Every other
//! component (and the excluded routing/UI layer) reads module availability
//! from here; only the lazy runtime writes.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;

use tokio::sync::{broadcast, RwLock};
use tracing::{debug, info};
use uuid::Uuid;

use modhost_kernel::HostModule;

/// A live, constructed module instance owned by the registry.
pub struct LoadedModule {
    name: String,
    instance: Arc<dyn HostModule>,
    instance_id: Uuid,
    artifact_path: PathBuf,
    loaded_at: SystemTime,
    /// Per-name registration counter, assigned by the registry. Increments on
    /// every (re)registration so reload produces an observable new identity.
    generation: u64,
}

impl LoadedModule {
    /// Wrap a freshly constructed instance. The generation is assigned when
    /// the registry accepts it.
    pub fn new(name: &str, instance: Arc<dyn HostModule>, artifact_path: PathBuf) -> Self {
        Self {
            name: name.to_string(),
            instance,
            instance_id: Uuid::now_v7(),
            artifact_path,
            loaded_at: SystemTime::now(),
            generation: 0,
        }
    }

    /// Module name (the registry key).
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The constructed module object.
    pub fn instance(&self) -> &Arc<dyn HostModule> {
        &self.instance
    }

    /// Unique id of this particular instance.
    pub fn instance_id(&self) -> Uuid {
        self.instance_id
    }

    /// The artifact the instance was constructed from.
    pub fn artifact_path(&self) -> &Path {
        &self.artifact_path
    }

    /// When the instance was constructed.
    pub fn loaded_at(&self) -> SystemTime {
        self.loaded_at
    }

    /// Registration generation for this name.
    pub fn generation(&self) -> u64 {
        self.generation
    }
}

impl std::fmt::Debug for LoadedModule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoadedModule")
            .field("name", &self.name)
            .field("instance_id", &self.instance_id)
            .field("artifact_path", &self.artifact_path)
            .field("generation", &self.generation)
            .finish_non_exhaustive()
    }
}

/// Registry change notifications consumed by the routing/UI layer.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub enum RegistryEvent {
    /// A module instance became available.
    Registered {
        name: String,
        timestamp: SystemTime,
    },
    /// A module instance was removed.
    Unregistered {
        name: String,
        timestamp: SystemTime,
    },
    /// A module was replaced by a hot reload.
    Changed {
        name: String,
        timestamp: SystemTime,
    },
}

/// Thread-safe registry of loaded modules.
///
/// Reads never block on writes longer than the atomic map swap under the
/// write lock; readers always observe either the previous or the new
/// instance, never a half-constructed one.
pub struct ModuleRegistry {
    modules: Arc<RwLock<HashMap<String, Arc<LoadedModule>>>>,
    /// Monotonic per-name registration counters. Survives unregistration so
    /// a later reload still observes an increment.
    generations: Arc<RwLock<HashMap<String, u64>>>,
    event_tx: broadcast::Sender<RegistryEvent>,
}

impl ModuleRegistry {
    pub fn new() -> Self {
        let (event_tx, _) = broadcast::channel(1024);
        Self {
            modules: Arc::new(RwLock::new(HashMap::new())),
            generations: Arc::new(RwLock::new(HashMap::new())),
            event_tx,
        }
    }

    /// Subscribe to registry events. Delivery is best-effort: lagging
    /// subscribers miss events rather than blocking writers.
    pub fn subscribe(&self) -> broadcast::Receiver<RegistryEvent> {
        self.event_tx.subscribe()
    }

    /// Register a module instance, overwriting any previous instance for the
    /// same name (this is what makes reload atomic for readers).
    pub async fn register(&self, mut module: LoadedModule) -> Arc<LoadedModule> {
        let name = module.name().to_string();

        {
            let mut generations = self.generations.write().await;
            let generation = generations.entry(name.clone()).or_insert(0);
            *generation += 1;
            module.generation = *generation;
        }

        info!(
            module = %name,
            generation = module.generation,
            "Registering module"
        );

        let module = Arc::new(module);
        {
            let mut modules = self.modules.write().await;
            modules.insert(name.clone(), module.clone());
        }

        let _ = self.event_tx.send(RegistryEvent::Registered {
            name,
            timestamp: SystemTime::now(),
        });

        module
    }

    /// Remove a module instance; no-op if absent.
    pub async fn unregister(&self, name: &str) -> Option<Arc<LoadedModule>> {
        let removed = {
            let mut modules = self.modules.write().await;
            modules.remove(name)
        };

        if removed.is_some() {
            info!(module = %name, "Unregistered module");
            let _ = self.event_tx.send(RegistryEvent::Unregistered {
                name: name.to_string(),
                timestamp: SystemTime::now(),
            });
        } else {
            debug!(module = %name, "Unregister of absent module ignored");
        }

        removed
    }

    /// Announce that a module was replaced by a hot reload.
    pub fn notify_changed(&self, name: &str) {
        let _ = self.event_tx.send(RegistryEvent::Changed {
            name: name.to_string(),
            timestamp: SystemTime::now(),
        });
    }

    /// Get the loaded instance for a name.
    pub async fn get(&self, name: &str) -> Option<Arc<LoadedModule>> {
        let modules = self.modules.read().await;
        modules.get(name).cloned()
    }

    /// All loaded modules ordered by their identity priority.
    pub async fn get_all(&self) -> Vec<Arc<LoadedModule>> {
        let modules = self.modules.read().await;
        let mut all: Vec<Arc<LoadedModule>> = modules.values().cloned().collect();
        all.sort_by_key(|m| m.instance().identity().order);
        all
    }

    /// Loaded modules in a given category.
    pub async fn get_by_category(&self, category: &str) -> Vec<Arc<LoadedModule>> {
        let mut matching: Vec<Arc<LoadedModule>> = {
            let modules = self.modules.read().await;
            modules
                .values()
                .filter(|m| m.instance().identity().category == category)
                .cloned()
                .collect()
        };
        matching.sort_by_key(|m| m.instance().identity().order);
        matching
    }

    /// Whether an instance is registered under the name.
    pub async fn is_registered(&self, name: &str) -> bool {
        let modules = self.modules.read().await;
        modules.contains_key(name)
    }

    /// Number of loaded modules.
    pub async fn len(&self) -> usize {
        let modules = self.modules.read().await;
        modules.len()
    }

    /// Whether no modules are loaded.
    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

impl Default for ModuleRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use modhost_kernel::{HostContext, ModuleIdentity, ModuleResult};
    use std::any::Any;

    struct FakeModule {
        identity: ModuleIdentity,
    }

    impl FakeModule {
        fn shared(name: &str, category: &str, order: i32) -> Arc<dyn HostModule> {
            Arc::new(Self {
                identity: ModuleIdentity::new(name)
                    .with_category(category)
                    .with_order(order),
            })
        }
    }

    #[async_trait::async_trait]
    impl HostModule for FakeModule {
        fn identity(&self) -> &ModuleIdentity {
            &self.identity
        }

        async fn initialize(&self, _ctx: &HostContext) -> ModuleResult<()> {
            Ok(())
        }

        async fn activate(&self) -> ModuleResult<()> {
            Ok(())
        }

        async fn deactivate(&self) -> ModuleResult<()> {
            Ok(())
        }

        fn as_any(&self) -> &dyn Any {
            self
        }
    }

    fn loaded(name: &str, category: &str, order: i32) -> LoadedModule {
        LoadedModule::new(
            name,
            FakeModule::shared(name, category, order),
            PathBuf::from(format!("/opt/modules/{name}.so")),
        )
    }

    #[tokio::test]
    async fn test_register_get_unregister() {
        let registry = ModuleRegistry::new();

        registry.register(loaded("reports", "ui", 10)).await;
        assert!(registry.is_registered("reports").await);
        assert_eq!(registry.len().await, 1);

        let module = registry.get("reports").await.unwrap();
        assert_eq!(module.name(), "reports");
        assert_eq!(module.generation(), 1);

        registry.unregister("reports").await;
        assert!(!registry.is_registered("reports").await);
        assert!(registry.get("reports").await.is_none());

        // Unregister of an absent name is a no-op.
        assert!(registry.unregister("reports").await.is_none());
    }

    #[tokio::test]
    async fn test_overwrite_bumps_generation() {
        let registry = ModuleRegistry::new();

        let first = registry.register(loaded("reports", "ui", 10)).await;
        let second = registry.register(loaded("reports", "ui", 10)).await;

        assert_eq!(first.generation(), 1);
        assert_eq!(second.generation(), 2);
        assert_ne!(first.instance_id(), second.instance_id());

        // Only the new instance is visible.
        let current = registry.get("reports").await.unwrap();
        assert_eq!(current.instance_id(), second.instance_id());
        assert_eq!(registry.len().await, 1);
    }

    #[tokio::test]
    async fn test_generation_survives_unregister() {
        let registry = ModuleRegistry::new();

        registry.register(loaded("reports", "ui", 10)).await;
        registry.unregister("reports").await;
        let again = registry.register(loaded("reports", "ui", 10)).await;
        assert_eq!(again.generation(), 2);
    }

    #[tokio::test]
    async fn test_get_all_ordered_and_by_category() {
        let registry = ModuleRegistry::new();
        registry.register(loaded("late", "ui", 900)).await;
        registry.register(loaded("early", "ui", 5)).await;
        registry.register(loaded("storage", "infra", 50)).await;

        let names: Vec<String> = registry
            .get_all()
            .await
            .iter()
            .map(|m| m.name().to_string())
            .collect();
        assert_eq!(names, vec!["early", "storage", "late"]);

        let ui: Vec<String> = registry
            .get_by_category("ui")
            .await
            .iter()
            .map(|m| m.name().to_string())
            .collect();
        assert_eq!(ui, vec!["early", "late"]);
    }

    #[tokio::test]
    async fn test_events() {
        let registry = ModuleRegistry::new();
        let mut events = registry.subscribe();

        registry.register(loaded("reports", "ui", 10)).await;
        registry.unregister("reports").await;
        registry.notify_changed("reports");

        assert!(matches!(
            events.recv().await.unwrap(),
            RegistryEvent::Registered { name, .. } if name == "reports"
        ));
        assert!(matches!(
            events.recv().await.unwrap(),
            RegistryEvent::Unregistered { name, .. } if name == "reports"
        ));
        assert!(matches!(
            events.recv().await.unwrap(),
            RegistryEvent::Changed { name, .. } if name == "reports"
        ));
    }
}
