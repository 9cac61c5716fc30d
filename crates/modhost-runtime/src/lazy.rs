//! Lazy module runtime
//!
//! Owns loading policy: on-demand loading with recursive dependency
//! resolution, per-module concurrency exclusion, status tracking, preload
//! strategies, and idle eviction. Construction is delegated to the
//! [`ModuleLoader`], registration to the [`ModuleRegistry`].

use std::collections::HashMap;
use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use tokio::sync::{mpsc, Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::descriptor::DescriptorStore;
use crate::loader::ModuleLoader;
use crate::registry::{LoadedModule, ModuleRegistry};

/// Lifecycle state of a module record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum ModuleState {
    /// No descriptor exists for the name; terminal.
    NotConfigured,
    /// Configured but not currently loaded.
    NotLoaded,
    /// A load attempt is in flight.
    Loading,
    /// A live instance is registered.
    Loaded,
    /// A teardown is in flight.
    Unloading,
    /// The last load or unload attempt failed; a fresh load may retry.
    Error,
}

/// The mutable runtime status tracked per module name. Records persist
/// across load/unload/reload cycles.
#[derive(Debug, Clone)]
pub struct ModuleStatus {
    /// Module name.
    pub name: String,
    /// Current lifecycle state.
    pub state: ModuleState,
    /// Message from the most recent failure, if any.
    pub last_error: Option<String>,
    /// When the state last changed.
    pub state_changed_at: SystemTime,
    /// When the module was last requested; `None` until first load.
    pub last_access: Option<Instant>,
    /// Whether the module is core (exempt from idle eviction).
    pub is_core: bool,
    /// Load-order priority.
    pub priority: i32,
}

impl ModuleStatus {
    fn new(name: &str, state: ModuleState, is_core: bool, priority: i32) -> Self {
        Self {
            name: name.to_string(),
            state,
            last_error: None,
            state_changed_at: SystemTime::now(),
            last_access: None,
            is_core,
            priority,
        }
    }

    fn not_configured(name: &str) -> Self {
        Self::new(name, ModuleState::NotConfigured, false, i32::MAX)
    }

    fn set_state(&mut self, state: ModuleState, error: Option<String>) {
        debug!(
            module = %self.name,
            from = ?self.state,
            to = ?state,
            "Module state transition"
        );
        self.state = state;
        self.last_error = error;
        self.state_changed_at = SystemTime::now();
    }
}

/// Lightweight cached view of a loaded module, kept with a fixed TTL for
/// fast lookups that don't need the instance itself.
#[derive(Debug, Clone)]
pub struct ModuleMetadata {
    pub name: String,
    pub version: String,
    pub loaded_at: SystemTime,
    pub artifact_path: PathBuf,
}

/// Loading strategy for modules not yet requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[non_exhaustive]
pub enum LoadingStrategy {
    /// No eager work; everything loads on first request.
    #[default]
    OnDemand,
    /// Preload every core module in the background.
    PreloadCore,
    /// Preload every enabled module in the background.
    PreloadAll,
}

/// Runtime tuning knobs.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Upper bound on one construction attempt (artifact resolution plus the
    /// module's own initialization hook).
    pub load_timeout: Duration,
    /// How long cached module metadata stays fresh.
    pub metadata_ttl: Duration,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            load_timeout: Duration::from_secs(30),
            metadata_ttl: Duration::from_secs(60),
        }
    }
}

impl RuntimeConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the per-attempt load timeout.
    pub fn with_load_timeout(mut self, timeout: Duration) -> Self {
        self.load_timeout = timeout;
        self
    }

    /// Set the metadata cache TTL.
    pub fn with_metadata_ttl(mut self, ttl: Duration) -> Self {
        self.metadata_ttl = ttl;
        self
    }
}

/// Handle for the background inactivity sweeper; shutdown is cooperative.
pub struct SweeperHandle {
    shutdown_tx: mpsc::Sender<()>,
    task: tokio::task::JoinHandle<()>,
}

impl SweeperHandle {
    /// Signal the sweeper and wait for it to exit.
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(()).await;
        let _ = self.task.await;
    }
}

/// The orchestration core of the module runtime.
///
/// Concurrency is scoped per module name: a lazily-created `Mutex` per name
/// guarantees at most one in-flight construction per module while unrelated
/// modules load fully in parallel. All status mutations go through this type.
pub struct LazyModuleRuntime {
    store: Arc<DescriptorStore>,
    registry: Arc<ModuleRegistry>,
    loader: Arc<ModuleLoader>,
    config: RuntimeConfig,
    /// Status records, one per known name. Never removed.
    records: RwLock<HashMap<String, ModuleStatus>>,
    /// Per-module exclusion locks, created on first use.
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
    strategy: RwLock<LoadingStrategy>,
    /// TTL metadata cache: value plus the instant it was cached.
    metadata: RwLock<HashMap<String, (ModuleMetadata, Instant)>>,
}

impl LazyModuleRuntime {
    pub fn new(
        store: Arc<DescriptorStore>,
        registry: Arc<ModuleRegistry>,
        loader: Arc<ModuleLoader>,
        config: RuntimeConfig,
    ) -> Self {
        let records = store
            .all()
            .into_iter()
            .map(|d| {
                (
                    d.name.clone(),
                    ModuleStatus::new(&d.name, ModuleState::NotLoaded, d.is_core(), d.load_order),
                )
            })
            .collect();

        Self {
            store,
            registry,
            loader,
            config,
            records: RwLock::new(records),
            locks: Mutex::new(HashMap::new()),
            strategy: RwLock::new(LoadingStrategy::default()),
            metadata: RwLock::new(HashMap::new()),
        }
    }

    /// The registry this runtime writes to.
    pub fn registry(&self) -> Arc<ModuleRegistry> {
        self.registry.clone()
    }

    /// The descriptor store this runtime reads from.
    pub fn store(&self) -> Arc<DescriptorStore> {
        self.store.clone()
    }

    /// Load a module on demand, resolving its declared dependencies first.
    ///
    /// Never returns an error: failures are recorded on the module's status
    /// record and surfaced as `None`. May block while waiting on the
    /// per-module lock and while the module's own initialization runs, so
    /// callers must tolerate a slow call.
    pub async fn load_on_demand(&self, name: &str) -> Option<Arc<LoadedModule>> {
        self.load_recursive(name).await
    }

    fn load_recursive<'a>(
        &'a self,
        name: &'a str,
    ) -> Pin<Box<dyn Future<Output = Option<Arc<LoadedModule>>> + Send + 'a>> {
        Box::pin(async move {
            // Fast path: already live, no lock taken.
            if let Some(module) = self.registry.get(name).await {
                self.touch(name).await;
                return Some(module);
            }

            let arrived = SystemTime::now();
            let lock = self.module_lock(name).await;
            let _guard = lock.lock().await;

            // Double-checked: a concurrent caller may have completed the load
            // while we waited on the lock.
            if let Some(module) = self.registry.get(name).await {
                self.touch(name).await;
                return Some(module);
            }

            // Converge on a failure too: if the attempt we queued behind
            // already failed, report it instead of constructing again. A
            // fresh call arriving after the failure still retries.
            {
                let records = self.records.read().await;
                if let Some(record) = records.get(name) {
                    if record.state == ModuleState::Error && record.state_changed_at > arrived {
                        debug!(module = %name, "Joining failed load attempt");
                        return None;
                    }
                }
            }

            self.load_locked(name).await
        })
    }

    /// The load path proper; the caller holds this module's lock.
    async fn load_locked(&self, name: &str) -> Option<Arc<LoadedModule>> {
        self.set_state(name, ModuleState::Loading, None).await;

        let Some(descriptor) = self.store.get(name) else {
            warn!(module = %name, "Load requested for unconfigured module");
            self.set_state(
                name,
                ModuleState::Error,
                Some("configuration not found".to_string()),
            )
            .await;
            return None;
        };

        if !descriptor.enabled {
            self.set_state(
                name,
                ModuleState::Error,
                Some("module is disabled".to_string()),
            )
            .await;
            return None;
        }

        if let Some(cycle) = self.store.find_cycle(name) {
            let message = format!("circular dependency: {}", cycle.join(" -> "));
            warn!(module = %name, %message, "Refusing to load");
            self.set_state(name, ModuleState::Error, Some(message)).await;
            return None;
        }

        for dependency in &descriptor.dependencies {
            if self.load_recursive(dependency).await.is_none() {
                let message = format!("dependency {dependency} failed to load");
                warn!(module = %name, %message, "Aborting load");
                self.set_state(name, ModuleState::Error, Some(message)).await;
                return None;
            }
        }

        if !descriptor.artifact.exists() {
            let message = format!("artifact not found: {}", descriptor.artifact.display());
            self.set_state(name, ModuleState::Error, Some(message)).await;
            return None;
        }

        let loaded = match tokio::time::timeout(
            self.config.load_timeout,
            self.loader.load(descriptor),
        )
        .await
        {
            Ok(Ok(loaded)) => loaded,
            Ok(Err(e)) => {
                self.set_state(name, ModuleState::Error, Some(e.to_string()))
                    .await;
                return None;
            }
            Err(_) => {
                let message = format!(
                    "load timed out after {:?}",
                    self.config.load_timeout
                );
                warn!(module = %name, %message, "Abandoning load attempt");
                self.set_state(name, ModuleState::Error, Some(message)).await;
                return None;
            }
        };

        // Activation is the runtime's responsibility, not the loader's.
        if let Err(e) = loaded.instance().activate().await {
            // Roll the construction back so the artifact handle is released.
            if let Err(unload_err) = self.loader.unload(&loaded).await {
                warn!(
                    module = %name,
                    error = %unload_err,
                    "Teardown failed after activation failure"
                );
            }
            self.set_state(
                name,
                ModuleState::Error,
                Some(format!("activation failed: {e}")),
            )
            .await;
            return None;
        }

        let module = self.registry.register(loaded).await;
        self.set_state(name, ModuleState::Loaded, None).await;
        self.touch(name).await;
        self.cache_metadata(&module).await;

        info!(module = %name, generation = module.generation(), "Module loaded");
        Some(module)
    }

    /// Fire a best-effort load for each name concurrently. Individual
    /// failures are logged, never escalated; the call resolves when all
    /// attempts finish.
    pub async fn preload(self: &Arc<Self>, names: &[String]) {
        let handles: Vec<_> = names
            .iter()
            .map(|name| {
                let runtime = self.clone();
                let name = name.clone();
                tokio::spawn(async move {
                    if runtime.load_on_demand(&name).await.is_none() {
                        warn!(module = %name, "Preload failed");
                    }
                })
            })
            .collect();

        let _ = futures::future::join_all(handles).await;
    }

    /// Change the loading strategy. Preloading modes schedule background
    /// work and return immediately.
    pub async fn set_loading_strategy(self: &Arc<Self>, strategy: LoadingStrategy) {
        {
            let mut current = self.strategy.write().await;
            *current = strategy;
        }

        let names = match strategy {
            LoadingStrategy::OnDemand => return,
            LoadingStrategy::PreloadCore => self.store.core_names(),
            LoadingStrategy::PreloadAll => self.store.enabled_names(),
        };

        info!(?strategy, modules = names.len(), "Scheduling background preload");
        let runtime = self.clone();
        tokio::spawn(async move {
            runtime.preload(&names).await;
        });
    }

    /// The current loading strategy.
    pub async fn loading_strategy(&self) -> LoadingStrategy {
        *self.strategy.read().await
    }

    /// Unload every non-core module whose last access is older than the
    /// threshold. Core modules are never evicted. Returns the evicted names.
    pub async fn unload_inactive(&self, threshold: Duration) -> Vec<String> {
        let now = Instant::now();
        let candidates: Vec<String> = {
            let records = self.records.read().await;
            records
                .values()
                .filter(|r| r.state == ModuleState::Loaded && !r.is_core)
                .filter(|r| {
                    r.last_access
                        .map(|t| now.duration_since(t) > threshold)
                        .unwrap_or(false)
                })
                .map(|r| r.name.clone())
                .collect()
        };

        let mut evicted = Vec::new();
        for name in candidates {
            let lock = self.module_lock(&name).await;
            let _guard = lock.lock().await;

            // The module may have been touched or unloaded while we waited.
            let still_idle = {
                let records = self.records.read().await;
                records
                    .get(&name)
                    .filter(|r| r.state == ModuleState::Loaded)
                    .and_then(|r| r.last_access)
                    .map(|t| t.elapsed() > threshold)
                    .unwrap_or(false)
            };
            if !still_idle {
                continue;
            }

            let Some(module) = self.registry.get(&name).await else {
                continue;
            };

            self.set_state(&name, ModuleState::Unloading, None).await;
            if let Err(e) = self.loader.unload(&module).await {
                // Best effort: the record must not strand in Unloading.
                warn!(module = %name, error = %e, "Teardown failed during eviction");
            }
            self.registry.unregister(&name).await;
            self.invalidate_metadata(&name).await;

            {
                let mut records = self.records.write().await;
                if let Some(record) = records.get_mut(&name) {
                    record.set_state(ModuleState::NotLoaded, None);
                    record.last_access = None;
                }
            }

            info!(module = %name, "Evicted idle module");
            evicted.push(name);
        }

        evicted
    }

    /// Unload-then-load under the per-module lock; the replacement is atomic
    /// for registry readers. Returns the fresh instance, or `None` with the
    /// failure recorded.
    pub async fn reload(&self, name: &str) -> Option<Arc<LoadedModule>> {
        let lock = self.module_lock(name).await;
        let _guard = lock.lock().await;

        if let Some(current) = self.registry.get(name).await {
            info!(module = %name, "Reloading module");
            self.set_state(name, ModuleState::Unloading, None).await;
            if let Err(e) = self.loader.unload(&current).await {
                warn!(module = %name, error = %e, "Teardown failed during reload");
            }
            self.registry.unregister(name).await;
            self.invalidate_metadata(name).await;
            self.set_state(name, ModuleState::NotLoaded, None).await;
        }

        self.load_locked(name).await
    }

    /// The status record for a name. Names never seen report `NotConfigured`.
    pub async fn get_status(&self, name: &str) -> ModuleStatus {
        let records = self.records.read().await;
        records
            .get(name)
            .cloned()
            .unwrap_or_else(|| ModuleStatus::not_configured(name))
    }

    /// All status records ordered by priority.
    pub async fn get_all_statuses(&self) -> Vec<ModuleStatus> {
        let records = self.records.read().await;
        let mut all: Vec<ModuleStatus> = records.values().cloned().collect();
        all.sort_by_key(|r| r.priority);
        all
    }

    /// Cached metadata for a loaded module, if still within its TTL.
    pub async fn get_metadata(&self, name: &str) -> Option<ModuleMetadata> {
        let metadata = self.metadata.read().await;
        metadata.get(name).and_then(|(meta, cached_at)| {
            (cached_at.elapsed() < self.config.metadata_ttl).then(|| meta.clone())
        })
    }

    /// Spawn the periodic inactivity sweep as a cancellable background task.
    pub fn spawn_inactivity_sweeper(
        self: &Arc<Self>,
        interval: Duration,
        threshold: Duration,
    ) -> SweeperHandle {
        let (shutdown_tx, mut shutdown_rx) = mpsc::channel::<()>(1);
        let runtime = self.clone();

        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(interval) => {
                        let evicted = runtime.unload_inactive(threshold).await;
                        if !evicted.is_empty() {
                            info!(count = evicted.len(), "Inactivity sweep evicted modules");
                        }
                    }
                    _ = shutdown_rx.recv() => {
                        info!("Inactivity sweeper shutting down");
                        return;
                    }
                }
            }
        });

        SweeperHandle { shutdown_tx, task }
    }

    async fn module_lock(&self, name: &str) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().await;
        locks
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    async fn set_state(&self, name: &str, state: ModuleState, error: Option<String>) {
        let mut records = self.records.write().await;
        let record = records.entry(name.to_string()).or_insert_with(|| {
            // First sighting of a name with no descriptor.
            ModuleStatus::new(name, ModuleState::NotLoaded, false, i32::MAX)
        });
        record.set_state(state, error);
    }

    async fn touch(&self, name: &str) {
        let mut records = self.records.write().await;
        if let Some(record) = records.get_mut(name) {
            record.last_access = Some(Instant::now());
        }
    }

    async fn cache_metadata(&self, module: &Arc<LoadedModule>) {
        let meta = ModuleMetadata {
            name: module.name().to_string(),
            version: module.instance().identity().version.clone(),
            loaded_at: module.loaded_at(),
            artifact_path: module.artifact_path().to_path_buf(),
        };
        let mut metadata = self.metadata.write().await;
        metadata.insert(module.name().to_string(), (meta, Instant::now()));
    }

    async fn invalidate_metadata(&self, name: &str) {
        let mut metadata = self.metadata.write().await;
        metadata.remove(name);
    }
}
