//! Hot-reload watcher
//!
//! Observes module artifacts for external change signals, debounces bursts,
//! and pushes reload work back into the lazy runtime. This is the only
//! component that triggers runtime work outside a direct caller request.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use notify::{Config, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::{broadcast, mpsc, Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::error::RuntimeError;
use crate::lazy::LazyModuleRuntime;
use crate::registry::RegistryEvent;

/// Watch configuration.
#[derive(Debug, Clone)]
pub struct WatchConfig {
    /// Live-reload runtime mode. When false, every watcher call is a no-op.
    pub enabled: bool,
    /// Change signals arriving within this window of the previous reload
    /// trigger are discarded.
    pub debounce: Duration,
    /// Wait after a signal before reloading, so multi-part writes finish.
    pub settle_delay: Duration,
    /// Artifact extensions worth reacting to.
    pub extensions: Vec<String>,
    /// Ignore patterns for editor/temp files (simple glob prefixes/suffixes).
    pub ignore_patterns: Vec<String>,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            debounce: Duration::from_secs(2),
            settle_delay: Duration::from_millis(500),
            extensions: vec!["so".to_string(), "dylib".to_string(), "dll".to_string()],
            ignore_patterns: vec!["*.tmp".to_string(), "*.swp".to_string(), "*~".to_string()],
        }
    }
}

impl WatchConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enable/disable live-reload mode.
    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    /// Set the debounce window.
    pub fn with_debounce(mut self, debounce: Duration) -> Self {
        self.debounce = debounce;
        self
    }

    /// Set the settle delay.
    pub fn with_settle_delay(mut self, settle_delay: Duration) -> Self {
        self.settle_delay = settle_delay;
        self
    }

    /// Add an artifact extension to watch.
    pub fn with_extension(mut self, ext: &str) -> Self {
        self.extensions.push(ext.to_string());
        self
    }

    /// Check whether a path is a watchable artifact.
    pub fn should_watch(&self, path: &Path) -> bool {
        let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("");
        if !self.extensions.is_empty() && !self.extensions.iter().any(|e| e == ext) {
            return false;
        }

        let file_name = path.file_name().and_then(|n| n.to_str()).unwrap_or("");
        for pattern in &self.ignore_patterns {
            if pattern.starts_with('*') && file_name.ends_with(&pattern[1..]) {
                return false;
            }
            if pattern.ends_with('*') && file_name.starts_with(&pattern[..pattern.len() - 1]) {
                return false;
            }
            if file_name == pattern {
                return false;
            }
        }

        true
    }
}

struct WatchEntry {
    /// Held so the OS watch stays alive; dropped on stop.
    _watcher: RecommendedWatcher,
    shutdown_tx: mpsc::Sender<()>,
}

/// Watches module artifacts and drives the lazy runtime's reload path.
pub struct HotReloadWatcher {
    config: WatchConfig,
    runtime: Arc<LazyModuleRuntime>,
    entries: Mutex<HashMap<String, WatchEntry>>,
    /// Last reload trigger per module, for debouncing.
    last_reload: Arc<RwLock<HashMap<String, Instant>>>,
}

impl HotReloadWatcher {
    pub fn new(runtime: Arc<LazyModuleRuntime>, config: WatchConfig) -> Self {
        Self {
            config,
            runtime,
            entries: Mutex::new(HashMap::new()),
            last_reload: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Begin observing the artifact's containing directory for write/create
    /// signals. No-op outside live-reload mode or when already watching.
    pub async fn start_watching(
        &self,
        name: &str,
        artifact_path: &Path,
    ) -> Result<(), RuntimeError> {
        if !self.config.enabled {
            debug!(module = %name, "Live reload disabled, not watching");
            return Ok(());
        }

        let dir = artifact_path.parent().ok_or_else(|| {
            RuntimeError::Watch(format!(
                "artifact has no containing directory: {}",
                artifact_path.display()
            ))
        })?;

        let mut entries = self.entries.lock().await;
        if entries.contains_key(name) {
            debug!(module = %name, "Already watching");
            return Ok(());
        }

        let (tx, mut rx) = mpsc::channel::<Event>(1024);
        let mut watcher = RecommendedWatcher::new(
            move |result: Result<Event, notify::Error>| {
                if let Ok(event) = result {
                    let _ = tx.blocking_send(event);
                }
            },
            Config::default(),
        )
        .map_err(|e| RuntimeError::Watch(e.to_string()))?;

        watcher
            .watch(dir, RecursiveMode::NonRecursive)
            .map_err(|e| RuntimeError::Watch(e.to_string()))?;

        let (shutdown_tx, mut shutdown_rx) = mpsc::channel::<()>(1);

        let runtime = self.runtime.clone();
        let last_reload = self.last_reload.clone();
        let config = self.config.clone();
        let module_name = name.to_string();
        let artifact: PathBuf = artifact_path.to_path_buf();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    Some(event) = rx.recv() => {
                        if !matches!(event.kind, EventKind::Create(_) | EventKind::Modify(_)) {
                            continue;
                        }
                        // Some platforms report canonicalized paths, so match
                        // on the file name within the watched directory.
                        let hit = event.paths.iter().any(|p| {
                            p.file_name() == artifact.file_name() && config.should_watch(p)
                        });
                        if !hit {
                            continue;
                        }
                        Self::handle_change(&runtime, &last_reload, &config, &module_name).await;
                    }
                    _ = shutdown_rx.recv() => {
                        debug!(module = %module_name, "Watch task shutting down");
                        return;
                    }
                }
            }
        });

        entries.insert(
            name.to_string(),
            WatchEntry {
                _watcher: watcher,
                shutdown_tx,
            },
        );

        info!(module = %name, artifact = ?artifact_path, "Watching module artifact");
        Ok(())
    }

    /// Stop observing one module; no-op if not watched.
    pub async fn stop_watching(&self, name: &str) {
        let entry = {
            let mut entries = self.entries.lock().await;
            entries.remove(name)
        };
        if let Some(entry) = entry {
            let _ = entry.shutdown_tx.send(()).await;
            info!(module = %name, "Stopped watching module");
        }
    }

    /// Stop observing every watched module.
    pub async fn stop_all(&self) {
        let drained: Vec<(String, WatchEntry)> = {
            let mut entries = self.entries.lock().await;
            entries.drain().collect()
        };
        for (name, entry) in drained {
            let _ = entry.shutdown_tx.send(()).await;
            debug!(module = %name, "Stopped watching module");
        }
    }

    /// Whether a module is currently watched.
    pub async fn is_watching(&self, name: &str) -> bool {
        let entries = self.entries.lock().await;
        entries.contains_key(name)
    }

    /// Names of all watched modules.
    pub async fn watched_modules(&self) -> Vec<String> {
        let entries = self.entries.lock().await;
        entries.keys().cloned().collect()
    }

    /// Subscribe to registry events; a completed hot reload arrives as
    /// [`RegistryEvent::Changed`].
    pub fn subscribe(&self) -> broadcast::Receiver<RegistryEvent> {
        self.runtime.registry().subscribe()
    }

    /// The debounced reload path. Factored out of the watch task so the
    /// debounce behaviour is testable without a real file system watcher.
    async fn handle_change(
        runtime: &Arc<LazyModuleRuntime>,
        last_reload: &RwLock<HashMap<String, Instant>>,
        config: &WatchConfig,
        name: &str,
    ) {
        {
            let last = last_reload.read().await;
            if let Some(at) = last.get(name) {
                if at.elapsed() < config.debounce {
                    debug!(module = %name, "Change signal debounced");
                    return;
                }
            }
        }

        // Stamp the trigger before the settle sleep so signals from the same
        // burst are discarded while we wait.
        {
            let mut last = last_reload.write().await;
            last.insert(name.to_string(), Instant::now());
        }

        tokio::time::sleep(config.settle_delay).await;

        match runtime.reload(name).await {
            Some(module) => {
                runtime.registry().notify_changed(name);
                info!(
                    module = %name,
                    generation = module.generation(),
                    "Hot reload complete"
                );
            }
            None => {
                let status = runtime.get_status(name).await;
                warn!(
                    module = %name,
                    error = ?status.last_error,
                    "Hot reload failed, watcher keeps running"
                );
            }
        }
    }
}
