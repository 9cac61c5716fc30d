use serde::{Deserialize, Serialize};
use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

pub mod error;
pub use error::ModuleError;

/// Module operation result type using the typed [`ModuleError`].
pub type ModuleResult<T> = Result<T, ModuleError>;

// ============================================================================
// Module contract
// ============================================================================

/// The contract every loadable module implements.
///
/// Instances are shared across request-handling threads behind
/// `Arc<dyn HostModule>`, so all receivers are `&self`; modules keep whatever
/// interior mutability they need. The runtime itself only ever calls the
/// three lifecycle hooks; the self-description methods exist for the
/// routing/UI layer that consumes the registry.
#[async_trait::async_trait]
pub trait HostModule: Send + Sync {
    /// Get the module's identity metadata.
    fn identity(&self) -> &ModuleIdentity;

    /// Get the module name (convenience method).
    fn name(&self) -> &str {
        &self.identity().name
    }

    /// One-time setup: bind host services, open resources. Called exactly
    /// once per loaded instance, before `activate`.
    async fn initialize(&self, ctx: &HostContext) -> ModuleResult<()>;

    /// Make the module live (routes/UI become available).
    async fn activate(&self) -> ModuleResult<()>;

    /// Tear the module down before its instance is dropped.
    async fn deactivate(&self) -> ModuleResult<()>;

    /// Navigation entries this module contributes to the host UI.
    fn nav_items(&self) -> Vec<NavItem> {
        Vec::new()
    }

    /// Component/type names this module exposes for UI assembly discovery.
    fn component_types(&self) -> Vec<String> {
        Vec::new()
    }

    /// Default settings map for this module.
    fn default_settings(&self) -> HashMap<String, serde_json::Value> {
        HashMap::new()
    }

    /// Convert to Any (for downcasting).
    fn as_any(&self) -> &dyn Any;
}

// ============================================================================
// Module identity
// ============================================================================

/// Static identity metadata every module exposes back to the host.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModuleIdentity {
    /// Unique module name (the registry key).
    pub name: String,
    /// Human-readable display name.
    pub display_name: String,
    /// Declared version string.
    pub version: String,
    /// Category used for grouped discovery.
    pub category: String,
    /// Ordering priority (lower loads/sorts first).
    pub order: i32,
}

impl ModuleIdentity {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            display_name: name.to_string(),
            version: "1.0.0".to_string(),
            category: "general".to_string(),
            order: 1000,
        }
    }

    pub fn with_display_name(mut self, display_name: &str) -> Self {
        self.display_name = display_name.to_string();
        self
    }

    pub fn with_version(mut self, version: &str) -> Self {
        self.version = version.to_string();
        self
    }

    pub fn with_category(mut self, category: &str) -> Self {
        self.category = category.to_string();
        self
    }

    pub fn with_order(mut self, order: i32) -> Self {
        self.order = order;
        self
    }
}

/// A navigation entry a module contributes to the host UI.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NavItem {
    /// Link title.
    pub title: String,
    /// Route path the entry points at.
    pub route: String,
    /// Icon identifier.
    pub icon: Option<String>,
    /// Sort order within the navigation.
    pub order: i32,
}

impl NavItem {
    pub fn new(title: &str, route: &str) -> Self {
        Self {
            title: title.to_string(),
            route: route.to_string(),
            icon: None,
            order: 0,
        }
    }

    pub fn with_icon(mut self, icon: &str) -> Self {
        self.icon = Some(icon.to_string());
        self
    }

    pub fn with_order(mut self, order: i32) -> Self {
        self.order = order;
        self
    }
}

// ============================================================================
// Host context
// ============================================================================

/// The capability object handed to a module's `initialize` hook.
///
/// Modules resolve host-provided services through the shared map; the
/// runtime never inspects what a module requests.
#[derive(Default)]
pub struct HostContext {
    /// Host identifier (useful in logs when several hosts share a process).
    pub host_name: String,
    /// Shared services keyed by name.
    services: Arc<RwLock<HashMap<String, Box<dyn Any + Send + Sync>>>>,
}

impl std::fmt::Debug for HostContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostContext")
            .field("host_name", &self.host_name)
            .finish_non_exhaustive()
    }
}

impl HostContext {
    pub fn new(host_name: &str) -> Self {
        Self {
            host_name: host_name.to_string(),
            services: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Register a host service under a well-known key.
    pub async fn provide<T: Clone + Send + Sync + 'static>(&self, key: &str, service: T) {
        let mut services = self.services.write().await;
        services.insert(key.to_string(), Box::new(service));
    }

    /// Resolve a host service by key; `None` when absent or of another type.
    pub async fn resolve<T: Clone + Send + Sync + 'static>(&self, key: &str) -> Option<T> {
        let services = self.services.read().await;
        services.get(key).and_then(|v| v.downcast_ref::<T>().cloned())
    }
}

impl Clone for HostContext {
    fn clone(&self) -> Self {
        Self {
            host_name: self.host_name.clone(),
            services: self.services.clone(),
        }
    }
}
