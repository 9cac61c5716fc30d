//! Module runtime for the ModHost host process
//!
//! Discovers, loads, tracks, reloads, and unloads modules at runtime:
//! - Declarative manifest parsing into typed descriptors
//! - Lazy, on-demand loading with recursive dependency resolution
//! - Per-module concurrency exclusion (unrelated modules load in parallel)
//! - Hot reload driven by debounced file-change signals
//! - Idle eviction of non-core modules
//! - Registered/unregistered/changed events for the routing/UI layer

mod descriptor;
mod error;
mod lazy;
mod loader;
mod registry;
mod watcher;

pub use descriptor::{DescriptorStore, ModuleDescriptor, ModuleManifest, CORE_PRIORITY_THRESHOLD};
pub use error::RuntimeError;
pub use lazy::{
    LazyModuleRuntime, LoadingStrategy, ModuleMetadata, ModuleState, ModuleStatus, RuntimeConfig,
    SweeperHandle,
};
pub use loader::{ArtifactResolver, LibraryResolver, LoadError, ModuleLibrary, ModuleLoader};
pub use registry::{LoadedModule, ModuleRegistry, RegistryEvent};
pub use watcher::{HotReloadWatcher, WatchConfig};

// Re-export the kernel contract so consumers need a single dependency.
pub use modhost_kernel::{HostContext, HostModule, ModuleError, ModuleIdentity, ModuleResult, NavItem};
