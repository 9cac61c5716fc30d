//! Module loader
//!
//! The only component that constructs or destroys module instances. The
//! host-runtime-specific loading mechanism (dynamic libraries, entry-point
//! symbols) is isolated behind the [`ArtifactResolver`] seam so tests and
//! alternative hosts can substitute their own construction.

use libloading::{Library, Symbol};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use modhost_kernel::{HostContext, HostModule};

use crate::descriptor::ModuleDescriptor;
use crate::registry::LoadedModule;

/// Module load error types.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum LoadError {
    #[error("Artifact not found: {0}")]
    ArtifactNotFound(PathBuf),

    #[error("Failed to load library: {0}")]
    LibraryLoad(String),

    #[error("Entry point not found: {0}")]
    EntryPointNotFound(String),

    #[error("Entry point returned no module: {0}")]
    CreationFailed(String),

    #[error("Module initialization failed: {0}")]
    InitFailed(String),

    #[error("Module teardown failed: {0}")]
    TeardownFailed(String),

    #[error("API version mismatch: expected {expected}, got {actual}")]
    ApiVersionMismatch { expected: u32, actual: u32 },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Pluggable artifact resolution: given an artifact path and an entry-point
/// identifier, produce a constructed module object.
#[async_trait::async_trait]
pub trait ArtifactResolver: Send + Sync {
    /// Resolve the artifact and instantiate the module it declares.
    async fn resolve(
        &self,
        artifact: &Path,
        entry_point: &str,
    ) -> Result<Arc<dyn HostModule>, LoadError>;

    /// Release any handle held for the artifact.
    async fn release(&self, artifact: &Path) -> Result<(), LoadError>;
}

/// A loaded module library handle.
pub struct ModuleLibrary {
    /// Path to the library file.
    path: PathBuf,
    /// The loaded library.
    library: Library,
    /// File hash for change detection.
    hash: String,
    /// Load timestamp.
    loaded_at: std::time::Instant,
    /// API version the library reports.
    api_version: u32,
}

impl ModuleLibrary {
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn hash(&self) -> &str {
        &self.hash
    }

    pub fn loaded_at(&self) -> std::time::Instant {
        self.loaded_at
    }

    pub fn api_version(&self) -> u32 {
        self.api_version
    }

    /// Instantiate the module through the named entry-point symbol.
    ///
    /// # Safety
    /// This function calls extern "C" functions from a dynamic library.
    pub unsafe fn create_instance(
        &self,
        entry_point: &str,
    ) -> Result<Arc<dyn HostModule>, LoadError> {
        unsafe {
            let create_fn: Symbol<unsafe extern "C" fn() -> *mut dyn HostModule> = self
                .library
                .get(entry_point.as_bytes())
                .map_err(|e| LoadError::EntryPointNotFound(format!("{entry_point}: {e}")))?;

            let raw = create_fn();
            if raw.is_null() {
                return Err(LoadError::CreationFailed(format!(
                    "{entry_point} returned null"
                )));
            }

            Ok(Arc::from(Box::from_raw(raw)))
        }
    }
}

impl Drop for ModuleLibrary {
    fn drop(&mut self) {
        debug!(path = ?self.path, "Releasing module library handle");
    }
}

/// Default [`ArtifactResolver`] backed by `libloading`.
///
/// Keeps one handle per artifact path; `release` drops the handle so a
/// subsequent resolve maps the file fresh (the reload path).
pub struct LibraryResolver {
    /// Loaded libraries keyed by artifact path.
    libraries: Arc<RwLock<HashMap<PathBuf, Arc<ModuleLibrary>>>>,
    /// Expected API version.
    api_version: u32,
}

impl LibraryResolver {
    /// Current host/module API version.
    pub const CURRENT_API_VERSION: u32 = 1;

    pub fn new() -> Self {
        Self {
            libraries: Arc::new(RwLock::new(HashMap::new())),
            api_version: Self::CURRENT_API_VERSION,
        }
    }

    /// Calculate the artifact's content hash.
    fn calculate_hash(path: &Path) -> Result<String, LoadError> {
        let contents = std::fs::read(path)?;
        let mut hasher = Sha256::new();
        hasher.update(&contents);
        Ok(format!("{:x}", hasher.finalize()))
    }

    /// Load (or fetch the cached handle for) a module library.
    pub async fn load_library(&self, path: &Path) -> Result<Arc<ModuleLibrary>, LoadError> {
        {
            let libraries = self.libraries.read().await;
            if let Some(lib) = libraries.get(path) {
                return Ok(lib.clone());
            }
        }

        info!(?path, "Loading module library");

        let hash = Self::calculate_hash(path)?;

        let library =
            unsafe { Library::new(path).map_err(|e| LoadError::LibraryLoad(e.to_string()))? };

        // Libraries that predate the version symbol report version 1.
        let api_version = unsafe {
            let version_fn: Result<Symbol<unsafe extern "C" fn() -> u32>, _> =
                library.get(b"_module_api_version");
            match version_fn {
                Ok(func) => func(),
                Err(_) => 1,
            }
        };

        if api_version != self.api_version {
            return Err(LoadError::ApiVersionMismatch {
                expected: self.api_version,
                actual: api_version,
            });
        }

        let module_lib = Arc::new(ModuleLibrary {
            path: path.to_path_buf(),
            library,
            hash,
            loaded_at: std::time::Instant::now(),
            api_version,
        });

        {
            let mut libraries = self.libraries.write().await;
            libraries.insert(path.to_path_buf(), module_lib.clone());
        }

        Ok(module_lib)
    }

    /// Whether the artifact on disk differs from the loaded handle.
    pub async fn has_changed(&self, path: &Path) -> Result<bool, LoadError> {
        let libraries = self.libraries.read().await;
        if let Some(lib) = libraries.get(path) {
            let current_hash = Self::calculate_hash(path)?;
            Ok(current_hash != lib.hash)
        } else {
            Ok(true)
        }
    }

    /// Paths of all held library handles.
    pub async fn loaded_paths(&self) -> Vec<PathBuf> {
        let libraries = self.libraries.read().await;
        libraries.keys().cloned().collect()
    }
}

impl Default for LibraryResolver {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl ArtifactResolver for LibraryResolver {
    async fn resolve(
        &self,
        artifact: &Path,
        entry_point: &str,
    ) -> Result<Arc<dyn HostModule>, LoadError> {
        let library = self.load_library(artifact).await?;
        unsafe { library.create_instance(entry_point) }
    }

    async fn release(&self, artifact: &Path) -> Result<(), LoadError> {
        let mut libraries = self.libraries.write().await;
        if libraries.remove(artifact).is_some() {
            info!(path = ?artifact, "Released module library");
            Ok(())
        } else {
            Err(LoadError::ArtifactNotFound(artifact.to_path_buf()))
        }
    }
}

/// Constructs and destroys module instances. Loading policy (locking,
/// dependency resolution, registration) belongs to the lazy runtime; this
/// type only performs the construction contract itself.
pub struct ModuleLoader {
    resolver: Arc<dyn ArtifactResolver>,
    context: HostContext,
}

impl ModuleLoader {
    pub fn new(resolver: Arc<dyn ArtifactResolver>, context: HostContext) -> Self {
        Self { resolver, context }
    }

    /// The host context passed to module `initialize` hooks.
    pub fn context(&self) -> &HostContext {
        &self.context
    }

    /// Construct and initialize the module a descriptor declares.
    ///
    /// A failure at any step leaves no trace: the instance is dropped and the
    /// registry is never touched. `activate` is the caller's responsibility.
    pub async fn load(&self, descriptor: &ModuleDescriptor) -> Result<LoadedModule, LoadError> {
        if !descriptor.artifact.exists() {
            return Err(LoadError::ArtifactNotFound(descriptor.artifact.clone()));
        }

        let instance = self
            .resolver
            .resolve(&descriptor.artifact, &descriptor.entry_point)
            .await?;

        if instance.identity().name != descriptor.name {
            warn!(
                descriptor = %descriptor.name,
                module = %instance.identity().name,
                "Module identity name differs from its descriptor"
            );
        }

        instance
            .initialize(&self.context)
            .await
            .map_err(|e| LoadError::InitFailed(e.to_string()))?;

        info!(
            module = %descriptor.name,
            version = %instance.identity().version,
            "Constructed module"
        );

        Ok(LoadedModule::new(
            &descriptor.name,
            instance,
            descriptor.artifact.clone(),
        ))
    }

    /// Reverse construction: run the module's teardown hook, then release the
    /// artifact handle. The handle is released even when teardown fails.
    pub async fn unload(&self, module: &LoadedModule) -> Result<(), LoadError> {
        let teardown = module
            .instance()
            .deactivate()
            .await
            .map_err(|e| LoadError::TeardownFailed(e.to_string()));

        if let Err(e) = self.resolver.release(module.artifact_path()).await {
            debug!(module = %module.name(), error = %e, "No artifact handle to release");
        }

        teardown
    }
}

/// Export the canonical module entry points from a module crate.
#[macro_export]
macro_rules! declare_module {
    ($module_type:ty, $create_fn:expr) => {
        #[unsafe(no_mangle)]
        pub extern "C" fn _module_create() -> *mut dyn $crate::HostModule {
            let module: $module_type = $create_fn;
            let boxed: Box<dyn $crate::HostModule> = Box::new(module);
            Box::into_raw(boxed)
        }

        #[unsafe(no_mangle)]
        pub extern "C" fn _module_destroy(module: *mut dyn $crate::HostModule) {
            if !module.is_null() {
                unsafe {
                    let _ = Box::from_raw(module);
                }
            }
        }

        #[unsafe(no_mangle)]
        pub extern "C" fn _module_api_version() -> u32 {
            $crate::LibraryResolver::CURRENT_API_VERSION
        }
    };
}
