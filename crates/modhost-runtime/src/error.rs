//! Typed errors for the module runtime.

use std::path::PathBuf;
use thiserror::Error;

use crate::loader::LoadError;

/// Errors surfaced by the module runtime.
///
/// Only `Configuration` is fatal (manifest parse failure at startup); every
/// other variant is recoverable and, inside the lazy load path, is recorded
/// on the module's status record rather than propagated to the caller.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum RuntimeError {
    /// The module manifest is malformed.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// The requested module has no descriptor.
    #[error("Module not configured: {0}")]
    NotConfigured(String),

    /// A transitive dependency failed to load.
    #[error("Module {module}: dependency {dependency} failed to load")]
    DependencyFailed {
        /// The module whose load was aborted.
        module: String,
        /// The dependency that failed.
        dependency: String,
    },

    /// The module artifact does not exist on disk.
    #[error("Artifact not found: {0}")]
    ArtifactNotFound(PathBuf),

    /// Construction or initialization failed.
    #[error("Load error: {0}")]
    Load(#[from] LoadError),

    /// Teardown failed (logged; the record still leaves `Unloading`).
    #[error("Unload error: {0}")]
    Unload(String),

    /// A load attempt exceeded the configured timeout.
    #[error("Load timed out: {0}")]
    Timeout(String),

    /// The file watcher failed.
    #[error("Watch error: {0}")]
    Watch(String),

    /// Internal invariant violation.
    #[error("Internal error: {0}")]
    Internal(String),
}
