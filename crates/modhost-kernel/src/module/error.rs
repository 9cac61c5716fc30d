//! Typed errors for the module contract.

use thiserror::Error;

/// Errors a module can report from its lifecycle hooks.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ModuleError {
    /// Module failed during `initialize`.
    #[error("Module initialization failed: {0}")]
    InitFailed(String),

    /// Module failed during `activate`.
    #[error("Module activation failed: {0}")]
    ActivationFailed(String),

    /// Module failed during `deactivate`.
    #[error("Module deactivation failed: {0}")]
    DeactivationFailed(String),

    /// An operation was attempted while the module was in an incompatible state.
    #[error("Module not in valid state: expected {expected}, got {actual}")]
    InvalidState {
        /// The state(s) that were expected.
        expected: String,
        /// The state the module was actually in.
        actual: String,
    },

    /// An I/O error surfaced during a module operation.
    #[error("Module I/O error: {source}")]
    Io {
        #[from]
        source: std::io::Error,
    },

    /// A (de)serialization error surfaced during a module operation.
    #[error("Module serialization error: {source}")]
    Serialization {
        #[from]
        source: serde_json::Error,
    },

    /// Catch-all for errors that don't fit the above categories.
    #[error("{0}")]
    Other(String),
}
