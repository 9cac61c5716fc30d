//! ModHost kernel: the contract every pluggable module implements and the
//! shared types the host and the runtime exchange across that boundary.
//!
//! The kernel deliberately knows nothing about *how* modules are found,
//! loaded, or reloaded; that lives in `modhost-runtime`. It only defines:
//! - the [`HostModule`] lifecycle and self-description trait
//! - [`ModuleIdentity`] and [`NavItem`] metadata consumed by the routing/UI
//!   layer
//! - [`HostContext`], the capability object through which a module resolves
//!   host-provided services
//! - the typed [`ModuleError`] surface modules report failures through

// module contract
pub mod module;
pub use module::*;
