//! Sandbox module - Process-level hardening for untrusted programs
//!
//! This module provides the low-level pieces the runner applies to every child:
//! - Isolation level configuration and namespace probing
//! - rlimits, namespaces and the sealed filesystem in the forked child (pre-exec)
//! - Process group ownership and teardown
//!
//! The sandbox module does NOT:
//! - Spawn programs or capture their output (that's the runner's job)
//! - Know about languages or lessons
//! - Compare outputs

pub mod config;
pub mod isolation;
pub mod process_group;

// Re-exports for convenience
pub use config::{IsolationLevel, SandboxConfig};
pub use isolation::{
    ensure_namespace_isolation_available, harden_child, is_namespace_isolation_available,
    ChildLimits, NamespacePlan,
};
pub use process_group::ProcessGroupGuard;
