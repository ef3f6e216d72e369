//! loadswarm - distributed load test orchestration over SSH
//!
//! loadswarm leases a set of shared load generator machines, launches a
//! master coordinator plus worker processes of a load-generation tool on
//! them, supervises the run until it finishes (or times out, or a worker
//! dies), and tears down every process it started on every exit path.
//!
//! # Architecture
//!
//! - **Leasing**: best-effort probe-and-lock over SSH, retried with backoff
//! - **Launch**: master first, then workers per node with fail-fast checks
//! - **Supervision**: one polling loop over all handles with one deadline
//! - **Cleanup**: a guard that always runs last, exactly once

pub mod cleanup;
pub mod config;
pub mod error;
pub mod launch;
pub mod lease;
pub mod orchestrator;
pub mod remote;
pub mod supervise;
pub mod util;

// Re-export commonly used types
pub use config::Config;
pub use error::SwarmError;

/// Result type used throughout loadswarm
pub type Result<T> = anyhow::Result<T>;
