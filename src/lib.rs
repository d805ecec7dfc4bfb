//! stackrun: dependency-ordered, bounded-concurrency runs of a provisioning
//! tool across a stack of infrastructure modules.
//!
//! Modules declare dependencies on each other's outputs. The stack is built
//! into an acyclic graph, scheduled over a worker pool, and each module's
//! dependency outputs are resolved just before it runs.

pub mod cli;
pub mod core;
pub mod logging;
pub mod provenance;
pub mod transport;
