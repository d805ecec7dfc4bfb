//! Stack engine: module model, graph construction, output resolution,
//! scheduling, execution and reporting.

pub mod error;
pub mod executor;
pub mod graph;
pub mod locks;
pub mod parser;
pub mod registry;
pub mod report;
pub mod resolver;
pub mod scheduler;
pub mod types;

#[cfg(test)]
pub(crate) mod testing;
