//! SR-002: Error taxonomy for graph construction and stack runs.
//!
//! Graph-build errors (`ConfigResolution`, `Cycle`) are fatal before any
//! execution. Module-scoped errors are `Clone` so the run report can keep
//! them verbatim.

use super::types::{ModuleStatus, StatusEvent};
use std::fmt;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Why a provisioning invocation did not succeed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutionFailure {
    /// Clean exit with a non-zero status
    ExitCode(i32),
    /// The process could not be spawned or waited on
    Crashed(String),
    /// Killed after ignoring the interrupt for the whole grace period
    ForceKilled,
}

impl fmt::Display for ExecutionFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ExitCode(code) => write!(f, "exit code {}", code),
            Self::Crashed(reason) => write!(f, "crashed: {}", reason),
            Self::ForceKilled => write!(f, "force-killed after grace period"),
        }
    }
}

#[derive(Debug, Clone, Error)]
pub enum StackError {
    #[error(
        "module {} depends on {}, which is not part of the stack",
        .module.display(),
        .dependency.display()
    )]
    ConfigResolution { module: PathBuf, dependency: PathBuf },

    #[error("dependency cycle detected: {}", format_cycle(.cycle))]
    Cycle { cycle: Vec<PathBuf> },

    #[error(
        "dependency outputs unavailable: {} needs outputs of {}: {reason}",
        .module.display(),
        .dependency.display()
    )]
    OutputResolution {
        module: PathBuf,
        dependency: PathBuf,
        reason: String,
    },

    #[error("{} failed: {failure}", .module.display())]
    Execution {
        module: PathBuf,
        failure: ExecutionFailure,
        stderr: String,
    },

    #[error("{} cancelled: {reason}", .module.display())]
    Cancelled { module: PathBuf, reason: String },

    #[error(
        "working directory {} lock lost (now held by {})",
        .working_dir.display(),
        .holder.as_ref().map_or_else(|| "nobody".to_string(), |p| p.display().to_string())
    )]
    LockContention {
        working_dir: PathBuf,
        holder: Option<PathBuf>,
    },

    #[error("invalid status transition for {}: {from} on {event:?}", .module.display())]
    InvalidTransition {
        module: PathBuf,
        from: ModuleStatus,
        event: StatusEvent,
    },

    #[error("invalid manifest {}: {reason}", .path.display())]
    Manifest { path: PathBuf, reason: String },

    #[error("module discovery failed under {}: {reason}", .root.display())]
    Discovery { root: PathBuf, reason: String },
}

impl StackError {
    /// Short machine-readable kind, used in event logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::ConfigResolution { .. } => "config_resolution",
            Self::Cycle { .. } => "cycle",
            Self::OutputResolution { .. } => "output_resolution",
            Self::Execution { .. } => "execution",
            Self::Cancelled { .. } => "cancelled",
            Self::LockContention { .. } => "lock_contention",
            Self::InvalidTransition { .. } => "invalid_transition",
            Self::Manifest { .. } => "manifest",
            Self::Discovery { .. } => "discovery",
        }
    }

    pub fn cancelled(module: &Path, reason: impl Into<String>) -> Self {
        Self::Cancelled {
            module: module.to_path_buf(),
            reason: reason.into(),
        }
    }
}

fn format_cycle(cycle: &[PathBuf]) -> String {
    let mut parts: Vec<String> = cycle.iter().map(|p| p.display().to_string()).collect();
    if let Some(first) = parts.first().cloned() {
        parts.push(first);
    }
    parts.join(" -> ")
}
