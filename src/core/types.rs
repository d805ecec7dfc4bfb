//! SR-001: Stack types: modules, dependency declarations, outputs, run
//! options, provenance events, and the closed module status machine.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Output values of one module, keyed by output name.
pub type Outputs = IndexMap<String, serde_json::Value>;

/// Resolved dependency outputs handed to a module, keyed by dependency name.
pub type DependencyInputs = IndexMap<String, Outputs>;

// ============================================================================
// Modules
// ============================================================================

/// One directory-scoped unit of declarative infrastructure configuration.
///
/// Produced by the config loader; read-only once graph construction begins.
#[derive(Debug, Clone)]
pub struct Module {
    /// Canonical module directory (unique identifier)
    pub path: PathBuf,

    /// Directory the provisioning tool runs in (defaults to `path`)
    pub working_dir: PathBuf,

    /// Opaque resolved configuration handle
    pub config: serde_yaml_ng::Value,

    /// Extra arguments appended to every tool invocation
    pub extra_args: Vec<String>,

    /// Declared dependencies, in declaration order
    pub dependencies: Vec<Dependency>,

    /// Excluded from execution by selection rules (still part of the graph)
    pub excluded: bool,

    /// Explicitly selected by include rules
    pub included: bool,
}

impl Module {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        Self {
            working_dir: path.clone(),
            path,
            config: serde_yaml_ng::Value::Null,
            extra_args: Vec::new(),
            dependencies: Vec::new(),
            excluded: false,
            included: false,
        }
    }

    pub fn with_dependency(mut self, dependency: Dependency) -> Self {
        self.dependencies.push(dependency);
        self
    }

    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = dir.into();
        self
    }

    pub fn excluded(mut self) -> Self {
        self.excluded = true;
        self
    }

    /// Declared dependency paths, in declaration order.
    pub fn dependency_paths(&self) -> impl Iterator<Item = &Path> {
        self.dependencies.iter().map(|d| d.path.as_path())
    }
}

/// A declared need for another module's outputs (or just its prior run).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Dependency {
    /// Name under which the outputs are handed to the dependent
    pub name: String,

    /// Path of the dependency module
    pub path: PathBuf,

    /// Omit the edge instead of failing when the path is not in the stack
    #[serde(default)]
    pub optional: bool,

    /// Ordering-only dependency: never resolve outputs
    #[serde(default)]
    pub skip_outputs: bool,

    /// Static substitutes for unavailable outputs
    #[serde(default)]
    pub mock_outputs: Option<Outputs>,

    /// Commands for which mocks may be used (empty = every command)
    #[serde(default)]
    pub mock_outputs_allowed_commands: Vec<String>,

    /// How mocks combine with real outputs that are present
    #[serde(default)]
    pub mock_outputs_merge_strategy: MergeStrategy,
}

impl Dependency {
    pub fn new(name: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            path: path.into(),
            optional: false,
            skip_outputs: false,
            mock_outputs: None,
            mock_outputs_allowed_commands: Vec::new(),
            mock_outputs_merge_strategy: MergeStrategy::default(),
        }
    }

    pub fn with_mocks(mut self, mocks: Outputs) -> Self {
        self.mock_outputs = Some(mocks);
        self
    }

    /// Mock outputs usable for `command`, if any.
    pub fn mocks_for(&self, command: &str) -> Option<&Outputs> {
        let allowed = self.mock_outputs_allowed_commands.is_empty()
            || self
                .mock_outputs_allowed_commands
                .iter()
                .any(|c| c == command);
        if allowed {
            self.mock_outputs.as_ref()
        } else {
            None
        }
    }
}

/// Mock/real output combination strategy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergeStrategy {
    /// Mocks only replace outputs that are unavailable or empty
    #[default]
    NoMerge,
    /// Real outputs win; mock keys fill the gaps
    Shallow,
}

// ============================================================================
// Run policy
// ============================================================================

/// Failure handling strategy for a stack run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Stop scheduling new modules after the first failure (fail-fast)
    StopOnFirst,
    /// Keep running everything not downstream of a failure
    #[default]
    ContinueIndependent,
}

/// Direction in which the dependency graph is walked.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScheduleOrder {
    /// Dependencies before dependents
    Forward,
    /// Dependents before dependencies (teardown)
    Reverse,
}

impl ScheduleOrder {
    pub fn for_command(command: &str) -> Self {
        if command == "destroy" {
            Self::Reverse
        } else {
            Self::Forward
        }
    }
}

/// Run-level cancellation flag shared by the scheduler, workers and the
/// provisioning transport.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Configuration for one stack run.
#[derive(Debug, Clone)]
pub struct RunOptions {
    /// Provisioning command (apply, plan, destroy, ...)
    pub command: String,

    /// Extra arguments for every module invocation
    pub args: Vec<String>,

    /// Maximum number of concurrently running modules (minimum 1)
    pub parallelism: usize,

    pub failure_policy: FailurePolicy,

    /// Let dependents of failed modules run with best-effort outputs
    pub ignore_dependency_errors: bool,

    /// Echo each module's captured output, prefixed with its path
    pub echo_output: bool,

    /// Directory for the JSONL run event log
    pub log_dir: Option<PathBuf>,

    pub cancel: CancelToken,
}

impl RunOptions {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            args: Vec::new(),
            parallelism: default_parallelism(),
            failure_policy: FailurePolicy::default(),
            ignore_dependency_errors: false,
            echo_output: false,
            log_dir: None,
            cancel: CancelToken::new(),
        }
    }
}

/// Available CPU parallelism, never below 1.
pub fn default_parallelism() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

// ============================================================================
// Module status
// ============================================================================

/// Per-module run status. Terminal states are write-once.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModuleStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    /// Skipped because a dependency failed
    Skipped,
    Excluded,
    Cancelled,
}

/// Status transition triggers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusEvent {
    Start,
    Succeed,
    Fail,
    SkipForDependency,
    Exclude,
    Cancel,
}

impl ModuleStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Pending | Self::Running)
    }

    /// Total transition function. `None` means the event is not valid in
    /// this state (every terminal state rejects every event).
    pub fn transition(self, event: StatusEvent) -> Option<Self> {
        match (self, event) {
            (Self::Pending, StatusEvent::Start) => Some(Self::Running),
            (Self::Pending, StatusEvent::SkipForDependency) => Some(Self::Skipped),
            (Self::Pending, StatusEvent::Exclude) => Some(Self::Excluded),
            (Self::Pending | Self::Running, StatusEvent::Cancel) => Some(Self::Cancelled),
            (Self::Running, StatusEvent::Succeed) => Some(Self::Succeeded),
            (Self::Running, StatusEvent::Fail) => Some(Self::Failed),
            _ => None,
        }
    }
}

impl fmt::Display for ModuleStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "PENDING"),
            Self::Running => write!(f, "RUNNING"),
            Self::Succeeded => write!(f, "SUCCEEDED"),
            Self::Failed => write!(f, "FAILED"),
            Self::Skipped => write!(f, "SKIPPED"),
            Self::Excluded => write!(f, "EXCLUDED"),
            Self::Cancelled => write!(f, "CANCELLED"),
        }
    }
}

// ============================================================================
// Provenance events
// ============================================================================

/// Run event for the JSONL event log.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum RunEvent {
    RunStarted {
        run_id: String,
        command: String,
        modules: usize,
        parallelism: usize,
        stackrun_version: String,
    },
    ModuleStarted {
        module: String,
        config_hash: String,
    },
    ModuleSucceeded {
        module: String,
        duration_seconds: f64,
    },
    ModuleFailed {
        module: String,
        kind: String,
        error: String,
    },
    ModuleSkipped {
        module: String,
        failed_dependency: String,
    },
    ModuleCancelled {
        module: String,
        reason: String,
    },
    RunCompleted {
        run_id: String,
        succeeded: usize,
        failed: usize,
        skipped: usize,
        excluded: usize,
        cancelled: usize,
        total_seconds: f64,
    },
}

/// Timestamped event wrapper.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimestampedEvent {
    pub ts: String,
    #[serde(flatten)]
    pub event: RunEvent,
}

// ============================================================================
// Tests
// ============================================================================
