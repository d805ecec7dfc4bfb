//! SR-009: Run report: aggregated per-module outcome of one stack run.

use super::error::StackError;
use super::graph::Graph;
use super::scheduler::{HaltReason, Outcome};
use super::types::{ModuleStatus, ScheduleOrder};
use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Exit code for a run stopped by the user.
pub const EXIT_INTERRUPTED: i32 = 130;

/// Final state of one module.
#[derive(Debug, Clone)]
pub struct ReportEntry {
    pub path: PathBuf,
    /// Path relative to the stack root
    pub display: String,
    pub status: ModuleStatus,
    /// The module's own error, verbatim
    pub error: Option<StackError>,
    /// Failed dependencies the module ran in spite of
    pub upstream_failures: Vec<PathBuf>,
    pub skipped_because: Option<PathBuf>,
    pub duration: Option<Duration>,
}

impl ReportEntry {
    /// Succeeded, but with failed dependencies (ignore-dependency-errors).
    pub fn is_degraded(&self) -> bool {
        self.status == ModuleStatus::Succeeded && !self.upstream_failures.is_empty()
    }

    /// Status label; degraded successes are marked.
    pub fn label(&self) -> String {
        if self.is_degraded() {
            format!("{} (dependency errors)", self.status)
        } else {
            self.status.to_string()
        }
    }
}

#[derive(Debug, Clone)]
pub struct RunReport {
    pub command: String,
    /// Entries in execution order
    pub entries: Vec<ReportEntry>,
    pub duration: Duration,
    pub halted: Option<HaltReason>,
}

impl RunReport {
    pub fn from_run(
        graph: &Graph,
        order: ScheduleOrder,
        command: &str,
        outcome: Outcome,
        duration: Duration,
    ) -> Self {
        let Outcome {
            status,
            mut records,
            halted,
        } = outcome;
        let entries = graph
            .execution_order(order)
            .into_iter()
            .map(|id| {
                let record = std::mem::take(&mut records[id.0]);
                ReportEntry {
                    path: graph.module(id).path.clone(),
                    display: graph.display_path(id),
                    status: status[id.0],
                    error: record.error,
                    upstream_failures: record.upstream_failures,
                    skipped_because: record.skipped_because,
                    duration: record.duration,
                }
            })
            .collect();
        Self {
            command: command.to_string(),
            entries,
            duration,
            halted,
        }
    }

    /// Every module succeeded or was excluded.
    pub fn is_success(&self) -> bool {
        self.entries
            .iter()
            .all(|e| matches!(e.status, ModuleStatus::Succeeded | ModuleStatus::Excluded))
    }

    pub fn has_failures(&self) -> bool {
        self.entries.iter().any(|e| e.status == ModuleStatus::Failed)
    }

    pub fn interrupted(&self) -> bool {
        self.halted == Some(HaltReason::Interrupted)
    }

    pub fn count(&self, status: ModuleStatus) -> usize {
        self.entries.iter().filter(|e| e.status == status).count()
    }

    pub fn entry(&self, path: &Path) -> Option<&ReportEntry> {
        self.entries.iter().find(|e| e.path == path)
    }

    /// 0 on success, 130 when interrupted, 1 otherwise.
    pub fn exit_code(&self) -> i32 {
        if self.interrupted() {
            EXIT_INTERRUPTED
        } else if self.is_success() {
            0
        } else {
            1
        }
    }

    /// Every retained module error, in execution order.
    pub fn errors(&self) -> Vec<(&str, &StackError)> {
        self.entries
            .iter()
            .filter_map(|e| e.error.as_ref().map(|err| (e.display.as_str(), err)))
            .collect()
    }

    pub fn summary_line(&self) -> String {
        let degraded = self.entries.iter().filter(|e| e.is_degraded()).count();
        let mut line = format!(
            "{}: {} succeeded, {} failed, {} skipped, {} excluded, {} cancelled ({:.1}s)",
            self.command,
            self.count(ModuleStatus::Succeeded),
            self.count(ModuleStatus::Failed),
            self.count(ModuleStatus::Skipped),
            self.count(ModuleStatus::Excluded),
            self.count(ModuleStatus::Cancelled),
            self.duration.as_secs_f64()
        );
        if degraded > 0 {
            let _ = write!(line, ", {} with dependency errors", degraded);
        }
        line
    }

    /// Human-readable listing plus summary.
    pub fn render(&self) -> String {
        let width = self
            .entries
            .iter()
            .map(|e| e.label().len())
            .max()
            .unwrap_or(0);
        let mut out = String::new();
        for entry in &self.entries {
            let _ = write!(out, "  {:<width$}  {}", entry.label(), entry.display);
            if let Some(d) = entry.duration {
                let _ = write!(out, " ({:.1}s)", d.as_secs_f64());
            }
            match (&entry.error, &entry.skipped_because) {
                (Some(err), _) if entry.status != ModuleStatus::Cancelled => {
                    let _ = write!(out, "\n      {}", err);
                }
                (_, Some(cause)) => {
                    let _ = write!(out, "\n      dependency {} failed", cause.display());
                }
                _ => {}
            }
            out.push('\n');
        }
        if let Some(reason) = &self.halted {
            let _ = writeln!(out, "\nRun halted: {}", reason);
        }
        out.push('\n');
        out.push_str(&self.summary_line());
        out.push('\n');
        out
    }
}
