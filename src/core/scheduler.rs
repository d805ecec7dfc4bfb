//! SR-007: Scheduler: the run state table.
//!
//! One mutex-guarded table holds every module's status and remaining
//! prerequisite count. Workers block on a condvar until a module is ready.
//! A module is claimed by `next`, marked running by `start`, and made
//! terminal by `complete`; successors are released or skipped under the
//! same lock, so a dependency's terminal status is visible before any
//! dependent starts.

use super::error::StackError;
use super::graph::{Graph, NodeId};
use super::types::{CancelToken, FailurePolicy, ModuleStatus, ScheduleOrder, StatusEvent};
use std::collections::{HashSet, VecDeque};
use std::fmt;
use std::path::PathBuf;
use std::sync::{Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

const CANCEL_POLL: Duration = Duration::from_millis(50);

/// Why scheduling of new modules stopped early.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HaltReason {
    /// A module failed under the stop-on-first policy
    FailFast { module: PathBuf },
    /// The run's cancel token tripped
    Interrupted,
    /// Nothing ready, nothing running, modules still pending
    Stalled,
}

impl fmt::Display for HaltReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::FailFast { module } => write!(f, "fail-fast after {} failed", module.display()),
            Self::Interrupted => write!(f, "interrupted by user"),
            Self::Stalled => write!(f, "scheduler stalled"),
        }
    }
}

/// Per-module bookkeeping kept alongside the status.
#[derive(Debug, Clone, Default)]
pub struct ModuleRecord {
    pub error: Option<StackError>,
    /// Failed dependencies this module ran in spite of
    pub upstream_failures: Vec<PathBuf>,
    /// The failed module whose failure skipped this one
    pub skipped_because: Option<PathBuf>,
    pub started: Option<Instant>,
    pub duration: Option<Duration>,
}

/// Final state handed to the run report.
#[derive(Debug, Clone)]
pub struct Outcome {
    pub status: Vec<ModuleStatus>,
    pub records: Vec<ModuleRecord>,
    pub halted: Option<HaltReason>,
}

struct StateTable {
    status: Vec<ModuleStatus>,
    remaining: Vec<usize>,
    ready: VecDeque<NodeId>,
    /// Claimed by a worker but not yet terminal
    in_flight: usize,
    /// Non-terminal modules
    unfinished: usize,
    halted: Option<HaltReason>,
    records: Vec<ModuleRecord>,
}

pub struct Scheduler<'g> {
    graph: &'g Graph,
    order: ScheduleOrder,
    policy: FailurePolicy,
    ignore_dependency_errors: bool,
    table: Mutex<StateTable>,
    ready_cv: Condvar,
}

impl<'g> Scheduler<'g> {
    /// Excluded modules start terminal and count as satisfied prerequisites.
    pub fn new(
        graph: &'g Graph,
        order: ScheduleOrder,
        policy: FailurePolicy,
        ignore_dependency_errors: bool,
    ) -> Self {
        let mut status = vec![ModuleStatus::Pending; graph.len()];
        for id in graph.ids() {
            if graph.module(id).excluded {
                status[id.0] = ModuleStatus::Excluded;
            }
        }

        let remaining: Vec<usize> = graph
            .ids()
            .map(|id| {
                graph
                    .prerequisites(id, order)
                    .iter()
                    .filter(|p| status[p.0] != ModuleStatus::Excluded)
                    .count()
            })
            .collect();

        let ready: VecDeque<NodeId> = graph
            .execution_order(order)
            .into_iter()
            .filter(|id| status[id.0] == ModuleStatus::Pending && remaining[id.0] == 0)
            .collect();

        let unfinished = status
            .iter()
            .filter(|s| **s == ModuleStatus::Pending)
            .count();

        Self {
            graph,
            order,
            policy,
            ignore_dependency_errors,
            table: Mutex::new(StateTable {
                status,
                remaining,
                ready,
                in_flight: 0,
                unfinished,
                halted: None,
                records: vec![ModuleRecord::default(); graph.len()],
            }),
            ready_cv: Condvar::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, StateTable> {
        self.table.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Block until a module is ready and claim it. `None` once the run is
    /// finished or halted.
    pub fn next(&self, cancel: &CancelToken) -> Option<NodeId> {
        let mut table = self.lock();
        loop {
            if cancel.is_cancelled() && table.halted.is_none() {
                self.halt_locked(&mut table, HaltReason::Interrupted);
            }
            if table.halted.is_some() {
                return None;
            }
            if let Some(id) = table.ready.pop_front() {
                table.in_flight += 1;
                return Some(id);
            }
            if table.unfinished == 0 {
                return None;
            }
            if table.in_flight == 0 {
                warn!(pending = table.unfinished, "no module ready and none running");
                self.halt_locked(&mut table, HaltReason::Stalled);
                return None;
            }
            table = match self.ready_cv.wait_timeout(table, CANCEL_POLL) {
                Ok((guard, _)) => guard,
                Err(poisoned) => poisoned.into_inner().0,
            };
        }
    }

    /// Mark a claimed module running. `Ok(false)` if it was cancelled or
    /// skipped after the claim; the worker drops the module.
    pub fn start(&self, id: NodeId) -> Result<bool, StackError> {
        let mut table = self.lock();
        let from = table.status[id.0];
        match from.transition(StatusEvent::Start) {
            Some(to) => {
                table.status[id.0] = to;
                table.records[id.0].started = Some(Instant::now());
                debug!(module = %self.graph.display_path(id), "started");
                Ok(true)
            }
            None if from.is_terminal() => {
                table.in_flight -= 1;
                self.ready_cv.notify_all();
                Ok(false)
            }
            None => Err(self.invalid(id, from, StatusEvent::Start)),
        }
    }

    /// Record a running module's outcome and update its successors.
    pub fn complete(&self, id: NodeId, result: Result<(), StackError>) -> Result<(), StackError> {
        let mut table = self.lock();
        let event = match &result {
            Ok(()) => StatusEvent::Succeed,
            Err(StackError::Cancelled { .. }) => StatusEvent::Cancel,
            Err(_) => StatusEvent::Fail,
        };
        let from = table.status[id.0];
        let to = from
            .transition(event)
            .ok_or_else(|| self.invalid(id, from, event))?;

        table.status[id.0] = to;
        table.in_flight -= 1;
        table.unfinished -= 1;
        let record = &mut table.records[id.0];
        record.duration = record.started.map(|s| s.elapsed());
        record.error = result.err();

        match to {
            ModuleStatus::Succeeded => self.release(&mut table, id),
            ModuleStatus::Failed => {
                if self.ignore_dependency_errors {
                    let failed = self.graph.module(id).path.clone();
                    for s in self.graph.successors(id, self.order) {
                        table.records[s.0].upstream_failures.push(failed.clone());
                    }
                    self.release(&mut table, id);
                } else {
                    self.cascade_skip(&mut table, id);
                }
                if self.policy == FailurePolicy::StopOnFirst {
                    let module = self.graph.module(id).path.clone();
                    self.halt_locked(&mut table, HaltReason::FailFast { module });
                }
            }
            _ => {
                if table.halted.is_none() {
                    self.halt_locked(&mut table, HaltReason::Interrupted);
                }
            }
        }

        self.ready_cv.notify_all();
        Ok(())
    }

    /// Stop scheduling: every pending module becomes cancelled. Running
    /// modules are left to finish.
    pub fn halt(&self, reason: HaltReason) {
        let mut table = self.lock();
        self.halt_locked(&mut table, reason);
    }

    pub fn status(&self, id: NodeId) -> ModuleStatus {
        self.lock().status[id.0]
    }

    pub fn halted(&self) -> Option<HaltReason> {
        self.lock().halted.clone()
    }

    pub fn into_outcome(self) -> Outcome {
        let table = self.table.into_inner().unwrap_or_else(|e| e.into_inner());
        Outcome {
            status: table.status,
            records: table.records,
            halted: table.halted,
        }
    }

    fn release(&self, table: &mut StateTable, id: NodeId) {
        for &s in self.graph.successors(id, self.order) {
            table.remaining[s.0] = table.remaining[s.0].saturating_sub(1);
            if table.remaining[s.0] == 0 && table.status[s.0] == ModuleStatus::Pending {
                table.ready.push_back(s);
            }
        }
    }

    /// Skip every pending transitive successor of `failed`. Walks through
    /// terminal modules so nothing downstream of the failure can start.
    fn cascade_skip(&self, table: &mut StateTable, failed: NodeId) {
        let cause = self.graph.module(failed).path.clone();
        let mut visited: HashSet<NodeId> = HashSet::new();
        let mut stack: Vec<NodeId> = self.graph.successors(failed, self.order).to_vec();

        while let Some(id) = stack.pop() {
            if !visited.insert(id) {
                continue;
            }
            if let Some(to) = table.status[id.0].transition(StatusEvent::SkipForDependency) {
                table.status[id.0] = to;
                table.unfinished -= 1;
                table.records[id.0].skipped_because = Some(cause.clone());
                info!(
                    module = %self.graph.display_path(id),
                    failed = %self.graph.display_path(failed),
                    "skipped due to dependency failure"
                );
            }
            stack.extend(self.graph.successors(id, self.order).iter().copied());
        }
        table.ready.retain(|id| !visited.contains(id));
    }

    fn halt_locked(&self, table: &mut StateTable, reason: HaltReason) {
        if table.halted.is_some() {
            return;
        }
        warn!(%reason, "halting run");
        for id in self.graph.ids() {
            if table.status[id.0] != ModuleStatus::Pending {
                continue;
            }
            table.status[id.0] = ModuleStatus::Cancelled;
            table.unfinished -= 1;
            table.records[id.0].error = Some(StackError::cancelled(
                &self.graph.module(id).path,
                reason.to_string(),
            ));
        }
        table.ready.clear();
        table.halted = Some(reason);
        self.ready_cv.notify_all();
    }

    fn invalid(&self, id: NodeId, from: ModuleStatus, event: StatusEvent) -> StackError {
        StackError::InvalidTransition {
            module: self.graph.module(id).path.clone(),
            from,
            event,
        }
    }
}
