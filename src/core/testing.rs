//! Test fixtures shared by the core test modules: small in-memory stacks and
//! a provisioner that records how it was driven.

use super::registry::Registry;
use super::types::{CancelToken, Dependency, DependencyInputs, Module, Outputs};
use crate::transport::{ExecOutput, ExecRequest, Provisioner, Termination};
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// `/s/<name>`.
pub(crate) fn path(name: &str) -> PathBuf {
    PathBuf::from(format!("/s/{name}"))
}

/// Registry rooted at `/s` from `(name, [dependency names])` pairs.
pub(crate) fn registry(entries: &[(&str, &[&str])]) -> Registry {
    Registry::from_modules(
        "/s",
        entries.iter().map(|(name, deps)| {
            deps.iter().fold(Module::new(path(name)), |m, d| {
                m.with_dependency(Dependency::new(*d, path(d)))
            })
        }),
    )
}

pub(crate) fn outputs(pairs: &[(&str, serde_json::Value)]) -> Outputs {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.clone()))
        .collect()
}

#[derive(Default)]
struct FakeState {
    active: usize,
    max_active: usize,
    active_dirs: HashSet<PathBuf>,
    dir_overlap: bool,
    executed: Vec<PathBuf>,
    inputs: HashMap<PathBuf, DependencyInputs>,
    inspections: HashMap<PathBuf, usize>,
    intervals: HashMap<PathBuf, (Instant, Instant)>,
}

/// In-memory provisioner. Modules succeed unless marked failing; hanging
/// modules block until the run is cancelled. Inspection returns the
/// configured outputs, or `{"id": <module path>}` when none were set.
#[derive(Default)]
pub(crate) struct FakeProvisioner {
    delay: Duration,
    delays: HashMap<PathBuf, Duration>,
    failing: HashSet<PathBuf>,
    hanging: HashSet<PathBuf>,
    hanging_outputs: HashSet<PathBuf>,
    persisted: HashSet<PathBuf>,
    outputs: HashMap<PathBuf, Outputs>,
    state: Mutex<FakeState>,
}

impl FakeProvisioner {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub(crate) fn slow(mut self, name: &str, delay: Duration) -> Self {
        self.delays.insert(path(name), delay);
        self
    }

    pub(crate) fn failing(mut self, name: &str) -> Self {
        self.failing.insert(path(name));
        self
    }

    pub(crate) fn hanging(mut self, name: &str) -> Self {
        self.hanging.insert(path(name));
        self
    }

    /// Output inspection of `name` blocks until the run is cancelled.
    pub(crate) fn hanging_outputs(mut self, name: &str) -> Self {
        self.hanging_outputs.insert(path(name));
        self
    }

    pub(crate) fn persisted(mut self, name: &str) -> Self {
        self.persisted.insert(path(name));
        self
    }

    pub(crate) fn outputs(mut self, name: &str, values: Outputs) -> Self {
        self.outputs.insert(path(name), values);
        self
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, FakeState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub(crate) fn max_active(&self) -> usize {
        self.lock().max_active
    }

    pub(crate) fn dir_overlap(&self) -> bool {
        self.lock().dir_overlap
    }

    /// Executed module names, in start order.
    pub(crate) fn executed(&self) -> Vec<String> {
        self.lock()
            .executed
            .iter()
            .map(|p| p.strip_prefix("/s").unwrap_or(p).display().to_string())
            .collect()
    }

    pub(crate) fn inputs_of(&self, name: &str) -> Option<DependencyInputs> {
        self.lock().inputs.get(&path(name)).cloned()
    }

    pub(crate) fn inspections(&self, name: &str) -> usize {
        self.lock().inspections.get(&path(name)).copied().unwrap_or(0)
    }

    pub(crate) fn interval(&self, name: &str) -> Option<(Instant, Instant)> {
        self.lock().intervals.get(&path(name)).copied()
    }
}

impl Provisioner for FakeProvisioner {
    fn execute(&self, request: &ExecRequest<'_>) -> Result<ExecOutput, String> {
        let module = request.module;
        let start = Instant::now();
        {
            let mut state = self.lock();
            state.active += 1;
            state.max_active = state.max_active.max(state.active);
            if !state.active_dirs.insert(module.working_dir.clone()) {
                state.dir_overlap = true;
            }
            state.executed.push(module.path.clone());
            state
                .inputs
                .insert(module.path.clone(), request.inputs.clone());
        }

        let mut termination = Termination::Exited;
        if self.hanging.contains(&module.path) {
            while !request.cancel.is_cancelled() {
                std::thread::sleep(Duration::from_millis(5));
            }
            termination = Termination::Interrupted;
        } else {
            let delay = self.delays.get(&module.path).copied().unwrap_or(self.delay);
            if !delay.is_zero() {
                std::thread::sleep(delay);
            }
        }

        {
            let mut state = self.lock();
            state.active -= 1;
            state.active_dirs.remove(&module.working_dir);
            state
                .intervals
                .insert(module.path.clone(), (start, Instant::now()));
        }

        let exit_code = match termination {
            Termination::Interrupted => 130,
            _ if self.failing.contains(&module.path) => 1,
            _ => 0,
        };
        Ok(ExecOutput {
            exit_code,
            stdout: format!("ran {}\n", request.command),
            stderr: if exit_code == 0 {
                String::new()
            } else {
                "Error: provisioning failed\n".to_string()
            },
            termination,
        })
    }

    fn inspect_outputs(&self, module: &Module, cancel: &CancelToken) -> Result<Outputs, String> {
        *self
            .lock()
            .inspections
            .entry(module.path.clone())
            .or_insert(0) += 1;
        if self.hanging_outputs.contains(&module.path) {
            while !cancel.is_cancelled() {
                std::thread::sleep(Duration::from_millis(5));
            }
            return Err("output inspection interrupted".to_string());
        }
        Ok(self.outputs.get(&module.path).cloned().unwrap_or_else(|| {
            outputs(&[(
                "id",
                serde_json::Value::String(module.path.display().to_string()),
            )])
        }))
    }

    fn has_persisted_state(&self, module: &Module) -> bool {
        self.persisted.contains(&module.path)
    }
}
