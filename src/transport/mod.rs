//! SR-010: Provisioning tool contract: execution and output inspection.
//!
//! The stack engine never shells out directly; it goes through a
//! `Provisioner`. `local` drives the real tool as a subprocess.

pub mod local;

use crate::core::types::{CancelToken, DependencyInputs, Module, Outputs};
use std::path::PathBuf;

/// How a provisioning process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    /// Exited on its own
    Exited,
    /// Exited within the grace period after an interrupt
    Interrupted,
    /// Killed after the grace period expired
    ForceKilled,
}

/// Output from one provisioning invocation.
#[derive(Debug, Clone)]
pub struct ExecOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub termination: Termination,
}

impl ExecOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0 && self.termination != Termination::ForceKilled
    }
}

/// Everything the tool needs to act on one module.
#[derive(Debug)]
pub struct ExecRequest<'a> {
    pub module: &'a Module,
    pub command: &'a str,
    pub args: &'a [String],
    /// Resolved dependency outputs, keyed by dependency name
    pub inputs: &'a DependencyInputs,
    pub cancel: &'a CancelToken,
}

/// The external provisioning tool.
pub trait Provisioner: Send + Sync {
    /// Run `command` for a module. `Err` means the process could not be
    /// run at all; a non-zero exit is an `Ok` with that exit code.
    fn execute(&self, request: &ExecRequest<'_>) -> Result<ExecOutput, String>;

    /// Read-only output inspection against the module's live working
    /// directory or persisted state. Must return promptly once `cancel`
    /// trips.
    fn inspect_outputs(&self, module: &Module, cancel: &CancelToken) -> Result<Outputs, String>;

    /// Whether the module has state from a prior run.
    fn has_persisted_state(&self, module: &Module) -> bool;

    /// Key under which concurrent runs are mutually excluded.
    fn lock_key(&self, module: &Module) -> PathBuf {
        module.working_dir.clone()
    }
}

/// Parse `output -json` style output: `{"name": {"value": ..., ...}}`.
/// Entries without a `value` wrapper are taken as-is.
pub fn parse_output_json(json: &str) -> Result<Outputs, String> {
    if json.trim().is_empty() {
        return Ok(Outputs::new());
    }
    let raw: indexmap::IndexMap<String, serde_json::Value> =
        serde_json::from_str(json).map_err(|e| format!("invalid output JSON: {}", e))?;
    Ok(raw
        .into_iter()
        .map(|(name, entry)| {
            let value = match entry {
                serde_json::Value::Object(mut obj) if obj.contains_key("value") => {
                    obj.remove("value").unwrap_or(serde_json::Value::Null)
                }
                other => other,
            };
            (name, value)
        })
        .collect())
}
