//! SR-011: Local provisioning transport: runs the tool as a subprocess.
//!
//! stdout/stderr are drained on reader threads so a chatty child can never
//! deadlock on a full pipe. Children run in their own process group, so a
//! terminal Ctrl-C reaches only stackrun; on cancellation the child gets
//! exactly one SIGINT, then the grace period, then SIGKILL.

use super::{parse_output_json, ExecOutput, ExecRequest, Provisioner, Termination};
use crate::core::types::{CancelToken, Module, Outputs};
use std::io::Read;
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::thread;
use std::time::Duration;
use tracing::{debug, warn};
use wait_timeout::ChildExt;

const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Default time a child gets to exit after an interrupt.
pub const DEFAULT_GRACE_PERIOD: Duration = Duration::from_secs(10);

/// Terraform-compatible CLI provisioner.
#[derive(Debug, Clone)]
pub struct TerraformCli {
    pub binary: PathBuf,
    pub grace_period: Duration,
}

impl Default for TerraformCli {
    fn default() -> Self {
        Self::new("terraform")
    }
}

impl TerraformCli {
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
            grace_period: DEFAULT_GRACE_PERIOD,
        }
    }

    pub fn with_grace_period(mut self, grace_period: Duration) -> Self {
        self.grace_period = grace_period;
        self
    }
}

impl Provisioner for TerraformCli {
    fn execute(&self, request: &ExecRequest<'_>) -> Result<ExecOutput, String> {
        let module = request.module;
        let mut cmd = Command::new(&self.binary);
        cmd.arg(request.command)
            .args(&module.extra_args)
            .args(request.args)
            .current_dir(&module.working_dir)
            .env("TF_INPUT", "0");

        for (name, outputs) in request.inputs {
            let json = serde_json::to_string(outputs)
                .map_err(|e| format!("cannot encode outputs of '{}': {}", name, e))?;
            cmd.env(format!("TF_VAR_{}", name), json);
        }

        debug!(
            module = %module.path.display(),
            command = request.command,
            "spawning provisioner"
        );
        run_interruptible(cmd, request.cancel, self.grace_period)
    }

    fn inspect_outputs(&self, module: &Module, cancel: &CancelToken) -> Result<Outputs, String> {
        let mut cmd = Command::new(&self.binary);
        cmd.args(["output", "-json"])
            .current_dir(&module.working_dir)
            .env("TF_INPUT", "0");
        let output = run_interruptible(cmd, cancel, self.grace_period)?;

        match output.termination {
            Termination::Exited if output.success() => parse_output_json(&output.stdout),
            Termination::Exited => Err(format!(
                "output inspection exit code {}: {}",
                output.exit_code,
                output.stderr.trim()
            )),
            Termination::Interrupted | Termination::ForceKilled => {
                Err("output inspection interrupted".to_string())
            }
        }
    }

    fn has_persisted_state(&self, module: &Module) -> bool {
        let dir = &module.working_dir;
        dir.join("terraform.tfstate").exists() || dir.join(".terraform").join("terraform.tfstate").exists()
    }
}

/// Run a command to completion, interrupting it when `cancel` trips.
pub fn run_interruptible(
    mut cmd: Command,
    cancel: &CancelToken,
    grace_period: Duration,
) -> Result<ExecOutput, String> {
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        cmd.process_group(0);
    }

    let mut child = cmd
        .spawn()
        .map_err(|e| format!("failed to spawn {:?}: {}", cmd.get_program(), e))?;

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| "stdout was not piped".to_string())?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| "stderr was not piped".to_string())?;
    let stdout_handle = thread::spawn(move || read_stream(stdout));
    let stderr_handle = thread::spawn(move || read_stream(stderr));

    let mut termination = Termination::Exited;
    let status = loop {
        if let Some(status) = child
            .wait_timeout(POLL_INTERVAL)
            .map_err(|e| format!("wait error: {}", e))?
        {
            break status;
        }
        if !cancel.is_cancelled() {
            continue;
        }

        warn!(pid = child.id(), "run cancelled, interrupting provisioner");
        send_interrupt(child.id());
        match child
            .wait_timeout(grace_period)
            .map_err(|e| format!("wait error: {}", e))?
        {
            Some(status) => {
                termination = Termination::Interrupted;
                break status;
            }
            None => {
                warn!(
                    pid = child.id(),
                    grace_secs = grace_period.as_secs_f64(),
                    "grace period expired, killing provisioner"
                );
                child.kill().map_err(|e| format!("kill error: {}", e))?;
                termination = Termination::ForceKilled;
                break child.wait().map_err(|e| format!("wait error: {}", e))?;
            }
        }
    };

    let stdout = join_output(stdout_handle)?;
    let stderr = join_output(stderr_handle)?;

    Ok(ExecOutput {
        exit_code: status.code().unwrap_or(-1),
        stdout,
        stderr,
        termination,
    })
}

/// SIGINT via `kill(1)`; the tool's own interrupt contract takes it from there.
fn send_interrupt(pid: u32) {
    let result = Command::new("kill")
        .args(["-INT", &pid.to_string()])
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status();
    if let Err(e) = result {
        warn!(pid, err = %e, "failed to send interrupt");
    }
}

fn read_stream(mut stream: impl Read) -> std::io::Result<String> {
    let mut buf = Vec::new();
    stream.read_to_end(&mut buf)?;
    Ok(String::from_utf8_lossy(&buf).to_string())
}

fn join_output(handle: thread::JoinHandle<std::io::Result<String>>) -> Result<String, String> {
    match handle.join() {
        Ok(result) => result.map_err(|e| format!("output read error: {}", e)),
        Err(_) => Err("output reader thread panicked".to_string()),
    }
}
