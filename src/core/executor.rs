//! SR-010: Stack executor: bounded worker pool over the scheduler.
//!
//! Each worker: claim ready module → directory lock → running → resolve
//! dependency outputs → provisioning tool → classify → terminal status.
//! Output resolution happens immediately before the action so outputs
//! applied earlier in the same run are visible.

use super::error::{ExecutionFailure, StackError};
use super::graph::{Graph, NodeId};
use super::locks::{DirGuard, DirLocks};
use super::report::RunReport;
use super::resolver::OutputResolver;
use super::scheduler::Scheduler;
use super::types::{ModuleStatus, RunEvent, RunOptions, ScheduleOrder};
use crate::provenance::eventlog::{self, EventLog};
use crate::provenance::hasher;
use crate::transport::{ExecOutput, ExecRequest, Provisioner, Termination};
use std::io::Write;
use std::time::Instant;
use tracing::{debug, error, info, warn};

/// Run `options.command` across every module of the graph.
pub fn run_stack(graph: &Graph, provisioner: &dyn Provisioner, options: &RunOptions) -> RunReport {
    let start = Instant::now();
    let order = ScheduleOrder::for_command(&options.command);
    let run_id = eventlog::generate_run_id();
    let workers = options.parallelism.clamp(1, graph.len().max(1));

    let log = options
        .log_dir
        .as_ref()
        .and_then(|dir| match EventLog::open(dir, &run_id) {
            Ok(log) => Some(log),
            Err(e) => {
                warn!(err = %e, "event log disabled");
                None
            }
        });

    let ctx = Worker {
        graph,
        provisioner,
        options,
        scheduler: Scheduler::new(
            graph,
            order,
            options.failure_policy,
            options.ignore_dependency_errors,
        ),
        resolver: OutputResolver::new(graph, provisioner, &options.command)
            .with_cancel(options.cancel.clone()),
        locks: DirLocks::new(),
        log: log.as_ref(),
    };

    ctx.record(RunEvent::RunStarted {
        run_id: run_id.clone(),
        command: options.command.clone(),
        modules: graph.len(),
        parallelism: workers,
        stackrun_version: env!("CARGO_PKG_VERSION").to_string(),
    });
    info!(
        run_id = %run_id,
        command = %options.command,
        modules = graph.len(),
        workers,
        ?order,
        "run started"
    );

    std::thread::scope(|s| {
        for _ in 0..workers {
            s.spawn(|| ctx.work());
        }
    });

    let Worker {
        scheduler, log, ..
    } = ctx;
    let report = RunReport::from_run(
        graph,
        order,
        &options.command,
        scheduler.into_outcome(),
        start.elapsed(),
    );

    if let Some(log) = log {
        record_unstarted(log, &report);
        append(
            log,
            RunEvent::RunCompleted {
                run_id,
                succeeded: report.count(ModuleStatus::Succeeded),
                failed: report.count(ModuleStatus::Failed),
                skipped: report.count(ModuleStatus::Skipped),
                excluded: report.count(ModuleStatus::Excluded),
                cancelled: report.count(ModuleStatus::Cancelled),
                total_seconds: report.duration.as_secs_f64(),
            },
        );
    }
    info!(summary = %report.summary_line(), "run finished");
    report
}

struct Worker<'a> {
    graph: &'a Graph,
    provisioner: &'a dyn Provisioner,
    options: &'a RunOptions,
    scheduler: Scheduler<'a>,
    resolver: OutputResolver<'a>,
    locks: DirLocks,
    log: Option<&'a EventLog>,
}

impl Worker<'_> {
    fn work(&self) {
        while let Some(id) = self.scheduler.next(&self.options.cancel) {
            let module = self.graph.module(id);
            let guard = self
                .locks
                .acquire(&self.provisioner.lock_key(module), &module.path);

            match self.scheduler.start(id) {
                Ok(true) => {}
                Ok(false) => continue,
                Err(e) => {
                    error!(err = %e, "scheduler rejected start");
                    continue;
                }
            }
            let name = self.graph.display_path(id);
            self.record(RunEvent::ModuleStarted {
                module: name.clone(),
                config_hash: hasher::hash_module(module),
            });

            let started = Instant::now();
            let result = self.run_module(id, &name, &guard);
            match &result {
                Ok(()) => {
                    info!(module = %name, "succeeded");
                    self.record(RunEvent::ModuleSucceeded {
                        module: name.clone(),
                        duration_seconds: started.elapsed().as_secs_f64(),
                    });
                }
                Err(StackError::Cancelled { reason, .. }) => {
                    warn!(module = %name, %reason, "cancelled");
                    self.record(RunEvent::ModuleCancelled {
                        module: name.clone(),
                        reason: reason.clone(),
                    });
                }
                Err(e) => {
                    error!(module = %name, err = %e, "failed");
                    self.record(RunEvent::ModuleFailed {
                        module: name.clone(),
                        kind: e.kind().to_string(),
                        error: e.to_string(),
                    });
                }
            }

            if let Err(e) = self.scheduler.complete(id, result) {
                error!(err = %e, "scheduler rejected completion");
            }
        }
    }

    fn run_module(
        &self,
        id: NodeId,
        name: &str,
        guard: &DirGuard<'_>,
    ) -> Result<(), StackError> {
        let module = self.graph.module(id);
        let cancel = &self.options.cancel;
        if cancel.is_cancelled() {
            return Err(StackError::cancelled(&module.path, "interrupted before start"));
        }

        let inputs = self
            .resolver
            .resolve_all(
                id,
                |dep| self.scheduler.status(dep),
                self.options.ignore_dependency_errors,
            )
            .map_err(|e| {
                if cancel.is_cancelled() {
                    StackError::cancelled(&module.path, "interrupted during output resolution")
                } else {
                    e
                }
            })?;
        debug!(module = %name, dependencies = inputs.len(), "outputs resolved");
        guard.verify()?;

        let request = ExecRequest {
            module,
            command: &self.options.command,
            args: &self.options.args,
            inputs: &inputs,
            cancel,
        };
        let output = self
            .provisioner
            .execute(&request)
            .map_err(|reason| StackError::Execution {
                module: module.path.clone(),
                failure: ExecutionFailure::Crashed(reason),
                stderr: String::new(),
            })?;

        if self.options.echo_output {
            emit_prefixed(name, &output);
        }
        classify(module.path.as_path(), output, cancel.is_cancelled())
    }

    fn record(&self, event: RunEvent) {
        if let Some(log) = self.log {
            append(log, event);
        }
    }
}

/// Map a finished invocation onto the error taxonomy.
fn classify(module: &std::path::Path, output: ExecOutput, cancelled: bool) -> Result<(), StackError> {
    match output.termination {
        Termination::ForceKilled => Err(StackError::Execution {
            module: module.to_path_buf(),
            failure: ExecutionFailure::ForceKilled,
            stderr: output.stderr,
        }),
        _ if output.success() => Ok(()),
        Termination::Interrupted => Err(StackError::cancelled(module, "interrupted by user")),
        Termination::Exited if cancelled => {
            Err(StackError::cancelled(module, "interrupted by user"))
        }
        Termination::Exited => Err(StackError::Execution {
            module: module.to_path_buf(),
            failure: ExecutionFailure::ExitCode(output.exit_code),
            stderr: output.stderr,
        }),
    }
}

/// Flush one module's captured streams as a single block, every line
/// prefixed with the module path.
fn emit_prefixed(name: &str, output: &ExecOutput) {
    if !output.stdout.is_empty() {
        let mut out = std::io::stdout().lock();
        for line in output.stdout.lines() {
            let _ = writeln!(out, "[{}] {}", name, line);
        }
    }
    if !output.stderr.is_empty() {
        let mut err = std::io::stderr().lock();
        for line in output.stderr.lines() {
            let _ = writeln!(err, "[{}] {}", name, line);
        }
    }
}

fn append(log: &EventLog, event: RunEvent) {
    if let Err(e) = log.append(event) {
        warn!(err = %e, "event log write failed");
    }
}

/// Events for modules no worker ever ran.
fn record_unstarted(log: &EventLog, report: &RunReport) {
    for entry in &report.entries {
        match entry.status {
            ModuleStatus::Skipped => append(
                log,
                RunEvent::ModuleSkipped {
                    module: entry.display.clone(),
                    failed_dependency: entry
                        .skipped_because
                        .as_ref()
                        .map(|p| p.display().to_string())
                        .unwrap_or_default(),
                },
            ),
            ModuleStatus::Cancelled if entry.duration.is_none() => append(
                log,
                RunEvent::ModuleCancelled {
                    module: entry.display.clone(),
                    reason: entry
                        .error
                        .as_ref()
                        .map(|e| e.to_string())
                        .unwrap_or_default(),
                },
            ),
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::graph::build_graph;
    use crate::core::registry::Registry;
    use crate::core::scheduler::HaltReason;
    use crate::core::testing::{outputs, path, registry, FakeProvisioner};
    use crate::core::types::{CancelToken, Dependency, FailurePolicy, Module, Outputs};
    use serde_json::json;
    use std::time::Duration;

    fn options(command: &str, parallelism: usize) -> RunOptions {
        let mut opts = RunOptions::new(command);
        opts.parallelism = parallelism;
        opts
    }

    fn status(report: &RunReport, name: &str) -> ModuleStatus {
        report.entry(&path(name)).unwrap().status
    }

    #[test]
    fn test_sr010_diamond_order_and_concurrency() {
        let graph = build_graph(&registry(&[("a", &[]), ("b", &["a"]), ("c", &["a"])])).unwrap();
        let fake = FakeProvisioner::new().with_delay(Duration::from_millis(100));
        let report = run_stack(&graph, &fake, &options("apply", 2));

        assert!(report.is_success());
        let (_, a_end) = fake.interval("a").unwrap();
        let (b_start, b_end) = fake.interval("b").unwrap();
        let (c_start, c_end) = fake.interval("c").unwrap();
        assert!(b_start >= a_end);
        assert!(c_start >= a_end);
        // b and c overlap in wall-clock time
        assert!(b_start < c_end && c_start < b_end);
        assert_eq!(fake.max_active(), 2);
    }

    #[test]
    fn test_sr010_concurrency_bound() {
        let names: Vec<String> = (0..12).map(|i| format!("m{i:02}")).collect();
        let entries: Vec<(&str, &[&str])> = names.iter().map(|n| (n.as_str(), &[][..])).collect();
        let graph = build_graph(&registry(&entries)).unwrap();
        for p in [1, 3, 5] {
            let fake = FakeProvisioner::new().with_delay(Duration::from_millis(20));
            let report = run_stack(&graph, &fake, &options("plan", p));
            assert_eq!(report.count(ModuleStatus::Succeeded), 12);
            assert!(fake.max_active() <= p, "P={p} saw {}", fake.max_active());
        }
    }

    #[test]
    fn test_sr010_shared_working_dir_never_overlaps() {
        let modules: Vec<Module> = (0..6)
            .map(|i| {
                let m = Module::new(path(&format!("m{i}")));
                if i % 2 == 0 {
                    m.with_working_dir("/s/shared")
                } else {
                    m
                }
            })
            .collect();
        let graph = build_graph(&Registry::from_modules("/s", modules)).unwrap();
        let fake = FakeProvisioner::new().with_delay(Duration::from_millis(30));
        let report = run_stack(&graph, &fake, &options("apply", 6));
        assert!(report.is_success());
        assert!(!fake.dir_overlap());
        let (s0, e0) = fake.interval("m0").unwrap();
        let (s2, e2) = fake.interval("m2").unwrap();
        assert!(e0 <= s2 || e2 <= s0);
    }

    #[test]
    fn test_sr010_failure_skips_dependents_only() {
        let graph = build_graph(&registry(&[
            ("a", &[]),
            ("b", &["a"]),
            ("c", &["b"]),
            ("x", &[]),
            ("y", &["x"]),
        ]))
        .unwrap();
        let fake = FakeProvisioner::new().failing("a");
        let report = run_stack(&graph, &fake, &options("apply", 2));

        assert_eq!(status(&report, "a"), ModuleStatus::Failed);
        assert_eq!(status(&report, "b"), ModuleStatus::Skipped);
        assert_eq!(status(&report, "c"), ModuleStatus::Skipped);
        assert_eq!(status(&report, "x"), ModuleStatus::Succeeded);
        assert_eq!(status(&report, "y"), ModuleStatus::Succeeded);
        assert_eq!(report.exit_code(), 1);

        let err = report.entry(&path("a")).unwrap().error.as_ref().unwrap();
        match err {
            StackError::Execution { failure, stderr, .. } => {
                assert_eq!(*failure, ExecutionFailure::ExitCode(1));
                assert!(stderr.contains("provisioning failed"));
            }
            other => panic!("expected execution error, got {other}"),
        }
        assert!(!fake.executed().contains(&"b".to_string()));
    }

    #[test]
    fn test_sr010_excluded_dependency_with_mocks() {
        let reg = Registry::from_modules(
            "/s",
            vec![
                Module::new(path("a")).excluded(),
                Module::new(path("b")).with_dependency(
                    Dependency::new("a", path("a")).with_mocks(outputs(&[("x", json!(42))])),
                ),
            ],
        );
        let graph = build_graph(&reg).unwrap();
        let fake = FakeProvisioner::new();
        let report = run_stack(&graph, &fake, &options("apply", 2));

        assert!(report.is_success());
        assert_eq!(status(&report, "a"), ModuleStatus::Excluded);
        assert_eq!(fake.executed(), vec!["b"]);
        assert_eq!(fake.inputs_of("b").unwrap()["a"]["x"], json!(42));
        assert_eq!(fake.inspections("a"), 0);
    }

    #[test]
    fn test_sr010_excluded_dependency_without_mocks_fails_dependent() {
        let reg = Registry::from_modules(
            "/s",
            vec![
                Module::new(path("a")).excluded(),
                Module::new(path("b")).with_dependency(Dependency::new("a", path("a"))),
                Module::new(path("c")).with_dependency(Dependency::new("b", path("b"))),
            ],
        );
        let graph = build_graph(&reg).unwrap();
        let fake = FakeProvisioner::new();
        let report = run_stack(&graph, &fake, &options("apply", 2));

        assert_eq!(status(&report, "b"), ModuleStatus::Failed);
        assert_eq!(status(&report, "c"), ModuleStatus::Skipped);
        let err = report.entry(&path("b")).unwrap().error.as_ref().unwrap();
        assert_eq!(err.kind(), "output_resolution");
        assert!(fake.executed().is_empty());
    }

    #[test]
    fn test_sr010_applied_outputs_flow_to_dependents() {
        let graph = build_graph(&registry(&[("vpc", &[]), ("app", &["vpc"])])).unwrap();
        let fake = FakeProvisioner::new().outputs("vpc", outputs(&[("id", json!("vpc-9"))]));
        let report = run_stack(&graph, &fake, &options("apply", 2));
        assert!(report.is_success());
        assert_eq!(fake.inputs_of("app").unwrap()["vpc"]["id"], json!("vpc-9"));
        assert_eq!(fake.inputs_of("vpc").unwrap().len(), 0);
    }

    #[test]
    fn test_sr010_ignore_dependency_errors_degraded_success() {
        let reg = Registry::from_modules(
            "/s",
            vec![
                Module::new(path("a")),
                Module::new(path("b")).with_dependency(Dependency::new("a", path("a"))),
            ],
        );
        let graph = build_graph(&reg).unwrap();
        let fake = FakeProvisioner::new().failing("a");
        let mut opts = options("apply", 2);
        opts.ignore_dependency_errors = true;
        let report = run_stack(&graph, &fake, &opts);

        assert_eq!(status(&report, "a"), ModuleStatus::Failed);
        assert_eq!(status(&report, "b"), ModuleStatus::Succeeded);
        let b = report.entry(&path("b")).unwrap();
        assert!(b.is_degraded());
        assert_eq!(b.label(), "SUCCEEDED (dependency errors)");
        assert!(fake.inputs_of("b").unwrap()["a"].is_empty());
        assert!(!report.is_success());
    }

    #[test]
    fn test_sr010_fail_fast_lets_in_flight_finish() {
        let graph = build_graph(&registry(&[
            ("a", &[]),
            ("slow", &[]),
            ("after", &["slow"]),
            ("z1", &[]),
            ("z2", &[]),
        ]))
        .unwrap();
        let fake = FakeProvisioner::new()
            .slow("a", Duration::from_millis(50))
            .slow("slow", Duration::from_millis(300))
            .failing("a");
        let mut opts = options("apply", 2);
        opts.failure_policy = FailurePolicy::StopOnFirst;
        let report = run_stack(&graph, &fake, &opts);

        assert_eq!(status(&report, "a"), ModuleStatus::Failed);
        // started alongside a, allowed to finish
        assert_eq!(status(&report, "slow"), ModuleStatus::Succeeded);
        assert_eq!(status(&report, "after"), ModuleStatus::Cancelled);
        assert_eq!(status(&report, "z1"), ModuleStatus::Cancelled);
        assert_eq!(status(&report, "z2"), ModuleStatus::Cancelled);
        assert_eq!(
            report.halted,
            Some(HaltReason::FailFast { module: path("a") })
        );
        assert_eq!(report.exit_code(), 1);
    }

    #[test]
    fn test_sr010_interrupt_cancels_running_and_pending() {
        let graph =
            build_graph(&registry(&[("hang", &[]), ("next", &["hang"]), ("other", &["hang"])]))
                .unwrap();
        let fake = FakeProvisioner::new().hanging("hang");
        let opts = options("apply", 2);
        let cancel: CancelToken = opts.cancel.clone();

        let report = std::thread::scope(|s| {
            let run = s.spawn(|| run_stack(&graph, &fake, &opts));
            while fake.executed().is_empty() {
                std::thread::sleep(Duration::from_millis(5));
            }
            cancel.cancel();
            run.join().unwrap()
        });

        assert!(report.interrupted());
        assert_eq!(report.exit_code(), 130);
        assert!(report
            .entries
            .iter()
            .all(|e| e.status == ModuleStatus::Cancelled));
        assert_eq!(fake.executed(), vec!["hang"]);
    }

    #[test]
    fn test_sr010_destroy_runs_in_reverse() {
        let graph = build_graph(&registry(&[("a", &[]), ("b", &["a"]), ("c", &["b"])])).unwrap();
        let fake = FakeProvisioner::new()
            .persisted("a")
            .persisted("b")
            .persisted("c");
        let report = run_stack(&graph, &fake, &options("destroy", 3));
        assert!(report.is_success());
        assert_eq!(fake.executed(), vec!["c", "b", "a"]);
        let order: Vec<_> = report.entries.iter().map(|e| e.display.as_str()).collect();
        assert_eq!(order, vec!["c", "b", "a"]);
        // dependency outputs came from persisted state, read once each
        assert_eq!(fake.inputs_of("c").unwrap()["b"]["id"], json!("/s/b"));
        assert_eq!(fake.inspections("b"), 1);
    }

    #[test]
    fn test_sr010_destroy_without_state_fails_first_dependent() {
        let graph = build_graph(&registry(&[("a", &[]), ("b", &["a"]), ("c", &["b"])])).unwrap();
        let fake = FakeProvisioner::new();
        let report = run_stack(&graph, &fake, &options("destroy", 3));

        assert_eq!(status(&report, "c"), ModuleStatus::Failed);
        let err = report.entry(&path("c")).unwrap().error.as_ref().unwrap();
        assert_eq!(err.kind(), "output_resolution");
        // in reverse order b and a come after c
        assert_eq!(status(&report, "b"), ModuleStatus::Skipped);
        assert_eq!(status(&report, "a"), ModuleStatus::Skipped);
        assert!(fake.executed().is_empty());
    }

    #[test]
    fn test_sr010_dependency_without_outputs_fails_dependent() {
        let graph = build_graph(&registry(&[("a", &[]), ("b", &["a"])])).unwrap();
        let fake = FakeProvisioner::new().outputs("a", Outputs::new());
        let report = run_stack(&graph, &fake, &options("plan", 2));

        assert_eq!(status(&report, "a"), ModuleStatus::Succeeded);
        assert_eq!(status(&report, "b"), ModuleStatus::Failed);
        let err = report.entry(&path("b")).unwrap().error.as_ref().unwrap();
        assert_eq!(err.kind(), "output_resolution");
        assert_eq!(fake.executed(), vec!["a"]);
    }

    #[test]
    fn test_sr010_interrupt_during_output_resolution() {
        let graph = build_graph(&registry(&[("a", &[]), ("b", &["a"])])).unwrap();
        let fake = FakeProvisioner::new().hanging_outputs("a");
        let opts = options("apply", 2);
        let cancel = opts.cancel.clone();

        let report = std::thread::scope(|s| {
            let run = s.spawn(|| run_stack(&graph, &fake, &opts));
            while fake.inspections("a") == 0 {
                std::thread::sleep(Duration::from_millis(5));
            }
            cancel.cancel();
            run.join().unwrap()
        });

        assert_eq!(status(&report, "a"), ModuleStatus::Succeeded);
        assert_eq!(status(&report, "b"), ModuleStatus::Cancelled);
        assert!(report.interrupted());
        assert_eq!(report.exit_code(), 130);
        assert_eq!(fake.executed(), vec!["a"]);
    }

    #[test]
    fn test_sr010_event_log_records_run() {
        let dir = tempfile::tempdir().unwrap();
        let graph = build_graph(&registry(&[("a", &[]), ("b", &["a"])])).unwrap();
        let fake = FakeProvisioner::new().failing("a");
        let mut opts = options("apply", 1);
        opts.log_dir = Some(dir.path().to_path_buf());
        run_stack(&graph, &fake, &opts);

        let log_file = std::fs::read_dir(dir.path())
            .unwrap()
            .next()
            .unwrap()
            .unwrap()
            .path();
        let events = eventlog::read_events(&log_file).unwrap();
        let tags: Vec<String> = events
            .iter()
            .map(|e| {
                serde_json::to_value(&e.event).unwrap()["event"]
                    .as_str()
                    .unwrap()
                    .to_string()
            })
            .collect();
        assert_eq!(
            tags,
            vec![
                "run_started",
                "module_started",
                "module_failed",
                "module_skipped",
                "run_completed"
            ]
        );
        match &events[1].event {
            RunEvent::ModuleStarted { config_hash, .. } => {
                assert!(config_hash.starts_with("blake3:"))
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_sr010_classify() {
        let out = |exit_code, termination| ExecOutput {
            exit_code,
            stdout: String::new(),
            stderr: "e".to_string(),
            termination,
        };
        let p = std::path::Path::new("/s/a");
        assert!(classify(p, out(0, Termination::Exited), false).is_ok());
        assert!(matches!(
            classify(p, out(3, Termination::Exited), false),
            Err(StackError::Execution {
                failure: ExecutionFailure::ExitCode(3),
                ..
            })
        ));
        assert!(matches!(
            classify(p, out(130, Termination::Interrupted), true),
            Err(StackError::Cancelled { .. })
        ));
        assert!(matches!(
            classify(p, out(1, Termination::Exited), true),
            Err(StackError::Cancelled { .. })
        ));
        assert!(matches!(
            classify(p, out(-1, Termination::ForceKilled), true),
            Err(StackError::Execution {
                failure: ExecutionFailure::ForceKilled,
                ..
            })
        ));
    }

    #[test]
    fn test_sr010_empty_graph() {
        let graph = build_graph(&Registry::new("/s")).unwrap();
        let report = run_stack(&graph, &FakeProvisioner::new(), &options("apply", 4));
        assert!(report.is_success());
        assert!(report.entries.is_empty());
    }
}
