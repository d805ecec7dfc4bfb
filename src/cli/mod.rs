//! SR-014: CLI subcommands: graph-dependencies, output-module-groups,
//! validate-stack, run-all.

use crate::core::executor;
use crate::core::graph::{build_graph, Graph};
use crate::core::parser;
use crate::core::registry::{Registry, Selection};
use crate::core::report::EXIT_INTERRUPTED;
use crate::core::types::{default_parallelism, CancelToken, FailurePolicy, RunOptions};
use crate::transport::local::TerraformCli;
use clap::{Args, Subcommand};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::warn;

/// Module selection flags shared by every subcommand.
#[derive(Args, Debug, Clone, Default)]
pub struct SelectionArgs {
    /// Only include modules matching this glob (relative to the stack root)
    #[arg(long = "include-dir", value_name = "GLOB")]
    pub include_dirs: Vec<String>,

    /// Exclude modules matching this glob; wins over --include-dir
    #[arg(long = "exclude-dir", value_name = "GLOB")]
    pub exclude_dirs: Vec<String>,

    /// Do not pull in dependencies of included modules
    #[arg(long)]
    pub strict_include: bool,
}

#[derive(Args, Debug, Clone)]
pub struct RunAllArgs {
    /// Provisioning command (apply, plan, destroy, ...)
    pub command: String,

    /// Arguments passed to every module invocation (after `--`)
    #[arg(last = true)]
    pub args: Vec<String>,

    /// Maximum modules running at once (default: available CPUs)
    #[arg(long)]
    pub parallelism: Option<usize>,

    /// Stop scheduling new modules after the first failure
    #[arg(long)]
    pub fail_fast: bool,

    /// Run dependents of failed modules with best-effort outputs
    #[arg(long)]
    pub ignore_dependency_errors: bool,

    #[command(flatten)]
    pub selection: SelectionArgs,

    /// Provisioning tool binary
    #[arg(long, default_value = "terraform")]
    pub tf_path: PathBuf,

    /// Seconds an interrupted module gets before it is killed
    #[arg(long, default_value_t = 10)]
    pub grace_period_secs: u64,

    /// Write a JSONL run event log into this directory
    #[arg(long)]
    pub log_dir: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Print the module dependency graph in Graphviz DOT format
    GraphDependencies {
        #[command(flatten)]
        selection: SelectionArgs,
    },

    /// Print topologically grouped modules as JSON
    OutputModuleGroups {
        #[command(flatten)]
        selection: SelectionArgs,
    },

    /// Load every manifest and build the graph without running anything
    ValidateStack {
        #[command(flatten)]
        selection: SelectionArgs,
    },

    /// Run a provisioning command across every module in the stack
    RunAll(RunAllArgs),
}

/// Dispatch a CLI command. Returns the process exit code.
pub fn dispatch(cmd: Commands, working_dir: &Path) -> Result<i32, String> {
    match cmd {
        Commands::GraphDependencies { selection } => {
            cmd_graph_dependencies(working_dir, &selection).map(|()| 0)
        }
        Commands::OutputModuleGroups { selection } => {
            cmd_output_module_groups(working_dir, &selection).map(|()| 0)
        }
        Commands::ValidateStack { selection } => {
            cmd_validate_stack(working_dir, &selection).map(|()| 0)
        }
        Commands::RunAll(args) => {
            let cancel = CancelToken::new();
            install_interrupt_handler(cancel.clone())?;
            cmd_run_all(working_dir, &args, cancel)
        }
    }
}

/// Discover, validate, select and build the graph.
fn load_stack(working_dir: &Path, selection: &SelectionArgs) -> Result<Graph, String> {
    let mut registry = Registry::load(working_dir).map_err(|e| e.to_string())?;

    let errors: Vec<_> = registry.iter().flat_map(parser::validate_module).collect();
    if !errors.is_empty() {
        for e in &errors {
            eprintln!("  ERROR: {}", e);
        }
        return Err(format!("{} validation error(s)", errors.len()));
    }

    let selection = Selection::from_globs(
        &selection.include_dirs,
        &selection.exclude_dirs,
        selection.strict_include,
    )?;
    registry.select(&selection);
    build_graph(&registry).map_err(|e| e.to_string())
}

fn cmd_graph_dependencies(working_dir: &Path, selection: &SelectionArgs) -> Result<(), String> {
    let graph = load_stack(working_dir, selection)?;
    print!("{}", graph.to_dot());
    Ok(())
}

fn cmd_output_module_groups(working_dir: &Path, selection: &SelectionArgs) -> Result<(), String> {
    let graph = load_stack(working_dir, selection)?;
    let json = serde_json::to_string_pretty(&graph.module_groups())
        .map_err(|e| format!("JSON serialize error: {}", e))?;
    println!("{}", json);
    Ok(())
}

fn cmd_validate_stack(working_dir: &Path, selection: &SelectionArgs) -> Result<(), String> {
    let graph = load_stack(working_dir, selection)?;
    let excluded = graph.ids().filter(|id| graph.module(*id).excluded).count();
    println!(
        "OK: {} ({} modules, {} dependencies, {} excluded, {} groups)",
        graph.root().display(),
        graph.len(),
        graph.edge_count(),
        excluded,
        graph.layers().len()
    );
    Ok(())
}

fn run_options(args: &RunAllArgs, cancel: CancelToken) -> RunOptions {
    let mut options = RunOptions::new(&args.command);
    options.args = args.args.clone();
    options.parallelism = args.parallelism.unwrap_or_else(default_parallelism).max(1);
    options.failure_policy = if args.fail_fast {
        FailurePolicy::StopOnFirst
    } else {
        FailurePolicy::ContinueIndependent
    };
    options.ignore_dependency_errors = args.ignore_dependency_errors;
    options.echo_output = true;
    options.log_dir = args.log_dir.clone();
    options.cancel = cancel;
    options
}

fn cmd_run_all(working_dir: &Path, args: &RunAllArgs, cancel: CancelToken) -> Result<i32, String> {
    let graph = load_stack(working_dir, &args.selection)?;
    let provisioner = TerraformCli::new(&args.tf_path)
        .with_grace_period(Duration::from_secs(args.grace_period_secs));
    let options = run_options(args, cancel);

    println!(
        "Running '{}' in {} module(s), parallelism {}",
        args.command,
        graph.len(),
        options.parallelism
    );
    let report = executor::run_stack(&graph, &provisioner, &options);

    println!();
    print!("{}", report.render());
    let errors = report.errors();
    if !errors.is_empty() && !report.interrupted() {
        eprintln!();
        for (module, err) in errors {
            eprintln!("  ERROR [{}]: {}", module, err);
        }
    }
    Ok(report.exit_code())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum InterruptAction {
    /// Stop scheduling and interrupt running modules
    Cancel,
    /// Give up on the grace period and exit now
    ForceExit,
}

fn interrupt_action(received: usize) -> InterruptAction {
    if received <= 1 {
        InterruptAction::Cancel
    } else {
        InterruptAction::ForceExit
    }
}

/// Trip `cancel` on the first Ctrl-C; exit on the second. The signal
/// listener runs on its own thread with a single-threaded runtime.
fn install_interrupt_handler(cancel: CancelToken) -> Result<(), String> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .map_err(|e| format!("cannot start signal runtime: {}", e))?;
    std::thread::Builder::new()
        .name("stackrun-signal".to_string())
        .spawn(move || {
            runtime.block_on(async {
                let mut received = 0;
                while tokio::signal::ctrl_c().await.is_ok() {
                    received += 1;
                    match interrupt_action(received) {
                        InterruptAction::Cancel => {
                            warn!("interrupt received, stopping run (Ctrl-C again to exit now)");
                            cancel.cancel();
                        }
                        InterruptAction::ForceExit => {
                            warn!("second interrupt, exiting without waiting for modules");
                            std::process::exit(EXIT_INTERRUPTED);
                        }
                    }
                }
            });
        })
        .map_err(|e| format!("cannot spawn signal thread: {}", e))?;
    Ok(())
}
