//! SR-006: Dependency output resolution.
//!
//! Resolution order for an edge A -> B:
//! 1. B succeeded in this run: inspect B's live working directory
//! 2. B has persisted state from a prior run: inspect that state
//! 3. A's declaration permits mocks for the current command: use the mocks
//! 4. Otherwise: `OutputResolution` error naming A and B
//!
//! A dependency whose inspection yields no outputs at all counts as
//! unavailable: mocks apply if permitted, otherwise step 4.
//!
//! Real outputs are inspected at most once per dependency per run.

use super::error::StackError;
use super::graph::{Edge, Graph, NodeId};
use super::types::{CancelToken, Dependency, DependencyInputs, MergeStrategy, ModuleStatus, Outputs};
use crate::transport::Provisioner;
use std::sync::OnceLock;
use tracing::debug;

/// Where a resolved value set came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputSource {
    /// Inspected after the dependency ran in this execution
    Applied,
    /// Inspected from state left by a prior run
    PersistedState,
    /// Mock values only
    Mock,
    /// Real outputs with mock keys filling the gaps
    Merged,
    /// `skip_outputs`: ordering-only edge
    Skipped,
    /// Best-effort empty set for a failed dependency
    Empty,
}

#[derive(Debug, Clone)]
pub struct ResolvedOutputs {
    pub outputs: Outputs,
    pub source: OutputSource,
}

type RealOutputs = Result<Option<(Outputs, OutputSource)>, String>;

/// Lazily resolves dependency outputs for one run.
pub struct OutputResolver<'a> {
    graph: &'a Graph,
    provisioner: &'a dyn Provisioner,
    command: &'a str,
    cancel: CancelToken,
    cache: Vec<OnceLock<RealOutputs>>,
}

impl<'a> OutputResolver<'a> {
    pub fn new(graph: &'a Graph, provisioner: &'a dyn Provisioner, command: &'a str) -> Self {
        Self {
            graph,
            provisioner,
            command,
            cancel: CancelToken::new(),
            cache: (0..graph.len()).map(|_| OnceLock::new()).collect(),
        }
    }

    /// Interrupt in-flight output inspections when `cancel` trips.
    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Resolve one edge of `module`, given the dependency's current status.
    ///
    /// `lenient` turns "nothing available" into an empty value set instead
    /// of an error; used for failed dependencies under ignore-dependency-errors.
    pub fn resolve(
        &self,
        module: NodeId,
        edge: &Edge,
        dependency_status: ModuleStatus,
        lenient: bool,
    ) -> Result<ResolvedOutputs, StackError> {
        let declaration = &self.graph.module(module).dependencies[edge.declaration];
        if declaration.skip_outputs {
            return Ok(ResolvedOutputs {
                outputs: Outputs::new(),
                source: OutputSource::Skipped,
            });
        }

        let real = self.real_outputs(edge.dependency, dependency_status);
        let mocks = declaration.mocks_for(self.command);

        match (real, mocks) {
            (Ok(Some((outputs, source))), mocks) if !outputs.is_empty() || mocks.is_some() => {
                Ok(combine(declaration, outputs, *source, mocks))
            }
            (_, Some(mocks)) => Ok(ResolvedOutputs {
                outputs: mocks.clone(),
                source: OutputSource::Mock,
            }),
            (_, None) if lenient => Ok(ResolvedOutputs {
                outputs: Outputs::new(),
                source: OutputSource::Empty,
            }),
            (real, None) => Err(StackError::OutputResolution {
                module: self.graph.module(module).path.clone(),
                dependency: self.graph.module(edge.dependency).path.clone(),
                reason: match real {
                    Err(reason) => reason.clone(),
                    Ok(Some(_)) => format!(
                        "dependency has no outputs (not applied yet?) and no mock outputs for '{}'",
                        self.command
                    ),
                    Ok(None) => format!(
                        "dependency is {} with no persisted state and no mock outputs for '{}'",
                        dependency_status, self.command
                    ),
                },
            }),
        }
    }

    /// Resolve every declared dependency of `module`, keyed by dependency name.
    /// Ordering-only edges contribute nothing.
    pub fn resolve_all(
        &self,
        module: NodeId,
        status_of: impl Fn(NodeId) -> ModuleStatus,
        ignore_dependency_errors: bool,
    ) -> Result<DependencyInputs, StackError> {
        let mut inputs = DependencyInputs::new();
        for edge in &self.graph.node(module).dependencies {
            let status = status_of(edge.dependency);
            let lenient = ignore_dependency_errors
                && matches!(
                    status,
                    ModuleStatus::Failed | ModuleStatus::Skipped | ModuleStatus::Cancelled
                );
            let resolved = self.resolve(module, edge, status, lenient)?;
            if resolved.source == OutputSource::Skipped {
                continue;
            }
            let name = &self.graph.module(module).dependencies[edge.declaration].name;
            inputs.insert(name.clone(), resolved.outputs);
        }
        Ok(inputs)
    }

    fn real_outputs(&self, dependency: NodeId, status: ModuleStatus) -> &RealOutputs {
        self.cache[dependency.0].get_or_init(|| {
            let module = self.graph.module(dependency);
            let source = if status == ModuleStatus::Succeeded {
                OutputSource::Applied
            } else if self.provisioner.has_persisted_state(module) {
                OutputSource::PersistedState
            } else {
                return Ok(None);
            };
            debug!(
                dependency = %module.path.display(),
                ?source,
                "inspecting outputs"
            );
            self.provisioner
                .inspect_outputs(module, &self.cancel)
                .map(|outputs| Some((outputs, source)))
                .map_err(|e| format!("output inspection failed: {}", e))
        })
    }
}

fn combine(
    declaration: &Dependency,
    outputs: &Outputs,
    source: OutputSource,
    mocks: Option<&Outputs>,
) -> ResolvedOutputs {
    match mocks {
        Some(mocks) if outputs.is_empty() => ResolvedOutputs {
            outputs: mocks.clone(),
            source: OutputSource::Mock,
        },
        Some(mocks) if declaration.mock_outputs_merge_strategy == MergeStrategy::Shallow => {
            let mut merged = outputs.clone();
            for (key, value) in mocks {
                merged.entry(key.clone()).or_insert_with(|| value.clone());
            }
            ResolvedOutputs {
                outputs: merged,
                source: OutputSource::Merged,
            }
        }
        _ => ResolvedOutputs {
            outputs: outputs.clone(),
            source,
        },
    }
}
