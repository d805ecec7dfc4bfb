//! SR-004: Module registry and selection.
//!
//! Holds every discovered module keyed by path, in discovery order.
//! Selection rules only flip `excluded`/`included`; they never remove a
//! module, so graph topology is unaffected.

use super::error::StackError;
use super::parser;
use super::types::Module;
use indexmap::IndexMap;
use std::collections::HashSet;
use std::path::{Path, PathBuf};

/// The set of modules available to one run.
#[derive(Debug, Clone, Default)]
pub struct Registry {
    root: PathBuf,
    modules: IndexMap<PathBuf, Module>,
}

impl Registry {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            modules: IndexMap::new(),
        }
    }

    pub fn from_modules(root: impl Into<PathBuf>, modules: impl IntoIterator<Item = Module>) -> Self {
        let mut registry = Self::new(root);
        for module in modules {
            registry.insert(module);
        }
        registry
    }

    /// Discover every module below `root`.
    pub fn load(root: &Path) -> Result<Self, StackError> {
        let modules = parser::discover_modules(root)?;
        let root = std::fs::canonicalize(root).map_err(|e| StackError::Discovery {
            root: root.to_path_buf(),
            reason: e.to_string(),
        })?;
        Ok(Self::from_modules(root, modules))
    }

    /// Insert a module, replacing any previous module at the same path.
    pub fn insert(&mut self, module: Module) -> Option<Module> {
        self.modules.insert(module.path.clone(), module)
    }

    pub fn get(&self, path: &Path) -> Option<&Module> {
        self.modules.get(path)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn len(&self) -> usize {
        self.modules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.modules.is_empty()
    }

    /// Modules in discovery order.
    pub fn iter(&self) -> impl Iterator<Item = &Module> {
        self.modules.values()
    }

    /// Apply include/exclude rules.
    ///
    /// Exclusion wins. With include patterns, everything not matched is
    /// excluded, except transitive dependencies of included modules when
    /// `strict_include` is off.
    pub fn select(&mut self, selection: &Selection) {
        if !selection.include.is_empty() {
            let mut keep: HashSet<PathBuf> = HashSet::new();
            for module in self.modules.values_mut() {
                let rel = relative(&self.root, &module.path);
                if selection.include.iter().any(|p| p.matches_path(&rel)) {
                    module.included = true;
                    keep.insert(module.path.clone());
                }
            }

            if !selection.strict_include {
                let mut stack: Vec<PathBuf> = keep.iter().cloned().collect();
                while let Some(path) = stack.pop() {
                    let Some(module) = self.modules.get(&path) else {
                        continue;
                    };
                    for dep in module.dependency_paths() {
                        if self.modules.contains_key(dep) && keep.insert(dep.to_path_buf()) {
                            stack.push(dep.to_path_buf());
                        }
                    }
                }
            }

            for module in self.modules.values_mut() {
                if !keep.contains(&module.path) {
                    module.excluded = true;
                }
            }
        }

        for module in self.modules.values_mut() {
            let rel = relative(&self.root, &module.path);
            if selection.exclude.iter().any(|p| p.matches_path(&rel)) {
                module.excluded = true;
                module.included = false;
            }
        }
    }
}

/// Include/exclude rules from the command surface.
#[derive(Debug, Clone, Default)]
pub struct Selection {
    pub include: Vec<glob::Pattern>,
    pub exclude: Vec<glob::Pattern>,
    pub strict_include: bool,
}

impl Selection {
    /// Build from glob strings, matched against paths relative to the root.
    pub fn from_globs(
        include: &[String],
        exclude: &[String],
        strict_include: bool,
    ) -> Result<Self, String> {
        let compile = |globs: &[String]| -> Result<Vec<glob::Pattern>, String> {
            globs
                .iter()
                .map(|g| {
                    glob::Pattern::new(g.trim_end_matches('/'))
                        .map_err(|e| format!("invalid pattern '{}': {}", g, e))
                })
                .collect()
        };
        Ok(Self {
            include: compile(include)?,
            exclude: compile(exclude)?,
            strict_include,
        })
    }
}

/// Path of `path` relative to `root`, or `path` itself when outside it.
pub fn relative(root: &Path, path: &Path) -> PathBuf {
    path.strip_prefix(root)
        .map(Path::to_path_buf)
        .unwrap_or_else(|_| path.to_path_buf())
}
