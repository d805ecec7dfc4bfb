//! SR-003: Module manifest discovery and parsing.
//!
//! Every directory below the stack root holding a `module.yaml` becomes one
//! module. Dependency and working-dir paths are relative to the declaring
//! module and normalized lexically. Dependency names must be non-empty and
//! unique per module; self-dependencies are left to graph construction,
//! which reports them as cycles.

use super::error::StackError;
use super::types::{Dependency, Module};
use serde::Deserialize;
use std::collections::HashSet;
use std::path::{Component, Path, PathBuf};

/// Manifest file name marking a module directory.
pub const MANIFEST_FILE: &str = "module.yaml";

/// Validation error.
#[derive(Debug, Clone)]
pub struct ValidationError {
    pub message: String,
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

/// The fields of `module.yaml` the stack engine understands. Anything else
/// stays in the opaque config value.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ModuleManifest {
    #[serde(default)]
    pub working_dir: Option<PathBuf>,

    #[serde(default)]
    pub exclude: bool,

    #[serde(default)]
    pub extra_args: Vec<String>,

    #[serde(default)]
    pub dependencies: Vec<Dependency>,
}

/// Parse a manifest into its known fields plus the full opaque value.
pub fn parse_manifest(yaml: &str) -> Result<(ModuleManifest, serde_yaml_ng::Value), String> {
    let value: serde_yaml_ng::Value =
        serde_yaml_ng::from_str(yaml).map_err(|e| format!("YAML parse error: {}", e))?;
    if value.is_null() {
        return Ok((ModuleManifest::default(), value));
    }
    let manifest: ModuleManifest = serde_yaml_ng::from_value(value.clone())
        .map_err(|e| format!("manifest error: {}", e))?;
    Ok((manifest, value))
}

/// Load the module whose manifest lives at `manifest_path`.
pub fn load_module(manifest_path: &Path) -> Result<Module, StackError> {
    let manifest_err = |reason: String| StackError::Manifest {
        path: manifest_path.to_path_buf(),
        reason,
    };
    let dir = manifest_path
        .parent()
        .ok_or_else(|| manifest_err("manifest has no parent directory".to_string()))?;
    let content = std::fs::read_to_string(manifest_path)
        .map_err(|e| manifest_err(format!("cannot read: {}", e)))?;
    let (manifest, config) = parse_manifest(&content).map_err(manifest_err)?;

    let dependencies = manifest
        .dependencies
        .into_iter()
        .map(|mut dep| {
            dep.path = normalize_path(&dir.join(&dep.path));
            dep
        })
        .collect();

    Ok(Module {
        path: dir.to_path_buf(),
        working_dir: manifest
            .working_dir
            .map(|w| normalize_path(&dir.join(w)))
            .unwrap_or_else(|| dir.to_path_buf()),
        config,
        extra_args: manifest.extra_args,
        dependencies,
        excluded: manifest.exclude,
        included: false,
    })
}

/// Discover and load every module below `root`, in path order.
/// Hidden directories (tool caches, `.terraform`) are not searched.
pub fn discover_modules(root: &Path) -> Result<Vec<Module>, StackError> {
    let discovery_err = |reason: String| StackError::Discovery {
        root: root.to_path_buf(),
        reason,
    };
    let root = std::fs::canonicalize(root)
        .map_err(|e| discovery_err(format!("cannot resolve root: {}", e)))?;

    let pattern = format!(
        "{}/**/{}",
        glob::Pattern::escape(&root.to_string_lossy()),
        MANIFEST_FILE
    );
    let entries = glob::glob(&pattern).map_err(|e| discovery_err(e.to_string()))?;

    let mut manifests = Vec::new();
    for entry in entries {
        let path = entry.map_err(|e| discovery_err(e.to_string()))?;
        if is_hidden_below(&root, &path) {
            continue;
        }
        manifests.push(path);
    }
    manifests.sort();

    manifests.iter().map(|p| load_module(p)).collect()
}

fn is_hidden_below(root: &Path, path: &Path) -> bool {
    path.strip_prefix(root)
        .map(|rel| {
            rel.components().any(|c| match c {
                Component::Normal(name) => name.to_string_lossy().starts_with('.'),
                _ => false,
            })
        })
        .unwrap_or(false)
}

/// Lexically normalize a path: drop `.` and fold `..` into its parent.
pub fn normalize_path(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                if !out.pop() {
                    out.push(component);
                }
            }
            other => out.push(other),
        }
    }
    out
}

/// Validate a loaded module. Returns a list of errors (empty = valid).
pub fn validate_module(module: &Module) -> Vec<ValidationError> {
    let mut errors = Vec::new();
    let mut names = HashSet::new();

    for dep in &module.dependencies {
        if dep.name.is_empty() {
            errors.push(ValidationError {
                message: format!(
                    "module '{}' has a dependency without a name",
                    module.path.display()
                ),
            });
        } else if !names.insert(dep.name.as_str()) {
            errors.push(ValidationError {
                message: format!(
                    "module '{}' declares dependency '{}' twice",
                    module.path.display(),
                    dep.name
                ),
            });
        }
    }

    errors
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_manifest(dir: &Path, rel: &str, yaml: &str) {
        let module_dir = dir.join(rel);
        std::fs::create_dir_all(&module_dir).unwrap();
        std::fs::write(module_dir.join(MANIFEST_FILE), yaml).unwrap();
    }

    #[test]
    fn test_sr003_parse_manifest() {
        let yaml = r#"
extra_args: ["-lock-timeout=5m"]
dependencies:
  - name: vpc
    path: ../vpc
    skip_outputs: true
terraform:
  source: git::https://example.com/modules.git//app
"#;
        let (manifest, config) = parse_manifest(yaml).unwrap();
        assert_eq!(manifest.extra_args, vec!["-lock-timeout=5m"]);
        assert_eq!(manifest.dependencies.len(), 1);
        assert!(manifest.dependencies[0].skip_outputs);
        assert!(!manifest.exclude);
        assert!(config.get("terraform").is_some());
    }

    #[test]
    fn test_sr003_parse_empty_manifest() {
        let (manifest, config) = parse_manifest("").unwrap();
        assert!(manifest.dependencies.is_empty());
        assert!(config.is_null());
    }

    #[test]
    fn test_sr003_parse_invalid_yaml() {
        let result = parse_manifest("dependencies: [valid: yaml: {{");
        assert!(result.is_err());
    }

    #[test]
    fn test_sr003_parse_bad_dependency_shape() {
        let result = parse_manifest("dependencies:\n  - just-a-string\n");
        assert!(result.unwrap_err().contains("manifest error"));
    }

    #[test]
    fn test_sr003_normalize_path() {
        assert_eq!(
            normalize_path(Path::new("/stack/app/../vpc")),
            PathBuf::from("/stack/vpc")
        );
        assert_eq!(
            normalize_path(Path::new("/stack/./app/./db")),
            PathBuf::from("/stack/app/db")
        );
        assert_eq!(normalize_path(Path::new("../x")), PathBuf::from("../x"));
    }

    #[test]
    fn test_sr003_load_module_resolves_relative_paths() {
        let dir = tempfile::tempdir().unwrap();
        write_manifest(
            dir.path(),
            "app",
            "working_dir: ../shared\ndependencies:\n  - name: vpc\n    path: ../vpc\n",
        );
        let module = load_module(&dir.path().join("app").join(MANIFEST_FILE)).unwrap();
        assert_eq!(module.path, dir.path().join("app"));
        assert_eq!(module.working_dir, dir.path().join("shared"));
        assert_eq!(module.dependencies[0].path, dir.path().join("vpc"));
    }

    #[test]
    fn test_sr003_load_module_missing_file() {
        let result = load_module(Path::new("/nonexistent/module.yaml"));
        assert!(matches!(result, Err(StackError::Manifest { .. })));
    }

    #[test]
    fn test_sr003_discover_modules_sorted_and_skips_hidden() {
        let dir = tempfile::tempdir().unwrap();
        write_manifest(dir.path(), "vpc", "");
        write_manifest(
            dir.path(),
            "apps/web",
            "dependencies:\n  - name: vpc\n    path: ../../vpc\n",
        );
        write_manifest(dir.path(), "vpc/.terraform/modules/copy", "");

        let modules = discover_modules(dir.path()).unwrap();
        let root = std::fs::canonicalize(dir.path()).unwrap();
        let paths: Vec<_> = modules.iter().map(|m| m.path.clone()).collect();
        assert_eq!(paths, vec![root.join("apps/web"), root.join("vpc")]);
        assert_eq!(modules[0].dependencies[0].path, root.join("vpc"));
    }

    #[test]
    fn test_sr003_discover_missing_root() {
        let result = discover_modules(Path::new("/nonexistent/stack/root"));
        assert!(matches!(result, Err(StackError::Discovery { .. })));
    }

    #[test]
    fn test_sr003_discover_reports_bad_manifest() {
        let dir = tempfile::tempdir().unwrap();
        write_manifest(dir.path(), "broken", "dependencies: {not: a list}\n");
        let result = discover_modules(dir.path());
        assert!(matches!(result, Err(StackError::Manifest { .. })));
    }

    #[test]
    fn test_sr003_validate_duplicate_names() {
        let module = Module::new("/s/app")
            .with_dependency(Dependency::new("vpc", "/s/vpc"))
            .with_dependency(Dependency::new("vpc", "/s/vpc2"));
        let errors = validate_module(&module);
        assert_eq!(errors.len(), 1);
        assert!(errors[0].message.contains("twice"));
    }

    #[test]
    fn test_sr003_self_dependency_left_to_graph() {
        let module = Module::new("/s/app").with_dependency(Dependency::new("me", "/s/app"));
        assert!(validate_module(&module).is_empty());
    }

    #[test]
    fn test_sr003_validate_ok() {
        let module = Module::new("/s/app").with_dependency(Dependency::new("vpc", "/s/vpc"));
        assert!(validate_module(&module).is_empty());
    }
}
