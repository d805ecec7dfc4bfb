//! SR-013: BLAKE3 fingerprints of module configuration.

use crate::core::types::Module;

/// Hash a string. Returns `"blake3:{hex}"`.
pub fn hash_string(s: &str) -> String {
    format!("blake3:{}", blake3::hash(s.as_bytes()).to_hex())
}

/// Hash an ordered list of components, NUL-separated so that
/// `["ab", "c"]` and `["a", "bc"]` differ.
pub fn composite_hash(components: &[&str]) -> String {
    let mut hasher = blake3::Hasher::new();
    for c in components {
        hasher.update(c.as_bytes());
        hasher.update(b"\0");
    }
    format!("blake3:{}", hasher.finalize().to_hex())
}

/// Fingerprint of everything that determines what a module run does:
/// its path, working directory, opaque config and extra arguments.
pub fn hash_module(module: &Module) -> String {
    let config = serde_yaml_ng::to_string(&module.config).unwrap_or_default();
    let path = module.path.to_string_lossy();
    let working_dir = module.working_dir.to_string_lossy();
    let args = module.extra_args.join("\u{1f}");
    composite_hash(&[&path, &working_dir, &config, &args])
}
