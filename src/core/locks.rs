//! SR-008: Directory-scoped locks.
//!
//! Two modules sharing a working directory (or state location) never run at
//! the same time. A lock is held for one module's action and released when
//! its guard drops, whatever the outcome. Each lock records its owner so the
//! executor can confirm exclusivity right before invoking the tool.

use super::error::StackError;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Condvar, Mutex, MutexGuard};
use tracing::trace;

#[derive(Debug, Default)]
pub struct DirLocks {
    /// Locked directory -> owning module path
    held: Mutex<HashMap<PathBuf, PathBuf>>,
    released: Condvar,
}

/// Releases its directory on drop.
#[derive(Debug)]
pub struct DirGuard<'a> {
    locks: &'a DirLocks,
    dir: PathBuf,
    owner: PathBuf,
}

impl DirLocks {
    pub fn new() -> Self {
        Self::default()
    }

    fn held(&self) -> MutexGuard<'_, HashMap<PathBuf, PathBuf>> {
        self.held.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Block until `dir` is free, then take it on behalf of `owner`.
    pub fn acquire(&self, dir: &Path, owner: &Path) -> DirGuard<'_> {
        let mut held = self.held();
        while held.contains_key(dir) {
            trace!(dir = %dir.display(), "waiting for directory lock");
            held = self
                .released
                .wait(held)
                .unwrap_or_else(|e| e.into_inner());
        }
        held.insert(dir.to_path_buf(), owner.to_path_buf());
        DirGuard {
            locks: self,
            dir: dir.to_path_buf(),
            owner: owner.to_path_buf(),
        }
    }

    pub fn is_held(&self, dir: &Path) -> bool {
        self.held().contains_key(dir)
    }
}

impl DirGuard<'_> {
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Confirm the lock is still held by this guard's owner. Anything else is
    /// a broken locking invariant, reported as `LockContention`.
    pub fn verify(&self) -> Result<(), StackError> {
        match self.locks.held().get(&self.dir) {
            Some(owner) if *owner == self.owner => Ok(()),
            other => Err(StackError::LockContention {
                working_dir: self.dir.clone(),
                holder: other.cloned(),
            }),
        }
    }
}

impl Drop for DirGuard<'_> {
    fn drop(&mut self) {
        let mut held = self.locks.held();
        if held.get(&self.dir) == Some(&self.owner) {
            held.remove(&self.dir);
        }
        drop(held);
        self.locks.released.notify_all();
    }
}
