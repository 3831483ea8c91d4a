//! Registry of live output paths, indexed by output base and by build.
//!
//! One mutex guards both maps and the build binding on every entry. The lock
//! is only ever held for map operations; anything that touches a directory,
//! the CAS, or the kernel happens outside, on state cloned out under the
//! lock, and commits by re-checking identity afterwards.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::info;

use crate::cas::DigestFunction;
use crate::path::{Component, VirtualRootScopeWalkerFactory};
use crate::vfs::{CasFileFactory, PrepopulatedDir};

/// Per-build state. Lives from `StartBuild` until `FinalizeBuild`, eviction
/// by a newer build on the same base, or `Clean`.
#[derive(Clone)]
pub struct BuildState {
    pub id: String,
    pub digest_function: DigestFunction,
    pub scope_factory: Arc<VirtualRootScopeWalkerFactory>,
}

/// The part of an output path that survives across builds: the root
/// directory and the file factory bound to it. Never replaced for the life
/// of the registry entry; removing it means deleting the entry.
pub struct OutputPathHandle {
    pub root: Arc<PrepopulatedDir>,
    pub file_factory: CasFileFactory,
}

impl OutputPathHandle {
    pub fn root_ino(&self) -> u64 {
        self.root.ino()
    }
}

struct BaseEntry {
    handle: Arc<OutputPathHandle>,
    build: Option<BuildState>,
}

#[derive(Default)]
struct RegistryInner {
    by_base: HashMap<Component, BaseEntry>,
    /// Build ID to the output base it runs in. Kept in lockstep with the
    /// `build` field of the base entries.
    by_build: HashMap<String, Component>,
}

#[derive(Default)]
pub struct OutputRegistry {
    inner: Mutex<RegistryInner>,
}

impl OutputRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lookup_by_base(&self, base: &Component) -> Option<Arc<OutputPathHandle>> {
        self.inner
            .lock()
            .by_base
            .get(base)
            .map(|entry| entry.handle.clone())
    }

    pub fn lookup_by_build(
        &self,
        build_id: &str,
    ) -> Option<(Arc<OutputPathHandle>, BuildState)> {
        let inner = self.inner.lock();
        let base = inner.by_build.get(build_id)?;
        let entry = inner.by_base.get(base)?;
        let build = entry.build.clone()?;
        Some((entry.handle.clone(), build))
    }

    /// Register `build` on `base`, creating the output path through
    /// `new_handle` if the base is new. A still-bound previous build on the
    /// same base is forcibly evicted (a crashed client cannot be told apart
    /// from an abandoned one). Announcing an already-known build ID returns
    /// the existing state untouched.
    pub fn announce_build(
        &self,
        base: &Component,
        build: BuildState,
        new_handle: impl FnOnce() -> Arc<OutputPathHandle>,
    ) -> Arc<OutputPathHandle> {
        let mut guard = self.inner.lock();
        let RegistryInner { by_base, by_build } = &mut *guard;

        if let Some(existing_base) = by_build.get(&build.id) {
            if let Some(entry) = by_base.get(existing_base) {
                return entry.handle.clone();
            }
        }

        let entry = by_base.entry(base.clone()).or_insert_with(|| BaseEntry {
            handle: new_handle(),
            build: None,
        });
        if let Some(previous) = entry.build.take() {
            info!(
                output_base = %base,
                evicted_build = %previous.id,
                new_build = %build.id,
                "evicting build that was never finalized"
            );
            by_build.remove(&previous.id);
        }
        by_build.insert(build.id.clone(), base.clone());
        entry.build = Some(build);
        entry.handle.clone()
    }

    /// Remove the entry for `base` if it still holds `expected`, unbinding a
    /// bound build along the way. Returns whether the entry was removed.
    pub fn remove_base_if(&self, base: &Component, expected: &Arc<OutputPathHandle>) -> bool {
        let mut guard = self.inner.lock();
        let RegistryInner { by_base, by_build } = &mut *guard;
        let still_current = by_base
            .get(base)
            .is_some_and(|entry| Arc::ptr_eq(&entry.handle, expected));
        if !still_current {
            return false;
        }
        if let Some(build) = by_base.remove(base).and_then(|entry| entry.build) {
            by_build.remove(&build.id);
        }
        true
    }

    /// Detach a build, returning the handle it ran in. Unknown builds return
    /// `None`.
    pub fn finalize_build(&self, build_id: &str) -> Option<Arc<OutputPathHandle>> {
        let mut guard = self.inner.lock();
        let RegistryInner { by_base, by_build } = &mut *guard;
        let base = by_build.remove(build_id)?;
        let entry = by_base.get_mut(&base)?;
        entry.build = None;
        Some(entry.handle.clone())
    }

    /// Number of live output bases.
    pub fn len(&self) -> usize {
        self.inner.lock().by_base.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Consistent snapshot of the live bases for directory listings.
    pub fn snapshot(&self) -> Vec<(Component, Arc<OutputPathHandle>)> {
        self.inner
            .lock()
            .by_base
            .iter()
            .map(|(name, entry)| (name.clone(), entry.handle.clone()))
            .collect()
    }
}
