//! Inode number allocation.

use std::sync::atomic::{AtomicU64, Ordering};

/// Monotonic inode number generator. Numbers are never reused within the
/// lifetime of the process, so stale kernel caches cannot alias new nodes.
pub struct InodeGenerator(AtomicU64);

impl InodeGenerator {
    pub fn new() -> Self {
        Self(AtomicU64::new(1))
    }

    pub fn next(&self) -> u64 {
        self.0.fetch_add(1, Ordering::Relaxed)
    }
}

impl Default for InodeGenerator {
    fn default() -> Self {
        Self::new()
    }
}
