//! The prepopulated directory primitive: an in-memory directory tree whose
//! children may be declared lazily and materialized only when accessed.
//!
//! Directories come in two states. A materialized directory owns a map of
//! children; a pending one owns an [`InitialContentsFetcher`] that produces
//! the first level of children on demand. Every access that needs children
//! materializes first, under the directory's own lock, so concurrent lookups
//! of the same directory fetch at most once.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::SystemTime;

use async_trait::async_trait;
use rfuse3::raw::reply::FileAttr;
use rfuse3::{FileType, Timestamp};
use thiserror::Error;
use tokio::sync::Mutex;

use crate::cas::{CasError, DigestSet};
use crate::path::Component;
use crate::vfs::inode::InodeGenerator;
use crate::vfs::leaf::OutputLeaf;

/// Link count of a directory without subdirectories (`.` and the parent
/// entry).
pub const EMPTY_DIRECTORY_LINK_COUNT: u32 = 2;

#[derive(Debug, Error)]
pub enum DirError {
    #[error(transparent)]
    Cas(#[from] CasError),

    #[error("entry {0:?} already exists")]
    AlreadyExists(String),
}

impl From<DirError> for crate::path::ResolveError {
    fn from(value: DirError) -> Self {
        match value {
            DirError::Cas(e) => crate::path::ResolveError::Storage(e),
            DirError::AlreadyExists(name) => {
                crate::path::ResolveError::InvalidPath(format!("entry {name:?} already exists"))
            }
        }
    }
}

/// Receives invalidation events for directory entries that disappeared, so a
/// kernel bridge can drop its dentry caches.
pub trait EntryNotifier: Send + Sync {
    fn entry_removed(&self, directory_ino: u64, name: &Component);
}

/// Notifier for setups without a kernel bridge attached.
pub struct NoopEntryNotifier;

impl EntryNotifier for NoopEntryNotifier {
    fn entry_removed(&self, _directory_ino: u64, _name: &Component) {}
}

/// Produces the first level of children of a lazy directory.
#[async_trait]
pub trait InitialContentsFetcher: Send + Sync {
    async fn fetch(&self) -> Result<HashMap<Component, InitialNode>, CasError>;

    /// Transitive CAS digest closure of the subtree, computed without
    /// materializing it.
    async fn containing_digests(&self) -> Result<DigestSet, CasError>;
}

/// A not-yet-inserted child: either a leaf, or a directory whose contents are
/// produced by a fetcher.
pub enum InitialNode {
    Leaf(Arc<dyn OutputLeaf>),
    Directory(Arc<dyn InitialContentsFetcher>),
}

/// A child as stored in (and handed out by) a directory.
#[derive(Clone)]
pub enum DirChild {
    Directory(Arc<PrepopulatedDir>),
    Leaf(Arc<dyn OutputLeaf>),
}

impl DirChild {
    fn same_entry(&self, other: &DirChild) -> bool {
        match (self, other) {
            (DirChild::Directory(a), DirChild::Directory(b)) => Arc::ptr_eq(a, b),
            (DirChild::Leaf(a), DirChild::Leaf(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }
}

enum DirState {
    Pending(Arc<dyn InitialContentsFetcher>),
    Materialized(BTreeMap<Component, DirChild>),
}

pub struct PrepopulatedDir {
    ino: u64,
    inodes: Arc<InodeGenerator>,
    notifier: Arc<dyn EntryNotifier>,
    state: Mutex<DirState>,
}

/// One entry of a [`PrepopulatedDir::filter_children`] snapshot: a view of a
/// leaf or still-pending directory, plus a remover that drops exactly that
/// entry if it is still in place.
pub struct FilterEntry {
    pub node: InitialNode,
    pub remover: ChildRemover,
}

/// Removes one captured directory entry. Cloneable so one entry can be queued
/// under several digests; removal is idempotent and does nothing if the entry
/// was replaced in the meantime.
#[derive(Clone)]
pub struct ChildRemover {
    parent: Arc<PrepopulatedDir>,
    name: Component,
    expected: DirChild,
}

impl ChildRemover {
    pub async fn remove(&self) -> Result<(), DirError> {
        let mut state = self.parent.state.lock().await;
        if let DirState::Materialized(children) = &mut *state {
            if let Some(current) = children.get(&self.name) {
                if current.same_entry(&self.expected) {
                    children.remove(&self.name);
                }
            }
        }
        Ok(())
    }
}

impl PrepopulatedDir {
    /// Create an empty materialized directory, used as the root of an output
    /// path. The root's inode number is chosen by the caller; nested
    /// directories draw theirs from `inodes`.
    pub fn new_root(
        ino: u64,
        inodes: Arc<InodeGenerator>,
        notifier: Arc<dyn EntryNotifier>,
    ) -> Arc<Self> {
        Arc::new(Self {
            ino,
            inodes,
            notifier,
            state: Mutex::new(DirState::Materialized(BTreeMap::new())),
        })
    }

    fn new_child(&self, state: DirState) -> Arc<Self> {
        Arc::new(Self {
            ino: self.inodes.next(),
            inodes: self.inodes.clone(),
            notifier: self.notifier.clone(),
            state: Mutex::new(state),
        })
    }

    pub fn ino(&self) -> u64 {
        self.ino
    }

    fn instantiate(&self, node: InitialNode) -> DirChild {
        match node {
            InitialNode::Leaf(leaf) => DirChild::Leaf(leaf),
            InitialNode::Directory(fetcher) => {
                DirChild::Directory(self.new_child(DirState::Pending(fetcher)))
            }
        }
    }

    /// Lock the state, materializing pending contents first. Concurrent
    /// callers of the same directory block until the one fetch finishes.
    async fn materialized(
        &self,
    ) -> Result<tokio::sync::MutexGuard<'_, DirState>, DirError> {
        let mut state = self.state.lock().await;
        if let DirState::Pending(fetcher) = &*state {
            let fetcher = fetcher.clone();
            let nodes = fetcher.fetch().await?;
            let mut children = BTreeMap::new();
            for (name, node) in nodes {
                children.insert(name, self.instantiate(node));
            }
            *state = DirState::Materialized(children);
        }
        Ok(state)
    }

    pub async fn lookup_child(&self, name: &Component) -> Result<Option<DirChild>, DirError> {
        let state = self.materialized().await?;
        match &*state {
            DirState::Materialized(children) => Ok(children.get(name).cloned()),
            DirState::Pending(_) => unreachable!("materialized() always transitions the state"),
        }
    }

    /// Insert children. With `overwrite`, existing entries of any kind are
    /// replaced; otherwise a conflict fails the whole call before any
    /// insertion happens.
    pub async fn create_children(
        &self,
        nodes: HashMap<Component, InitialNode>,
        overwrite: bool,
    ) -> Result<(), DirError> {
        let mut state = self.materialized().await?;
        let DirState::Materialized(children) = &mut *state else {
            unreachable!("materialized() always transitions the state");
        };
        if !overwrite {
            for name in nodes.keys() {
                if children.contains_key(name) {
                    return Err(DirError::AlreadyExists(name.as_str().to_string()));
                }
            }
        }
        for (name, node) in nodes {
            let child = self.instantiate(node);
            children.insert(name, child);
        }
        Ok(())
    }

    /// Return the child directory `name`, creating it if absent and
    /// replacing any non-directory that is in the way.
    pub async fn create_and_enter_directory(
        &self,
        name: &Component,
    ) -> Result<Arc<PrepopulatedDir>, DirError> {
        let mut state = self.materialized().await?;
        let DirState::Materialized(children) = &mut *state else {
            unreachable!("materialized() always transitions the state");
        };
        if let Some(DirChild::Directory(dir)) = children.get(name) {
            return Ok(dir.clone());
        }
        let dir = self.new_child(DirState::Materialized(BTreeMap::new()));
        children.insert(name.clone(), DirChild::Directory(dir.clone()));
        Ok(dir)
    }

    /// Drop all children. A pending directory becomes empty without ever
    /// fetching. With `notify`, an invalidation is emitted per removed entry.
    pub async fn remove_all_children(&self, notify: bool) -> Result<(), DirError> {
        let old = {
            let mut state = self.state.lock().await;
            std::mem::replace(&mut *state, DirState::Materialized(BTreeMap::new()))
        };
        if notify {
            if let DirState::Materialized(children) = &old {
                for name in children.keys() {
                    self.notifier.entry_removed(self.ino, name);
                }
            }
        }
        Ok(())
    }

    /// Snapshot the filterable entries of this subtree: every leaf and every
    /// still-pending directory, found by recursing through materialized
    /// directories. Pending directories are reported, not expanded.
    pub async fn filter_children(self: &Arc<Self>) -> Result<Vec<FilterEntry>, DirError> {
        let mut entries = Vec::new();
        let mut stack = vec![self.clone()];
        while let Some(dir) = stack.pop() {
            let state = dir.state.lock().await;
            let DirState::Materialized(children) = &*state else {
                continue;
            };
            for (name, child) in children {
                let remover = ChildRemover {
                    parent: dir.clone(),
                    name: name.clone(),
                    expected: child.clone(),
                };
                match child {
                    DirChild::Leaf(leaf) => entries.push(FilterEntry {
                        node: InitialNode::Leaf(leaf.clone()),
                        remover,
                    }),
                    DirChild::Directory(subdir) => {
                        let substate = subdir.state.lock().await;
                        match &*substate {
                            DirState::Pending(fetcher) => entries.push(FilterEntry {
                                node: InitialNode::Directory(fetcher.clone()),
                                remover,
                            }),
                            DirState::Materialized(_) => stack.push(subdir.clone()),
                        }
                    }
                }
            }
        }
        Ok(entries)
    }

    /// Hook invoked when the build owning this output path completes. The
    /// in-memory representation keeps no build-scoped caches, so this only
    /// exists for parity with persistent implementations.
    pub async fn finalize_build(&self) {}

    /// List children, materializing first.
    pub async fn read_dir(&self) -> Result<Vec<(Component, DirChild)>, DirError> {
        let state = self.materialized().await?;
        match &*state {
            DirState::Materialized(children) => Ok(children
                .iter()
                .map(|(name, child)| (name.clone(), child.clone()))
                .collect()),
            DirState::Pending(_) => unreachable!("materialized() always transitions the state"),
        }
    }

    /// Attribute snapshot of this directory.
    pub async fn attr(&self) -> Result<FileAttr, DirError> {
        let state = self.materialized().await?;
        let subdirs = match &*state {
            DirState::Materialized(children) => children
                .values()
                .filter(|child| matches!(child, DirChild::Directory(_)))
                .count() as u32,
            DirState::Pending(_) => 0,
        };
        drop(state);
        Ok(directory_attr(self.ino, EMPTY_DIRECTORY_LINK_COUNT + subdirs, 0o755))
    }
}

pub(crate) fn directory_attr(ino: u64, nlink: u32, perm: u16) -> FileAttr {
    let now = Timestamp::from(SystemTime::now());
    FileAttr {
        ino,
        size: 0,
        blocks: 0,
        atime: now,
        mtime: now,
        ctime: now,
        #[cfg(target_os = "macos")]
        crtime: now,
        kind: FileType::Directory,
        perm,
        nlink,
        uid: 0,
        gid: 0,
        rdev: 0,
        #[cfg(target_os = "macos")]
        flags: 0,
        blksize: 4096,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vfs::leaf::SymlinkLeaf;
    use parking_lot::Mutex as SyncMutex;

    fn component(name: &str) -> Component {
        Component::new(name).unwrap()
    }

    fn root() -> Arc<PrepopulatedDir> {
        let inodes = Arc::new(InodeGenerator::new());
        let ino = inodes.next();
        PrepopulatedDir::new_root(ino, inodes, Arc::new(NoopEntryNotifier))
    }

    fn symlink(target: &str) -> InitialNode {
        InitialNode::Leaf(Arc::new(SymlinkLeaf::new(target)))
    }

    struct FixedFetcher {
        digests: DigestSet,
        nodes: Vec<(Component, String)>,
        fetch_count: SyncMutex<usize>,
    }

    impl FixedFetcher {
        fn new(nodes: Vec<(Component, String)>) -> Self {
            Self {
                digests: DigestSet::new(),
                nodes,
                fetch_count: SyncMutex::new(0),
            }
        }
    }

    #[async_trait]
    impl InitialContentsFetcher for FixedFetcher {
        async fn fetch(&self) -> Result<HashMap<Component, InitialNode>, CasError> {
            *self.fetch_count.lock() += 1;
            Ok(self
                .nodes
                .iter()
                .map(|(name, target)| {
                    let leaf: Arc<dyn OutputLeaf> = Arc::new(SymlinkLeaf::new(target.clone()));
                    (name.clone(), InitialNode::Leaf(leaf))
                })
                .collect())
        }

        async fn containing_digests(&self) -> Result<DigestSet, CasError> {
            Ok(self.digests.clone())
        }
    }

    #[tokio::test]
    async fn create_children_overwrites_and_conflicts() {
        let dir = root();
        dir.create_children(
            HashMap::from([(component("a"), symlink("one"))]),
            false,
        )
        .await
        .unwrap();

        let err = dir
            .create_children(HashMap::from([(component("a"), symlink("two"))]), false)
            .await
            .unwrap_err();
        assert!(matches!(err, DirError::AlreadyExists(_)));

        dir.create_children(HashMap::from([(component("a"), symlink("two"))]), true)
            .await
            .unwrap();
        let Some(DirChild::Leaf(leaf)) = dir.lookup_child(&component("a")).await.unwrap() else {
            panic!("expected leaf");
        };
        assert_eq!(leaf.readlink().as_deref(), Some("two"));
    }

    #[tokio::test]
    async fn create_and_enter_replaces_leaves() {
        let dir = root();
        dir.create_children(HashMap::from([(component("p"), symlink("x"))]), true)
            .await
            .unwrap();

        let child = dir.create_and_enter_directory(&component("p")).await.unwrap();
        child
            .create_children(HashMap::from([(component("q"), symlink("y"))]), true)
            .await
            .unwrap();

        let Some(DirChild::Directory(found)) = dir.lookup_child(&component("p")).await.unwrap()
        else {
            panic!("expected directory");
        };
        assert!(Arc::ptr_eq(&found, &child));
        // Entering again returns the same directory, contents intact.
        let again = dir.create_and_enter_directory(&component("p")).await.unwrap();
        assert!(Arc::ptr_eq(&again, &child));
        assert!(again.lookup_child(&component("q")).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn pending_directories_materialize_once() {
        let dir = root();
        let fetcher = Arc::new(FixedFetcher::new(vec![(component("inner"), "t".to_string())]));
        dir.create_children(
            HashMap::from([(component("lazy"), InitialNode::Directory(fetcher.clone()))]),
            true,
        )
        .await
        .unwrap();

        let Some(DirChild::Directory(lazy)) = dir.lookup_child(&component("lazy")).await.unwrap()
        else {
            panic!("expected directory");
        };
        assert_eq!(*fetcher.fetch_count.lock(), 0);
        assert!(lazy.lookup_child(&component("inner")).await.unwrap().is_some());
        assert!(lazy.lookup_child(&component("inner")).await.unwrap().is_some());
        assert_eq!(*fetcher.fetch_count.lock(), 1);
    }

    #[tokio::test]
    async fn remove_all_children_resets_pending_without_fetching() {
        let dir = root();
        let fetcher = Arc::new(FixedFetcher::new(vec![(component("inner"), "t".to_string())]));
        dir.create_children(
            HashMap::from([(component("lazy"), InitialNode::Directory(fetcher.clone()))]),
            true,
        )
        .await
        .unwrap();
        let Some(DirChild::Directory(lazy)) = dir.lookup_child(&component("lazy")).await.unwrap()
        else {
            panic!("expected directory");
        };

        lazy.remove_all_children(false).await.unwrap();
        assert!(lazy.read_dir().await.unwrap().is_empty());
        assert_eq!(*fetcher.fetch_count.lock(), 0);
    }

    #[tokio::test]
    async fn filter_children_reports_leaves_and_pending_dirs() {
        let dir = root();
        let fetcher = Arc::new(FixedFetcher::new(vec![]));
        dir.create_children(
            HashMap::from([
                (component("file"), symlink("t")),
                (component("lazy"), InitialNode::Directory(fetcher)),
            ]),
            true,
        )
        .await
        .unwrap();
        let sub = dir.create_and_enter_directory(&component("sub")).await.unwrap();
        sub.create_children(HashMap::from([(component("nested"), symlink("u"))]), true)
            .await
            .unwrap();

        let entries = dir.filter_children().await.unwrap();
        // file + lazy + nested; the materialized `sub` is recursed into, not
        // reported.
        assert_eq!(entries.len(), 3);
        let leaves = entries
            .iter()
            .filter(|e| matches!(e.node, InitialNode::Leaf(_)))
            .count();
        assert_eq!(leaves, 2);
    }

    #[tokio::test]
    async fn remover_is_idempotent_and_identity_checked() {
        let dir = root();
        dir.create_children(HashMap::from([(component("a"), symlink("one"))]), true)
            .await
            .unwrap();
        let entries = dir.filter_children().await.unwrap();
        let remover = entries[0].remover.clone();

        // Replace the entry before removing: the stale remover must not
        // touch the replacement.
        dir.create_children(HashMap::from([(component("a"), symlink("two"))]), true)
            .await
            .unwrap();
        remover.remove().await.unwrap();
        assert!(dir.lookup_child(&component("a")).await.unwrap().is_some());

        // A current remover drops the entry; repeating is harmless.
        let entries = dir.filter_children().await.unwrap();
        let remover = entries[0].remover.clone();
        remover.remove().await.unwrap();
        remover.remove().await.unwrap();
        assert!(dir.lookup_child(&component("a")).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn attr_counts_subdirectories() {
        let dir = root();
        assert_eq!(dir.attr().await.unwrap().nlink, EMPTY_DIRECTORY_LINK_COUNT);
        dir.create_and_enter_directory(&component("d1")).await.unwrap();
        dir.create_and_enter_directory(&component("d2")).await.unwrap();
        dir.create_children(HashMap::from([(component("f"), symlink("t"))]), true)
            .await
            .unwrap();
        assert_eq!(
            dir.attr().await.unwrap().nlink,
            EMPTY_DIRECTORY_LINK_COUNT + 2
        );
    }
}
