//! Factories binding the lazy tree to the CAS: file leaves for blob digests,
//! directory fetchers for tree digests, and the per-output-base root.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use crate::cas::{BlobClient, CasError, Digest, DigestSet, InstanceName, TreeFetcher};
use crate::path::Component;
use crate::vfs::dir::{EntryNotifier, InitialContentsFetcher, InitialNode, PrepopulatedDir};
use crate::vfs::inode::InodeGenerator;
use crate::vfs::leaf::{CasFileLeaf, OutputLeaf, SymlinkLeaf};

/// Creates lazy file leaves bound to one blob store.
#[derive(Clone)]
pub struct CasFileFactory {
    blobs: Arc<dyn BlobClient>,
}

impl CasFileFactory {
    pub fn new(blobs: Arc<dyn BlobClient>) -> Self {
        Self { blobs }
    }

    pub fn lookup_file(&self, digest: Digest, executable: bool) -> Arc<CasFileLeaf> {
        Arc::new(CasFileLeaf::new(digest, executable, self.blobs.clone()))
    }
}

/// Contents fetcher expanding one tree manifest level. Subdirectories become
/// further fetchers, so a deep tree only ever loads the levels that are
/// actually entered.
pub struct CasTreeContentsFetcher {
    trees: Arc<dyn TreeFetcher>,
    tree_digest: Digest,
    files: CasFileFactory,
}

impl CasTreeContentsFetcher {
    pub fn new(trees: Arc<dyn TreeFetcher>, tree_digest: Digest, files: CasFileFactory) -> Self {
        Self {
            trees,
            tree_digest,
            files,
        }
    }
}

#[async_trait]
impl InitialContentsFetcher for CasTreeContentsFetcher {
    async fn fetch(&self) -> Result<HashMap<Component, InitialNode>, CasError> {
        let manifest = self.trees.fetch_tree(&self.tree_digest).await?;
        let mut nodes = HashMap::new();
        for file in manifest.files {
            nodes.insert(
                file.name,
                InitialNode::Leaf(self.files.lookup_file(file.digest, file.executable)),
            );
        }
        for dir in manifest.directories {
            let fetcher: Arc<dyn InitialContentsFetcher> = Arc::new(CasTreeContentsFetcher::new(
                self.trees.clone(),
                dir.tree_digest,
                self.files.clone(),
            ));
            nodes.insert(dir.name, InitialNode::Directory(fetcher));
        }
        for symlink in manifest.symlinks {
            let leaf: Arc<dyn OutputLeaf> = Arc::new(SymlinkLeaf::new(symlink.target));
            nodes.insert(symlink.name, InitialNode::Leaf(leaf));
        }
        Ok(nodes)
    }

    async fn containing_digests(&self) -> Result<DigestSet, CasError> {
        // Walk the manifests without materializing any directory. A missing
        // nested manifest fails with not-found, which callers treat the same
        // as a missing root manifest.
        let mut digests = DigestSet::new();
        let mut stack = vec![self.tree_digest.clone()];
        while let Some(tree_digest) = stack.pop() {
            if !digests.insert(tree_digest.clone()) {
                continue;
            }
            let manifest = self.trees.fetch_tree(&tree_digest).await?;
            for file in &manifest.files {
                digests.insert(file.digest.clone());
            }
            for dir in &manifest.directories {
                stack.push(dir.tree_digest.clone());
            }
        }
        Ok(digests)
    }
}

/// Produces and cleans the per-output-base roots. Implementations with
/// persistent state use the extra parameters to rebind it; the in-memory
/// implementation only needs to allocate.
pub trait OutputPathFactory: Send + Sync {
    fn start_initial_build(
        &self,
        output_base_id: &Component,
        file_factory: &CasFileFactory,
        instance: &InstanceName,
        ino: u64,
    ) -> Arc<PrepopulatedDir>;

    /// Remove state of an output base this process has never seen. A no-op
    /// wherever nothing outlives the process.
    fn clean(&self, output_base_id: &Component) -> Result<(), CasError>;
}

pub struct InMemoryOutputPathFactory {
    inodes: Arc<InodeGenerator>,
    notifier: Arc<dyn EntryNotifier>,
}

impl InMemoryOutputPathFactory {
    pub fn new(inodes: Arc<InodeGenerator>, notifier: Arc<dyn EntryNotifier>) -> Self {
        Self { inodes, notifier }
    }
}

impl OutputPathFactory for InMemoryOutputPathFactory {
    fn start_initial_build(
        &self,
        _output_base_id: &Component,
        _file_factory: &CasFileFactory,
        _instance: &InstanceName,
        ino: u64,
    ) -> Arc<PrepopulatedDir> {
        PrepopulatedDir::new_root(ino, self.inodes.clone(), self.notifier.clone())
    }

    fn clean(&self, _output_base_id: &Component) -> Result<(), CasError> {
        Ok(())
    }
}
