//! Bulk creation of output files, directories and symlinks.
//!
//! Two walker flavors drive it: a prefix-creating walker that force-creates
//! every intermediate directory of the request's path prefix, and a
//! parent-creating walker that does the same for each entry's parent while
//! capturing the terminal name the entry is inserted under. Neither follows
//! symlinks; whatever non-directory is in the way gets replaced.

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::debug;

use crate::outputs::{OutputServiceNode, ServiceError, single_child};
use crate::path::walker::on_terminal_via_on_directory;
use crate::path::{
    Component, ComponentWalker, DirectoryOrSymlink, FollowSymlink, PathBuilder,
    RelativeScopeWalker, ResolveError, resolve,
};
use crate::proto;
use crate::vfs::{
    CasTreeContentsFetcher, InitialContentsFetcher, InitialNode, OutputLeaf, PrepopulatedDir,
    SymlinkLeaf,
};

/// Directory stack shared between a walker and the caller that reads the
/// terminal position after resolution. Starts at (and never pops past) the
/// directory the walk is rooted in.
type DirStack = Arc<Mutex<Vec<Arc<PrepopulatedDir>>>>;

fn current_dir(stack: &DirStack) -> Arc<PrepopulatedDir> {
    stack
        .lock()
        .last()
        .cloned()
        .expect("walker stacks always retain their root")
}

/// Walker that enters every component, creating directories as needed. The
/// terminal component is a directory too.
struct PrefixCreatingWalker {
    stack: DirStack,
}

#[async_trait]
impl ComponentWalker for PrefixCreatingWalker {
    async fn on_directory(
        self: Box<Self>,
        name: &Component,
    ) -> Result<DirectoryOrSymlink, ResolveError> {
        let dir = current_dir(&self.stack);
        let child = dir
            .create_and_enter_directory(name)
            .await
            .map_err(ResolveError::from)?;
        self.stack.lock().push(child);
        Ok(DirectoryOrSymlink::Directory {
            child: self,
            reversible: true,
        })
    }

    async fn on_terminal(
        self: Box<Self>,
        name: &Component,
    ) -> Result<Option<FollowSymlink>, ResolveError> {
        on_terminal_via_on_directory(self, name).await
    }

    fn on_up(self: Box<Self>) -> Result<Box<dyn ComponentWalker>, ResolveError> {
        let mut stack = self.stack.lock();
        if stack.len() == 1 {
            return Err(ResolveError::OutsideOutputPath);
        }
        stack.pop();
        drop(stack);
        Ok(self)
    }
}

/// Walker resolving the parent directory of an entry, capturing the terminal
/// name. A path without a terminal name resolves to a directory, which is
/// not a creatable position.
struct ParentCreatingWalker {
    stack: DirStack,
    name: Arc<Mutex<Option<Component>>>,
}

#[async_trait]
impl ComponentWalker for ParentCreatingWalker {
    async fn on_directory(
        self: Box<Self>,
        name: &Component,
    ) -> Result<DirectoryOrSymlink, ResolveError> {
        let dir = current_dir(&self.stack);
        let child = dir
            .create_and_enter_directory(name)
            .await
            .map_err(ResolveError::from)?;
        self.stack.lock().push(child);
        Ok(DirectoryOrSymlink::Directory {
            child: self,
            reversible: true,
        })
    }

    async fn on_terminal(
        self: Box<Self>,
        name: &Component,
    ) -> Result<Option<FollowSymlink>, ResolveError> {
        *self.name.lock() = Some(name.clone());
        Ok(None)
    }

    fn on_up(self: Box<Self>) -> Result<Box<dyn ComponentWalker>, ResolveError> {
        let mut stack = self.stack.lock();
        if stack.len() == 1 {
            return Err(ResolveError::OutsideOutputPath);
        }
        stack.pop();
        drop(stack);
        Ok(self)
    }
}

impl OutputServiceNode {
    /// Create files, directories and symlinks under one path prefix. Entries
    /// are processed in request order per category; the first failure aborts
    /// the call, leaving earlier creations in place.
    pub async fn batch_create(
        &self,
        request: &proto::BatchCreateRequest,
    ) -> Result<(), ServiceError> {
        let (handle, build) = self.build_state(&request.build_id)?;

        // Resolve (and create) the path prefix.
        let stack: DirStack = Arc::new(Mutex::new(vec![handle.root.clone()]));
        let walker = Box::new(PrefixCreatingWalker {
            stack: stack.clone(),
        });
        let mut builder = PathBuilder::relative();
        resolve(
            &request.path_prefix,
            Box::new(RelativeScopeWalker::new(walker)),
            &mut builder,
        )
        .await
        .map_err(|e| ServiceError::path("failed to create path prefix directory", e))?;

        let prefix_stack = stack.lock().clone();
        if request.clean_path_prefix {
            // No invalidation: nothing that was here needs to remain visible
            // as having existed.
            let terminal = prefix_stack
                .last()
                .cloned()
                .expect("walker stacks always retain their root");
            terminal.remove_all_children(false).await.map_err(|e| {
                ServiceError::directory("failed to clean path prefix directory", e)
            })?;
        }

        debug!(
            build_id = %request.build_id,
            files = request.files.len(),
            directories = request.directories.len(),
            symlinks = request.symlinks.len(),
            "creating batch"
        );

        for entry in &request.files {
            let digest = Self::digest_from_proto(&build.digest_function, entry.digest.as_ref())
                .map_err(|e| {
                    ServiceError::InvalidArgument(format!(
                        "invalid digest for file {:?}: {e}",
                        entry.path
                    ))
                })?;
            let leaf = handle.file_factory.lookup_file(digest, entry.is_executable);
            self.create_child(&prefix_stack, &entry.path, InitialNode::Leaf(leaf))
                .await
                .map_err(|e| e.with_create_context("file", &entry.path))?;
        }

        for entry in &request.directories {
            let digest =
                Self::digest_from_proto(&build.digest_function, entry.tree_digest.as_ref())
                    .map_err(|e| {
                        ServiceError::InvalidArgument(format!(
                            "invalid digest for directory {:?}: {e}",
                            entry.path
                        ))
                    })?;
            let fetcher: Arc<dyn InitialContentsFetcher> = Arc::new(CasTreeContentsFetcher::new(
                self.trees.clone(),
                digest,
                handle.file_factory.clone(),
            ));
            self.create_child(&prefix_stack, &entry.path, InitialNode::Directory(fetcher))
                .await
                .map_err(|e| e.with_create_context("directory", &entry.path))?;
        }

        for entry in &request.symlinks {
            let leaf: Arc<dyn OutputLeaf> = Arc::new(SymlinkLeaf::new(entry.target.clone()));
            self.create_child(&prefix_stack, &entry.path, InitialNode::Leaf(leaf))
                .await
                .map_err(|e| e.with_create_context("symbolic link", &entry.path))?;
        }

        Ok(())
    }

    /// Insert one node at `path`, resolved relative to the prefix directory
    /// stack, creating parents as needed.
    async fn create_child(
        &self,
        prefix_stack: &[Arc<PrepopulatedDir>],
        path: &str,
        node: InitialNode,
    ) -> Result<(), ServiceError> {
        let stack: DirStack = Arc::new(Mutex::new(prefix_stack.to_vec()));
        let name = Arc::new(Mutex::new(None));
        let walker = Box::new(ParentCreatingWalker {
            stack: stack.clone(),
            name: name.clone(),
        });
        let mut builder = PathBuilder::relative();
        resolve(path, Box::new(RelativeScopeWalker::new(walker)), &mut builder)
            .await
            .map_err(|e| ServiceError::path("failed to resolve path", e))?;

        let Some(name) = name.lock().take() else {
            return Err(ServiceError::InvalidArgument(
                "path resolves to a directory".to_string(),
            ));
        };
        let parent = current_dir(&stack);
        parent
            .create_children(single_child(name, node), true)
            .await
            .map_err(|e| ServiceError::directory("failed to create entry", e))
    }
}

impl ServiceError {
    fn with_create_context(self, kind: &str, path: &str) -> ServiceError {
        match self {
            ServiceError::InvalidArgument(msg) => {
                ServiceError::InvalidArgument(format!("failed to create {kind} {path:?}: {msg}"))
            }
            ServiceError::Path { context, source } => ServiceError::Path {
                context: format!("failed to create {kind} {path:?}: {context}"),
                source,
            },
            ServiceError::Directory { context, source } => ServiceError::Directory {
                context: format!("failed to create {kind} {path:?}: {context}"),
                source,
            },
            other => other,
        }
    }
}
