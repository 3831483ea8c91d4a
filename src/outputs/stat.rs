//! Bulk stat of output path entries.
//!
//! Each requested path is resolved by a stat walker sitting at the bottom of
//! a chain: the build's virtual-root walker rewrites absolute symlink targets
//! that point back into the output path, and a loop detector bounds symlink
//! expansion. Three outcomes exist per path: the entry is absent, it resolved
//! to something inside the tree, or resolution left the tree and the client
//! gets the residual path to stat on its own.

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::cas::DigestFunction;
use crate::outputs::{OutputServiceNode, ServiceError};
use crate::path::{
    Component, ComponentWalker, DirectoryOrSymlink, FollowSymlink, LoopDetectingScopeWalker,
    PathBuilder, ResolveError, ScopeWalker, VoidComponentWalker, resolve,
};
use crate::proto;
use crate::vfs::{DirChild, LeafStatus, PrepopulatedDir};

struct StatShared {
    follow_symlinks: bool,
    digest_function: Option<DigestFunction>,
    state: Mutex<StatState>,
}

struct StatState {
    /// Directory stack; index 0 is the output path root and is never popped.
    stack: Vec<Arc<PrepopulatedDir>>,
    /// Status captured so far. `None` once resolution has left the tree.
    file_status: Option<proto::FileStatus>,
}

/// Walker resolving one path for BatchStat. Cheap to re-box: all state lives
/// behind the shared handle, which the caller keeps to read the result.
struct StatWalker {
    shared: Arc<StatShared>,
}

impl StatWalker {
    fn rebox(&self) -> Box<StatWalker> {
        Box::new(StatWalker {
            shared: self.shared.clone(),
        })
    }

    fn current(&self) -> Arc<PrepopulatedDir> {
        self.shared
            .state
            .lock()
            .stack
            .last()
            .cloned()
            .expect("the stat stack always retains the root")
    }

    fn directory_status() -> proto::FileStatus {
        proto::FileStatus {
            file_type: Some(proto::file_status::FileType::Directory(
                proto::file_status::Directory {},
            )),
        }
    }
}

impl ScopeWalker for StatWalker {
    fn on_scope(self: Box<Self>, absolute: bool) -> Result<Box<dyn ComponentWalker>, ResolveError> {
        let mut state = self.shared.state.lock();
        if absolute {
            state.stack.truncate(1);
        }
        // Whatever scope we are in, we are sitting in a known directory now.
        state.file_status = Some(Self::directory_status());
        drop(state);
        Ok(self)
    }
}

#[async_trait]
impl ComponentWalker for StatWalker {
    async fn on_directory(
        self: Box<Self>,
        name: &Component,
    ) -> Result<DirectoryOrSymlink, ResolveError> {
        let dir = self.current();
        match dir.lookup_child(name).await.map_err(ResolveError::from)? {
            None => Err(ResolveError::NotFound),
            Some(DirChild::Directory(child)) => {
                self.shared.state.lock().stack.push(child);
                Ok(DirectoryOrSymlink::Directory {
                    child: self,
                    reversible: true,
                })
            }
            Some(DirChild::Leaf(leaf)) => match leaf.readlink() {
                // Symlinks in the middle of a path are always followed.
                Some(target) => {
                    self.shared.state.lock().file_status = None;
                    let parent = self.rebox();
                    Ok(DirectoryOrSymlink::Symlink(FollowSymlink {
                        parent,
                        target,
                    }))
                }
                None => Err(ResolveError::NotADirectory),
            },
        }
    }

    async fn on_terminal(
        self: Box<Self>,
        name: &Component,
    ) -> Result<Option<FollowSymlink>, ResolveError> {
        let dir = self.current();
        match dir.lookup_child(name).await.map_err(ResolveError::from)? {
            None => Err(ResolveError::NotFound),
            Some(DirChild::Directory(_)) => {
                // The directory status set when the scope was entered stands.
                Ok(None)
            }
            Some(DirChild::Leaf(leaf)) => {
                if self.shared.follow_symlinks {
                    if let Some(target) = leaf.readlink() {
                        self.shared.state.lock().file_status = None;
                        let parent = self.rebox();
                        return Ok(Some(FollowSymlink { parent, target }));
                    }
                }
                let status = leaf_status_to_proto(
                    leaf.status(self.shared.digest_function.as_ref()),
                );
                self.shared.state.lock().file_status = Some(status);
                Ok(None)
            }
        }
    }

    fn on_up(self: Box<Self>) -> Result<Box<dyn ComponentWalker>, ResolveError> {
        let mut state = self.shared.state.lock();
        if state.stack.len() == 1 {
            // Above the output path root: resolution continues outside the
            // tree, with only the recorded path left to report.
            state.file_status = None;
            drop(state);
            return Ok(Box::new(VoidComponentWalker));
        }
        state.stack.pop();
        drop(state);
        Ok(self)
    }
}

fn leaf_status_to_proto(status: LeafStatus) -> proto::FileStatus {
    let file_type = match status {
        LeafStatus::File {
            digest,
            size_bytes,
            executable,
        } => proto::file_status::FileType::File(proto::file_status::File {
            digest: digest.map(|d| proto::Digest {
                hash: d.hash().to_string(),
                size_bytes: d.size_bytes() as i64,
            }),
            is_executable: executable,
            size_bytes: size_bytes as i64,
        }),
        LeafStatus::Symlink { target } => {
            proto::file_status::FileType::Symlink(proto::file_status::Symlink { target })
        }
    };
    proto::FileStatus {
        file_type: Some(file_type),
    }
}

impl OutputServiceNode {
    /// Resolve each requested path and report its status. The first
    /// unexpected resolution error aborts the whole batch, naming the path
    /// and how far it got.
    pub async fn batch_stat(
        &self,
        request: &proto::BatchStatRequest,
    ) -> Result<proto::BatchStatResponse, ServiceError> {
        let (handle, build) = self.build_state(&request.build_id)?;

        let mut responses = Vec::with_capacity(request.paths.len());
        for path in &request.paths {
            let shared = Arc::new(StatShared {
                follow_symlinks: request.follow_symlinks,
                digest_function: request
                    .include_file_digest
                    .then(|| build.digest_function.clone()),
                state: Mutex::new(StatState {
                    stack: vec![handle.root.clone()],
                    file_status: None,
                }),
            });
            let walker = Box::new(StatWalker {
                shared: shared.clone(),
            });
            let chain = build
                .scope_factory
                .wrap(Box::new(LoopDetectingScopeWalker::new(walker)));

            let mut builder = PathBuilder::relative();
            match resolve(path, chain, &mut builder).await {
                Err(ResolveError::NotFound) => {
                    responses.push(proto::StatResponse::default());
                }
                Err(source) => {
                    return Err(ServiceError::Resolve {
                        path: path.clone(),
                        resolved: builder.to_string(),
                        source,
                    });
                }
                Ok(()) => {
                    let status = shared.state.lock().file_status.take();
                    let file_status = status.unwrap_or_else(|| proto::FileStatus {
                        file_type: Some(proto::file_status::FileType::External(
                            proto::file_status::External {
                                next_path: builder.to_string(),
                            },
                        )),
                    });
                    responses.push(proto::StatResponse {
                        file_status: Some(file_status),
                    });
                }
            }
        }
        Ok(proto::BatchStatResponse { responses })
    }
}
