//! The remote output service node: lifecycle of output paths, bulk
//! operations driven over RPC, and the read-only directory the live output
//! bases hang off of.

pub mod create;
pub mod reconcile;
pub mod registry;
pub mod root;
pub mod stat;

use std::collections::HashMap;
use std::sync::Arc;

use thiserror::Error;
use tracing::info;

use crate::cas::{
    BlobClient, CasError, DigestError, DigestFunction, DigestKind, InstanceName, TreeFetcher,
};
use crate::path::{
    AbsoluteScopeWalker, Component, PathBuilder, ResolveError, VirtualRootScopeWalkerFactory,
    VoidComponentWalker, resolve,
};
use crate::proto;
use crate::vfs::{
    CasFileFactory, DirError, EntryNotifier, InodeGenerator, OutputPathFactory,
};

use registry::{BuildState, OutputPathHandle, OutputRegistry};

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("{0}")]
    InvalidArgument(String),

    #[error("{0}")]
    FailedPrecondition(String),

    #[error("failed to resolve path {path:?} beyond {resolved:?}")]
    Resolve {
        path: String,
        resolved: String,
        #[source]
        source: ResolveError,
    },

    #[error("{context}")]
    Path {
        context: String,
        #[source]
        source: ResolveError,
    },

    #[error("{context}")]
    Storage {
        context: String,
        #[source]
        source: CasError,
    },

    #[error("{context}")]
    Directory {
        context: String,
        #[source]
        source: DirError,
    },
}

impl ServiceError {
    pub(crate) fn path(context: impl Into<String>, source: ResolveError) -> Self {
        ServiceError::Path {
            context: context.into(),
            source,
        }
    }

    pub(crate) fn storage(context: impl Into<String>, source: CasError) -> Self {
        ServiceError::Storage {
            context: context.into(),
            source,
        }
    }

    pub(crate) fn directory(context: impl Into<String>, source: DirError) -> Self {
        ServiceError::Directory {
            context: context.into(),
            source,
        }
    }
}

impl From<DigestError> for ServiceError {
    fn from(value: DigestError) -> Self {
        ServiceError::InvalidArgument(value.to_string())
    }
}

/// The service node itself: a read-only directory whose children are the
/// live output bases, plus the RPC operations that mutate them.
pub struct OutputServiceNode {
    ino: u64,
    inodes: Arc<InodeGenerator>,
    notifier: Arc<dyn EntryNotifier>,
    output_paths: Arc<dyn OutputPathFactory>,
    blobs: Arc<dyn BlobClient>,
    trees: Arc<dyn TreeFetcher>,
    registry: OutputRegistry,
}

impl OutputServiceNode {
    pub fn new(
        inodes: Arc<InodeGenerator>,
        notifier: Arc<dyn EntryNotifier>,
        output_paths: Arc<dyn OutputPathFactory>,
        blobs: Arc<dyn BlobClient>,
        trees: Arc<dyn TreeFetcher>,
    ) -> Self {
        Self {
            ino: inodes.next(),
            inodes,
            notifier,
            output_paths,
            blobs,
            trees,
            registry: OutputRegistry::new(),
        }
    }

    pub fn ino(&self) -> u64 {
        self.ino
    }

    pub(crate) fn registry(&self) -> &OutputRegistry {
        &self.registry
    }

    fn output_base_component(output_base_id: &str) -> Result<Component, ServiceError> {
        Component::new(output_base_id).ok_or_else(|| {
            ServiceError::InvalidArgument("output base ID is not a valid filename".to_string())
        })
    }

    fn build_state(
        &self,
        build_id: &str,
    ) -> Result<(Arc<OutputPathHandle>, BuildState), ServiceError> {
        self.registry.lookup_by_build(build_id).ok_or_else(|| {
            ServiceError::FailedPrecondition(
                "build ID is not associated with any running build".to_string(),
            )
        })
    }

    /// Remove all build outputs of one output base.
    pub async fn clean(&self, request: &proto::CleanRequest) -> Result<(), ServiceError> {
        let base = Self::output_base_component(&request.output_base_id)?;

        let Some(handle) = self.registry.lookup_by_base(&base) else {
            // Never seen since startup; persistent state from an earlier
            // process may still exist.
            return self.output_paths.clean(&base).map_err(|e| {
                ServiceError::storage(format!("failed to clean output base {base:?}"), e)
            });
        };

        // Empty the tree without holding the registry lock: invalidation
        // callbacks re-enter the filesystem layer.
        handle
            .root
            .remove_all_children(true)
            .await
            .map_err(|e| ServiceError::directory("failed to remove build outputs".to_string(), e))?;

        // Only drop the registry entry if nobody replaced it while the lock
        // was released.
        self.registry.remove_base_if(&base, &handle);
        self.notifier.entry_removed(self.ino, &base);
        info!(output_base = %base, "cleaned output base");
        Ok(())
    }

    /// Announce a build, creating the output path on first use and removing
    /// entries whose CAS backing disappeared or mismatches the digest
    /// function.
    pub async fn start_build(
        &self,
        request: &proto::StartBuildRequest,
    ) -> Result<proto::StartBuildResponse, ServiceError> {
        // Normalize the prefix, then append the output base to get the full
        // output path; the suffix communicated back is relative to the
        // prefix.
        let mut prefix = PathBuilder::relative();
        resolve(
            &request.output_path_prefix,
            Box::new(AbsoluteScopeWalker::new(Box::new(VoidComponentWalker))),
            &mut prefix,
        )
        .await
        .map_err(|e| ServiceError::path("failed to resolve output path prefix", e))?;
        let base = Self::output_base_component(&request.output_base_id)?;
        let mut output_path = prefix;
        output_path.push(&base, true);

        let scope_factory = VirtualRootScopeWalkerFactory::new(
            &output_path.to_string(),
            &request.output_path_aliases,
        )
        .map_err(|e| ServiceError::path("failed to set up output path aliases", e))?;

        let instance = InstanceName::new(&request.instance_name)?;
        let kind = match request.digest_function() {
            proto::DigestFunction::Sha256 => DigestKind::Sha256,
            proto::DigestFunction::Sha384 => DigestKind::Sha384,
            proto::DigestFunction::Sha512 => DigestKind::Sha512,
            proto::DigestFunction::Unknown => {
                return Err(ServiceError::InvalidArgument(
                    "digest function was not set".to_string(),
                ));
            }
        };
        let digest_function = DigestFunction::new(instance.clone(), kind);

        let build = BuildState {
            id: request.build_id.clone(),
            digest_function: digest_function.clone(),
            scope_factory: Arc::new(scope_factory),
        };
        let handle = self.registry.announce_build(&base, build, || {
            let ino = self.inodes.next();
            let file_factory = CasFileFactory::new(self.blobs.clone());
            let root = self
                .output_paths
                .start_initial_build(&base, &file_factory, &instance, ino);
            Arc::new(OutputPathHandle { root, file_factory })
        });
        info!(output_base = %base, build_id = %request.build_id, "starting build");

        // Everything still referenced from the output path must be backed by
        // the CAS for the whole build; drop whatever is not.
        self.filter_missing_children(&handle.root, &digest_function)
            .await?;

        Ok(proto::StartBuildResponse {
            output_path_suffix: base.as_str().to_string(),
        })
    }

    /// Mark a build as completed. Unknown build IDs succeed so retries stay
    /// harmless.
    pub async fn finalize_build(&self, request: &proto::FinalizeBuildRequest) -> Result<(), ServiceError> {
        if let Some(handle) = self.registry.finalize_build(&request.build_id) {
            handle.root.finalize_build().await;
            info!(build_id = %request.build_id, "finalized build");
        }
        Ok(())
    }

    pub(crate) fn digest_from_proto(
        function: &DigestFunction,
        digest: Option<&proto::Digest>,
    ) -> Result<crate::cas::Digest, ServiceError> {
        let digest =
            digest.ok_or_else(|| ServiceError::InvalidArgument("digest was not set".to_string()))?;
        let size = u64::try_from(digest.size_bytes).map_err(|_| {
            ServiceError::InvalidArgument(format!("digest size {} is negative", digest.size_bytes))
        })?;
        Ok(function.new_digest(&digest.hash, size)?)
    }
}

/// Helper assembling `HashMap<Component, _>` literals for single insertions.
pub(crate) fn single_child<V>(name: Component, value: V) -> HashMap<Component, V> {
    HashMap::from([(name, value)])
}
