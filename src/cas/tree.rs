//! Indexed tree manifests: directory listings stored in the CAS.

use std::sync::Arc;

use async_trait::async_trait;
use prost::Message;

use crate::cas::client::{BlobClient, CasError};
use crate::cas::digest::Digest;
use crate::path::Component;
use crate::proto;

/// One level of a lazily expanded directory tree, decoded and validated.
#[derive(Debug)]
pub struct TreeManifest {
    pub files: Vec<TreeFileNode>,
    pub directories: Vec<TreeDirectoryNode>,
    pub symlinks: Vec<TreeSymlinkNode>,
}

#[derive(Debug)]
pub struct TreeFileNode {
    pub name: Component,
    pub digest: Digest,
    pub executable: bool,
}

#[derive(Debug)]
pub struct TreeDirectoryNode {
    pub name: Component,
    pub tree_digest: Digest,
}

#[derive(Debug)]
pub struct TreeSymlinkNode {
    pub name: Component,
    pub target: String,
}

impl TreeManifest {
    /// Validate a raw proto manifest. Child digests inherit the namespace of
    /// the tree digest they were reached through.
    fn from_proto(raw: proto::TreeManifest, tree_digest: &Digest) -> Result<Self, CasError> {
        let function = tree_digest.function();
        let invalid = |reason: String| CasError::InvalidBlob {
            digest: tree_digest.to_string(),
            reason,
        };

        let mut files = Vec::with_capacity(raw.files.len());
        for file in raw.files {
            let name = Component::new(&file.name)
                .ok_or_else(|| invalid(format!("invalid file name {:?}", file.name)))?;
            let digest = file
                .digest
                .ok_or_else(|| invalid(format!("file {:?} has no digest", name.as_str())))?;
            let size = u64::try_from(digest.size_bytes)
                .map_err(|_| invalid(format!("file {:?} has a negative size", name.as_str())))?;
            let digest = function
                .new_digest(&digest.hash, size)
                .map_err(|e| invalid(format!("file {:?}: {e}", name.as_str())))?;
            files.push(TreeFileNode {
                name,
                digest,
                executable: file.is_executable,
            });
        }

        let mut directories = Vec::with_capacity(raw.directories.len());
        for dir in raw.directories {
            let name = Component::new(&dir.name)
                .ok_or_else(|| invalid(format!("invalid directory name {:?}", dir.name)))?;
            let digest = dir
                .tree_digest
                .ok_or_else(|| invalid(format!("directory {:?} has no digest", name.as_str())))?;
            let size = u64::try_from(digest.size_bytes)
                .map_err(|_| invalid(format!("directory {:?} has a negative size", name.as_str())))?;
            let tree_digest = function
                .new_digest(&digest.hash, size)
                .map_err(|e| invalid(format!("directory {:?}: {e}", name.as_str())))?;
            directories.push(TreeDirectoryNode { name, tree_digest });
        }

        let mut symlinks = Vec::with_capacity(raw.symlinks.len());
        for symlink in raw.symlinks {
            let name = Component::new(&symlink.name)
                .ok_or_else(|| invalid(format!("invalid symlink name {:?}", symlink.name)))?;
            symlinks.push(TreeSymlinkNode {
                name,
                target: symlink.target,
            });
        }

        Ok(Self {
            files,
            directories,
            symlinks,
        })
    }
}

/// Resolves a tree digest to its decoded manifest.
#[async_trait]
pub trait TreeFetcher: Send + Sync {
    async fn fetch_tree(&self, digest: &Digest) -> Result<TreeManifest, CasError>;
}

/// Tree fetcher reading serialized manifests straight from the blob store.
pub struct CasTreeFetcher {
    blobs: Arc<dyn BlobClient>,
}

impl CasTreeFetcher {
    pub fn new(blobs: Arc<dyn BlobClient>) -> Self {
        Self { blobs }
    }
}

#[async_trait]
impl TreeFetcher for CasTreeFetcher {
    async fn fetch_tree(&self, digest: &Digest) -> Result<TreeManifest, CasError> {
        let data = self.blobs.read_blob(digest).await?;
        let raw = proto::TreeManifest::decode(data.as_ref()).map_err(|e| CasError::InvalidBlob {
            digest: digest.to_string(),
            reason: e.to_string(),
        })?;
        TreeManifest::from_proto(raw, digest)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cas::client::InMemoryBlobStore;
    use crate::cas::digest::{DigestFunction, DigestKind, InstanceName};

    fn function() -> DigestFunction {
        DigestFunction::new(InstanceName::new("tests").unwrap(), DigestKind::Sha256)
    }

    #[tokio::test]
    async fn decodes_and_validates_manifests() {
        let blobs = Arc::new(InMemoryBlobStore::new());
        let function = function();
        let file_digest = blobs.store(&function, b"payload");

        let raw = proto::TreeManifest {
            files: vec![proto::TreeFile {
                name: "tool".to_string(),
                digest: Some(proto::Digest {
                    hash: file_digest.hash().to_string(),
                    size_bytes: file_digest.size_bytes() as i64,
                }),
                is_executable: true,
            }],
            directories: vec![],
            symlinks: vec![proto::TreeSymlink {
                name: "link".to_string(),
                target: "tool".to_string(),
            }],
        };
        let tree_digest = blobs.store(&function, &raw.encode_to_vec());

        let fetcher = CasTreeFetcher::new(blobs);
        let manifest = fetcher.fetch_tree(&tree_digest).await.unwrap();
        assert_eq!(manifest.files.len(), 1);
        assert_eq!(manifest.files[0].name.as_str(), "tool");
        assert!(manifest.files[0].executable);
        assert_eq!(manifest.files[0].digest, file_digest);
        assert_eq!(manifest.symlinks[0].target, "tool");
    }

    #[tokio::test]
    async fn rejects_invalid_child_names() {
        let blobs = Arc::new(InMemoryBlobStore::new());
        let function = function();
        let raw = proto::TreeManifest {
            files: vec![],
            directories: vec![],
            symlinks: vec![proto::TreeSymlink {
                name: "..".to_string(),
                target: "x".to_string(),
            }],
        };
        let tree_digest = blobs.store(&function, &raw.encode_to_vec());

        let fetcher = CasTreeFetcher::new(blobs);
        let err = fetcher.fetch_tree(&tree_digest).await.unwrap_err();
        assert!(matches!(err, CasError::InvalidBlob { .. }));
    }

    #[tokio::test]
    async fn missing_manifest_is_not_found() {
        let blobs = Arc::new(InMemoryBlobStore::new());
        let absent = function().new_digest(&"a".repeat(64), 10).unwrap();
        let fetcher = CasTreeFetcher::new(blobs);
        assert!(fetcher.fetch_tree(&absent).await.unwrap_err().is_not_found());
    }
}
