//! Lazy leaves stored inside output paths: CAS-backed files whose contents
//! are fetched on first read, and symlinks holding a literal target.

use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::OnceCell;

use crate::cas::{BlobClient, CasError, Digest, DigestFunction, DigestSet};

/// Status of a leaf as reported to build clients.
#[derive(Clone, Debug, PartialEq)]
pub enum LeafStatus {
    File {
        /// Only set when a digest function was supplied and matches the
        /// namespace the file was created under.
        digest: Option<Digest>,
        size_bytes: u64,
        executable: bool,
    },
    Symlink {
        target: String,
    },
}

pub trait OutputLeaf: Send + Sync {
    /// CAS digests this leaf depends on.
    fn containing_digests(&self) -> DigestSet;

    /// Symlink target; `None` for anything that is not a symlink.
    fn readlink(&self) -> Option<String>;

    fn status(&self, digest_function: Option<&DigestFunction>) -> LeafStatus;
}

/// Regular file whose contents live in the CAS until first accessed.
pub struct CasFileLeaf {
    digest: Digest,
    executable: bool,
    blobs: Arc<dyn BlobClient>,
    contents: OnceCell<Bytes>,
}

impl CasFileLeaf {
    pub(crate) fn new(digest: Digest, executable: bool, blobs: Arc<dyn BlobClient>) -> Self {
        Self {
            digest,
            executable,
            blobs,
            contents: OnceCell::new(),
        }
    }

    pub fn digest(&self) -> &Digest {
        &self.digest
    }

    pub fn is_executable(&self) -> bool {
        self.executable
    }

    /// Fetch the contents, at most once; concurrent and later reads share the
    /// cached bytes.
    pub async fn read(&self) -> Result<Bytes, CasError> {
        self.contents
            .get_or_try_init(|| async { self.blobs.read_blob(&self.digest).await })
            .await
            .cloned()
    }
}

impl OutputLeaf for CasFileLeaf {
    fn containing_digests(&self) -> DigestSet {
        DigestSet::from([self.digest.clone()])
    }

    fn readlink(&self) -> Option<String> {
        None
    }

    fn status(&self, digest_function: Option<&DigestFunction>) -> LeafStatus {
        let digest = digest_function
            .filter(|function| self.digest.uses_function(function))
            .map(|_| self.digest.clone());
        LeafStatus::File {
            digest,
            size_bytes: self.digest.size_bytes(),
            executable: self.executable,
        }
    }
}

/// Symbolic link with a literal, never-resolved target.
pub struct SymlinkLeaf {
    target: String,
}

impl SymlinkLeaf {
    pub fn new(target: impl Into<String>) -> Self {
        Self {
            target: target.into(),
        }
    }
}

impl OutputLeaf for SymlinkLeaf {
    fn containing_digests(&self) -> DigestSet {
        DigestSet::new()
    }

    fn readlink(&self) -> Option<String> {
        Some(self.target.clone())
    }

    fn status(&self, _digest_function: Option<&DigestFunction>) -> LeafStatus {
        LeafStatus::Symlink {
            target: self.target.clone(),
        }
    }
}
