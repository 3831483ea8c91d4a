//! Blob-level access to the content-addressable store.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use sha2::{Digest as _, Sha256, Sha384, Sha512};
use thiserror::Error;

use crate::cas::digest::{Digest, DigestFunction, DigestKind, DigestSet};

#[derive(Debug, Error)]
pub enum CasError {
    #[error("blob {0} not found")]
    NotFound(String),

    #[error("blob {digest} is invalid: {reason}")]
    InvalidBlob { digest: String, reason: String },

    #[error("operation cancelled")]
    Cancelled,

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Backend(String),
}

impl CasError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, CasError::NotFound(_))
    }
}

/// Number of unique digests a single FindMissing call should carry at most.
/// Larger requests tend to get rejected or time out on real deployments.
pub const RECOMMENDED_FIND_MISSING_BATCH: usize = 10_000;

/// Client-side view of the CAS blob interface.
#[async_trait]
pub trait BlobClient: Send + Sync {
    /// Return the subset of `digests` the store does not currently hold.
    async fn find_missing(&self, digests: DigestSet) -> Result<DigestSet, CasError>;

    /// Fetch the full contents of a single blob.
    async fn read_blob(&self, digest: &Digest) -> Result<Bytes, CasError>;
}

/// Hash `data` with the algorithm of `kind`, returning lowercase hex.
pub fn hash_bytes(kind: DigestKind, data: &[u8]) -> String {
    match kind {
        DigestKind::Sha256 => hex::encode(Sha256::digest(data)),
        DigestKind::Sha384 => hex::encode(Sha384::digest(data)),
        DigestKind::Sha512 => hex::encode(Sha512::digest(data)),
    }
}

/// Hermetic blob store used by tests and demos.
#[derive(Default)]
pub struct InMemoryBlobStore {
    blobs: Mutex<HashMap<Digest, Bytes>>,
}

impl InMemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a blob under a caller-provided digest. The digest is not
    /// verified against the data, which lets tests plant mismatched entries.
    pub fn insert(&self, digest: Digest, data: Bytes) {
        self.blobs.lock().insert(digest, data);
    }

    /// Hash and insert `data` under `function`, returning its digest.
    pub fn store(&self, function: &DigestFunction, data: &[u8]) -> Digest {
        let hash = hash_bytes(function.kind(), data);
        let digest = function
            .new_digest(&hash, data.len() as u64)
            .unwrap_or_else(|_| unreachable!("hash_bytes produces valid hex"));
        self.insert(digest.clone(), Bytes::copy_from_slice(data));
        digest
    }

    /// Drop a blob, simulating CAS eviction.
    pub fn remove(&self, digest: &Digest) {
        self.blobs.lock().remove(digest);
    }
}

#[async_trait]
impl BlobClient for InMemoryBlobStore {
    async fn find_missing(&self, digests: DigestSet) -> Result<DigestSet, CasError> {
        let blobs = self.blobs.lock();
        Ok(digests
            .into_iter()
            .filter(|d| !blobs.contains_key(d))
            .collect())
    }

    async fn read_blob(&self, digest: &Digest) -> Result<Bytes, CasError> {
        self.blobs
            .lock()
            .get(digest)
            .cloned()
            .ok_or_else(|| CasError::NotFound(digest.to_string()))
    }
}

/// Blob store backed by a local directory, one file per blob. Used by the
/// standalone binary so outputs survive across demo runs.
pub struct LocalDiskBlobStore {
    root: PathBuf,
}

impl LocalDiskBlobStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn blob_path(&self, digest: &Digest) -> PathBuf {
        let mut path = self.root.clone();
        if digest.instance().is_empty() {
            path.push("_");
        } else {
            for part in digest.instance().as_str().split('/') {
                path.push(part);
            }
        }
        path.push(digest.kind().as_str());
        path.push(format!("{}-{}", digest.hash(), digest.size_bytes()));
        path
    }

    /// Hash and persist `data` under `function`, returning its digest.
    #[allow(dead_code)]
    pub async fn put(&self, function: &DigestFunction, data: &[u8]) -> Result<Digest, CasError> {
        let hash = hash_bytes(function.kind(), data);
        let digest = function
            .new_digest(&hash, data.len() as u64)
            .map_err(|e| CasError::Backend(e.to_string()))?;
        let path = self.blob_path(&digest);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&path, data).await?;
        Ok(digest)
    }

    async fn exists(path: &Path) -> Result<bool, CasError> {
        match tokio::fs::metadata(path).await {
            Ok(_) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }
}

#[async_trait]
impl BlobClient for LocalDiskBlobStore {
    async fn find_missing(&self, digests: DigestSet) -> Result<DigestSet, CasError> {
        let mut missing = DigestSet::new();
        for digest in digests {
            if !Self::exists(&self.blob_path(&digest)).await? {
                missing.insert(digest);
            }
        }
        Ok(missing)
    }

    async fn read_blob(&self, digest: &Digest) -> Result<Bytes, CasError> {
        match tokio::fs::read(self.blob_path(digest)).await {
            Ok(data) => Ok(Bytes::from(data)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(CasError::NotFound(digest.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }
}
