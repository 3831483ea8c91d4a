//! Contracts and value types for the content-addressable store: the digest
//! model, blob-level access, and indexed tree manifests.

pub mod client;
pub mod digest;
pub mod tree;

pub use client::{BlobClient, CasError, InMemoryBlobStore, LocalDiskBlobStore};
pub use digest::{Digest, DigestError, DigestFunction, DigestKind, DigestSet, InstanceName};
pub use tree::{CasTreeFetcher, TreeFetcher, TreeManifest};
