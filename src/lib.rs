//! rosfs: a remote output service directory.
//!
//! Build clients talk to the service over gRPC to start builds, bulk-create
//! output entries, bulk-stat them, finalize builds and wipe state. The same
//! entries are visible through a filesystem surface, where file contents are
//! fetched from a content-addressable store the first time something reads
//! them. Nothing survives a process restart, only the latest build per
//! output base is visible, and there is no garbage collection; all of that
//! is by the scope of the service, not an accident.

pub mod cas;
pub mod outputs;
pub mod path;
pub mod rpc;
pub mod vfs;

/// Generated gRPC bindings for the remote output service.
#[allow(clippy::all)]
pub mod proto {
    tonic::include_proto!("rosfs.outputservice");
}

pub use cas::{BlobClient, CasTreeFetcher, InMemoryBlobStore, LocalDiskBlobStore, TreeFetcher};
pub use outputs::{OutputServiceNode, ServiceError};
pub use rpc::{OutputServiceGrpc, serve};
pub use vfs::{
    InMemoryOutputPathFactory, InodeGenerator, NoopEntryNotifier, OutputPathFactory,
};
