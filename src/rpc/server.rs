//! tonic server implementation delegating to the service node.

use std::future::Future;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio_stream::wrappers::TcpListenerStream;
use tonic::transport::Server;
use tonic::{Request, Response, Status};
use tracing::info;

use crate::cas::CasError;
use crate::outputs::{OutputServiceNode, ServiceError};
use crate::path::ResolveError;
use crate::proto;
use crate::proto::remote_output_service_server::{
    RemoteOutputService, RemoteOutputServiceServer,
};

/// gRPC adapter around a shared service node.
#[derive(Clone)]
pub struct OutputServiceGrpc {
    node: Arc<OutputServiceNode>,
}

impl OutputServiceGrpc {
    pub fn new(node: Arc<OutputServiceNode>) -> Self {
        Self { node }
    }
}

/// Render an error with its full source chain, so status messages name the
/// offending digest or path.
fn error_chain(err: &dyn std::error::Error) -> String {
    let mut message = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        message.push_str(": ");
        message.push_str(&cause.to_string());
        source = cause.source();
    }
    message
}

fn to_status(err: ServiceError) -> Status {
    let message = error_chain(&err);
    match &err {
        ServiceError::InvalidArgument(_) => Status::invalid_argument(message),
        ServiceError::FailedPrecondition(_) => Status::failed_precondition(message),
        ServiceError::Resolve { source, .. } | ServiceError::Path { source, .. } => match source {
            ResolveError::OutsideOutputPath
            | ResolveError::UnexpectedAbsolute
            | ResolveError::UnexpectedRelative
            | ResolveError::InvalidPath(_) => Status::invalid_argument(message),
            ResolveError::SymlinkLoop
            | ResolveError::NotFound
            | ResolveError::NotADirectory => Status::failed_precondition(message),
            ResolveError::Storage(cas) => storage_status(cas, message),
        },
        ServiceError::Storage { source, .. } => storage_status(source, message),
        ServiceError::Directory { .. } => Status::internal(message),
    }
}

fn storage_status(source: &CasError, message: String) -> Status {
    match source {
        CasError::Cancelled => Status::cancelled(message),
        CasError::NotFound(_) => Status::not_found(message),
        _ => Status::internal(message),
    }
}

#[tonic::async_trait]
impl RemoteOutputService for OutputServiceGrpc {
    async fn clean(
        &self,
        request: Request<proto::CleanRequest>,
    ) -> Result<Response<proto::CleanResponse>, Status> {
        self.node
            .clean(request.get_ref())
            .await
            .map_err(to_status)?;
        Ok(Response::new(proto::CleanResponse {}))
    }

    async fn start_build(
        &self,
        request: Request<proto::StartBuildRequest>,
    ) -> Result<Response<proto::StartBuildResponse>, Status> {
        let response = self
            .node
            .start_build(request.get_ref())
            .await
            .map_err(to_status)?;
        Ok(Response::new(response))
    }

    async fn batch_create(
        &self,
        request: Request<proto::BatchCreateRequest>,
    ) -> Result<Response<proto::BatchCreateResponse>, Status> {
        self.node
            .batch_create(request.get_ref())
            .await
            .map_err(to_status)?;
        Ok(Response::new(proto::BatchCreateResponse {}))
    }

    async fn batch_stat(
        &self,
        request: Request<proto::BatchStatRequest>,
    ) -> Result<Response<proto::BatchStatResponse>, Status> {
        let response = self
            .node
            .batch_stat(request.get_ref())
            .await
            .map_err(to_status)?;
        Ok(Response::new(response))
    }

    async fn finalize_build(
        &self,
        request: Request<proto::FinalizeBuildRequest>,
    ) -> Result<Response<proto::FinalizeBuildResponse>, Status> {
        self.node
            .finalize_build(request.get_ref())
            .await
            .map_err(to_status)?;
        Ok(Response::new(proto::FinalizeBuildResponse {}))
    }
}

/// Serve the remote output service on an existing listener until `shutdown`
/// resolves.
pub async fn serve<S>(
    node: Arc<OutputServiceNode>,
    listener: TcpListener,
    shutdown: S,
) -> Result<(), tonic::transport::Error>
where
    S: Future<Output = ()> + Send + 'static,
{
    if let Ok(addr) = listener.local_addr() {
        info!(%addr, "serving remote output service");
    }
    Server::builder()
        .add_service(RemoteOutputServiceServer::new(OutputServiceGrpc::new(node)))
        .serve_with_incoming_shutdown(TcpListenerStream::new(listener), shutdown)
        .await
}
