use std::net::SocketAddr;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tonic::transport::Server;

use crate::election::ElectionNode;
use crate::grpc::election_service::ElectionServiceImpl;
use crate::grpc::worker_service::WorkerServiceImpl;
use crate::proto::election_service_server::ElectionServiceServer;
use crate::proto::worker_service_server::WorkerServiceServer;

pub struct GrpcServer {
    addr: SocketAddr,
    election_node: Option<Arc<ElectionNode>>,
    worker_service: WorkerServiceImpl,
}

impl GrpcServer {
    pub fn new(
        addr: SocketAddr,
        election_node: Option<Arc<ElectionNode>>,
        worker_service: WorkerServiceImpl,
    ) -> Self {
        Self {
            addr,
            election_node,
            worker_service,
        }
    }

    /// Serve until `shutdown` is cancelled.
    pub async fn run(self, shutdown: CancellationToken) -> Result<(), tonic::transport::Error> {
        let election_service = self
            .election_node
            .map(|node| ElectionServiceServer::new(ElectionServiceImpl::new(node)));

        tracing::info!(addr = %self.addr, election = election_service.is_some(), "Starting gRPC server");

        Server::builder()
            .add_optional_service(election_service)
            .add_service(WorkerServiceServer::new(self.worker_service))
            .serve_with_shutdown(self.addr, async move { shutdown.cancelled().await })
            .await
    }
}
