use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio_stream::wrappers::TcpListenerStream;
use tokio_util::sync::CancellationToken;
use tonic::transport::Server;

use crate::coordinator::Coordinator;
use crate::grpc::builder_service::BuilderService;
use crate::proto::builder_server::BuilderServer;

pub struct GrpcServer {
    coordinator: Arc<Coordinator>,
}

impl GrpcServer {
    pub fn new(coordinator: Arc<Coordinator>) -> Self {
        Self { coordinator }
    }

    fn service(&self) -> BuilderServer<BuilderService> {
        BuilderServer::new(BuilderService::new(self.coordinator.clone()))
    }

    /// Serve on `addr` until `shutdown` is cancelled.
    pub async fn run(
        self,
        addr: SocketAddr,
        shutdown: CancellationToken,
    ) -> Result<(), tonic::transport::Error> {
        tracing::info!(addr = %addr, "Starting gRPC server");

        Server::builder()
            .add_service(self.service())
            .serve_with_shutdown(addr, shutdown.cancelled_owned())
            .await
    }

    /// Serve on an already bound listener. Lets callers bind port 0.
    pub async fn run_on(
        self,
        listener: TcpListener,
        shutdown: CancellationToken,
    ) -> Result<(), tonic::transport::Error> {
        if let Ok(addr) = listener.local_addr() {
            tracing::info!(addr = %addr, "Starting gRPC server");
        }

        Server::builder()
            .add_service(self.service())
            .serve_with_incoming_shutdown(
                TcpListenerStream::new(listener),
                shutdown.cancelled_owned(),
            )
            .await
    }
}
