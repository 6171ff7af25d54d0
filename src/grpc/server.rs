//! gRPC server implementation.

use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_stream::wrappers::TcpListenerStream;
use tonic::transport::server::Router;
use tonic::transport::Server;
use tracing::{error, info};

use super::service::{AdminServiceImpl, HealthServiceImpl, RateLimitServiceImpl};
use super::{AdminServiceServer, HealthServiceServer, RateLimitServiceServer};
use crate::error::{GatekeeperError, Result};
use crate::ratelimit::DecisionEngine;

/// gRPC server exposing the check, admin and health services.
pub struct GrpcServer {
    /// Address to bind to
    addr: SocketAddr,
    /// The shared decision engine
    engine: Arc<DecisionEngine>,
}

impl GrpcServer {
    pub fn new(addr: SocketAddr, engine: Arc<DecisionEngine>) -> Self {
        Self { addr, engine }
    }

    fn router(&self) -> Router {
        Server::builder()
            .add_service(RateLimitServiceServer::new(RateLimitServiceImpl::new(
                self.engine.clone(),
            )))
            .add_service(AdminServiceServer::new(AdminServiceImpl::new(
                self.engine.clone(),
            )))
            .add_service(HealthServiceServer::new(HealthServiceImpl::new(
                self.engine.clone(),
            )))
    }

    /// Start the gRPC server.
    ///
    /// This method will block until the server is shut down.
    pub async fn serve(self) -> Result<()> {
        self.serve_with_shutdown(std::future::pending()).await
    }

    /// Start the gRPC server with graceful shutdown.
    ///
    /// The server will shut down when the provided signal resolves.
    pub async fn serve_with_shutdown<F>(self, signal: F) -> Result<()>
    where
        F: std::future::Future<Output = ()> + Send,
    {
        info!(
            addr = %self.addr,
            backend = self.engine.backend_name(),
            instance_id = %self.engine.instance_id(),
            "Starting gRPC server"
        );

        self.router()
            .serve_with_shutdown(self.addr, signal)
            .await
            .map_err(|e| {
                error!(error = %e, "gRPC server failed");
                GatekeeperError::Grpc(e)
            })
    }

    /// Serve on an already bound listener, ignoring the configured address.
    pub async fn serve_with_listener<F>(self, listener: TcpListener, signal: F) -> Result<()>
    where
        F: std::future::Future<Output = ()> + Send,
    {
        let local_addr = listener.local_addr()?;
        info!(addr = %local_addr, "Starting gRPC server on bound listener");

        self.router()
            .serve_with_incoming_shutdown(TcpListenerStream::new(listener), signal)
            .await
            .map_err(|e| {
                error!(error = %e, "gRPC server failed");
                GatekeeperError::Grpc(e)
            })
    }
}
