//! gRPC surface of the decision engine: check, administration and health.

mod server;
mod service;

pub use server::GrpcServer;
pub use service::{AdminServiceImpl, HealthServiceImpl, RateLimitServiceImpl};

// Include the generated protobuf code
pub mod proto {
    tonic::include_proto!("gatekeeper.v1");
}

// Re-export commonly used types
pub use proto::{
    admin_service_client::AdminServiceClient, admin_service_server::AdminServiceServer,
    health_service_client::HealthServiceClient, health_service_server::HealthServiceServer,
    rate_limit_service_client::RateLimitServiceClient,
    rate_limit_service_server::RateLimitServiceServer, CheckRequest, CheckResponse,
};
