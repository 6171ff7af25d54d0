//! Pluggable transports from the integration layer to the decision engine.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tonic::transport::{Channel, Endpoint};
use tracing::debug;

use crate::error::{GatekeeperError, Result};
use crate::grpc::{CheckRequest, RateLimitServiceClient};
use crate::ratelimit::{CheckContext, Decision, DecisionEngine};

/// One check call to the decision engine, however it is reached.
#[async_trait]
pub trait DecisionTransport: Send + Sync {
    fn name(&self) -> &'static str;

    /// Ask the engine for a verdict. `InvalidContext` means the caller is at
    /// fault; every other error means the engine could not be reached.
    async fn check(&self, ctx: &CheckContext) -> Result<Decision>;
}

/// Calls an engine living in the same process.
#[derive(Debug, Clone)]
pub struct InProcessTransport {
    engine: Arc<DecisionEngine>,
}

impl InProcessTransport {
    pub fn new(engine: Arc<DecisionEngine>) -> Self {
        Self { engine }
    }
}

#[async_trait]
impl DecisionTransport for InProcessTransport {
    fn name(&self) -> &'static str {
        "in_process"
    }

    async fn check(&self, ctx: &CheckContext) -> Result<Decision> {
        self.engine.check(ctx).await
    }
}

/// Calls a remote engine over `gatekeeper.v1.RateLimitService`.
#[derive(Debug, Clone)]
pub struct GrpcTransport {
    client: RateLimitServiceClient<Channel>,
}

impl GrpcTransport {
    /// Connect eagerly, failing if the engine is unreachable.
    pub async fn connect(url: impl Into<String>, connect_timeout: Duration) -> Result<Self> {
        let channel = endpoint(url, connect_timeout)?.connect().await?;
        Ok(Self::from_channel(channel))
    }

    /// Create a transport that connects on first use, so a calling service
    /// can start while the engine is down.
    pub fn lazy(url: impl Into<String>, connect_timeout: Duration) -> Result<Self> {
        let channel = endpoint(url, connect_timeout)?.connect_lazy();
        Ok(Self::from_channel(channel))
    }

    pub fn from_channel(channel: Channel) -> Self {
        Self {
            client: RateLimitServiceClient::new(channel),
        }
    }
}

fn endpoint(url: impl Into<String>, connect_timeout: Duration) -> Result<Endpoint> {
    let url = url.into();
    let endpoint = Endpoint::from_shared(url.clone())
        .map_err(|e| GatekeeperError::Config(format!("invalid engine url {url}: {e}")))?;
    Ok(endpoint.connect_timeout(connect_timeout).tcp_nodelay(true))
}

#[async_trait]
impl DecisionTransport for GrpcTransport {
    fn name(&self) -> &'static str {
        "grpc"
    }

    async fn check(&self, ctx: &CheckContext) -> Result<Decision> {
        let mut client = self.client.clone();
        match client.check(CheckRequest::from(ctx)).await {
            Ok(response) => Ok(response.into_inner().into()),
            Err(status) if status.code() == tonic::Code::InvalidArgument => {
                Err(GatekeeperError::InvalidContext(status.message().to_string()))
            }
            Err(status) => {
                debug!(code = ?status.code(), message = %status.message(), "Engine call failed");
                Err(GatekeeperError::StoreUnavailable(format!(
                    "decision engine: {}",
                    status.message()
                )))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grpc::GrpcServer;
    use crate::ratelimit::store::MemoryStore;
    use crate::ratelimit::PolicyRegistry;
    use tokio::net::TcpListener;
    use tokio::sync::oneshot;

    fn engine() -> Arc<DecisionEngine> {
        Arc::new(DecisionEngine::new(
            Arc::new(MemoryStore::new()),
            Arc::new(PolicyRegistry::default()),
        ))
    }

    #[tokio::test]
    async fn test_in_process_transport() {
        let transport = InProcessTransport::new(engine());
        let decision = transport
            .check(&CheckContext::new("10.0.0.1", "/api/orders"))
            .await
            .unwrap();
        assert!(decision.allowed);
        assert_eq!(decision.limit, 50);
    }

    #[tokio::test]
    async fn test_grpc_transport_round_trip() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (tx, rx) = oneshot::channel::<()>();
        let handle = tokio::spawn(GrpcServer::new(addr, engine()).serve_with_listener(
            listener,
            async {
                let _ = rx.await;
            },
        ));

        let transport = GrpcTransport::connect(format!("http://{addr}"), Duration::from_secs(1))
            .await
            .unwrap();
        let decision = transport
            .check(&CheckContext::new("10.0.0.1", "/api/orders").with_role("admin"))
            .await
            .unwrap();
        assert!(decision.allowed);
        assert_eq!(decision.limit, 1_000);
        assert_eq!(decision.remaining, 999);

        let err = transport
            .check(&CheckContext::new("10.0.0.1", "no-slash"))
            .await
            .unwrap_err();
        assert!(matches!(err, GatekeeperError::InvalidContext(_)));

        drop(transport);
        tx.send(()).unwrap();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_unreachable_engine_is_unavailable() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let transport = GrpcTransport::lazy(format!("http://{addr}"), Duration::from_millis(200)).unwrap();
        let err = transport
            .check(&CheckContext::new("10.0.0.1", "/api/orders"))
            .await
            .unwrap_err();
        assert!(err.is_unavailable());
    }

    #[tokio::test]
    async fn test_invalid_url_rejected() {
        assert!(GrpcTransport::lazy("not a url", Duration::from_secs(1)).is_err());
    }
}
