//! gRPC service implementations over a shared [`DecisionEngine`].

use std::sync::Arc;
use tonic::{Request, Response, Status};
use tracing::{debug, info, instrument, warn};

use super::proto::{
    self, admin_service_server::AdminService, health_service_server::HealthService,
    rate_limit_service_server::RateLimitService, CheckRequest, CheckResponse, GetUsageRequest,
    GetUsageResponse, IdentitySelector, ListPoliciesRequest, ListPoliciesResponse,
    PolicyMessage, PolicyUpdateResponse, ProbeRequest, ProbeResponse, RemovePolicyRequest,
    ResetCounterRequest, ResetCounterResponse, SetDefaultPolicyRequest, SetRoleMultiplierRequest,
    UpsertPolicyRequest,
};
use crate::error::GatekeeperError;
use crate::ratelimit::{
    Algorithm, CheckContext, Decision, DecisionEngine, FailureMode, Policy, ANONYMOUS_ROLE,
    DEFAULT_METHOD,
};

impl From<CheckRequest> for CheckContext {
    fn from(req: CheckRequest) -> Self {
        Self {
            client_ip: req.client_ip,
            user_id: req.user_id,
            user_role: req.user_role.unwrap_or_else(|| ANONYMOUS_ROLE.to_string()),
            endpoint: req.endpoint,
            method: req.method.unwrap_or_else(|| DEFAULT_METHOD.to_string()),
            api_key: req.api_key,
            custom_limit: req.custom_limit,
            custom_window: req.custom_window,
            hits: req.hits,
        }
    }
}

impl From<&CheckContext> for CheckRequest {
    fn from(ctx: &CheckContext) -> Self {
        Self {
            client_ip: ctx.client_ip.clone(),
            user_id: ctx.user_id.clone(),
            user_role: Some(ctx.user_role.clone()),
            endpoint: ctx.endpoint.clone(),
            method: Some(ctx.method.clone()),
            api_key: ctx.api_key.clone(),
            custom_limit: ctx.custom_limit,
            custom_window: ctx.custom_window,
            hits: ctx.hits,
        }
    }
}

impl From<Decision> for CheckResponse {
    fn from(decision: Decision) -> Self {
        Self {
            allowed: decision.allowed,
            limit: decision.limit,
            remaining: decision.remaining,
            reset: decision.reset_at,
            retry_after: decision.retry_after,
            unlimited: decision.unlimited,
            degraded: decision.degraded,
            policy_version: decision.policy_version,
            policy_scope: decision.policy_scope,
        }
    }
}

impl From<CheckResponse> for Decision {
    fn from(resp: CheckResponse) -> Self {
        Self {
            allowed: resp.allowed,
            limit: resp.limit,
            remaining: resp.remaining,
            reset_at: resp.reset,
            retry_after: resp.retry_after,
            unlimited: resp.unlimited,
            degraded: resp.degraded,
            policy_scope: resp.policy_scope,
            policy_version: resp.policy_version,
        }
    }
}

impl From<Algorithm> for proto::Algorithm {
    fn from(algorithm: Algorithm) -> Self {
        match algorithm {
            Algorithm::FixedWindow => proto::Algorithm::FixedWindow,
            Algorithm::SlidingWindow => proto::Algorithm::SlidingWindow,
            Algorithm::TokenBucket => proto::Algorithm::TokenBucket,
        }
    }
}

impl From<&Policy> for PolicyMessage {
    fn from(policy: &Policy) -> Self {
        let failure_mode = match policy.failure_mode {
            FailureMode::Open => proto::FailureMode::FailOpen,
            FailureMode::Closed => proto::FailureMode::FailClosed,
        };
        Self {
            scope: policy.scope.clone(),
            limit: policy.limit,
            window_secs: policy.window_secs,
            burst: policy.burst,
            algorithm: proto::Algorithm::from(policy.algorithm).into(),
            failure_mode: failure_mode.into(),
        }
    }
}

impl TryFrom<PolicyMessage> for Policy {
    type Error = GatekeeperError;

    fn try_from(msg: PolicyMessage) -> Result<Self, Self::Error> {
        let algorithm = match proto::Algorithm::try_from(msg.algorithm) {
            Ok(proto::Algorithm::Unspecified) | Ok(proto::Algorithm::FixedWindow) => {
                Algorithm::FixedWindow
            }
            Ok(proto::Algorithm::SlidingWindow) => Algorithm::SlidingWindow,
            Ok(proto::Algorithm::TokenBucket) => Algorithm::TokenBucket,
            Err(_) => {
                return Err(GatekeeperError::Config(format!(
                    "unknown algorithm {}",
                    msg.algorithm
                )))
            }
        };
        let failure_mode = match proto::FailureMode::try_from(msg.failure_mode) {
            Ok(proto::FailureMode::Unspecified) | Ok(proto::FailureMode::FailOpen) => {
                FailureMode::Open
            }
            Ok(proto::FailureMode::FailClosed) => FailureMode::Closed,
            Err(_) => {
                return Err(GatekeeperError::Config(format!(
                    "unknown failure mode {}",
                    msg.failure_mode
                )))
            }
        };

        Ok(Policy::new(msg.scope, msg.limit, msg.window_secs)
            .with_burst(msg.burst)
            .with_algorithm(algorithm)
            .with_failure_mode(failure_mode))
    }
}

/// Build the context an admin request addresses.
fn target_context(target: Option<IdentitySelector>, role: Option<String>) -> Result<CheckContext, Status> {
    let target = target.ok_or_else(|| Status::invalid_argument("target is required"))?;
    let mut ctx = CheckContext::new(target.client_ip, target.endpoint);
    ctx.user_id = target.user_id;
    ctx.api_key = target.api_key;
    if let Some(role) = role {
        ctx = ctx.with_role(role);
    }
    ctx.validate()?;
    Ok(ctx)
}

fn required_policy(policy: Option<PolicyMessage>) -> Result<Policy, Status> {
    let policy = policy.ok_or_else(|| Status::invalid_argument("policy is required"))?;
    Ok(Policy::try_from(policy)?)
}

fn update_response((version, changed): (u64, bool)) -> Response<PolicyUpdateResponse> {
    Response::new(PolicyUpdateResponse { version, changed })
}

/// The check RPC consumed by every integration layer.
#[derive(Debug, Clone)]
pub struct RateLimitServiceImpl {
    engine: Arc<DecisionEngine>,
}

impl RateLimitServiceImpl {
    pub fn new(engine: Arc<DecisionEngine>) -> Self {
        Self { engine }
    }
}

#[tonic::async_trait]
impl RateLimitService for RateLimitServiceImpl {
    /// Admit or deny one request.
    #[instrument(
        skip(self, request),
        fields(
            endpoint = %request.get_ref().endpoint,
            hits = request.get_ref().hits
        )
    )]
    async fn check(&self, request: Request<CheckRequest>) -> Result<Response<CheckResponse>, Status> {
        let ctx = CheckContext::from(request.into_inner());

        let decision = self.engine.check(&ctx).await.map_err(|e| {
            warn!(error = %e, "Rejected check request");
            Status::from(e)
        })?;

        debug!(
            allowed = decision.allowed,
            remaining = decision.remaining,
            degraded = decision.degraded,
            "Rate limit decision made"
        );

        Ok(Response::new(decision.into()))
    }
}

/// Operator RPCs: counter reset, usage, policy reads and updates.
#[derive(Debug, Clone)]
pub struct AdminServiceImpl {
    engine: Arc<DecisionEngine>,
}

impl AdminServiceImpl {
    pub fn new(engine: Arc<DecisionEngine>) -> Self {
        Self { engine }
    }
}

#[tonic::async_trait]
impl AdminService for AdminServiceImpl {
    #[instrument(skip(self, request))]
    async fn reset_counter(
        &self,
        request: Request<ResetCounterRequest>,
    ) -> Result<Response<ResetCounterResponse>, Status> {
        let ctx = target_context(request.into_inner().target, None)?;
        let key = ctx.identity_key();
        let keys_removed = self.engine.reset(&key).await?;

        info!(key = %key, keys_removed, "Counter reset by operator");
        Ok(Response::new(ResetCounterResponse { keys_removed }))
    }

    #[instrument(skip(self, request))]
    async fn get_usage(
        &self,
        request: Request<GetUsageRequest>,
    ) -> Result<Response<GetUsageResponse>, Status> {
        let req = request.into_inner();
        let ctx = target_context(req.target, req.user_role)?;
        let usage = self.engine.usage(&ctx).await?;

        Ok(Response::new(GetUsageResponse {
            used: usage.used,
            limit: usage.limit,
            remaining: usage.remaining,
            reset: usage.reset_at,
            unlimited: usage.unlimited,
            algorithm: proto::Algorithm::from(usage.algorithm).into(),
        }))
    }

    async fn list_policies(
        &self,
        _request: Request<ListPoliciesRequest>,
    ) -> Result<Response<ListPoliciesResponse>, Status> {
        let snapshot = self.engine.registry().snapshot();
        let table = &snapshot.table;

        Ok(Response::new(ListPoliciesResponse {
            version: snapshot.version,
            default_policy: Some(table.default_policy().into()),
            policies: table.policies().map(PolicyMessage::from).collect(),
            role_multipliers: table.role_multipliers().clone(),
        }))
    }

    #[instrument(skip(self, request))]
    async fn upsert_policy(
        &self,
        request: Request<UpsertPolicyRequest>,
    ) -> Result<Response<PolicyUpdateResponse>, Status> {
        let policy = required_policy(request.into_inner().policy)?;
        let scope = policy.scope.clone();
        let outcome = self.engine.registry().upsert(policy)?;

        info!(scope = %scope, version = outcome.0, changed = outcome.1, "Policy upserted");
        Ok(update_response(outcome))
    }

    #[instrument(skip(self, request))]
    async fn set_default_policy(
        &self,
        request: Request<SetDefaultPolicyRequest>,
    ) -> Result<Response<PolicyUpdateResponse>, Status> {
        let policy = required_policy(request.into_inner().policy)?;
        let outcome = self.engine.registry().set_default(policy)?;

        info!(version = outcome.0, changed = outcome.1, "Default policy replaced");
        Ok(update_response(outcome))
    }

    #[instrument(skip(self, request))]
    async fn remove_policy(
        &self,
        request: Request<RemovePolicyRequest>,
    ) -> Result<Response<PolicyUpdateResponse>, Status> {
        let scope = request.into_inner().scope;
        let outcome = self.engine.registry().remove(&scope)?;

        info!(scope = %scope, version = outcome.0, "Policy removed");
        Ok(update_response(outcome))
    }

    #[instrument(skip(self, request))]
    async fn set_role_multiplier(
        &self,
        request: Request<SetRoleMultiplierRequest>,
    ) -> Result<Response<PolicyUpdateResponse>, Status> {
        let req = request.into_inner();
        let outcome = self
            .engine
            .registry()
            .set_role_multiplier(&req.role, req.multiplier)?;

        info!(role = %req.role, multiplier = req.multiplier, version = outcome.0, "Role multiplier set");
        Ok(update_response(outcome))
    }
}

/// Liveness of the engine and reachability of its store.
#[derive(Debug, Clone)]
pub struct HealthServiceImpl {
    engine: Arc<DecisionEngine>,
}

impl HealthServiceImpl {
    pub fn new(engine: Arc<DecisionEngine>) -> Self {
        Self { engine }
    }
}

#[tonic::async_trait]
impl HealthService for HealthServiceImpl {
    async fn probe(&self, _request: Request<ProbeRequest>) -> Result<Response<ProbeResponse>, Status> {
        let (serving, message) = match self.engine.health().await {
            Ok(()) => (true, "ok".to_string()),
            Err(e) => {
                warn!(error = %e, "Health probe failed");
                (false, e.to_string())
            }
        };

        Ok(Response::new(ProbeResponse {
            serving,
            instance_id: self.engine.instance_id().to_string(),
            store_backend: self.engine.backend_name().to_string(),
            policy_version: self.engine.registry().version(),
            message,
        }))
    }
}
