//! Gatekeeper - Centralized Rate Limiting Service
//!
//! This crate implements a shared decision engine that admits or rejects
//! requests by quotas keyed on caller identity and endpoint, backed by an
//! atomic quota store (Redis in production). Calling services embed the
//! [`client`] layer, which reaches the engine over gRPC and degrades to a
//! local limiter when it is unavailable.

pub mod client;
pub mod config;
pub mod error;
pub mod grpc;
pub mod ratelimit;
