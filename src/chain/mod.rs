//! Chain module - RPC access and endpoint failover
//!
//! This module provides:
//! - The JSON-RPC surface the driver consumes, behind the `ChainRpc` trait
//! - An ethers-backed HTTP implementation with per-request timeouts
//! - An endpoint pool with chain id verification and health tracking

pub mod pool;
pub mod rpc;

pub use pool::{Connector, EndpointPool, FailureReason, Lease};
pub use rpc::{redact_url, ChainRpc, HttpRpc, NonceTag, Receipt, RpcFailure, RpcResult};

use std::sync::Arc;
use std::time::Duration;

/// Connector that opens an [`HttpRpc`] for each URL
pub fn http_connector(request_timeout: Duration) -> Connector {
    Arc::new(move |url: &str| {
        let client = HttpRpc::connect(url, request_timeout)?;
        Ok(Arc::new(client) as Arc<dyn ChainRpc>)
    })
}
