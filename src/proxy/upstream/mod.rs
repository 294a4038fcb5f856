// Upstream client and connection tracking

pub mod client;
pub mod pool;

pub use client::{UpstreamClient, UpstreamResponse};
pub use pool::{ConnectionPool, PoolConfig, PoolStats};
