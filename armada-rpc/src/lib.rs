//! ARMADA RPC - Protocol Client
//!
//! Issues `{id, method, params}` calls to managed services and returns the
//! matching `result` or a typed error. Three transports are supported:
//!
//! - [`ChannelTransport`]: one persistent WebSocket per service, calls
//!   multiplexed by correlation id
//! - [`HttpTransport`]: one HTTP POST per call over a pooled client
//! - [`AdapterRegistry`]: services served inside the orchestrator
//!
//! No retries happen here. The health monitor and workflow scheduler own
//! their own retry and restart policy.

pub mod adapter;
pub mod channel;
pub mod client;
pub mod http;

pub use adapter::{AdapterRegistry, DefaultAdapter, ServiceAdapter};
pub use channel::ChannelTransport;
pub use client::ProtocolClient;
pub use http::HttpTransport;
