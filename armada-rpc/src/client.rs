//! Transport-dispatching protocol client.

use crate::adapter::AdapterRegistry;
use crate::channel::ChannelTransport;
use crate::http::HttpTransport;
use armada_core::{RpcResult, ServiceCaller, ServiceDescriptor, Transport};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::trace;

/// Protocol client routing each call by the descriptor's transport.
#[derive(Debug)]
pub struct ProtocolClient {
    channel: ChannelTransport,
    http: HttpTransport,
    adapters: Arc<AdapterRegistry>,
}

impl ProtocolClient {
    pub fn new() -> Self {
        Self::with_adapters(Arc::new(AdapterRegistry::new()))
    }

    pub fn with_adapters(adapters: Arc<AdapterRegistry>) -> Self {
        Self {
            channel: ChannelTransport::new(),
            http: HttpTransport::new(),
            adapters,
        }
    }

    pub fn adapters(&self) -> &Arc<AdapterRegistry> {
        &self.adapters
    }

    pub fn channel(&self) -> &ChannelTransport {
        &self.channel
    }

    /// Close every persistent channel.
    pub fn close(&self) {
        self.channel.close_all();
    }
}

impl Default for ProtocolClient {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ServiceCaller for ProtocolClient {
    async fn call(
        &self,
        descriptor: &ServiceDescriptor,
        method: &str,
        params: serde_json::Value,
        timeout: Duration,
    ) -> RpcResult<serde_json::Value> {
        trace!(service = %descriptor.name, method = %method, "Issuing call");
        match descriptor.transport {
            Transport::PersistentChannel => {
                self.channel.call(descriptor, method, params, timeout).await
            }
            Transport::RequestResponse => self.http.call(descriptor, method, params, timeout).await,
            Transport::InProcess => {
                let adapter = self.adapters.get(&descriptor.name);
                match tokio::time::timeout(timeout, adapter.dispatch(method, params)).await {
                    Ok(result) => result,
                    Err(_) => Err(armada_core::TransportError::Timeout {
                        service: descriptor.name.clone(),
                        method: method.to_string(),
                        timeout,
                    }
                    .into()),
                }
            }
        }
    }
}
