//! Request/response transport: one HTTP POST per call.

use armada_core::{
    ProtocolError, RpcId, RpcRequest, RpcResponse, RpcResult, ServiceDescriptor, TransportError,
};
use reqwest::Client;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// HTTP transport over a pooled `reqwest` client.
///
/// The envelope is POSTed to the descriptor's endpoint and the body of the
/// reply is parsed as a response envelope whose id must match the request.
pub struct HttpTransport {
    client: Client,
    next_id: AtomicU64,
}

impl HttpTransport {
    pub fn new() -> Self {
        Self::with_client(Client::new())
    }

    pub fn with_client(client: Client) -> Self {
        Self {
            client,
            next_id: AtomicU64::new(1),
        }
    }

    pub async fn call(
        &self,
        descriptor: &ServiceDescriptor,
        method: &str,
        params: serde_json::Value,
        timeout: Duration,
    ) -> RpcResult<serde_json::Value> {
        let service = descriptor.name.as_str();
        let id = RpcId::Number(self.next_id.fetch_add(1, Ordering::Relaxed));
        let request = RpcRequest::new(id.clone(), method, params);

        let response = self
            .client
            .post(&descriptor.endpoint)
            .timeout(timeout)
            .json(&request)
            .send()
            .await
            .map_err(|e| map_reqwest_error(service, method, timeout, e))?;

        let status = response.status();
        if !status.is_success() {
            return Err(TransportError::HttpStatus {
                service: service.to_string(),
                status: status.as_u16(),
            }
            .into());
        }

        let body = response
            .text()
            .await
            .map_err(|e| map_reqwest_error(service, method, timeout, e))?;

        let envelope = RpcResponse::parse(service, &body)?;
        if envelope.id != id {
            return Err(ProtocolError::UnmatchedId {
                service: service.to_string(),
                id: envelope.id.to_string(),
            }
            .into());
        }

        envelope.into_result(service, method)
    }
}

impl Default for HttpTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for HttpTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpTransport")
            .field("next_id", &self.next_id.load(Ordering::Relaxed))
            .finish()
    }
}

fn map_reqwest_error(
    service: &str,
    method: &str,
    timeout: Duration,
    err: reqwest::Error,
) -> TransportError {
    if err.is_timeout() {
        TransportError::Timeout {
            service: service.to_string(),
            method: method.to_string(),
            timeout,
        }
    } else if err.is_connect() {
        TransportError::ConnectFailed {
            service: service.to_string(),
            reason: err.to_string(),
        }
    } else {
        TransportError::SendFailed {
            service: service.to_string(),
            reason: err.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use armada_core::{RpcError, Transport};

    #[tokio::test]
    async fn test_connection_refused_is_transport_error() {
        // Bind then drop to get a port nobody listens on.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let descriptor = ServiceDescriptor::new(
            "http-svc",
            format!("http://{}/rpc", addr),
            Transport::RequestResponse,
        );
        let transport = HttpTransport::new();
        let err = transport
            .call(&descriptor, "health", serde_json::json!({}), Duration::from_secs(2))
            .await
            .unwrap_err();

        assert!(err.is_transport(), "unexpected error: {:?}", err);
        assert!(matches!(err, RpcError::Transport(_)));
    }
}
