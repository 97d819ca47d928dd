//! Persistent-channel transport against a local WebSocket server.

use armada_core::{
    ProtocolError, RpcError, RpcRequest, RpcResponse, ServiceDescriptor, Transport, TransportError,
};
use armada_rpc::ChannelTransport;
use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_tungstenite::tungstenite::Message;

#[derive(Clone, Copy)]
enum Behavior {
    /// Answer every request with its own params.
    Echo,
    /// Buffer two requests, send a stray response, then answer in reverse.
    Reversed,
    /// Close the socket as soon as a request arrives.
    HangUp,
    /// Read requests and never answer.
    Silent,
    /// Answer everything with method-not-found.
    Unknown,
}

fn parse_request(message: Message) -> Option<RpcRequest> {
    match message {
        Message::Text(text) => serde_json::from_str(&text).ok(),
        _ => None,
    }
}

fn text(response: &RpcResponse) -> Message {
    Message::Text(response.to_value().to_string())
}

/// Spawn a server and return its URL plus a count of accepted connections.
async fn spawn_server(behavior: Behavior) -> (String, Arc<AtomicUsize>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let accepted = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&accepted);

    tokio::spawn(async move {
        while let Ok((tcp, _)) = listener.accept().await {
            counter.fetch_add(1, Ordering::SeqCst);
            tokio::spawn(async move {
                let Ok(mut socket) = tokio_tungstenite::accept_async(tcp).await else {
                    return;
                };
                match behavior {
                    Behavior::Echo => {
                        while let Some(Ok(message)) = socket.next().await {
                            if let Some(request) = parse_request(message) {
                                let response = RpcResponse::success(request.id, request.params);
                                let _ = socket.send(text(&response)).await;
                            }
                        }
                    }
                    Behavior::Reversed => {
                        let mut buffered = Vec::new();
                        while let Some(Ok(message)) = socket.next().await {
                            if let Some(request) = parse_request(message) {
                                buffered.push(request);
                            }
                            if buffered.len() == 2 {
                                let stray = RpcResponse::success(9_999u64, json!("stray"));
                                let _ = socket.send(text(&stray)).await;
                                for request in buffered.drain(..).rev() {
                                    let response =
                                        RpcResponse::success(request.id, request.params);
                                    let _ = socket.send(text(&response)).await;
                                }
                            }
                        }
                    }
                    Behavior::HangUp => {
                        let _ = socket.next().await;
                        let _ = socket.close(None).await;
                    }
                    Behavior::Silent => while let Some(Ok(_)) = socket.next().await {},
                    Behavior::Unknown => {
                        while let Some(Ok(message)) = socket.next().await {
                            if let Some(request) = parse_request(message) {
                                let response =
                                    RpcResponse::method_not_found(request.id, &request.method);
                                let _ = socket.send(text(&response)).await;
                            }
                        }
                    }
                }
            });
        }
    });

    (format!("ws://{}", addr), accepted)
}

fn descriptor(endpoint: &str) -> ServiceDescriptor {
    ServiceDescriptor::new("ws-svc", endpoint, Transport::PersistentChannel)
}

#[tokio::test]
async fn test_calls_share_one_connection() {
    let (url, accepted) = spawn_server(Behavior::Echo).await;
    let transport = ChannelTransport::new();
    let svc = descriptor(&url);

    for n in 0..3 {
        let result = transport
            .call(&svc, "echo", json!({ "n": n }), Duration::from_secs(2))
            .await
            .unwrap();
        assert_eq!(result, json!({ "n": n }));
    }

    assert_eq!(accepted.load(Ordering::SeqCst), 1);
    assert!(transport.is_connected("ws-svc"));
    assert_eq!(transport.pending_calls("ws-svc"), 0);
}

#[tokio::test]
async fn test_out_of_order_responses_reach_their_callers() {
    let (url, _) = spawn_server(Behavior::Reversed).await;
    let transport = ChannelTransport::new();
    let svc = descriptor(&url);

    // The second call waits on the connect lock and reuses the first socket.
    let first = transport.call(&svc, "a", json!({ "which": "first" }), Duration::from_secs(2));
    let second = transport.call(&svc, "b", json!({ "which": "second" }), Duration::from_secs(2));
    let (first, second) = tokio::join!(first, second);

    assert_eq!(first.unwrap(), json!({ "which": "first" }));
    assert_eq!(second.unwrap(), json!({ "which": "second" }));
    assert_eq!(transport.pending_calls("ws-svc"), 0);
}

#[tokio::test]
async fn test_disconnect_fails_pending_call_and_next_call_reconnects() {
    let (url, accepted) = spawn_server(Behavior::HangUp).await;
    let transport = ChannelTransport::new();
    let svc = descriptor(&url);

    let err = transport
        .call(&svc, "work", json!({}), Duration::from_secs(2))
        .await
        .unwrap_err();
    assert_eq!(
        err,
        RpcError::Transport(TransportError::Disconnected {
            service: "ws-svc".to_string()
        })
    );

    let _ = transport
        .call(&svc, "work", json!({}), Duration::from_secs(2))
        .await;
    assert_eq!(accepted.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_silent_peer_times_out_and_clears_pending() {
    let (url, _) = spawn_server(Behavior::Silent).await;
    let transport = ChannelTransport::new();
    let svc = descriptor(&url);

    let err = transport
        .call(&svc, "slow", json!({}), Duration::from_millis(150))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        RpcError::Transport(TransportError::Timeout { ref method, .. }) if method == "slow"
    ));
    assert_eq!(transport.pending_calls("ws-svc"), 0);
}

#[tokio::test]
async fn test_dropped_call_removes_pending_entry() {
    let (url, _) = spawn_server(Behavior::Silent).await;
    let transport = ChannelTransport::new();
    let svc = descriptor(&url);

    let call = transport.call(&svc, "slow", json!({}), Duration::from_secs(30));
    let outcome = tokio::time::timeout(Duration::from_millis(200), call).await;
    assert!(outcome.is_err());
    assert_eq!(transport.pending_calls("ws-svc"), 0);
}

#[tokio::test]
async fn test_method_not_found_maps_to_not_implemented() {
    let (url, _) = spawn_server(Behavior::Unknown).await;
    let transport = ChannelTransport::new();
    let svc = descriptor(&url);

    let err = transport
        .call(&svc, "optimize", json!({}), Duration::from_secs(2))
        .await
        .unwrap_err();
    assert_eq!(
        err,
        RpcError::Protocol(ProtocolError::NotImplemented {
            service: "ws-svc".to_string(),
            method: "optimize".to_string(),
        })
    );
}

#[tokio::test]
async fn test_unreachable_endpoint_is_connect_failure() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let transport = ChannelTransport::new();
    let err = transport
        .call(
            &descriptor(&format!("ws://{}", addr)),
            "health",
            json!({}),
            Duration::from_secs(2),
        )
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        RpcError::Transport(TransportError::ConnectFailed { .. })
    ));
}

#[tokio::test]
async fn test_stalled_handshake_does_not_block_other_services() {
    // Accepts TCP but never completes the WebSocket upgrade.
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let stalled_url = format!("ws://{}", listener.local_addr().unwrap());
    tokio::spawn(async move {
        let mut held = Vec::new();
        while let Ok((tcp, _)) = listener.accept().await {
            held.push(tcp);
        }
    });
    let (healthy_url, _) = spawn_server(Behavior::Echo).await;

    let transport = Arc::new(ChannelTransport::new());
    let stalled = ServiceDescriptor::new("stalled", stalled_url, Transport::PersistentChannel);
    let healthy = ServiceDescriptor::new("ok", healthy_url, Transport::PersistentChannel);

    let hanging = {
        let transport = Arc::clone(&transport);
        tokio::spawn(async move {
            transport
                .call(&stalled, "health", json!({}), Duration::from_secs(3))
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(100)).await;

    let started = std::time::Instant::now();
    let result = transport
        .call(&healthy, "health", json!({"ok": true}), Duration::from_secs(1))
        .await;

    assert_eq!(result.unwrap(), json!({"ok": true}));
    assert!(started.elapsed() < Duration::from_millis(900));

    let stalled_result = hanging.await.unwrap();
    assert!(matches!(
        stalled_result,
        Err(RpcError::Transport(TransportError::Timeout { .. }))
    ));
}
