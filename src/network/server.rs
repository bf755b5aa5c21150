//! RPC Server
//!
//! TCP server accepting connections from peers and the administrative layer.
//! Each connection is a sequence of framed request/response exchanges.
//! Shutdown closes the listener to new connections, then drains in-flight
//! requests within a bounded window.

use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinSet;

use super::{read_message, write_message};
use crate::network::Message;
use crate::error::{Error, Result};

/// Drain window for in-flight connections during shutdown
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Inbound message dispatch.
///
/// Read-only calls (Ping, GetStatus, GetNodes) must be idempotent; Vote is
/// the only state-mutating peer RPC and its single-grant invariant is
/// enforced by the election machine behind this trait.
#[async_trait::async_trait]
pub trait RpcHandler: Send + Sync {
    async fn handle(&self, peer: &str, message: Message) -> Message;
}

/// RPC server for cluster communication
pub struct RpcServer {
    bind_address: String,
    handler: Arc<dyn RpcHandler>,
    shutdown: tokio::sync::watch::Sender<bool>,
}

impl RpcServer {
    /// Create a new server
    pub fn new(bind_address: String, handler: Arc<dyn RpcHandler>) -> Self {
        let (shutdown_tx, _) = tokio::sync::watch::channel(false);

        Self {
            bind_address,
            handler,
            shutdown: shutdown_tx,
        }
    }

    /// Run the accept loop until shutdown
    pub async fn start(&self) -> Result<()> {
        let listener = TcpListener::bind(&self.bind_address).await?;
        tracing::info!("RPC server listening on {}", self.bind_address);

        let mut shutdown_rx = self.shutdown.subscribe();
        let mut connections = JoinSet::new();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((socket, addr)) => {
                            let peer_addr = addr.to_string();
                            let handler = Arc::clone(&self.handler);
                            let mut conn_shutdown = self.shutdown.subscribe();

                            connections.spawn(async move {
                                tokio::select! {
                                    result = handle_connection(socket, peer_addr.clone(), handler) => {
                                        if let Err(e) = result {
                                            tracing::warn!("Connection error from {}: {}", peer_addr, e);
                                        }
                                    }
                                    _ = conn_shutdown.changed() => {}
                                }
                            });
                        }
                        Err(e) => {
                            tracing::error!("Accept error: {}", e);
                        }
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        break;
                    }
                }
            }
        }

        // Listener is closed to new connections; drain what is in flight.
        drop(listener);
        let drained = tokio::time::timeout(DRAIN_TIMEOUT, async {
            while connections.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            tracing::warn!("Shutdown drain window elapsed with connections still open");
            connections.abort_all();
        }

        tracing::info!("RPC server stopped");
        Ok(())
    }

    /// Signal the server to stop
    pub fn stop(&self) {
        let _ = self.shutdown.send(true);
    }
}

/// Handle a single connection
async fn handle_connection(
    socket: TcpStream,
    peer_addr: String,
    handler: Arc<dyn RpcHandler>,
) -> Result<()> {
    let (mut reader, mut writer) = socket.into_split();

    loop {
        match read_message(&mut reader).await {
            Ok(message) => {
                tracing::trace!("Received {} from {}", message.type_name(), peer_addr);
                let response = handler.handle(&peer_addr, message).await;
                write_message(&mut writer, &response).await?;
            }
            Err(Error::Io(ref e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                // Connection closed
                break;
            }
            Err(e) => {
                tracing::warn!("Error reading message: {}", e);
                break;
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::{LivenessCode, RpcClient};

    struct EchoHandler;

    #[async_trait::async_trait]
    impl RpcHandler for EchoHandler {
        async fn handle(&self, _peer: &str, message: Message) -> Message {
            match message {
                Message::Ping => Message::Pong {
                    code: LivenessCode::Ok,
                },
                other => other,
            }
        }
    }

    #[tokio::test]
    async fn test_request_response_and_shutdown() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let address = listener.local_addr().unwrap().to_string();
        drop(listener);

        let server = Arc::new(RpcServer::new(address.clone(), Arc::new(EchoHandler)));
        let server_task = {
            let server = Arc::clone(&server);
            tokio::spawn(async move { server.start().await })
        };

        // Give the listener a moment to bind
        tokio::time::sleep(Duration::from_millis(100)).await;

        let client = RpcClient::new(Duration::from_secs(1));
        let response = client.send(&address, Message::Ping).await.unwrap();
        assert!(matches!(response, Message::Pong { .. }));

        server.stop();
        let result = tokio::time::timeout(Duration::from_secs(2), server_task)
            .await
            .expect("server did not stop")
            .unwrap();
        assert!(result.is_ok());
    }
}
