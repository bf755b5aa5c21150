//! RPC Client
//!
//! One-shot request/response calls to peer nodes. Every call is bounded by
//! the configured request timeout; a timeout means the peer is unreachable
//! for the current round and the caller moves on. Vote and heartbeat calls
//! are never retried within a round, so each logical attempt per term is
//! sent at most once.

use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::timeout;

use super::{read_message, write_message};
use crate::network::Message;
use crate::error::{Error, Result};

/// Client for outbound peer calls
#[derive(Debug, Clone)]
pub struct RpcClient {
    request_timeout: Duration,
}

impl RpcClient {
    /// Create a new client with a per-call deadline
    pub fn new(request_timeout: Duration) -> Self {
        Self { request_timeout }
    }

    /// Send a message to a peer and wait for its response.
    ///
    /// Connect, write, and read all share the single request deadline.
    pub async fn send(&self, address: &str, message: Message) -> Result<Message> {
        let result = timeout(self.request_timeout, Self::exchange(address, message)).await;

        match result {
            Ok(inner) => inner,
            Err(_) => Err(Error::ConnectionTimeout(address.to_string())),
        }
    }

    async fn exchange(address: &str, message: Message) -> Result<Message> {
        let stream = TcpStream::connect(address)
            .await
            .map_err(|e| Error::ConnectionFailed {
                address: address.to_string(),
                reason: e.to_string(),
            })?;
        stream.set_nodelay(true)?;

        let (mut reader, mut writer) = stream.into_split();
        write_message(&mut writer, &message).await?;
        read_message(&mut reader).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::LivenessCode;

    #[tokio::test]
    async fn test_connection_failure_is_unreachable() {
        let client = RpcClient::new(Duration::from_millis(200));

        let result = client.send("127.0.0.1:1", Message::Ping).await;
        let err = result.unwrap_err();
        assert!(err.is_unreachable());
    }

    #[tokio::test]
    async fn test_round_trip_against_listener() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();

        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let (mut reader, mut writer) = stream.into_split();
            let msg = read_message(&mut reader).await.unwrap();
            assert!(matches!(msg, Message::Ping));
            write_message(&mut writer, &Message::Pong { code: LivenessCode::Ok })
                .await
                .unwrap();
        });

        let client = RpcClient::new(Duration::from_secs(1));
        let response = client.send(&address, Message::Ping).await.unwrap();
        assert!(matches!(response, Message::Pong { code: LivenessCode::Ok }));
    }
}
