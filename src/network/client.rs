//! Network Client
//!
//! TCP client for calling other nodes. Each request opens its own
//! connection so a wedged peer can never stall calls to another.

use std::time::Duration;
use async_trait::async_trait;
use tokio::net::TcpStream;
use tokio::time::timeout;

use super::{read_message, write_message, PeerTransport};
use crate::protocol::Message;
use crate::error::{Error, Result};

/// Network client for connecting to peer nodes
#[derive(Debug, Clone)]
pub struct NetworkClient {
    /// Connection timeout
    connect_timeout: Duration,
    /// Total request timeout (connect + write + read)
    request_timeout: Duration,
}

impl NetworkClient {
    /// Create a new network client
    pub fn new(connect_timeout: Duration, request_timeout: Duration) -> Self {
        Self {
            connect_timeout,
            request_timeout,
        }
    }

    /// Send a message to a peer and wait for response
    pub async fn send(&self, address: &str, message: Message) -> Result<Message> {
        match timeout(self.request_timeout, self.send_inner(address, message)).await {
            Ok(inner_result) => inner_result,
            Err(_) => Err(Error::Timeout(address.to_string())),
        }
    }

    /// Send without timeout wrapper
    async fn send_inner(&self, address: &str, message: Message) -> Result<Message> {
        let mut stream = self.connect(address).await?;
        let (mut reader, mut writer) = stream.split();

        write_message(&mut writer, &message)
            .await
            .map_err(|e| Error::unreachable(address, e))?;

        match read_message(&mut reader).await {
            Ok(reply) => Ok(reply),
            Err(Error::Io(e)) => Err(Error::unreachable(address, e)),
            Err(e) => Err(e),
        }
    }

    /// Connect to an address
    async fn connect(&self, address: &str) -> Result<TcpStream> {
        match timeout(self.connect_timeout, TcpStream::connect(address)).await {
            Ok(Ok(stream)) => {
                stream.set_nodelay(true)?;
                Ok(stream)
            }
            Ok(Err(e)) => Err(Error::unreachable(address, e)),
            Err(_) => Err(Error::Timeout(address.to_string())),
        }
    }
}

#[async_trait]
impl PeerTransport for NetworkClient {
    async fn request(&self, address: &str, message: Message) -> Result<Message> {
        tracing::trace!("Sending {} to {}", message.type_name(), address);
        self.send(address, message).await
    }
}
