//! Network Module
//!
//! Handles TCP communication between nodes: one framed request, one
//! framed reply.

mod server;
mod client;
#[cfg(test)]
pub(crate) mod loopback;

pub use server::NetworkServer;
pub use client::NetworkClient;

use async_trait::async_trait;

use crate::protocol::{ErrorCode, FrameHeader, Message};
use crate::error::{Error, Result};

/// Serves inbound cluster requests
#[async_trait]
pub trait RequestHandler: Send + Sync {
    /// Produce the reply for one request from `peer`
    async fn handle(&self, peer: &str, message: Message) -> Message;
}

/// Outbound calls to other nodes. Every call is timeout-bounded by the
/// implementation.
#[async_trait]
pub trait PeerTransport: Send + Sync {
    /// Send a request and wait for the reply
    async fn request(&self, address: &str, message: Message) -> Result<Message>;

    /// Ask a participant for its synchronized time
    async fn time_request(&self, address: &str) -> Result<f64> {
        match self.request(address, Message::TimeRequest).await? {
            Message::TimeResponse { local_time, .. } => Ok(local_time),
            other => Err(unexpected_reply(address, &other)),
        }
    }

    /// Send a message that is answered with a plain `Ack`
    async fn notify(&self, address: &str, message: Message) -> Result<()> {
        match self.request(address, message).await? {
            Message::Ack => Ok(()),
            other => Err(unexpected_reply(address, &other)),
        }
    }
}

fn unexpected_reply(address: &str, reply: &Message) -> Error {
    match reply {
        Message::Error { code: ErrorCode::ShuttingDown, .. } => Error::ShuttingDown,
        Message::Error { code, message } => {
            Error::Protocol(format!("{} answered {:?}: {}", address, code, message))
        }
        other => Error::Protocol(format!(
            "unexpected {} from {}",
            other.type_name(),
            address
        )),
    }
}

/// Read a framed message from a reader
pub async fn read_message<R: tokio::io::AsyncRead + Unpin>(reader: &mut R) -> Result<Message> {
    use tokio::io::AsyncReadExt;

    // Read header
    let mut header_bytes = [0u8; FrameHeader::SIZE];
    reader.read_exact(&mut header_bytes).await?;
    let header = FrameHeader::from_bytes(&header_bytes);

    if header.length > FrameHeader::MAX_BODY {
        return Err(Error::Protocol(format!("frame of {} bytes is too large", header.length)));
    }

    // Read body
    let mut body = vec![0u8; header.length as usize];
    reader.read_exact(&mut body).await?;

    // Verify checksum
    if crc32fast::hash(&body) != header.checksum {
        return Err(Error::Protocol("Message checksum mismatch".into()));
    }

    Ok(Message::deserialize(&body)?)
}

/// Write a framed message to a writer
pub async fn write_message<W: tokio::io::AsyncWrite + Unpin>(
    writer: &mut W,
    message: &Message,
) -> Result<()> {
    use tokio::io::AsyncWriteExt;

    let body = message.serialize()?;
    let header = FrameHeader::new(&body);

    writer.write_all(&header.to_bytes()).await?;
    writer.write_all(&body).await?;
    writer.flush().await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_frame_roundtrip_over_duplex() {
        let (mut a, mut b) = tokio::io::duplex(1024);
        let msg = Message::TimeAdjust { amount: -1.25 };

        write_message(&mut a, &msg).await.unwrap();
        assert_eq!(read_message(&mut b).await.unwrap(), msg);
    }

    #[tokio::test]
    async fn test_corrupted_frame_rejected() {
        use tokio::io::AsyncWriteExt;

        let (mut a, mut b) = tokio::io::duplex(1024);
        let body = Message::Ack.serialize().unwrap();
        let mut header = FrameHeader::new(&body);
        header.checksum ^= 0xFFFF;

        a.write_all(&header.to_bytes()).await.unwrap();
        a.write_all(&body).await.unwrap();

        assert!(matches!(read_message(&mut b).await, Err(Error::Protocol(_))));
    }

    struct Stopping;

    #[async_trait]
    impl RequestHandler for Stopping {
        async fn handle(&self, _peer: &str, _message: Message) -> Message {
            Message::Error {
                code: ErrorCode::ShuttingDown,
                message: "node is shutting down".into(),
            }
        }
    }

    #[tokio::test]
    async fn test_shutting_down_reply_is_typed() {
        let transport = loopback::LoopbackTransport::new();
        transport.attach("s1:1", std::sync::Arc::new(Stopping)).await;

        let err = transport
            .notify("s1:1", Message::Heartbeat { from_id: "S2".into(), active_load: 0 })
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ShuttingDown));
        assert!(err.is_unreachable());
        assert!(matches!(
            transport.time_request("s1:1").await,
            Err(Error::ShuttingDown)
        ));
    }
}
