//! Network Module
//!
//! Request/response messaging between members. The coordination core only
//! talks to peers through [`Transport`]; the TCP client and the in-process
//! [`LocalNetwork`] are two implementations of it.

mod server;
mod client;
mod local;

pub use server::NetworkServer;
pub use client::NetworkClient;
pub use local::{LocalNetwork, LocalTransport};

use async_trait::async_trait;

use crate::replication::{Message, FrameHeader};
use crate::error::{Error, Result};

/// Largest frame body accepted from a peer
pub const MAX_FRAME_SIZE: u32 = 64 * 1024 * 1024;

/// Sends a request to a member and waits for its response
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send `message` to the member at `target` (its declared host)
    async fn send(&self, target: &str, message: Message) -> Result<Message>;
}

/// Produces the response to an inbound request
#[async_trait]
pub trait MessageHandler: Send + Sync {
    /// Handle one request from a peer
    async fn handle(&self, message: Message) -> Message;
}

/// Read a framed message from a reader
pub async fn read_message<R: tokio::io::AsyncRead + Unpin>(reader: &mut R) -> Result<Message> {
    use tokio::io::AsyncReadExt;

    // Read header
    let mut header_bytes = [0u8; FrameHeader::SIZE];
    reader.read_exact(&mut header_bytes).await?;
    let header = FrameHeader::from_bytes(&header_bytes);

    if header.length > MAX_FRAME_SIZE {
        return Err(Error::Network(format!(
            "Frame of {} bytes exceeds limit",
            header.length
        )));
    }

    // Read body
    let mut body = vec![0u8; header.length as usize];
    reader.read_exact(&mut body).await?;

    // Verify checksum
    if !header.verify(&body) {
        return Err(Error::Network("Message checksum mismatch".into()));
    }

    // Deserialize
    let message = Message::deserialize(&body)?;
    Ok(message)
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
    async fn test_frame_round_trip_over_pipe() {
        let (mut client, mut server) = tokio::io::duplex(1024);

        let sent = Message::Heartbeat {
            set_name: "rs0".into(),
            from: 2,
            term: 9,
        };
        write_message(&mut client, &sent).await.unwrap();

        match read_message(&mut server).await.unwrap() {
            Message::Heartbeat { from, term, .. } => {
                assert_eq!(from, 2);
                assert_eq!(term, 9);
            }
            other => panic!("unexpected {}", other.type_name()),
        }
    }

    #[tokio::test]
    async fn test_corrupt_frame_rejected() {
        use tokio::io::AsyncWriteExt;

        let (mut client, mut server) = tokio::io::duplex(1024);
        let body = Message::StatusRequest.serialize().unwrap();
        let mut header = FrameHeader::new(&body);
        header.checksum ^= 0xdead_beef;

        client.write_all(&header.to_bytes()).await.unwrap();
        client.write_all(&body).await.unwrap();

        assert!(matches!(
            read_message(&mut server).await,
            Err(Error::Network(_))
        ));
    }
}
