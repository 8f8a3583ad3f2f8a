// Copyright 2026 Daniel Pelikan
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Message transfer over one connected socket.
//!
//! Framing is one message per read: whatever a single `read` returns is
//! decoded as exactly one frame. Messages longer than the read buffer arrive
//! as several garbled frames, and writes coalesced by the stack arrive as one.
//! Peers that send one short message per write are unaffected.

use futures::stream::{self, Stream};
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::device::RemoteDevice;
use super::platform::RfcommSocket;
use super::protocol::{ChatMessage, WireFormat};
use crate::error::TransferError;

/// Default read buffer size in bytes.
pub const READ_BUFFER_SIZE: usize = 1024;

/// Wraps a connected socket and speaks the chat wire format over it.
pub struct TransferChannel {
    socket: Arc<dyn RfcommSocket>,
    format: WireFormat,
    buffer_size: usize,
}

impl TransferChannel {
    /// Create a new transfer channel over an already connected socket.
    pub fn new(socket: Arc<dyn RfcommSocket>, format: WireFormat, buffer_size: usize) -> Self {
        Self {
            socket,
            format,
            buffer_size: buffer_size.max(1),
        }
    }

    pub fn remote_device(&self) -> RemoteDevice {
        self.socket.remote_device()
    }

    pub fn format(&self) -> WireFormat {
        self.format
    }

    /// Stream of decoded inbound messages.
    ///
    /// The stream yields messages until the socket fails or the peer closes,
    /// then yields exactly one error and ends. Frames that fail to decode are
    /// logged and skipped.
    pub fn incoming(self: Arc<Self>) -> impl Stream<Item = Result<ChatMessage, TransferError>> + Send {
        let buf = vec![0u8; self.buffer_size];
        stream::unfold(Some((self, buf)), |state| async move {
            let (channel, mut buf) = state?;
            match channel.receive(&mut buf).await {
                Ok(message) => Some((Ok(message), Some((channel, buf)))),
                Err(e) => {
                    info!("Transfer from {} ended: {}", channel.remote_device(), e);
                    Some((Err(e), None))
                }
            }
        })
    }

    async fn receive(&self, buf: &mut [u8]) -> Result<ChatMessage, TransferError> {
        loop {
            let n = self.socket.read(buf).await?;
            if n == 0 {
                return Err(TransferError::Closed);
            }

            match self.format.decode(buf, n) {
                Ok(message) => {
                    debug!("Received {} bytes from {}", n, message.sender_name);
                    return Ok(message);
                }
                Err(e) => warn!("Dropping undecodable frame ({} bytes): {}", n, e),
            }
        }
    }

    /// Write one frame. Returns false if the write failed.
    pub async fn send(&self, bytes: &[u8]) -> bool {
        match self.socket.write(bytes).await {
            Ok(()) => {
                debug!("Sent {} bytes", bytes.len());
                true
            }
            Err(e) => {
                warn!("Failed to send message: {}", e);
                false
            }
        }
    }

    /// Encode and write a message.
    pub async fn send_message(&self, message: &ChatMessage) -> bool {
        self.send(&self.format.encode(message)).await
    }

    /// Close the underlying socket. Idempotent.
    pub fn close(&self) {
        if let Err(e) = self.socket.close() {
            warn!("Error closing socket: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bluetooth::platform::BluetoothAdapter;
    use crate::bluetooth::sim::SimulatedAir;
    use futures::StreamExt;
    use uuid::Uuid;

    const SERVICE: Uuid = Uuid::from_u128(0x27b7d1da_08c7_4505_a6d1_2459987e5e2d);

    async fn channels(format: WireFormat, buffer_size: usize) -> (Arc<TransferChannel>, Arc<TransferChannel>) {
        let air = SimulatedAir::new();
        let host = air.adapter("00:00:00:00:00:01", "Host");
        let guest = air.adapter("00:00:00:00:00:02", "Guest");
        let listener = host.listen("test", SERVICE).await.unwrap();
        let client = guest.create_socket(&host.identity(), SERVICE).unwrap();
        client.connect().await.unwrap();
        let server = listener.accept().await.unwrap();
        (
            Arc::new(TransferChannel::new(client, format, buffer_size)),
            Arc::new(TransferChannel::new(server, format, buffer_size)),
        )
    }

    #[tokio::test]
    async fn test_messages_arrive_as_remote() {
        let (client, server) = channels(WireFormat::Delimited, READ_BUFFER_SIZE).await;
        let mut incoming = Box::pin(server.clone().incoming());

        assert!(client.send_message(&ChatMessage::local("Guest", "hi there")).await);
        assert!(client.send(b"Guest#second").await);

        let first = incoming.next().await.unwrap().unwrap();
        assert_eq!(first, ChatMessage::remote("Guest", "hi there"));
        let second = incoming.next().await.unwrap().unwrap();
        assert_eq!(second.body, "second");
        assert!(!second.origin_local);
    }

    #[tokio::test]
    async fn test_peer_close_ends_stream_with_error() {
        let (client, server) = channels(WireFormat::Delimited, READ_BUFFER_SIZE).await;
        let mut incoming = Box::pin(server.incoming());

        client.close();
        assert!(matches!(incoming.next().await, Some(Err(TransferError::Closed))));
        assert!(incoming.next().await.is_none());
    }

    #[tokio::test]
    async fn test_local_close_ends_stream_with_io_error() {
        let (_client, server) = channels(WireFormat::Delimited, READ_BUFFER_SIZE).await;
        let mut incoming = Box::pin(server.clone().incoming());

        server.close();
        assert!(matches!(incoming.next().await, Some(Err(TransferError::Io(_)))));
        assert!(incoming.next().await.is_none());
    }

    #[tokio::test]
    async fn test_undecodable_frame_is_skipped() {
        let (client, server) = channels(WireFormat::Json, READ_BUFFER_SIZE).await;
        let mut incoming = Box::pin(server.incoming());

        assert!(client.send(b"not json").await);
        assert!(client.send_message(&ChatMessage::local("Guest", "ok")).await);

        let message = incoming.next().await.unwrap().unwrap();
        assert_eq!(message.body, "ok");
    }

    #[tokio::test]
    async fn test_oversized_message_is_split() {
        let (client, server) = channels(WireFormat::Delimited, 8).await;
        let mut incoming = Box::pin(server.incoming());

        assert!(client.send(b"Guest#0123456789").await);
        let first = incoming.next().await.unwrap().unwrap();
        assert_eq!(first.sender_name, "Guest");
        assert_eq!(first.body, "01");
        let second = incoming.next().await.unwrap().unwrap();
        assert_eq!(second.sender_name, "");
        assert_eq!(second.body, "23456789");
    }

    #[tokio::test]
    async fn test_read_boundary_inside_character_keeps_both_frames() {
        let (client, server) = channels(WireFormat::Delimited, READ_BUFFER_SIZE).await;
        let mut incoming = Box::pin(server.incoming());

        // 3 + 1200 bytes: the first read ends after the lead byte of an "é".
        assert!(client.send_message(&ChatMessage::local("AB", "é".repeat(600))).await);
        assert!(client.send_message(&ChatMessage::local("AB", "next")).await);

        let first = incoming.next().await.unwrap().unwrap();
        assert_eq!(first.sender_name, "AB");
        assert_eq!(first.body, format!("{}\u{fffd}", "é".repeat(510)));

        let second = incoming.next().await.unwrap().unwrap();
        assert_eq!(second.sender_name, "");
        assert_eq!(second.body, format!("\u{fffd}{}", "é".repeat(89)));

        let third = incoming.next().await.unwrap().unwrap();
        assert_eq!(third, ChatMessage::remote("AB", "next"));
    }

    #[tokio::test]
    async fn test_send_after_close_fails() {
        let (client, _server) = channels(WireFormat::Delimited, READ_BUFFER_SIZE).await;
        client.close();
        client.close();
        assert!(!client.send(b"late").await);
    }
}
