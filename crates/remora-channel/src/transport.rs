//! Block-layer framing for the agent connection.
//!
//! Every message is wrapped in a block with an 8-byte header:
//! - Bytes 0..4: Block size (u32 BE): number of bytes after the header
//! - Bytes 4..8: Message count (u32 BE): number of messages in this block
//!
//! The agent and this crate both send exactly one JSON message per block.
//! Reading and writing are split so the reader can live on its own task.

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{ChannelError, Result};

/// Upper bound on a single block. Anything larger is treated as a corrupt stream.
pub const MAX_BLOCK_SIZE: u32 = 16 * 1024 * 1024;

/// Writing half of a framed connection.
pub struct FrameWriter<W> {
    inner: W,
}

impl<W: AsyncWrite + Unpin> FrameWriter<W> {
    pub fn new(inner: W) -> Self {
        Self { inner }
    }

    /// Send a single message as a block.
    pub async fn send_message(&mut self, data: &[u8]) -> Result<()> {
        let size = u32::try_from(data.len())
            .ok()
            .filter(|size| *size <= MAX_BLOCK_SIZE)
            .ok_or_else(|| {
                ChannelError::Protocol(format!("message of {} bytes exceeds block limit", data.len()))
            })?;
        let count: u32 = 1;

        let mut header = [0u8; 8];
        header[0..4].copy_from_slice(&size.to_be_bytes());
        header[4..8].copy_from_slice(&count.to_be_bytes());

        self.inner.write_all(&header).await?;
        self.inner.write_all(data).await?;
        self.inner.flush().await?;
        Ok(())
    }

    /// Flush and shut down the write side.
    pub async fn shutdown(&mut self) -> Result<()> {
        self.inner.shutdown().await?;
        Ok(())
    }
}

/// Reading half of a framed connection.
pub struct FrameReader<R> {
    inner: R,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(inner: R) -> Self {
        Self { inner }
    }

    /// Receive a complete block, returning the raw payload bytes and message count.
    pub async fn recv_block(&mut self) -> Result<(Bytes, u32)> {
        let mut header = [0u8; 8];
        match self.inner.read_exact(&mut header).await {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                return Err(ChannelError::ConnectionClosed);
            }
            Err(e) => return Err(ChannelError::Io(e)),
        }

        let size = u32::from_be_bytes([header[0], header[1], header[2], header[3]]);
        let count = u32::from_be_bytes([header[4], header[5], header[6], header[7]]);

        if size > MAX_BLOCK_SIZE {
            return Err(ChannelError::Protocol(format!(
                "block of {size} bytes exceeds limit of {MAX_BLOCK_SIZE}"
            )));
        }
        if size == 0 {
            return Ok((Bytes::new(), count));
        }

        let mut payload = BytesMut::zeroed(size as usize);
        match self.inner.read_exact(&mut payload).await {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                return Err(ChannelError::ConnectionClosed);
            }
            Err(e) => return Err(ChannelError::Io(e)),
        }

        Ok((payload.freeze(), count))
    }

    /// Receive a single message.
    pub async fn recv_message(&mut self) -> Result<Bytes> {
        let (payload, count) = self.recv_block().await?;
        if count > 1 {
            return Err(ChannelError::Protocol(format!(
                "expected one message per block, got {count}"
            )));
        }
        Ok(payload)
    }
}
