//! Hub transport layer
//!
//! ```text
//!         ┌────────────────────┐
//!         │   Transport Trait  │
//!         └────────┬───────────┘
//!                  │
//!          ┌───────┴───────┐
//!          ▼               ▼
//!    TcpTransport    MemoryTransport
//!    (devices)       (in-process duplex)
//! ```
//!
//! Both speak the same framing, so a session cannot tell them apart.

mod memory;
mod tcp;

pub use memory::MemoryTransport;
pub use tcp::TcpTransport;

use async_trait::async_trait;
use shared::error::AppError;
use shared::message::{BusMessage, FRAME_HEADER_LEN, FrameHeader};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

/// Framed, bidirectional connection to one client
#[async_trait]
pub trait Transport: Send + Sync + std::fmt::Debug {
    async fn read_message(&self) -> Result<BusMessage, AppError>;

    async fn write_message(&self, msg: &BusMessage) -> Result<(), AppError>;

    async fn close(&self) -> Result<(), AppError>;

    fn peer_addr(&self) -> Option<String> {
        None
    }
}

/// Read one frame
pub(crate) async fn read_from_stream<R: AsyncReadExt + Unpin>(
    reader: &mut R,
) -> Result<BusMessage, AppError> {
    let mut header_buf = [0u8; FRAME_HEADER_LEN];
    match reader.read_exact(&mut header_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
            return Err(AppError::client_disconnected());
        }
        Err(e) => return Err(AppError::internal(format!("Read header failed: {e}"))),
    }

    let header = FrameHeader::parse(&header_buf).map_err(|e| AppError::invalid_request(e.to_string()))?;

    let mut payload = vec![0u8; header.payload_len];
    reader
        .read_exact(&mut payload)
        .await
        .map_err(|e| AppError::internal(format!("Read payload failed: {e}")))?;

    Ok(header.into_message(payload))
}

/// Write one frame
pub(crate) async fn write_to_stream<W: AsyncWriteExt + Unpin>(
    writer: &mut W,
    msg: &BusMessage,
) -> Result<(), AppError> {
    writer
        .write_all(&msg.to_frame())
        .await
        .map_err(|e| AppError::internal(format!("Write failed: {e}")))?;
    writer
        .flush()
        .await
        .map_err(|e| AppError::internal(format!("Flush failed: {e}")))
}
