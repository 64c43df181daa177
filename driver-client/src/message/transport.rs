//! Client transports
//!
//! TCP for devices in the field, a tokio duplex pipe for in-process hubs.
//! Both use the shared frame layout.

use std::sync::Arc;

use async_trait::async_trait;
use shared::message::{BusMessage, FRAME_HEADER_LEN, FrameHeader};
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::Mutex;

use super::MessageError;

/// Transport abstraction for the hub link
#[async_trait]
pub trait Transport: Send + Sync + std::fmt::Debug {
    async fn read_message(&self) -> Result<BusMessage, MessageError>;
    async fn write_message(&self, msg: &BusMessage) -> Result<(), MessageError>;
    async fn close(&self) -> Result<(), MessageError>;
}

async fn read_frame<R: AsyncReadExt + Unpin>(reader: &mut R) -> Result<BusMessage, MessageError> {
    let mut header_buf = [0u8; FRAME_HEADER_LEN];
    match reader.read_exact(&mut header_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Err(MessageError::Closed),
        Err(e) => return Err(MessageError::Io(e)),
    }
    let header =
        FrameHeader::parse(&header_buf).map_err(|e| MessageError::InvalidMessage(e.to_string()))?;

    let mut payload = vec![0u8; header.payload_len];
    reader.read_exact(&mut payload).await?;
    Ok(header.into_message(payload))
}

async fn write_frame<W: AsyncWriteExt + Unpin>(
    writer: &mut W,
    msg: &BusMessage,
) -> Result<(), MessageError> {
    writer.write_all(&msg.to_frame()).await?;
    writer.flush().await?;
    Ok(())
}

/// TCP Transport Implementation
#[derive(Debug, Clone)]
pub struct TcpTransport {
    reader: Arc<Mutex<OwnedReadHalf>>,
    writer: Arc<Mutex<OwnedWriteHalf>>,
}

impl TcpTransport {
    pub async fn connect(addr: &str) -> Result<Self, MessageError> {
        let stream = TcpStream::connect(addr)
            .await
            .map_err(|e| MessageError::Connection(format!("{addr}: {e}")))?;
        stream.set_nodelay(true)?;
        let (reader, writer) = stream.into_split();
        Ok(Self {
            reader: Arc::new(Mutex::new(reader)),
            writer: Arc::new(Mutex::new(writer)),
        })
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn read_message(&self) -> Result<BusMessage, MessageError> {
        let mut reader = self.reader.lock().await;
        read_frame(&mut *reader).await
    }

    async fn write_message(&self, msg: &BusMessage) -> Result<(), MessageError> {
        let mut writer = self.writer.lock().await;
        write_frame(&mut *writer, msg).await
    }

    async fn close(&self) -> Result<(), MessageError> {
        let mut writer = self.writer.lock().await;
        writer.shutdown().await?;
        Ok(())
    }
}

/// In-process transport over a duplex pipe
#[derive(Debug, Clone)]
pub struct MemoryTransport {
    reader: Arc<Mutex<ReadHalf<DuplexStream>>>,
    writer: Arc<Mutex<WriteHalf<DuplexStream>>>,
}

impl MemoryTransport {
    pub fn new(stream: DuplexStream) -> Self {
        let (reader, writer) = tokio::io::split(stream);
        Self {
            reader: Arc::new(Mutex::new(reader)),
            writer: Arc::new(Mutex::new(writer)),
        }
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn read_message(&self) -> Result<BusMessage, MessageError> {
        let mut reader = self.reader.lock().await;
        read_frame(&mut *reader).await
    }

    async fn write_message(&self, msg: &BusMessage) -> Result<(), MessageError> {
        let mut writer = self.writer.lock().await;
        write_frame(&mut *writer, msg).await
    }

    async fn close(&self) -> Result<(), MessageError> {
        let mut writer = self.writer.lock().await;
        writer.shutdown().await?;
        Ok(())
    }
}
