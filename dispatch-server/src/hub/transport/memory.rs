//! In-process transport over a tokio duplex pipe
//!
//! Used by tests and by embedded consoles. Frames go through the same
//! encoder as TCP.

use std::sync::Arc;

use async_trait::async_trait;
use shared::error::AppError;
use shared::message::BusMessage;
use tokio::io::{AsyncWriteExt, DuplexStream, ReadHalf, WriteHalf};
use tokio::sync::Mutex;

use super::{Transport, read_from_stream, write_to_stream};

/// Default pipe buffer
pub const MEMORY_PIPE_CAPACITY: usize = 64 * 1024;

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

    /// Hub-side transport plus the raw client end of the pipe
    pub fn pair() -> (Self, DuplexStream) {
        let (server, client) = tokio::io::duplex(MEMORY_PIPE_CAPACITY);
        (Self::new(server), client)
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn read_message(&self) -> Result<BusMessage, AppError> {
        let mut reader = self.reader.lock().await;
        read_from_stream(&mut *reader).await
    }

    async fn write_message(&self, msg: &BusMessage) -> Result<(), AppError> {
        let mut writer = self.writer.lock().await;
        write_to_stream(&mut *writer, msg).await
    }

    async fn close(&self) -> Result<(), AppError> {
        let mut writer = self.writer.lock().await;
        writer
            .shutdown()
            .await
            .map_err(|e| AppError::internal(format!("Pipe close failed: {e}")))
    }

    fn peer_addr(&self) -> Option<String> {
        Some("memory".to_string())
    }
}
