//! Individual node session handling

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use courier_shared::codec::{self, FrameDecoder};
use courier_shared::RelayMessage;
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tracing::warn;

/// Handle to send messages to a specific node
#[derive(Clone)]
pub struct SessionHandle {
    pub id: u64,
    pub addr: SocketAddr,
    writer: Arc<Mutex<WriteHalf<TcpStream>>>,
}

impl SessionHandle {
    /// Deliver `body` published on `channel` to this node
    pub async fn deliver(&self, channel: &str, body: Vec<u8>) -> Result<()> {
        let encoded = codec::encode(&RelayMessage::deliver(channel, body))?;
        let mut writer = self.writer.lock().await;
        writer.write_all(&encoded).await?;
        Ok(())
    }
}

impl std::fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionHandle")
            .field("id", &self.id)
            .field("addr", &self.addr)
            .finish()
    }
}

/// Active node session
pub struct RelaySession {
    handle: SessionHandle,
    reader: ReadHalf<TcpStream>,
    decoder: FrameDecoder<RelayMessage>,
    read_buf: Vec<u8>,
}

impl RelaySession {
    /// Create a new session from a TCP stream
    pub fn new(stream: TcpStream, addr: SocketAddr, id: u64) -> Self {
        let (reader, writer) = tokio::io::split(stream);

        Self {
            handle: SessionHandle {
                id,
                addr,
                writer: Arc::new(Mutex::new(writer)),
            },
            reader,
            decoder: FrameDecoder::new(),
            read_buf: vec![0u8; 4096],
        }
    }

    /// Get a cloneable handle for sending messages
    pub fn get_handle(&self) -> SessionHandle {
        self.handle.clone()
    }

    /// Read the next message from this session
    /// Returns None if the connection is closed
    pub async fn recv(&mut self) -> Option<RelayMessage> {
        loop {
            match self.decoder.decode_next() {
                Ok(Some(message)) => return Some(message),
                Ok(None) => {}
                Err(e) => {
                    warn!("Decode error from {}: {}", self.handle.addr, e);
                    return None;
                }
            }

            match self.reader.read(&mut self.read_buf).await {
                Ok(0) => return None,
                Ok(n) => self.decoder.extend(&self.read_buf[..n]),
                Err(e) => {
                    warn!("Read error from {}: {}", self.handle.addr, e);
                    return None;
                }
            }
        }
    }
}
