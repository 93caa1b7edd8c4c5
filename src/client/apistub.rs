//! Client-side TCP stub connecting to a node's client API.

use std::net::SocketAddr;

use crate::node::{ApiReply, ApiRequest, ClientId};
use crate::utils::{dial, FrameReader, FrameWriter, RingStoreError};

use tokio::io::AsyncReadExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};

/// Client API connection stub.
pub struct ApiStub {
    /// Session ID assigned by the node.
    pub id: ClientId,

    conn_read: OwnedReadHalf,
    conn_write: OwnedWriteHalf,

    reader: FrameReader,
    writer: FrameWriter,
}

impl ApiStub {
    /// Connects to a node's client API address and receives the assigned
    /// session ID.
    pub async fn new_by_connect(
        addr: SocketAddr,
    ) -> Result<Self, RingStoreError> {
        let mut stream = dial(addr, 10).await?;
        let id = stream.read_u64().await?;
        let (conn_read, conn_write) = stream.into_split();

        Ok(ApiStub {
            id,
            conn_read,
            conn_write,
            reader: FrameReader::new(),
            writer: FrameWriter::new(),
        })
    }

    /// Sends a request to the connected node. Returns `Ok(true)` once the
    /// request is fully out; `Ok(false)` means the socket filled up and
    /// the call must be repeated with `None` until it reports success.
    pub fn send_req(
        &mut self,
        req: Option<&ApiRequest>,
    ) -> Result<bool, RingStoreError> {
        if let Some(req) = req {
            self.writer.feed(req)?;
        }
        self.writer.flush(&self.conn_write)
    }

    /// Receives the next reply from the connected node.
    pub async fn recv_reply(&mut self) -> Result<ApiReply, RingStoreError> {
        self.reader.recv(&mut self.conn_read).await
    }
}
