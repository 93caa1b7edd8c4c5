//! Length-delimited MessagePack framing over TCP, plus bind/connect
//! helpers with retry.
//!
//! Every message on a connection is one frame: a 4-byte little-endian body
//! length followed by the MessagePack body. Reading and writing are
//! stateful codec values (`FrameReader` / `FrameWriter`) so that a partial
//! frame survives across calls: a read cancelled inside `tokio::select!`
//! resumes where it stopped, and a write that hits a full socket parks its
//! remaining bytes until the socket is writable again.

use std::io::{self, ErrorKind};
use std::net::SocketAddr;

use crate::utils::RingStoreError;

use bytes::{Buf, BufMut, BytesMut};

use serde::de::DeserializeOwned;
use serde::Serialize;

use tokio::io::AsyncReadExt;
use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio::time::{self, Duration};

/// Bytes of the frame header (little-endian body length).
const FRAME_HDR: usize = 4;

/// Pause between bind/connect attempts.
const RETRY_PAUSE: Duration = Duration::from_millis(500);

/// Decoder half of a connection: accumulates socket bytes until a whole
/// frame is present, then yields the decoded message.
pub(crate) struct FrameReader {
    stash: BytesMut,
}

impl FrameReader {
    pub(crate) fn new() -> Self {
        FrameReader {
            stash: BytesMut::new(),
        }
    }

    /// End offset of the first stashed frame, once its header is complete.
    fn frame_end(&self) -> Option<usize> {
        if self.stash.len() < FRAME_HDR {
            return None;
        }
        let body =
            u32::from_le_bytes(self.stash[..FRAME_HDR].try_into().unwrap());
        Some(FRAME_HDR + body as usize)
    }

    /// Receives the next message from the connection. Usable as a
    /// `tokio::select!` branch: cancellation can only land on the socket
    /// await, and whatever was read by then stays stashed for the next
    /// call.
    pub(crate) async fn recv<T, C>(
        &mut self,
        conn: &mut C,
    ) -> Result<T, RingStoreError>
    where
        T: DeserializeOwned,
        C: AsyncReadExt + Unpin,
    {
        let end = loop {
            match self.frame_end() {
                Some(end) if self.stash.len() >= end => break end,
                Some(end) => self.stash.reserve(end - self.stash.len()),
                None => {}
            }
            if conn.read_buf(&mut self.stash).await? == 0 {
                return Err(RingStoreError::msg("connection closed by peer"));
            }
        };

        let msg = rmp_serde::decode::from_slice(&self.stash[FRAME_HDR..end])?;
        // drop the consumed frame; bytes of any following frame remain
        self.stash.advance(end);
        Ok(msg)
    }
}

/// Encoder half of a connection: holds at most one encoded frame and
/// drains it with non-blocking writes.
pub(crate) struct FrameWriter {
    backlog: BytesMut,
}

impl FrameWriter {
    pub(crate) fn new() -> Self {
        FrameWriter {
            backlog: BytesMut::new(),
        }
    }

    /// True if no frame bytes are waiting to be written.
    pub(crate) fn is_idle(&self) -> bool {
        self.backlog.is_empty()
    }

    /// Encodes a message into the backlog. The previous frame must have
    /// been fully flushed first.
    pub(crate) fn feed<T: Serialize>(
        &mut self,
        msg: &T,
    ) -> Result<(), RingStoreError> {
        if !self.is_idle() {
            return Err(RingStoreError::msg("previous frame still unsent"));
        }
        let body = rmp_serde::encode::to_vec(msg)?;
        self.backlog.put_u32_le(body.len() as u32);
        self.backlog.extend_from_slice(&body);
        Ok(())
    }

    /// Pushes backlog bytes into the socket. Returns `Ok(true)` once the
    /// frame is fully out, `Ok(false)` if the socket filled up first (call
    /// again when it is writable). Writes are non-blocking on purpose: two
    /// peers blocking on full send buffers toward each other would never
    /// make progress otherwise.
    pub(crate) fn flush<C>(&mut self, conn: &C) -> Result<bool, RingStoreError>
    where
        C: AsRef<TcpStream>,
    {
        while !self.backlog.is_empty() {
            match conn.as_ref().try_write(&self.backlog) {
                Ok(n) => self.backlog.advance(n),
                Err(err) if err.kind() == ErrorKind::WouldBlock => {
                    return Ok(false);
                }
                Err(err) => return Err(err.into()),
            }
        }
        Ok(true)
    }
}

fn try_listen(addr: SocketAddr) -> io::Result<TcpListener> {
    let sock = TcpSocket::new_v4()?;
    sock.set_reuseaddr(true)?;
    sock.bind(addr)?;
    sock.listen(1024)
}

/// Binds a TCP listener, retrying a few times on failure (ports linger
/// briefly after a previous process exits).
pub(crate) async fn listen_on(
    addr: SocketAddr,
    mut attempts: u32,
) -> Result<TcpListener, RingStoreError> {
    loop {
        attempts = attempts.saturating_sub(1);
        match try_listen(addr) {
            Ok(listener) => return Ok(listener),
            Err(err) if attempts == 0 => return Err(err.into()),
            Err(err) => {
                pf_debug!("binding {} failed ({}), retrying", addr, err);
                time::sleep(RETRY_PAUSE).await;
            }
        }
    }
}

/// Connects to a TCP endpoint, retrying a few times (the peer may not be
/// listening yet during startup).
pub(crate) async fn dial(
    addr: SocketAddr,
    mut attempts: u32,
) -> Result<TcpStream, RingStoreError> {
    loop {
        attempts = attempts.saturating_sub(1);
        match TcpStream::connect(addr).await {
            Ok(stream) => {
                stream.set_nodelay(true)?;
                return Ok(stream);
            }
            Err(err) if attempts == 0 => return Err(err.into()),
            Err(err) => {
                pf_debug!("dialing {} failed ({}), retrying", addr, err);
                time::sleep(RETRY_PAUSE).await;
            }
        }
    }
}

#[cfg(test)]
mod framing_tests {
    use super::*;

    #[test]
    fn feed_requires_drained() -> Result<(), RingStoreError> {
        let mut writer = FrameWriter::new();
        assert!(writer.is_idle());
        writer.feed(&7u32)?;
        assert!(!writer.is_idle());
        assert!(writer.feed(&8u32).is_err());
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn frames_round_trip() -> Result<(), RingStoreError> {
        let listener = listen_on("127.0.0.1:0".parse()?, 1).await?;
        let addr = listener.local_addr()?;

        let client = dial(addr, 1).await?;
        let (server, _) = listener.accept().await?;
        let (_client_read, client_write) = client.into_split();
        let (mut server_read, _server_write) = server.into_split();

        // two frames written back-to-back may coalesce on the socket; the
        // reader must still split them apart
        let mut writer = FrameWriter::new();
        writer.feed(&String::from("first frame"))?;
        while !writer.flush(&client_write)? {}
        writer.feed(&String::from("second"))?;
        while !writer.flush(&client_write)? {}

        let mut reader = FrameReader::new();
        let one: String = reader.recv(&mut server_read).await?;
        let two: String = reader.recv(&mut server_read).await?;
        assert_eq!(one, "first frame");
        assert_eq!(two, "second");

        // peer hangup surfaces as an error, not a hang
        drop(_client_read);
        drop(client_write);
        let eof: Result<String, _> = reader.recv(&mut server_read).await;
        assert!(eof.is_err());
        Ok(())
    }
}
