//! Node-to-node TCP transport module.
//!
//! NOTE: In concept, the commit protocol assumes unreliable point-to-point
//! channels: messages on one channel arrive in order or not at all, and
//! nothing is assumed across channels. TCP gives the per-channel ordering;
//! the protocol layers above (hold-back buffers, Paxos) handle everything
//! else.

use std::fmt;
use std::net::SocketAddr;

use crate::node::NodeId;
use crate::utils::{
    dial, listen_on, Bitmap, FrameReader, FrameWriter, RingStoreError,
};

use serde::{de::DeserializeOwned, Serialize};

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{self, Duration};

/// Node-to-node TCP transport module.
pub(crate) struct TransportHub<Msg> {
    /// My node ID.
    me: NodeId,

    /// Total number of nodes on the ring.
    population: u8,

    /// Receiver side of the recv channel.
    rx_recv: mpsc::UnboundedReceiver<(NodeId, Msg)>,

    /// Map from peer ID -> sender side of its send channel, shared with the
    /// peer acceptor task.
    tx_sends: flashmap::ReadHandle<NodeId, mpsc::UnboundedSender<Msg>>,

    /// Join handle of the peer acceptor task.
    _peer_acceptor_handle: JoinHandle<()>,

    /// Sender side of the connect channel, used when proactively connecting
    /// to some peer.
    tx_connect: mpsc::UnboundedSender<(NodeId, SocketAddr)>,

    /// Receiver side of the connack channel.
    rx_connack: mpsc::UnboundedReceiver<NodeId>,

    /// Map from peer ID -> peer messenger task join handles, shared with
    /// the peer acceptor task.
    _peer_messenger_handles: flashmap::ReadHandle<NodeId, JoinHandle<()>>,
}

// TransportHub public API implementation
impl<Msg> TransportHub<Msg>
where
    Msg: fmt::Debug + Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    /// Creates a new node-to-node TCP transport hub. Spawns the peer
    /// acceptor task. Creates a recv channel for listening on peers'
    /// messages.
    pub(crate) async fn new_and_setup(
        me: NodeId,
        population: u8,
        p2p_addr: SocketAddr,
    ) -> Result<Self, RingStoreError> {
        if population <= me {
            return logged_err!("invalid population {}", population);
        }

        let (tx_recv, rx_recv) = mpsc::unbounded_channel();

        let (tx_sends_write, tx_sends_read) =
            flashmap::new::<NodeId, mpsc::UnboundedSender<Msg>>();

        let (peer_messenger_handles_write, peer_messenger_handles_read) =
            flashmap::new::<NodeId, JoinHandle<()>>();

        // the connect & connack channels notify the peer acceptor task to
        // proactively connect to some peer
        let (tx_connect, rx_connect) = mpsc::unbounded_channel();
        let (tx_connack, rx_connack) = mpsc::unbounded_channel();

        let peer_listener = listen_on(p2p_addr, 10).await?;
        let mut acceptor = PeerAcceptorTask::new(
            me,
            tx_recv,
            peer_listener,
            tx_sends_write,
            peer_messenger_handles_write,
            rx_connect,
            tx_connack,
        );
        let peer_acceptor_handle =
            tokio::spawn(async move { acceptor.run().await });

        Ok(TransportHub {
            me,
            population,
            rx_recv,
            tx_sends: tx_sends_read,
            _peer_acceptor_handle: peer_acceptor_handle,
            tx_connect,
            rx_connack,
            _peer_messenger_handles: peer_messenger_handles_read,
        })
    }

    /// Connects to a peer node proactively, spawning the corresponding
    /// messenger task.
    pub(crate) async fn connect_to_peer(
        &mut self,
        id: NodeId,
        peer_addr: SocketAddr,
    ) -> Result<(), RingStoreError> {
        self.tx_connect.send((id, peer_addr))?;
        match self.rx_connack.recv().await {
            Some(ack_id) if ack_id == id => Ok(()),
            Some(ack_id) => {
                logged_err!("peer ID mismatch: expected {}, got {}", id, ack_id)
            }
            None => logged_err!("connack channel closed"),
        }
    }

    /// Waits until enough peers have been connected to me to form a group
    /// of the specified size.
    pub(crate) async fn wait_for_group(
        &self,
        group: u8,
    ) -> Result<(), RingStoreError> {
        if group == 0 {
            return logged_err!("invalid group size {}", group);
        }
        while self.current_peers()?.count() + 1 < group {
            time::sleep(Duration::from_millis(20)).await;
        }
        Ok(())
    }

    /// Gets a bitmap where currently connected peers are set true.
    pub(crate) fn current_peers(&self) -> Result<Bitmap, RingStoreError> {
        let tx_sends_guard = self.tx_sends.guard();
        let mut peers = Bitmap::new(self.population, false);
        for &id in tx_sends_guard.keys() {
            peers.set(id, true)?;
        }
        Ok(peers)
    }

    /// Sends a message to a specified peer. Messages to disconnected peers
    /// are silently dropped; the protocol treats channels as unreliable.
    pub(crate) fn send_msg(
        &mut self,
        msg: Msg,
        peer: NodeId,
    ) -> Result<(), RingStoreError> {
        debug_assert!(peer != self.me);
        let tx_sends_guard = self.tx_sends.guard();
        if let Some(tx_send) = tx_sends_guard.get(&peer) {
            tx_send.send(msg).map_err(RingStoreError::msg)?;
        }
        Ok(())
    }

    /// Broadcasts a message to specified peers. If `target` is `None`,
    /// broadcasts to all currently connected peers.
    pub(crate) fn bcast_msg(
        &mut self,
        msg: Msg,
        target: Option<Bitmap>,
    ) -> Result<(), RingStoreError> {
        let tx_sends_guard = self.tx_sends.guard();
        for &peer in tx_sends_guard.keys() {
            if peer == self.me {
                continue;
            }
            if let Some(ref target) = target {
                if peer >= target.size() || !target.get(peer)? {
                    continue;
                }
            }

            // not skipped
            tx_sends_guard
                .get(&peer)
                .unwrap()
                .send(msg.clone())
                .map_err(RingStoreError::msg)?;
        }
        Ok(())
    }

    /// Receives a message from some peer. Returns `(peer_id, msg)` on
    /// success.
    pub(crate) async fn recv_msg(
        &mut self,
    ) -> Result<(NodeId, Msg), RingStoreError> {
        match self.rx_recv.recv().await {
            Some((id, msg)) => Ok((id, msg)),
            None => logged_err!("recv channel has been closed"),
        }
    }
}

/// TransportHub peer acceptor task.
struct PeerAcceptorTask<Msg> {
    me: NodeId,

    tx_recv: mpsc::UnboundedSender<(NodeId, Msg)>,
    tx_sends: flashmap::WriteHandle<NodeId, mpsc::UnboundedSender<Msg>>,

    peer_listener: TcpListener,
    peer_messenger_handles: flashmap::WriteHandle<NodeId, JoinHandle<()>>,

    rx_connect: mpsc::UnboundedReceiver<(NodeId, SocketAddr)>,
    tx_connack: mpsc::UnboundedSender<NodeId>,

    tx_exit: mpsc::UnboundedSender<NodeId>,
    rx_exit: mpsc::UnboundedReceiver<NodeId>,
}

impl<Msg> PeerAcceptorTask<Msg>
where
    Msg: fmt::Debug + Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    fn new(
        me: NodeId,
        tx_recv: mpsc::UnboundedSender<(NodeId, Msg)>,
        peer_listener: TcpListener,
        tx_sends: flashmap::WriteHandle<NodeId, mpsc::UnboundedSender<Msg>>,
        peer_messenger_handles: flashmap::WriteHandle<NodeId, JoinHandle<()>>,
        rx_connect: mpsc::UnboundedReceiver<(NodeId, SocketAddr)>,
        tx_connack: mpsc::UnboundedSender<NodeId>,
    ) -> Self {
        // exit channel for getting notified about termination of peer
        // messenger tasks
        let (tx_exit, rx_exit) = mpsc::unbounded_channel();

        PeerAcceptorTask {
            me,
            tx_recv,
            peer_listener,
            tx_sends,
            peer_messenger_handles,
            rx_connect,
            tx_connack,
            tx_exit,
            rx_exit,
        }
    }

    /// Spawns a messenger task for a newly established peer connection.
    fn spawn_messenger(&mut self, id: NodeId, stream: TcpStream) {
        let mut tx_sends_guard = self.tx_sends.guard();
        let (tx_send, rx_send) = mpsc::unbounded_channel();
        tx_sends_guard.insert(id, tx_send);
        drop(tx_sends_guard);

        let mut messenger = PeerMessengerTask::new(
            id,
            stream,
            rx_send,
            self.tx_recv.clone(),
            self.tx_exit.clone(),
        );
        let handle = tokio::spawn(async move { messenger.run().await });
        let mut handles_guard = self.peer_messenger_handles.guard();
        handles_guard.insert(id, handle);
    }

    /// Connects to a peer proactively.
    async fn connect_new_peer(
        &mut self,
        id: NodeId,
        conn_addr: SocketAddr,
    ) -> Result<(), RingStoreError> {
        pf_debug!("connecting to peer {} '{}'...", id, conn_addr);
        let mut stream = dial(conn_addr, 10).await?;
        stream.write_u8(self.me).await?; // send my ID

        {
            let handles_guard = self.peer_messenger_handles.guard();
            if handles_guard.contains_key(&id) {
                return logged_err!("duplicate peer ID to connect: {}", id);
            }
        }

        self.spawn_messenger(id, stream);
        pf_debug!("connected to peer {}", id);
        Ok(())
    }

    /// Accepts a new peer connection.
    async fn accept_new_peer(
        &mut self,
        mut stream: TcpStream,
    ) -> Result<(), RingStoreError> {
        let id = match stream.read_u8().await {
            Ok(id) => id, // receive peer's ID
            Err(e) => {
                return logged_err!("error receiving new peer ID: {}", e);
            }
        };

        {
            let handles_guard = self.peer_messenger_handles.guard();
            if handles_guard.contains_key(&id) {
                return logged_err!("duplicate peer ID listened: {}", id);
            }
        }

        self.spawn_messenger(id, stream);
        pf_debug!("waited on peer {}", id);
        Ok(())
    }

    /// Removes handles of a left peer connection.
    fn remove_left_peer(&mut self, id: NodeId) {
        let mut tx_sends_guard = self.tx_sends.guard();
        tx_sends_guard.remove(id);
        drop(tx_sends_guard);

        let mut handles_guard = self.peer_messenger_handles.guard();
        handles_guard.remove(id);
    }

    /// Starts the peer acceptor task loop.
    async fn run(&mut self) {
        pf_debug!("peer_acceptor task spawned");

        loop {
            tokio::select! {
                // proactive connection request
                to_connect = self.rx_connect.recv() => {
                    let Some((peer, conn_addr)) = to_connect else {
                        break; // channel closed and no messages remain
                    };
                    if let Err(e) = self.connect_new_peer(peer, conn_addr).await {
                        pf_error!("error connecting to new peer: {}", e);
                    } else if let Err(e) = self.tx_connack.send(peer) {
                        pf_error!("error sending to tx_connack: {}", e);
                    }
                },

                // new peer connection accepted
                accepted = self.peer_listener.accept() => {
                    let Ok((stream, _addr)) = accepted else {
                        continue;
                    };
                    if let Err(e) = self.accept_new_peer(stream).await {
                        pf_error!("error accepting new peer: {}", e);
                    }
                },

                // a peer messenger task exits
                id = self.rx_exit.recv() => {
                    if let Some(id) = id {
                        self.remove_left_peer(id);
                    }
                },
            }
        }
    }
}

/// TransportHub per-peer messenger task.
struct PeerMessengerTask<Msg> {
    /// Corresponding peer's ID.
    id: NodeId,

    conn_read: OwnedReadHalf,
    conn_write: OwnedWriteHalf,

    reader: FrameReader,
    writer: FrameWriter,

    rx_send: mpsc::UnboundedReceiver<Msg>,
    tx_recv: mpsc::UnboundedSender<(NodeId, Msg)>,

    tx_exit: mpsc::UnboundedSender<NodeId>,
}

impl<Msg> PeerMessengerTask<Msg>
where
    Msg: fmt::Debug + Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    fn new(
        id: NodeId,
        conn: TcpStream,
        rx_send: mpsc::UnboundedReceiver<Msg>,
        tx_recv: mpsc::UnboundedSender<(NodeId, Msg)>,
        tx_exit: mpsc::UnboundedSender<NodeId>,
    ) -> Self {
        let (conn_read, conn_write) = conn.into_split();

        PeerMessengerTask {
            id,
            conn_read,
            conn_write,
            reader: FrameReader::new(),
            writer: FrameWriter::new(),
            rx_send,
            tx_recv,
            tx_exit,
        }
    }

    /// Starts the per-peer messenger task loop. New outgoing messages are
    /// only taken once the writer has no backlog; a frame stuck on a full
    /// socket drains through the writable branch.
    async fn run(&mut self) {
        pf_debug!("peer_messenger task for {} spawned", self.id);

        loop {
            tokio::select! {
                // gets a message to send out
                msg = self.rx_send.recv(), if self.writer.is_idle() => {
                    let Some(msg) = msg else {
                        break; // channel closed and no messages remain
                    };
                    if self.writer.feed(&msg).is_err() {
                        break;
                    }
                    match self.writer.flush(&self.conn_write) {
                        Ok(_) => {}
                        Err(_e) => {
                            // peer likely gone; messages are allowed to drop
                            break;
                        }
                    }
                },

                // draining a frame the socket could not take at once
                _ = self.conn_write.writable(), if !self.writer.is_idle() => {
                    if self.writer.flush(&self.conn_write).is_err() {
                        break;
                    }
                },

                // receives new message from peer
                msg = self.reader.recv(&mut self.conn_read) => {
                    match msg {
                        Ok(msg) => {
                            if self.tx_recv.send((self.id, msg)).is_err() {
                                break; // hub has been dropped
                            }
                        }
                        Err(_e) => {
                            break; // probably the peer exited ungracefully
                        }
                    }
                }
            }
        }

        if let Err(e) = self.tx_exit.send(self.id) {
            pf_error!("error sending exit signal for {}: {}", self.id, e);
        }
        pf_debug!("peer_messenger task for {} exited", self.id);
    }
}

#[cfg(test)]
mod transport_tests {
    use super::*;
    use serde::Deserialize;
    use std::sync::Arc;
    use tokio::sync::Barrier;

    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    struct TestMsg(String);

    #[tokio::test(flavor = "multi_thread", worker_threads = 3)]
    async fn hub_send_recv() -> Result<(), RingStoreError> {
        let barrier = Arc::new(Barrier::new(3));
        let barrier1 = barrier.clone();
        let barrier2 = barrier.clone();
        tokio::spawn(async move {
            // node 1
            let mut hub: TransportHub<TestMsg> =
                TransportHub::new_and_setup(1, 3, "127.0.0.1:31801".parse()?)
                    .await?;
            barrier1.wait().await;
            hub.connect_to_peer(2, "127.0.0.1:31802".parse()?).await?;
            let (id, msg) = hub.recv_msg().await?;
            assert_eq!(id, 0);
            assert_eq!(msg, TestMsg("hello".into()));
            hub.send_msg(TestMsg("world".into()), 0)?;
            Ok::<(), RingStoreError>(())
        });
        tokio::spawn(async move {
            // node 2
            let mut hub: TransportHub<TestMsg> =
                TransportHub::new_and_setup(2, 3, "127.0.0.1:31802".parse()?)
                    .await?;
            barrier2.wait().await;
            let (id, msg) = hub.recv_msg().await?;
            assert_eq!(id, 0);
            assert_eq!(msg, TestMsg("hello".into()));
            hub.send_msg(TestMsg("world".into()), 0)?;
            Ok::<(), RingStoreError>(())
        });
        // node 0
        let mut hub: TransportHub<TestMsg> =
            TransportHub::new_and_setup(0, 3, "127.0.0.1:31800".parse()?)
                .await?;
        barrier.wait().await;
        hub.connect_to_peer(1, "127.0.0.1:31801".parse()?).await?;
        hub.connect_to_peer(2, "127.0.0.1:31802".parse()?).await?;
        hub.wait_for_group(3).await?;
        hub.bcast_msg(TestMsg("hello".into()), None)?;
        for _ in 0..2 {
            let (id, msg) = hub.recv_msg().await?;
            assert!(id == 1 || id == 2);
            assert_eq!(msg, TestMsg("world".into()));
        }
        Ok(())
    }
}
