//! Client-facing API module: TCP listener for client sessions plus the
//! request/reply wire types of the client API.
//!
//! All failures are tagged results on the wire, never out-of-band errors;
//! a client sees exactly one reply per request it issued.

use std::net::SocketAddr;

use crate::client::TLog;
use crate::node::{NodeId, Version};
use crate::utils::{listen_on, FrameReader, FrameWriter, RingStoreError};

use serde::{Deserialize, Serialize};

use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Client session ID type, unique within one node.
pub type ClientId = u64;

/// Client request ID type, unique within one client session.
pub type RequestId = u64;

/// Tagged failure reasons surfaced to clients.
#[derive(Debug, PartialEq, Eq, Copy, Clone, Serialize, Deserialize)]
pub enum FailReason {
    /// Key has no committed version, or subscriber absent.
    NotFound,

    /// A dependent operation did not respond within its bound.
    Timeout,

    /// Transaction validated to abort; definitive.
    Abort,

    /// Protocol-level invariant violation; fatal for the operation.
    Unknown,
}

/// Result payload of a client request.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub enum WireResult {
    /// Successful read: committed value and its version.
    Value { value: String, version: Version },

    /// Successful write / commit / pub-sub operation.
    Ok,

    /// Subscriber list of a topic.
    Subscribers { urls: Vec<String> },

    /// Tagged failure.
    Fail { reason: FailReason },
}

/// Request received from a client session.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub enum ApiRequest {
    /// Quorum read of one key.
    Read { id: RequestId, key: String },

    /// Commit of a frozen transaction log.
    Commit { id: RequestId, tlog: TLog },

    /// Publish content under a topic.
    Publish {
        id: RequestId,
        topic: String,
        content: String,
    },

    /// Subscribe a url to a topic.
    Subscribe {
        id: RequestId,
        topic: String,
        url: String,
    },

    /// Unsubscribe a url from a topic.
    Unsubscribe {
        id: RequestId,
        topic: String,
        url: String,
    },

    /// List the subscribers of a topic.
    GetSubscribers { id: RequestId, topic: String },

    /// Client is leaving the session.
    Leave,
}

impl ApiRequest {
    /// Request ID of this request, if any.
    pub fn req_id(&self) -> Option<RequestId> {
        match self {
            ApiRequest::Read { id, .. }
            | ApiRequest::Commit { id, .. }
            | ApiRequest::Publish { id, .. }
            | ApiRequest::Subscribe { id, .. }
            | ApiRequest::Unsubscribe { id, .. }
            | ApiRequest::GetSubscribers { id, .. } => Some(*id),
            ApiRequest::Leave => None,
        }
    }
}

/// Reply back to a client session.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub enum ApiReply {
    /// Normal reply to a request.
    Reply { id: RequestId, result: WireResult },

    /// Goodbye reply to a leave notification.
    Leave,
}

/// The client-facing API hub.
pub(crate) struct ApiHub {
    /// Receiver side of the req channel.
    rx_req: mpsc::UnboundedReceiver<(ClientId, ApiRequest)>,

    /// Map from client ID -> sender side of its reply channel, shared with
    /// the client acceptor task.
    tx_replies: flashmap::ReadHandle<ClientId, mpsc::UnboundedSender<ApiReply>>,

    /// Join handle of the client acceptor task.
    _client_acceptor_handle: JoinHandle<()>,

    /// Map from client ID -> client servant task join handles, shared with
    /// the client acceptor task.
    _client_servant_handles: flashmap::ReadHandle<ClientId, JoinHandle<()>>,
}

impl ApiHub {
    /// Creates a new client-facing API hub. Spawns the client acceptor
    /// task; clients are served by per-session servant tasks.
    pub(crate) async fn new_and_setup(
        me: NodeId,
        api_addr: SocketAddr,
    ) -> Result<Self, RingStoreError> {
        let (tx_req, rx_req) = mpsc::unbounded_channel();

        let (tx_replies_write, tx_replies_read) =
            flashmap::new::<ClientId, mpsc::UnboundedSender<ApiReply>>();

        let (servant_handles_write, servant_handles_read) =
            flashmap::new::<ClientId, JoinHandle<()>>();

        let client_listener = listen_on(api_addr, 10).await?;
        let mut acceptor = ClientAcceptorTask::new(
            me,
            tx_req,
            client_listener,
            tx_replies_write,
            servant_handles_write,
        );
        let client_acceptor_handle =
            tokio::spawn(async move { acceptor.run().await });

        Ok(ApiHub {
            rx_req,
            tx_replies: tx_replies_read,
            _client_acceptor_handle: client_acceptor_handle,
            _client_servant_handles: servant_handles_read,
        })
    }

    /// Receives the next client request.
    pub(crate) async fn get_req(
        &mut self,
    ) -> Result<(ClientId, ApiRequest), RingStoreError> {
        match self.rx_req.recv().await {
            Some((client, req)) => Ok((client, req)),
            None => logged_err!("req channel has been closed"),
        }
    }

    /// Sends a reply to a client session. Replies to sessions that have
    /// already left are silently dropped.
    pub(crate) fn send_reply(
        &mut self,
        reply: ApiReply,
        client: ClientId,
    ) -> Result<(), RingStoreError> {
        let tx_replies_guard = self.tx_replies.guard();
        if let Some(tx_reply) = tx_replies_guard.get(&client) {
            tx_reply.send(reply).map_err(RingStoreError::msg)?;
        }
        Ok(())
    }
}

/// ApiHub client acceptor task.
struct ClientAcceptorTask {
    me: NodeId,
    next_client_id: u64,

    tx_req: mpsc::UnboundedSender<(ClientId, ApiRequest)>,
    client_listener: TcpListener,
    tx_replies: flashmap::WriteHandle<ClientId, mpsc::UnboundedSender<ApiReply>>,
    servant_handles: flashmap::WriteHandle<ClientId, JoinHandle<()>>,

    tx_exit: mpsc::UnboundedSender<ClientId>,
    rx_exit: mpsc::UnboundedReceiver<ClientId>,
}

impl ClientAcceptorTask {
    fn new(
        me: NodeId,
        tx_req: mpsc::UnboundedSender<(ClientId, ApiRequest)>,
        client_listener: TcpListener,
        tx_replies: flashmap::WriteHandle<
            ClientId,
            mpsc::UnboundedSender<ApiReply>,
        >,
        servant_handles: flashmap::WriteHandle<ClientId, JoinHandle<()>>,
    ) -> Self {
        let (tx_exit, rx_exit) = mpsc::unbounded_channel();

        ClientAcceptorTask {
            me,
            next_client_id: 0,
            tx_req,
            client_listener,
            tx_replies,
            servant_handles,
            tx_exit,
            rx_exit,
        }
    }

    /// Accepts a new client connection, assigning it a session ID.
    async fn accept_new_client(&mut self, mut stream: TcpStream) {
        self.next_client_id += 1;
        let id: ClientId = ((self.me as u64) << 32) | self.next_client_id;

        // tell the client its assigned session ID
        if let Err(e) = stream.write_u64(id).await {
            pf_error!("error sending client ID: {}", e);
            return;
        }

        let mut tx_replies_guard = self.tx_replies.guard();
        let (tx_reply, rx_reply) = mpsc::unbounded_channel();
        tx_replies_guard.insert(id, tx_reply);
        drop(tx_replies_guard);

        let mut servant = ClientServantTask {
            id,
            conn: stream,
            rx_reply,
            tx_req: self.tx_req.clone(),
            tx_exit: self.tx_exit.clone(),
        };
        let handle = tokio::spawn(async move { servant.run().await });
        let mut handles_guard = self.servant_handles.guard();
        handles_guard.insert(id, handle);

        pf_debug!("accepted new client {}", id);
    }

    /// Removes handles of a left client session.
    fn remove_left_client(&mut self, id: ClientId) {
        let mut tx_replies_guard = self.tx_replies.guard();
        tx_replies_guard.remove(id);
        drop(tx_replies_guard);

        let mut handles_guard = self.servant_handles.guard();
        handles_guard.remove(id);
    }

    /// Starts the client acceptor task loop.
    async fn run(&mut self) {
        pf_debug!("client_acceptor task spawned");

        loop {
            tokio::select! {
                // new client connection
                accepted = self.client_listener.accept() => {
                    let Ok((stream, _addr)) = accepted else {
                        continue;
                    };
                    self.accept_new_client(stream).await;
                },

                // a client servant task exits
                id = self.rx_exit.recv() => {
                    if let Some(id) = id {
                        self.remove_left_client(id);
                    }
                },
            }
        }
    }
}

/// ApiHub per-client servant task.
struct ClientServantTask {
    id: ClientId,
    conn: TcpStream,

    rx_reply: mpsc::UnboundedReceiver<ApiReply>,
    tx_req: mpsc::UnboundedSender<(ClientId, ApiRequest)>,

    tx_exit: mpsc::UnboundedSender<ClientId>,
}

impl ClientServantTask {
    /// Starts the per-client servant task loop. Replies are taken only
    /// while the writer has no backlog; a goodbye reply closes the session
    /// once its frame has fully drained.
    async fn run(&mut self) {
        pf_debug!("client_servant task for {} spawned", self.id);

        let (mut conn_read, conn_write) = self.conn.split();
        let mut reader = FrameReader::new();
        let mut writer = FrameWriter::new();
        let mut leaving = false;

        loop {
            tokio::select! {
                // gets a reply to send back
                reply = self.rx_reply.recv(), if writer.is_idle() => {
                    let Some(reply) = reply else {
                        break;
                    };
                    leaving = reply == ApiReply::Leave;
                    if writer.feed(&reply).is_err() {
                        break;
                    }
                    match writer.flush(&conn_write) {
                        Ok(true) if leaving => break,
                        Ok(_) => {}
                        Err(_e) => break,
                    }
                },

                // draining a reply the socket could not take at once
                _ = conn_write.writable(), if !writer.is_idle() => {
                    match writer.flush(&conn_write) {
                        Ok(true) if leaving => break,
                        Ok(_) => {}
                        Err(_e) => break,
                    }
                },

                // receives new request from client
                req = reader.recv(&mut conn_read) => {
                    let Ok(req) = req else {
                        break; // client gone
                    };
                    if self.tx_req.send((self.id, req)).is_err() {
                        break; // hub has been dropped
                    }
                }
            }
        }

        if let Err(e) = self.tx_exit.send(self.id) {
            pf_error!("error sending exit signal for {}: {}", self.id, e);
        }
        pf_debug!("client_servant task for {} exited", self.id);
    }
}
