//! Client endpoint: single-operation calls, buffered transactions, and the
//! pub/sub calls, over one node API connection.

use std::fmt;
use std::net::SocketAddr;

use crate::client::{ApiStub, EntryStatus, TLog};
use crate::node::{
    ApiReply, ApiRequest, ClientId, FailReason, RequestId, Version, WireResult,
};
use crate::utils::RingStoreError;

/// Tagged failure of a client operation.
#[derive(Debug, PartialEq, Eq, Copy, Clone)]
pub enum OpFailure {
    /// Key has no committed version, or subscriber absent.
    NotFound,

    /// A dependent operation did not respond within its bound; the caller
    /// may retry.
    Timeout,

    /// Transaction validated to abort; definitive.
    Abort,

    /// Transport-level failure; retryable after reconnection.
    Connection,

    /// Unexpected reply shape; fatal for the operation.
    Unknown,
}

impl fmt::Display for OpFailure {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            OpFailure::NotFound => write!(f, "not_found"),
            OpFailure::Timeout => write!(f, "timeout"),
            OpFailure::Abort => write!(f, "abort"),
            OpFailure::Connection => write!(f, "connection"),
            OpFailure::Unknown => write!(f, "unknown"),
        }
    }
}

impl From<FailReason> for OpFailure {
    fn from(reason: FailReason) -> Self {
        match reason {
            FailReason::NotFound => OpFailure::NotFound,
            FailReason::Timeout => OpFailure::Timeout,
            FailReason::Abort => OpFailure::Abort,
            FailReason::Unknown => OpFailure::Unknown,
        }
    }
}

/// Client handle to the ring, connected to one node's API.
pub struct RingClient {
    stub: ApiStub,
    next_req: RequestId,
}

impl RingClient {
    /// Connects to a node's client API address.
    pub async fn new_and_connect(
        addr: SocketAddr,
    ) -> Result<Self, RingStoreError> {
        let stub = ApiStub::new_by_connect(addr).await?;
        pf_debug!("connected to node api as client {}", stub.id);
        Ok(RingClient { stub, next_req: 0 })
    }

    /// Session ID assigned by the connected node.
    pub fn id(&self) -> ClientId {
        self.stub.id
    }

    /// Issues one request and waits for its reply, skipping stale replies
    /// of requests already given up on.
    async fn roundtrip(
        &mut self,
        build: impl FnOnce(RequestId) -> ApiRequest,
    ) -> Result<WireResult, OpFailure> {
        self.next_req += 1;
        let id = self.next_req;
        let req = build(id);

        let mut sent = self
            .stub
            .send_req(Some(&req))
            .map_err(|_| OpFailure::Connection)?;
        while !sent {
            sent = self
                .stub
                .send_req(None)
                .map_err(|_| OpFailure::Connection)?;
        }

        loop {
            match self.stub.recv_reply().await {
                Ok(ApiReply::Reply { id: rid, result }) if rid == id => {
                    return Ok(result);
                }
                Ok(_) => continue, // stale or out-of-band reply
                Err(_) => return Err(OpFailure::Connection),
            }
        }
    }

    /// Quorum read of one key, surfacing the committed version alongside
    /// the value. Absent keys resolve to `Ok(None)`.
    pub async fn read_versioned(
        &mut self,
        key: &str,
    ) -> Result<Option<(String, Version)>, OpFailure> {
        let key = key.to_string();
        match self
            .roundtrip(move |id| ApiRequest::Read { id, key })
            .await?
        {
            WireResult::Value { value, version } => Ok(Some((value, version))),
            WireResult::Fail {
                reason: FailReason::NotFound,
            } => Ok(None),
            WireResult::Fail { reason } => Err(reason.into()),
            _ => Err(OpFailure::Unknown),
        }
    }

    /// Reads the committed value under a key.
    pub async fn read(&mut self, key: &str) -> Result<String, OpFailure> {
        match self.read_versioned(key).await? {
            Some((value, _)) => Ok(value),
            None => Err(OpFailure::NotFound),
        }
    }

    /// Writes a value under a key: a quorum version read followed by a
    /// one-entry transaction commit.
    pub async fn write(
        &mut self,
        key: &str,
        value: &str,
    ) -> Result<(), OpFailure> {
        let mut tlog = TLog::new();
        if let Some(found) = self.read_versioned(key).await? {
            tlog.record_read(key, Some(found));
        }
        tlog.record_write(key, value);
        self.commit_tlog(tlog).await
    }

    /// Starts a buffered transaction on this connection.
    pub fn tx_start(&mut self) -> Transaction<'_> {
        Transaction {
            client: self,
            tlog: TLog::new(),
            undo: None,
        }
    }

    /// Publishes content under a topic.
    pub async fn publish(
        &mut self,
        topic: &str,
        content: &str,
    ) -> Result<(), OpFailure> {
        let (topic, content) = (topic.to_string(), content.to_string());
        expect_ok(
            self.roundtrip(move |id| ApiRequest::Publish {
                id,
                topic,
                content,
            })
            .await?,
        )
    }

    /// Subscribes a url to a topic.
    pub async fn subscribe(
        &mut self,
        topic: &str,
        url: &str,
    ) -> Result<(), OpFailure> {
        let (topic, url) = (topic.to_string(), url.to_string());
        expect_ok(
            self.roundtrip(move |id| ApiRequest::Subscribe { id, topic, url })
                .await?,
        )
    }

    /// Unsubscribes a url from a topic.
    pub async fn unsubscribe(
        &mut self,
        topic: &str,
        url: &str,
    ) -> Result<(), OpFailure> {
        let (topic, url) = (topic.to_string(), url.to_string());
        expect_ok(
            self.roundtrip(move |id| ApiRequest::Unsubscribe {
                id,
                topic,
                url,
            })
            .await?,
        )
    }

    /// Lists the subscribers of a topic.
    pub async fn get_subscribers(
        &mut self,
        topic: &str,
    ) -> Result<Vec<String>, OpFailure> {
        let topic = topic.to_string();
        match self
            .roundtrip(move |id| ApiRequest::GetSubscribers { id, topic })
            .await?
        {
            WireResult::Subscribers { urls } => Ok(urls),
            WireResult::Fail { reason } => Err(reason.into()),
            _ => Err(OpFailure::Unknown),
        }
    }

    /// Leaves the session gracefully.
    pub async fn leave(&mut self) -> Result<(), RingStoreError> {
        let mut sent = self.stub.send_req(Some(&ApiRequest::Leave))?;
        while !sent {
            sent = self.stub.send_req(None)?;
        }
        while self.stub.recv_reply().await? != ApiReply::Leave {}
        Ok(())
    }

    async fn commit_tlog(&mut self, tlog: TLog) -> Result<(), OpFailure> {
        expect_ok(
            self.roundtrip(move |id| ApiRequest::Commit { id, tlog })
                .await?,
        )
    }
}

fn expect_ok(result: WireResult) -> Result<(), OpFailure> {
    match result {
        WireResult::Ok => Ok(()),
        WireResult::Fail { reason } => Err(reason.into()),
        _ => Err(OpFailure::Unknown),
    }
}

/// A buffered transaction on one client connection. Reads and writes touch
/// the ring at most once per key; commit submits the frozen log to the
/// connected node's transaction manager.
pub struct Transaction<'c> {
    client: &'c mut RingClient,
    tlog: TLog,
    undo: Option<TLog>,
}

impl Transaction<'_> {
    /// Transactional read. A prior entry on the key serves the read from
    /// the log without touching the ring; a fresh key issues a quorum read
    /// and buffers the outcome. A failed read poisons the key for the rest
    /// of the transaction unless reverted.
    pub async fn read(&mut self, key: &str) -> Result<String, OpFailure> {
        self.undo = Some(self.tlog.clone());

        if let Some(entry) = self.tlog.find(key) {
            if entry.status == EntryStatus::Fail {
                return Err(OpFailure::NotFound);
            }
            return entry.value.clone().ok_or(OpFailure::Unknown);
        }

        match self.client.read_versioned(key).await {
            Ok(Some((value, version))) => {
                self.tlog
                    .record_read(key, Some((value.clone(), version)));
                Ok(value)
            }
            Ok(None) => {
                self.tlog.record_read(key, None);
                Err(OpFailure::NotFound)
            }
            Err(failure) => {
                self.tlog.record_read(key, None);
                Err(failure)
            }
        }
    }

    /// Transactional write: buffered locally, validated at commit.
    pub async fn write(
        &mut self,
        key: &str,
        value: &str,
    ) -> Result<(), OpFailure> {
        self.undo = Some(self.tlog.clone());
        self.tlog.record_write(key, value);

        match self.tlog.find(key) {
            Some(entry) if entry.status == EntryStatus::Fail => {
                // key was poisoned by an earlier failed operation
                Err(OpFailure::Abort)
            }
            _ => Ok(()),
        }
    }

    /// Restores the log as it was before the last operation. Works exactly
    /// once: a second call without an intervening operation does nothing.
    pub fn revert_last_op(&mut self) {
        if let Some(prev) = self.undo.take() {
            self.tlog = prev;
        }
    }

    /// Submits the frozen log for commit. An empty transaction commits
    /// trivially without touching the ring.
    pub async fn commit(self) -> Result<(), OpFailure> {
        if self.tlog.is_empty() {
            return Ok(());
        }
        self.client.commit_tlog(self.tlog).await
    }

    /// Abandons the transaction; nothing was modified on the ring.
    pub fn abort(self) {}

    /// The buffered log so far.
    pub fn log(&self) -> &TLog {
        &self.tlog
    }
}
