//! Public interface to the ringstore core library, linked by both the
//! server executable and client programs.

#![allow(clippy::uninlined_format_args)]

#[macro_use]
mod utils;

mod client;
mod commit;
mod node;
mod paxos;
mod pubsub;
mod ring;

pub use client::{
    ApiStub, EntryStatus, OpFailure, RingClient, TLog, TLogEntry, Transaction,
    TxOp,
};
pub use commit::{CommitConfig, CommitNode, Decision, ItemId, PaxosId, TxId};
pub use node::{
    ApiReply, ApiRequest, ClientId, FailReason, NodeId, RequestId, Version,
    WireResult,
};
pub use paxos::Vote;
pub use ring::{RingKey, RingView};
pub use utils::{Bitmap, RingStoreError, Timer};

#[cfg(test)]
mod cluster_tests;
