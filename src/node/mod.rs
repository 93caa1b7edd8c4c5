//! Node-local functionality modules: the hosted replica store, the client
//! API hub, the node-to-node transport, and the failure detector.

mod external;
mod failure;
mod store;
mod transport;

pub use external::{
    ApiReply, ApiRequest, ClientId, FailReason, RequestId, WireResult,
};
pub use store::Version;

pub(crate) use external::ApiHub;
pub(crate) use failure::{FailureDetector, FdEvent};
pub(crate) use store::KvStore;
pub(crate) use transport::TransportHub;

/// Node ID type: the position index of a node on the ring.
pub type NodeId = u8;
