//! Client library: the transaction log, the node API stub, and the
//! endpoint types exposed to applications.

mod apistub;
mod endpoint;
mod tlog;

pub use apistub::ApiStub;
pub use endpoint::{OpFailure, RingClient, Transaction};
pub use tlog::{EntryStatus, TLog, TLogEntry, TxOp};
