//! Client-side transaction log (TLog).
//!
//! A transaction buffers its reads and writes locally; nothing touches the
//! ring until commit. Each entry records the version the operation was based
//! on, which is what the per-replica participants validate at commit time.

use serde::{Deserialize, Serialize};

use crate::node::Version;

/// Operation kind of a TLog entry.
#[derive(Debug, PartialEq, Eq, Copy, Clone, Serialize, Deserialize)]
pub enum TxOp {
    Read,
    Write,
}

/// Whether the operation succeeded when it was buffered. A failed read
/// poisons its key for the rest of the transaction (unless reverted) and
/// turns into an abort vote at commit validation.
#[derive(Debug, PartialEq, Eq, Copy, Clone, Serialize, Deserialize)]
pub enum EntryStatus {
    Ok,
    Fail,
}

/// One buffered operation of a transaction.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub struct TLogEntry {
    /// Operation kind.
    pub op: TxOp,

    /// Client-visible key.
    pub key: String,

    /// Value written (write) or read (successful read).
    pub value: Option<String>,

    /// Version this operation was based on; 0 if the key had never been
    /// read in this transaction.
    pub version_read: Version,

    /// Buffered outcome of the operation.
    pub status: EntryStatus,
}

/// Ordered per-transaction log of reads and writes. At most one effective
/// entry per key: a write replaces a prior entry on the same key (carrying
/// its `version_read` forward), so commit ships one item per touched key.
#[derive(Debug, PartialEq, Eq, Clone, Default, Serialize, Deserialize)]
pub struct TLog {
    entries: Vec<TLogEntry>,
}

impl TLog {
    /// Creates an empty log.
    pub fn new() -> Self {
        TLog {
            entries: Vec::new(),
        }
    }

    /// Looks up the effective entry for a key.
    pub fn find(&self, key: &str) -> Option<&TLogEntry> {
        self.entries.iter().find(|e| e.key == key)
    }

    /// Buffers the outcome of a fresh read on a key not yet in the log.
    pub fn record_read(
        &mut self,
        key: &str,
        found: Option<(String, Version)>,
    ) {
        debug_assert!(self.find(key).is_none());
        let entry = match found {
            Some((value, version)) => TLogEntry {
                op: TxOp::Read,
                key: key.into(),
                value: Some(value),
                version_read: version,
                status: EntryStatus::Ok,
            },
            None => TLogEntry {
                op: TxOp::Read,
                key: key.into(),
                value: None,
                version_read: 0,
                status: EntryStatus::Fail,
            },
        };
        self.entries.push(entry);
    }

    /// Buffers a write, replacing any prior entry on the same key. The new
    /// entry carries the replaced entry's base version forward; a write on
    /// an untouched key is based on version 0.
    pub fn record_write(&mut self, key: &str, value: &str) {
        let (version_read, poisoned) = match self.find(key) {
            Some(prior) => {
                (prior.version_read, prior.status == EntryStatus::Fail)
            }
            None => (0, false),
        };
        let entry = TLogEntry {
            op: TxOp::Write,
            key: key.into(),
            value: Some(value.into()),
            version_read,
            status: if poisoned {
                EntryStatus::Fail
            } else {
                EntryStatus::Ok
            },
        };

        if let Some(pos) = self.entries.iter().position(|e| e.key == key) {
            self.entries[pos] = entry;
        } else {
            self.entries.push(entry);
        }
    }

    /// Iterates over the effective entries in operation order.
    pub fn entries(&self) -> impl Iterator<Item = &TLogEntry> {
        self.entries.iter()
    }

    /// Number of effective entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True if no operation has been buffered.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// True if any entry is poisoned by a failed operation.
    pub fn poisoned(&self) -> bool {
        self.entries.iter().any(|e| e.status == EntryStatus::Fail)
    }
}

#[cfg(test)]
mod tlog_tests {
    use super::*;

    #[test]
    fn read_then_write_merges() {
        let mut tlog = TLog::new();
        tlog.record_read("k", Some(("old".into(), 3)));
        tlog.record_write("k", "new");
        assert_eq!(tlog.len(), 1);

        let entry = tlog.find("k").unwrap();
        assert_eq!(entry.op, TxOp::Write);
        assert_eq!(entry.value, Some("new".into()));
        assert_eq!(entry.version_read, 3);
        assert_eq!(entry.status, EntryStatus::Ok);
    }

    #[test]
    fn blind_write_bases_on_zero() {
        let mut tlog = TLog::new();
        tlog.record_write("k", "v");
        let entry = tlog.find("k").unwrap();
        assert_eq!(entry.version_read, 0);
        assert_eq!(entry.status, EntryStatus::Ok);
    }

    #[test]
    fn failed_read_poisons_key() {
        let mut tlog = TLog::new();
        tlog.record_read("k", None);
        assert!(tlog.poisoned());

        // a later write on the poisoned key stays poisoned
        tlog.record_write("k", "v");
        assert_eq!(tlog.find("k").unwrap().status, EntryStatus::Fail);
        assert!(tlog.poisoned());
    }

    #[test]
    fn entries_keep_operation_order() {
        let mut tlog = TLog::new();
        tlog.record_write("a", "1");
        tlog.record_read("b", Some(("2".into(), 1)));
        tlog.record_write("c", "3");
        let keys: Vec<&str> =
            tlog.entries().map(|e| e.key.as_str()).collect();
        assert_eq!(keys, vec!["a", "b", "c"]);
    }
}
