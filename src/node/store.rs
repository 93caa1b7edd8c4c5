//! Per-node replica store: the key-value records this node hosts, one per
//! replica ring key, with the lock state used by commit validation.
//!
//! The store is owned exclusively by the node actor playing transaction
//! participant for its keys; concurrent transactions serialize here through
//! message ordering.

use std::collections::HashMap;

use crate::client::{EntryStatus, TLogEntry, TxOp};
use crate::paxos::Vote;
use crate::ring::RingKey;

/// Committed version number of a record. Version 0 means "never committed";
/// the first successful write commits version 1.
pub type Version = u64;

/// One hosted replica record.
#[derive(Debug, PartialEq, Eq, Clone, Default)]
pub(crate) struct RepRecord {
    /// Latest committed value.
    pub(crate) value: String,

    /// Latest committed version; strictly increasing across writes.
    pub(crate) version: Version,

    /// Tentative write lock held by an in-flight transaction.
    pub(crate) write_lock: bool,

    /// Count of read locks held by in-flight transactions.
    pub(crate) read_lock: u32,
}

/// The replica records hosted by this node, keyed by replica ring key.
#[derive(Debug, Default)]
pub(crate) struct KvStore {
    recs: HashMap<RingKey, RepRecord>,
}

impl KvStore {
    pub(crate) fn new() -> Self {
        KvStore {
            recs: HashMap::new(),
        }
    }

    /// Looks up the committed value and version under a replica key.
    pub(crate) fn lookup(&self, key: RingKey) -> Option<(&str, Version)> {
        self.recs
            .get(&key)
            .filter(|rec| rec.version > 0)
            .map(|rec| (rec.value.as_str(), rec.version))
    }

    /// Committed version under a replica key; 0 if never written.
    pub(crate) fn version_of(&self, key: RingKey) -> Version {
        self.recs.get(&key).map_or(0, |rec| rec.version)
    }

    /// Validates a transaction log entry against this replica and takes the
    /// tentative lock iff the entry validates. A read is prepared iff the
    /// stored version equals the version the transaction read; a write is
    /// prepared iff the versions match and no write lock is held.
    pub(crate) fn validate_and_lock(
        &mut self,
        key: RingKey,
        entry: &TLogEntry,
    ) -> Vote {
        if entry.status == EntryStatus::Fail {
            return Vote::Abort;
        }

        match entry.op {
            TxOp::Read => match self.recs.get_mut(&key) {
                Some(rec) if rec.version == entry.version_read => {
                    rec.read_lock += 1;
                    Vote::Prepared
                }
                _ => Vote::Abort,
            },
            TxOp::Write => {
                let rec = self.recs.entry(key).or_default();
                if rec.version == entry.version_read && !rec.write_lock {
                    rec.write_lock = true;
                    Vote::Prepared
                } else {
                    if rec.version == 0 && !rec.write_lock && rec.read_lock == 0
                    {
                        // tentative record created just for this check
                        self.recs.remove(&key);
                    }
                    Vote::Abort
                }
            }
        }
    }

    /// Releases the lock taken by a prepared entry without applying it.
    pub(crate) fn release_lock(&mut self, key: RingKey, op: TxOp) {
        let drop_rec = match self.recs.get_mut(&key) {
            Some(rec) => {
                match op {
                    TxOp::Read => rec.read_lock = rec.read_lock.saturating_sub(1),
                    TxOp::Write => rec.write_lock = false,
                }
                rec.version == 0 && !rec.write_lock && rec.read_lock == 0
            }
            None => false,
        };
        if drop_rec {
            // never-committed record left over from an aborted first write
            self.recs.remove(&key);
        }
    }

    /// Applies a committed write, bumping the version and releasing the
    /// write lock.
    pub(crate) fn apply_write(
        &mut self,
        key: RingKey,
        value: &str,
        new_version: Version,
    ) {
        let rec = self.recs.entry(key).or_default();
        debug_assert!(new_version > rec.version);
        rec.value = value.into();
        rec.version = new_version;
        rec.write_lock = false;
    }

    /// Number of records hosted (committed or tentatively locked).
    pub(crate) fn num_records(&self) -> usize {
        self.recs.len()
    }
}

#[cfg(test)]
mod store_tests {
    use super::*;

    fn read_entry(version_read: Version) -> TLogEntry {
        TLogEntry {
            op: TxOp::Read,
            key: "k".into(),
            value: None,
            version_read,
            status: EntryStatus::Ok,
        }
    }

    fn write_entry(version_read: Version) -> TLogEntry {
        TLogEntry {
            op: TxOp::Write,
            key: "k".into(),
            value: Some("v".into()),
            version_read,
            status: EntryStatus::Ok,
        }
    }

    #[test]
    fn first_write_then_read() {
        let mut store = KvStore::new();
        assert_eq!(store.lookup(7), None);

        assert_eq!(store.validate_and_lock(7, &write_entry(0)), Vote::Prepared);
        store.apply_write(7, "v", 1);
        assert_eq!(store.lookup(7), Some(("v", 1)));

        assert_eq!(store.validate_and_lock(7, &read_entry(1)), Vote::Prepared);
        store.release_lock(7, TxOp::Read);
        assert_eq!(store.lookup(7), Some(("v", 1)));
    }

    #[test]
    fn stale_version_aborts() {
        let mut store = KvStore::new();
        store.apply_write(7, "v", 1);
        assert_eq!(store.validate_and_lock(7, &read_entry(0)), Vote::Abort);
        assert_eq!(store.validate_and_lock(7, &write_entry(0)), Vote::Abort);
        assert_eq!(store.validate_and_lock(7, &write_entry(1)), Vote::Prepared);
    }

    #[test]
    fn write_lock_conflict() {
        let mut store = KvStore::new();
        store.apply_write(7, "v", 1);

        assert_eq!(store.validate_and_lock(7, &write_entry(1)), Vote::Prepared);
        // a concurrent transaction based on the same version loses the lock
        assert_eq!(store.validate_and_lock(7, &write_entry(1)), Vote::Abort);

        // loser released nothing; winner applies and bumps the version
        store.apply_write(7, "w", 2);
        assert_eq!(store.lookup(7), Some(("w", 2)));
        assert_eq!(store.validate_and_lock(7, &write_entry(1)), Vote::Abort);
    }

    #[test]
    fn aborted_first_write_leaves_no_record() {
        let mut store = KvStore::new();
        assert_eq!(store.validate_and_lock(7, &write_entry(0)), Vote::Prepared);
        assert_eq!(store.num_records(), 1);

        store.release_lock(7, TxOp::Write);
        assert_eq!(store.num_records(), 0);
        assert_eq!(store.lookup(7), None);
    }

    #[test]
    fn failed_entry_always_aborts() {
        let mut store = KvStore::new();
        let mut entry = write_entry(0);
        entry.status = EntryStatus::Fail;
        assert_eq!(store.validate_and_lock(7, &entry), Vote::Abort);
        assert_eq!(store.num_records(), 0);
    }

    #[test]
    fn read_locks_count() {
        let mut store = KvStore::new();
        store.apply_write(7, "v", 1);

        assert_eq!(store.validate_and_lock(7, &read_entry(1)), Vote::Prepared);
        assert_eq!(store.validate_and_lock(7, &read_entry(1)), Vote::Prepared);
        store.release_lock(7, TxOp::Read);
        store.release_lock(7, TxOp::Read);
        // extra release is harmless
        store.release_lock(7, TxOp::Read);
        assert_eq!(store.lookup(7), Some(("v", 1)));
    }
}
