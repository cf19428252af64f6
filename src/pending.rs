//! Pending-call table.
//!
//! The bounded map from msgid to completion is the state that makes async
//! RPC reliable: every outstanding call is represented exactly once, every
//! consumed response removes exactly one entry, and a disconnect drains
//! whatever is left. The table is only ever touched behind the client's
//! lock, with no callback invoked while it is held.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use crate::error::Status;

/// Client-side completion, invoked at most once with the call outcome. The
/// payload view is only valid for the duration of the invocation.
pub type Completion = Box<dyn FnOnce(Status, &[u8]) + Send + 'static>;

/// State kept for one outstanding call.
pub struct PendingEntry {
    pub completion: Completion,
    pub deadline: Option<Duration>,
    pub inserted_at: Instant,
}

impl std::fmt::Debug for PendingEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingEntry")
            .field("deadline", &self.deadline)
            .field("inserted_at", &self.inserted_at)
            .finish()
    }
}

/// Bounded map from msgid to [`PendingEntry`], fused with msgid allocation.
///
/// Ids increment monotonically, skip zero (reserved for oneway and
/// broadcast frames), and wrap modulo 2^32. Insertion fails when the table
/// is at capacity or when the wrapped candidate id is still live; either
/// way nothing is partially recorded.
pub struct PendingTable {
    capacity: usize,
    next_msgid: u32,
    entries: HashMap<u32, PendingEntry>,
}

impl PendingTable {
    pub fn new(capacity: usize) -> PendingTable {
        PendingTable {
            capacity,
            next_msgid: 1,
            entries: HashMap::with_capacity(capacity.min(1024)),
        }
    }

    /// Allocate the next msgid and record `entry` under it. On failure the
    /// entry is handed back untouched so the caller decides its fate.
    pub fn insert(&mut self, entry: PendingEntry) -> Result<u32, PendingEntry> {
        if self.entries.len() >= self.capacity {
            return Err(entry);
        }
        let msgid = self.next_msgid;
        self.next_msgid = match self.next_msgid.wrapping_add(1) {
            0 => 1,
            n => n,
        };
        if self.entries.contains_key(&msgid) {
            // Wrap collision with a still-live call.
            return Err(entry);
        }
        self.entries.insert(msgid, entry);
        Ok(msgid)
    }

    /// Remove and return the entry for `msgid`. Idempotent: unknown ids
    /// (already completed, timed out, or never allocated) return `None`.
    pub fn take(&mut self, msgid: u32) -> Option<PendingEntry> {
        self.entries.remove(&msgid)
    }

    /// Empty the table, returning every outstanding entry.
    pub fn drain(&mut self) -> Vec<(u32, PendingEntry)> {
        self.entries.drain().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    #[cfg(test)]
    fn set_next_msgid(&mut self, msgid: u32) {
        self.next_msgid = msgid;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry() -> PendingEntry {
        PendingEntry {
            completion: Box::new(|_, _| {}),
            deadline: None,
            inserted_at: Instant::now(),
        }
    }

    #[test]
    fn allocates_monotonic_ids_from_one() {
        let mut table = PendingTable::new(8);
        assert_eq!(table.insert(entry()).unwrap(), 1);
        assert_eq!(table.insert(entry()).unwrap(), 2);
        assert_eq!(table.insert(entry()).unwrap(), 3);
        assert_eq!(table.len(), 3);
    }

    #[test]
    fn insert_fails_at_capacity_without_recording() {
        let mut table = PendingTable::new(2);
        table.insert(entry()).unwrap();
        table.insert(entry()).unwrap();
        assert!(table.insert(entry()).is_err());
        assert_eq!(table.len(), 2);
        // Draining one slot makes insertion succeed again.
        assert!(table.take(1).is_some());
        assert!(table.insert(entry()).is_ok());
    }

    #[test]
    fn take_is_idempotent_for_unknown_ids() {
        let mut table = PendingTable::new(4);
        let msgid = table.insert(entry()).unwrap();
        assert!(table.take(msgid).is_some());
        assert!(table.take(msgid).is_none());
        assert!(table.take(999).is_none());
    }

    #[test]
    fn drain_empties_the_table() {
        let mut table = PendingTable::new(4);
        for _ in 0..4 {
            table.insert(entry()).unwrap();
        }
        let drained = table.drain();
        assert_eq!(drained.len(), 4);
        assert!(table.is_empty());
    }

    #[test]
    fn msgid_wraps_and_skips_zero() {
        let mut table = PendingTable::new(4);
        table.set_next_msgid(u32::MAX);
        assert_eq!(table.insert(entry()).unwrap(), u32::MAX);
        // Zero is reserved; the counter wraps straight to one.
        assert_eq!(table.insert(entry()).unwrap(), 1);
    }

    #[test]
    fn wrap_collision_with_live_entry_fails() {
        let mut table = PendingTable::new(4);
        let live = table.insert(entry()).unwrap();
        assert_eq!(live, 1);
        table.set_next_msgid(1);
        assert!(table.insert(entry()).is_err());
        assert_eq!(table.len(), 1);
    }
}
