//! State-change notifications
//!
//! The broker notifies a [`StateReporter`] after every session create,
//! upgrade, close and revocation, after quota requests and adjustments,
//! and after each policy update, so that an external status component can
//! regenerate its report. Formatting and transport of the report are up to
//! that component.
//!
//! [`StateJournal`] is a bounded in-memory reporter with monotonic entry ids.

use alloc::string::String;
use alloc::vec::Vec;
use core::cell::{Cell, RefCell};
use serde::{Deserialize, Serialize};

use zos_sandbox_core::{Quota, RequestId, ServerId, SessionCap};

use crate::server::SessionPhase;

/// Something observable changed.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum StateEvent {
    /// A child opened a session
    SessionCreated {
        /// Requesting child
        child: String,
        /// Service name
        service: String,
        /// New session
        cap: SessionCap,
        /// Quota donated to the provider
        donated: Quota,
    },
    /// A child extended a session
    SessionUpgraded {
        /// Requesting child
        child: String,
        /// Upgraded session
        cap: SessionCap,
        /// Total donation after the upgrade
        donated: Quota,
    },
    /// A child closed a session
    SessionClosed {
        /// Requesting child
        child: String,
        /// Closed session
        cap: SessionCap,
        /// Quota returned to the child
        returned: Quota,
    },
    /// Sessions of a departed provider were revoked
    SessionsRevoked {
        /// Affected child
        child: String,
        /// Departed provider
        server: ServerId,
        /// Number of revoked sessions
        count: usize,
    },
    /// A child asked for more quota
    ResourcesRequested {
        /// Requesting child
        child: String,
        /// Requested amount
        amount: Quota,
    },
    /// A child's assigned quota was raised or lowered
    QuotaAdjusted {
        /// Affected child
        child: String,
        /// Assigned quota after the adjustment
        assigned: Quota,
        /// Amount still demanded back from the child
        demanded: Quota,
    },
    /// A forwarded session request changed phase
    ForwardedPhase {
        /// Request
        id: RequestId,
        /// Requested service
        service: String,
        /// New phase
        phase: SessionPhase,
    },
    /// Routing policy was reapplied
    PolicyUpdated {
        /// Sessions closed because their route changed
        closed: usize,
        /// Pending requests retried
        retried: usize,
    },
}

/// Receiver of state-change notifications.
pub trait StateReporter {
    /// Called after the change took effect.
    fn state_changed(&self, event: &StateEvent);
}

/// One journal entry.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct JournalEntry {
    /// Monotonic entry id
    pub id: u64,
    /// What happened
    pub event: StateEvent,
}

/// Default journal capacity
pub const MAX_JOURNAL_ENTRIES: usize = 1024;

/// Append-only, bounded journal of state changes.
///
/// Oldest entries are dropped once the capacity is exceeded; ids keep
/// counting.
pub struct StateJournal {
    entries: RefCell<Vec<JournalEntry>>,
    next_id: Cell<u64>,
    capacity: usize,
}

impl StateJournal {
    /// Create an empty journal with the default capacity.
    pub fn new() -> Self {
        Self::with_capacity(MAX_JOURNAL_ENTRIES)
    }

    /// Create an empty journal keeping at most `capacity` entries.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: RefCell::new(Vec::new()),
            next_id: Cell::new(0),
            capacity,
        }
    }

    /// Append an event, returning its id.
    pub fn record(&self, event: StateEvent) -> u64 {
        let id = self.next_id.get();
        self.next_id.set(id + 1);

        let mut entries = self.entries.borrow_mut();
        entries.push(JournalEntry { id, event });
        if entries.len() > self.capacity {
            let drain_count = entries.len() - self.capacity;
            entries.drain(0..drain_count);
        }
        id
    }

    /// All retained entries, oldest first.
    pub fn entries(&self) -> Vec<JournalEntry> {
        self.entries.borrow().clone()
    }

    /// Entries with ids in `start_id..end_id`.
    pub fn get_range(&self, start_id: u64, end_id: u64) -> Vec<JournalEntry> {
        self.entries
            .borrow()
            .iter()
            .filter(|e| e.id >= start_id && e.id < end_id)
            .cloned()
            .collect()
    }

    /// The most recent `count` entries, newest first.
    pub fn get_recent(&self, count: usize) -> Vec<JournalEntry> {
        self.entries
            .borrow()
            .iter()
            .rev()
            .take(count)
            .cloned()
            .collect()
    }

    /// Number of retained entries.
    pub fn len(&self) -> usize {
        self.entries.borrow().len()
    }

    /// Check if the journal is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.borrow().is_empty()
    }

    /// Id the next entry will get.
    pub fn next_id(&self) -> u64 {
        self.next_id.get()
    }
}

impl Default for StateJournal {
    fn default() -> Self {
        Self::new()
    }
}

impl StateReporter for StateJournal {
    fn state_changed(&self, event: &StateEvent) {
        self.record(event.clone());
    }
}
