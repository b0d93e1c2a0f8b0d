//! Session records and the per-child session registry
//!
//! Sessions are registered under an id minted by the registry itself, the
//! id the child knows the session by. The provider's own capability is kept
//! in the record and only ever shown to that provider, so two providers
//! handing out the same number cannot collide. Environment capabilities are
//! reserved and never minted.
//!
//! Records live in a `Vec` sorted by id. Space for a new record is reserved
//! fallibly before anything is moved in, so an exhausted allocator surfaces
//! as [`RegistryError::OutOfMemory`] instead of an abort.

use alloc::rc::Rc;
use alloc::string::String;
use alloc::vec::Vec;
use thiserror::Error;

use zos_sandbox_core::{truncate, Quota, ServerId, SessionCap, IDENT_LEN};

use crate::route::Route;
use crate::service::ServiceRef;

/// Bookkeeping of one brokered session.
#[derive(Debug)]
pub struct SessionRecord {
    /// Id the child knows the session by
    pub cap: SessionCap,
    /// Capability handed out by the provider
    pub provider_cap: SessionCap,
    /// Service backing the session
    pub service: ServiceRef,
    /// Provider identity, copied so revocation works after abandonment
    pub server: ServerId,
    /// Service name as requested by the child
    pub service_name: String,
    /// Label the route was resolved with
    pub client_label: String,
    /// Label presented to the provider
    pub label: String,
    /// Quota held by the provider for this session
    pub donated: Quota,
    /// Debug label
    pub ident: String,
}

impl SessionRecord {
    /// Create a record for a session created at `route` under
    /// `provider_cap`. The id is assigned on registration.
    pub fn new(provider_cap: SessionCap, route: Route, donated: Quota) -> Self {
        let server = route.service.server();
        let service_name = String::from(route.service.name());
        Self {
            cap: SessionCap::INVALID,
            provider_cap,
            server,
            service: route.service,
            service_name,
            client_label: route.label.clone(),
            ident: truncate(&route.label, IDENT_LEN),
            label: route.label,
            donated,
        }
    }

    /// Record how the child asked for the session.
    pub fn requested_as(mut self, service_name: &str, client_label: &str) -> Self {
        self.service_name = String::from(service_name);
        self.client_label = String::from(client_label);
        self
    }

    /// Check if `route` still leads to this session's provider and label.
    pub fn routed_by(&self, route: &Route) -> bool {
        Rc::ptr_eq(&self.service, &route.service) && self.label == route.label
    }

    /// Account for a committed upgrade.
    ///
    /// Saturates instead of overflowing; the transfer itself already
    /// rejected amounts that do not fit the provider's balance.
    pub fn upgrade(&mut self, amount: Quota) {
        self.donated = self.donated.saturating_add(amount);
    }
}

/// Registry insertion failures
#[derive(Clone, Copy, Debug, PartialEq, Eq, Error)]
pub enum RegistryError {
    /// Configured session limit reached
    #[error("session registry full ({0} sessions)")]
    Full(usize),

    /// Id already registered
    #[error("duplicate session id {0:?}")]
    Duplicate(SessionCap),

    /// Id belongs to an environment session
    #[error("session id {0:?} is reserved")]
    Reserved(SessionCap),

    /// Allocator could not provide space for the record
    #[error("out of memory for session record")]
    OutOfMemory,
}

/// Sessions of one child.
#[derive(Debug)]
pub struct SessionRegistry {
    /// Sorted by `cap`
    records: Vec<SessionRecord>,
    reserved: Vec<SessionCap>,
    next_id: u64,
    limit: usize,
}

impl SessionRegistry {
    /// Create an empty registry holding at most `limit` records.
    pub fn new(limit: usize) -> Self {
        Self::with_reserved(limit, [])
    }

    /// Create an empty registry that never mints nor accepts `reserved`.
    pub fn with_reserved(limit: usize, reserved: impl IntoIterator<Item = SessionCap>) -> Self {
        Self {
            records: Vec::new(),
            reserved: reserved.into_iter().collect(),
            next_id: 1,
            limit,
        }
    }

    /// Register a session under a freshly minted id.
    ///
    /// The session must not be considered committed before this succeeds.
    pub fn register(&mut self, mut record: SessionRecord) -> Result<SessionCap, RegistryError> {
        if self.records.len() >= self.limit {
            return Err(RegistryError::Full(self.limit));
        }
        let cap = self.next_free();
        record.cap = cap;
        self.insert(record)?;
        self.next_id = cap.0.checked_add(1).unwrap_or(1);
        Ok(cap)
    }

    /// Register a session under the id already set in `record`.
    pub fn insert(&mut self, record: SessionRecord) -> Result<(), RegistryError> {
        if self.records.len() >= self.limit {
            return Err(RegistryError::Full(self.limit));
        }
        if !record.cap.is_valid() || self.reserved.contains(&record.cap) {
            return Err(RegistryError::Reserved(record.cap));
        }
        let pos = match self.position(record.cap) {
            Ok(_) => return Err(RegistryError::Duplicate(record.cap)),
            Err(pos) => pos,
        };
        self.records
            .try_reserve(1)
            .map_err(|_| RegistryError::OutOfMemory)?;
        self.records.insert(pos, record);
        Ok(())
    }

    /// Remove a session, handing the record back for destruction.
    pub fn remove(&mut self, cap: SessionCap) -> Option<SessionRecord> {
        let pos = self.position(cap).ok()?;
        Some(self.records.remove(pos))
    }

    /// Look up a session.
    pub fn get(&self, cap: SessionCap) -> Option<&SessionRecord> {
        let pos = self.position(cap).ok()?;
        self.records.get(pos)
    }

    /// Look up a session for modification.
    pub fn get_mut(&mut self, cap: SessionCap) -> Option<&mut SessionRecord> {
        let pos = self.position(cap).ok()?;
        self.records.get_mut(pos)
    }

    /// Check if `cap` is registered.
    pub fn contains(&self, cap: SessionCap) -> bool {
        self.position(cap).is_ok()
    }

    /// Check if `cap` is reserved for an environment session.
    pub fn is_reserved(&self, cap: SessionCap) -> bool {
        self.reserved.contains(&cap)
    }

    /// Iterate over all records in id order.
    pub fn iter(&self) -> impl Iterator<Item = &SessionRecord> {
        self.records.iter()
    }

    /// Iterate over the sessions provided by `server`.
    pub fn for_each_matching(&self, server: ServerId) -> impl Iterator<Item = &SessionRecord> {
        self.records.iter().filter(move |r| r.server == server)
    }

    /// Remove all sessions provided by `server`.
    pub fn remove_matching(&mut self, server: ServerId) -> Vec<SessionRecord> {
        let (removed, kept): (Vec<_>, Vec<_>) = core::mem::take(&mut self.records)
            .into_iter()
            .partition(|r| r.server == server);
        self.records = kept;
        removed
    }

    /// Remove all sessions.
    pub fn drain(&mut self) -> Vec<SessionRecord> {
        core::mem::take(&mut self.records)
    }

    /// Sum of all donations.
    pub fn total_donated(&self) -> Quota {
        self.records
            .iter()
            .fold(Quota::ZERO, |acc, r| acc.saturating_add(r.donated))
    }

    /// Number of sessions.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Check if no session is registered.
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Maximum number of sessions.
    pub fn limit(&self) -> usize {
        self.limit
    }

    fn position(&self, cap: SessionCap) -> Result<usize, usize> {
        self.records.binary_search_by_key(&cap, |r| r.cap)
    }

    /// Lowest unused id at or after `next_id`, wrapping past zero.
    fn next_free(&self) -> SessionCap {
        let mut id = self.next_id.max(1);
        loop {
            let cap = SessionCap(id);
            if !self.is_reserved(cap) && !self.contains(cap) {
                return cap;
            }
            id = id.checked_add(1).unwrap_or(1);
        }
    }
}
