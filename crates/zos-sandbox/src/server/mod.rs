//! Server - nested session broker
//!
//! When the sandbox itself is a child of another sandbox, session requests
//! of its own parent's other clients may be routed into it. Those requests
//! arrive as declarative records ([`SessionRequest`]) and are driven to
//! completion by the [`Server`]. Unlike the synchronous [`Child`] path, the
//! chosen provider may still be starting up, so each request is tracked as
//! a [`ForwardedSession`] moving through the phases of [`SessionPhase`].
//!
//! The server keeps a fixed bookkeeping cost of every donation and forwards
//! the rest. Requests whose donation does not cover that cost are rejected
//! before any provider is contacted.
//!
//! Whenever the routing policy changes, every forwarded session is
//! re-resolved. A session whose route changed is closed, never migrated.
//!
//! [`Child`]: crate::child::Child

mod requests;
mod state;

pub use state::{ForwardedSession, SessionPhase, SessionRequest, SessionResponse};

use alloc::collections::BTreeMap;
use alloc::rc::Rc;
use alloc::vec::Vec;
use core::cell::RefCell;
use log::Level;

use zos_sandbox_core::{Quota, QuotaAccount, RequestId};

use crate::report::{StateEvent, StateReporter};
use crate::route::RouteResolver;

/// Driver of all forwarded session requests.
pub struct Server {
    resolver: Rc<RefCell<RouteResolver>>,
    /// Account of this sandbox; retains the bookkeeping cost
    account: Rc<QuotaAccount>,
    /// Account of the requesting side
    donor: Rc<QuotaAccount>,
    session_cost: Quota,
    sessions: BTreeMap<RequestId, ForwardedSession>,
    reporter: Option<Rc<dyn StateReporter>>,
    verbose: bool,
}

impl Server {
    /// Create a server without any forwarded sessions.
    pub fn new(
        resolver: Rc<RefCell<RouteResolver>>,
        account: Rc<QuotaAccount>,
        donor: Rc<QuotaAccount>,
        session_cost: Quota,
        reporter: Option<Rc<dyn StateReporter>>,
    ) -> Self {
        Self {
            resolver,
            account,
            donor,
            session_cost,
            sessions: BTreeMap::new(),
            reporter,
            verbose: false,
        }
    }

    /// Log session traffic at `info` instead of `debug`.
    pub fn set_verbose(&mut self, verbose: bool) {
        self.verbose = verbose;
    }

    /// Bookkeeping cost retained per session.
    pub fn session_cost(&self) -> Quota {
        self.session_cost
    }

    /// Account of this sandbox.
    pub fn account(&self) -> &QuotaAccount {
        &self.account
    }

    /// Process a batch of requests in order.
    ///
    /// Requests that cannot be answered yet (target not present, provider
    /// deferred) produce no response now; their answer comes from a later
    /// completion callback or policy update.
    pub fn handle_session_requests(&mut self, requests: &[SessionRequest]) -> Vec<SessionResponse> {
        let mut responses = Vec::new();
        for request in requests {
            let response = match request {
                SessionRequest::Create { id, service, args } => {
                    self.handle_create(*id, service, args)
                }
                SessionRequest::Upgrade { id, args } => self.handle_upgrade(*id, args),
                SessionRequest::Close { id } => self.handle_close(*id),
            };
            responses.extend(response);
        }
        responses
    }

    /// Re-evaluate all forwarded sessions against the current policy.
    ///
    /// Pending requests are retried. Sessions whose route no longer
    /// resolves, or resolves to a different provider or label, are closed.
    pub fn apply_updated_policy(&mut self) -> Vec<SessionResponse> {
        let ids: Vec<RequestId> = self.sessions.keys().copied().collect();
        let mut responses = Vec::new();
        let mut closed = 0;
        let mut retried = 0;

        for id in ids {
            let Some(session) = self.sessions.get(&id) else {
                continue;
            };

            if session.is_pending() {
                retried += 1;
                responses.extend(self.try_create(id));
                continue;
            }

            let awaiting_create = session.phase == SessionPhase::CreateRequested;
            if !session.is_live() && !awaiting_create {
                continue;
            }
            let Some(current) = &session.route else {
                continue;
            };

            let resolved = self
                .resolver
                .borrow()
                .resolve(&session.service_name, session.args.label());
            let unchanged = match resolved {
                Ok(route) => route.same_as(current),
                Err(_) => false,
            };
            if unchanged {
                continue;
            }

            self.log_session(format_args!(
                "closing session {:?} of '{}': route changed",
                id, session.service_name
            ));
            closed += 1;
            if awaiting_create {
                // Closed once the provider completes the creation
                if let Some(session) = self.sessions.get_mut(&id) {
                    session.phase = SessionPhase::CloseRequested;
                }
            } else {
                responses.extend(self.begin_close(id));
            }
        }

        log::debug!(
            "policy applied: {} session(s) closed, {} request(s) retried",
            closed,
            retried
        );
        self.report(StateEvent::PolicyUpdated { closed, retried });
        responses
    }

    /// Forwarded session by request id.
    pub fn session(&self, id: RequestId) -> Option<&ForwardedSession> {
        self.sessions.get(&id)
    }

    /// Number of forwarded sessions, pending ones included.
    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Visit every forwarded session.
    pub fn for_each_session<F: FnMut(&ForwardedSession)>(&self, mut f: F) {
        for session in self.sessions.values() {
            f(session);
        }
    }

    fn report(&self, event: StateEvent) {
        if let Some(reporter) = &self.reporter {
            reporter.state_changed(&event);
        }
    }

    fn report_phase(&self, id: RequestId, service: &str, phase: SessionPhase) {
        self.report(StateEvent::ForwardedPhase {
            id,
            service: service.into(),
            phase,
        });
    }

    fn log_session(&self, args: core::fmt::Arguments<'_>) {
        let level = if self.verbose { Level::Info } else { Level::Debug };
        log::log!(level, "{}", args);
    }
}
