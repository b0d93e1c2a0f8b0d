//! Child - supervisor-side session broker of one subordinate component
//!
//! Every session a child opens is paid for by the child. The donation moves
//! in two hops, child account → broker (reference) account → provider
//! account, each hop guarded by a [`QuotaTransfer`]. Both guards are
//! acknowledged only after the provider created the session and the record
//! is registered, so every failure leaves all three accounts as they were.
//!
//! Closing a session walks the same path backwards. Reclaiming the donation
//! from the provider is best effort: a provider that does not give the
//! quota back is logged as misbehaving, but the local record is removed
//! regardless so that one bad server cannot wedge the supervisor.
//!
//! The child knows its sessions by ids minted in its own registry. The
//! capability a provider handed out stays with the record and is only ever
//! shown back to that provider.
//!
//! # Environment sessions
//!
//! The PD, CPU, RAM and region-map sessions a child is created with are
//! handed out under well-known names, may be upgraded, and are only torn
//! down together with the child itself. Their capabilities are reserved in
//! the registry and never minted for brokered sessions.
//!
//! # Policy updates
//!
//! After the routing policy changed, [`Child::apply_updated_policy`]
//! re-resolves every session the way it was originally requested and closes
//! those that would now reach a different provider or label.

use alloc::rc::Rc;
use alloc::string::{String, ToString};
use alloc::vec::Vec;
use core::cell::{Cell, RefCell};
use log::Level;
use spin::Mutex;

use zos_sandbox_core::{
    prefixed_label, BrokerError, Currency, Quota, QuotaAccount, QuotaError, QuotaTransfer,
    ServerId, SessionArgs, SessionCap, MAX_ARGS_LEN, MAX_SERVICE_NAME_LEN,
};

use crate::registry::{SessionRecord, SessionRegistry};
use crate::report::{StateEvent, StateReporter};
use crate::route::{Route, RouteResolver};
use crate::service::{CreateResponse, ServiceRef, SessionRoot, UpgradeResponse};

mod resources;

pub use resources::{Downgrade, PRESERVED_QUOTA};

// ============================================================================
// Environment sessions
// ============================================================================

/// The mandatory sessions every child is created with
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EnvKind {
    /// Protection domain
    Pd,
    /// CPU
    Cpu,
    /// RAM
    Ram,
    /// Region map
    Rm,
}

impl EnvKind {
    /// All kinds
    pub const ALL: [EnvKind; 4] = [EnvKind::Pd, EnvKind::Cpu, EnvKind::Ram, EnvKind::Rm];

    /// Name under which the session is requested
    pub fn service_name(&self) -> &'static str {
        match self {
            EnvKind::Pd => "Env::pd_session",
            EnvKind::Cpu => "Env::cpu_session",
            EnvKind::Ram => "Env::ram_session",
            EnvKind::Rm => "Env::rm_session",
        }
    }

    /// Look up a kind by requested name.
    pub fn from_name(name: &str) -> Option<EnvKind> {
        EnvKind::ALL.into_iter().find(|k| k.service_name() == name)
    }
}

/// One environment session
#[derive(Clone, Debug)]
pub struct EnvSession {
    /// Session capability
    pub cap: SessionCap,
    /// Backing service, target of upgrades
    pub service: ServiceRef,
}

/// The four environment sessions of a child
#[derive(Clone, Debug)]
pub struct EnvSessions {
    /// Protection domain
    pub pd: EnvSession,
    /// CPU
    pub cpu: EnvSession,
    /// RAM
    pub ram: EnvSession,
    /// Region map
    pub rm: EnvSession,
}

impl EnvSessions {
    /// Session of the given kind.
    pub fn get(&self, kind: EnvKind) -> &EnvSession {
        match kind {
            EnvKind::Pd => &self.pd,
            EnvKind::Cpu => &self.cpu,
            EnvKind::Ram => &self.ram,
            EnvKind::Rm => &self.rm,
        }
    }

    /// Capabilities of all four sessions.
    pub fn caps(&self) -> [SessionCap; 4] {
        EnvKind::ALL.map(|k| self.get(k).cap)
    }

    /// Environment session with capability `cap`.
    pub fn find(&self, cap: SessionCap) -> Option<&EnvSession> {
        EnvKind::ALL
            .into_iter()
            .map(|k| self.get(k))
            .find(|s| s.cap == cap)
    }

    /// Check if `cap` is an environment session.
    pub fn contains(&self, cap: SessionCap) -> bool {
        self.find(cap).is_some()
    }
}

// ============================================================================
// Policy
// ============================================================================

/// Routing and announcement decisions for one child.
pub trait ChildPolicy {
    /// Name of the child.
    fn name(&self) -> &str;

    /// Rewrite the arguments of a session request before anything else
    /// looks at them.
    fn filter_session_args(&self, _service: &str, _args: &mut SessionArgs) {}

    /// Pick the provider of a session request.
    fn resolve_session_request(&self, service: &str, label: &str) -> Result<Route, BrokerError>;

    /// The child announces a service it provides.
    fn announce_service(&self, service: &str, root: Rc<dyn SessionRoot>) -> Result<(), BrokerError>;
}

/// Policy backed by the sandbox-wide route resolver.
///
/// Labels are prefixed with the child name so providers see who is asking.
pub struct SandboxPolicy {
    name: String,
    server: ServerId,
    resolver: Rc<RefCell<RouteResolver>>,
}

impl SandboxPolicy {
    /// Create the policy of child `name`, known to providers as `server`.
    pub fn new(
        name: impl Into<String>,
        server: ServerId,
        resolver: Rc<RefCell<RouteResolver>>,
    ) -> Self {
        Self {
            name: name.into(),
            server,
            resolver,
        }
    }
}

impl ChildPolicy for SandboxPolicy {
    fn name(&self) -> &str {
        &self.name
    }

    fn filter_session_args(&self, _service: &str, args: &mut SessionArgs) {
        let label = prefixed_label(&self.name, args.label());
        args.set_label(&label);
    }

    fn resolve_session_request(&self, service: &str, label: &str) -> Result<Route, BrokerError> {
        self.resolver.borrow().resolve(service, label)
    }

    fn announce_service(
        &self,
        service: &str,
        root: Rc<dyn SessionRoot>,
    ) -> Result<(), BrokerError> {
        self.resolver.borrow().announce(self.server, service, root)
    }
}

// ============================================================================
// Child
// ============================================================================

/// Construction parameters of a [`Child`]
pub struct ChildSetup {
    /// Identity of the child as a provider
    pub id: ServerId,
    /// Account the child pays from
    pub account: Rc<QuotaAccount>,
    /// Broker account all donations pass through
    pub ref_account: Rc<QuotaAccount>,
    /// Routing decisions
    pub policy: Rc<dyn ChildPolicy>,
    /// Environment sessions
    pub env: EnvSessions,
    /// Registry capacity
    pub max_sessions: usize,
    /// Receiver of state changes
    pub reporter: Option<Rc<dyn StateReporter>>,
    /// Log session traffic at `info`
    pub verbose: bool,
}

/// Session broker of one subordinate component.
pub struct Child {
    name: String,
    id: ServerId,
    account: Rc<QuotaAccount>,
    ref_account: Rc<QuotaAccount>,
    policy: Rc<dyn ChildPolicy>,
    env: EnvSessions,
    /// Held only around registry mutation and lookup, never across a
    /// provider call
    sessions: Mutex<SessionRegistry>,
    /// Sum of all donations of registered sessions
    committed: Cell<Quota>,
    /// Quota transferred to the child from the broker account
    assigned: Cell<Quota>,
    /// Quota the child should have
    configured: Cell<Quota>,
    /// Outstanding resource request of the child
    requested: Cell<Option<Quota>>,
    reporter: Option<Rc<dyn StateReporter>>,
    verbose: bool,
}

impl Child {
    /// Create the broker of a freshly instantiated child.
    ///
    /// The child's current balance counts as its assigned and configured
    /// quota.
    pub fn new(setup: ChildSetup) -> Self {
        let assigned = setup.account.balance();
        let sessions = SessionRegistry::with_reserved(setup.max_sessions, setup.env.caps());
        Self {
            name: setup.policy.name().to_string(),
            id: setup.id,
            account: setup.account,
            ref_account: setup.ref_account,
            policy: setup.policy,
            env: setup.env,
            sessions: Mutex::new(sessions),
            committed: Cell::new(Quota::ZERO),
            assigned: Cell::new(assigned),
            configured: Cell::new(assigned),
            requested: Cell::new(None),
            reporter: setup.reporter,
            verbose: setup.verbose,
        }
    }

    /// Child name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Identity of the child as a provider.
    pub fn id(&self) -> ServerId {
        self.id
    }

    /// The child's own account.
    pub fn account(&self) -> &QuotaAccount {
        &self.account
    }

    /// Environment sessions.
    pub fn env(&self) -> &EnvSessions {
        &self.env
    }

    /// Open a session.
    ///
    /// All-or-nothing: if any step fails, the child, broker and provider
    /// accounts are left exactly as they were.
    pub fn session(&self, service_name: &str, args: &str) -> Result<SessionCap, BrokerError> {
        if service_name.is_empty() || service_name.len() > MAX_SERVICE_NAME_LEN {
            log::warn!("{}: invalid service name requested", self.name);
            return Err(BrokerError::ServiceDenied);
        }
        if args.len() > MAX_ARGS_LEN {
            log::warn!("{}: oversized session arguments for '{}'", self.name, service_name);
            return Err(BrokerError::ServiceDenied);
        }

        if let Some(kind) = EnvKind::from_name(service_name) {
            return Ok(self.env.get(kind).cap);
        }

        let mut args = self.parse_args(service_name, args)?;
        self.policy.filter_session_args(service_name, &mut args);
        let amount = self.requested_quota(service_name, &args)?;

        let to_broker = QuotaTransfer::new(amount, &self.account, &self.ref_account)?;

        let client_label = args.label().to_string();
        let route = self
            .policy
            .resolve_session_request(service_name, &client_label)
            .map_err(|e| match e {
                BrokerError::ServiceNotPresent => BrokerError::ServiceDenied,
                other => other,
            })?;
        args.set_label(&route.label);
        let service = route.service.clone();

        let to_provider = QuotaTransfer::new(amount, &self.ref_account, service.account())?;

        let provider_cap = match service.create_session(&args) {
            Ok(CreateResponse::Created(cap)) if cap.is_valid() => cap,
            Ok(CreateResponse::Created(_)) => {
                log::warn!("{}: '{}' returned an invalid session", self.name, service_name);
                return Err(BrokerError::ServiceDenied);
            }
            Ok(CreateResponse::Deferred) => {
                log::warn!("{}: '{}' deferred a synchronous request", self.name, service_name);
                return Err(BrokerError::ServiceDenied);
            }
            Err(BrokerError::ServiceNotPresent) => return Err(BrokerError::ServiceDenied),
            Err(e) => return Err(e),
        };

        let record = SessionRecord::new(provider_cap, route, amount)
            .requested_as(service_name, &client_label);
        let registered = self.sessions.lock().register(record);
        let cap = match registered {
            Ok(cap) => cap,
            Err(e) => {
                log::error!(
                    "{}: could not register session of '{}': {}",
                    self.name,
                    service_name,
                    e
                );
                if let Err(e) = service.close_session(provider_cap) {
                    log::warn!("{}: closing unregistered session failed: {}", self.name, e);
                }
                return Err(BrokerError::QuotaExceeded(Currency::Ram));
            }
        };

        to_provider.acknowledge();
        to_broker.acknowledge();
        self.commit(amount);

        self.log_session(format_args!(
            "{}: session {:?} of '{}' ({})",
            self.name, cap, service_name, amount
        ));
        self.report(StateEvent::SessionCreated {
            child: self.name.clone(),
            service: service_name.to_string(),
            cap,
            donated: amount,
        });
        Ok(cap)
    }

    /// Donate additional quota to an existing session.
    pub fn upgrade(&self, cap: SessionCap, args: &str) -> Result<(), BrokerError> {
        let args = self.parse_args("upgrade", args)?;
        let amount = self.requested_quota("upgrade", &args)?;

        let env_service = self.env.find(cap).map(|env| (env.service.clone(), env.cap));
        let env_session = env_service.is_some();
        let (service, provider_cap) = match env_service {
            Some(found) => found,
            None => match self.sessions.lock().get(cap) {
                Some(record) => (record.service.clone(), record.provider_cap),
                None => {
                    log::warn!("{}: upgrade of unknown session {:?}", self.name, cap);
                    return Err(BrokerError::SessionNotFound);
                }
            },
        };

        let to_broker = QuotaTransfer::new(amount, &self.account, &self.ref_account)?;
        let to_provider = QuotaTransfer::new(amount, &self.ref_account, service.account())?;

        match service.upgrade_session(provider_cap, &args) {
            Ok(UpgradeResponse::Confirmed) => {}
            Ok(UpgradeResponse::Deferred) => {
                log::warn!("{}: '{}' deferred a synchronous upgrade", self.name, service.name());
                return Err(BrokerError::ServiceDenied);
            }
            Err(BrokerError::ServiceNotPresent) => return Err(BrokerError::ServiceDenied),
            Err(e) => return Err(e),
        }

        let donated = if env_session {
            amount
        } else {
            let mut sessions = self.sessions.lock();
            match sessions.get_mut(cap) {
                Some(record) => {
                    record.upgrade(amount);
                    record.donated
                }
                None => return Err(BrokerError::SessionNotFound),
            }
        };

        to_provider.acknowledge();
        to_broker.acknowledge();
        if !env_session {
            self.commit(amount);
        }

        self.report(StateEvent::SessionUpgraded {
            child: self.name.clone(),
            cap,
            donated,
        });
        Ok(())
    }

    /// Close a session and take its quota back.
    pub fn close(&self, cap: SessionCap) -> Result<(), BrokerError> {
        if self.env.contains(cap) {
            log::warn!("{}: refusing to close environment session {:?}", self.name, cap);
            return Err(BrokerError::ServiceDenied);
        }

        let record = self.sessions.lock().remove(cap).ok_or_else(|| {
            log::warn!("{}: close of unknown session {:?}", self.name, cap);
            BrokerError::SessionNotFound
        })?;

        let returned = self.close_record(&record);
        self.log_session(format_args!(
            "{}: closed session {:?} of '{}'",
            self.name,
            cap,
            record.service.name()
        ));
        self.report(StateEvent::SessionClosed {
            child: self.name.clone(),
            cap,
            returned,
        });
        Ok(())
    }

    /// Drop every session provided by `server` without contacting it.
    ///
    /// Returns the number of revoked sessions.
    pub fn revoke_by_server(&self, server: ServerId) -> usize {
        let records = self.sessions.lock().remove_matching(server);
        if records.is_empty() {
            return 0;
        }

        for record in &records {
            self.reclaim(record);
            self.uncommit(record.donated);
        }

        log::info!(
            "{}: revoked {} session(s) of {:?}",
            self.name,
            records.len(),
            server
        );
        self.report(StateEvent::SessionsRevoked {
            child: self.name.clone(),
            server,
            count: records.len(),
        });
        records.len()
    }

    /// Sessions that the current policy would route differently.
    ///
    /// Each session is re-resolved with the service name and label it was
    /// requested with. It is stale if resolution now fails or leads to
    /// another provider or label.
    pub fn stale_sessions(&self) -> Vec<SessionCap> {
        let requests: Vec<(SessionCap, String, String)> = self
            .sessions
            .lock()
            .iter()
            .map(|r| (r.cap, r.service_name.clone(), r.client_label.clone()))
            .collect();

        requests
            .into_iter()
            .filter(|(cap, service_name, client_label)| {
                let route = self.policy.resolve_session_request(service_name, client_label);
                match (route, self.sessions.lock().get(*cap)) {
                    (Ok(route), Some(record)) => !record.routed_by(&route),
                    (Err(_), Some(_)) => true,
                    (_, None) => false,
                }
            })
            .map(|(cap, _, _)| cap)
            .collect()
    }

    /// Close every session whose route changed under the current policy.
    ///
    /// Returns the number of closed sessions.
    pub fn apply_updated_policy(&self) -> usize {
        let stale = self.stale_sessions();
        let mut closed = 0;
        for cap in stale {
            let Some(record) = self.sessions.lock().remove(cap) else {
                continue;
            };
            log::info!(
                "{}: closing session {:?} of '{}': route changed",
                self.name,
                cap,
                record.service_name
            );
            let returned = self.close_record(&record);
            self.report(StateEvent::SessionClosed {
                child: self.name.clone(),
                cap,
                returned,
            });
            closed += 1;
        }
        closed
    }

    /// Announce a service provided by this child.
    pub fn announce(
        &self,
        service_name: &str,
        root: Rc<dyn SessionRoot>,
    ) -> Result<(), BrokerError> {
        self.policy.announce_service(service_name, root)
    }

    /// Number of brokered sessions.
    pub fn session_count(&self) -> usize {
        self.sessions.lock().len()
    }

    /// Quota currently donated for a session.
    pub fn donated_quota(&self, cap: SessionCap) -> Option<Quota> {
        self.sessions.lock().get(cap).map(|r| r.donated)
    }

    /// Sum of all donations of brokered sessions.
    pub fn committed(&self) -> Quota {
        self.committed.get()
    }

    /// Visit every brokered session.
    ///
    /// `f` runs with the registry locked and must not call back into the
    /// child.
    pub fn for_each_session<F: FnMut(&SessionRecord)>(&self, mut f: F) {
        for record in self.sessions.lock().iter() {
            f(record);
        }
    }

    // ------------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------------

    fn parse_args(&self, service_name: &str, args: &str) -> Result<SessionArgs, BrokerError> {
        SessionArgs::parse(args).map_err(|e| {
            log::warn!("{}: malformed arguments for '{}': {}", self.name, service_name, e);
            BrokerError::ServiceDenied
        })
    }

    fn requested_quota(
        &self,
        service_name: &str,
        args: &SessionArgs,
    ) -> Result<Quota, BrokerError> {
        args.quota().map_err(|e| {
            log::warn!("{}: bad quota for '{}': {}", self.name, service_name, e);
            BrokerError::ServiceDenied
        })
    }

    /// Close at the provider, then take the donation back.
    fn close_record(&self, record: &SessionRecord) -> Quota {
        match record.service.close_session(record.provider_cap) {
            Ok(_) => {}
            Err(BrokerError::BlockingCanceled) => {
                log::warn!(
                    "{}: blocking close of {:?} canceled, closing locally",
                    self.name,
                    record.cap
                );
            }
            Err(e) => {
                log::warn!("{}: provider failed to close {:?}: {}", self.name, record.cap, e);
            }
        }
        let returned = self.reclaim(record);
        self.uncommit(record.donated);
        returned
    }

    /// Move a session's donation provider → broker → child.
    ///
    /// Either both hops happen or neither; a shortfall is logged.
    fn reclaim(&self, record: &SessionRecord) -> Quota {
        let result = (|| -> Result<(), QuotaError> {
            let from_provider =
                QuotaTransfer::new(record.donated, record.service.account(), &self.ref_account)?;
            let to_child = QuotaTransfer::new(record.donated, &self.ref_account, &self.account)?;
            to_child.acknowledge();
            from_provider.acknowledge();
            Ok(())
        })();

        match result {
            Ok(()) => record.donated,
            Err(e) => {
                log::error!(
                    "{}: misbehaving server '{}' did not return quota of session {:?} ({}): {}",
                    self.name,
                    record.service.name(),
                    record.cap,
                    record.ident,
                    e
                );
                Quota::ZERO
            }
        }
    }

    fn commit(&self, amount: Quota) {
        self.committed.set(self.committed.get().saturating_add(amount));
    }

    fn uncommit(&self, amount: Quota) {
        self.committed.set(self.committed.get().saturating_sub(amount));
    }

    fn report(&self, event: StateEvent) {
        if let Some(reporter) = &self.reporter {
            reporter.state_changed(&event);
        }
    }

    fn log_session(&self, args: core::fmt::Arguments<'_>) {
        let level = if self.verbose { Level::Info } else { Level::Debug };
        log::log!(level, "{}", args);
    }
}

impl Drop for Child {
    fn drop(&mut self) {
        let records = self.sessions.lock().drain();
        for record in &records {
            self.close_record(record);
        }
        if !records.is_empty() {
            log::debug!("{}: closed {} session(s) on exit", self.name, records.len());
        }
    }
}
