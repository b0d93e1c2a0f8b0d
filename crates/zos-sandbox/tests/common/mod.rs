//! Shared fixtures for the sandbox integration tests.

#![allow(dead_code)]

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use zos_sandbox::{
    Child, ChildSetup, CloseResponse, CreateResponse, EnvSession, EnvSessions, ProviderError,
    Quota, QuotaAccount, RouteResolver, RoutingPolicy, SandboxPolicy, ServerId, Service,
    ServiceRef, SessionArgs, SessionCap, SessionRoot, StateReporter, UpgradeResponse,
};

// ============================================================================
// Mock provider
// ============================================================================

/// What the mock answers to create requests
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CreateMode {
    Accept,
    Defer,
    Fail(ProviderError),
}

/// A provider call seen by the mock
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Call {
    Create(String),
    Upgrade(SessionCap, String),
    Close(SessionCap),
}

pub struct MockRoot {
    next_cap: Cell<u64>,
    create_mode: Cell<CreateMode>,
    upgrade_response: Cell<Result<UpgradeResponse, ProviderError>>,
    close_response: Cell<Result<CloseResponse, ProviderError>>,
    calls: RefCell<Vec<Call>>,
}

impl MockRoot {
    /// Provider handing out capabilities starting at `first_cap`.
    pub fn new(first_cap: u64) -> Rc<Self> {
        Rc::new(Self {
            next_cap: Cell::new(first_cap),
            create_mode: Cell::new(CreateMode::Accept),
            upgrade_response: Cell::new(Ok(UpgradeResponse::Confirmed)),
            close_response: Cell::new(Ok(CloseResponse::Closed)),
            calls: RefCell::new(Vec::new()),
        })
    }

    pub fn set_create_mode(&self, mode: CreateMode) {
        self.create_mode.set(mode);
    }

    pub fn set_upgrade_response(&self, response: Result<UpgradeResponse, ProviderError>) {
        self.upgrade_response.set(response);
    }

    pub fn set_close_response(&self, response: Result<CloseResponse, ProviderError>) {
        self.close_response.set(response);
    }

    /// Capability the next accepted create will return.
    pub fn peek_cap(&self) -> SessionCap {
        SessionCap(self.next_cap.get())
    }

    /// Reserve a capability for completing a deferred create.
    pub fn take_cap(&self) -> SessionCap {
        let cap = SessionCap(self.next_cap.get());
        self.next_cap.set(cap.0 + 1);
        cap
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.borrow().clone()
    }

    pub fn create_calls(&self) -> Vec<String> {
        self.calls
            .borrow()
            .iter()
            .filter_map(|c| match c {
                Call::Create(args) => Some(args.clone()),
                _ => None,
            })
            .collect()
    }
}

impl SessionRoot for MockRoot {
    fn create_session(&self, args: &SessionArgs) -> Result<CreateResponse, ProviderError> {
        self.calls.borrow_mut().push(Call::Create(args.to_string()));
        match self.create_mode.get() {
            CreateMode::Accept => Ok(CreateResponse::Created(self.take_cap())),
            CreateMode::Defer => Ok(CreateResponse::Deferred),
            CreateMode::Fail(e) => Err(e),
        }
    }

    fn upgrade_session(
        &self,
        cap: SessionCap,
        args: &SessionArgs,
    ) -> Result<UpgradeResponse, ProviderError> {
        self.calls
            .borrow_mut()
            .push(Call::Upgrade(cap, args.to_string()));
        self.upgrade_response.get()
    }

    fn close_session(&self, cap: SessionCap) -> Result<CloseResponse, ProviderError> {
        self.calls.borrow_mut().push(Call::Close(cap));
        self.close_response.get()
    }
}

// ============================================================================
// Fixtures
// ============================================================================

pub fn account(name: &str, ram: u64) -> Rc<QuotaAccount> {
    Rc::new(QuotaAccount::new(name, Quota::ram(ram)))
}

/// Environment sessions backed by a dedicated core service.
pub fn env_sessions(first_cap: u64) -> EnvSessions {
    let core: ServiceRef = Service::parent("CORE", account("core", 0), MockRoot::new(1));
    let session = |offset: u64| EnvSession {
        cap: SessionCap(first_cap + offset),
        service: core.clone(),
    };
    EnvSessions {
        pd: session(0),
        cpu: session(1),
        ram: session(2),
        rm: session(3),
    }
}

/// A sandbox with one parent and any number of children.
pub struct Sandbox {
    pub resolver: Rc<RefCell<RouteResolver>>,
    pub broker: Rc<QuotaAccount>,
    pub parent_account: Rc<QuotaAccount>,
    pub parent: Rc<MockRoot>,
}

impl Sandbox {
    /// Parent offering `services`, routing per `policy`.
    pub fn new(policy: RoutingPolicy, services: &[&str]) -> Self {
        let parent_account = account("parent", 0);
        let parent = MockRoot::new(1000);
        let mut resolver = RouteResolver::new(policy);
        for name in services {
            resolver.add_parent_service(Service::parent(
                *name,
                parent_account.clone(),
                parent.clone(),
            ));
        }
        Self {
            resolver: Rc::new(RefCell::new(resolver)),
            broker: account("init", 0),
            parent_account,
            parent,
        }
    }

    /// Declare and announce a child-provided service.
    pub fn add_provider(
        &self,
        server: ServerId,
        child: &str,
        service: &str,
        first_cap: u64,
    ) -> (Rc<QuotaAccount>, Rc<MockRoot>) {
        let provider_account = account(child, 0);
        let root = MockRoot::new(first_cap);
        let mut resolver = self.resolver.borrow_mut();
        resolver.declare_child_service(Service::routed(
            service,
            server,
            child,
            provider_account.clone(),
        ));
        resolver
            .announce(server, service, root.clone())
            .expect("announce declared service");
        (provider_account, root)
    }

    /// Child `name` with `ram` bytes of quota.
    pub fn child(
        &self,
        name: &str,
        id: ServerId,
        ram: u64,
        max_sessions: usize,
        reporter: Option<Rc<dyn StateReporter>>,
    ) -> (Child, Rc<QuotaAccount>) {
        let child_account = account(name, ram);
        let child = Child::new(ChildSetup {
            id,
            account: child_account.clone(),
            ref_account: self.broker.clone(),
            policy: Rc::new(SandboxPolicy::new(name, id, self.resolver.clone())),
            env: env_sessions(id.0 * 100),
            max_sessions,
            reporter,
            verbose: false,
        });
        (child, child_account)
    }
}
