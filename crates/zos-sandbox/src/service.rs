//! Services - who actually implements a session
//!
//! A [`Service`] is either provided by our own parent or routed to one of
//! our children (a sibling of the requesting component). Both variants carry
//! the quota account of the provider, which receives the session donations,
//! and a [`SessionRoot`] through which sessions are created, upgraded and
//! closed.
//!
//! Routed services go through two phases. They are *declared* when the
//! providing child is configured to provide them, and become *announced*
//! once the child has started and handed out its root. A routed service
//! whose child goes away is *abandoned*; all of its sessions must then be
//! revoked.

use alloc::rc::Rc;
use alloc::string::String;
use core::cell::{Cell, RefCell};
use core::fmt;

use zos_sandbox_core::{
    BrokerError, ProviderError, QuotaAccount, ServerId, SessionArgs, SessionCap,
};

/// Result of a session-creation request at the provider
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CreateResponse {
    /// Session exists
    Created(SessionCap),
    /// Provider will complete the request later
    Deferred,
}

/// Result of a session-upgrade request at the provider
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UpgradeResponse {
    /// Upgrade applied
    Confirmed,
    /// Provider will confirm later
    Deferred,
}

/// Result of a session-close request at the provider
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CloseResponse {
    /// Session is gone, donated quota released
    Closed,
    /// Provider will complete the close later
    Deferred,
}

/// Provider interface.
///
/// Implemented by whatever hosts the sessions: the connection to our parent
/// or the root interface announced by a child.
pub trait SessionRoot {
    /// Create a session with the given (filtered, rewritten) arguments.
    fn create_session(&self, args: &SessionArgs) -> Result<CreateResponse, ProviderError>;

    /// Extend an existing session by the quota in `args`.
    fn upgrade_session(
        &self,
        cap: SessionCap,
        args: &SessionArgs,
    ) -> Result<UpgradeResponse, ProviderError>;

    /// Close an existing session.
    fn close_session(&self, cap: SessionCap) -> Result<CloseResponse, ProviderError>;
}

/// Lifecycle of a routed service
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RoutedState {
    /// Configured to be provided, provider not started yet
    Declared,
    /// Provider handed out its root
    Announced,
    /// Provider is gone
    Abandoned,
}

/// Service provided by our own parent.
pub struct ParentService {
    name: String,
    account: Rc<QuotaAccount>,
    root: Rc<dyn SessionRoot>,
}

/// Service provided by one of our children.
pub struct RoutedService {
    name: String,
    server: ServerId,
    server_name: String,
    account: Rc<QuotaAccount>,
    root: RefCell<Option<Rc<dyn SessionRoot>>>,
    state: Cell<RoutedState>,
}

/// A session provider.
pub enum Service {
    /// Provided by our parent
    Parent(ParentService),
    /// Routed to a sibling/child
    Routed(RoutedService),
}

/// Shared handle to a service.
///
/// Session records keep such a handle; a service outlives all of its
/// sessions.
pub type ServiceRef = Rc<Service>;

impl Service {
    /// Create a parent-provided service.
    pub fn parent(
        name: impl Into<String>,
        account: Rc<QuotaAccount>,
        root: Rc<dyn SessionRoot>,
    ) -> ServiceRef {
        Rc::new(Service::Parent(ParentService {
            name: name.into(),
            account,
            root,
        }))
    }

    /// Declare a service to be provided by child `server_name`.
    pub fn routed(
        name: impl Into<String>,
        server: ServerId,
        server_name: impl Into<String>,
        account: Rc<QuotaAccount>,
    ) -> ServiceRef {
        Rc::new(Service::Routed(RoutedService {
            name: name.into(),
            server,
            server_name: server_name.into(),
            account,
            root: RefCell::new(None),
            state: Cell::new(RoutedState::Declared),
        }))
    }

    /// Service name.
    pub fn name(&self) -> &str {
        match self {
            Service::Parent(s) => &s.name,
            Service::Routed(s) => &s.name,
        }
    }

    /// Quota account of the provider.
    pub fn account(&self) -> &QuotaAccount {
        match self {
            Service::Parent(s) => &s.account,
            Service::Routed(s) => &s.account,
        }
    }

    /// Component providing the service.
    pub fn server(&self) -> ServerId {
        match self {
            Service::Parent(_) => ServerId::PARENT,
            Service::Routed(s) => s.server,
        }
    }

    /// Name of the providing child, `None` for parent services.
    pub fn server_name(&self) -> Option<&str> {
        match self {
            Service::Parent(_) => None,
            Service::Routed(s) => Some(&s.server_name),
        }
    }

    /// Lifecycle state; parent services are always announced.
    pub fn state(&self) -> RoutedState {
        match self {
            Service::Parent(_) => RoutedState::Announced,
            Service::Routed(s) => s.state.get(),
        }
    }

    /// Check if sessions can be created right now.
    pub fn is_present(&self) -> bool {
        self.state() == RoutedState::Announced
    }

    /// Check if the provider is gone.
    pub fn is_abandoned(&self) -> bool {
        self.state() == RoutedState::Abandoned
    }

    /// Hand out the provider's root, making a declared service present.
    ///
    /// Returns false if the service cannot be announced (parent service or
    /// already abandoned).
    pub fn announce(&self, root: Rc<dyn SessionRoot>) -> bool {
        match self {
            Service::Parent(_) => false,
            Service::Routed(s) => {
                if s.state.get() == RoutedState::Abandoned {
                    return false;
                }
                *s.root.borrow_mut() = Some(root);
                s.state.set(RoutedState::Announced);
                true
            }
        }
    }

    /// Mark a routed service as gone and drop its root.
    pub fn abandon(&self) {
        if let Service::Routed(s) = self {
            s.state.set(RoutedState::Abandoned);
            s.root.borrow_mut().take();
        }
    }

    /// Create a session at the provider.
    pub fn create_session(&self, args: &SessionArgs) -> Result<CreateResponse, BrokerError> {
        let root = self.root().ok_or(BrokerError::ServiceNotPresent)?;
        root.create_session(args).map_err(BrokerError::from)
    }

    /// Upgrade a session at the provider.
    pub fn upgrade_session(
        &self,
        cap: SessionCap,
        args: &SessionArgs,
    ) -> Result<UpgradeResponse, BrokerError> {
        let root = self.root().ok_or(BrokerError::ServiceNotPresent)?;
        root.upgrade_session(cap, args).map_err(BrokerError::from)
    }

    /// Close a session at the provider.
    ///
    /// Closing at a provider that already went away succeeds trivially.
    pub fn close_session(&self, cap: SessionCap) -> Result<CloseResponse, BrokerError> {
        match self.root() {
            Some(root) => root.close_session(cap).map_err(BrokerError::from),
            None => Ok(CloseResponse::Closed),
        }
    }

    /// The root, cloned so that no borrow is held across provider calls.
    fn root(&self) -> Option<Rc<dyn SessionRoot>> {
        match self {
            Service::Parent(s) => Some(s.root.clone()),
            Service::Routed(s) => {
                if s.state.get() != RoutedState::Announced {
                    return None;
                }
                s.root.borrow().clone()
            }
        }
    }
}

impl fmt::Debug for Service {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Service")
            .field("name", &self.name())
            .field("server", &self.server())
            .field("state", &self.state())
            .finish()
    }
}
