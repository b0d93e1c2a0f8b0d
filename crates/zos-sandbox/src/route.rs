//! Route resolution
//!
//! A [`RoutingPolicy`] is an ordered list of declarative rules. Each rule
//! matches on the service name and the session label and names a target:
//! our parent, a specific child, or whichever child provides the service.
//! The first matching rule wins, regardless of how specific later rules are.
//!
//! Resolution distinguishes two failures:
//!
//! - `ServiceDenied`: no rule matches (terminal for the request)
//! - `ServiceNotPresent`: a rule matched but its target does not provide the
//!   service right now (the request may be retried later)

use alloc::collections::{BTreeMap, BTreeSet};
use alloc::rc::Rc;
use alloc::string::{String, ToString};
use alloc::vec::Vec;
use log::Level;
use serde::{Deserialize, Serialize};

use zos_sandbox_core::{last_element, BrokerError, ServerId};

use crate::service::{Service, ServiceRef, SessionRoot};

// ============================================================================
// Policy
// ============================================================================

/// Which service names a rule applies to
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceMatch {
    /// Every service
    #[default]
    Any,
    /// Exactly this service
    Named(String),
}

impl ServiceMatch {
    /// Check if `name` is matched.
    pub fn matches(&self, name: &str) -> bool {
        match self {
            ServiceMatch::Any => true,
            ServiceMatch::Named(n) => n == name,
        }
    }
}

/// Which session labels a rule applies to
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LabelMatch {
    /// Every label
    #[default]
    Any,
    /// Label equals the string
    Exact(String),
    /// Label starts with the string
    Prefix(String),
    /// Label ends with the string
    Suffix(String),
    /// Last `" -> "` element of the label equals the string
    Last(String),
}

impl LabelMatch {
    /// Check if `label` is matched.
    pub fn matches(&self, label: &str) -> bool {
        match self {
            LabelMatch::Any => true,
            LabelMatch::Exact(s) => label == s,
            LabelMatch::Prefix(s) => label.starts_with(s.as_str()),
            LabelMatch::Suffix(s) => label.ends_with(s.as_str()),
            LabelMatch::Last(s) => last_element(label) == s,
        }
    }
}

/// Where a matching request goes
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RouteTarget {
    /// Our own parent
    Parent,
    /// The named child (aliases are followed)
    Child(String),
    /// The single child providing the service
    AnyChild,
}

/// One routing rule
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteRule {
    /// Service-name match
    #[serde(default)]
    pub service: ServiceMatch,
    /// Session-label match
    #[serde(default)]
    pub label: LabelMatch,
    /// Target of matching requests
    pub target: RouteTarget,
    /// Label presented to the provider instead of the client's
    #[serde(default)]
    pub target_label: Option<String>,
}

impl RouteRule {
    /// Check if the rule applies to a request.
    pub fn matches(&self, service: &str, label: &str) -> bool {
        self.service.matches(service) && self.label.matches(label)
    }
}

/// Ordered rule list plus child-name aliases
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoutingPolicy {
    /// Rules in priority order
    #[serde(default)]
    pub rules: Vec<RouteRule>,
    /// Alias name to child name
    #[serde(default)]
    pub aliases: BTreeMap<String, String>,
}

// ============================================================================
// Route
// ============================================================================

/// Resolved pairing of a request to a provider
#[derive(Clone, Debug)]
pub struct Route {
    /// Providing service
    pub service: ServiceRef,
    /// Label presented to the provider
    pub label: String,
}

impl Route {
    /// Check if both routes lead to the same provider with the same label.
    pub fn same_as(&self, other: &Route) -> bool {
        Rc::ptr_eq(&self.service, &other.service) && self.label == other.label
    }
}

// ============================================================================
// Resolver
// ============================================================================

/// Routing policy together with the directory of known services.
#[derive(Debug, Default)]
pub struct RouteResolver {
    policy: RoutingPolicy,
    parent_services: Vec<ServiceRef>,
    child_services: Vec<ServiceRef>,
    verbose: bool,
}

impl RouteResolver {
    /// Create a resolver with an empty directory.
    pub fn new(policy: RoutingPolicy) -> Self {
        Self {
            policy,
            ..Self::default()
        }
    }

    /// Log route decisions at `info` instead of `debug`.
    pub fn set_verbose(&mut self, verbose: bool) {
        self.verbose = verbose;
    }

    /// Current policy.
    pub fn policy(&self) -> &RoutingPolicy {
        &self.policy
    }

    /// Replace the policy.
    ///
    /// Existing routes are not re-evaluated here; the server does that in
    /// `apply_updated_policy`.
    pub fn set_policy(&mut self, policy: RoutingPolicy) {
        self.policy = policy;
    }

    /// Register a service offered by our parent.
    pub fn add_parent_service(&mut self, service: ServiceRef) {
        self.parent_services.push(service);
    }

    /// Register a service a child is configured to provide.
    ///
    /// Returns false if the child already declared a service of that name.
    pub fn declare_child_service(&mut self, service: ServiceRef) -> bool {
        if !matches!(*service, Service::Routed(_)) {
            log::warn!("'{}' is not a child service, not declared", service.name());
            return false;
        }
        let duplicate = self
            .child_services
            .iter()
            .any(|s| s.server() == service.server() && s.name() == service.name());
        if duplicate {
            log::warn!(
                "service '{}' declared twice by {:?}",
                service.name(),
                service.server()
            );
            return false;
        }
        self.child_services.push(service);
        true
    }

    /// Make a declared child service available.
    ///
    /// Announcing a service the child never declared is refused.
    pub fn announce(
        &self,
        server: ServerId,
        name: &str,
        root: Rc<dyn SessionRoot>,
    ) -> Result<(), BrokerError> {
        let service = match self.child_service(server, name) {
            Some(service) => service,
            None => {
                log::warn!("{:?} announced undeclared service '{}'", server, name);
                return Err(BrokerError::ServiceDenied);
            }
        };

        if !service.announce(root) {
            log::warn!("{:?} announced abandoned service '{}'", server, name);
            return Err(BrokerError::ServiceDenied);
        }
        self.log_decision(format_args!("{:?} announced service '{}'", server, name));
        Ok(())
    }

    /// Drop every service of `server` from the directory.
    ///
    /// The returned services are abandoned; sessions still referring to
    /// them must be revoked by the caller.
    pub fn abandon_server(&mut self, server: ServerId) -> Vec<ServiceRef> {
        let (gone, kept): (Vec<_>, Vec<_>) = core::mem::take(&mut self.child_services)
            .into_iter()
            .partition(|s| s.server() == server);
        self.child_services = kept;
        for service in &gone {
            service.abandon();
        }
        gone
    }

    /// Child service lookup.
    pub fn child_service(&self, server: ServerId, name: &str) -> Option<&ServiceRef> {
        self.child_services
            .iter()
            .find(|s| s.server() == server && s.name() == name)
    }

    /// Resolve a session request to a route.
    pub fn resolve(&self, service: &str, label: &str) -> Result<Route, BrokerError> {
        let rule = match self.policy.rules.iter().find(|r| r.matches(service, label)) {
            Some(rule) => rule,
            None => {
                log::debug!("no route for service '{}' (label '{}')", service, label);
                return Err(BrokerError::ServiceDenied);
            }
        };

        let provider = match &rule.target {
            RouteTarget::Parent => self.parent_service(service)?,
            RouteTarget::Child(name) => self.named_child_service(service, name)?,
            RouteTarget::AnyChild => self.any_child_service(service, label)?,
        };

        let label = match &rule.target_label {
            Some(l) => l.clone(),
            None => label.to_string(),
        };

        self.log_decision(format_args!(
            "route '{}' -> {:?} label '{}'",
            service,
            provider.server(),
            label
        ));
        Ok(Route {
            service: provider,
            label,
        })
    }

    fn parent_service(&self, name: &str) -> Result<ServiceRef, BrokerError> {
        self.parent_services
            .iter()
            .find(|s| s.name() == name)
            .cloned()
            .ok_or(BrokerError::ServiceNotPresent)
    }

    fn named_child_service(&self, service: &str, child: &str) -> Result<ServiceRef, BrokerError> {
        let child = self.deref_alias(child)?;
        self.child_services
            .iter()
            .find(|s| s.name() == service && s.server_name() == Some(child) && s.is_present())
            .cloned()
            .ok_or(BrokerError::ServiceNotPresent)
    }

    fn any_child_service(&self, service: &str, label: &str) -> Result<ServiceRef, BrokerError> {
        let mut present = self
            .child_services
            .iter()
            .filter(|s| s.name() == service && s.is_present());

        let first = present.next().ok_or(BrokerError::ServiceNotPresent)?;
        if present.next().is_some() {
            log::error!(
                "ambiguous routes to service '{}' (label '{}')",
                service,
                label
            );
            return Err(BrokerError::ServiceDenied);
        }
        Ok(first.clone())
    }

    /// Follow aliases to a child name.
    fn deref_alias<'a>(&'a self, name: &'a str) -> Result<&'a str, BrokerError> {
        let mut visited = BTreeSet::new();
        let mut current = name;
        while let Some(next) = self.policy.aliases.get(current) {
            if !visited.insert(current) {
                log::error!("alias cycle at '{}'", current);
                return Err(BrokerError::ServiceDenied);
            }
            current = next.as_str();
        }
        Ok(current)
    }

    fn log_decision(&self, args: core::fmt::Arguments<'_>) {
        let level = if self.verbose { Level::Info } else { Level::Debug };
        log::log!(level, "{}", args);
    }
}
