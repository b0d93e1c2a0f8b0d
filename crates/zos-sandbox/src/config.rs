//! Sandbox configuration
//!
//! The configuration document is JSON:
//!
//! ```json
//! {
//!   "parent_provides": ["LOG", "ROM"],
//!   "routes": [
//!     { "service": { "named": "LOG" }, "target": "parent" },
//!     { "label": { "prefix": "app" }, "target": { "child": "fs" } }
//!   ],
//!   "aliases": { "storage": "fs" },
//!   "session_cost": { "ram": 1024 },
//!   "max_sessions_per_child": 64,
//!   "verbose": false
//! }
//! ```

use alloc::collections::BTreeMap;
use alloc::rc::Rc;
use alloc::string::{String, ToString};
use alloc::vec::Vec;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use zos_sandbox_core::{Quota, QuotaAccount};

use crate::route::{RouteResolver, RouteRule, RoutingPolicy};
use crate::service::{Service, SessionRoot};

/// Default bookkeeping cost the server retains per forwarded session
pub const DEFAULT_SESSION_COST: Quota = Quota::ram(1024);

/// Default capacity of a child's session registry
pub const DEFAULT_MAX_SESSIONS_PER_CHILD: usize = 64;

/// Configuration errors
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum ConfigError {
    /// Document is not valid configuration JSON
    #[error("malformed sandbox config: {0}")]
    Malformed(String),
}

/// Parsed sandbox configuration.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SandboxConfig {
    /// Routing rules in priority order
    #[serde(default)]
    pub routes: Vec<RouteRule>,
    /// Child-name aliases
    #[serde(default)]
    pub aliases: BTreeMap<String, String>,
    /// Services offered by our parent
    #[serde(default)]
    pub parent_provides: Vec<String>,
    /// Quota the server keeps per forwarded session
    #[serde(default = "default_session_cost")]
    pub session_cost: Quota,
    /// Session limit of each child
    #[serde(default = "default_max_sessions")]
    pub max_sessions_per_child: usize,
    /// Log routing and session traffic at `info`
    #[serde(default)]
    pub verbose: bool,
}

fn default_session_cost() -> Quota {
    DEFAULT_SESSION_COST
}

fn default_max_sessions() -> usize {
    DEFAULT_MAX_SESSIONS_PER_CHILD
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            routes: Vec::new(),
            aliases: BTreeMap::new(),
            parent_provides: Vec::new(),
            session_cost: DEFAULT_SESSION_COST,
            max_sessions_per_child: DEFAULT_MAX_SESSIONS_PER_CHILD,
            verbose: false,
        }
    }
}

impl SandboxConfig {
    /// Parse a JSON configuration document.
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        serde_json::from_str(json).map_err(|e| ConfigError::Malformed(e.to_string()))
    }

    /// Routing rules and aliases.
    pub fn routing_policy(&self) -> RoutingPolicy {
        RoutingPolicy {
            rules: self.routes.clone(),
            aliases: self.aliases.clone(),
        }
    }

    /// Check if the parent offers `service`.
    pub fn parent_provides(&self, service: &str) -> bool {
        self.parent_provides.iter().any(|s| s == service)
    }

    /// Resolver with this policy and one parent service per
    /// `parent_provides` entry, all backed by `parent`.
    pub fn build_resolver(
        &self,
        parent_account: Rc<QuotaAccount>,
        parent: Rc<dyn SessionRoot>,
    ) -> RouteResolver {
        let mut resolver = RouteResolver::new(self.routing_policy());
        resolver.set_verbose(self.verbose);
        for name in &self.parent_provides {
            resolver.add_parent_service(Service::parent(
                name.as_str(),
                parent_account.clone(),
                parent.clone(),
            ));
        }
        resolver
    }
}
