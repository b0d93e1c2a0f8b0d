//! Zero OS Sandbox - Session Brokering for Supervised Components
//!
//! A sandbox hosts a set of children. Every session a child opens is routed
//! to a provider (our parent or another child) by a declarative policy and
//! paid for by the child through transactional quota transfer.
//!
//! # Architecture
//!
//! ```text
//!   child                   sandbox                         provider
//!   ─────                   ───────                         ────────
//!   session(name, args) ──▶ Child ──▶ ChildPolicy ──▶ RouteResolver
//!                             │                            │
//!                             │ QuotaTransfer x2           ▼ Route
//!                             ├──────────────────────▶ Service ──▶ SessionRoot
//!                             ▼
//!                        SessionRegistry
//!
//!   SessionRequest ───────▶ Server (CreateRequested → CapHandedOut → Closed)
//! ```
//!
//! # Module Organization
//!
//! - `service` - Providers ([`Service`]) and the [`SessionRoot`] interface
//! - `registry` - Per-child [`SessionRegistry`] of [`SessionRecord`]s
//! - `route` - [`RoutingPolicy`] and the [`RouteResolver`]
//! - `child` - The synchronous [`Child`] session broker and quota resizing
//! - `server` - The asynchronous [`Server`] for forwarded requests
//! - `report` - [`StateReporter`] notifications and the [`StateJournal`]
//! - `config` - [`SandboxConfig`] parsed from JSON
//! - `invariants` - Runtime-checkable bookkeeping invariants

#![no_std]
extern crate alloc;

pub mod child;
pub mod config;
pub mod invariants;
pub mod registry;
pub mod report;
pub mod route;
pub mod server;
pub mod service;

pub use child::{
    Child, ChildPolicy, ChildSetup, Downgrade, EnvKind, EnvSession, EnvSessions, SandboxPolicy,
    PRESERVED_QUOTA,
};
pub use config::{ConfigError, SandboxConfig};
pub use invariants::{check_child_invariants, check_server_invariants, InvariantViolation};
pub use registry::{RegistryError, SessionRecord, SessionRegistry};
pub use report::{JournalEntry, StateEvent, StateJournal, StateReporter};
pub use route::{
    LabelMatch, Route, RouteResolver, RouteRule, RouteTarget, RoutingPolicy, ServiceMatch,
};
pub use server::{ForwardedSession, Server, SessionPhase, SessionRequest, SessionResponse};
pub use service::{
    CloseResponse, CreateResponse, RoutedState, Service, ServiceRef, SessionRoot,
    UpgradeResponse,
};

// Re-export the ledger layer
pub use zos_sandbox_core::{
    BrokerError, Currency, ProviderError, Quota, QuotaAccount, QuotaTransfer, RequestId,
    ServerId, SessionArgs, SessionCap,
};
