//! Zero OS Sandbox Core - Quota Ledger for Session Brokering
//!
//! This crate contains the **pure, provider-free** ledger layer that the
//! sandbox session broker is built on. It knows nothing about services,
//! routes or children; it only moves quota between accounts and parses the
//! session-argument strings that carry quota donations.
//!
//! # Design Principles
//!
//! 1. **All-or-nothing transfers**: a transfer either moves the whole amount
//!    in both currencies or changes nothing
//! 2. **Scoped donations**: every in-flight donation is owned by a
//!    [`QuotaTransfer`] guard that reverts it unless acknowledged
//! 3. **Closed error taxonomy**: every fallible operation returns a typed
//!    error, callers pattern-match
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    zos-sandbox-core                         │
//! │                                                             │
//! │   ┌───────────────┐    ┌───────────────┐                   │
//! │   │ QuotaAccount  │◀──▶│ QuotaTransfer │                   │
//! │   │  - ram        │    │  ack or undo  │                   │
//! │   │  - caps       │    └───────────────┘                   │
//! │   └───────────────┘                                         │
//! │                                                             │
//! │   ┌───────────────┐    ┌───────────────┐                   │
//! │   │  SessionArgs  │    │  BrokerError  │                   │
//! │   │  key=value    │    │  taxonomy     │                   │
//! │   └───────────────┘    └───────────────┘                   │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              │ used by
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      zos-sandbox                            │
//! │   - Child session broker, Session Registry                  │
//! │   - Route resolver, nested Server state machine             │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Module Organization
//!
//! - `types` - Identifiers and the two-currency [`Quota`] amount
//! - `quota` - [`QuotaAccount`] and the [`QuotaTransfer`] guard
//! - `args` - Session argument strings (`ram_quota`, `cap_quota`, `label`)
//! - `error` - Error taxonomy shared by the broker

#![no_std]
extern crate alloc;

pub mod args;
pub mod error;
pub mod quota;
pub mod types;

// Re-export all public types for convenient access
pub use args::{last_element, parse_quantity, prefixed_label, truncate, SessionArgs};
pub use error::{ArgsError, BrokerError, ProviderError, QuotaError};
pub use quota::{with_transfer, QuotaAccount, QuotaTransfer};
pub use types::{
    Currency, Quota, RequestId, ServerId, SessionCap, IDENT_LEN, MAX_ARGS_LEN, MAX_LABEL_LEN,
    MAX_SERVICE_NAME_LEN,
};
