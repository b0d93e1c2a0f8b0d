//! Runtime-checkable broker invariants
//!
//! Used by tests and debug builds to validate bookkeeping after every
//! operation.
//!
//! # Invariants
//!
//! 1. **Committed Consistency**: A child's registered donations sum up to
//!    what the child has committed
//! 2. **Environment Separation**: No environment capability is registered as
//!    a brokered session
//! 3. **Delivered Capability**: A delivered forwarded session holds a
//!    capability
//! 4. **Forwarding Bound**: No forwarded session passes on more than was
//!    donated for it
//! 5. **Pending Without Donation**: Unrouted requests hold no quota

use alloc::format;
use alloc::string::String;
use alloc::vec::Vec;

use crate::child::Child;
use crate::server::{SessionPhase, Server};

/// An invariant violation with details
#[derive(Clone, Debug)]
pub struct InvariantViolation {
    /// Name of the violated invariant
    pub invariant: &'static str,
    /// Description of what went wrong
    pub description: String,
}

/// Check all child invariants.
///
/// Returns a list of violations (empty if all invariants hold).
pub fn check_child_invariants(child: &Child) -> Vec<InvariantViolation> {
    let mut violations = Vec::new();

    let mut total = zos_sandbox_core::Quota::ZERO;
    let mut env_caps = Vec::new();
    child.for_each_session(|record| {
        total = total.saturating_add(record.donated);
        if child.env().contains(record.cap) {
            env_caps.push(record.cap);
        }
    });

    // Invariant 1
    if total != child.committed() {
        violations.push(InvariantViolation {
            invariant: "committed_consistency",
            description: format!(
                "{}: registry holds {} but {} is committed",
                child.name(),
                total,
                child.committed()
            ),
        });
    }

    // Invariant 2
    for cap in env_caps {
        violations.push(InvariantViolation {
            invariant: "environment_separation",
            description: format!("{}: environment session {:?} registered", child.name(), cap),
        });
    }

    violations
}

/// Check all server invariants.
pub fn check_server_invariants(server: &Server) -> Vec<InvariantViolation> {
    let mut violations = Vec::new();

    server.for_each_session(|session| {
        let delivered = matches!(
            session.phase,
            SessionPhase::CapHandedOut | SessionPhase::UpgradeRequested
        );
        if delivered && session.cap.is_none() {
            violations.push(InvariantViolation {
                invariant: "delivered_capability",
                description: format!("session {:?} delivered without capability", session.id),
            });
        }

        if session.donated.shortfall(&session.forwarded).is_some() {
            violations.push(InvariantViolation {
                invariant: "forwarding_bound",
                description: format!(
                    "session {:?} forwards {} of {} donated",
                    session.id, session.forwarded, session.donated
                ),
            });
        }

        if session.is_pending() && !(session.donated.is_zero() && session.forwarded.is_zero()) {
            violations.push(InvariantViolation {
                invariant: "pending_without_donation",
                description: format!("pending request {:?} holds {}", session.id, session.donated),
            });
        }
    });

    violations
}
