//! Forwarded-session state
//!
//! Requests arrive as declarative records (create/upgrade/close) and are
//! answered with [`SessionResponse`]s. Each forwarded session moves through
//! the phases of [`SessionPhase`]:
//!
//! ```text
//! CreateRequested ─┬─> Available ─> CapHandedOut <─> UpgradeRequested
//!                  ├─> ServiceDenied                     │
//!                  ├─> InsufficientRamQuota              v
//!                  └─> InsufficientCapQuota        CloseRequested ─> Closed
//! ```

use alloc::string::String;
use serde::{Deserialize, Serialize};

use zos_sandbox_core::{Quota, RequestId, SessionArgs, SessionCap};

use crate::route::Route;

/// Phase of a forwarded session
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionPhase {
    /// Waiting for a route or for the provider to create the session
    CreateRequested,
    /// Rejected: no route or provider refused
    ServiceDenied,
    /// Rejected: not enough RAM donated
    InsufficientRamQuota,
    /// Rejected: not enough capability slots donated
    InsufficientCapQuota,
    /// Provider created the session
    Available,
    /// Capability delivered to the requester
    CapHandedOut,
    /// Upgrade in flight at the provider
    UpgradeRequested,
    /// Close in flight at the provider
    CloseRequested,
    /// Session is gone
    Closed,
}

/// A request from the requesting side
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SessionRequest {
    /// Open a session
    Create {
        /// Request id chosen by the requester
        id: RequestId,
        /// Service name
        service: String,
        /// Session-argument string
        args: String,
    },
    /// Donate more quota to a delivered session
    Upgrade {
        /// Request id of the session
        id: RequestId,
        /// Argument string with the additional quota
        args: String,
    },
    /// Close a session
    Close {
        /// Request id of the session
        id: RequestId,
    },
}

impl SessionRequest {
    /// Request id.
    pub fn id(&self) -> RequestId {
        match self {
            SessionRequest::Create { id, .. }
            | SessionRequest::Upgrade { id, .. }
            | SessionRequest::Close { id } => *id,
        }
    }
}

/// An answer relayed to the requesting side
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionResponse {
    /// Session capability is available
    Delivered {
        /// Request id
        id: RequestId,
        /// The session
        cap: SessionCap,
    },
    /// Request denied
    ServiceDenied {
        /// Request id
        id: RequestId,
    },
    /// Not enough RAM donated
    InsufficientRamQuota {
        /// Request id
        id: RequestId,
    },
    /// Not enough capability slots donated
    InsufficientCapQuota {
        /// Request id
        id: RequestId,
    },
    /// Upgrade applied
    Upgraded {
        /// Request id
        id: RequestId,
    },
    /// Session closed, quota returned
    Closed {
        /// Request id
        id: RequestId,
    },
}

impl SessionResponse {
    /// Request id.
    pub fn id(&self) -> RequestId {
        match self {
            SessionResponse::Delivered { id, .. }
            | SessionResponse::ServiceDenied { id }
            | SessionResponse::InsufficientRamQuota { id }
            | SessionResponse::InsufficientCapQuota { id }
            | SessionResponse::Upgraded { id }
            | SessionResponse::Closed { id } => *id,
        }
    }
}

/// Server-side state of one forwarded session.
#[derive(Clone, Debug)]
pub struct ForwardedSession {
    /// Request id
    pub id: RequestId,
    /// Requested service
    pub service_name: String,
    /// Arguments as requested
    pub args: SessionArgs,
    /// Current phase
    pub phase: SessionPhase,
    /// Route in effect; `None` while waiting for the target to appear
    pub route: Option<Route>,
    /// Capability, once created
    pub cap: Option<SessionCap>,
    /// Quota taken from the donor
    pub donated: Quota,
    /// Part of `donated` held by the provider
    pub forwarded: Quota,
    /// Upgrade amount awaiting provider confirmation
    pub pending_upgrade: Quota,
}

impl ForwardedSession {
    /// Fresh request, not yet routed.
    pub fn new(id: RequestId, service_name: String, args: SessionArgs) -> Self {
        Self {
            id,
            service_name,
            args,
            phase: SessionPhase::CreateRequested,
            route: None,
            cap: None,
            donated: Quota::ZERO,
            forwarded: Quota::ZERO,
            pending_upgrade: Quota::ZERO,
        }
    }

    /// Waiting for its route target to appear.
    pub fn is_pending(&self) -> bool {
        self.phase == SessionPhase::CreateRequested && self.route.is_none()
    }

    /// Capability delivered and not being closed.
    pub fn is_live(&self) -> bool {
        matches!(
            self.phase,
            SessionPhase::CapHandedOut | SessionPhase::UpgradeRequested
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_session_is_pending() {
        let s = ForwardedSession::new(RequestId(1), "LOG".into(), SessionArgs::new());
        assert!(s.is_pending());
        assert!(!s.is_live());
        assert_eq!(s.donated, Quota::ZERO);
    }

    #[test]
    fn test_ids() {
        let request = SessionRequest::Close { id: RequestId(4) };
        assert_eq!(request.id(), RequestId(4));
        let response = SessionResponse::Delivered {
            id: RequestId(5),
            cap: SessionCap(9),
        };
        assert_eq!(response.id(), RequestId(5));
    }
}
