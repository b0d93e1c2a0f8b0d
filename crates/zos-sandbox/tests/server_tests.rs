//! Nested server integration tests
//!
//! Forwarded session requests driven through the phase state machine, with
//! the bookkeeping cost retained by the server.

mod common;

use std::cell::RefCell;
use std::rc::Rc;

use common::{account, CreateMode, MockRoot};
use zos_sandbox::{
    check_server_invariants, CloseResponse, LabelMatch, ProviderError, Quota, QuotaAccount,
    RequestId, RouteResolver, RouteRule, RouteTarget, RoutingPolicy, Server, ServerId, Service,
    ServiceMatch, SessionPhase, SessionRequest, SessionResponse, StateEvent, StateJournal,
    StateReporter, UpgradeResponse,
};

const COST: u64 = 1024;

struct Fixture {
    server: Server,
    resolver: Rc<RefCell<RouteResolver>>,
    donor: Rc<QuotaAccount>,
    sandbox: Rc<QuotaAccount>,
    parent_account: Rc<QuotaAccount>,
    parent: Rc<MockRoot>,
    journal: Rc<StateJournal>,
}

fn rules() -> Vec<RouteRule> {
    vec![
        RouteRule {
            service: ServiceMatch::Named("LOG".into()),
            label: LabelMatch::Any,
            target: RouteTarget::Parent,
            target_label: None,
        },
        RouteRule {
            service: ServiceMatch::Named("File_system".into()),
            label: LabelMatch::Any,
            target: RouteTarget::Child("fs".into()),
            target_label: None,
        },
    ]
}

fn fixture() -> Fixture {
    let parent_account = account("parent", 0);
    let parent = MockRoot::new(1000);
    let mut resolver = RouteResolver::new(RoutingPolicy {
        rules: rules(),
        ..RoutingPolicy::default()
    });
    resolver.add_parent_service(Service::parent("LOG", parent_account.clone(), parent.clone()));
    let resolver = Rc::new(RefCell::new(resolver));

    let donor = account("client", 10_000);
    let sandbox = account("sandbox", 0);
    let journal = Rc::new(StateJournal::new());
    let reporter: Rc<dyn StateReporter> = journal.clone();
    let server = Server::new(
        resolver.clone(),
        sandbox.clone(),
        donor.clone(),
        Quota::ram(COST),
        Some(reporter),
    );

    Fixture {
        server,
        resolver,
        donor,
        sandbox,
        parent_account,
        parent,
        journal,
    }
}

fn create(id: u64, service: &str, args: &str) -> SessionRequest {
    SessionRequest::Create {
        id: RequestId(id),
        service: service.into(),
        args: args.into(),
    }
}

fn upgrade(id: u64, args: &str) -> SessionRequest {
    SessionRequest::Upgrade {
        id: RequestId(id),
        args: args.into(),
    }
}

fn close(id: u64) -> SessionRequest {
    SessionRequest::Close { id: RequestId(id) }
}

/// Balances of donor, sandbox and parent.
fn balances(f: &Fixture) -> (u64, u64, u64) {
    (f.donor.ram(), f.sandbox.ram(), f.parent_account.ram())
}

// ============================================================================
// Create
// ============================================================================

#[test]
fn test_create_forwards_quota_minus_local_cost() {
    let mut f = fixture();
    let responses = f
        .server
        .handle_session_requests(&[create(1, "LOG", "ram_quota=4096, label=app")]);

    assert!(matches!(
        responses.as_slice(),
        [SessionResponse::Delivered { id: RequestId(1), .. }]
    ));
    assert_eq!(balances(&f), (10_000 - 4096, COST, 4096 - COST));
    assert_eq!(
        f.parent.create_calls(),
        vec![format!("ram_quota={}, label=app, cap_quota=0", 4096 - COST)]
    );

    let session = f.server.session(RequestId(1)).unwrap();
    assert_eq!(session.phase, SessionPhase::CapHandedOut);
    assert_eq!(session.donated, Quota::ram(4096));
    assert_eq!(session.forwarded, Quota::ram(4096 - COST));
    assert!(check_server_invariants(&f.server).is_empty());
}

#[test]
fn test_donation_below_local_cost_rejected_before_provider() {
    let mut f = fixture();
    let responses = f
        .server
        .handle_session_requests(&[create(1, "LOG", "ram_quota=512")]);

    assert_eq!(
        responses,
        vec![SessionResponse::InsufficientRamQuota { id: RequestId(1) }]
    );
    assert!(f.parent.calls().is_empty());
    assert_eq!(balances(&f), (10_000, 0, 0));
    assert_eq!(f.server.session_count(), 0);
}

#[test]
fn test_cap_cost_rejected_before_provider() {
    let parent_account = account("parent", 0);
    let parent = MockRoot::new(1);
    let mut resolver = RouteResolver::new(RoutingPolicy {
        rules: rules(),
        ..RoutingPolicy::default()
    });
    resolver.add_parent_service(Service::parent("LOG", parent_account, parent.clone()));
    let mut server = Server::new(
        Rc::new(RefCell::new(resolver)),
        account("sandbox", 0),
        account("client", 10_000),
        Quota::new(COST, 1),
        None,
    );

    let responses = server.handle_session_requests(&[create(1, "LOG", "ram_quota=2048")]);
    assert_eq!(
        responses,
        vec![SessionResponse::InsufficientCapQuota { id: RequestId(1) }]
    );
    assert!(parent.calls().is_empty());
}

#[test]
fn test_unrouted_and_malformed_requests_denied() {
    let mut f = fixture();
    let responses = f.server.handle_session_requests(&[
        create(1, "Nic", "ram_quota=4096"),
        create(2, "LOG", "ram_quota"),
        create(3, "", "ram_quota=4096"),
    ]);

    assert_eq!(
        responses,
        vec![
            SessionResponse::ServiceDenied { id: RequestId(1) },
            SessionResponse::ServiceDenied { id: RequestId(2) },
            SessionResponse::ServiceDenied { id: RequestId(3) },
        ]
    );
    assert_eq!(balances(&f), (10_000, 0, 0));
}

#[test]
fn test_provider_rejection_unwinds_both_hops() {
    let mut f = fixture();
    f.parent
        .set_create_mode(CreateMode::Fail(ProviderError::InsufficientCapQuota));
    let responses = f
        .server
        .handle_session_requests(&[create(1, "LOG", "ram_quota=4096")]);

    assert_eq!(
        responses,
        vec![SessionResponse::InsufficientCapQuota { id: RequestId(1) }]
    );
    assert_eq!(balances(&f), (10_000, 0, 0));
    assert_eq!(f.server.session_count(), 0);
}

#[test]
fn test_donor_short_of_quota() {
    let mut f = fixture();
    let responses = f
        .server
        .handle_session_requests(&[create(1, "LOG", "ram_quota=20000")]);

    assert_eq!(
        responses,
        vec![SessionResponse::InsufficientRamQuota { id: RequestId(1) }]
    );
    assert!(f.parent.calls().is_empty());
    assert_eq!(balances(&f), (10_000, 0, 0));
}

#[test]
fn test_duplicate_request_id_ignored() {
    let mut f = fixture();
    f.server
        .handle_session_requests(&[create(1, "LOG", "ram_quota=2048")]);
    let responses = f
        .server
        .handle_session_requests(&[create(1, "LOG", "ram_quota=2048")]);

    assert!(responses.is_empty());
    assert_eq!(f.parent.create_calls().len(), 1);
}

// ============================================================================
// Pending and deferred requests
// ============================================================================

#[test]
fn test_absent_target_stays_pending_until_policy_update() {
    let mut f = fixture();
    let responses = f
        .server
        .handle_session_requests(&[create(1, "File_system", "ram_quota=4096")]);

    assert!(responses.is_empty());
    let session = f.server.session(RequestId(1)).unwrap();
    assert!(session.is_pending());
    assert_eq!(balances(&f), (10_000, 0, 0));
    assert!(check_server_invariants(&f.server).is_empty());

    // Retried only when the policy is reapplied
    let fs_account = account("fs", 0);
    let fs = MockRoot::new(50);
    {
        let mut resolver = f.resolver.borrow_mut();
        resolver.declare_child_service(Service::routed(
            "File_system",
            ServerId(4),
            "fs",
            fs_account.clone(),
        ));
        resolver.announce(ServerId(4), "File_system", fs.clone()).unwrap();
    }
    assert!(f.server.session(RequestId(1)).unwrap().is_pending());

    let responses = f.server.apply_updated_policy();
    assert!(matches!(
        responses.as_slice(),
        [SessionResponse::Delivered { id: RequestId(1), .. }]
    ));
    assert_eq!(fs_account.ram(), 4096 - COST);
    assert_eq!(f.donor.ram(), 10_000 - 4096);
}

#[test]
fn test_close_of_pending_request_is_immediate() {
    let mut f = fixture();
    f.server
        .handle_session_requests(&[create(1, "File_system", "ram_quota=4096")]);
    let responses = f.server.handle_session_requests(&[close(1)]);

    assert_eq!(responses, vec![SessionResponse::Closed { id: RequestId(1) }]);
    assert_eq!(f.server.session_count(), 0);
    assert_eq!(balances(&f), (10_000, 0, 0));
}

#[test]
fn test_deferred_create_completes_later() {
    let mut f = fixture();
    f.parent.set_create_mode(CreateMode::Defer);
    let responses = f
        .server
        .handle_session_requests(&[create(1, "LOG", "ram_quota=4096")]);

    assert!(responses.is_empty());
    assert_eq!(
        f.server.session(RequestId(1)).unwrap().phase,
        SessionPhase::CreateRequested
    );
    // Donation is committed while the provider works on it
    assert_eq!(balances(&f), (10_000 - 4096, COST, 4096 - COST));

    let cap = f.parent.take_cap();
    let response = f.server.complete_create(RequestId(1), Ok(cap));
    assert_eq!(
        response,
        Some(SessionResponse::Delivered {
            id: RequestId(1),
            cap
        })
    );
    assert_eq!(
        f.server.session(RequestId(1)).unwrap().phase,
        SessionPhase::CapHandedOut
    );

    // A second completion is not expected
    assert_eq!(f.server.complete_create(RequestId(1), Ok(cap)), None);
}

#[test]
fn test_deferred_create_failure_returns_quota() {
    let mut f = fixture();
    f.parent.set_create_mode(CreateMode::Defer);
    f.server
        .handle_session_requests(&[create(1, "LOG", "ram_quota=4096")]);

    let response = f
        .server
        .complete_create(RequestId(1), Err(ProviderError::InsufficientRamQuota));
    assert_eq!(
        response,
        Some(SessionResponse::InsufficientRamQuota { id: RequestId(1) })
    );
    assert_eq!(balances(&f), (10_000, 0, 0));
    assert_eq!(f.server.session_count(), 0);
}

#[test]
fn test_close_while_create_deferred() {
    let mut f = fixture();
    f.parent.set_create_mode(CreateMode::Defer);
    f.server
        .handle_session_requests(&[create(1, "LOG", "ram_quota=4096")]);

    assert!(f.server.handle_session_requests(&[close(1)]).is_empty());
    assert_eq!(
        f.server.session(RequestId(1)).unwrap().phase,
        SessionPhase::CloseRequested
    );

    let cap = f.parent.take_cap();
    let response = f.server.complete_create(RequestId(1), Ok(cap));
    assert_eq!(response, Some(SessionResponse::Closed { id: RequestId(1) }));
    assert_eq!(balances(&f), (10_000, 0, 0));
}

// ============================================================================
// Upgrade
// ============================================================================

#[test]
fn test_upgrade_forwards_full_amount() {
    let mut f = fixture();
    f.server
        .handle_session_requests(&[create(1, "LOG", "ram_quota=4096")]);
    let responses = f.server.handle_session_requests(&[upgrade(1, "ram_quota=2000")]);

    assert_eq!(responses, vec![SessionResponse::Upgraded { id: RequestId(1) }]);
    assert_eq!(balances(&f), (10_000 - 6096, COST, 6096 - COST));

    let session = f.server.session(RequestId(1)).unwrap();
    assert_eq!(session.donated, Quota::ram(6096));
    assert_eq!(session.phase, SessionPhase::CapHandedOut);
}

#[test]
fn test_failed_upgrade_unwinds() {
    let mut f = fixture();
    f.server
        .handle_session_requests(&[create(1, "LOG", "ram_quota=4096")]);
    f.parent
        .set_upgrade_response(Err(ProviderError::InsufficientRamQuota));

    let responses = f.server.handle_session_requests(&[upgrade(1, "ram_quota=2000")]);
    assert_eq!(
        responses,
        vec![SessionResponse::InsufficientRamQuota { id: RequestId(1) }]
    );
    assert_eq!(balances(&f), (10_000 - 4096, COST, 4096 - COST));
    assert_eq!(
        f.server.session(RequestId(1)).unwrap().phase,
        SessionPhase::CapHandedOut
    );
}

#[test]
fn test_deferred_upgrade() {
    let mut f = fixture();
    f.server
        .handle_session_requests(&[create(1, "LOG", "ram_quota=4096")]);
    f.parent.set_upgrade_response(Ok(UpgradeResponse::Deferred));

    assert!(f
        .server
        .handle_session_requests(&[upgrade(1, "ram_quota=1000")])
        .is_empty());
    assert_eq!(
        f.server.session(RequestId(1)).unwrap().phase,
        SessionPhase::UpgradeRequested
    );

    let response = f
        .server
        .complete_upgrade(RequestId(1), Err(ProviderError::Denied));
    assert_eq!(response, Some(SessionResponse::ServiceDenied { id: RequestId(1) }));
    assert_eq!(balances(&f), (10_000 - 4096, COST, 4096 - COST));
    assert_eq!(f.server.session(RequestId(1)).unwrap().donated, Quota::ram(4096));
}

#[test]
fn test_upgrade_of_unknown_session_ignored() {
    let mut f = fixture();
    assert!(f
        .server
        .handle_session_requests(&[upgrade(9, "ram_quota=1000")])
        .is_empty());
    assert_eq!(f.donor.ram(), 10_000);
}

// ============================================================================
// Close
// ============================================================================

#[test]
fn test_close_returns_full_donation() {
    let mut f = fixture();
    f.server.handle_session_requests(&[
        create(1, "LOG", "ram_quota=4096"),
        upgrade(1, "ram_quota=2000"),
    ]);
    let responses = f.server.handle_session_requests(&[close(1)]);

    assert_eq!(responses, vec![SessionResponse::Closed { id: RequestId(1) }]);
    assert_eq!(balances(&f), (10_000, 0, 0));
    assert!(f.server.session(RequestId(1)).is_none());

    // Second close does nothing
    assert!(f.server.handle_session_requests(&[close(1)]).is_empty());
    assert_eq!(f.donor.ram(), 10_000);
}

#[test]
fn test_deferred_close() {
    let mut f = fixture();
    f.server
        .handle_session_requests(&[create(1, "LOG", "ram_quota=4096")]);
    f.parent.set_close_response(Ok(CloseResponse::Deferred));

    assert!(f.server.handle_session_requests(&[close(1)]).is_empty());
    assert_eq!(
        f.server.session(RequestId(1)).unwrap().phase,
        SessionPhase::CloseRequested
    );
    assert_eq!(f.donor.ram(), 10_000 - 4096);

    let response = f.server.complete_close(RequestId(1));
    assert_eq!(response, Some(SessionResponse::Closed { id: RequestId(1) }));
    assert_eq!(balances(&f), (10_000, 0, 0));
}

#[test]
fn test_blocking_canceled_close_completes() {
    let mut f = fixture();
    f.server
        .handle_session_requests(&[create(1, "LOG", "ram_quota=4096")]);
    f.parent
        .set_close_response(Err(ProviderError::BlockingCanceled));

    let responses = f.server.handle_session_requests(&[close(1)]);
    assert_eq!(responses, vec![SessionResponse::Closed { id: RequestId(1) }]);
    assert_eq!(balances(&f), (10_000, 0, 0));
}

// ============================================================================
// Policy updates
// ============================================================================

#[test]
fn test_unchanged_policy_keeps_sessions() {
    let mut f = fixture();
    f.server
        .handle_session_requests(&[create(1, "LOG", "ram_quota=4096")]);

    assert!(f.server.apply_updated_policy().is_empty());
    assert_eq!(
        f.server.session(RequestId(1)).unwrap().phase,
        SessionPhase::CapHandedOut
    );
}

#[test]
fn test_changed_route_closes_session() {
    let mut f = fixture();
    f.server
        .handle_session_requests(&[create(1, "LOG", "ram_quota=4096, label=app")]);

    let mut rewritten = rules();
    rewritten[0].target_label = Some("other".into());
    f.resolver.borrow_mut().set_policy(RoutingPolicy {
        rules: rewritten,
        ..RoutingPolicy::default()
    });

    let responses = f.server.apply_updated_policy();
    assert_eq!(responses, vec![SessionResponse::Closed { id: RequestId(1) }]);
    assert_eq!(balances(&f), (10_000, 0, 0));
    assert_eq!(f.server.session_count(), 0);
}

#[test]
fn test_vanished_route_closes_session() {
    let mut f = fixture();
    f.server
        .handle_session_requests(&[create(1, "LOG", "ram_quota=4096")]);

    f.resolver.borrow_mut().set_policy(RoutingPolicy::default());
    let responses = f.server.apply_updated_policy();

    assert_eq!(responses, vec![SessionResponse::Closed { id: RequestId(1) }]);
    assert_eq!(f.donor.ram(), 10_000);
}

#[test]
fn test_phase_changes_are_journaled() {
    let mut f = fixture();
    f.server.handle_session_requests(&[
        create(1, "LOG", "ram_quota=4096"),
        create(2, "Nic", "ram_quota=4096"),
        close(1),
    ]);
    f.server.apply_updated_policy();

    let events: Vec<StateEvent> = f.journal.entries().into_iter().map(|e| e.event).collect();
    let phase = |id: u64, service: &str, phase: SessionPhase| StateEvent::ForwardedPhase {
        id: RequestId(id),
        service: service.into(),
        phase,
    };
    assert_eq!(
        events,
        vec![
            phase(1, "LOG", SessionPhase::CapHandedOut),
            phase(2, "Nic", SessionPhase::ServiceDenied),
            phase(1, "LOG", SessionPhase::Closed),
            StateEvent::PolicyUpdated {
                closed: 0,
                retried: 0
            },
        ]
    );
}
