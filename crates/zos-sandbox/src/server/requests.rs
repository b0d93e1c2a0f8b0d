//! Create, upgrade and close handling plus provider completion callbacks.

use alloc::string::ToString;

use zos_sandbox_core::{
    BrokerError, Currency, ProviderError, Quota, QuotaTransfer, RequestId, SessionArgs,
    SessionCap, MAX_SERVICE_NAME_LEN,
};

use super::state::{ForwardedSession, SessionPhase, SessionResponse};
use super::Server;
use crate::route::Route;
use crate::service::{CloseResponse, CreateResponse, UpgradeResponse};

impl Server {
    // ========================================================================
    // Create
    // ========================================================================

    pub(super) fn handle_create(
        &mut self,
        id: RequestId,
        service: &str,
        args: &str,
    ) -> Option<SessionResponse> {
        if self.sessions.contains_key(&id) {
            log::warn!("duplicate session request {:?} ignored", id);
            return None;
        }
        if service.is_empty() || service.len() > MAX_SERVICE_NAME_LEN {
            log::warn!("session request {:?} with invalid service name", id);
            self.report_phase(id, service, SessionPhase::ServiceDenied);
            return Some(SessionResponse::ServiceDenied { id });
        }

        let args = match SessionArgs::parse(args) {
            Ok(args) => args,
            Err(e) => {
                log::warn!("session request {:?} for '{}': {}", id, service, e);
                self.report_phase(id, service, SessionPhase::ServiceDenied);
                return Some(SessionResponse::ServiceDenied { id });
            }
        };

        self.sessions
            .insert(id, ForwardedSession::new(id, service.to_string(), args));
        self.try_create(id)
    }

    /// Route a pending request and hand it to the provider.
    ///
    /// Returns `None` while the request stays pending or the provider
    /// deferred its answer.
    pub(super) fn try_create(&mut self, id: RequestId) -> Option<SessionResponse> {
        let (service_name, mut args) = match self.sessions.get(&id) {
            Some(s) if s.is_pending() => (s.service_name.clone(), s.args.clone()),
            _ => return None,
        };

        let amount = match args.quota() {
            Ok(amount) => amount,
            Err(e) => {
                log::warn!("session request {:?} for '{}': {}", id, service_name, e);
                return Some(self.reject(id, BrokerError::ServiceDenied));
            }
        };
        if let Some(currency) = amount.shortfall(&self.session_cost) {
            log::warn!(
                "session request {:?} for '{}' donates {}, below local cost {}",
                id,
                service_name,
                amount,
                self.session_cost
            );
            return Some(self.reject(id, BrokerError::QuotaExceeded(currency)));
        }

        let resolved = self.resolver.borrow().resolve(&service_name, args.label());
        let route = match resolved {
            Ok(route) => route,
            Err(BrokerError::ServiceNotPresent) => {
                log::debug!("session request {:?} for '{}' pending", id, service_name);
                return None;
            }
            Err(e) => return Some(self.reject(id, e)),
        };

        let forwarded = amount.saturating_sub(self.session_cost);
        args.set_quota(forwarded);
        args.set_label(&route.label);

        match self.create_at_provider(&route, amount, forwarded, &args) {
            Ok(CreateResponse::Created(cap)) => {
                let session = self.sessions.get_mut(&id)?;
                session.route = Some(route);
                session.cap = Some(cap);
                session.donated = amount;
                session.forwarded = forwarded;
                session.phase = SessionPhase::Available;
                Some(self.deliver(id, cap))
            }
            Ok(CreateResponse::Deferred) => {
                let session = self.sessions.get_mut(&id)?;
                session.route = Some(route);
                session.donated = amount;
                session.forwarded = forwarded;
                log::debug!("session request {:?} for '{}' deferred", id, service_name);
                None
            }
            Err(BrokerError::ServiceNotPresent) => None,
            Err(e) => Some(self.reject(id, e)),
        }
    }

    /// Donor → server (full amount), server → provider (forwarded part).
    ///
    /// Both transfers stay in place if the provider accepted the request,
    /// immediately or deferred.
    fn create_at_provider(
        &self,
        route: &Route,
        amount: Quota,
        forwarded: Quota,
        args: &SessionArgs,
    ) -> Result<CreateResponse, BrokerError> {
        let from_donor = QuotaTransfer::new(amount, &self.donor, &self.account)?;
        let to_provider = QuotaTransfer::new(forwarded, &self.account, route.service.account())?;

        let response = route.service.create_session(args)?;
        if let CreateResponse::Created(cap) = response {
            if !cap.is_valid() {
                log::warn!("'{}' returned an invalid session", route.service.name());
                return Err(BrokerError::ServiceDenied);
            }
        }

        to_provider.acknowledge();
        from_donor.acknowledge();
        Ok(response)
    }

    fn deliver(&mut self, id: RequestId, cap: SessionCap) -> SessionResponse {
        if let Some(session) = self.sessions.get_mut(&id) {
            session.phase = SessionPhase::CapHandedOut;
        }
        if let Some(session) = self.sessions.get(&id) {
            self.log_session(format_args!(
                "session {:?} of '{}' delivered ({})",
                id, session.service_name, session.donated
            ));
            self.report_phase(id, &session.service_name, SessionPhase::CapHandedOut);
        }
        SessionResponse::Delivered { id, cap }
    }

    /// Drop a request and answer with the matching denial.
    fn reject(&mut self, id: RequestId, error: BrokerError) -> SessionResponse {
        let (phase, response) = rejection(id, error);
        if let Some(session) = self.sessions.remove(&id) {
            log::debug!(
                "session request {:?} for '{}' rejected: {}",
                id,
                session.service_name,
                error
            );
            self.report_phase(id, &session.service_name, phase);
        }
        response
    }

    // ========================================================================
    // Upgrade
    // ========================================================================

    pub(super) fn handle_upgrade(&mut self, id: RequestId, args: &str) -> Option<SessionResponse> {
        let Some(session) = self.sessions.get(&id) else {
            log::warn!("upgrade of unknown session request {:?}", id);
            return None;
        };
        if session.phase != SessionPhase::CapHandedOut {
            log::warn!("upgrade of session {:?} in phase {:?} ignored", id, session.phase);
            return None;
        }
        let (route, cap) = match (&session.route, session.cap) {
            (Some(route), Some(cap)) => (route.clone(), cap),
            _ => return None,
        };

        let amount = match SessionArgs::parse(args).and_then(|a| a.quota()) {
            Ok(amount) => amount,
            Err(e) => {
                log::warn!("upgrade of session {:?}: {}", id, e);
                return Some(SessionResponse::ServiceDenied { id });
            }
        };
        let mut provider_args = SessionArgs::new();
        provider_args.set_quota(amount);

        if let Some(session) = self.sessions.get_mut(&id) {
            session.phase = SessionPhase::UpgradeRequested;
        }

        let outcome = self.upgrade_at_provider(&route, cap, amount, &provider_args);
        let session = self.sessions.get_mut(&id)?;
        match outcome {
            Ok(UpgradeResponse::Confirmed) => {
                session.donated = session.donated.saturating_add(amount);
                session.forwarded = session.forwarded.saturating_add(amount);
                session.phase = SessionPhase::CapHandedOut;
                self.finish_upgrade(id);
                Some(SessionResponse::Upgraded { id })
            }
            Ok(UpgradeResponse::Deferred) => {
                session.donated = session.donated.saturating_add(amount);
                session.forwarded = session.forwarded.saturating_add(amount);
                session.pending_upgrade = amount;
                None
            }
            Err(e) => {
                session.phase = SessionPhase::CapHandedOut;
                Some(rejection(id, e).1)
            }
        }
    }

    fn upgrade_at_provider(
        &self,
        route: &Route,
        cap: SessionCap,
        amount: Quota,
        args: &SessionArgs,
    ) -> Result<UpgradeResponse, BrokerError> {
        let from_donor = QuotaTransfer::new(amount, &self.donor, &self.account)?;
        let to_provider = QuotaTransfer::new(amount, &self.account, route.service.account())?;

        let response = route.service.upgrade_session(cap, args)?;

        to_provider.acknowledge();
        from_donor.acknowledge();
        Ok(response)
    }

    fn finish_upgrade(&self, id: RequestId) {
        if let Some(session) = self.sessions.get(&id) {
            self.log_session(format_args!(
                "session {:?} of '{}' upgraded to {}",
                id, session.service_name, session.donated
            ));
            self.report_phase(id, &session.service_name, SessionPhase::CapHandedOut);
        }
    }

    // ========================================================================
    // Close
    // ========================================================================

    pub(super) fn handle_close(&mut self, id: RequestId) -> Option<SessionResponse> {
        let Some(session) = self.sessions.get_mut(&id) else {
            log::warn!("close of unknown session request {:?}", id);
            return None;
        };

        if session.is_pending() {
            // Never reached a provider, nothing was donated
            let service_name = session.service_name.clone();
            self.sessions.remove(&id);
            self.report_phase(id, &service_name, SessionPhase::Closed);
            return Some(SessionResponse::Closed { id });
        }

        match session.phase {
            SessionPhase::CreateRequested => {
                session.phase = SessionPhase::CloseRequested;
                None
            }
            SessionPhase::CapHandedOut | SessionPhase::UpgradeRequested => self.begin_close(id),
            _ => None,
        }
    }

    /// Ask the provider to close a delivered session.
    pub(super) fn begin_close(&mut self, id: RequestId) -> Option<SessionResponse> {
        let session = self.sessions.get_mut(&id)?;
        session.phase = SessionPhase::CloseRequested;
        let (route, cap) = match (&session.route, session.cap) {
            (Some(route), Some(cap)) => (route.clone(), cap),
            _ => return None,
        };

        match route.service.close_session(cap) {
            Ok(CloseResponse::Deferred) => None,
            Ok(CloseResponse::Closed) => Some(self.finish_close(id)),
            Err(BrokerError::BlockingCanceled) => {
                log::warn!("blocking close of session {:?} canceled, closing locally", id);
                Some(self.finish_close(id))
            }
            Err(e) => {
                log::warn!("provider failed to close session {:?}: {}", id, e);
                Some(self.finish_close(id))
            }
        }
    }

    /// Give all quota back and forget the session.
    fn finish_close(&mut self, id: RequestId) -> SessionResponse {
        if let Some(session) = self.sessions.remove(&id) {
            self.return_quota(session.route.as_ref(), session.forwarded, session.donated);
            self.log_session(format_args!(
                "session {:?} of '{}' closed",
                id, session.service_name
            ));
            self.report_phase(id, &session.service_name, SessionPhase::Closed);
        }
        SessionResponse::Closed { id }
    }

    /// Provider → server (`forwarded`), server → donor (`donated`).
    ///
    /// Best effort: shortfalls are logged, the caller proceeds regardless.
    fn return_quota(&self, route: Option<&Route>, forwarded: Quota, donated: Quota) {
        if let Some(route) = route {
            if let Err(e) = route.service.account().transfer(&self.account, forwarded) {
                log::error!(
                    "misbehaving server '{}' did not return {}: {}",
                    route.service.name(),
                    forwarded,
                    e
                );
            }
        }
        if let Err(e) = self.account.transfer(&self.donor, donated) {
            log::error!("could not return {} to '{}': {}", donated, self.donor.name(), e);
        }
    }

    // ========================================================================
    // Completion callbacks
    // ========================================================================

    /// The provider finished a deferred creation.
    pub fn complete_create(
        &mut self,
        id: RequestId,
        result: Result<SessionCap, ProviderError>,
    ) -> Option<SessionResponse> {
        let Some(session) = self.sessions.get_mut(&id) else {
            log::warn!("creation completed for unknown request {:?}", id);
            return None;
        };
        let awaiting = session.route.is_some()
            && session.cap.is_none()
            && matches!(
                session.phase,
                SessionPhase::CreateRequested | SessionPhase::CloseRequested
            );
        if !awaiting {
            log::warn!("unexpected creation completion for {:?}", id);
            return None;
        }
        let closing = session.phase == SessionPhase::CloseRequested;

        match result {
            Ok(cap) if cap.is_valid() => {
                session.cap = Some(cap);
                if closing {
                    self.begin_close(id)
                } else {
                    session.phase = SessionPhase::Available;
                    Some(self.deliver(id, cap))
                }
            }
            result => {
                let error = match result {
                    Err(e) => BrokerError::from(e),
                    Ok(_) => BrokerError::ServiceDenied,
                };
                let (route, forwarded, donated) =
                    (session.route.clone(), session.forwarded, session.donated);
                self.return_quota(route.as_ref(), forwarded, donated);
                if let Some(session) = self.sessions.get_mut(&id) {
                    session.donated = Quota::ZERO;
                    session.forwarded = Quota::ZERO;
                }
                if closing {
                    Some(self.finish_close(id))
                } else {
                    Some(self.reject(id, error))
                }
            }
        }
    }

    /// The provider finished a deferred upgrade.
    pub fn complete_upgrade(
        &mut self,
        id: RequestId,
        result: Result<(), ProviderError>,
    ) -> Option<SessionResponse> {
        let Some(session) = self.sessions.get_mut(&id) else {
            log::warn!("upgrade completed for unknown request {:?}", id);
            return None;
        };
        if session.phase != SessionPhase::UpgradeRequested {
            log::warn!("unexpected upgrade completion for {:?}", id);
            return None;
        }

        let amount = session.pending_upgrade;
        session.pending_upgrade = Quota::ZERO;
        session.phase = SessionPhase::CapHandedOut;

        match result {
            Ok(()) => {
                self.finish_upgrade(id);
                Some(SessionResponse::Upgraded { id })
            }
            Err(e) => {
                session.donated = session.donated.saturating_sub(amount);
                session.forwarded = session.forwarded.saturating_sub(amount);
                let route = session.route.clone();
                self.return_quota(route.as_ref(), amount, amount);
                Some(rejection(id, BrokerError::from(e)).1)
            }
        }
    }

    /// The provider finished a deferred close.
    pub fn complete_close(&mut self, id: RequestId) -> Option<SessionResponse> {
        match self.sessions.get(&id) {
            Some(s) if s.phase == SessionPhase::CloseRequested && s.cap.is_some() => {
                Some(self.finish_close(id))
            }
            Some(_) => {
                log::warn!("unexpected close completion for {:?}", id);
                None
            }
            None => {
                log::warn!("close completed for unknown request {:?}", id);
                None
            }
        }
    }
}

/// Terminal phase and response for a failed request.
fn rejection(id: RequestId, error: BrokerError) -> (SessionPhase, SessionResponse) {
    match error {
        BrokerError::QuotaExceeded(Currency::Ram) => (
            SessionPhase::InsufficientRamQuota,
            SessionResponse::InsufficientRamQuota { id },
        ),
        BrokerError::QuotaExceeded(Currency::Caps) => (
            SessionPhase::InsufficientCapQuota,
            SessionResponse::InsufficientCapQuota { id },
        ),
        _ => (
            SessionPhase::ServiceDenied,
            SessionResponse::ServiceDenied { id },
        ),
    }
}
