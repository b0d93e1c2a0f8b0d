//! Quota resizing of a running child
//!
//! A child is assigned quota from the broker account. When the supervisor
//! reconfigures it, the difference between the configured and the assigned
//! amount is settled here:
//!
//! ```text
//!   configured > assigned   apply_upgrade    broker ──▶ child
//!                                            (clamped to the broker balance)
//!   configured < assigned   apply_downgrade  child  ──▶ broker
//!                                            (keeps PRESERVED_QUOTA, the
//!                                             rest is demanded back)
//! ```
//!
//! A clamped upgrade leaves `assigned` below `configured`, so a later call
//! completes it once the broker has quota again.

use log::Level;

use zos_sandbox_core::{BrokerError, Quota, QuotaError, QuotaTransfer};

use super::Child;
use crate::report::StateEvent;

/// Quota a downgrade always leaves with the child
pub const PRESERVED_QUOTA: Quota = Quota::new(16 * 1024, 5);

/// Result of [`Child::apply_downgrade`]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Downgrade {
    /// Quota taken back from the child
    pub returned: Quota,
    /// Quota the child is asked to yield
    pub demanded: Quota,
}

impl Child {
    /// Quota transferred to the child so far.
    pub fn assigned_quota(&self) -> Quota {
        self.assigned.get()
    }

    /// Quota the child should have.
    pub fn configured_quota(&self) -> Quota {
        self.configured.get()
    }

    /// Outstanding resource request, if any.
    pub fn requested_resources(&self) -> Option<Quota> {
        self.requested.get()
    }

    /// Change the quota the child should have.
    ///
    /// Takes effect with the next [`apply_upgrade`](Self::apply_upgrade) or
    /// [`apply_downgrade`](Self::apply_downgrade).
    pub fn set_configured_quota(&self, quota: Quota) {
        self.configured.set(quota);
    }

    /// The child asks for more quota.
    ///
    /// The request is only recorded and reported; it is answered by the next
    /// upgrade that transfers anything.
    pub fn resource_request(&self, args: &str) -> Result<(), BrokerError> {
        let args = self.parse_args("resources", args)?;
        let amount = self.requested_quota("resources", &args)?;

        log::info!("child \"{}\" requests resources: {}", self.name, amount);
        self.requested.set(Some(amount));
        self.report(StateEvent::ResourcesRequested {
            child: self.name.clone(),
            amount,
        });
        Ok(())
    }

    /// Raise the assigned quota towards the configured one.
    ///
    /// Returns the amount transferred to the child.
    pub fn apply_upgrade(&self) -> Quota {
        let increment = self.configured.get().saturating_sub(self.assigned.get());
        if increment.is_zero() {
            return Quota::ZERO;
        }

        let limit = self.ref_account.balance();
        let amount = increment.min(limit);
        if amount != increment {
            self.log_resources(
                Level::Warn,
                format_args!(
                    "{}: insufficient quota for upgrade of {} (available {})",
                    self.name, increment, limit
                ),
            );
        }
        if amount.is_zero() {
            return Quota::ZERO;
        }

        let transfer = match QuotaTransfer::new(amount, &self.ref_account, &self.account) {
            Ok(transfer) => transfer,
            Err(e) => {
                log::error!("{}: upgrade by {} failed: {}", self.name, amount, e);
                return Quota::ZERO;
            }
        };
        transfer.acknowledge();
        self.assigned.set(self.assigned.get().saturating_add(amount));

        if self.requested.take().is_some() {
            log::debug!("{}: resource request answered", self.name);
        }
        self.report_adjusted(Quota::ZERO);
        amount
    }

    /// Lower the assigned quota towards the configured one.
    ///
    /// Takes back what the child has available beyond [`PRESERVED_QUOTA`].
    /// Whatever is still assigned above the configured quota afterwards is
    /// demanded from the child through a yield request.
    pub fn apply_downgrade(&self) -> Downgrade {
        let configured = self.configured.get();
        let decrement = self.assigned.get().saturating_sub(configured);
        if decrement.is_zero() {
            return Downgrade::default();
        }

        let spare = self.account.balance().saturating_sub(PRESERVED_QUOTA);
        let amount = decrement.min(spare);
        let returned = match self.take_back(amount) {
            Ok(()) => amount,
            Err(e) => {
                log::warn!("{}: downgrade by {} failed: {}", self.name, amount, e);
                Quota::ZERO
            }
        };
        self.assigned.set(self.assigned.get().saturating_sub(returned));

        let demanded = self.assigned.get().saturating_sub(configured);
        if !demanded.is_zero() {
            self.log_resources(
                Level::Info,
                format_args!("{}: yield request for {}", self.name, demanded),
            );
        }
        self.report_adjusted(demanded);
        Downgrade { returned, demanded }
    }

    /// The child yielded quota in response to a yield request.
    pub fn yield_response(&self) -> Downgrade {
        self.apply_downgrade()
    }

    fn take_back(&self, amount: Quota) -> Result<(), QuotaError> {
        if amount.is_zero() {
            return Ok(());
        }
        QuotaTransfer::new(amount, &self.account, &self.ref_account)?.acknowledge();
        Ok(())
    }

    fn report_adjusted(&self, demanded: Quota) {
        self.report(StateEvent::QuotaAdjusted {
            child: self.name.clone(),
            assigned: self.assigned.get(),
            demanded,
        });
    }

    fn log_resources(&self, level: Level, args: core::fmt::Arguments<'_>) {
        let level = if self.verbose { level } else { Level::Debug };
        log::log!(level, "{}", args);
    }
}
