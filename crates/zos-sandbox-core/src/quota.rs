//! Quota accounts and transactional quota transfer
//!
//! A [`QuotaAccount`] holds the RAM and capability balance of one component.
//! Balances only move through [`QuotaAccount::transfer`], which is
//! all-or-nothing across both currencies.
//!
//! Establishing a session involves several subsequent transfers (client →
//! broker → provider). If an intermediate step fails, all transfers that
//! already took place must be reverted. A [`QuotaTransfer`] guards one such
//! transfer: leaving its scope without [`QuotaTransfer::acknowledge`] (early
//! return, `?`) moves the amount back.
//!
//! # Properties (Verification Targets)
//!
//! 1. **Atomic**: a failed transfer mutates neither account
//! 2. **Conservative**: the sum of both balances is unchanged by a transfer
//! 3. **Reversible**: an unacknowledged guard restores both balances, as
//!    long as the receiver still holds the amount

use alloc::string::String;
use core::cell::Cell;
use core::fmt;

use crate::error::QuotaError;
use crate::types::Quota;

/// Ledger entry of one component.
///
/// Accounts are mutated from a single control thread only, hence the
/// `Cell`-based interior mutability.
pub struct QuotaAccount {
    /// Name used in diagnostics
    name: String,
    /// RAM balance in bytes
    ram: Cell<u64>,
    /// Capability-slot balance
    caps: Cell<u32>,
}

impl QuotaAccount {
    /// Create an account with an initial balance.
    pub fn new(name: impl Into<String>, initial: Quota) -> Self {
        Self {
            name: name.into(),
            ram: Cell::new(initial.ram),
            caps: Cell::new(initial.caps),
        }
    }

    /// Account name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current balance in both currencies.
    pub fn balance(&self) -> Quota {
        Quota::new(self.ram.get(), self.caps.get())
    }

    /// Current RAM balance.
    pub fn ram(&self) -> u64 {
        self.ram.get()
    }

    /// Current capability balance.
    pub fn caps(&self) -> u32 {
        self.caps.get()
    }

    /// Move `amount` from this account to `to`.
    ///
    /// Fails without touching either account if this account lacks the
    /// amount in any currency or if `to` would overflow. A transfer to the
    /// account itself is a no-op.
    pub fn transfer(&self, to: &QuotaAccount, amount: Quota) -> Result<(), QuotaError> {
        if core::ptr::eq(self, to) || amount.is_zero() {
            return Ok(());
        }

        let from_ram = self.ram.get();
        let from_caps = self.caps.get();

        if from_ram < amount.ram {
            return Err(QuotaError::InsufficientRam {
                requested: amount.ram,
                available: from_ram,
            });
        }
        if from_caps < amount.caps {
            return Err(QuotaError::InsufficientCaps {
                requested: amount.caps,
                available: from_caps,
            });
        }

        let to_ram = to.ram.get().checked_add(amount.ram).ok_or(QuotaError::Overflow)?;
        let to_caps = to.caps.get().checked_add(amount.caps).ok_or(QuotaError::Overflow)?;

        self.ram.set(from_ram - amount.ram);
        self.caps.set(from_caps - amount.caps);
        to.ram.set(to_ram);
        to.caps.set(to_caps);
        Ok(())
    }
}

impl fmt::Debug for QuotaAccount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QuotaAccount")
            .field("name", &self.name)
            .field("ram", &self.ram.get())
            .field("caps", &self.caps.get())
            .finish()
    }
}

/// Guard for one quota donation in flight.
///
/// The transfer happens on construction. Exactly one of two outcomes follows:
/// [`acknowledge`](Self::acknowledge) makes it final, or dropping the guard
/// transfers the amount back from `to` to `from`.
#[must_use = "an unacknowledged transfer is reverted when dropped"]
pub struct QuotaTransfer<'a> {
    amount: Quota,
    from: &'a QuotaAccount,
    to: &'a QuotaAccount,
    acked: bool,
}

impl<'a> QuotaTransfer<'a> {
    /// Transfer `amount` from `from` to `to` and guard the donation.
    pub fn new(
        amount: Quota,
        from: &'a QuotaAccount,
        to: &'a QuotaAccount,
    ) -> Result<Self, QuotaError> {
        if let Err(e) = from.transfer(to, amount) {
            log::warn!(
                "not enough quota for a donation of {} from '{}' to '{}': {}",
                amount,
                from.name(),
                to.name(),
                e
            );
            return Err(e);
        }
        Ok(Self {
            amount,
            from,
            to,
            acked: false,
        })
    }

    /// Amount in flight.
    pub fn amount(&self) -> Quota {
        self.amount
    }

    /// Make the donation final.
    pub fn acknowledge(mut self) {
        self.acked = true;
    }
}

impl Drop for QuotaTransfer<'_> {
    fn drop(&mut self) {
        if self.acked {
            return;
        }
        if let Err(e) = self.to.transfer(self.from, self.amount) {
            log::warn!(
                "could not revert donation of {} from '{}' back to '{}': {}",
                self.amount,
                self.to.name(),
                self.from.name(),
                e
            );
        }
    }
}

/// Run `f` with `amount` transferred from `from` to `to`.
///
/// The transfer is committed iff `f` returns `Ok`; a failing transfer is
/// reported through `E: From<QuotaError>`.
pub fn with_transfer<T, E, F>(
    amount: Quota,
    from: &QuotaAccount,
    to: &QuotaAccount,
    f: F,
) -> Result<T, E>
where
    E: From<QuotaError>,
    F: FnOnce() -> Result<T, E>,
{
    let guard = QuotaTransfer::new(amount, from, to)?;
    let value = f()?;
    guard.acknowledge();
    Ok(value)
}

// ============================================================================
// Kani Proofs for Transfer Atomicity
// ============================================================================

#[cfg(kani)]
mod proofs {
    use super::*;

    /// Proof: A failed transfer leaves both balances untouched
    #[kani::proof]
    fn failed_transfer_is_atomic() {
        let from = QuotaAccount::new("from", Quota::new(kani::any(), kani::any()));
        let to = QuotaAccount::new("to", Quota::new(kani::any(), kani::any()));
        let amount = Quota::new(kani::any(), kani::any());

        let before = (from.balance(), to.balance());
        if from.transfer(&to, amount).is_err() {
            kani::assert(
                (from.balance(), to.balance()) == before,
                "Failed transfer must not mutate either account",
            );
        }
    }

    /// Proof: An unacknowledged guard restores both balances
    #[kani::proof]
    fn dropped_guard_restores_balances() {
        let from = QuotaAccount::new("from", Quota::new(kani::any(), kani::any()));
        let to = QuotaAccount::new("to", Quota::new(kani::any(), kani::any()));
        let amount = Quota::new(kani::any(), kani::any());

        let before = (from.balance(), to.balance());
        {
            let _guard = QuotaTransfer::new(amount, &from, &to);
        }
        kani::assert(
            (from.balance(), to.balance()) == before,
            "Dropped guard must leave balances as they were",
        );
    }
}
