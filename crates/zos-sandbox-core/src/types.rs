//! Core sandbox types
//!
//! This module contains the fundamental identifiers and amounts used
//! throughout the broker. All types here are pure data.

use core::fmt;
use serde::{Deserialize, Serialize};

/// Maximum length of a service name
pub const MAX_SERVICE_NAME_LEN: usize = 64;

/// Maximum length of a session-argument string
pub const MAX_ARGS_LEN: usize = 4096;

/// Maximum length of a session label
pub const MAX_LABEL_LEN: usize = 160;

/// Length of the debug identifier kept per session record
pub const IDENT_LEN: usize = 32;

/// Opaque session capability
///
/// Providers hand out their own; a child hands its client ids it minted
/// itself, so capabilities of different providers never collide.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SessionCap(pub u64);

impl SessionCap {
    /// The invalid capability
    pub const INVALID: SessionCap = SessionCap(0);

    /// Check whether the capability refers to anything
    pub fn is_valid(&self) -> bool {
        self.0 != 0
    }
}

/// Identity of a component providing services
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ServerId(pub u64);

impl ServerId {
    /// Our own parent
    pub const PARENT: ServerId = ServerId(0);
}

/// Identifier of a forwarded session request
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RequestId(pub u64);

/// The two independent quota currencies
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Currency {
    /// RAM bytes
    Ram,
    /// Capability slots
    Caps,
}

impl fmt::Display for Currency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Currency::Ram => write!(f, "RAM"),
            Currency::Caps => write!(f, "capability"),
        }
    }
}

/// An amount in both currencies
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Quota {
    /// RAM bytes
    #[serde(default)]
    pub ram: u64,
    /// Capability slots
    #[serde(default)]
    pub caps: u32,
}

impl Quota {
    /// The empty amount
    pub const ZERO: Quota = Quota { ram: 0, caps: 0 };

    /// Create an amount
    pub const fn new(ram: u64, caps: u32) -> Self {
        Self { ram, caps }
    }

    /// RAM-only amount
    pub const fn ram(ram: u64) -> Self {
        Self { ram, caps: 0 }
    }

    /// Check if both currencies are zero
    pub fn is_zero(&self) -> bool {
        self.ram == 0 && self.caps == 0
    }

    /// Add two amounts, `None` on overflow
    pub fn checked_add(self, other: Quota) -> Option<Quota> {
        Some(Quota {
            ram: self.ram.checked_add(other.ram)?,
            caps: self.caps.checked_add(other.caps)?,
        })
    }

    /// Subtract, `None` if either currency would go negative
    pub fn checked_sub(self, other: Quota) -> Option<Quota> {
        Some(Quota {
            ram: self.ram.checked_sub(other.ram)?,
            caps: self.caps.checked_sub(other.caps)?,
        })
    }

    /// Add, clamping each currency at its maximum
    pub fn saturating_add(self, other: Quota) -> Quota {
        Quota {
            ram: self.ram.saturating_add(other.ram),
            caps: self.caps.saturating_add(other.caps),
        }
    }

    /// Subtract, clamping each currency at zero
    pub fn saturating_sub(self, other: Quota) -> Quota {
        Quota {
            ram: self.ram.saturating_sub(other.ram),
            caps: self.caps.saturating_sub(other.caps),
        }
    }

    /// Smaller of both amounts, per currency
    pub fn min(self, other: Quota) -> Quota {
        Quota {
            ram: self.ram.min(other.ram),
            caps: self.caps.min(other.caps),
        }
    }

    /// Check if `self` is at least `other` in both currencies
    pub fn covers(&self, other: &Quota) -> bool {
        self.shortfall(other).is_none()
    }

    /// First currency in which `self` falls short of `required`
    pub fn shortfall(&self, required: &Quota) -> Option<Currency> {
        if self.ram < required.ram {
            Some(Currency::Ram)
        } else if self.caps < required.caps {
            Some(Currency::Caps)
        } else {
            None
        }
    }
}

impl fmt::Display for Quota {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ram={} caps={}", self.ram, self.caps)
    }
}
