//! Error types for the sandbox broker.

use alloc::string::String;
use thiserror::Error;

use crate::types::Currency;

/// Errors from quota-account operations.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum QuotaError {
    /// Source account lacks RAM
    #[error("insufficient RAM quota: requested {requested}, available {available}")]
    InsufficientRam {
        /// Bytes requested
        requested: u64,
        /// Bytes available at the source
        available: u64,
    },

    /// Source account lacks capability slots
    #[error("insufficient cap quota: requested {requested}, available {available}")]
    InsufficientCaps {
        /// Slots requested
        requested: u32,
        /// Slots available at the source
        available: u32,
    },

    /// Destination balance would overflow
    #[error("quota overflow at destination")]
    Overflow,
}

impl QuotaError {
    /// The currency the failure refers to.
    pub fn currency(&self) -> Currency {
        match self {
            QuotaError::InsufficientCaps { .. } => Currency::Caps,
            QuotaError::InsufficientRam { .. } | QuotaError::Overflow => Currency::Ram,
        }
    }
}

/// Errors from parsing a session-argument string.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum ArgsError {
    /// Argument string exceeds the maximum length
    #[error("argument string too long ({0} bytes)")]
    TooLong(usize),

    /// An entry lacks the `=` separator
    #[error("missing '=' in argument '{0}'")]
    MissingSeparator(String),

    /// Key is empty or contains invalid characters
    #[error("invalid argument key '{0}'")]
    InvalidKey(String),

    /// Quoted value is not terminated
    #[error("unterminated quote in argument string")]
    UnterminatedQuote,

    /// Value of an interpreted key cannot be parsed
    #[error("invalid value for '{key}': {value}")]
    InvalidValue {
        /// Which key
        key: &'static str,
        /// Offending value
        value: String,
    },
}

/// Answers of a provider that refuses a request.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Error)]
pub enum ProviderError {
    /// Bad arguments or policy mismatch at the provider
    #[error("request denied by provider")]
    Denied,

    /// Donated RAM does not cover the session
    #[error("insufficient RAM quota donated")]
    InsufficientRamQuota,

    /// Donated capability slots do not cover the session
    #[error("insufficient cap quota donated")]
    InsufficientCapQuota,

    /// A blocking call to the provider was canceled by a watchdog
    #[error("blocking call canceled")]
    BlockingCanceled,
}

/// Errors surfaced by the session broker.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Error)]
pub enum BrokerError {
    /// Insufficient balance at some hop; accounts are unchanged
    #[error("{0} quota exceeded")]
    QuotaExceeded(Currency),

    /// No route matches, or the provider refused the request
    #[error("service denied")]
    ServiceDenied,

    /// A route matched but its target is not instantiated (yet)
    #[error("service not present")]
    ServiceNotPresent,

    /// Capability does not name a session of this component
    #[error("session not found")]
    SessionNotFound,

    /// A blocking provider call was canceled by a watchdog
    #[error("blocking call canceled")]
    BlockingCanceled,
}

impl BrokerError {
    /// Check if the error is recoverable by a later retry.
    pub fn is_retryable(&self) -> bool {
        matches!(self, BrokerError::ServiceNotPresent)
    }
}

impl From<QuotaError> for BrokerError {
    fn from(e: QuotaError) -> Self {
        BrokerError::QuotaExceeded(e.currency())
    }
}

impl From<ProviderError> for BrokerError {
    fn from(e: ProviderError) -> Self {
        match e {
            ProviderError::Denied => BrokerError::ServiceDenied,
            ProviderError::InsufficientRamQuota => BrokerError::QuotaExceeded(Currency::Ram),
            ProviderError::InsufficientCapQuota => BrokerError::QuotaExceeded(Currency::Caps),
            ProviderError::BlockingCanceled => BrokerError::BlockingCanceled,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::string::ToString;

    #[test]
    fn test_quota_error_mapping() {
        let ram = QuotaError::InsufficientRam {
            requested: 10,
            available: 5,
        };
        let caps = QuotaError::InsufficientCaps {
            requested: 2,
            available: 1,
        };
        assert_eq!(BrokerError::from(ram), BrokerError::QuotaExceeded(Currency::Ram));
        assert_eq!(BrokerError::from(caps), BrokerError::QuotaExceeded(Currency::Caps));
    }

    #[test]
    fn test_provider_error_mapping() {
        assert_eq!(BrokerError::from(ProviderError::Denied), BrokerError::ServiceDenied);
        assert_eq!(
            BrokerError::from(ProviderError::InsufficientCapQuota),
            BrokerError::QuotaExceeded(Currency::Caps)
        );
    }

    #[test]
    fn test_display() {
        assert_eq!(
            BrokerError::QuotaExceeded(Currency::Ram).to_string(),
            "RAM quota exceeded"
        );
        assert!(BrokerError::ServiceNotPresent.is_retryable());
        assert!(!BrokerError::ServiceDenied.is_retryable());
    }
}
