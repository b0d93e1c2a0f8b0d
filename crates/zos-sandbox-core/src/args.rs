//! Session argument strings
//!
//! Session requests carry a flat string of comma-separated `key=value`
//! pairs, e.g. `ram_quota=16K, cap_quota=3, label="fs -> backup"`. The
//! broker interprets only `ram_quota`, `cap_quota` and `label`; all other
//! keys are passed through to the provider in their original order.

use alloc::format;
use alloc::string::{String, ToString};
use alloc::vec::Vec;
use core::fmt;

use crate::error::ArgsError;
use crate::types::{Quota, MAX_ARGS_LEN, MAX_LABEL_LEN};

/// Separator between the elements of a session label
pub const LABEL_SEPARATOR: &str = " -> ";

/// Parsed session arguments.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SessionArgs {
    /// Key/value pairs in original order (values unquoted)
    entries: Vec<(String, String)>,
}

impl SessionArgs {
    /// Create empty arguments.
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse an argument string.
    pub fn parse(input: &str) -> Result<Self, ArgsError> {
        if input.len() > MAX_ARGS_LEN {
            return Err(ArgsError::TooLong(input.len()));
        }

        let mut entries = Vec::new();
        for item in split_entries(input)? {
            let item = item.trim();
            if item.is_empty() {
                continue;
            }
            let (key, value) = item
                .split_once('=')
                .ok_or_else(|| ArgsError::MissingSeparator(item.to_string()))?;
            let key = key.trim();
            if !is_valid_key(key) {
                return Err(ArgsError::InvalidKey(key.to_string()));
            }
            let value = unquote(value.trim())?;
            entries.push((key.to_string(), value));
        }
        Ok(Self { entries })
    }

    /// Look up the value of `key`.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Set `key` to `value`, replacing an existing entry in place.
    pub fn set(&mut self, key: &str, value: impl Into<String>) {
        let value = value.into();
        match self.entries.iter_mut().find(|(k, _)| k == key) {
            Some(entry) => entry.1 = value,
            None => self.entries.push((key.to_string(), value)),
        }
    }

    /// Remove `key`, returning its former value.
    pub fn remove(&mut self, key: &str) -> Option<String> {
        let index = self.entries.iter().position(|(k, _)| k == key)?;
        Some(self.entries.remove(index).1)
    }

    /// Donated RAM in bytes (0 if absent).
    pub fn ram_quota(&self) -> Result<u64, ArgsError> {
        self.quantity("ram_quota")
    }

    /// Donated capability slots (0 if absent).
    pub fn cap_quota(&self) -> Result<u32, ArgsError> {
        let value = self.quantity("cap_quota")?;
        u32::try_from(value).map_err(|_| ArgsError::InvalidValue {
            key: "cap_quota",
            value: value.to_string(),
        })
    }

    /// Both donations.
    pub fn quota(&self) -> Result<Quota, ArgsError> {
        Ok(Quota::new(self.ram_quota()?, self.cap_quota()?))
    }

    /// Replace both donations.
    pub fn set_quota(&mut self, quota: Quota) {
        self.set("ram_quota", quota.ram.to_string());
        self.set("cap_quota", quota.caps.to_string());
    }

    /// Session label (empty if absent).
    pub fn label(&self) -> &str {
        self.get("label").unwrap_or("")
    }

    /// Replace the session label, truncated to `MAX_LABEL_LEN`.
    pub fn set_label(&mut self, label: &str) {
        self.set("label", truncate(label, MAX_LABEL_LEN));
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Check if there are no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn quantity(&self, key: &'static str) -> Result<u64, ArgsError> {
        match self.get(key) {
            None => Ok(0),
            Some(value) => parse_quantity(value).ok_or_else(|| ArgsError::InvalidValue {
                key,
                value: value.to_string(),
            }),
        }
    }
}

impl fmt::Display for SessionArgs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, (key, value)) in self.entries.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            if needs_quotes(value) {
                write!(f, "{}=\"{}\"", key, value)?;
            } else {
                write!(f, "{}={}", key, value)?;
            }
        }
        Ok(())
    }
}

/// Parse a decimal quantity with optional binary `K`, `M` or `G` suffix.
pub fn parse_quantity(value: &str) -> Option<u64> {
    let value = value.trim();
    let (digits, shift) = match value.as_bytes().last()? {
        b'K' | b'k' => (&value[..value.len() - 1], 10),
        b'M' | b'm' => (&value[..value.len() - 1], 20),
        b'G' | b'g' => (&value[..value.len() - 1], 30),
        _ => (value, 0),
    };
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    digits.parse::<u64>().ok()?.checked_mul(1u64 << shift)
}

/// Build `"prefix -> label"`, or just `prefix` for an empty label.
pub fn prefixed_label(prefix: &str, label: &str) -> String {
    let joined = if label.is_empty() {
        prefix.to_string()
    } else if prefix.is_empty() {
        label.to_string()
    } else {
        format!("{}{}{}", prefix, LABEL_SEPARATOR, label)
    };
    truncate(&joined, MAX_LABEL_LEN)
}

/// Last element of a composed label.
pub fn last_element(label: &str) -> &str {
    match label.rfind(LABEL_SEPARATOR) {
        Some(pos) => &label[pos + LABEL_SEPARATOR.len()..],
        None => label,
    }
}

/// Truncate `s` to at most `max` bytes, on a character boundary.
pub fn truncate(s: &str, max: usize) -> String {
    if s.len() <= max {
        return s.to_string();
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    s[..end].to_string()
}

fn split_entries(input: &str) -> Result<Vec<&str>, ArgsError> {
    let mut items = Vec::new();
    let mut start = 0;
    let mut quoted = false;
    for (i, c) in input.char_indices() {
        match c {
            '"' => quoted = !quoted,
            ',' if !quoted => {
                items.push(&input[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }
    if quoted {
        return Err(ArgsError::UnterminatedQuote);
    }
    items.push(&input[start..]);
    Ok(items)
}

fn unquote(value: &str) -> Result<String, ArgsError> {
    match value.strip_prefix('"') {
        Some(rest) => rest
            .strip_suffix('"')
            .map(|inner| inner.to_string())
            .ok_or(ArgsError::UnterminatedQuote),
        None => Ok(value.to_string()),
    }
}

fn is_valid_key(key: &str) -> bool {
    !key.is_empty() && key.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'_')
}

fn needs_quotes(value: &str) -> bool {
    value.is_empty() || value.contains([',', ' ', '=', '"'])
}
