//! Rate limit key validation and handling.

use serde::Serialize;
use std::borrow::Borrow;
use std::net::IpAddr;
use std::str::FromStr;

use crate::error::{LimiterError, Result};

/// A validated identifier that partitions rate limit state.
///
/// Keys are scalar text values: client addresses, user ids, API tokens. Empty and
/// whitespace-only strings are rejected.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct LimitKey(String);

impl LimitKey {
    /// Validate and wrap a raw key.
    pub fn new(raw: impl Into<String>) -> Result<Self> {
        let raw = raw.into();
        if raw.trim().is_empty() {
            return Err(LimiterError::InvalidKey("key is required".to_string()));
        }
        Ok(Self(raw))
    }

    /// Borrow the key as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Unwrap into the owned string.
    pub fn into_inner(self) -> String {
        self.0
    }
}

impl FromStr for LimitKey {
    type Err = LimiterError;

    fn from_str(s: &str) -> Result<Self> {
        Self::new(s)
    }
}

impl TryFrom<&str> for LimitKey {
    type Error = LimiterError;

    fn try_from(value: &str) -> Result<Self> {
        Self::new(value)
    }
}

impl TryFrom<String> for LimitKey {
    type Error = LimiterError;

    fn try_from(value: String) -> Result<Self> {
        Self::new(value)
    }
}

impl From<IpAddr> for LimitKey {
    fn from(addr: IpAddr) -> Self {
        Self(addr.to_string())
    }
}

impl From<u64> for LimitKey {
    fn from(id: u64) -> Self {
        Self(id.to_string())
    }
}

impl AsRef<str> for LimitKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl Borrow<str> for LimitKey {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for LimitKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_creation() {
        let key = LimitKey::new("10.0.0.1").unwrap();
        assert_eq!(key.as_str(), "10.0.0.1");
        assert_eq!(key.to_string(), "10.0.0.1");
    }

    #[test]
    fn test_empty_key_rejected() {
        assert!(matches!(LimitKey::new(""), Err(LimiterError::InvalidKey(_))));
        assert!(matches!(LimitKey::new("   "), Err(LimiterError::InvalidKey(_))));
        assert!("".parse::<LimitKey>().is_err());
    }

    #[test]
    fn test_scalar_conversions() {
        let ip: IpAddr = "192.168.1.7".parse().unwrap();
        assert_eq!(LimitKey::from(ip).as_str(), "192.168.1.7");
        assert_eq!(LimitKey::from(42u64).as_str(), "42");
    }

    #[test]
    fn test_key_equality() {
        let key1 = LimitKey::try_from("user:123").unwrap();
        let key2 = LimitKey::try_from("user:123".to_string()).unwrap();
        assert_eq!(key1, key2);
    }

    #[test]
    fn test_key_serializes_as_string() {
        let key = LimitKey::new("abc").unwrap();
        assert_eq!(serde_json::to_string(&key).unwrap(), "\"abc\"");
    }
}
