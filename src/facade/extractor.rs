//! Rate limit key extraction from request records.

use serde_json::Value;

use crate::error::{LimiterError, Result};
use crate::ratelimit::LimitKey;

/// Pulls the rate limit key out of a request.
pub trait KeyExtractor<R: ?Sized>: Send + Sync {
    /// Extract a validated key, or fail with `InvalidKey`.
    fn extract(&self, request: &R) -> Result<LimitKey>;
}

impl<R: ?Sized, F> KeyExtractor<R> for F
where
    F: Fn(&R) -> Result<LimitKey> + Send + Sync,
{
    fn extract(&self, request: &R) -> Result<LimitKey> {
        self(request)
    }
}

/// Selects the key from a JSON request record with a dotted path such as
/// `"ip"`, `"headers.x-client-id"` or `"hops.0"`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathExtractor {
    path: String,
    segments: Vec<String>,
}

impl PathExtractor {
    /// Parse a dotted path. Empty segments are skipped.
    pub fn new(path: &str) -> Result<Self> {
        let segments: Vec<String> = path
            .split('.')
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect();

        if segments.is_empty() {
            return Err(LimiterError::Config(format!(
                "key path '{}' selects nothing",
                path
            )));
        }

        Ok(Self {
            path: path.to_string(),
            segments,
        })
    }

    /// The path as configured.
    pub fn path(&self) -> &str {
        &self.path
    }

    fn lookup<'a>(&self, record: &'a Value) -> Option<&'a Value> {
        self.segments
            .iter()
            .try_fold(record, |value, segment| match value {
                Value::Object(map) => map.get(segment),
                Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
                _ => None,
            })
    }
}

impl Default for PathExtractor {
    fn default() -> Self {
        Self {
            path: "ip".to_string(),
            segments: vec!["ip".to_string()],
        }
    }
}

impl KeyExtractor<Value> for PathExtractor {
    fn extract(&self, request: &Value) -> Result<LimitKey> {
        match self.lookup(request) {
            Some(Value::String(s)) => LimitKey::new(s.as_str()),
            Some(Value::Number(n)) => LimitKey::new(n.to_string()),
            Some(Value::Null) | None => Err(LimiterError::InvalidKey(format!(
                "no value at '{}'",
                self.path
            ))),
            Some(_) => Err(LimiterError::InvalidKey(format!(
                "value at '{}' is not a scalar",
                self.path
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_default_selects_ip() {
        let extractor = PathExtractor::default();
        let key = extractor.extract(&json!({ "ip": "10.1.2.3" })).unwrap();
        assert_eq!(key.as_str(), "10.1.2.3");
    }

    #[test]
    fn test_nested_path() {
        let extractor = PathExtractor::new("connection.remote.addr").unwrap();
        let request = json!({ "connection": { "remote": { "addr": "::1" } } });
        assert_eq!(extractor.extract(&request).unwrap().as_str(), "::1");
    }

    #[test]
    fn test_array_index_and_number() {
        let extractor = PathExtractor::new("users.1.id").unwrap();
        let request = json!({ "users": [{ "id": 7 }, { "id": 42 }] });
        assert_eq!(extractor.extract(&request).unwrap().as_str(), "42");
    }

    #[test]
    fn test_missing_value() {
        let extractor = PathExtractor::new("user.id").unwrap();
        let err = extractor.extract(&json!({ "user": {} })).unwrap_err();
        assert!(matches!(err, LimiterError::InvalidKey(_)));
        assert!(extractor.extract(&json!({ "user": { "id": null } })).is_err());
    }

    #[test]
    fn test_non_scalar_rejected() {
        let extractor = PathExtractor::default();
        assert!(extractor.extract(&json!({ "ip": { "v4": "1.2.3.4" } })).is_err());
        assert!(extractor.extract(&json!({ "ip": ["1.2.3.4"] })).is_err());
        assert!(extractor.extract(&json!({ "ip": true })).is_err());
        assert!(extractor.extract(&json!({ "ip": "" })).is_err());
    }

    #[test]
    fn test_empty_path_rejected() {
        assert!(matches!(PathExtractor::new(""), Err(LimiterError::Config(_))));
        assert!(PathExtractor::new("..").is_err());
    }

    #[test]
    fn test_closure_extractor() {
        let extractor = |tenant: &String| LimitKey::new(tenant.as_str());
        let key = extractor.extract(&"tenant-a".to_string()).unwrap();
        assert_eq!(key.as_str(), "tenant-a");
    }
}
