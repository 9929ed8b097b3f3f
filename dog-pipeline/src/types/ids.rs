use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use uuid::Uuid;

/// Unique identifier for a job
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub String);

impl JobId {
    /// Generate a new unique job ID
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Get the inner string value
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for JobId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl From<&str> for JobId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

/// Lease token for job processing - prevents concurrent processing
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LeaseToken(pub String);

impl LeaseToken {
    /// Generate a new unique lease token
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Get the inner string value
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for LeaseToken {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for LeaseToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for LeaseToken {
    fn from(token: &str) -> Self {
        Self(token.to_string())
    }
}

/// Deterministic key derived from a request payload.
///
/// Used both as the cache address of the produced artifact and to collapse
/// concurrent builds of the same request.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fingerprint(String);

impl Fingerprint {
    /// Hash a job class and its canonical JSON body.
    ///
    /// `serde_json::Value` objects keep their keys sorted, so structurally equal
    /// payloads always produce the same digest.
    pub fn compute(job_class: &str, canonical: &serde_json::Value) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(job_class.as_bytes());
        hasher.update(b":");
        hasher.update(canonical.to_string().as_bytes());
        Self(format!("{}:{:x}", job_class, hasher.finalize()))
    }

    /// Use an externally supplied key verbatim
    pub fn from_raw(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_fingerprint_is_order_independent() {
        let a = Fingerprint::compute("document_generation", &json!({"a": 1, "b": [1, 2]}));
        let b = Fingerprint::compute("document_generation", &json!({"b": [1, 2], "a": 1}));
        assert_eq!(a, b);
        assert!(a.as_str().starts_with("document_generation:"));
    }

    #[test]
    fn test_fingerprint_scoped_by_class() {
        let body = json!({"id": 7});
        assert_ne!(
            Fingerprint::compute("fact_learning", &body),
            Fingerprint::compute("rejection_analysis", &body)
        );
    }

    #[test]
    fn test_job_id_unique() {
        assert_ne!(JobId::new(), JobId::new());
    }
}
