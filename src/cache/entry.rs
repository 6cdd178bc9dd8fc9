//! Cached payload record.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;

/// A cached payload plus its bookkeeping.
///
/// Serialized as-is into `FileCache` records. Fields added later must carry
/// `#[serde(default)]` so older records stay readable; unknown fields are ignored on read.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    payload: Value,
    created_at: f64,
    #[serde(default)]
    ttl: Option<Duration>,
    last_accessed: f64,
    #[serde(default)]
    hit_count: u64,
    /// How long the original computation took; reported as time saved on hits.
    #[serde(default)]
    compute_time: Option<Duration>,
}

impl CacheEntry {
    pub fn new(payload: Value, ttl: Option<Duration>, now: f64) -> Self {
        Self {
            payload,
            created_at: now,
            ttl,
            last_accessed: now,
            hit_count: 0,
            compute_time: None,
        }
    }

    pub fn with_compute_time(mut self, elapsed: Duration) -> Self {
        self.compute_time = Some(elapsed);
        self
    }

    pub fn payload(&self) -> &Value {
        &self.payload
    }

    pub fn into_payload(self) -> Value {
        self.payload
    }

    pub fn created_at(&self) -> f64 {
        self.created_at
    }

    pub fn ttl(&self) -> Option<Duration> {
        self.ttl
    }

    pub fn last_accessed(&self) -> f64 {
        self.last_accessed
    }

    pub fn hit_count(&self) -> u64 {
        self.hit_count
    }

    pub fn compute_time(&self) -> Option<Duration> {
        self.compute_time
    }

    /// True once `ttl` has fully elapsed. Entries without a TTL never expire by time.
    pub fn is_expired(&self, now: f64) -> bool {
        match self.ttl {
            Some(ttl) => now - self.created_at >= ttl.as_secs_f64(),
            None => false,
        }
    }

    pub fn age(&self, now: f64) -> Duration {
        Duration::from_secs_f64((now - self.created_at).max(0.0))
    }

    /// Time left before expiry; `None` when the entry has no TTL.
    pub fn remaining_ttl(&self, now: f64) -> Option<Duration> {
        self.ttl
            .map(|ttl| Duration::from_secs_f64((ttl.as_secs_f64() - (now - self.created_at)).max(0.0)))
    }

    /// Record a read. Only backends call this.
    pub fn touch(&mut self, now: f64) {
        self.hit_count = self.hit_count.saturating_add(1);
        self.last_accessed = now;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_expiry_boundary_is_inclusive() {
        let entry = CacheEntry::new(json!("A"), Some(Duration::from_secs(10)), 100.0);
        assert!(!entry.is_expired(100.0));
        assert!(!entry.is_expired(109.999));
        assert!(entry.is_expired(110.0));
        assert!(entry.is_expired(500.0));
    }

    #[test]
    fn test_no_ttl_never_expires() {
        let entry = CacheEntry::new(json!(1), None, 0.0);
        assert!(!entry.is_expired(f64::MAX));
        assert!(entry.remaining_ttl(1e9).is_none());
    }

    #[test]
    fn test_touch_updates_statistics() {
        let mut entry = CacheEntry::new(json!({"a": 1}), None, 10.0);
        entry.touch(12.0);
        entry.touch(15.0);
        assert_eq!(entry.hit_count(), 2);
        assert_eq!(entry.last_accessed(), 15.0);
        assert_eq!(entry.created_at(), 10.0);
        assert_eq!(entry.age(15.0), Duration::from_secs(5));
    }

    #[test]
    fn test_remaining_ttl_saturates_at_zero() {
        let entry = CacheEntry::new(json!(null), Some(Duration::from_secs(5)), 0.0);
        assert_eq!(entry.remaining_ttl(2.0), Some(Duration::from_secs(3)));
        assert_eq!(entry.remaining_ttl(9.0), Some(Duration::ZERO));
    }

    #[test]
    fn test_unknown_fields_are_ignored_and_missing_defaults_apply() {
        let raw = r#"{
            "payload": "A",
            "created_at": 1.0,
            "last_accessed": 2.0,
            "written_by": "a newer release"
        }"#;
        let entry: CacheEntry = serde_json::from_str(raw).unwrap();
        assert_eq!(entry.payload(), &json!("A"));
        assert_eq!(entry.ttl(), None);
        assert_eq!(entry.hit_count(), 0);
        assert_eq!(entry.compute_time(), None);
    }
}
