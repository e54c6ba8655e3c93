//! resourceVersion expectations: "I wrote K, do not trust a cached K until it moved past V".
//!
//! resourceVersions are treated as monotonically increasing integers. An expectation
//! for V is satisfied only by an observation strictly greater than V; V itself is what
//! the writer already saw.

use std::hash::{Hash, Hasher};
use std::num::ParseIntError;
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

use metrics::counter;
use rustc_hash::{FxHashMap, FxHasher};
use tracing::{debug, warn};

const DEFAULT_STRIPES: usize = 16;

fn default_timeout() -> Option<Duration> {
    let secs = std::env::var("OPSJOB_EXPECTATION_TIMEOUT_SECS")
        .ok()
        .and_then(|s| s.parse::<u64>().ok())
        .unwrap_or(300);
    if secs == 0 { None } else { Some(Duration::from_secs(secs)) }
}

#[derive(Debug, thiserror::Error)]
pub enum ExpectationError {
    #[error("invalid resourceVersion {value:?} for {key}: {source}")]
    InvalidResourceVersion {
        key: String,
        value: String,
        #[source]
        source: ParseIntError,
    },
    #[error("expectation lock poisoned")]
    Poisoned,
}

/// Minimum resourceVersion a read of `key` must exceed before it is trusted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceVersionExpectationItem {
    key: String,
    resource_version: i64,
    recorded_at: Instant,
}

impl ResourceVersionExpectationItem {
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn resource_version(&self) -> i64 {
        self.resource_version
    }

    pub fn age(&self) -> Duration {
        self.recorded_at.elapsed()
    }

    fn fulfilled(&self, observed: i64) -> bool {
        observed > self.resource_version
    }
}

fn parse_rv(key: &str, value: &str) -> Result<i64, ExpectationError> {
    value.parse::<i64>().map_err(|source| ExpectationError::InvalidResourceVersion {
        key: key.to_string(),
        value: value.to_string(),
        source,
    })
}

type Stripe = FxHashMap<String, ResourceVersionExpectationItem>;

/// Process-wide keyed expectation store, safe to share between reconcile workers.
///
/// Keys are spread over a fixed set of independently locked stripes; there is no
/// ordering between keys. Nothing is persisted: a restart starts empty.
pub struct ExpectationCache {
    stripes: Box<[Mutex<Stripe>]>,
    timeout: Option<Duration>,
}

impl Default for ExpectationCache {
    fn default() -> Self {
        Self::new()
    }
}

impl ExpectationCache {
    pub fn new() -> Self {
        Self::with_stripes(DEFAULT_STRIPES).with_timeout(default_timeout())
    }

    pub fn with_stripes(n: usize) -> Self {
        let stripes = (0..n.max(1)).map(|_| Mutex::new(Stripe::default())).collect();
        Self { stripes, timeout: None }
    }

    /// Unsatisfied expectations older than `timeout` are dropped on the next check.
    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    fn stripe(&self, key: &str) -> Result<MutexGuard<'_, Stripe>, ExpectationError> {
        let mut h = FxHasher::default();
        key.hash(&mut h);
        let idx = (h.finish() % self.stripes.len() as u64) as usize;
        self.stripes[idx].lock().map_err(|_| ExpectationError::Poisoned)
    }

    /// Record `resource_version` as the expectation for `key`, replacing any prior value.
    /// No check against the previous value is made: a lower version overwrites a higher one.
    pub fn set_expectations(&self, key: &str, resource_version: &str) -> Result<(), ExpectationError> {
        let rv = parse_rv(key, resource_version)?;
        let item = ResourceVersionExpectationItem { key: key.to_string(), resource_version: rv, recorded_at: Instant::now() };
        self.stripe(key)?.insert(key.to_string(), item);
        debug!(key = %key, rv, "expectation set");
        Ok(())
    }

    /// Same as `set_expectations`; call sites use it right after issuing an update.
    pub fn expect_update(&self, key: &str, resource_version: &str) -> Result<(), ExpectationError> {
        self.set_expectations(key, resource_version)
    }

    pub fn get_expectations(&self, key: &str) -> Result<Option<ResourceVersionExpectationItem>, ExpectationError> {
        Ok(self.stripe(key)?.get(key).cloned())
    }

    /// True when nothing is expected for `key` or `observed` is strictly newer than the
    /// expectation. Unparseable observations never satisfy.
    pub fn satisfied_expectations(&self, key: &str, observed: &str) -> bool {
        let mut stripe = match self.stripe(key) {
            Ok(s) => s,
            Err(e) => {
                warn!(key = %key, error = %e, "expectation check failed");
                return false;
            }
        };
        let (expected, age, fulfilled) = match (stripe.get(key), parse_rv(key, observed)) {
            (None, _) => return true,
            (Some(item), Ok(rv)) => (item.resource_version, item.age(), item.fulfilled(rv)),
            (Some(_), Err(e)) => {
                debug!(key = %key, error = %e, "unparseable observed resourceVersion");
                return false;
            }
        };
        if fulfilled {
            return true;
        }
        match self.timeout {
            Some(t) if age > t => {
                warn!(key = %key, expected, observed = %observed, age_secs = age.as_secs(), "expectation expired; trusting cache");
                counter!("expectations_expired_total", 1u64);
                stripe.remove(key);
                true
            }
            _ => false,
        }
    }

    pub fn delete_expectations(&self, key: &str) {
        match self.stripe(key) {
            Ok(mut s) => {
                s.remove(key);
            }
            Err(e) => warn!(key = %key, error = %e, "expectation delete failed"),
        }
    }

    /// Outstanding expectations across all stripes.
    pub fn len(&self) -> usize {
        self.stripes.iter().filter_map(|s| s.lock().ok()).map(|s| s.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn cache() -> ExpectationCache {
        ExpectationCache::with_stripes(4)
    }

    #[test]
    fn set_update_satisfy_delete() {
        let exp = cache();
        exp.set_expectations("test", "1").unwrap();
        let item = exp.get_expectations("test").unwrap().expect("present");
        assert_eq!(item.resource_version(), 1);
        assert_eq!(item.key(), "test");

        exp.expect_update("test", "2").unwrap();
        assert_eq!(exp.get_expectations("test").unwrap().unwrap().resource_version(), 2);

        assert!(!exp.satisfied_expectations("test", "1"));
        assert!(!exp.satisfied_expectations("test", "2"));
        assert!(exp.satisfied_expectations("test", "3"));

        exp.delete_expectations("test");
        assert!(exp.get_expectations("test").unwrap().is_none());
    }

    #[test]
    fn strictly_newer_version_required() {
        let exp = cache();
        exp.set_expectations("ns/origin-1", "10").unwrap();
        assert!(!exp.satisfied_expectations("ns/origin-1", "9"));
        assert!(!exp.satisfied_expectations("ns/origin-1", "10"));
        assert!(exp.satisfied_expectations("ns/origin-1", "11"));
    }

    #[test]
    fn unknown_key_is_satisfied() {
        let exp = cache();
        assert!(exp.satisfied_expectations("never-set", "0"));
        assert!(exp.satisfied_expectations("never-set", "garbage"));
    }

    #[test]
    fn unparseable_values_fail_closed() {
        let exp = cache();
        let err = exp.set_expectations("k", "abc").unwrap_err();
        assert!(matches!(err, ExpectationError::InvalidResourceVersion { .. }));
        assert!(exp.get_expectations("k").unwrap().is_none());

        exp.set_expectations("k", "5").unwrap();
        assert!(!exp.satisfied_expectations("k", ""));
        assert!(!exp.satisfied_expectations("k", "6x"));
    }

    #[test]
    fn delete_of_absent_key_is_noop() {
        let exp = cache();
        exp.delete_expectations("missing");
        assert!(exp.is_empty());
    }

    #[test]
    fn lower_set_overwrites_and_can_unsatisfy() {
        // No anti-regression guard: setting a lower version replaces the higher one,
        // and an observation that satisfied before may no longer do so.
        let exp = cache();
        exp.set_expectations("k", "10").unwrap();
        assert!(exp.satisfied_expectations("k", "11"));
        exp.set_expectations("k", "20").unwrap();
        assert!(!exp.satisfied_expectations("k", "11"));
        exp.set_expectations("k", "3").unwrap();
        assert_eq!(exp.get_expectations("k").unwrap().unwrap().resource_version(), 3);
        assert!(exp.satisfied_expectations("k", "4"));
    }

    #[test]
    fn expired_expectation_is_dropped() {
        let exp = cache().with_timeout(Some(Duration::from_millis(0)));
        exp.set_expectations("k", "10").unwrap();
        std::thread::sleep(Duration::from_millis(2));
        assert!(exp.satisfied_expectations("k", "10"));
        assert!(exp.get_expectations("k").unwrap().is_none());
    }

    #[test]
    fn keys_are_independent() {
        let exp = cache();
        exp.set_expectations("a", "5").unwrap();
        exp.set_expectations("b", "50").unwrap();
        assert!(exp.satisfied_expectations("a", "6"));
        assert!(!exp.satisfied_expectations("b", "6"));
        assert_eq!(exp.len(), 2);
    }

    #[test]
    fn concurrent_writers_never_tear() {
        let exp = Arc::new(cache());
        let handles: Vec<_> = (0..8)
            .map(|w| {
                let exp = Arc::clone(&exp);
                std::thread::spawn(move || {
                    for i in 0..500u32 {
                        let key = format!("ns/pod-{}", i % 7);
                        let rv = (w * 1000 + i).to_string();
                        exp.set_expectations(&key, &rv).unwrap();
                        let item = exp.get_expectations(&key).unwrap().expect("just set");
                        assert_eq!(item.key(), key);
                        // Any stored value is one some writer produced in full.
                        assert!(item.resource_version() >= 0 && item.resource_version() < 8000);
                        let _ = exp.satisfied_expectations(&key, "999999");
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert!(exp.len() <= 7);
    }
}
