use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::core::error::EngineError;

/// Key namespaces for everything the engine keeps in the correlation
/// store. Keys are scoped by organization and detection type so tenants
/// never observe each other's state.
pub mod keys {
    pub const CAMPAIGN_COUNT: &str = "waf:campaign:count";
    pub const CAMPAIGN_STATE: &str = "waf:campaign:state";
    pub const ALERT_THROTTLE: &str = "waf:alert:throttle";

    pub fn campaign_count(org_id: &str, scope: &str) -> String {
        format!("{}:{}:{}", CAMPAIGN_COUNT, org_id, scope)
    }

    pub fn campaign_state(org_id: &str, scope: &str) -> String {
        format!("{}:{}:{}", CAMPAIGN_STATE, org_id, scope)
    }

    pub fn alert_throttle(org_id: &str, alert_key: &str) -> String {
        format!("{}:{}:{}", ALERT_THROTTLE, org_id, alert_key)
    }
}

/// External TTL-capable key-value store shared by every worker. This is an
/// injected dependency on purpose: campaign correctness must not depend on
/// which process handles a given event. The atomic increment and the
/// set-if-absent are the only synchronization primitives the engine
/// relies on.
pub trait CorrelationStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>, EngineError>;

    fn set_with_ttl(&self, key: &str, value: &str, ttl: Duration) -> Result<(), EngineError>;

    /// Atomically writes the key only when it is absent (or expired). The
    /// TTL is anchored at this write; a live entry keeps its expiry
    /// untouched. Returns whether the write happened.
    fn set_nx_with_ttl(&self, key: &str, value: &str, ttl: Duration)
        -> Result<bool, EngineError>;

    /// Atomically increments a counter, creating it at 1 when absent, and
    /// refreshes the TTL on every call (sliding window). Returns the value
    /// after the increment.
    fn incr_with_ttl(&self, key: &str, ttl: Duration) -> Result<u64, EngineError>;

    fn delete(&self, key: &str) -> Result<(), EngineError>;

    /// All live entries whose key starts with `prefix`.
    fn scan_prefix(&self, prefix: &str) -> Result<Vec<(String, String)>, EngineError>;
}

struct Entry {
    value: String,
    expires_at: Instant,
}

/// Thread-safe in-memory implementation. Expired entries are evicted
/// lazily on access, so a key past its TTL is indistinguishable from an
/// absent one.
#[derive(Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, Entry>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl CorrelationStore for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<String>, EngineError> {
        let mut map = self
            .entries
            .lock()
            .map_err(|_| EngineError::Store("memory store poisoned".into()))?;
        if let Some(entry) = map.get(key) {
            if entry.expires_at <= Instant::now() {
                map.remove(key);
                return Ok(None);
            }
            return Ok(Some(entry.value.clone()));
        }
        Ok(None)
    }

    fn set_with_ttl(&self, key: &str, value: &str, ttl: Duration) -> Result<(), EngineError> {
        let mut map = self
            .entries
            .lock()
            .map_err(|_| EngineError::Store("memory store poisoned".into()))?;
        map.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at: Instant::now() + ttl,
            },
        );
        Ok(())
    }

    fn set_nx_with_ttl(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<bool, EngineError> {
        let mut map = self
            .entries
            .lock()
            .map_err(|_| EngineError::Store("memory store poisoned".into()))?;
        let now = Instant::now();
        match map.get(key) {
            Some(entry) if entry.expires_at > now => Ok(false),
            _ => {
                map.insert(
                    key.to_string(),
                    Entry {
                        value: value.to_string(),
                        expires_at: now + ttl,
                    },
                );
                Ok(true)
            }
        }
    }

    fn incr_with_ttl(&self, key: &str, ttl: Duration) -> Result<u64, EngineError> {
        let mut map = self
            .entries
            .lock()
            .map_err(|_| EngineError::Store("memory store poisoned".into()))?;
        let now = Instant::now();
        let next = match map.get(key) {
            Some(entry) if entry.expires_at > now => entry
                .value
                .parse::<u64>()
                .map_err(|_| EngineError::Store(format!("non-numeric counter at {}", key)))?
                .saturating_add(1),
            _ => 1,
        };
        map.insert(
            key.to_string(),
            Entry {
                value: next.to_string(),
                expires_at: now + ttl,
            },
        );
        Ok(next)
    }

    fn delete(&self, key: &str) -> Result<(), EngineError> {
        let mut map = self
            .entries
            .lock()
            .map_err(|_| EngineError::Store("memory store poisoned".into()))?;
        map.remove(key);
        Ok(())
    }

    fn scan_prefix(&self, prefix: &str) -> Result<Vec<(String, String)>, EngineError> {
        let mut map = self
            .entries
            .lock()
            .map_err(|_| EngineError::Store("memory store poisoned".into()))?;
        let now = Instant::now();
        map.retain(|_, entry| entry.expires_at > now);
        let mut out: Vec<(String, String)> = map
            .iter()
            .filter(|(k, _)| k.starts_with(prefix))
            .map(|(k, e)| (k.clone(), e.value.clone()))
            .collect();
        out.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn incr_creates_then_counts() {
        let store = MemoryStore::new();
        assert_eq!(store.incr_with_ttl("k", Duration::from_secs(5)).unwrap(), 1);
        assert_eq!(store.incr_with_ttl("k", Duration::from_secs(5)).unwrap(), 2);
        assert_eq!(store.incr_with_ttl("k", Duration::from_secs(5)).unwrap(), 3);
    }

    #[test]
    fn entries_expire_after_ttl() {
        let store = MemoryStore::new();
        store
            .set_with_ttl("k", "v", Duration::from_millis(30))
            .unwrap();
        assert_eq!(store.get("k").unwrap().as_deref(), Some("v"));
        std::thread::sleep(Duration::from_millis(60));
        assert_eq!(store.get("k").unwrap(), None);
    }

    #[test]
    fn set_nx_only_writes_when_absent() {
        let store = MemoryStore::new();
        assert!(store
            .set_nx_with_ttl("k", "a", Duration::from_millis(30))
            .unwrap());
        assert!(!store
            .set_nx_with_ttl("k", "b", Duration::from_secs(5))
            .unwrap());
        assert_eq!(store.get("k").unwrap().as_deref(), Some("a"));
        std::thread::sleep(Duration::from_millis(60));
        assert!(store
            .set_nx_with_ttl("k", "b", Duration::from_secs(5))
            .unwrap());
    }

    #[test]
    fn incr_is_atomic_across_threads() {
        let store = std::sync::Arc::new(MemoryStore::new());
        let mut handles = Vec::new();
        for _ in 0..8 {
            let store = store.clone();
            handles.push(std::thread::spawn(move || {
                for _ in 0..100 {
                    store.incr_with_ttl("counter", Duration::from_secs(10)).unwrap();
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(store.get("counter").unwrap().as_deref(), Some("800"));
    }

    #[test]
    fn scan_prefix_skips_expired_and_sorts() {
        let store = MemoryStore::new();
        store
            .set_with_ttl("waf:a:2", "x", Duration::from_secs(5))
            .unwrap();
        store
            .set_with_ttl("waf:a:1", "y", Duration::from_secs(5))
            .unwrap();
        store
            .set_with_ttl("waf:b:1", "z", Duration::from_secs(5))
            .unwrap();
        store
            .set_with_ttl("waf:a:dead", "d", Duration::from_millis(1))
            .unwrap();
        std::thread::sleep(Duration::from_millis(10));
        let hits = store.scan_prefix("waf:a:").unwrap();
        assert_eq!(
            hits,
            vec![
                ("waf:a:1".to_string(), "y".to_string()),
                ("waf:a:2".to_string(), "x".to_string())
            ]
        );
    }
}
