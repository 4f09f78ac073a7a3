//! Completion cache so repeated judgments across turns skip the service

use crate::error::Result;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::RwLock;
use std::time::{Duration, SystemTime};

const DEFAULT_CAPACITY: usize = 4096;

#[derive(Clone)]
struct CacheEntry {
    value: String,
    expires_at: SystemTime,
}

/// Bounded in-memory cache for chat completions
pub struct LLMCache {
    entries: RwLock<HashMap<String, CacheEntry>>,
    ttl: Duration,
    capacity: usize,
}

impl LLMCache {
    /// Cache with a one hour TTL
    pub fn new() -> Self {
        Self::with_ttl(Duration::from_secs(3600))
    }

    pub fn with_ttl(ttl: Duration) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            ttl,
            capacity: DEFAULT_CAPACITY,
        }
    }

    /// Get cached value if present and not expired
    pub fn get(&self, key: &str) -> Option<String> {
        let entries = self.entries.read().ok()?;
        let entry = entries.get(key)?;

        if SystemTime::now() < entry.expires_at {
            Some(entry.value.clone())
        } else {
            None
        }
    }

    /// Insert a value; when full, expired entries go first, then the soonest to expire
    pub fn set(&self, key: String, value: String) -> Result<()> {
        let now = SystemTime::now();
        let entry = CacheEntry {
            value,
            expires_at: now + self.ttl,
        };

        if let Ok(mut entries) = self.entries.write() {
            if entries.len() >= self.capacity && !entries.contains_key(&key) {
                entries.retain(|_, e| now < e.expires_at);
                if entries.len() >= self.capacity {
                    let oldest = entries
                        .iter()
                        .min_by_key(|(_, e)| e.expires_at)
                        .map(|(k, _)| k.clone());
                    if let Some(oldest) = oldest {
                        entries.remove(&oldest);
                    }
                }
            }
            entries.insert(key, entry);
        }

        Ok(())
    }

    pub fn clear(&self) {
        if let Ok(mut entries) = self.entries.write() {
            entries.clear();
        }
    }

    pub fn stats(&self) -> CacheStats {
        if let Ok(entries) = self.entries.read() {
            let now = SystemTime::now();
            let total = entries.len();
            let expired = entries.values().filter(|e| now >= e.expires_at).count();

            CacheStats {
                total_entries: total,
                expired_entries: expired,
                active_entries: total - expired,
            }
        } else {
            CacheStats::default()
        }
    }
}

impl Default for LLMCache {
    fn default() -> Self {
        Self::new()
    }
}

/// Cache statistics
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct CacheStats {
    pub total_entries: usize,
    pub expired_entries: usize,
    pub active_entries: usize,
}

/// Cache key for a chat completion against one model
pub fn chat_cache_key(model: &str, messages: &str) -> String {
    use std::collections::hash_map::DefaultHasher;
    use std::hash::{Hash, Hasher};

    let mut hasher = DefaultHasher::new();
    model.hash(&mut hasher);
    messages.hash(&mut hasher);
    format!("chat:{}:{:x}", model, hasher.finish())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cache_basic() {
        let cache = LLMCache::new();

        cache.set("key1".to_string(), "value1".to_string()).unwrap();
        assert_eq!(cache.get("key1"), Some("value1".to_string()));
        assert_eq!(cache.get("key2"), None);
    }

    #[test]
    fn test_cache_expiry() {
        let cache = LLMCache::with_ttl(Duration::from_millis(50));

        cache.set("key1".to_string(), "value1".to_string()).unwrap();
        std::thread::sleep(Duration::from_millis(80));
        assert_eq!(cache.get("key1"), None);
        assert_eq!(cache.stats().expired_entries, 1);
    }

    #[test]
    fn test_cache_capacity_evicts() {
        let cache = LLMCache {
            capacity: 2,
            ..LLMCache::new()
        };
        cache.set("a".to_string(), "1".to_string()).unwrap();
        std::thread::sleep(Duration::from_millis(2));
        cache.set("b".to_string(), "2".to_string()).unwrap();
        std::thread::sleep(Duration::from_millis(2));
        cache.set("c".to_string(), "3".to_string()).unwrap();

        assert_eq!(cache.stats().total_entries, 2);
        assert_eq!(cache.get("a"), None);
        assert_eq!(cache.get("c"), Some("3".to_string()));
    }

    #[test]
    fn test_chat_cache_key_depends_on_model() {
        assert_eq!(chat_cache_key("m", "x"), chat_cache_key("m", "x"));
        assert_ne!(chat_cache_key("m", "x"), chat_cache_key("n", "x"));
    }
}
