//! # Configuration
//!
//! A minimal string key/value store. Components read typed values out of
//! a [`TenancyConfigSnapshot`] and fall back to their own defaults, so an
//! application can layer files, flags and environment however it likes.
//!
//! ```rust
//! use tenancy_core::TenancyConfig;
//!
//! let mut config = TenancyConfig::new();
//! config.set("retry.max_retries", "3");
//! config.set("retry.base_delay_ms", "2000");
//!
//! let snapshot = config.snapshot();
//! assert_eq!(snapshot.get_u32("retry.max_retries"), Some(3));
//! ```
//!
//! ## Environment overrides
//! ```bash
//! export TENANCY__RETRY__BASE_DELAY_MS=500
//! ```
//! `load_env("TENANCY__")` maps that to `retry.base_delay_ms`.

use std::collections::HashMap;
use std::time::Duration;

#[derive(Debug, Default, Clone)]
pub struct TenancyConfig {
    values: HashMap<String, String>,
}

impl TenancyConfig {
    /// Create an empty config store.
    pub fn new() -> Self {
        Self {
            values: HashMap::new(),
        }
    }

    /// Set a configuration key to a string value.
    pub fn set<K, V>(&mut self, key: K, value: V)
    where
        K: Into<String>,
        V: Into<String>,
    {
        self.values.insert(key.into(), value.into());
    }

    /// Get a configuration value by key.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(|s| s.as_str())
    }

    pub fn has(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }

    /// Import every variable starting with `prefix`.
    ///
    /// `PREFIX_A__B_C` becomes `a.b_c`. Returns how many keys were set.
    pub fn load_env(&mut self, prefix: &str) -> usize {
        self.load_vars(prefix, std::env::vars())
    }

    /// Same as [`load_env`](Self::load_env) over an explicit iterator.
    pub fn load_vars<I>(&mut self, prefix: &str, vars: I) -> usize
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let mut count = 0;
        for (key, value) in vars {
            if let Some(stripped) = key.strip_prefix(prefix) {
                if stripped.is_empty() {
                    continue;
                }
                let normalized = stripped.to_lowercase().replace("__", ".");
                self.set(normalized, value);
                count += 1;
            }
        }
        count
    }

    pub fn snapshot(&self) -> TenancyConfigSnapshot {
        TenancyConfigSnapshot::new(self.values.clone())
    }
}

#[derive(Debug, Clone, Default)]
pub struct TenancyConfigSnapshot {
    map: HashMap<String, String>,
}

impl TenancyConfigSnapshot {
    pub(crate) fn new(map: HashMap<String, String>) -> Self {
        Self { map }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.map.get(key).map(|s| s.as_str())
    }

    pub fn get_string(&self, key: &str) -> Option<String> {
        self.map.get(key).cloned()
    }

    pub fn get_u32(&self, key: &str) -> Option<u32> {
        self.get(key).and_then(|v| v.trim().parse::<u32>().ok())
    }

    pub fn get_u64(&self, key: &str) -> Option<u64> {
        self.get(key).and_then(|v| v.trim().parse::<u64>().ok())
    }

    pub fn get_usize(&self, key: &str) -> Option<usize> {
        self.get(key).and_then(|v| v.trim().parse::<usize>().ok())
    }

    pub fn get_bool(&self, key: &str) -> Option<bool> {
        self.get(key).and_then(|v| v.trim().parse::<bool>().ok())
    }

    /// Milliseconds stored as an integer string.
    pub fn get_duration_ms(&self, key: &str) -> Option<Duration> {
        self.get_u64(key).map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn env_keys_are_normalized() {
        let mut config = TenancyConfig::new();
        let n = config.load_vars(
            "TENANCY__",
            vec![
                ("TENANCY__RETRY__BASE_DELAY_MS".to_string(), "500".to_string()),
                ("TENANCY__REST__URL".to_string(), "http://localhost".to_string()),
                ("OTHER__KEY".to_string(), "x".to_string()),
                ("TENANCY__".to_string(), "ignored".to_string()),
            ],
        );
        assert_eq!(n, 2);
        let snap = config.snapshot();
        assert_eq!(snap.get_duration_ms("retry.base_delay_ms"), Some(Duration::from_millis(500)));
        assert_eq!(snap.get("rest.url"), Some("http://localhost"));
        assert!(!config.has("other.key"));
    }

    #[test]
    fn typed_getters_reject_garbage() {
        let mut config = TenancyConfig::new();
        config.set("a", "not-a-number");
        config.set("b", "true");
        let snap = config.snapshot();
        assert_eq!(snap.get_u32("a"), None);
        assert_eq!(snap.get_bool("b"), Some(true));
        assert_eq!(snap.get_usize("missing"), None);
    }
}
