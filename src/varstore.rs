//! Variable store
//!
//! Flat key -> string configuration consumed by the core at its
//! boundary. Values are stored as text and parsed on read with
//! [`VarStore::get_or`]; a value that fails to parse logs a warning and
//! falls back to the caller's default, it never errors. Seeded from the
//! application config at startup and writable at runtime through the
//! command layer.

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::{PoisonError, RwLock};

/// Well-known keys read by the exchange core.
pub mod keys {
    /// Matching close threshold, read live on every resolve pass.
    pub const EPSILON: &str = "exchange.epsilon";
    /// Default ask-side fee fraction for newly created markets.
    pub const ASK_FEE_PCT: &str = "exchange.ask_fee_pct";
    /// Default bid-side fee fraction for newly created markets.
    pub const BID_FEE_PCT: &str = "exchange.bid_fee_pct";
    /// Default fee-collection account for newly created markets.
    pub const FEE_ACCOUNT: &str = "exchange.fee_account";
}

#[derive(Default)]
pub struct VarStore {
    vars: RwLock<HashMap<String, String>>,
}

impl VarStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, key: &str, value: impl Into<String>) {
        self.vars
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.to_string(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<String> {
        self.vars
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned()
    }

    pub fn remove(&self, key: &str) -> Option<String> {
        self.vars
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(key)
    }

    /// Parse the value under `key`, or fall back to `default` when the
    /// key is absent or unparseable.
    pub fn get_or<T: FromStr>(&self, key: &str, default: T) -> T {
        match self.get(key) {
            None => default,
            Some(raw) => match raw.parse() {
                Ok(value) => value,
                Err(_) => {
                    tracing::warn!(key, raw, "unparseable variable, using default");
                    default
                }
            },
        }
    }

    pub fn contains(&self, key: &str) -> bool {
        self.vars
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.vars
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// All pairs, sorted by key for stable rendering.
    pub fn snapshot(&self) -> Vec<(String, String)> {
        let mut pairs: Vec<(String, String)> = self
            .vars
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        pairs.sort();
        pairs
    }
}

impl std::fmt::Debug for VarStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VarStore").field("vars", &self.len()).finish()
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_get_remove() {
        let vars = VarStore::new();
        assert_eq!(vars.get("exchange.epsilon"), None);

        vars.set("exchange.epsilon", "0.01");
        assert_eq!(vars.get("exchange.epsilon").as_deref(), Some("0.01"));
        assert!(vars.contains("exchange.epsilon"));

        assert_eq!(vars.remove("exchange.epsilon").as_deref(), Some("0.01"));
        assert_eq!(vars.remove("exchange.epsilon"), None);
    }

    #[test]
    fn test_get_or_parses() {
        let vars = VarStore::new();
        vars.set(keys::EPSILON, "0.5");
        vars.set(keys::FEE_ACCOUNT, "42");

        assert_eq!(vars.get_or(keys::EPSILON, 0.001), 0.5);
        assert_eq!(vars.get_or::<i64>(keys::FEE_ACCOUNT, 0), 42);
        // Absent key falls back.
        assert_eq!(vars.get_or(keys::ASK_FEE_PCT, 0.25), 0.25);
    }

    #[test]
    fn test_get_or_bad_value_falls_back() {
        let vars = VarStore::new();
        vars.set(keys::EPSILON, "not-a-number");
        assert_eq!(vars.get_or(keys::EPSILON, 0.001), 0.001);
        // The raw string is still there untouched.
        assert_eq!(vars.get(keys::EPSILON).as_deref(), Some("not-a-number"));
    }

    #[test]
    fn test_snapshot_sorted() {
        let vars = VarStore::new();
        vars.set("b", "2");
        vars.set("a", "1");
        vars.set("c", "3");

        let snap = vars.snapshot();
        let keys: Vec<&str> = snap.iter().map(|(k, _)| k.as_str()).collect();
        assert_eq!(keys, vec!["a", "b", "c"]);
    }
}
