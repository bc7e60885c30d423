//! Asset registry
//!
//! Bidirectional mapping between symbolic asset names ("XBT", "USD") and
//! integer asset ids. The ledger keys balances by id; the command layer
//! speaks names. Both directions are O(1).
//!
//! Id `-1` and the names `"null"` / `""` are reserved sentinels meaning
//! "no asset" and can never be registered. Re-registering an existing
//! name under a fresh id overwrites the old binding; registering an id
//! that is already taken is an error.

use std::sync::{Arc, PoisonError, RwLock};

use rustc_hash::FxHashMap;
use serde::Serialize;
use thiserror::Error;

use crate::core_types::{AssetId, NO_ASSET_NAME};
use crate::events::{EventHub, LedgerEvent};

/// A registered asset binding.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Asset {
    pub id: AssetId,
    pub name: String,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("asset id {id} already registered to '{name}'")]
    DuplicateAssetId { id: AssetId, name: String },

    #[error("reserved asset {0}")]
    ReservedAsset(String),

    #[error("unknown asset '{0}'")]
    UnknownAsset(String),
}

impl RegistryError {
    /// Stable machine-checkable error code.
    pub fn code(&self) -> &'static str {
        match self {
            RegistryError::DuplicateAssetId { .. } => "DUPLICATE_ASSET_ID",
            RegistryError::ReservedAsset(_) => "RESERVED_ASSET",
            RegistryError::UnknownAsset(_) => "UNKNOWN_ASSET",
        }
    }
}

#[derive(Default)]
struct RegistryInner {
    name_to_id: FxHashMap<String, AssetId>,
    id_to_name: FxHashMap<AssetId, String>,
}

/// Thread-safe name <-> id registry.
///
/// Registry mutations emit [`LedgerEvent::AssetRegistryChanged`] on the
/// shared ledger hub, after the registry lock is released.
pub struct AssetRegistry {
    inner: RwLock<RegistryInner>,
    hub: Arc<EventHub<LedgerEvent>>,
}

impl AssetRegistry {
    pub fn new(hub: Arc<EventHub<LedgerEvent>>) -> Self {
        Self {
            inner: RwLock::new(RegistryInner::default()),
            hub,
        }
    }

    /// Bind `name` to `id`.
    ///
    /// Negative ids and the sentinel names are reserved. An id already
    /// bound to a different name is rejected with
    /// [`RegistryError::DuplicateAssetId`]. A name already bound is
    /// rebound: the old id is released. Re-registering the identical
    /// binding succeeds, so config reloads stay idempotent.
    pub fn register(&self, name: &str, id: AssetId) -> Result<(), RegistryError> {
        if id < 0 {
            return Err(RegistryError::ReservedAsset(format!("id {id}")));
        }
        if name.is_empty() || name == NO_ASSET_NAME {
            return Err(RegistryError::ReservedAsset(format!("name '{name}'")));
        }

        {
            let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
            if let Some(existing) = inner.id_to_name.get(&id)
                && existing != name
            {
                return Err(RegistryError::DuplicateAssetId {
                    id,
                    name: existing.clone(),
                });
            }
            if let Some(old_id) = inner.name_to_id.insert(name.to_string(), id)
                && old_id != id
            {
                inner.id_to_name.remove(&old_id);
                tracing::info!(asset = name, old_id, new_id = id, "asset rebound");
            }
            inner.id_to_name.insert(id, name.to_string());
        }

        self.hub
            .emit(&LedgerEvent::AssetRegistryChanged(name.to_string()));
        Ok(())
    }

    /// Drop the binding for `name` in both directions.
    pub fn remove(&self, name: &str) -> Result<(), RegistryError> {
        {
            let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
            let id = inner
                .name_to_id
                .remove(name)
                .ok_or_else(|| RegistryError::UnknownAsset(name.to_string()))?;
            inner.id_to_name.remove(&id);
        }

        self.hub
            .emit(&LedgerEvent::AssetRegistryChanged(name.to_string()));
        Ok(())
    }

    #[inline]
    pub fn id_of(&self, name: &str) -> Option<AssetId> {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .name_to_id
            .get(name)
            .copied()
    }

    #[inline]
    pub fn name_of(&self, id: AssetId) -> Option<String> {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .id_to_name
            .get(&id)
            .cloned()
    }

    pub fn contains_name(&self, name: &str) -> bool {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .name_to_id
            .contains_key(name)
    }

    pub fn contains_id(&self, id: AssetId) -> bool {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .id_to_name
            .contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .name_to_id
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Ids of all registered assets, unordered.
    pub fn asset_ids(&self) -> Vec<AssetId> {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .id_to_name
            .keys()
            .copied()
            .collect()
    }

    /// Snapshot of all bindings, sorted by id for stable output.
    pub fn assets(&self) -> Vec<Asset> {
        let mut assets: Vec<Asset> = self
            .inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .id_to_name
            .iter()
            .map(|(&id, name)| Asset {
                id,
                name: name.clone(),
            })
            .collect();
        assets.sort_by_key(|a| a.id);
        assets
    }
}

impl std::fmt::Debug for AssetRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AssetRegistry")
            .field("assets", &self.len())
            .finish()
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    fn registry() -> AssetRegistry {
        AssetRegistry::new(Arc::new(EventHub::new()))
    }

    #[test]
    fn test_register_and_lookup() {
        let reg = registry();
        reg.register("XBT", 0).unwrap();
        reg.register("USD", 1).unwrap();

        assert_eq!(reg.id_of("XBT"), Some(0));
        assert_eq!(reg.id_of("USD"), Some(1));
        assert_eq!(reg.name_of(0).as_deref(), Some("XBT"));
        assert_eq!(reg.id_of("ETH"), None);
        assert_eq!(reg.name_of(9), None);
        assert_eq!(reg.len(), 2);
    }

    #[test]
    fn test_duplicate_id_rejected() {
        let reg = registry();
        reg.register("XBT", 0).unwrap();

        let err = reg.register("USD", 0).unwrap_err();
        assert_eq!(err.code(), "DUPLICATE_ASSET_ID");
        assert_eq!(reg.len(), 1);
        assert_eq!(reg.name_of(0).as_deref(), Some("XBT"));
    }

    #[test]
    fn test_identical_rebind_is_idempotent() {
        let reg = registry();
        reg.register("XBT", 0).unwrap();
        // Replaying the same registration (config reload, repeated
        // script line) must succeed and change nothing.
        reg.register("XBT", 0).unwrap();

        assert_eq!(reg.id_of("XBT"), Some(0));
        assert_eq!(reg.name_of(0).as_deref(), Some("XBT"));
        assert_eq!(reg.len(), 1);
    }

    #[test]
    fn test_name_rebind_releases_old_id() {
        let reg = registry();
        reg.register("XBT", 0).unwrap();
        reg.register("XBT", 7).unwrap();

        assert_eq!(reg.id_of("XBT"), Some(7));
        assert_eq!(reg.name_of(0), None, "old id must be released");
        assert_eq!(reg.len(), 1);
        // Released id is free for someone else.
        reg.register("USD", 0).unwrap();
        assert_eq!(reg.name_of(0).as_deref(), Some("USD"));
    }

    #[test]
    fn test_sentinels_rejected() {
        let reg = registry();
        assert_eq!(reg.register("XBT", -1).unwrap_err().code(), "RESERVED_ASSET");
        assert_eq!(reg.register("XBT", -5).unwrap_err().code(), "RESERVED_ASSET");
        assert_eq!(reg.register("null", 0).unwrap_err().code(), "RESERVED_ASSET");
        assert_eq!(reg.register("", 0).unwrap_err().code(), "RESERVED_ASSET");
        assert!(reg.is_empty());
    }

    #[test]
    fn test_remove() {
        let reg = registry();
        reg.register("XBT", 0).unwrap();
        reg.remove("XBT").unwrap();

        assert_eq!(reg.id_of("XBT"), None);
        assert_eq!(reg.name_of(0), None);
        assert_eq!(reg.remove("XBT").unwrap_err().code(), "UNKNOWN_ASSET");
    }

    #[test]
    fn test_registry_events() {
        let hub = Arc::new(EventHub::new());
        let names = Arc::new(Mutex::new(Vec::new()));
        let names_cl = Arc::clone(&names);
        hub.subscribe(move |ev: &LedgerEvent| {
            if let LedgerEvent::AssetRegistryChanged(name) = ev {
                names_cl.lock().unwrap().push(name.clone());
            }
        });

        let reg = AssetRegistry::new(Arc::clone(&hub));
        reg.register("XBT", 0).unwrap();
        reg.register("USD", 1).unwrap();
        reg.remove("XBT").unwrap();
        // Failed registration must not emit.
        let _ = reg.register("ETH", 1).unwrap_err();

        assert_eq!(*names.lock().unwrap(), vec!["XBT", "USD", "XBT"]);
    }

    #[test]
    fn test_assets_snapshot_sorted() {
        let reg = registry();
        reg.register("USD", 5).unwrap();
        reg.register("XBT", 2).unwrap();

        let assets = reg.assets();
        assert_eq!(assets.len(), 2);
        assert_eq!(assets[0].id, 2);
        assert_eq!(assets[1].name, "USD");
    }
}
