//! Exchange context: one registry, one ledger, many markets
//!
//! `Exchange` owns the shared components and hands out `Arc` handles.
//! Markets live in a concurrent map keyed by name and draw order ids
//! from a single sequence, so an order id is unique across the whole
//! exchange, not just its market.

use std::sync::Arc;

use dashmap::DashMap;

use crate::asset_registry::AssetRegistry;
use crate::core_types::{AssetId, Sequence};
use crate::error::ExchangeError;
use crate::events::{EventHub, LedgerEvent};
use crate::ledger::Ledger;
use crate::market::{Market, MarketParams};
use crate::varstore::{VarStore, keys};

pub struct Exchange {
    registry: Arc<AssetRegistry>,
    ledger: Arc<Ledger>,
    vars: Arc<VarStore>,
    hub: Arc<EventHub<LedgerEvent>>,
    markets: DashMap<String, Arc<Market>>,
    order_seq: Arc<Sequence>,
}

impl Exchange {
    pub fn new() -> Self {
        let hub = Arc::new(EventHub::new());
        let registry = Arc::new(AssetRegistry::new(Arc::clone(&hub)));
        let ledger = Arc::new(Ledger::new(Arc::clone(&registry), Arc::clone(&hub)));
        Self {
            registry,
            ledger,
            vars: Arc::new(VarStore::new()),
            hub,
            markets: DashMap::new(),
            order_seq: Arc::new(Sequence::new(1)),
        }
    }

    #[inline]
    pub fn registry(&self) -> &Arc<AssetRegistry> {
        &self.registry
    }

    #[inline]
    pub fn ledger(&self) -> &Arc<Ledger> {
        &self.ledger
    }

    #[inline]
    pub fn vars(&self) -> &Arc<VarStore> {
        &self.vars
    }

    /// Registry and ledger events share one hub.
    #[inline]
    pub fn events(&self) -> &Arc<EventHub<LedgerEvent>> {
        &self.hub
    }

    /// Create a market over two registered assets. Fee parameters come
    /// from the variable store at creation time; later variable edits
    /// do not touch existing markets.
    pub fn create_market(
        &self,
        name: &str,
        order_asset: AssetId,
        payment_asset: AssetId,
    ) -> Result<Arc<Market>, ExchangeError> {
        self.require_asset(order_asset)?;
        self.require_asset(payment_asset)?;

        let params = MarketParams {
            order_asset,
            payment_asset,
            ask_fee_pct: self.vars.get_or(keys::ASK_FEE_PCT, 0.0),
            bid_fee_pct: self.vars.get_or(keys::BID_FEE_PCT, 0.0),
            fee_account: self.vars.get_or(keys::FEE_ACCOUNT, 0),
        };

        let market = Arc::new(Market::new(
            name,
            params,
            Arc::clone(&self.ledger),
            Arc::clone(&self.vars),
            Arc::clone(&self.order_seq),
        ));
        // Entry keeps check-and-insert atomic against concurrent creates.
        match self.markets.entry(name.to_string()) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                Err(ExchangeError::DuplicateMarket(name.to_string()))
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(Arc::clone(&market));
                tracing::info!(market = name, order_asset, payment_asset, "market created");
                Ok(market)
            }
        }
    }

    pub fn market(&self, name: &str) -> Result<Arc<Market>, ExchangeError> {
        self.markets
            .get(name)
            .map(|m| Arc::clone(m.value()))
            .ok_or_else(|| ExchangeError::UnknownMarket(name.to_string()))
    }

    pub fn has_market(&self, name: &str) -> bool {
        self.markets.contains_key(name)
    }

    /// Snapshot of all markets, sorted by name.
    pub fn markets(&self) -> Vec<Arc<Market>> {
        let mut list: Vec<Arc<Market>> = self
            .markets
            .iter()
            .map(|e| Arc::clone(e.value()))
            .collect();
        list.sort_by(|a, b| a.name().cmp(b.name()));
        list
    }

    pub fn markets_len(&self) -> usize {
        self.markets.len()
    }

    fn require_asset(&self, asset: AssetId) -> Result<(), ExchangeError> {
        if self.registry.contains_id(asset) {
            Ok(())
        } else {
            Err(ExchangeError::Registry(
                crate::asset_registry::RegistryError::UnknownAsset(asset.to_string()),
            ))
        }
    }
}

impl Default for Exchange {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Exchange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Exchange")
            .field("assets", &self.registry.len())
            .field("accounts", &self.ledger.accounts_len())
            .field("markets", &self.markets.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::order::Side;

    fn exchange_with_assets() -> Exchange {
        let ex = Exchange::new();
        ex.registry().register("XBT", 0).unwrap();
        ex.registry().register("USD", 1).unwrap();
        ex
    }

    #[test]
    fn test_create_and_lookup_market() {
        let ex = exchange_with_assets();
        ex.create_market("XBT/USD", 0, 1).unwrap();

        let market = ex.market("XBT/USD").unwrap();
        assert_eq!(market.order_asset(), 0);
        assert_eq!(market.payment_asset(), 1);
        assert_eq!(ex.market("nope").unwrap_err().code(), "UNKNOWN_MARKET");
    }

    #[test]
    fn test_duplicate_market_rejected() {
        let ex = exchange_with_assets();
        ex.create_market("XBT/USD", 0, 1).unwrap();
        let err = ex.create_market("XBT/USD", 1, 0).unwrap_err();
        assert_eq!(err.code(), "DUPLICATE_MARKET");
        assert_eq!(ex.markets_len(), 1);
    }

    #[test]
    fn test_market_requires_registered_assets() {
        let ex = exchange_with_assets();
        let err = ex.create_market("XBT/EUR", 0, 2).unwrap_err();
        assert_eq!(err.code(), "UNKNOWN_ASSET");
        assert!(!ex.has_market("XBT/EUR"));
    }

    #[test]
    fn test_fee_vars_apply_at_creation() {
        let ex = exchange_with_assets();
        ex.vars().set(keys::ASK_FEE_PCT, "0.01");
        ex.vars().set(keys::BID_FEE_PCT, "0.02");
        ex.vars().set(keys::FEE_ACCOUNT, "42");

        let market = ex.create_market("XBT/USD", 0, 1).unwrap();
        assert_eq!(market.fees(), (0.01, 0.02));
        assert_eq!(market.fee_account(), 42);

        // Later edits leave the existing market alone.
        ex.vars().set(keys::ASK_FEE_PCT, "0.5");
        assert_eq!(market.fees(), (0.01, 0.02));
    }

    #[test]
    fn test_order_ids_unique_across_markets() {
        let ex = exchange_with_assets();
        ex.registry().register("ETH", 2).unwrap();
        let a = ex.create_market("XBT/USD", 0, 1).unwrap();
        let b = ex.create_market("ETH/USD", 2, 1).unwrap();

        let acct = ex.ledger().create_account().unwrap();
        ex.ledger()
            .exec_transaction(acct, crate::core_types::MINT_ACCOUNT, 0, 100.0)
            .unwrap();
        ex.ledger()
            .exec_transaction(acct, crate::core_types::MINT_ACCOUNT, 2, 100.0)
            .unwrap();

        let id_a = a.add_order(Side::Ask, acct, 1.0, 10.0).unwrap();
        let id_b = b.add_order(Side::Ask, acct, 1.0, 10.0).unwrap();
        assert_ne!(id_a, id_b);
    }

    #[test]
    fn test_markets_sorted_by_name() {
        let ex = exchange_with_assets();
        ex.create_market("b", 0, 1).unwrap();
        ex.create_market("a", 0, 1).unwrap();
        let names: Vec<String> = ex.markets().iter().map(|m| m.name().to_string()).collect();
        assert_eq!(names, ["a", "b"]);
    }
}
