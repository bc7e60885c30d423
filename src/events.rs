//! In-process event hub
//!
//! Typed synchronous pub/sub: components own an [`EventHub`] and invoke
//! registered listeners inline on the emitting thread. There is no queue
//! and no delivery thread; a listener that blocks delays the operation
//! that emitted.
//!
//! Emission never happens while a component state lock is held, so a
//! listener may call back into the exchange. Market trade events are
//! additionally deferred until the matching pass has fully released its
//! serialization gate.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use serde::Serialize;

use crate::core_types::{AccountId, OrderId};

/// Handle returned by [`EventHub::subscribe`], used to unsubscribe.
pub type ListenerId = u64;

type Listener<E> = Arc<dyn Fn(&E) + Send + Sync>;

// ============================================================================
// Event payloads
// ============================================================================

/// Events emitted by a single market instance.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum MarketEvent {
    /// Book contents changed (order placed, cancelled, removed, or reset).
    OrderbookChanged,
    /// A new order entered the book (emitted after matching completes).
    OrderAdded(OrderId),
    /// An order left the book into the graveyard.
    OrderRemoved(OrderId),
    /// A match executed at `price` for `volume` units of the order asset.
    TradeExecuted { price: f64, volume: f64 },
}

impl MarketEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            MarketEvent::OrderbookChanged => "orderbook_changed",
            MarketEvent::OrderAdded(_) => "order_added",
            MarketEvent::OrderRemoved(_) => "order_removed",
            MarketEvent::TradeExecuted { .. } => "trade_executed",
        }
    }
}

/// Events emitted by the ledger and the asset registry (shared hub).
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum LedgerEvent {
    /// An account's balances changed (one event per counterparty).
    AccountChanged(AccountId),
    /// An asset binding was added, overwritten, or removed.
    AssetRegistryChanged(String),
}

impl LedgerEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            LedgerEvent::AccountChanged(_) => "account_changed",
            LedgerEvent::AssetRegistryChanged(_) => "asset_registry_changed",
        }
    }
}

// ============================================================================
// Hub
// ============================================================================

/// Registry of typed listener functions with synchronous delivery.
///
/// Listeners are invoked in subscription order. `emit` snapshots the
/// listener list before calling out, so a listener may subscribe or
/// unsubscribe (itself included) from within its own callback.
pub struct EventHub<E> {
    listeners: RwLock<Vec<(ListenerId, Listener<E>)>>,
    next_id: AtomicU64,
}

impl<E> EventHub<E> {
    pub fn new() -> Self {
        Self {
            listeners: RwLock::new(Vec::new()),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn subscribe(&self, listener: impl Fn(&E) + Send + Sync + 'static) -> ListenerId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.listeners
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push((id, Arc::new(listener)));
        id
    }

    /// Returns `true` if the listener was present.
    pub fn unsubscribe(&self, id: ListenerId) -> bool {
        let mut listeners = self
            .listeners
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let before = listeners.len();
        listeners.retain(|(lid, _)| *lid != id);
        listeners.len() != before
    }

    pub fn listener_count(&self) -> usize {
        self.listeners
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn emit(&self, event: &E) {
        let snapshot: Vec<Listener<E>> = self
            .listeners
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(_, l)| Arc::clone(l))
            .collect();
        for listener in snapshot {
            listener(event);
        }
    }
}

impl<E> Default for EventHub<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E> std::fmt::Debug for EventHub<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventHub")
            .field("listeners", &self.listener_count())
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

    #[test]
    fn test_subscribe_emit_unsubscribe() {
        let hub: EventHub<MarketEvent> = EventHub::new();
        let seen = Arc::new(Mutex::new(Vec::new()));

        let seen_cl = Arc::clone(&seen);
        let id = hub.subscribe(move |ev: &MarketEvent| {
            seen_cl.lock().unwrap().push(ev.clone());
        });

        hub.emit(&MarketEvent::OrderAdded(7));
        hub.emit(&MarketEvent::TradeExecuted {
            price: 100.0,
            volume: 2.5,
        });

        assert!(hub.unsubscribe(id));
        assert!(!hub.unsubscribe(id), "second unsubscribe is a miss");
        hub.emit(&MarketEvent::OrderbookChanged);

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0], MarketEvent::OrderAdded(7));
    }

    #[test]
    fn test_delivery_in_subscription_order() {
        let hub: EventHub<LedgerEvent> = EventHub::new();
        let order = Arc::new(Mutex::new(Vec::new()));

        for tag in ["first", "second", "third"] {
            let order = Arc::clone(&order);
            hub.subscribe(move |_: &LedgerEvent| order.lock().unwrap().push(tag));
        }

        hub.emit(&LedgerEvent::AccountChanged(1));
        assert_eq!(*order.lock().unwrap(), vec!["first", "second", "third"]);
    }

    #[test]
    fn test_reentrant_unsubscribe_from_callback() {
        let hub: Arc<EventHub<LedgerEvent>> = Arc::new(EventHub::new());
        let fired = Arc::new(Mutex::new(0usize));

        let hub_cl = Arc::clone(&hub);
        let fired_cl = Arc::clone(&fired);
        let id = Arc::new(Mutex::new(0));
        let id_cl = Arc::clone(&id);
        let lid = hub.subscribe(move |_: &LedgerEvent| {
            *fired_cl.lock().unwrap() += 1;
            // One-shot: remove ourselves on first delivery.
            hub_cl.unsubscribe(*id_cl.lock().unwrap());
        });
        *id.lock().unwrap() = lid;

        hub.emit(&LedgerEvent::AccountChanged(1));
        hub.emit(&LedgerEvent::AccountChanged(2));
        assert_eq!(*fired.lock().unwrap(), 1);
        assert_eq!(hub.listener_count(), 0);
    }

    #[test]
    fn test_event_kinds() {
        assert_eq!(MarketEvent::OrderbookChanged.kind(), "orderbook_changed");
        assert_eq!(
            MarketEvent::TradeExecuted {
                price: 1.0,
                volume: 1.0
            }
            .kind(),
            "trade_executed"
        );
        assert_eq!(
            LedgerEvent::AssetRegistryChanged("XBT".into()).kind(),
            "asset_registry_changed"
        );
    }
}
