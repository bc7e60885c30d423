//! Market: order books, matching, settlement
//!
//! One `Market` pairs an order asset against a payment asset. Each side
//! of the book is a `BTreeMap` of price level -> FIFO queue of order
//! ids; the bid key is inverted so both sides iterate best-first. The
//! map key is the price's IEEE-754 bit pattern, which orders identically
//! to the value for the non-negative finite prices admitted by order
//! validation.
//!
//! Matching runs synchronously inside [`Market::add_order`] on the
//! caller's thread, serialized per market by a resolve gate. Each pass
//! closes the best ask/bid pair step by step: book deltas are applied
//! first, then the trade settles through the ledger as one atomic batch
//! (fees to the fee account, then the two net legs). If settlement
//! fails, that pass's deltas are rolled back and the error surfaces to
//! the `add_order` caller; committed earlier passes stand.
//!
//! Lock order: resolve gate, then book lock, then per-order state. The
//! ledger is only ever called with none of these held (the gate aside),
//! and ledger calls never re-enter the market.

use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use chrono::Utc;
use rustc_hash::FxHashMap;
use serde::Serialize;
use thiserror::Error;

use crate::core_types::{AccountId, AssetId, OrderId, Sequence};
use crate::events::{EventHub, MarketEvent};
use crate::ledger::{Ledger, LedgerError, Transfer};
use crate::order::{Order, OrderInfo, Side};
use crate::varstore::{VarStore, keys};

/// Matching close threshold when `exchange.epsilon` is unset.
pub const DEFAULT_EPSILON: f64 = 0.001;

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug, Error, PartialEq)]
pub enum MarketError {
    #[error("invalid order volume {0}")]
    InvalidVolume(f64),

    #[error("invalid order cost {0}")]
    InvalidCost(f64),

    #[error("invalid order type '{0}'")]
    InvalidOrderType(String),

    #[error("unknown order {0}")]
    UnknownOrder(OrderId),

    #[error("corrupt orderbook: {0}")]
    CorruptOrderbook(String),

    #[error(transparent)]
    Ledger(#[from] LedgerError),
}

impl MarketError {
    /// Stable machine-checkable error code.
    pub fn code(&self) -> &'static str {
        match self {
            MarketError::InvalidVolume(_) => "INVALID_VOLUME",
            MarketError::InvalidCost(_) => "INVALID_COST",
            MarketError::InvalidOrderType(_) => "INVALID_ORDER_TYPE",
            MarketError::UnknownOrder(_) => "UNKNOWN_ORDER",
            MarketError::CorruptOrderbook(_) => "CORRUPT_ORDERBOOK",
            MarketError::Ledger(e) => e.code(),
        }
    }
}

// ============================================================================
// Parameters and snapshots
// ============================================================================

/// Per-market settlement parameters. Fee percentages are fractions
/// (`0.1` = 10%).
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct MarketParams {
    pub order_asset: AssetId,
    pub payment_asset: AssetId,
    pub ask_fee_pct: f64,
    pub bid_fee_pct: f64,
    pub fee_account: AccountId,
}

/// Aggregated open volume per price level, best-first on both sides.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DepthSnapshot {
    /// `(price, open volume)`, lowest price first.
    pub asks: Vec<(f64, f64)>,
    /// `(price, open volume)`, highest price first.
    pub bids: Vec<(f64, f64)>,
}

// ============================================================================
// Books
// ============================================================================

/// Book key for a validated (non-negative, finite) price.
#[inline]
fn price_key(price: f64) -> u64 {
    price.to_bits()
}

struct Books {
    asks: BTreeMap<u64, VecDeque<OrderId>>,
    /// Key is `u64::MAX - price_key`, so iteration yields best bid first.
    bids: BTreeMap<u64, VecDeque<OrderId>>,
    /// Every order not yet removed, open or closed.
    index: FxHashMap<OrderId, Arc<Order>>,
    /// Orders removed from the books, retained for history.
    graveyard: FxHashMap<OrderId, Arc<Order>>,
}

impl Books {
    fn new() -> Self {
        Self {
            asks: BTreeMap::new(),
            bids: BTreeMap::new(),
            index: FxHashMap::default(),
            graveyard: FxHashMap::default(),
        }
    }

    fn key_for(side: Side, price: f64) -> u64 {
        match side {
            Side::Ask => price_key(price),
            Side::Bid => u64::MAX - price_key(price),
        }
    }

    fn insert(&mut self, order: Arc<Order>) {
        let key = Self::key_for(order.side(), order.price());
        let book = match order.side() {
            Side::Ask => &mut self.asks,
            Side::Bid => &mut self.bids,
        };
        book.entry(key).or_default().push_back(order.id());
        self.index.insert(order.id(), order);
    }

    /// Best open order on `side`, pruning closed or removed orders from
    /// queue fronts as it scans. An id resolvable in neither the index
    /// nor the graveyard is a fatal book corruption.
    fn best_open(&mut self, side: Side) -> Result<Option<Arc<Order>>, MarketError> {
        let book = match side {
            Side::Ask => &mut self.asks,
            Side::Bid => &mut self.bids,
        };
        loop {
            let Some(mut level) = book.first_entry() else {
                return Ok(None);
            };
            let queue = level.get_mut();
            while let Some(&id) = queue.front() {
                match self.index.get(&id) {
                    Some(order) if order.is_closed() => {
                        queue.pop_front();
                    }
                    Some(order) => return Ok(Some(Arc::clone(order))),
                    None if self.graveyard.contains_key(&id) => {
                        queue.pop_front();
                    }
                    None => {
                        tracing::error!(order = id, "book entry resolves to no indexed order");
                        return Err(MarketError::CorruptOrderbook(format!(
                            "order {id} present in book but not indexed"
                        )));
                    }
                }
            }
            level.remove();
        }
    }

    /// Drop `id` from its price level, removing the level if emptied.
    /// Missing entries are fine (lazy pruning may have beaten us).
    fn delete_entry(&mut self, side: Side, price: f64, id: OrderId) {
        let key = Self::key_for(side, price);
        let book = match side {
            Side::Ask => &mut self.asks,
            Side::Bid => &mut self.bids,
        };
        if let Some(queue) = book.get_mut(&key) {
            queue.retain(|&other| other != id);
            if queue.is_empty() {
                book.remove(&key);
            }
        }
    }

    fn find(&self, id: OrderId) -> Option<&Arc<Order>> {
        self.index.get(&id).or_else(|| self.graveyard.get(&id))
    }

    fn depth_side(&self, side: Side) -> Vec<(f64, f64)> {
        let book = match side {
            Side::Ask => &self.asks,
            Side::Bid => &self.bids,
        };
        let mut levels = Vec::new();
        for (&key, queue) in book {
            let price = match side {
                Side::Ask => f64::from_bits(key),
                Side::Bid => f64::from_bits(u64::MAX - key),
            };
            let mut volume = 0.0;
            for id in queue {
                if let Some(order) = self.index.get(id)
                    && !order.is_closed()
                {
                    volume += order.unfilled_volume();
                }
            }
            if volume > 0.0 {
                levels.push((price, volume));
            }
        }
        levels
    }
}

// ============================================================================
// Market
// ============================================================================

/// An order book pair with percentage fees and ledger settlement.
pub struct Market {
    name: String,
    params: RwLock<MarketParams>,
    books: RwLock<Books>,
    /// Serializes matching passes (and book resets) for this market.
    resolve_gate: Mutex<()>,
    ledger: Arc<Ledger>,
    vars: Arc<VarStore>,
    hub: EventHub<MarketEvent>,
    order_seq: Arc<Sequence>,
}

impl Market {
    pub fn new(
        name: impl Into<String>,
        params: MarketParams,
        ledger: Arc<Ledger>,
        vars: Arc<VarStore>,
        order_seq: Arc<Sequence>,
    ) -> Self {
        Self {
            name: name.into(),
            params: RwLock::new(params),
            books: RwLock::new(Books::new()),
            resolve_gate: Mutex::new(()),
            ledger,
            vars,
            hub: EventHub::new(),
            order_seq,
        }
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn params(&self) -> MarketParams {
        *self.params.read().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn order_asset(&self) -> AssetId {
        self.params().order_asset
    }

    pub fn payment_asset(&self) -> AssetId {
        self.params().payment_asset
    }

    pub fn fee_account(&self) -> AccountId {
        self.params().fee_account
    }

    pub fn fees(&self) -> (f64, f64) {
        let p = self.params();
        (p.ask_fee_pct, p.bid_fee_pct)
    }

    pub fn set_fees(&self, ask_fee_pct: f64, bid_fee_pct: f64) {
        let mut params = self.params.write().unwrap_or_else(PoisonError::into_inner);
        params.ask_fee_pct = ask_fee_pct;
        params.bid_fee_pct = bid_fee_pct;
    }

    /// Per-market event hub; subscribe here for book and trade events.
    pub fn events(&self) -> &EventHub<MarketEvent> {
        &self.hub
    }

    // ------------------------------------------------------------------
    // Order entry
    // ------------------------------------------------------------------

    /// Place a limit order and match it to quiescence.
    ///
    /// On a settlement failure the error surfaces here, with that pass's
    /// book deltas rolled back; the new order itself stays on the book
    /// (trades from earlier passes are committed and final).
    pub fn add_order(
        &self,
        side: Side,
        account: AccountId,
        volume: f64,
        cost: f64,
    ) -> Result<OrderId, MarketError> {
        if !volume.is_finite() || volume <= 0.0 {
            return Err(MarketError::InvalidVolume(volume));
        }
        if !cost.is_finite() || cost < 0.0 {
            return Err(MarketError::InvalidCost(cost));
        }

        let order = Arc::new(Order::new(
            self.order_seq.next_id(),
            side,
            account,
            volume,
            cost,
            Utc::now(),
        ));
        let id = order.id();
        self.books
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(order);
        tracing::debug!(
            market = %self.name,
            order = id,
            side = %side,
            account,
            volume,
            cost,
            "order placed"
        );

        let mut trades = Vec::new();
        let outcome = self.resolve(&mut trades);

        for &(price, volume) in &trades {
            self.hub.emit(&MarketEvent::TradeExecuted { price, volume });
        }
        self.hub.emit(&MarketEvent::OrderbookChanged);
        self.hub.emit(&MarketEvent::OrderAdded(id));

        outcome.map(|()| id)
    }

    /// Close an order without touching its fill state. Unknown ids are
    /// an error; an already-closed order is an idempotent no-op.
    ///
    /// Cancellation is cooperative: a matching pass already past its
    /// decision point completes on the pre-cancel state, and the next
    /// pass observes the close.
    pub fn cancel_order(&self, id: OrderId) -> Result<(), MarketError> {
        let order = self.order_handle(id)?;
        if order.close(Utc::now()) {
            tracing::debug!(market = %self.name, order = id, "order cancelled");
            self.hub.emit(&MarketEvent::OrderbookChanged);
        }
        Ok(())
    }

    /// Migrate an order out of the books into the graveyard, closing it
    /// first if still open. Unknown or already-removed ids are a no-op.
    pub fn remove_order(&self, id: OrderId) -> Result<(), MarketError> {
        let removed = {
            let mut books = self.books.write().unwrap_or_else(PoisonError::into_inner);
            match books.index.remove(&id) {
                None => false,
                Some(order) => {
                    order.close(Utc::now());
                    books.delete_entry(order.side(), order.price(), id);
                    books.graveyard.insert(id, order);
                    true
                }
            }
        };

        if removed {
            tracing::debug!(market = %self.name, order = id, "order removed");
            self.hub.emit(&MarketEvent::OrderRemoved(id));
            self.hub.emit(&MarketEvent::OrderbookChanged);
        }
        Ok(())
    }

    /// Live handle to an order, indexed or in the graveyard.
    pub fn order_handle(&self, id: OrderId) -> Result<Arc<Order>, MarketError> {
        self.books
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .find(id)
            .cloned()
            .ok_or(MarketError::UnknownOrder(id))
    }

    /// Plain-data snapshot of an order.
    pub fn get_order(&self, id: OrderId) -> Result<OrderInfo, MarketError> {
        Ok(self.order_handle(id)?.snapshot())
    }

    // ------------------------------------------------------------------
    // Asset changes
    // ------------------------------------------------------------------

    /// Repoint the market at a different order asset. Resets the books:
    /// every open order force-closes without fills and every order
    /// migrates to the graveyard.
    pub fn set_order_asset(&self, asset: AssetId) {
        let evicted = self.reset_books();
        {
            let mut params = self.params.write().unwrap_or_else(PoisonError::into_inner);
            params.order_asset = asset;
        }
        tracing::info!(market = %self.name, asset, evicted = evicted.len(), "order asset changed");
        self.emit_reset(evicted);
    }

    /// Repoint the market at a different payment asset; same reset
    /// semantics as [`Market::set_order_asset`].
    pub fn set_payment_asset(&self, asset: AssetId) {
        let evicted = self.reset_books();
        {
            let mut params = self.params.write().unwrap_or_else(PoisonError::into_inner);
            params.payment_asset = asset;
        }
        tracing::info!(market = %self.name, asset, evicted = evicted.len(), "payment asset changed");
        self.emit_reset(evicted);
    }

    fn reset_books(&self) -> Vec<OrderId> {
        let _gate = self
            .resolve_gate
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let mut books = self.books.write().unwrap_or_else(PoisonError::into_inner);
        let now = Utc::now();

        let mut evicted: Vec<OrderId> = books.index.keys().copied().collect();
        evicted.sort_unstable();
        let drained: Vec<(OrderId, Arc<Order>)> = books.index.drain().collect();
        for (id, order) in drained {
            order.close(now);
            books.graveyard.insert(id, order);
        }
        books.asks.clear();
        books.bids.clear();
        evicted
    }

    fn emit_reset(&self, evicted: Vec<OrderId>) {
        for id in evicted {
            self.hub.emit(&MarketEvent::OrderRemoved(id));
        }
        self.hub.emit(&MarketEvent::OrderbookChanged);
    }

    // ------------------------------------------------------------------
    // Views
    // ------------------------------------------------------------------

    /// Lowest open ask price, if any.
    pub fn best_ask(&self) -> Result<Option<f64>, MarketError> {
        let mut books = self.books.write().unwrap_or_else(PoisonError::into_inner);
        Ok(books.best_open(Side::Ask)?.map(|o| o.price()))
    }

    /// Highest open bid price, if any.
    pub fn best_bid(&self) -> Result<Option<f64>, MarketError> {
        let mut books = self.books.write().unwrap_or_else(PoisonError::into_inner);
        Ok(books.best_open(Side::Bid)?.map(|o| o.price()))
    }

    /// Aggregated open volume per price level.
    pub fn depth(&self) -> DepthSnapshot {
        let books = self.books.read().unwrap_or_else(PoisonError::into_inner);
        DepthSnapshot {
            asks: books.depth_side(Side::Ask),
            bids: books.depth_side(Side::Bid),
        }
    }

    /// Orders still indexed (open or closed, not removed).
    pub fn orders_len(&self) -> usize {
        self.books
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .index
            .len()
    }

    pub fn graveyard_len(&self) -> usize {
        self.books
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .graveyard
            .len()
    }

    // ------------------------------------------------------------------
    // Matching
    // ------------------------------------------------------------------

    /// Match until no cross remains, pushing `(price, volume)` per
    /// executed trade. Committed trades stay in `trades` even when a
    /// later pass fails.
    fn resolve(&self, trades: &mut Vec<(f64, f64)>) -> Result<(), MarketError> {
        let _gate = self
            .resolve_gate
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let epsilon = self.vars.get_or(keys::EPSILON, DEFAULT_EPSILON);
        let params = self.params();

        loop {
            let (ask, bid) = {
                let mut books = self.books.write().unwrap_or_else(PoisonError::into_inner);
                let ask = books.best_open(Side::Ask)?;
                let bid = books.best_open(Side::Bid)?;
                match (ask, bid) {
                    (Some(ask), Some(bid)) => (ask, bid),
                    _ => return Ok(()),
                }
            };

            if ask.price() > bid.price() {
                return Ok(());
            }

            let ask_avail = ask.available_volume();
            let bid_avail = bid.available_volume();
            let new_bid_avail = (bid_avail + ask_avail).min(bid.volume());
            let dv = new_bid_avail - bid_avail;
            let new_ask_avail = (ask_avail - dv).max(0.0);

            // The order that was on the book first sets the price.
            let ask_rests = (ask.open_time(), ask.id()) <= (bid.open_time(), bid.id());
            let exec_price = if ask_rests { ask.price() } else { bid.price() };
            let exec_cost = dv * exec_price;
            let fee_volume = dv * params.bid_fee_pct;
            let fee_cost = exec_cost * params.ask_fee_pct;

            let now = Utc::now();
            ask.set_available_volume(new_ask_avail);
            bid.set_available_volume(new_bid_avail);
            // close() returns false if a concurrent cancel beat us; then
            // the cancel's stamp stands and rollback must not reopen.
            let ask_closed = new_ask_avail < epsilon && ask.close(now);
            let bid_closed = bid.volume() - new_bid_avail < epsilon && bid.close(now);

            if dv <= 0.0 {
                if ask_closed || bid_closed {
                    continue;
                }
                tracing::warn!(
                    market = %self.name,
                    ask = ask.id(),
                    bid = bid.id(),
                    epsilon,
                    "crossed pair makes no progress; stopping resolve"
                );
                return Ok(());
            }

            if let Err(err) = self.settle(
                &params, &ask, &bid, dv, exec_cost, fee_volume, fee_cost,
            ) {
                ask.set_available_volume(ask_avail);
                bid.set_available_volume(bid_avail);
                // Reopen only undoes this pass's own stamp.
                if ask_closed {
                    ask.reopen(now);
                }
                if bid_closed {
                    bid.reopen(now);
                }
                tracing::warn!(
                    market = %self.name,
                    ask = ask.id(),
                    bid = bid.id(),
                    error = %err,
                    "settlement failed, match rolled back"
                );
                return Err(MarketError::Ledger(err));
            }

            tracing::debug!(
                market = %self.name,
                ask = ask.id(),
                bid = bid.id(),
                price = exec_price,
                volume = dv,
                "trade executed"
            );
            trades.push((exec_price, dv));
        }
    }

    /// One atomic batch: both fees to the fee account, then the net
    /// payment and order-asset legs. Zero-amount legs are skipped.
    #[allow(clippy::too_many_arguments)]
    fn settle(
        &self,
        params: &MarketParams,
        ask: &Order,
        bid: &Order,
        dv: f64,
        exec_cost: f64,
        fee_volume: f64,
        fee_cost: f64,
    ) -> Result<(), LedgerError> {
        let mut legs: Vec<Transfer> = Vec::with_capacity(4);
        if fee_cost > 0.0 {
            legs.push(Transfer {
                to: params.fee_account,
                from: bid.account(),
                asset: params.payment_asset,
                amount: fee_cost,
            });
        }
        if fee_volume > 0.0 {
            legs.push(Transfer {
                to: params.fee_account,
                from: ask.account(),
                asset: params.order_asset,
                amount: fee_volume,
            });
        }
        if exec_cost - fee_cost > 0.0 {
            legs.push(Transfer {
                to: ask.account(),
                from: bid.account(),
                asset: params.payment_asset,
                amount: exec_cost - fee_cost,
            });
        }
        if dv - fee_volume > 0.0 {
            legs.push(Transfer {
                to: bid.account(),
                from: ask.account(),
                asset: params.order_asset,
                amount: dv - fee_volume,
            });
        }
        self.ledger.exec_batch(&legs)?;
        Ok(())
    }

    #[cfg(test)]
    fn inject_bogus_entry(&self, side: Side, price: f64, id: OrderId) {
        let mut books = self.books.write().unwrap_or_else(PoisonError::into_inner);
        let key = Books::key_for(side, price);
        let book = match side {
            Side::Ask => &mut books.asks,
            Side::Bid => &mut books.bids,
        };
        book.entry(key).or_default().push_back(id);
    }
}

impl std::fmt::Debug for Market {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Market")
            .field("name", &self.name)
            .field("params", &self.params())
            .field("orders", &self.orders_len())
            .finish()
    }
}

// ============================================================================
// Tests
// ============================================================================
