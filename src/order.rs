//! Order entity
//!
//! A limit order offering `volume` units of a market's order asset
//! against `cost` units of its payment asset. The implied limit price
//! `cost / volume` is fixed at construction; partial fills never move it.
//!
//! Fill progress is tracked by `available_volume`, whose direction is
//! side-dependent:
//!
//! - **Ask**: starts at `volume`, falls toward `0` (volume still for sale)
//! - **Bid**: starts at `0`, climbs toward `volume` (volume acquired)
//!
//! Both mutable fields (`available_volume`, `close_time`) live behind the
//! order's own mutex, so book readers and cancellation never contend on
//! the book-level lock and always observe a consistent pair.

use std::sync::{Mutex, PoisonError};

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::core_types::{AccountId, OrderId};

/// Which side of the book an order rests on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Ask,
    Bid,
}

impl Side {
    pub fn as_str(&self) -> &'static str {
        match self {
            Side::Ask => "ask",
            Side::Bid => "bid",
        }
    }

    /// Case-insensitive parse; anything but "ask"/"bid" is `None`.
    pub fn parse(s: &str) -> Option<Side> {
        match s.to_ascii_lowercase().as_str() {
            "ask" => Some(Side::Ask),
            "bid" => Some(Side::Bid),
            _ => None,
        }
    }
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug)]
struct OrderState {
    available_volume: f64,
    close_time: Option<DateTime<Utc>>,
}

/// A resting or closed order. Immutable identity fields plus a small
/// locked mutable state.
#[derive(Debug)]
pub struct Order {
    id: OrderId,
    side: Side,
    account: AccountId,
    volume: f64,
    cost: f64,
    price: f64,
    open_time: DateTime<Utc>,
    state: Mutex<OrderState>,
}

impl Order {
    /// Callers must have validated `volume > 0` and `cost >= 0`, both
    /// finite; the market does so before constructing.
    pub(crate) fn new(
        id: OrderId,
        side: Side,
        account: AccountId,
        volume: f64,
        cost: f64,
        open_time: DateTime<Utc>,
    ) -> Self {
        let available_volume = match side {
            Side::Ask => volume,
            Side::Bid => 0.0,
        };
        Self {
            id,
            side,
            account,
            volume,
            cost,
            price: cost / volume,
            open_time,
            state: Mutex::new(OrderState {
                available_volume,
                close_time: None,
            }),
        }
    }

    #[inline]
    pub fn id(&self) -> OrderId {
        self.id
    }

    #[inline]
    pub fn side(&self) -> Side {
        self.side
    }

    #[inline]
    pub fn account(&self) -> AccountId {
        self.account
    }

    #[inline]
    pub fn volume(&self) -> f64 {
        self.volume
    }

    #[inline]
    pub fn cost(&self) -> f64 {
        self.cost
    }

    /// Limit price, `cost / volume`. Fixed for the order's lifetime.
    #[inline]
    pub fn price(&self) -> f64 {
        self.price
    }

    #[inline]
    pub fn open_time(&self) -> DateTime<Utc> {
        self.open_time
    }

    pub fn available_volume(&self) -> f64 {
        self.lock_state().available_volume
    }

    pub fn close_time(&self) -> Option<DateTime<Utc>> {
        self.lock_state().close_time
    }

    pub fn is_closed(&self) -> bool {
        self.lock_state().close_time.is_some()
    }

    /// Volume that has not traded yet, side-normalized.
    pub fn unfilled_volume(&self) -> f64 {
        let state = self.lock_state();
        match self.side {
            Side::Ask => state.available_volume,
            Side::Bid => self.volume - state.available_volume,
        }
    }

    /// Consistent copy of identity and state in one lock acquisition.
    pub fn snapshot(&self) -> OrderInfo {
        let state = self.lock_state();
        OrderInfo {
            id: self.id,
            side: self.side,
            account: self.account,
            volume: self.volume,
            cost: self.cost,
            price: self.price,
            available_volume: state.available_volume,
            open_time: self.open_time,
            close_time: state.close_time,
        }
    }

    /// Stamp the close time. Returns `false` if already closed (the
    /// original stamp stands).
    pub(crate) fn close(&self, at: DateTime<Utc>) -> bool {
        let mut state = self.lock_state();
        if state.close_time.is_some() {
            return false;
        }
        state.close_time = Some(at);
        true
    }

    /// Settlement rollback only: clear the close stamped at `at` by a
    /// failed match. Any other stamp stands, so a close a caller has
    /// already observed is never undone.
    pub(crate) fn reopen(&self, at: DateTime<Utc>) {
        let mut state = self.lock_state();
        if state.close_time == Some(at) {
            state.close_time = None;
        }
    }

    pub(crate) fn set_available_volume(&self, volume: f64) {
        self.lock_state().available_volume = volume;
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, OrderState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Plain-data view of an order, safe to hand out and serialize.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OrderInfo {
    pub id: OrderId,
    pub side: Side,
    pub account: AccountId,
    pub volume: f64,
    pub cost: f64,
    pub price: f64,
    pub available_volume: f64,
    pub open_time: DateTime<Utc>,
    pub close_time: Option<DateTime<Utc>>,
}

impl OrderInfo {
    pub fn is_closed(&self) -> bool {
        self.close_time.is_some()
    }
}

// ============================================================================
// Tests
// ============================================================================
