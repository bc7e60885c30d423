//! Bourse - an in-process exchange
//!
//! A self-contained exchange for programs that need markets as a
//! library: a named asset registry, a double-entry ledger with an
//! append-only transaction log, and price-time-priority order books
//! that settle through the ledger. A text command surface drives it
//! all from a prompt or a script.
//!
//! # Modules
//!
//! - [`core_types`] - Ids, sentinels, and the shared id sequence
//! - [`asset_registry`] - Name/id bindings for tradeable assets
//! - [`ledger`] - Balances, transfers, and the transaction log
//! - [`order`] - Limit orders and their lifecycle
//! - [`market`] - Order books, matching, and settlement
//! - [`events`] - Subscription hubs for ledger and market events
//! - [`varstore`] - Runtime-tunable string variables
//! - [`exchange`] - The context tying one ledger to many markets
//! - [`commands`] - The text command surface
//! - [`module`] - Load/unload hooks for feature bundles
//! - [`config`] - YAML configuration
//! - [`logging`] - tracing subscriber setup

pub mod asset_registry;
pub mod commands;
pub mod config;
pub mod core_types;
pub mod error;
pub mod events;
pub mod exchange;
pub mod ledger;
pub mod logging;
pub mod market;
pub mod module;
pub mod order;
pub mod varstore;

// Convenient re-exports at crate root
pub use asset_registry::{Asset, AssetRegistry, RegistryError};
pub use commands::{Command, CommandRegistry, builtin_commands};
pub use config::{AppConfig, ExchangeSeed};
pub use core_types::{
    AccountId, AssetId, MINT_ACCOUNT, NO_ASSET, NO_ASSET_NAME, OrderId, Sequence, TxId,
};
pub use error::ExchangeError;
pub use events::{EventHub, LedgerEvent, ListenerId, MarketEvent};
pub use exchange::Exchange;
pub use ledger::{Ledger, LedgerError, Transaction, TransactionQuery, Transfer};
pub use market::{DEFAULT_EPSILON, DepthSnapshot, Market, MarketError, MarketParams};
pub use module::{ExchangeModule, Module, ModuleHost};
pub use order::{Order, OrderInfo, Side};
pub use varstore::{VarStore, keys};
