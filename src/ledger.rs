//! Account ledger
//!
//! Holds every account's per-asset balances plus the append-only
//! transaction log, guarded by a single reader/writer lock. The mutation
//! primitives are [`Ledger::exec_transaction`] and its all-or-nothing
//! batch form [`Ledger::exec_batch`]: validate fully, then apply debits,
//! credits, and log appends under one exclusive acquisition. A failed
//! validation mutates nothing.
//!
//! Balances are `f64` and never go negative. Reads of a balance cell
//! that was never written are lenient and yield `0.0`; a credit creates
//! the cell. Minting (new supply) is a transfer whose `from` is the
//! [`MINT_ACCOUNT`] sentinel and skips the debit.
//!
//! Log invariants: ids are monotonic, timestamps are clamped
//! non-decreasing at append, records are never mutated or removed. The
//! range query binary-searches the time bounds before filtering.

use std::sync::{Arc, PoisonError, RwLock};

use chrono::{DateTime, Utc};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rustc_hash::FxHashMap;
use serde::Serialize;
use thiserror::Error;

use crate::asset_registry::AssetRegistry;
use crate::core_types::{AccountId, AssetId, MINT_ACCOUNT, Sequence, TxId};
use crate::events::{EventHub, LedgerEvent};

// ============================================================================
// Records
// ============================================================================

/// One committed transfer. Append-only once in the log.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Transaction {
    pub id: TxId,
    pub timestamp: DateTime<Utc>,
    pub to: AccountId,
    /// May be [`MINT_ACCOUNT`] for supply-creating transfers.
    pub from: AccountId,
    pub asset: AssetId,
    pub amount: f64,
}

/// One leg of a transfer, the input to [`Ledger::exec_transaction`] and
/// [`Ledger::exec_batch`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Transfer {
    pub to: AccountId,
    pub from: AccountId,
    pub asset: AssetId,
    pub amount: f64,
}

/// Filter for [`Ledger::get_transactions`]. `None` fields are wildcards;
/// the time range is half-open (`begin <= t < end`).
#[derive(Debug, Clone, Default)]
pub struct TransactionQuery {
    pub begin: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
    pub to: Option<AccountId>,
    pub from: Option<AccountId>,
    pub asset: Option<AssetId>,
    pub min_amount: Option<f64>,
    pub max_amount: Option<f64>,
}

impl TransactionQuery {
    fn matches(&self, tx: &Transaction) -> bool {
        if let Some(to) = self.to
            && tx.to != to
        {
            return false;
        }
        if let Some(from) = self.from
            && tx.from != from
        {
            return false;
        }
        if let Some(asset) = self.asset
            && tx.asset != asset
        {
            return false;
        }
        if let Some(min) = self.min_amount
            && tx.amount < min
        {
            return false;
        }
        if let Some(max) = self.max_amount
            && tx.amount > max
        {
            return false;
        }
        true
    }
}

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug, Error, PartialEq)]
pub enum LedgerError {
    #[error("invalid account id {0}")]
    InvalidAccount(AccountId),

    #[error("account {0} already exists")]
    DuplicateAccount(AccountId),

    #[error("cannot create an account before any asset is registered")]
    NoAssetsRegistered,

    #[error("unknown account {0}")]
    UnknownAccount(AccountId),

    #[error("transfer from account {0} to itself")]
    SelfTransfer(AccountId),

    #[error(
        "insufficient funds: account {account} holds {balance} of asset {asset}, needs {amount}"
    )]
    InsufficientFunds {
        account: AccountId,
        asset: AssetId,
        balance: f64,
        amount: f64,
    },

    #[error("invalid transfer amount {0}")]
    InvalidAmount(f64),
}

impl LedgerError {
    /// Stable machine-checkable error code.
    pub fn code(&self) -> &'static str {
        match self {
            LedgerError::InvalidAccount(_) => "INVALID_ACCOUNT",
            LedgerError::DuplicateAccount(_) => "DUPLICATE_ACCOUNT",
            LedgerError::NoAssetsRegistered => "NO_ASSETS_REGISTERED",
            LedgerError::UnknownAccount(_) => "UNKNOWN_ACCOUNT",
            LedgerError::SelfTransfer(_) => "SELF_TRANSFER",
            LedgerError::InsufficientFunds { .. } => "INSUFFICIENT_FUNDS",
            LedgerError::InvalidAmount(_) => "INVALID_AMOUNT",
        }
    }
}

// ============================================================================
// Ledger
// ============================================================================

struct LedgerInner {
    accounts: FxHashMap<AccountId, FxHashMap<AssetId, f64>>,
    log: Vec<Transaction>,
    rng: StdRng,
    last_ts: DateTime<Utc>,
}

impl LedgerInner {
    /// Arrival timestamp, clamped non-decreasing so the log stays
    /// binary-searchable by time even if the wall clock steps back.
    fn next_timestamp(&mut self) -> DateTime<Utc> {
        let now = Utc::now().max(self.last_ts);
        self.last_ts = now;
        now
    }
}

/// The account ledger. All state behind one `RwLock`; events emitted
/// after the lock is released, never during a mutation.
pub struct Ledger {
    inner: RwLock<LedgerInner>,
    registry: Arc<AssetRegistry>,
    hub: Arc<EventHub<LedgerEvent>>,
    tx_seq: Sequence,
}

impl Ledger {
    pub fn new(registry: Arc<AssetRegistry>, hub: Arc<EventHub<LedgerEvent>>) -> Self {
        Self {
            inner: RwLock::new(LedgerInner {
                accounts: FxHashMap::default(),
                log: Vec::new(),
                // Seeded once for the ledger's lifetime.
                rng: StdRng::from_entropy(),
                last_ts: DateTime::<Utc>::MIN_UTC,
            }),
            registry,
            hub,
            tx_seq: Sequence::new(0),
        }
    }

    // ------------------------------------------------------------------
    // Accounts
    // ------------------------------------------------------------------

    /// Create account `id` with a zero balance in every registered asset.
    ///
    /// Seeds one zero-amount mint transaction per asset so the account's
    /// history starts at its creation. Fails before any mutation if the
    /// id is negative or taken, or if no asset is registered yet.
    pub fn init_account(&self, id: AccountId) -> Result<(), LedgerError> {
        let assets = self.seed_assets()?;
        if id < 0 {
            return Err(LedgerError::InvalidAccount(id));
        }

        {
            let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
            if inner.accounts.contains_key(&id) {
                return Err(LedgerError::DuplicateAccount(id));
            }
            self.seed_locked(&mut inner, id, &assets);
        }

        tracing::info!(account = id, assets = assets.len(), "account initialized");
        for _ in &assets {
            self.hub.emit(&LedgerEvent::AccountChanged(id));
        }
        Ok(())
    }

    /// Draw a fresh unique id and initialize it, atomically.
    pub fn create_account(&self) -> Result<AccountId, LedgerError> {
        let assets = self.seed_assets()?;

        let id = {
            let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
            let id = Self::draw_unused_id(&mut inner);
            self.seed_locked(&mut inner, id, &assets);
            id
        };

        tracing::info!(account = id, assets = assets.len(), "account created");
        for _ in &assets {
            self.hub.emit(&LedgerEvent::AccountChanged(id));
        }
        Ok(id)
    }

    /// A non-negative 31-bit id not currently in use.
    ///
    /// Rejection-sampled from the ledger's process-lifetime RNG. The id
    /// is not reserved; use [`Ledger::create_account`] when the draw and
    /// the creation must be one step.
    pub fn get_unique_account_id(&self) -> AccountId {
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        Self::draw_unused_id(&mut inner)
    }

    fn draw_unused_id(inner: &mut LedgerInner) -> AccountId {
        loop {
            let id = inner.rng.gen_range(0..=i32::MAX) as AccountId;
            if !inner.accounts.contains_key(&id) {
                return id;
            }
        }
    }

    /// Registered asset ids, sorted for deterministic seeding order.
    fn seed_assets(&self) -> Result<Vec<AssetId>, LedgerError> {
        let mut assets = self.registry.asset_ids();
        if assets.is_empty() {
            return Err(LedgerError::NoAssetsRegistered);
        }
        assets.sort_unstable();
        Ok(assets)
    }

    fn seed_locked(&self, inner: &mut LedgerInner, id: AccountId, assets: &[AssetId]) {
        let mut balances = FxHashMap::default();
        for &asset in assets {
            balances.insert(asset, 0.0);
        }
        inner.accounts.insert(id, balances);
        for &asset in assets {
            let timestamp = inner.next_timestamp();
            let record = Transaction {
                id: self.tx_seq.next_id(),
                timestamp,
                to: id,
                from: MINT_ACCOUNT,
                asset,
                amount: 0.0,
            };
            inner.log.push(record);
        }
    }

    pub fn has_account(&self, id: AccountId) -> bool {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .accounts
            .contains_key(&id)
    }

    /// All account ids, sorted.
    pub fn account_ids(&self) -> Vec<AccountId> {
        let mut ids: Vec<AccountId> = self
            .inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .accounts
            .keys()
            .copied()
            .collect();
        ids.sort_unstable();
        ids
    }

    pub fn accounts_len(&self) -> usize {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .accounts
            .len()
    }

    // ------------------------------------------------------------------
    // Balances
    // ------------------------------------------------------------------

    /// Balance of `(account, asset)`. Lenient: a cell that was never
    /// written (unknown account included) reads as `0.0`.
    #[inline]
    pub fn balance(&self, account: AccountId, asset: AssetId) -> f64 {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .accounts
            .get(&account)
            .and_then(|b| b.get(&asset))
            .copied()
            .unwrap_or(0.0)
    }

    /// All balances of one account, sorted by asset id. `None` if the
    /// account does not exist.
    pub fn balances_of(&self, account: AccountId) -> Option<Vec<(AssetId, f64)>> {
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        let balances = inner.accounts.get(&account)?;
        let mut out: Vec<(AssetId, f64)> = balances.iter().map(|(&a, &b)| (a, b)).collect();
        out.sort_by_key(|&(a, _)| a);
        Some(out)
    }

    /// Sum of one asset across all accounts. Constant under transfers;
    /// only mints move it.
    pub fn asset_total(&self, asset: AssetId) -> f64 {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .accounts
            .values()
            .filter_map(|b| b.get(&asset))
            .sum()
    }

    // ------------------------------------------------------------------
    // Transfers
    // ------------------------------------------------------------------

    /// The atomic transfer primitive.
    ///
    /// Validation order: amount, destination exists, source exists
    /// (unless minting), not a self-transfer, source funds suffice. Any
    /// failure returns before the first mutation. On success the debit,
    /// credit, and log append commit under one exclusive acquisition.
    pub fn exec_transaction(
        &self,
        to: AccountId,
        from: AccountId,
        asset: AssetId,
        amount: f64,
    ) -> Result<TxId, LedgerError> {
        let ids = self.exec_batch(&[Transfer {
            to,
            from,
            asset,
            amount,
        }])?;
        Ok(ids[0])
    }

    /// Execute several transfers as one atomic unit: either every leg
    /// commits (one log record each) or none does.
    ///
    /// Legs validate in order against a scratch view that carries
    /// intra-batch debits and credits forward, so a batch cannot pass
    /// validation by spending the same balance twice.
    pub fn exec_batch(&self, transfers: &[Transfer]) -> Result<Vec<TxId>, LedgerError> {
        if transfers.is_empty() {
            return Ok(Vec::new());
        }
        for t in transfers {
            if !t.amount.is_finite() || t.amount < 0.0 {
                return Err(LedgerError::InvalidAmount(t.amount));
            }
        }

        let tx_ids = {
            let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);

            let mut scratch: FxHashMap<(AccountId, AssetId), f64> = FxHashMap::default();
            for t in transfers {
                if !inner.accounts.contains_key(&t.to) {
                    return Err(LedgerError::UnknownAccount(t.to));
                }
                let minting = t.from == MINT_ACCOUNT;
                if !minting && !inner.accounts.contains_key(&t.from) {
                    return Err(LedgerError::UnknownAccount(t.from));
                }
                if t.to == t.from {
                    return Err(LedgerError::SelfTransfer(t.to));
                }
                if !minting {
                    let key = (t.from, t.asset);
                    let balance = match scratch.get(&key) {
                        Some(&b) => b,
                        None => inner
                            .accounts
                            .get(&t.from)
                            .and_then(|b| b.get(&t.asset))
                            .copied()
                            .unwrap_or(0.0),
                    };
                    if balance - t.amount < 0.0 {
                        return Err(LedgerError::InsufficientFunds {
                            account: t.from,
                            asset: t.asset,
                            balance,
                            amount: t.amount,
                        });
                    }
                    scratch.insert(key, balance - t.amount);
                }
                let key = (t.to, t.asset);
                let balance = match scratch.get(&key) {
                    Some(&b) => b,
                    None => inner
                        .accounts
                        .get(&t.to)
                        .and_then(|b| b.get(&t.asset))
                        .copied()
                        .unwrap_or(0.0),
                };
                scratch.insert(key, balance + t.amount);
            }

            // Every leg validated; apply them all.
            let mut ids = Vec::with_capacity(transfers.len());
            for t in transfers {
                if t.from != MINT_ACCOUNT
                    && let Some(balances) = inner.accounts.get_mut(&t.from)
                {
                    *balances.entry(t.asset).or_insert(0.0) -= t.amount;
                }
                if let Some(balances) = inner.accounts.get_mut(&t.to) {
                    *balances.entry(t.asset).or_insert(0.0) += t.amount;
                }
                let timestamp = inner.next_timestamp();
                let id = self.tx_seq.next_id();
                inner.log.push(Transaction {
                    id,
                    timestamp,
                    to: t.to,
                    from: t.from,
                    asset: t.asset,
                    amount: t.amount,
                });
                ids.push(id);
            }
            ids
        };

        for (t, id) in transfers.iter().zip(&tx_ids) {
            tracing::debug!(
                tx = id,
                to = t.to,
                from = t.from,
                asset = t.asset,
                amount = t.amount,
                "transaction committed"
            );
        }
        for t in transfers {
            self.hub.emit(&LedgerEvent::AccountChanged(t.to));
            if t.from != MINT_ACCOUNT {
                self.hub.emit(&LedgerEvent::AccountChanged(t.from));
            }
        }
        Ok(tx_ids)
    }

    // ------------------------------------------------------------------
    // Log queries
    // ------------------------------------------------------------------

    /// Matching log records in log order. The time bounds are resolved by
    /// binary search; remaining fields filter within the bounded slice.
    pub fn get_transactions(&self, query: &TransactionQuery) -> Vec<Transaction> {
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        let log = &inner.log;

        let lo = match query.begin {
            Some(begin) => log.partition_point(|tx| tx.timestamp < begin),
            None => 0,
        };
        let hi = match query.end {
            Some(end) => log.partition_point(|tx| tx.timestamp < end),
            None => log.len(),
        };

        log[lo..hi]
            .iter()
            .filter(|tx| query.matches(tx))
            .cloned()
            .collect()
    }

    pub fn transactions_len(&self) -> usize {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .log
            .len()
    }
}

impl std::fmt::Debug for Ledger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Ledger")
            .field("accounts", &self.accounts_len())
            .field("transactions", &self.transactions_len())
            .finish()
    }
}

// ============================================================================
// Tests
// ============================================================================
