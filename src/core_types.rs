//! Core types used throughout the exchange
//!
//! Fundamental type aliases and sentinel values shared by all modules.
//! Aliases carry semantic meaning and keep the door open for future
//! type evolution.

use std::sync::atomic::{AtomicU64, Ordering};

/// Asset ID - unique identifier for a registered asset.
///
/// # Constraints:
/// - **Signed**: id `-1` is the reserved "no asset" sentinel
/// - **Immutable**: once registered, an asset keeps its id until removed
pub type AssetId = i32;

/// Account ID - unique identifier for a ledger account.
///
/// # Constraints:
/// - **Signed**: id `-1` is the reserved mint sentinel
/// - Real accounts are non-negative 31-bit values
pub type AccountId = i64;

/// Order ID - monotonic, unique across all markets in the process
pub type OrderId = u64;

/// Transaction ID - monotonic, unique within the ledger
pub type TxId = u64;

/// Reserved asset id meaning "no asset" (also the query wildcard).
pub const NO_ASSET: AssetId = -1;

/// Display name of the [`NO_ASSET`] sentinel. The empty string is
/// equally reserved.
pub const NO_ASSET_NAME: &str = "null";

/// Reserved account id used as the source of minting transfers.
pub const MINT_ACCOUNT: AccountId = -1;

/// Monotonic id source backing order and transaction ids.
///
/// Plain `fetch_add` with relaxed ordering: callers only need uniqueness
/// and monotonicity per sequence, not cross-thread happens-before.
#[derive(Debug)]
pub struct Sequence {
    next: AtomicU64,
}

impl Sequence {
    pub const fn new(start: u64) -> Self {
        Self {
            next: AtomicU64::new(start),
        }
    }

    #[inline]
    pub fn next_id(&self) -> u64 {
        self.next.fetch_add(1, Ordering::Relaxed)
    }
}

impl Default for Sequence {
    fn default() -> Self {
        Self::new(0)
    }
}

// ============================================================================
// Tests
// ============================================================================
