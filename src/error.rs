//! Top-level error type for the command surface.

use thiserror::Error;

use crate::asset_registry::RegistryError;
use crate::ledger::LedgerError;
use crate::market::MarketError;

/// Anything a command dispatch can fail with. Component errors pass
/// through unchanged; the extra variants cover the dispatch layer
/// itself.
#[derive(Debug, Error)]
pub enum ExchangeError {
    #[error("unknown command '{0}'")]
    UnknownCommand(String),

    #[error("{0}")]
    BadArgs(String),

    #[error("unknown market '{0}'")]
    UnknownMarket(String),

    #[error("market '{0}' already exists")]
    DuplicateMarket(String),

    #[error("unknown variable '{0}'")]
    UnknownVar(String),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Ledger(#[from] LedgerError),

    #[error(transparent)]
    Market(#[from] MarketError),
}

impl ExchangeError {
    /// Stable machine-checkable error code.
    pub fn code(&self) -> &'static str {
        match self {
            ExchangeError::UnknownCommand(_) => "UNKNOWN_COMMAND",
            ExchangeError::BadArgs(_) => "BAD_ARGS",
            ExchangeError::UnknownMarket(_) => "UNKNOWN_MARKET",
            ExchangeError::DuplicateMarket(_) => "DUPLICATE_MARKET",
            ExchangeError::UnknownVar(_) => "UNKNOWN_VAR",
            ExchangeError::Registry(e) => e.code(),
            ExchangeError::Ledger(e) => e.code(),
            ExchangeError::Market(e) => e.code(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes_pass_through_components() {
        let err = ExchangeError::from(LedgerError::SelfTransfer(7));
        assert_eq!(err.code(), "SELF_TRANSFER");

        let err = ExchangeError::from(MarketError::UnknownOrder(3));
        assert_eq!(err.code(), "UNKNOWN_ORDER");

        assert_eq!(
            ExchangeError::UnknownCommand("nope".into()).code(),
            "UNKNOWN_COMMAND"
        );
    }

    #[test]
    fn test_display_is_component_message() {
        let err = ExchangeError::from(MarketError::UnknownOrder(3));
        assert_eq!(err.to_string(), "unknown order 3");
    }
}
