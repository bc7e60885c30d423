//! Pluggable feature modules
//!
//! A module bundles a feature behind load/unload hooks: it may seed
//! exchange state and register commands when loaded, and must take its
//! commands back out when unloaded. The host loads modules in order and
//! unloads them in reverse. A module whose `on_load` fails is not
//! retained, and the failure propagates to the caller.

use std::sync::{Mutex, PoisonError};

use crate::commands::{CommandRegistry, builtin_commands, resolve_asset};
use crate::config::ExchangeSeed;
use crate::exchange::Exchange;
use crate::varstore::keys;

pub trait Module: Send + Sync {
    fn name(&self) -> &'static str;

    fn on_load(&self, exchange: &Exchange, commands: &CommandRegistry) -> anyhow::Result<()>;

    fn on_unload(&self, exchange: &Exchange, commands: &CommandRegistry);
}

// ============================================================================
// Host
// ============================================================================

#[derive(Default)]
pub struct ModuleHost {
    modules: Mutex<Vec<Box<dyn Module>>>,
}

impl ModuleHost {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn load(
        &self,
        exchange: &Exchange,
        commands: &CommandRegistry,
        module: Box<dyn Module>,
    ) -> anyhow::Result<()> {
        module.on_load(exchange, commands)?;
        tracing::info!(module = module.name(), "module loaded");
        self.modules
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(module);
        Ok(())
    }

    pub fn loaded(&self) -> Vec<&'static str> {
        self.modules
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|m| m.name())
            .collect()
    }

    /// Unload everything, newest first.
    pub fn unload_all(&self, exchange: &Exchange, commands: &CommandRegistry) {
        let mut modules = self.modules.lock().unwrap_or_else(PoisonError::into_inner);
        while let Some(module) = modules.pop() {
            module.on_unload(exchange, commands);
            tracing::info!(module = module.name(), "module unloaded");
        }
    }
}

// ============================================================================
// Exchange module
// ============================================================================

/// The core module: installs the builtin command set and seeds assets,
/// variables, the fee account, and markets from configuration.
pub struct ExchangeModule {
    seed: ExchangeSeed,
}

impl ExchangeModule {
    pub fn new(seed: ExchangeSeed) -> Self {
        Self { seed }
    }

    fn apply_vars(&self, exchange: &Exchange) {
        let vars = exchange.vars();
        if let Some(epsilon) = self.seed.epsilon {
            vars.set(keys::EPSILON, epsilon.to_string());
        }
        if let Some(fee) = self.seed.ask_fee_pct {
            vars.set(keys::ASK_FEE_PCT, fee.to_string());
        }
        if let Some(fee) = self.seed.bid_fee_pct {
            vars.set(keys::BID_FEE_PCT, fee.to_string());
        }
        if let Some(account) = self.seed.fee_account {
            vars.set(keys::FEE_ACCOUNT, account.to_string());
        }
        // Free-form vars win over the named fields.
        let mut pairs: Vec<(&String, &String)> = self.seed.vars.iter().collect();
        pairs.sort();
        for (key, value) in pairs {
            vars.set(key, value);
        }
    }
}

impl Module for ExchangeModule {
    fn name(&self) -> &'static str {
        "exchange"
    }

    fn on_load(&self, exchange: &Exchange, commands: &CommandRegistry) -> anyhow::Result<()> {
        for (name, command) in builtin_commands() {
            commands.register(name, command);
        }

        for asset in &self.seed.assets {
            exchange.registry().register(&asset.name, asset.id)?;
        }

        self.apply_vars(exchange);

        if let Some(account) = self.seed.fee_account
            && !exchange.ledger().has_account(account)
        {
            exchange.ledger().init_account(account)?;
        }

        for market in &self.seed.markets {
            let order_asset = resolve_asset(exchange, &market.order_asset)?;
            let payment_asset = resolve_asset(exchange, &market.payment_asset)?;
            exchange.create_market(&market.name, order_asset, payment_asset)?;
        }

        Ok(())
    }

    fn on_unload(&self, _exchange: &Exchange, commands: &CommandRegistry) {
        for (name, _) in builtin_commands() {
            commands.unregister(name);
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AssetSeed, MarketSeed};
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};

    struct Probe {
        name: &'static str,
        trace: Arc<Mutex<Vec<String>>>,
        fail_load: bool,
        loaded: Arc<AtomicBool>,
    }

    impl Module for Probe {
        fn name(&self) -> &'static str {
            self.name
        }

        fn on_load(&self, _ex: &Exchange, _cmds: &CommandRegistry) -> anyhow::Result<()> {
            if self.fail_load {
                anyhow::bail!("{} refused to load", self.name);
            }
            self.loaded.store(true, Ordering::SeqCst);
            self.trace.lock().unwrap().push(format!("+{}", self.name));
            Ok(())
        }

        fn on_unload(&self, _ex: &Exchange, _cmds: &CommandRegistry) {
            self.loaded.store(false, Ordering::SeqCst);
            self.trace.lock().unwrap().push(format!("-{}", self.name));
        }
    }

    fn probe(
        name: &'static str,
        trace: &Arc<Mutex<Vec<String>>>,
        fail_load: bool,
    ) -> (Box<Probe>, Arc<AtomicBool>) {
        let loaded = Arc::new(AtomicBool::new(false));
        (
            Box::new(Probe {
                name,
                trace: Arc::clone(trace),
                fail_load,
                loaded: Arc::clone(&loaded),
            }),
            loaded,
        )
    }

    #[test]
    fn test_load_unload_order() {
        let ex = Exchange::new();
        let cmds = CommandRegistry::new();
        let host = ModuleHost::new();
        let trace = Arc::new(Mutex::new(Vec::new()));

        let (first, _) = probe("first", &trace, false);
        let (second, _) = probe("second", &trace, false);
        host.load(&ex, &cmds, first).unwrap();
        host.load(&ex, &cmds, second).unwrap();
        assert_eq!(host.loaded(), vec!["first", "second"]);

        host.unload_all(&ex, &cmds);
        assert!(host.loaded().is_empty());
        assert_eq!(
            *trace.lock().unwrap(),
            vec!["+first", "+second", "-second", "-first"]
        );
    }

    #[test]
    fn test_failed_load_not_retained() {
        let ex = Exchange::new();
        let cmds = CommandRegistry::new();
        let host = ModuleHost::new();
        let trace = Arc::new(Mutex::new(Vec::new()));

        let (bad, loaded) = probe("bad", &trace, true);
        assert!(host.load(&ex, &cmds, bad).is_err());
        assert!(host.loaded().is_empty());
        assert!(!loaded.load(Ordering::SeqCst));
    }

    fn full_seed() -> ExchangeSeed {
        ExchangeSeed {
            epsilon: Some(0.01),
            ask_fee_pct: Some(0.002),
            bid_fee_pct: Some(0.001),
            fee_account: Some(99),
            assets: vec![
                AssetSeed {
                    name: "XBT".to_string(),
                    id: 0,
                },
                AssetSeed {
                    name: "USD".to_string(),
                    id: 1,
                },
            ],
            markets: vec![MarketSeed {
                name: "XBT/USD".to_string(),
                order_asset: "XBT".to_string(),
                payment_asset: "USD".to_string(),
            }],
            vars: [("greeting".to_string(), "hello".to_string())]
                .into_iter()
                .collect(),
        }
    }

    #[test]
    fn test_exchange_module_seeds_state() {
        let ex = Exchange::new();
        let cmds = CommandRegistry::new();
        let host = ModuleHost::new();
        host.load(&ex, &cmds, Box::new(ExchangeModule::new(full_seed())))
            .unwrap();

        assert_eq!(ex.registry().id_of("XBT"), Some(0));
        assert!(ex.ledger().has_account(99));

        let market = ex.market("XBT/USD").unwrap();
        assert_eq!(market.fees(), (0.002, 0.001));
        assert_eq!(market.fee_account(), 99);

        assert_eq!(ex.vars().get(keys::EPSILON).as_deref(), Some("0.01"));
        assert_eq!(ex.vars().get("greeting").as_deref(), Some("hello"));

        // Commands are live.
        assert_eq!(cmds.dispatch(&ex, "asset.id USD").unwrap(), "1");
    }

    #[test]
    fn test_exchange_module_unload_removes_commands() {
        let ex = Exchange::new();
        let cmds = CommandRegistry::new();
        let host = ModuleHost::new();
        host.load(
            &ex,
            &cmds,
            Box::new(ExchangeModule::new(ExchangeSeed::default())),
        )
        .unwrap();
        assert!(!cmds.is_empty());

        host.unload_all(&ex, &cmds);
        assert!(cmds.is_empty());
        assert_eq!(
            cmds.dispatch(&ex, "help").unwrap_err().code(),
            "UNKNOWN_COMMAND"
        );
    }

    #[test]
    fn test_exchange_module_rejects_unknown_market_asset() {
        let ex = Exchange::new();
        let cmds = CommandRegistry::new();
        let host = ModuleHost::new();
        let seed = ExchangeSeed {
            markets: vec![MarketSeed {
                name: "XBT/USD".to_string(),
                order_asset: "XBT".to_string(),
                payment_asset: "USD".to_string(),
            }],
            ..ExchangeSeed::default()
        };
        let err = host
            .load(&ex, &cmds, Box::new(ExchangeModule::new(seed)))
            .unwrap_err();
        assert!(err.to_string().contains("XBT"), "got: {err}");
    }
}
