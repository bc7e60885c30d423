//! Text command surface
//!
//! Commands are whitespace-tokenized lines, `<group>.<verb> args...`.
//! The registry maps names to handlers; modules install and remove
//! entries at load and unload. Handlers return the reply text, or an
//! [`ExchangeError`] whose display text becomes the reply.
//!
//! Structured replies (lists, order info, book depth) are JSON, one
//! document per reply. Scalar replies are plain text.

use std::collections::BTreeMap;
use std::str::FromStr;
use std::sync::{PoisonError, RwLock};

use chrono::{DateTime, Utc};
use serde_json::json;

use crate::asset_registry::RegistryError;
use crate::core_types::{AccountId, AssetId, NO_ASSET, NO_ASSET_NAME, OrderId};
use crate::error::ExchangeError;
use crate::exchange::Exchange;
use crate::ledger::TransactionQuery;
use crate::order::Side;

pub type CommandFn = fn(&Exchange, &CommandRegistry, &[&str]) -> Result<String, ExchangeError>;

#[derive(Clone, Copy)]
pub struct Command {
    pub usage: &'static str,
    pub about: &'static str,
    pub run: CommandFn,
}

// ============================================================================
// Registry
// ============================================================================

#[derive(Default)]
pub struct CommandRegistry {
    commands: RwLock<BTreeMap<&'static str, Command>>,
}

impl CommandRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, name: &'static str, command: Command) {
        let mut commands = self
            .commands
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        if commands.insert(name, command).is_some() {
            tracing::debug!(command = name, "command replaced");
        }
    }

    pub fn unregister(&self, name: &str) {
        self.commands
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(name);
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.commands
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .copied()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.commands
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Run one command line. Blank lines reply with an empty string.
    pub fn dispatch(&self, exchange: &Exchange, line: &str) -> Result<String, ExchangeError> {
        let argv: Vec<&str> = line.split_whitespace().collect();
        let Some((&name, args)) = argv.split_first() else {
            return Ok(String::new());
        };
        // Copy the entry out so handlers can re-enter the registry.
        let command = self
            .commands
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .copied()
            .ok_or_else(|| ExchangeError::UnknownCommand(name.to_string()))?;
        (command.run)(exchange, self, args)
    }

    fn render_help(&self) -> String {
        let commands = self
            .commands
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        let mut out = String::new();
        for command in commands.values() {
            out.push_str(&format!("{:<44} {}\n", command.usage, command.about));
        }
        out.pop();
        out
    }
}

// ============================================================================
// Builtin table
// ============================================================================

macro_rules! command {
    ($usage:expr, $about:expr, $run:expr) => {
        Command {
            usage: $usage,
            about: $about,
            run: $run,
        }
    };
}

/// The builtin command set, installed by the exchange module.
pub fn builtin_commands() -> Vec<(&'static str, Command)> {
    vec![
        (
            "asset.register",
            command!("asset.register <name> <id>", "register an asset", cmd_asset_register),
        ),
        (
            "asset.remove",
            command!("asset.remove <name|id>", "remove an asset binding", cmd_asset_remove),
        ),
        (
            "asset.id",
            command!("asset.id <name>", "look up an asset id", cmd_asset_id),
        ),
        (
            "asset.name",
            command!("asset.name <id>", "look up an asset name", cmd_asset_name),
        ),
        (
            "asset.list",
            command!("asset.list", "list registered assets", cmd_asset_list),
        ),
        (
            "account.create",
            command!("account.create", "create an account with a fresh id", cmd_account_create),
        ),
        (
            "account.init",
            command!("account.init <id>", "create an account with a chosen id", cmd_account_init),
        ),
        (
            "account.balance",
            command!(
                "account.balance <account> <asset>",
                "balance of one asset",
                cmd_account_balance
            ),
        ),
        (
            "account.list",
            command!("account.list", "list account ids", cmd_account_list),
        ),
        (
            "ledger.transfer",
            command!(
                "ledger.transfer <to> <from> <asset> <amount>",
                "move funds (from -1 mints)",
                cmd_ledger_transfer
            ),
        ),
        (
            "ledger.history",
            command!(
                "ledger.history [to=N] [from=N] [asset=A] [begin=T] [end=T] [min=X] [max=X]",
                "filtered transaction log",
                cmd_ledger_history
            ),
        ),
        (
            "market.create",
            command!(
                "market.create <name> <order-asset> <payment-asset>",
                "open a market",
                cmd_market_create
            ),
        ),
        (
            "market.list",
            command!("market.list", "list markets", cmd_market_list),
        ),
        (
            "order.add",
            command!(
                "order.add <market> <ask|bid> <account> <volume> <cost>",
                "place a limit order",
                cmd_order_add
            ),
        ),
        (
            "order.cancel",
            command!("order.cancel <market> <id>", "close an order", cmd_order_cancel),
        ),
        (
            "order.remove",
            command!("order.remove <market> <id>", "retire an order to history", cmd_order_remove),
        ),
        (
            "order.info",
            command!("order.info <market> <id>", "inspect an order", cmd_order_info),
        ),
        (
            "book.show",
            command!("book.show <market>", "aggregated depth per price", cmd_book_show),
        ),
        (
            "var.set",
            command!("var.set <key> <value>", "set an exchange variable", cmd_var_set),
        ),
        (
            "var.get",
            command!("var.get <key>", "read an exchange variable", cmd_var_get),
        ),
        (
            "var.list",
            command!("var.list", "list exchange variables", cmd_var_list),
        ),
        ("help", command!("help", "this listing", cmd_help)),
    ]
}

// ============================================================================
// Argument helpers
// ============================================================================

fn take<'a>(args: &[&'a str], idx: usize, usage: &str) -> Result<&'a str, ExchangeError> {
    args.get(idx)
        .copied()
        .ok_or_else(|| ExchangeError::BadArgs(format!("usage: {usage}")))
}

fn parse<T: FromStr>(token: &str, what: &str) -> Result<T, ExchangeError> {
    token
        .parse()
        .map_err(|_| ExchangeError::BadArgs(format!("cannot parse '{token}' as {what}")))
}

/// Asset tokens resolve by name first, then by numeric id.
pub(crate) fn resolve_asset(exchange: &Exchange, token: &str) -> Result<AssetId, ExchangeError> {
    if let Some(id) = exchange.registry().id_of(token) {
        return Ok(id);
    }
    if let Ok(id) = token.parse::<AssetId>()
        && exchange.registry().contains_id(id)
    {
        return Ok(id);
    }
    Err(RegistryError::UnknownAsset(token.to_string()).into())
}

fn parse_time(token: &str) -> Result<DateTime<Utc>, ExchangeError> {
    DateTime::parse_from_rfc3339(token)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|_| ExchangeError::BadArgs(format!("cannot parse '{token}' as rfc3339 time")))
}

fn to_json<T: serde::Serialize>(value: &T) -> String {
    serde_json::to_string(value).unwrap_or_default()
}

// ============================================================================
// Handlers
// ============================================================================

fn cmd_asset_register(
    ex: &Exchange,
    _cmds: &CommandRegistry,
    args: &[&str],
) -> Result<String, ExchangeError> {
    let usage = "asset.register <name> <id>";
    let name = take(args, 0, usage)?;
    let id: AssetId = parse(take(args, 1, usage)?, "asset id")?;
    ex.registry().register(name, id)?;
    Ok(format!("asset '{name}' registered as {id}"))
}

fn cmd_asset_remove(
    ex: &Exchange,
    _cmds: &CommandRegistry,
    args: &[&str],
) -> Result<String, ExchangeError> {
    let token = take(args, 0, "asset.remove <name|id>")?;
    let name = if ex.registry().contains_name(token) {
        token.to_string()
    } else if let Ok(id) = token.parse::<AssetId>()
        && let Some(by_id) = ex.registry().name_of(id)
    {
        by_id
    } else {
        token.to_string()
    };
    ex.registry().remove(&name)?;
    Ok(format!("asset '{name}' removed"))
}

fn cmd_asset_id(
    ex: &Exchange,
    _cmds: &CommandRegistry,
    args: &[&str],
) -> Result<String, ExchangeError> {
    let name = take(args, 0, "asset.id <name>")?;
    // Misses render as the no-asset sentinel rather than an error.
    let id = ex.registry().id_of(name).unwrap_or(NO_ASSET);
    Ok(id.to_string())
}

fn cmd_asset_name(
    ex: &Exchange,
    _cmds: &CommandRegistry,
    args: &[&str],
) -> Result<String, ExchangeError> {
    let token = take(args, 0, "asset.name <id>")?;
    let id: AssetId = parse(token, "asset id")?;
    Ok(ex
        .registry()
        .name_of(id)
        .unwrap_or_else(|| NO_ASSET_NAME.to_string()))
}

fn cmd_asset_list(
    ex: &Exchange,
    _cmds: &CommandRegistry,
    _args: &[&str],
) -> Result<String, ExchangeError> {
    Ok(to_json(&ex.registry().assets()))
}

fn cmd_account_create(
    ex: &Exchange,
    _cmds: &CommandRegistry,
    _args: &[&str],
) -> Result<String, ExchangeError> {
    let id = ex.ledger().create_account()?;
    Ok(format!("account {id} created"))
}

fn cmd_account_init(
    ex: &Exchange,
    _cmds: &CommandRegistry,
    args: &[&str],
) -> Result<String, ExchangeError> {
    let id: AccountId = parse(take(args, 0, "account.init <id>")?, "account id")?;
    ex.ledger().init_account(id)?;
    Ok(format!("account {id} initialized"))
}

fn cmd_account_balance(
    ex: &Exchange,
    _cmds: &CommandRegistry,
    args: &[&str],
) -> Result<String, ExchangeError> {
    let usage = "account.balance <account> <asset>";
    let account: AccountId = parse(take(args, 0, usage)?, "account id")?;
    let asset = resolve_asset(ex, take(args, 1, usage)?)?;
    Ok(ex.ledger().balance(account, asset).to_string())
}

fn cmd_account_list(
    ex: &Exchange,
    _cmds: &CommandRegistry,
    _args: &[&str],
) -> Result<String, ExchangeError> {
    Ok(to_json(&ex.ledger().account_ids()))
}

fn cmd_ledger_transfer(
    ex: &Exchange,
    _cmds: &CommandRegistry,
    args: &[&str],
) -> Result<String, ExchangeError> {
    let usage = "ledger.transfer <to> <from> <asset> <amount>";
    let to: AccountId = parse(take(args, 0, usage)?, "account id")?;
    let from: AccountId = parse(take(args, 1, usage)?, "account id")?;
    let asset = resolve_asset(ex, take(args, 2, usage)?)?;
    let amount: f64 = parse(take(args, 3, usage)?, "amount")?;
    let tx = ex.ledger().exec_transaction(to, from, asset, amount)?;
    Ok(format!("transaction {tx} executed"))
}

fn cmd_ledger_history(
    ex: &Exchange,
    _cmds: &CommandRegistry,
    args: &[&str],
) -> Result<String, ExchangeError> {
    let mut query = TransactionQuery::default();
    for arg in args {
        let Some((key, value)) = arg.split_once('=') else {
            return Err(ExchangeError::BadArgs(format!(
                "expected key=value filter, got '{arg}'"
            )));
        };
        match key {
            "to" => query.to = Some(parse(value, "account id")?),
            "from" => query.from = Some(parse(value, "account id")?),
            "asset" => query.asset = Some(resolve_asset(ex, value)?),
            "begin" => query.begin = Some(parse_time(value)?),
            "end" => query.end = Some(parse_time(value)?),
            "min" => query.min_amount = Some(parse(value, "amount")?),
            "max" => query.max_amount = Some(parse(value, "amount")?),
            _ => {
                return Err(ExchangeError::BadArgs(format!(
                    "unknown history filter '{key}'"
                )));
            }
        }
    }
    Ok(to_json(&ex.ledger().get_transactions(&query)))
}

fn cmd_market_create(
    ex: &Exchange,
    _cmds: &CommandRegistry,
    args: &[&str],
) -> Result<String, ExchangeError> {
    let usage = "market.create <name> <order-asset> <payment-asset>";
    let name = take(args, 0, usage)?;
    let order_asset = resolve_asset(ex, take(args, 1, usage)?)?;
    let payment_asset = resolve_asset(ex, take(args, 2, usage)?)?;
    ex.create_market(name, order_asset, payment_asset)?;
    Ok(format!("market '{name}' created"))
}

fn cmd_market_list(
    ex: &Exchange,
    _cmds: &CommandRegistry,
    _args: &[&str],
) -> Result<String, ExchangeError> {
    let list: Vec<serde_json::Value> = ex
        .markets()
        .iter()
        .map(|m| json!({ "name": m.name(), "params": m.params() }))
        .collect();
    Ok(to_json(&list))
}

fn cmd_order_add(
    ex: &Exchange,
    _cmds: &CommandRegistry,
    args: &[&str],
) -> Result<String, ExchangeError> {
    let usage = "order.add <market> <ask|bid> <account> <volume> <cost>";
    let market = ex.market(take(args, 0, usage)?)?;
    let side_token = take(args, 1, usage)?;
    let side = Side::parse(side_token)
        .ok_or_else(|| crate::market::MarketError::InvalidOrderType(side_token.to_string()))?;
    let account: AccountId = parse(take(args, 2, usage)?, "account id")?;
    let volume: f64 = parse(take(args, 3, usage)?, "volume")?;
    let cost: f64 = parse(take(args, 4, usage)?, "cost")?;
    let id = market.add_order(side, account, volume, cost)?;
    Ok(format!("order {id} placed"))
}

fn cmd_order_cancel(
    ex: &Exchange,
    _cmds: &CommandRegistry,
    args: &[&str],
) -> Result<String, ExchangeError> {
    let usage = "order.cancel <market> <id>";
    let market = ex.market(take(args, 0, usage)?)?;
    let id: OrderId = parse(take(args, 1, usage)?, "order id")?;
    market.cancel_order(id)?;
    Ok(format!("order {id} cancelled"))
}

fn cmd_order_remove(
    ex: &Exchange,
    _cmds: &CommandRegistry,
    args: &[&str],
) -> Result<String, ExchangeError> {
    let usage = "order.remove <market> <id>";
    let market = ex.market(take(args, 0, usage)?)?;
    let id: OrderId = parse(take(args, 1, usage)?, "order id")?;
    market.remove_order(id)?;
    Ok(format!("order {id} removed"))
}

fn cmd_order_info(
    ex: &Exchange,
    _cmds: &CommandRegistry,
    args: &[&str],
) -> Result<String, ExchangeError> {
    let usage = "order.info <market> <id>";
    let market = ex.market(take(args, 0, usage)?)?;
    let id: OrderId = parse(take(args, 1, usage)?, "order id")?;
    Ok(to_json(&market.get_order(id)?))
}

fn cmd_book_show(
    ex: &Exchange,
    _cmds: &CommandRegistry,
    args: &[&str],
) -> Result<String, ExchangeError> {
    let market = ex.market(take(args, 0, "book.show <market>")?)?;
    Ok(to_json(&market.depth()))
}

fn cmd_var_set(
    ex: &Exchange,
    _cmds: &CommandRegistry,
    args: &[&str],
) -> Result<String, ExchangeError> {
    let usage = "var.set <key> <value>";
    let key = take(args, 0, usage)?;
    if args.len() < 2 {
        return Err(ExchangeError::BadArgs(format!("usage: {usage}")));
    }
    let value = args[1..].join(" ");
    ex.vars().set(key, &value);
    Ok(format!("{key} = {value}"))
}

fn cmd_var_get(
    ex: &Exchange,
    _cmds: &CommandRegistry,
    args: &[&str],
) -> Result<String, ExchangeError> {
    let key = take(args, 0, "var.get <key>")?;
    ex.vars()
        .get(key)
        .ok_or_else(|| ExchangeError::UnknownVar(key.to_string()))
}

fn cmd_var_list(
    ex: &Exchange,
    _cmds: &CommandRegistry,
    _args: &[&str],
) -> Result<String, ExchangeError> {
    let lines: Vec<String> = ex
        .vars()
        .snapshot()
        .iter()
        .map(|(k, v)| format!("{k} = {v}"))
        .collect();
    Ok(lines.join("\n"))
}

fn cmd_help(
    _ex: &Exchange,
    cmds: &CommandRegistry,
    _args: &[&str],
) -> Result<String, ExchangeError> {
    Ok(cmds.render_help())
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn rig() -> (Exchange, CommandRegistry) {
        let ex = Exchange::new();
        let cmds = CommandRegistry::new();
        for (name, command) in builtin_commands() {
            cmds.register(name, command);
        }
        (ex, cmds)
    }

    fn run(ex: &Exchange, cmds: &CommandRegistry, line: &str) -> String {
        cmds.dispatch(ex, line)
            .unwrap_or_else(|e| panic!("command '{line}' failed: {e}"))
    }

    #[test]
    fn test_full_session() {
        let (ex, cmds) = rig();

        run(&ex, &cmds, "asset.register XBT 0");
        run(&ex, &cmds, "asset.register USD 1");
        run(&ex, &cmds, "account.init 1");
        run(&ex, &cmds, "account.init 2");
        run(&ex, &cmds, "account.init 9");
        run(&ex, &cmds, "var.set exchange.ask_fee_pct 0.1");
        run(&ex, &cmds, "var.set exchange.bid_fee_pct 0.1");
        run(&ex, &cmds, "var.set exchange.fee_account 9");
        run(&ex, &cmds, "ledger.transfer 1 -1 XBT 10");
        run(&ex, &cmds, "ledger.transfer 2 -1 USD 1000");
        run(&ex, &cmds, "market.create XBT/USD XBT USD");
        run(&ex, &cmds, "order.add XBT/USD ask 1 10 1000");
        run(&ex, &cmds, "order.add XBT/USD bid 2 10 1000");

        assert_eq!(run(&ex, &cmds, "account.balance 1 USD"), "900");
        assert_eq!(run(&ex, &cmds, "account.balance 1 XBT"), "0");
        assert_eq!(run(&ex, &cmds, "account.balance 2 XBT"), "9");
        assert_eq!(run(&ex, &cmds, "account.balance 2 USD"), "0");
        assert_eq!(run(&ex, &cmds, "account.balance 9 USD"), "100");
        assert_eq!(run(&ex, &cmds, "account.balance 9 XBT"), "1");
    }

    #[test]
    fn test_asset_lookup_both_directions() {
        let (ex, cmds) = rig();
        run(&ex, &cmds, "asset.register XBT 0");

        assert_eq!(run(&ex, &cmds, "asset.id XBT"), "0");
        assert_eq!(run(&ex, &cmds, "asset.name 0"), "XBT");
        // Lookup misses answer with the sentinels, not an error.
        assert_eq!(run(&ex, &cmds, "asset.id DOGE"), "-1");
        assert_eq!(run(&ex, &cmds, "asset.name 7"), "null");
        let listing = run(&ex, &cmds, "asset.list");
        assert!(listing.contains("\"name\":\"XBT\""), "got: {listing}");
    }

    #[test]
    fn test_asset_remove_by_name_or_id() {
        let (ex, cmds) = rig();
        run(&ex, &cmds, "asset.register XBT 0");
        run(&ex, &cmds, "asset.register USD 1");

        assert_eq!(run(&ex, &cmds, "asset.remove 0"), "asset 'XBT' removed");
        assert!(!ex.registry().contains_id(0));
        assert_eq!(run(&ex, &cmds, "asset.remove USD"), "asset 'USD' removed");
        assert_eq!(
            cmds.dispatch(&ex, "asset.remove USD").unwrap_err().code(),
            "UNKNOWN_ASSET"
        );
    }

    #[test]
    fn test_balance_accepts_asset_by_id() {
        let (ex, cmds) = rig();
        run(&ex, &cmds, "asset.register XBT 0");
        run(&ex, &cmds, "account.init 1");
        run(&ex, &cmds, "ledger.transfer 1 -1 0 2.5");
        assert_eq!(run(&ex, &cmds, "account.balance 1 0"), "2.5");
    }

    #[test]
    fn test_dispatch_errors() {
        let (ex, cmds) = rig();
        assert_eq!(
            cmds.dispatch(&ex, "bogus.command").unwrap_err().code(),
            "UNKNOWN_COMMAND"
        );
        assert_eq!(
            cmds.dispatch(&ex, "asset.register").unwrap_err().code(),
            "BAD_ARGS"
        );
        assert_eq!(
            cmds.dispatch(&ex, "asset.register XBT abc")
                .unwrap_err()
                .code(),
            "BAD_ARGS"
        );
        assert_eq!(cmds.dispatch(&ex, "   ").unwrap(), "");
    }

    #[test]
    fn test_order_side_must_parse() {
        let (ex, cmds) = rig();
        run(&ex, &cmds, "asset.register XBT 0");
        run(&ex, &cmds, "asset.register USD 1");
        run(&ex, &cmds, "market.create XBT/USD 0 1");
        let err = cmds
            .dispatch(&ex, "order.add XBT/USD sideways 1 1 1")
            .unwrap_err();
        assert_eq!(err.code(), "INVALID_ORDER_TYPE");
    }

    #[test]
    fn test_order_info_and_book_show() {
        let (ex, cmds) = rig();
        run(&ex, &cmds, "asset.register XBT 0");
        run(&ex, &cmds, "asset.register USD 1");
        run(&ex, &cmds, "account.init 1");
        run(&ex, &cmds, "ledger.transfer 1 -1 XBT 50");
        run(&ex, &cmds, "market.create XBT/USD XBT USD");
        run(&ex, &cmds, "order.add XBT/USD ask 1 5 500");

        let info = run(&ex, &cmds, "order.info XBT/USD 1");
        assert!(info.contains("\"id\":1"), "got: {info}");
        assert!(info.contains("\"side\":\"ask\""), "got: {info}");

        let book = run(&ex, &cmds, "book.show XBT/USD");
        assert!(book.contains("[[100.0,5.0]]"), "got: {book}");

        assert_eq!(
            cmds.dispatch(&ex, "order.info XBT/USD 404")
                .unwrap_err()
                .code(),
            "UNKNOWN_ORDER"
        );
    }

    #[test]
    fn test_ledger_history_filters() {
        let (ex, cmds) = rig();
        run(&ex, &cmds, "asset.register XBT 0");
        run(&ex, &cmds, "account.init 1");
        run(&ex, &cmds, "account.init 2");
        run(&ex, &cmds, "ledger.transfer 1 -1 XBT 10");
        run(&ex, &cmds, "ledger.transfer 2 1 XBT 4");

        let all = run(&ex, &cmds, "ledger.history");
        // Two seeds plus two transfers.
        assert_eq!(all.matches("\"id\":").count(), 4);

        let to_two = run(&ex, &cmds, "ledger.history to=2 min=1");
        assert_eq!(to_two.matches("\"id\":").count(), 1);
        assert!(to_two.contains("\"amount\":4.0"), "got: {to_two}");

        assert_eq!(
            cmds.dispatch(&ex, "ledger.history sort=asc")
                .unwrap_err()
                .code(),
            "BAD_ARGS"
        );
    }

    #[test]
    fn test_var_commands() {
        let (ex, cmds) = rig();
        run(&ex, &cmds, "var.set exchange.epsilon 0.01");
        assert_eq!(run(&ex, &cmds, "var.get exchange.epsilon"), "0.01");
        assert_eq!(
            cmds.dispatch(&ex, "var.get missing").unwrap_err().code(),
            "UNKNOWN_VAR"
        );
        let listing = run(&ex, &cmds, "var.list");
        assert_eq!(listing, "exchange.epsilon = 0.01");
    }

    #[test]
    fn test_help_lists_every_command() {
        let (ex, cmds) = rig();
        let help = run(&ex, &cmds, "help");
        for (name, _) in builtin_commands() {
            assert!(help.contains(name), "help is missing {name}");
        }
    }
}
