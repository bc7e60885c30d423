//! Bourse - an in-process exchange
//!
//! Entry point wiring:
//!
//! ```text
//! ┌──────────┐    ┌──────────┐    ┌──────────┐    ┌──────────┐
//! │  Config  │───▶│ Modules  │───▶│ Commands │───▶│  Output  │
//! │  (YAML)  │    │  (seed)  │    │ (dispatch)│   │ (stdout) │
//! └──────────┘    └──────────┘    └──────────┘    └──────────┘
//! ```
//!
//! The exchange module seeds assets, markets, and variables from the
//! config, then every line from the prompt or script runs through the
//! command registry.

use std::fs;
use std::io::{BufRead, Write};

use bourse::commands::CommandRegistry;
use bourse::config::AppConfig;
use bourse::exchange::Exchange;
use bourse::logging::init_logging;
use bourse::module::{ExchangeModule, ModuleHost};

// ============================================================
// ARGUMENTS
// ============================================================

fn get_env() -> String {
    let args: Vec<String> = std::env::args().collect();
    for i in 0..args.len() {
        if (args[i] == "--env" || args[i] == "-e") && i + 1 < args.len() {
            return args[i + 1].clone();
        }
    }
    "dev".to_string()
}

fn get_script() -> Option<String> {
    let args: Vec<String> = std::env::args().collect();
    for i in 0..args.len() {
        if args[i] == "--script" && i + 1 < args.len() {
            return Some(args[i + 1].clone());
        }
    }
    None
}

// ============================================================
// COMMAND LOOPS
// ============================================================

/// Run one line, printing the reply or the error. Returns false on
/// error so script mode can stop early.
fn exec_line(exchange: &Exchange, commands: &CommandRegistry, line: &str) -> bool {
    match commands.dispatch(exchange, line) {
        Ok(reply) => {
            if !reply.is_empty() {
                println!("{}", reply);
            }
            true
        }
        Err(err) => {
            println!("error[{}]: {}", err.code(), err);
            false
        }
    }
}

fn run_script(exchange: &Exchange, commands: &CommandRegistry, path: &str) -> bool {
    let content = match fs::read_to_string(path) {
        Ok(content) => content,
        Err(err) => {
            eprintln!("cannot read script {}: {}", path, err);
            return false;
        }
    };
    for (lineno, line) in content.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if !exec_line(exchange, commands, line) {
            eprintln!("script {} failed at line {}", path, lineno + 1);
            return false;
        }
    }
    true
}

fn run_repl(exchange: &Exchange, commands: &CommandRegistry) -> bool {
    let stdin = std::io::stdin();
    let mut stdout = std::io::stdout();
    loop {
        print!("> ");
        let _ = stdout.flush();
        let mut line = String::new();
        match stdin.lock().read_line(&mut line) {
            Ok(0) | Err(_) => break, // EOF
            Ok(_) => {}
        }
        let line = line.trim();
        if line == "quit" || line == "exit" {
            break;
        }
        exec_line(exchange, commands, line);
    }
    true
}

// ============================================================
// MAIN
// ============================================================

fn main() {
    let env = get_env();
    let config = AppConfig::load_or_default(&env);
    let log_guard = init_logging(&config);

    println!(
        "=== bourse {} ({}) - env: {} ===",
        env!("CARGO_PKG_VERSION"),
        env!("GIT_HASH"),
        env
    );
    tracing::info!(env = %env, "starting exchange");

    let exchange = Exchange::new();
    let commands = CommandRegistry::new();
    let modules = ModuleHost::new();
    if let Err(err) = modules.load(
        &exchange,
        &commands,
        Box::new(ExchangeModule::new(config.exchange.clone())),
    ) {
        eprintln!("failed to load exchange module: {:#}", err);
        drop(log_guard);
        std::process::exit(1);
    }

    let ok = match get_script() {
        Some(path) => {
            println!("running script {}", path);
            run_script(&exchange, &commands, &path)
        }
        None => {
            println!("type 'help' for commands, 'quit' to leave");
            run_repl(&exchange, &commands)
        }
    };

    modules.unload_all(&exchange, &commands);
    tracing::info!("exchange stopped");

    // Flush buffered log lines before deciding the exit code.
    drop(log_guard);
    if !ok {
        std::process::exit(1);
    }
}
