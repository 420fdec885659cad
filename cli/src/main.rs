//! chainflow CLI — inspect engine defaults and versions.
//!
//! Usage:
//! ```bash
//! chainflow info
//! chainflow version
//! ```

use std::env;
use std::process;

use chainflow_engine::EngineConfig;

fn main() {
    let args: Vec<String> = env::args().collect();
    if args.len() < 2 {
        print_usage();
        process::exit(1);
    }

    match args[1].as_str() {
        "info" => cmd_info(),
        "version" | "--version" | "-V" => {
            println!("chainflow {}", env!("CARGO_PKG_VERSION"));
        }
        "help" | "--help" | "-h" => print_usage(),
        other => {
            eprintln!("Unknown command: {other}");
            print_usage();
            process::exit(1);
        }
    }
}

fn print_usage() {
    println!("chainflow {}", env!("CARGO_PKG_VERSION"));
    println!("Multi-chain EVM event indexing engine\n");
    println!("USAGE:");
    println!("    chainflow <COMMAND>\n");
    println!("COMMANDS:");
    println!("    info     Show engine configuration defaults");
    println!("    version  Print version");
    println!("    help     Print this help");
}

fn cmd_info() {
    let defaults = EngineConfig::default();
    println!("chainflow v{}", env!("CARGO_PKG_VERSION"));
    println!("  Worker concurrency: {} tasks", defaults.worker_concurrency);
    println!("  Load batch budget: {} events", defaults.max_batch_size);
    println!("  Task attempts: {}", defaults.task_attempts);
    println!("  Flush interval: {} s", defaults.flush_interval_secs);
    println!("  Sync store backends: SQLite, PostgreSQL");
    println!("  Chains: EVM (Ethereum, Arbitrum, Base, Polygon, Optimism, ...)");
}
