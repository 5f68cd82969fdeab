//! ethindexer CLI — inspect configuration defaults and versions.
//!
//! Usage:
//! ```bash
//! ethindexer info
//! ethindexer config          # print the default config as JSON
//! ethindexer version
//! ```
//!
//! Running the indexer itself is wired up by the host application through
//! `ethindexer_core::Indexer`; this binary is an operator surface.

use std::env;
use std::process;

use anyhow::Result;
use tracing_subscriber::EnvFilter;

use ethindexer_core::NodeConfig;

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args: Vec<String> = env::args().collect();
    if args.len() < 2 {
        print_usage();
        process::exit(1);
    }

    match args[1].as_str() {
        "info" => cmd_info(),
        "config" => cmd_config()?,
        "version" | "--version" | "-V" => {
            println!("ethindexer {}", ethindexer_core::package_version());
        }
        "help" | "--help" | "-h" => print_usage(),
        other => {
            eprintln!("Unknown command: {other}");
            print_usage();
            process::exit(1);
        }
    }
    Ok(())
}

fn print_usage() {
    println!("ethindexer {}", ethindexer_core::package_version());
    println!("Dictionary-accelerated, reorg-safe Ethereum indexing node\n");
    println!("USAGE:");
    println!("    ethindexer <COMMAND>\n");
    println!("COMMANDS:");
    println!("    info     Show configuration defaults");
    println!("    config   Print the default configuration as JSON");
    println!("    version  Print version");
    println!("    help     Print this help");
}

fn cmd_info() {
    let defaults = NodeConfig::default();
    println!("ethindexer v{}", ethindexer_core::package_version());
    println!("  Default batch size: {} blocks/iteration", defaults.batch_size);
    println!(
        "  Default dictionary window: {} blocks/scan",
        defaults.dictionary_query_size
    );
    println!(
        "  Default dictionary timeout: {}s",
        defaults.dictionary_timeout_secs
    );
    println!("  Unfinalized tracking: {}", defaults.unfinalized_blocks);
    println!("  Workers: endpoints x 2 unless pinned");
}

fn cmd_config() -> Result<()> {
    println!("{}", serde_json::to_string_pretty(&NodeConfig::default())?);
    Ok(())
}
