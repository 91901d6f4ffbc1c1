//! Command-line client for the updater system monitor.
//!
//! ## Subcommands
//!
//! - `status`: both upgrade modes' counts
//! - `full` / `basic`: one mode's counts
//! - `refresh`, `state-changed`, `quit`: fire the matching monitor method
//! - `health`: the monitor's health document
//! - `watch`: print change signals until the monitor exits

use clap::{Parser, Subcommand};
use serde_json::Value;
use tracing_subscriber::EnvFilter;
use updater_monitor_protocol::{socket_path, Method, Signal, UpgradeCounts, UpgradesAvailable};

mod client;

use client::MonitorClient;

#[derive(Parser)]
#[command(name = "updater-monitorctl")]
#[command(about = "Query and control the updater system monitor")]
#[command(version)]
struct Cli {
    /// Print raw JSON instead of text
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show pending upgrades for both modes
    Status,
    /// Show pending full-upgrade counts
    Full,
    /// Show pending basic-upgrade counts
    Basic,
    /// Force a rescan and re-announce the results
    Refresh,
    /// Tell the monitor package state may have changed
    StateChanged,
    /// Stop the monitor
    Quit,
    /// Show monitor health
    Health,
    /// Print change signals as they arrive
    Watch,
}

fn main() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    if let Err(err) = run(&cli) {
        eprintln!("updater-monitorctl: {}", err);
        std::process::exit(1);
    }
}

fn run(cli: &Cli) -> Result<(), String> {
    let mut client = MonitorClient::connect(&socket_path())?;

    let method = match cli.command {
        Commands::Status => Method::UpgradesAvailable,
        Commands::Full => Method::FullUpgradesAvailable,
        Commands::Basic => Method::BasicUpgradesAvailable,
        Commands::Refresh => Method::Refresh,
        Commands::StateChanged => Method::StateChanged,
        Commands::Quit => Method::Quit,
        Commands::Health => Method::GetHealth,
        Commands::Watch => {
            let json = cli.json;
            return client.watch(|signal| println!("{}", render_signal(&signal, json)));
        }
    };

    let data = client.call(method)?.data.unwrap_or(Value::Null);
    if cli.json {
        println!("{}", data);
        return Ok(());
    }

    match cli.command {
        Commands::Status => {
            let available: UpgradesAvailable = decode(data)?;
            println!("full-upgrade:  {}", available.full_upgrade);
            println!("basic-upgrade: {}", available.basic_upgrade);
        }
        Commands::Full | Commands::Basic => {
            let counts: UpgradeCounts = decode(data)?;
            println!("{}", counts);
        }
        Commands::Health => {
            let pretty = serde_json::to_string_pretty(&data)
                .map_err(|err| format!("Failed to format health: {}", err))?;
            println!("{}", pretty);
        }
        _ => {}
    }
    Ok(())
}

fn decode<T: serde::de::DeserializeOwned>(data: Value) -> Result<T, String> {
    serde_json::from_value(data).map_err(|err| format!("Unexpected monitor answer: {}", err))
}

fn render_signal(signal: &Signal, json: bool) -> String {
    if json {
        return serde_json::to_string(signal).unwrap_or_else(|_| signal.name().to_string());
    }
    match signal {
        Signal::UpgradesChanged(available) => format!(
            "{}: full-upgrade [{}] basic-upgrade [{}]",
            signal.name(),
            available.full_upgrade,
            available.basic_upgrade
        ),
        Signal::FullUpgradesChanged(counts) | Signal::BasicUpgradesChanged(counts) => {
            format!("{}: {}", signal.name(), counts)
        }
    }
}
