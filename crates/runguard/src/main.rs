//! Command-line front end for runguard.
//!
//! # Examples
//!
//! ```sh
//! # Print the JSON schema of the configuration file
//! runguard schema
//!
//! # Replay a scripted run with a custom config
//! runguard simulate --script run.json --config governance.json --store-dir ./state
//! ```

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use runguard::GovernanceConfig;
use runguard::simulate::{Script, Simulation, SimulationSummary};
use runguard::store::DirectoryStore;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Run governance for autonomous agents.
#[derive(Parser)]
#[command(name = "runguard", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Print the JSON schema of the governance config file.
    Schema,

    /// Replay a scripted run through the governance stack.
    Simulate {
        /// Script of turns (JSON).
        #[arg(long)]
        script: PathBuf,

        /// Governance config (JSON). Defaults apply when omitted.
        #[arg(long)]
        config: Option<PathBuf>,

        /// Directory for drained mutations and offloaded results.
        #[arg(long, default_value = ".runguard")]
        store_dir: PathBuf,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Logs go to stderr so stdout stays machine-readable.
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let outcome = match cli.command {
        Command::Schema => print_schema(),
        Command::Simulate {
            script,
            config,
            store_dir,
        } => simulate(script, config, store_dir).await,
    };

    if let Err(e) = outcome {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}

fn print_schema() -> Result<(), String> {
    let schema = schemars::schema_for!(GovernanceConfig);
    let json = serde_json::to_string_pretty(&schema)
        .map_err(|e| format!("Failed to serialize schema: {e}"))?;
    println!("{json}");
    Ok(())
}

async fn simulate(
    script_path: PathBuf,
    config_path: Option<PathBuf>,
    store_dir: PathBuf,
) -> Result<(), String> {
    let config = match &config_path {
        Some(path) => GovernanceConfig::load(path)
            .map_err(|e| format!("Failed to load {}: {e}", path.display()))?,
        None => GovernanceConfig::default(),
    };

    let json = std::fs::read_to_string(&script_path)
        .map_err(|e| format!("Failed to read {}: {e}", script_path.display()))?;
    let script = Script::from_json(&json)
        .map_err(|e| format!("Failed to parse {}: {e}", script_path.display()))?;

    let mut simulation = Simulation::new(&config, DirectoryStore::new(&store_dir))
        .map_err(|e| e.to_string())?;
    let summary = simulation
        .run(&script, |line| println!("{line}"))
        .await
        .map_err(|e| e.to_string())?;

    print_summary(&summary);
    Ok(())
}

fn print_summary(summary: &SimulationSummary) {
    eprintln!("--- Summary ---");
    eprintln!("Turns completed: {}", summary.turns_completed);
    if let Some(reason) = &summary.aborted {
        eprintln!("Aborted: {reason}");
    }
    eprintln!(
        "Budget: {} steps, {} tool calls, {} tokens",
        summary.tripwire.step_count, summary.tripwire.tool_call_count, summary.tripwire.total_tokens
    );
    eprintln!("Compactions: {}", summary.compaction.compactions);
    eprintln!(
        "Mutations: {} flushed, {} dropped",
        summary.flushed, summary.flush_failures
    );
    eprintln!(
        "Events: {} emitted, {} suppressed",
        summary.events_emitted, summary.events_suppressed
    );
}
