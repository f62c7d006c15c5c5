//! # Magpie agent
//!
//! Command-line entry point for the magpie collection agent: `daemon` runs
//! the collection loop forever, `remote-config rules` prints the device's
//! applicable diagnosis rules as JSON.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use magpie_config::AppConfig;
use magpie_core::api::build_client;
use magpie_core::auth::ApiClientState;
use magpie_core::remote_config::list_device_diagnosis_rules;
use magpie_core::{AgentPaths, Scheduler};

#[derive(Parser, Debug)]
#[command(name = "magpie", version, about = "Robot-data collection agent")]
struct Args {
    /// Path to the agent config file (YAML)
    #[arg(short = 'c', long, global = true)]
    config_file: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short = 'v', long, global = true, default_value_t = false)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the collection loop forever
    Daemon,
    /// Inspect remote configuration
    RemoteConfig {
        #[command(subcommand)]
        what: RemoteConfigCommand,
    },
}

#[derive(Subcommand, Debug)]
enum RemoteConfigCommand {
    /// Print the device's applicable diagnosis rules as JSON
    Rules,
}

fn init_tracing(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

async fn run(args: Args) -> anyhow::Result<()> {
    let conf = AppConfig::load(args.config_file.as_deref()).context("failed to load config")?;
    conf.validate().context("invalid config")?;
    let paths = AgentPaths::system();

    match args.command {
        Command::Daemon => {
            tracing::info!(version = env!("CARGO_PKG_VERSION"), "starting collector daemon");
            let scheduler = Scheduler::new(conf, paths, env!("CARGO_PKG_VERSION").to_string());
            scheduler.run_forever().await?;
        }
        Command::RemoteConfig {
            what: RemoteConfigCommand::Rules,
        } => {
            let meter = magpie_core::netmeter::NetworkMeter::new();
            let client = build_client(&conf.api, &paths, Arc::clone(&meter))?;
            let state = ApiClientState::load(&paths);
            let rules =
                list_device_diagnosis_rules(client.as_ref(), state.device_name(), &paths).await;
            println!("{}", serde_json::to_string_pretty(&rules)?);
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    init_tracing(args.verbose);

    match run(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            tracing::error!(error = %format!("{err:#}"), "agent exited with error");
            ExitCode::FAILURE
        }
    }
}
