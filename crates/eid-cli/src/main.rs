//! eID CLI - drive PIN change and identification flows
//!
//! Runs a flow against the simulated card, answering every screen with the
//! secrets given on the command line, and prints each transition.

mod commands;
mod config;
mod driver;
mod output;

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand, ValueEnum};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::commands::change_pin::ChangePinArgs;
use crate::commands::identify::IdentifyArgs;
use crate::config::Config;
use crate::output::{OutputContext, OutputFormat};

#[derive(Parser)]
#[command(name = "eid-cli")]
#[command(author, version, about = "eID PIN change and identification flows")]
#[command(propagate_version = true)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, env = "EID_CONFIG")]
    config: Option<PathBuf>,

    /// Card profile (TOML) for the simulated card
    #[arg(long, env = "EID_CARD")]
    card: Option<PathBuf>,

    /// Output format
    #[arg(short, long, value_enum)]
    output: Option<OutputFormat>,

    /// Give up after this many seconds
    #[arg(long)]
    timeout: Option<u64>,

    /// Disable colored output
    #[arg(long)]
    no_color: bool,

    /// Only print the transcript and the result
    #[arg(short, long)]
    quiet: bool,

    /// Verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Change the transport or personal PIN
    ChangePin {
        /// Current transport or personal PIN
        #[arg(long)]
        old: String,

        /// New personal PIN
        #[arg(long)]
        new: String,

        /// Confirmation of the new PIN, defaults to the new PIN
        #[arg(long)]
        confirm: Option<String>,

        /// PIN to enter when the card asks again (repeatable)
        #[arg(long = "retry-pin")]
        retry_pins: Vec<String>,

        /// CAN to enter when the card asks for it (repeatable)
        #[arg(long = "can")]
        cans: Vec<String>,

        /// The old PIN is the 5-digit transport PIN
        #[arg(long)]
        transport_pin: bool,

        /// Continue with an identification after the PIN change
        #[arg(long)]
        identification_pending: bool,
    },

    /// Identify against a service
    Identify {
        /// tc token URL of the service
        #[arg(long, default_value = "https://service.example/eid/tctoken")]
        url: String,

        /// Personal PIN
        #[arg(long)]
        pin: String,

        /// PIN to enter when the card asks again (repeatable)
        #[arg(long = "retry-pin")]
        retry_pins: Vec<String>,

        /// CAN to enter when the card asks for it (repeatable)
        #[arg(long = "can")]
        cans: Vec<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Set up logging
    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("warn")
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(false).with_writer(std::io::stderr))
        .with(filter)
        .init();

    // Load config file
    let config = if let Some(config_path) = &cli.config {
        Config::load_from(config_path)?
    } else {
        Config::load().unwrap_or_default()
    };

    // Merge CLI args with config
    let merged = config.merge_with_args(cli.card.as_deref(), cli.timeout, cli.no_color);
    let format = cli
        .output
        .or_else(|| {
            config
                .output
                .as_deref()
                .and_then(|name| OutputFormat::from_str(name, true).ok())
        })
        .unwrap_or_default();

    // Create output context
    let ctx = OutputContext::new(format, merged.no_color, cli.quiet);

    // Execute command
    match cli.command {
        Commands::ChangePin {
            old,
            new,
            confirm,
            retry_pins,
            cans,
            transport_pin,
            identification_pending,
        } => {
            let args = ChangePinArgs {
                old,
                new,
                confirm,
                retry_pins,
                cans,
                transport_pin,
                identification_pending,
            };
            commands::change_pin(args, &merged, &ctx).await?;
        }

        Commands::Identify {
            url,
            pin,
            retry_pins,
            cans,
        } => {
            let args = IdentifyArgs {
                url,
                pin,
                retry_pins,
                cans,
            };
            commands::identify(args, &merged, &ctx).await?;
        }
    }

    Ok(())
}
