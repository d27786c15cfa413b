use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use paydm_cli::cli;
use paydm_core::tracing_setup::init_tracing;
use paydm_core::SettingsStorage;

#[derive(Parser)]
#[command(name = "paydm")]
#[command(about = "Nostr DM agent that answers donation requests with fresh bitcoin addresses")]
struct Cli {
    /// Path to the settings file (default: ~/.nostr-paydm/settings.json)
    #[arg(long, short = 'c')]
    config: Option<PathBuf>,

    /// Pretty-print JSON output
    #[arg(long, short)]
    pretty: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the agent until Ctrl-C (default)
    Run,

    /// Print the agent's npub and current settings
    Show,

    /// Add a relay to connect to
    AddRelay {
        /// Relay URL, e.g. wss://relay.damus.io
        url: String,
    },

    /// Remove all configured relays
    ClearRelays,

    /// Set the extended public key addresses are derived from
    SetXpub {
        /// BIP32 xpub or tpub
        xpub: String,
    },

    /// Set the address script type
    SetScheme {
        /// p2wpkh or p2tr
        scheme: String,
    },

    /// Set the message sent to anyone not asking for an address
    SetCampaignMessage {
        /// Text sent before the address-request instructions
        message: String,
    },

    /// Show the address the next request would receive, without consuming it
    NextAddress,
}

fn main() {
    let args = Cli::parse();

    if let Err(e) = execute(args) {
        eprintln!("Error: {:#}", e);
        std::process::exit(1);
    }
}

fn execute(args: Cli) -> Result<()> {
    let path = args.config.unwrap_or_else(SettingsStorage::default_path);
    let mut storage = SettingsStorage::load(&path)
        .with_context(|| format!("Failed to load settings from {}", path.display()))?;
    let keys = storage.ensure_identity().context("Failed to load agent identity")?;

    let output = match args.command.unwrap_or(Commands::Run) {
        Commands::Run => {
            init_tracing()?;
            return cli::run_agent(storage);
        }
        Commands::Show => cli::show(&storage, &keys)?,
        Commands::AddRelay { url } => cli::add_relay(&mut storage, &url)?,
        Commands::ClearRelays => cli::clear_relays(&mut storage)?,
        Commands::SetXpub { xpub } => cli::set_xpub(&mut storage, &xpub)?,
        Commands::SetScheme { scheme } => cli::set_scheme(&mut storage, &scheme)?,
        Commands::SetCampaignMessage { message } => {
            cli::set_campaign_message(&mut storage, &message)?
        }
        Commands::NextAddress => cli::next_address(&storage)?,
    };

    let rendered = if args.pretty {
        serde_json::to_string_pretty(&output)?
    } else {
        serde_json::to_string(&output)?
    };
    println!("{}", rendered);
    Ok(())
}
