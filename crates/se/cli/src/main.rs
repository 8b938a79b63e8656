//! Command-line interface for secure element readers

use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand};
use eyre::WrapErr;

mod commands;
mod config;

use commands::{SIM_AID, Shell};

#[derive(Parser)]
#[command(version, about = "Access secure elements through PC/SC readers")]
struct Cli {
    /// Reader name to use (defaults to the first reader holding a card)
    #[arg(short, long, global = true)]
    reader: Option<String>,

    /// Trace level output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Use a simulated reader instead of PC/SC
    #[arg(long, global = true)]
    simulate: bool,

    /// Configuration file (defaults to ~/.nxm/se.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List available readers
    List,

    /// Print the ATR of the card
    Atr,

    /// Select an applet and send one command APDU
    Transmit {
        /// AID of the applet to select, as a hex string
        #[arg(long, default_value_t = hex::encode(SIM_AID))]
        aid: String,

        /// Open a logical channel instead of the basic channel
        #[arg(long)]
        logical: bool,

        /// Command APDU, as a hex string
        #[arg(required = true)]
        apdu: String,
    },

    /// Print card insertions and removals
    Monitor {
        /// Stop after this many seconds
        #[arg(long)]
        seconds: Option<u64>,
    },
}

fn main() -> eyre::Result<()> {
    let cli = Cli::parse();
    setup_logging(cli.verbose);

    let config = config::load_config(cli.config.as_deref()).wrap_err("loading configuration")?;
    let shell = Shell::new(&config, cli.simulate)?;
    let reader = cli.reader.as_deref();

    match cli.command {
        Commands::List => shell.list(),
        Commands::Atr => shell.atr(reader),
        Commands::Transmit {
            aid,
            logical,
            apdu,
        } => {
            let aid = hex::decode(aid.trim()).wrap_err("AID is not valid hex")?;
            let apdu = hex::decode(apdu.replace(' ', "")).wrap_err("APDU is not valid hex")?;
            shell.transmit(reader, &aid, logical, &apdu)
        }
        Commands::Monitor { seconds } => shell.monitor(seconds.map(Duration::from_secs)),
    }
}

fn setup_logging(verbose: bool) {
    let level = if verbose {
        tracing::Level::TRACE
    } else {
        tracing::Level::INFO
    };

    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_ansi(true)
        .init();
}
