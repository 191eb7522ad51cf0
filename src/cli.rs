use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "topup")]
#[command(version, about = "Auto Top-Up - permission-scoped bot wallet funding", long_about = None)]
pub struct Cli {
    /// Path to configuration file
    #[arg(short, long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Initialize configuration and database
    Init {
        /// Directory to initialize (defaults to current directory)
        path: Option<PathBuf>,
    },

    /// Show (creating on first use) the session identity for the owner
    Identity,

    /// Request spending permissions from the owner's wallet
    Grant,

    /// Show stored permissions and the bot target
    Permission,

    /// Forget stored permissions and the bot target
    Clear {
        /// Also discard the session key (orphans every granted permission)
        #[arg(long)]
        session_key: bool,
    },

    /// Store the bot wallet address to monitor
    SetBot {
        /// Bot wallet address
        address: String,
    },

    /// Read the bot and funding balances once
    Balances {
        /// Bot address (defaults to the configured or stored bot)
        #[arg(short, long)]
        bot: Option<String>,
    },

    /// Send a single top-up to the bot now
    Send {
        /// Amount in whole asset units (defaults to monitor.top_up_amount)
        #[arg(short, long)]
        amount: Option<String>,

        /// Bot address (defaults to the configured or stored bot)
        #[arg(short, long)]
        bot: Option<String>,
    },

    /// Watch the bot balance and top it up until interrupted
    Monitor {
        /// Bot address (defaults to the configured or stored bot)
        #[arg(short, long)]
        bot: Option<String>,

        /// Seconds to wait for an in-flight transfer after Ctrl-C
        #[arg(long, default_value_t = 30)]
        drain_secs: u64,
    },
}
