//! ctx - command-line client for the contextd broker.
//!
//! Two interactive subcommands mirror the broker's two planes: `listen`
//! speaks the subscriber protocol, `provide` the provider protocol. Both
//! bridge stdin lines to the socket and socket lines to stdout, so they
//! work equally as interactive shells and as scriptable test drivers.

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use contextd_core::config::BrokerConfig;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

mod client;
mod commands;

/// ctx - contextd broker client
#[derive(Parser, Debug)]
#[command(name = "ctx")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Path to broker configuration file
    #[arg(short, long, default_value = "contextd.toml")]
    config: PathBuf,

    /// Path to the broker Unix socket (overrides the configuration)
    #[arg(long)]
    socket: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "warn")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Watch properties over the subscriber socket
    Listen {
        /// Properties to subscribe to immediately
        #[arg(value_name = "KEY")]
        keys: Vec<String>,
    },

    /// Serve properties over the provider socket
    Provide {
        /// Provider identity announced to the broker
        #[arg(long)]
        session: String,

        /// Initial declaration, e.g. `bool Screen.Blanked false`
        #[arg(value_names = ["TYPE", "KEY", "VALUE"], num_args = 3)]
        initial: Vec<String>,
    },
}

/// Resolves the socket path: CLI flag first, then the configuration file,
/// then the built-in default.
fn resolve_socket(cli: &Cli, pick: fn(&BrokerConfig) -> &PathBuf) -> PathBuf {
    cli.socket.clone().unwrap_or_else(|| {
        let config = BrokerConfig::load_or_default(&cli.config).unwrap_or_default();
        pick(&config).clone()
    })
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = EnvFilter::try_new(&cli.log_level).unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    match &cli.command {
        Commands::Listen { keys } => {
            let socket_path = resolve_socket(&cli, |config| &config.daemon.subscriber_socket);
            commands::listen::run(&socket_path, keys)
        },
        Commands::Provide { session, initial } => {
            let socket_path = resolve_socket(&cli, |config| &config.daemon.provider_socket);
            commands::provide::run(&socket_path, session, initial)
        },
    }
}
