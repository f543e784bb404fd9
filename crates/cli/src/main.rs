//! replychain CLI: the main entry point.
//!
//! Commands:
//! - `reply`     Answer one Discord message (authorize, assemble, stream, post)
//! - `assemble`  Dry run: print the conversation a reply would be built from
//! - `redact`    Filter stdin through the reasoning redactor
//! - `config`    Show, initialize or validate the configuration

use std::path::PathBuf;

use clap::{Parser, Subcommand};

mod commands;

#[derive(Parser)]
#[command(
    name = "replychain",
    about = "replychain: reply-chain aware LLM replies for Discord",
    version,
    author
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Config file (defaults to ~/.replychain/config.toml)
    #[arg(short, long, global = true, env = "REPLYCHAIN_CONFIG")]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Reply to one message
    Reply {
        /// Channel (or thread) id
        #[arg(long)]
        channel: u64,

        /// Id of the message to answer
        #[arg(long)]
        message: u64,

        /// Override the configured model (`provider/model`)
        #[arg(long)]
        model: Option<String>,
    },

    /// Print the conversation a reply to a message would see
    Assemble {
        #[arg(long)]
        channel: u64,

        #[arg(long)]
        message: u64,

        #[arg(long)]
        model: Option<String>,

        /// Print the full completion request instead of just the turns
        #[arg(long)]
        request: bool,
    },

    /// Strip <think> blocks from stdin
    Redact {
        /// Treat stdin as one complete text instead of a stream of lines
        #[arg(long)]
        collapse: bool,
    },

    /// Show the effective configuration
    Config {
        /// Write a default config file
        #[arg(long, conflicts_with = "validate")]
        init: bool,

        /// Overwrite an existing file with --init
        #[arg(long, requires = "init")]
        force: bool,

        /// Validate the configuration and print a summary
        #[arg(long)]
        validate: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize tracing
    let filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(filter)),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let config_path = cli.config.as_deref();
    match cli.command {
        Commands::Reply {
            channel,
            message,
            model,
        } => {
            let config = commands::load_config(config_path, model)?;
            commands::reply::run(config, channel, message).await?
        }
        Commands::Assemble {
            channel,
            message,
            model,
            request,
        } => {
            let config = commands::load_config(config_path, model)?;
            commands::assemble::run(config, channel, message, request).await?
        }
        Commands::Redact { collapse } => commands::redact::run(collapse)?,
        Commands::Config {
            init,
            force,
            validate,
        } => {
            if init {
                commands::config_cmd::init(config_path, force)?
            } else if validate {
                commands::config_cmd::validate(config_path)?
            } else {
                commands::config_cmd::show(config_path)?
            }
        }
    }

    Ok(())
}
