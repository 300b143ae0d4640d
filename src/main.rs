use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use agent_factory::factory_config::DEFAULT_CONFIG_PATH;

mod cmd;

#[derive(Parser)]
#[command(name = "agent-factory")]
#[command(
    version,
    about = "Wave decomposition, budget-gated execution and draft approvals for agent builds"
)]
pub struct Cli {
    /// Path to factory.toml
    #[arg(long, global = true, default_value = DEFAULT_CONFIG_PATH)]
    pub config: PathBuf,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    pub log_json: bool,

    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start the HTTP server
    Serve {
        /// Port to serve on (overrides [server] port)
        #[arg(short, long)]
        port: Option<u16>,

        /// Database path (overrides [server] db_path)
        #[arg(long)]
        db_path: Option<PathBuf>,

        /// Bind 0.0.0.0 and allow any CORS origin
        #[arg(long)]
        dev: bool,
    },
    /// Preview how a build spec decomposes into waves
    Decompose {
        /// Path to the build spec (markdown or a <workstreams> block)
        spec_file: PathBuf,

        /// Comma-separated tech stack used for agent inference
        #[arg(long, value_delimiter = ',')]
        tech_stack: Vec<String>,

        /// Print the decomposition as JSON
        #[arg(long)]
        json: bool,
    },
    /// View, validate or create configuration
    Config {
        #[command(subcommand)]
        command: Option<ConfigCommands>,
    },
}

#[derive(Subcommand, Clone)]
pub enum ConfigCommands {
    /// Show the effective configuration
    Show,
    /// Validate configuration and show any warnings
    Validate,
    /// Write a default factory.toml
    Init {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

fn init_tracing(verbose: bool, json: bool) {
    let default_filter = if verbose {
        "debug,agent_factory=debug"
    } else {
        "info,agent_factory=info"
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    let registry = tracing_subscriber::registry().with(filter);

    // stderr keeps `decompose --json` output clean.
    if json {
        registry
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_writer(std::io::stderr),
            )
            .init();
    } else {
        registry
            .with(
                tracing_subscriber::fmt::layer()
                    .with_target(false)
                    .with_writer(std::io::stderr),
            )
            .init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    init_tracing(cli.verbose, cli.log_json);

    match &cli.command {
        Commands::Serve { port, db_path, dev } => {
            cmd::cmd_serve(&cli.config, *port, db_path.clone(), *dev).await?;
        }
        Commands::Decompose {
            spec_file,
            tech_stack,
            json,
        } => cmd::cmd_decompose(spec_file, tech_stack.clone(), *json)?,
        Commands::Config { command } => cmd::cmd_config(&cli.config, command.clone())?,
    }

    Ok(())
}
