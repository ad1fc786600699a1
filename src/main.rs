use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;

mod cmd;

#[derive(Parser)]
#[command(name = "anvil")]
#[command(version, about = "Adversarial document optimization pipeline")]
pub struct Cli {
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[arg(long, global = true)]
    pub project_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Optimize a document for a target role
    Run {
        /// Path to the source document (plain text)
        input: PathBuf,

        /// Target role to optimize for
        #[arg(short, long)]
        role: String,

        /// Location hint passed to the researcher
        #[arg(long)]
        location: Option<String>,

        /// Pause for confirmation between stages
        #[arg(long)]
        manual: bool,

        /// Write the optimized plain text to this file
        #[arg(short, long)]
        out: Option<PathBuf>,
    },
    /// Resume a checkpointed or paused run
    Resume {
        /// The continuation id from the checkpoint
        continuation_id: String,

        /// Subject id the continuation belongs to
        #[arg(short, long)]
        subject: String,

        /// Write the optimized plain text to this file
        #[arg(short, long)]
        out: Option<PathBuf>,
    },
    /// Start the HTTP event-stream server
    Serve {
        /// Port to serve on (overrides configuration)
        #[arg(short, long)]
        port: Option<u16>,

        /// Bind on all interfaces with permissive CORS (local dev frontend)
        #[arg(long)]
        dev: bool,
    },
    /// View or validate configuration
    Config {
        #[command(subcommand)]
        command: Option<ConfigCommands>,
    },
}

#[derive(Subcommand, Clone)]
pub enum ConfigCommands {
    /// Show current configuration
    Show,
    /// Validate configuration and show any warnings
    Validate,
    /// Initialize a default anvil.toml file
    Init,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let project_dir = match cli.project_dir.clone() {
        Some(dir) => dir,
        None => std::env::current_dir().context("Failed to get current directory")?,
    };

    match &cli.command {
        Commands::Run {
            input,
            role,
            location,
            manual,
            out,
        } => {
            cmd::cmd_run(
                &project_dir,
                input,
                role,
                location.as_deref(),
                *manual,
                out.as_deref(),
                cli.verbose,
            )
            .await?;
        }
        Commands::Resume {
            continuation_id,
            subject,
            out,
        } => {
            cmd::cmd_resume(
                &project_dir,
                continuation_id,
                subject,
                out.as_deref(),
                cli.verbose,
            )
            .await?;
        }
        Commands::Serve { port, dev } => {
            cmd::cmd_serve(&project_dir, *port, *dev).await?;
        }
        Commands::Config { command } => {
            cmd::cmd_config(&project_dir, command.clone())?;
        }
    }

    Ok(())
}
