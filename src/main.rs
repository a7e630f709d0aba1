use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;

mod cmd;

#[derive(Parser)]
#[command(name = "foreman")]
#[command(version, about = "Spec-driven workflow orchestrator")]
pub struct Cli {
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Root directory holding specs/ and foreman.json
    #[arg(long, global = true)]
    pub root: Option<PathBuf>,

    /// Path to the workflow config. Defaults to <root>/foreman.json when present.
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run a workflow for a spec, resuming persisted state by default
    Run {
        /// Spec reference: a manifest path, or a name under specs/
        #[arg(long)]
        spec: String,

        /// Discard any persisted state and start over
        #[arg(long)]
        fresh: bool,
    },
    /// List known specs and their run state
    List {
        /// Only show specs for this project
        #[arg(long)]
        project: Option<String>,
    },
    /// Show persisted run state for a spec without executing anything
    Status {
        #[arg(long)]
        spec: String,
    },
    /// Validate a manifest and the workflow config
    Validate {
        #[arg(long)]
        spec: String,
    },
    /// Scaffold a starter manifest
    New {
        #[arg(long)]
        project: String,

        #[arg(long)]
        name: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let root = match cli.root.clone() {
        Some(dir) => dir,
        None => std::env::current_dir().context("Failed to get current directory")?,
    };

    let ok = match &cli.command {
        Commands::Run { spec, fresh } => {
            cmd::cmd_run(&root, spec, cli.config.as_deref(), *fresh, cli.verbose).await?
        }
        Commands::List { project } => {
            cmd::cmd_list(&root, project.as_deref())?;
            true
        }
        Commands::Status { spec } => {
            cmd::cmd_status(&root, spec)?;
            true
        }
        Commands::Validate { spec } => cmd::cmd_validate(&root, spec, cli.config.as_deref())?,
        Commands::New { project, name } => {
            cmd::cmd_new(&root, project, name)?;
            true
        }
    };

    if !ok {
        std::process::exit(1);
    }
    Ok(())
}
