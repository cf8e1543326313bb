use anyhow::Result;
use clap::{Parser, Subcommand};
use scriptorium::config::Config;
use std::path::PathBuf;

mod cmd;

#[derive(Parser)]
#[command(name = "scriptorium")]
#[command(version, about = "Tournament-driven long-form text generation")]
pub struct Cli {
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Path to scriptorium.toml (defaults to ./scriptorium.toml when present)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    pub log_json: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the full pipeline on a single prompt
    Run {
        /// Prompt text
        #[arg(short, long, conflicts_with = "prompt_file", required_unless_present = "prompt_file")]
        prompt: Option<String>,

        /// Read the prompt from a file
        #[arg(long)]
        prompt_file: Option<PathBuf>,

        /// Record the outcome as a checkpoint under this task id
        #[arg(long)]
        task_id: Option<String>,

        /// Write the outcome as JSON to this path
        #[arg(short, long)]
        out: Option<PathBuf>,
    },
    /// Write a multi-chapter work from a plan, resuming where it left off
    Write {
        /// TOML or JSON file listing chapter prompts
        #[arg(long)]
        plan: PathBuf,

        /// Task id for checkpoints (defaults to the plan's file stem)
        #[arg(long)]
        task_id: Option<String>,

        /// Write the full result as JSON to this path
        #[arg(short, long)]
        out: Option<PathBuf>,
    },
    /// Run one pipeline per `*.txt` prompt in a directory
    Batch {
        #[arg(long)]
        dir: PathBuf,

        /// Maximum concurrent pipelines (overrides batch.max_workers)
        #[arg(long)]
        max_workers: Option<usize>,

        /// Write the batch summary as JSON to this path
        #[arg(short, long)]
        out: Option<PathBuf>,
    },
    /// Inspect or clear saved checkpoints
    Checkpoints {
        #[command(subcommand)]
        command: CheckpointCommands,
    },
    /// View or validate configuration
    Config {
        #[command(subcommand)]
        command: Option<ConfigCommands>,
    },
}

#[derive(Subcommand, Clone)]
pub enum CheckpointCommands {
    /// List every checkpoint of a task
    List {
        #[arg(long)]
        task_id: String,
    },
    /// Show the resume state of a task
    Show {
        #[arg(long)]
        task_id: String,
    },
    /// Delete all checkpoints of a task
    Clear {
        #[arg(long)]
        task_id: String,
    },
}

#[derive(Subcommand, Clone)]
pub enum ConfigCommands {
    /// Show the effective configuration
    Show,
    /// Validate configuration and show any warnings
    Validate,
    /// Write a default scriptorium.toml
    Init,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    scriptorium::logging::init(cli.verbose, cli.log_json);

    // `config init` must work even when the target file is missing.
    if let Commands::Config {
        command: Some(ConfigCommands::Init),
    } = cli.command
    {
        return cmd::cmd_config_init(cli.config.as_deref());
    }

    let config = Config::load(cli.config.as_deref())?.with_verbose(cli.verbose);

    match &cli.command {
        Commands::Run {
            prompt,
            prompt_file,
            task_id,
            out,
        } => {
            cmd::cmd_run(
                &config,
                prompt.as_deref(),
                prompt_file.as_deref(),
                task_id.as_deref(),
                out.as_deref(),
            )
            .await?
        }
        Commands::Write { plan, task_id, out } => {
            cmd::cmd_write(&config, plan, task_id.as_deref(), out.as_deref()).await?
        }
        Commands::Batch {
            dir,
            max_workers,
            out,
        } => cmd::cmd_batch(&config, dir, *max_workers, out.as_deref()).await?,
        Commands::Checkpoints { command } => cmd::cmd_checkpoints(&config, command.clone()).await?,
        Commands::Config { command } => cmd::cmd_config(&config, command.clone())?,
    }

    Ok(())
}
