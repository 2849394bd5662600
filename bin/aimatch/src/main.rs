mod commands;

use aimatch_core::Paths;
use clap::{Parser, Subcommand};
use std::fs::OpenOptions;
use std::path::PathBuf;
use std::sync::Mutex;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser)]
#[command(name = "aimatch")]
#[command(about = "Queue-driven AI product matching worker", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Base directory for config, queue, logs and browser profile (default: ~/.aimatch)
    #[arg(long, global = true)]
    base_dir: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a default configuration file
    Onboard {
        /// Force overwrite existing configuration
        #[arg(long)]
        force: bool,
    },

    /// Show configuration and queue status
    Status,

    /// Run the queue loop (Sync-In, sweep, Sync-Out, idle)
    Run {
        /// Run a single cycle and exit
        #[arg(long)]
        once: bool,
    },

    /// Open a visible browser on the persistent profile to sign in to the chat
    Login {
        /// Close the browser after this many seconds instead of waiting for Ctrl-C
        #[arg(long)]
        wait_secs: Option<u64>,
    },

    /// Synchronize with the server once
    Sync {
        /// Only pull new tasks
        #[arg(long, conflicts_with = "push_only")]
        pull_only: bool,

        /// Only push resolved statuses
        #[arg(long)]
        push_only: bool,
    },

    /// Inspect and reset queued tasks
    Queue {
        #[command(subcommand)]
        command: QueueCommands,
    },

    /// Show the operational log
    Logs {
        /// Number of lines to show
        #[arg(short = 'n', long, default_value_t = 50)]
        lines: usize,
    },
}

#[derive(Subcommand)]
enum QueueCommands {
    /// List tasks
    List {
        /// Only show tasks with this status (PENDING, VERIFIED, IGNORED, UNRESOLVED)
        #[arg(long)]
        status: Option<String>,
    },

    /// Put a task back to PENDING
    Requeue {
        /// Task id
        id: i64,
    },
}

fn init_tracing(verbose: bool, paths: &Paths) {
    let filter = match std::env::var("RUST_LOG") {
        Ok(_) => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        Err(_) if verbose => EnvFilter::new("debug"),
        Err(_) => EnvFilter::new("info"),
    };

    // Operational log file; console-only when it cannot be opened
    let file_layer = std::fs::create_dir_all(paths.logs_dir())
        .and_then(|_| {
            OpenOptions::new()
                .create(true)
                .append(true)
                .open(paths.log_file())
        })
        .ok()
        .map(|file| fmt::layer().with_ansi(false).with_writer(Mutex::new(file)));

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(file_layer)
        .with(filter)
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let paths = match cli.base_dir {
        Some(base) => Paths::with_base(base),
        None => Paths::new(),
    };

    init_tracing(cli.verbose, &paths);

    match cli.command {
        Commands::Onboard { force } => {
            commands::onboard::run(&paths, force).await?;
        }
        Commands::Status => {
            commands::status::run(&paths).await?;
        }
        Commands::Run { once } => {
            commands::run::run(&paths, once).await?;
        }
        Commands::Login { wait_secs } => {
            commands::login::run(&paths, wait_secs).await?;
        }
        Commands::Sync {
            pull_only,
            push_only,
        } => {
            commands::sync_cmd::run(&paths, !push_only, !pull_only).await?;
        }
        Commands::Queue { command } => match command {
            QueueCommands::List { status } => {
                commands::queue_cmd::list(&paths, status.as_deref()).await?;
            }
            QueueCommands::Requeue { id } => {
                commands::queue_cmd::requeue(&paths, id).await?;
            }
        },
        Commands::Logs { lines } => {
            commands::logs_cmd::show(&paths, lines).await?;
        }
    }

    Ok(())
}
