mod commands;

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "petrel")]
#[command(about = "Automatic file distribution over FTP", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the dispatcher daemon
    Fd {
        /// Configuration file path
        #[arg(short, long, default_value = "/etc/petrel/fd.toml")]
        config: PathBuf,

        /// Generate a default configuration file and exit
        #[arg(long)]
        init_config: bool,
    },

    /// Show the live transfer status of every host
    Status {
        /// Petrel work directory (defaults to $PETREL_WORK_DIR)
        #[arg(short, long)]
        work_dir: Option<PathBuf>,

        /// Emit machine-readable JSON instead of a table
        #[arg(long)]
        json: bool,
    },

    /// Inspect or create the host table
    #[command(subcommand)]
    HostConfig(HostConfigCommands),

    /// Write a job message file
    Queue {
        /// Petrel work directory (defaults to $PETREL_WORK_DIR)
        #[arg(short, long)]
        work_dir: Option<PathBuf>,

        /// Job id for the message
        #[arg(long)]
        job_id: u32,

        /// Destination URL, e.g. ftp://user:pw@host/dir/
        url: String,

        /// Raw option lines to append under [options]
        #[arg(long = "option")]
        options: Vec<String>,
    },
}

#[derive(Subcommand)]
enum HostConfigCommands {
    /// Parse a host table and report what petrel will use
    Check {
        /// Path to the HOST_CONFIG file
        path: PathBuf,
    },

    /// Write a sample host table
    Init {
        /// Path to write
        path: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "petrel=info,petrel_fd=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Fd { config, init_config } => {
            commands::fd::run(&config, init_config).await?;
        }
        Commands::Status { work_dir, json } => {
            commands::status::show(work_dir, json)?;
        }
        Commands::HostConfig(cmd) => match cmd {
            HostConfigCommands::Check { path } => commands::host_config::check(&path)?,
            HostConfigCommands::Init { path } => commands::host_config::init(&path)?,
        },
        Commands::Queue {
            work_dir,
            job_id,
            url,
            options,
        } => {
            commands::queue::write_message(work_dir, job_id, &url, &options)?;
        }
    }

    Ok(())
}
