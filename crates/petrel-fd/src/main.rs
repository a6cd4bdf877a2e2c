use std::path::PathBuf;

use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use petrel_fd::config::{load_config, validate_config, write_default_config};
use petrel_fd::Dispatcher;

#[derive(Parser)]
#[command(name = "petrel-fd")]
#[command(about = "Petrel file distributor daemon", long_about = None)]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, default_value = "/etc/petrel/fd.toml")]
    config: PathBuf,

    /// Write a default configuration file and exit
    #[arg(long)]
    init_config: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    if cli.init_config {
        write_default_config(&cli.config)?;
        println!("wrote default configuration to {}", cli.config.display());
        return Ok(());
    }

    let config = load_config(&cli.config)?;

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| format!("petrel_fd={}", config.logging.level).into());
    match &config.logging.file {
        Some(path) => {
            let dir = path.parent().unwrap_or(std::path::Path::new("."));
            let name = path.file_name().map(PathBuf::from).unwrap_or_else(|| "fd.log".into());
            let appender = tracing_appender::rolling::daily(dir, name);
            tracing_subscriber::registry()
                .with(env_filter)
                .with(tracing_subscriber::fmt::layer().with_writer(appender).with_ansi(false))
                .init();
        }
        None => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(tracing_subscriber::fmt::layer())
                .init();
        }
    }

    validate_config(&config)?;

    let dispatcher = Dispatcher::start(config)?;
    dispatcher
        .run(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;

    Ok(())
}
