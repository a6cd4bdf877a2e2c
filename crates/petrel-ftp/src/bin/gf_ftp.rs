//! Inbound FTP retriever process.
//!
//! Polls one remote directory, diffs the listing against the retrieve
//! list and fetches whatever is new or changed into the local
//! incoming directory.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use petrel_core::{ExitStatus, WorkDir};
use petrel_ftp::retrieve::{self, FileMasks, RetrieveConfig};
use petrel_msg::Recipient;

#[derive(Parser)]
#[command(name = "petrel-gf-ftp")]
#[command(about = "Petrel inbound FTP retriever", long_about = None)]
#[command(version)]
struct Cli {
    /// Petrel work directory (defaults to $PETREL_WORK_DIR)
    #[arg(short, long)]
    work_dir: Option<PathBuf>,

    /// Host alias in the status area
    #[arg(long)]
    host_alias: String,

    /// Job-status slot this process owns
    #[arg(long, default_value_t = 0)]
    slot: usize,

    /// Alias of the polled directory (names the retrieve list)
    #[arg(long)]
    dir_alias: String,

    /// Source URL, e.g. ftp://user:pw@host/dir/
    #[arg(long)]
    url: String,

    /// File mask, repeatable; prefix ! for a negative mask
    #[arg(long = "mask")]
    masks: Vec<String>,

    /// Do not remember anything between passes
    #[arg(long, default_value_t = false)]
    stupid_mode: bool,

    /// Delete remote files once fetched
    #[arg(long, default_value_t = false)]
    remove: bool,

    /// Drop fetched files seen before within this many seconds
    #[arg(long)]
    dupcheck_timeout: Option<i64>,
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "petrel_ftp=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    let work_dir = match WorkDir::resolve(cli.work_dir) {
        Ok(wd) => wd,
        Err(e) => {
            tracing::error!("{}", e);
            return ExitCode::from(ExitStatus::Incorrect.code() as u8);
        }
    };
    let recipient = match Recipient::parse(&cli.url) {
        Ok(r) => r,
        Err(e) => {
            tracing::error!("bad source url: {}", e);
            return ExitCode::from(ExitStatus::Incorrect.code() as u8);
        }
    };
    let masks = if cli.masks.is_empty() {
        FileMasks::single_group(vec!["*".into()])
    } else {
        FileMasks::single_group(cli.masks)
    };

    let cfg = RetrieveConfig {
        work_dir,
        host_alias: cli.host_alias,
        slot: cli.slot,
        dir_alias: cli.dir_alias,
        recipient,
        masks,
        stupid_mode: cli.stupid_mode,
        remove: cli.remove,
        dupcheck_timeout: cli.dupcheck_timeout,
    };

    let status = retrieve::run(&cfg).await;
    ExitCode::from(status.code() as u8)
}
