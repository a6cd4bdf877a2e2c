//! Outbound FTP sender process.
//!
//! Spawned by the dispatcher, one process per connection: sends the
//! files of one job (and any burst continuations) to one host, then
//! exits with a documented status code.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use petrel_core::{ExitStatus, WorkDir};
use petrel_ftp::sender;
use petrel_ftp::session::{JobArgs, SfSession};

#[derive(Parser)]
#[command(name = "petrel-sf-ftp")]
#[command(about = "Petrel outbound FTP sender", long_about = None)]
#[command(version)]
struct Cli {
    /// Petrel work directory (defaults to $PETREL_WORK_DIR)
    #[arg(short, long)]
    work_dir: Option<PathBuf>,

    /// Host alias in the status area
    #[arg(long)]
    host_alias: String,

    /// Job-status slot this process owns
    #[arg(long)]
    slot: usize,

    /// Message name (spool directory under files/)
    #[arg(long)]
    msg_name: String,

    /// Job id (message file under msgs/)
    #[arg(long)]
    job_id: u32,

    /// The job comes from the error directory (a retry)
    #[arg(long, default_value_t = false)]
    error_file: bool,

    /// Connect to the toggled (secondary) real host
    #[arg(long, default_value_t = false)]
    toggle_host: bool,

    /// Transfer type: I (image), A (ascii) or D (treated as image)
    #[arg(long, default_value = "I")]
    transfer_type: char,
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

    let transfer_type = match cli.transfer_type.to_ascii_uppercase() {
        'A' => petrel_ftp::TransferType::Ascii,
        // 'D' (dot) transfers go over the wire as plain image data.
        'I' | 'D' => petrel_ftp::TransferType::Image,
        other => {
            tracing::error!("unknown transfer type `{}`", other);
            return ExitCode::from(ExitStatus::Incorrect.code() as u8);
        }
    };

    let args = JobArgs {
        work_dir,
        host_alias: cli.host_alias,
        slot: cli.slot,
        msg_name: cli.msg_name,
        job_id: cli.job_id,
        error_file: cli.error_file,
        toggle_host: cli.toggle_host,
        transfer_type,
    };

    // SIGINT/SIGTERM only raise a flag; the transfer loop notices it
    // between blocks and unwinds through the session drop, which
    // resets the status slot and tells the dispatcher.
    let shutdown = Arc::new(AtomicBool::new(false));
    for signal_kind in [
        tokio::signal::unix::SignalKind::interrupt(),
        tokio::signal::unix::SignalKind::terminate(),
    ] {
        let flag = shutdown.clone();
        match tokio::signal::unix::signal(signal_kind) {
            Ok(mut stream) => {
                tokio::spawn(async move {
                    stream.recv().await;
                    flag.store(true, Ordering::Relaxed);
                });
            }
            Err(e) => {
                tracing::error!("cannot install signal handler: {}", e);
                return ExitCode::from(ExitStatus::Incorrect.code() as u8);
            }
        }
    }

    let mut session = match SfSession::open(&args, shutdown) {
        Ok(session) => session,
        Err(e) => {
            tracing::error!("cannot start transfer session: {}", e);
            return ExitCode::from(ExitStatus::Incorrect.code() as u8);
        }
    };

    let status = sender::run(&mut session).await;
    session.set_exit_status(status);
    drop(session);

    ExitCode::from(status.code() as u8)
}
