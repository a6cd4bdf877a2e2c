//! End-to-end sender scenarios against the in-process mock server.

mod common;

use std::collections::HashMap;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::{Duration, Instant};

use common::{MockConfig, MockFtp};

use petrel_core::{ExitStatus, WorkDir};
use petrel_ftp::sender;
use petrel_ftp::session::{JobArgs, SfSession};
use petrel_ftp::TransferType;
use petrel_status::fsa::{self, FsaHandle, HostRecord};

struct Setup {
    _dir: tempfile::TempDir,
    work_dir: WorkDir,
}

fn host_record(alias: &str, allowed: i32, file_size_offset: i8) -> HostRecord {
    let mut record = HostRecord::zeroed();
    record.set_host_alias(alias);
    record.set_real_hostname(0, "127.0.0.1");
    record.allowed_transfers = allowed;
    record.max_errors = 10;
    record.retry_interval = 30;
    record.block_size = 1024;
    record.transfer_timeout = 10;
    record.file_size_offset = file_size_offset;
    record
}

fn setup(records: &[HostRecord]) -> Setup {
    let dir = tempfile::tempdir().unwrap();
    let work_dir = WorkDir::new(dir.path());
    work_dir.create_all().unwrap();
    fsa::publish(&work_dir, records).unwrap();
    Setup {
        _dir: dir,
        work_dir,
    }
}

fn write_message(work_dir: &WorkDir, job_id: u32, port: u16, options: &str) {
    let text = if options.is_empty() {
        format!("[destination]\nftp://u:p@srv:{port}/out/\n")
    } else {
        format!("[destination]\nftp://u:p@srv:{port}/out/\n\n[options]\n{options}")
    };
    std::fs::write(work_dir.msg_file(job_id), text).unwrap();
}

fn spool_file(work_dir: &WorkDir, msg_name: &str, file: &str, contents: &[u8]) {
    let dir = work_dir.job_file_dir(msg_name);
    std::fs::create_dir_all(&dir).unwrap();
    std::fs::write(dir.join(file), contents).unwrap();
}

fn job_args(work_dir: &WorkDir, slot: usize, msg_name: &str, job_id: u32) -> JobArgs {
    JobArgs {
        work_dir: work_dir.clone(),
        host_alias: "h1".into(),
        slot,
        msg_name: msg_name.into(),
        job_id,
        error_file: false,
        toggle_host: false,
        transfer_type: TransferType::Image,
    }
}

async fn run_sender(args: JobArgs) -> ExitStatus {
    let mut session = SfSession::open(&args, Arc::new(AtomicBool::new(false))).unwrap();
    let status = sender::run(&mut session).await;
    session.set_exit_status(status);
    status
}

fn command_positions(commands: &[String], wanted: &[&str]) -> Vec<usize> {
    wanted
        .iter()
        .map(|w| {
            commands
                .iter()
                .position(|c| c.starts_with(w))
                .unwrap_or_else(|| panic!("command `{w}` not sent; log: {commands:?}"))
        })
        .collect()
}

#[tokio::test]
async fn simple_stor() {
    let server = MockFtp::start(MockConfig::default()).await;
    let env = setup(&[host_record("h1", 5, -1)]);

    write_message(&env.work_dir, 1, server.addr.port(), "");
    spool_file(&env.work_dir, "1_0", "A", &vec![0x41u8; 4096]);
    {
        let mut fsa = FsaHandle::attach(&env.work_dir).unwrap();
        let h = fsa.host_mut(0);
        h.total_file_counter = 1;
        h.total_file_size = 4096;
    }

    let status = run_sender(job_args(&env.work_dir, 0, "1_0", 1)).await;
    assert_eq!(status, ExitStatus::TransferSuccess);

    // The wire conversation, in order.
    let commands = server.commands();
    let positions = command_positions(
        &commands,
        &["USER u", "PASS p", "TYPE I", "CWD /out", "PORT ", "STOR A", "QUIT"],
    );
    assert!(positions.windows(2).all(|w| w[0] < w[1]), "out of order: {commands:?}");

    assert_eq!(server.file("A").unwrap().len(), 4096);

    // Local spool cleaned up.
    assert!(!env.work_dir.job_file_dir("1_0").exists());

    // Status bookkeeping.
    let fsa = FsaHandle::attach(&env.work_dir).unwrap();
    let h = fsa.host(0);
    assert_eq!(h.file_counter_done, 1);
    assert_eq!(h.total_file_counter, 0);
    assert_eq!(h.total_file_size, 0);
    assert_eq!(h.bytes_send, 4096);
}

#[tokio::test]
async fn append_resume_uses_appe_and_seeks() {
    let mut config = MockConfig::default();
    config.sizes.insert("A".into(), 6000);
    let mut initial = HashMap::new();
    initial.insert("A".to_string(), vec![0x41u8; 6000]);
    let server = MockFtp::start_with_storage(config, initial).await;

    // AUTO size detection on the host.
    let env = setup(&[host_record("h1", 5, -2)]);
    write_message(
        &env.work_dir,
        2,
        server.addr.port(),
        "restart file A|12345\n",
    );
    let body: Vec<u8> = (0..10_000u32).map(|i| (i % 251) as u8).collect();
    spool_file(&env.work_dir, "2_0", "A", &body);
    {
        let mut fsa = FsaHandle::attach(&env.work_dir).unwrap();
        let h = fsa.host_mut(0);
        h.total_file_counter = 1;
        h.total_file_size = 10_000;
    }

    let status = run_sender(job_args(&env.work_dir, 0, "2_0", 2)).await;
    assert_eq!(status, ExitStatus::TransferSuccess);

    let commands = server.commands();
    assert!(server.saw("SIZE A"), "no SIZE probe: {commands:?}");
    assert!(server.saw("APPE A"), "no APPE: {commands:?}");
    assert!(!server.saw("STOR A"), "should not STOR: {commands:?}");

    // Remote file completed: old 6000 bytes plus the local tail.
    let remote = server.file("A").unwrap();
    assert_eq!(remote.len(), 10_000);
    assert_eq!(&remote[6000..], &body[6000..]);

    // The restart entry is consumed.
    let message = petrel_msg::Message::read(&env.work_dir.msg_file(2)).unwrap();
    assert!(message.options.restart_files.is_empty());
    assert!(!env.work_dir.job_file_dir("2_0").exists());
}

#[tokio::test]
async fn append_offset_equal_to_size_skips_file() {
    let mut config = MockConfig::default();
    config.sizes.insert("A".into(), 5000);
    let server = MockFtp::start(config).await;

    let env = setup(&[host_record("h1", 5, -2)]);
    write_message(&env.work_dir, 3, server.addr.port(), "restart file A|1\n");
    spool_file(&env.work_dir, "3_0", "A", &vec![0u8; 5000]);

    let status = run_sender(job_args(&env.work_dir, 0, "3_0", 3)).await;
    assert_eq!(status, ExitStatus::TransferSuccess);

    // Size already on the remote side: nothing is opened.
    assert!(server.saw("SIZE A"));
    assert!(!server.saw("APPE"));
    assert!(!server.saw("STOR A"));
    assert!(!env.work_dir.job_file_dir("3_0").exists());
}

#[tokio::test]
async fn duplicate_in_flight_is_not_sent_again() {
    let server = MockFtp::start(MockConfig::default()).await;
    let env = setup(&[host_record("h1", 2, -1)]);

    write_message(&env.work_dir, 7, server.addr.port(), "");
    spool_file(&env.work_dir, "7_1", "B", &vec![0u8; 4096]);
    {
        let mut fsa = FsaHandle::attach(&env.work_dir).unwrap();
        let h = fsa.host_mut(0);
        h.total_file_counter = 2;
        h.total_file_size = 8192;
        h.active_transfers = 2;
        // Slot 0 already claims file B for the same job.
        h.job_status[0].job_id = 7;
        h.job_status[0].set_file_name_in_use("B");
    }

    let status = run_sender(job_args(&env.work_dir, 1, "7_1", 7)).await;
    assert_eq!(status, ExitStatus::TransferSuccess);

    assert!(!server.saw("STOR B"), "duplicate was sent: {:?}", server.commands());
    assert!(server.file("B").is_none());

    let fsa = FsaHandle::attach(&env.work_dir).unwrap();
    let h = fsa.host(0);
    // Retired from the totals without transferring.
    assert_eq!(h.total_file_counter, 1);
    assert_eq!(h.total_file_size, 4096);
    assert_eq!(h.file_counter_done, 0);
}

#[tokio::test]
async fn ascii_mode_expands_line_endings_on_the_wire() {
    let server = MockFtp::start(MockConfig::default()).await;
    let env = setup(&[host_record("h1", 5, -1)]);

    write_message(&env.work_dir, 9, server.addr.port(), "");
    spool_file(&env.work_dir, "9_0", "A", b"line1\nline2\n");

    let mut args = job_args(&env.work_dir, 0, "9_0", 9);
    args.transfer_type = TransferType::Ascii;
    let status = run_sender(args).await;
    assert_eq!(status, ExitStatus::TransferSuccess);

    assert!(server.saw("TYPE A"), "{:?}", server.commands());
    assert_eq!(server.file("A").unwrap(), b"line1\r\nline2\r\n");
}

#[tokio::test]
async fn dot_lock_renames_after_transfer() {
    let server = MockFtp::start(MockConfig::default()).await;
    let env = setup(&[host_record("h1", 5, -1)]);

    write_message(&env.work_dir, 4, server.addr.port(), "lock DOT\n");
    spool_file(&env.work_dir, "4_0", "A", b"payload");

    let status = run_sender(job_args(&env.work_dir, 0, "4_0", 4)).await;
    assert_eq!(status, ExitStatus::TransferSuccess);

    let commands = server.commands();
    let positions = command_positions(&commands, &["STOR .A", "RNFR .A", "RNTO A"]);
    assert!(positions.windows(2).all(|w| w[0] < w[1]));
    assert_eq!(server.file("A").unwrap(), b"payload");
    assert!(server.file(".A").is_none());
}

#[tokio::test]
async fn first_good_transfer_clears_error_counter() {
    let server = MockFtp::start(MockConfig::default()).await;
    let env = setup(&[host_record("h1", 3, -1)]);

    write_message(&env.work_dir, 5, server.addr.port(), "");
    spool_file(&env.work_dir, "5_0", "A", b"x");
    {
        let mut fsa = FsaHandle::attach(&env.work_dir).unwrap();
        let h = fsa.host_mut(0);
        h.error_counter = 4;
        h.host_status |= petrel_core::types::host_status::AUTO_PAUSE_QUEUE;
        h.total_file_counter = 1;
        h.total_file_size = 1;
    }

    // Keep the wakeup fifo open like the real dispatcher does, so the
    // byte written by the ritual is still there to read.
    let wake = env.work_dir.fifo(petrel_core::FD_WAKE_UP_FIFO);
    petrel_status::fifo::ensure_fifo(&wake).unwrap();
    let mut fifo = petrel_status::fifo::open_rw(&wake).unwrap();

    let status = run_sender(job_args(&env.work_dir, 0, "5_0", 5)).await;
    assert_eq!(status, ExitStatus::TransferSuccess);

    let fsa = FsaHandle::attach(&env.work_dir).unwrap();
    let h = fsa.host(0);
    assert_eq!(h.error_counter, 0);
    assert_eq!(h.host_status & petrel_core::types::host_status::AUTO_PAUSE_QUEUE, 0);

    // The ritual woke the dispatcher through the fifo.
    assert!(petrel_status::fifo::drain_wakeups(&mut fifo).unwrap());
}

#[tokio::test]
async fn burst_reconnects_when_server_rejects_second_user() {
    let server = MockFtp::start(MockConfig {
        reject_second_user: true,
        ..Default::default()
    })
    .await;
    let env = setup(&[host_record("h1", 1, -1)]);

    // Job 1 as user u1.
    std::fs::write(
        env.work_dir.msg_file(1),
        format!(
            "[destination]\nftp://u1:p1@srv:{}/out/\n",
            server.addr.port()
        ),
    )
    .unwrap();
    spool_file(&env.work_dir, "1_0", "A1", b"first job payload");

    // Job 2 as user u2 into another directory, queued for burst.
    std::fs::write(
        env.work_dir.msg_file(2),
        format!(
            "[destination]\nftp://u2:p2@srv:{}/out2/\n",
            server.addr.port()
        ),
    )
    .unwrap();
    spool_file(&env.work_dir, "2_0", "A2", b"second job payload");

    {
        let mut fsa = FsaHandle::attach(&env.work_dir).unwrap();
        let h = fsa.host_mut(0);
        h.total_file_counter = 2;
        h.total_file_size = 17 + 18;
        h.active_transfers = 1;
        h.jobs_queued = 1;
    }

    // Stand in for the dispatcher: when the sender asks for more work
    // with its negative pid, fill the slot mailbox with job 2.
    let fin_path = env.work_dir.fifo(petrel_core::SF_FIN_FIFO);
    petrel_status::fifo::ensure_fifo(&fin_path).unwrap();
    let work_dir = env.work_dir.clone();
    let dispatcher = tokio::spawn(async move {
        let mut fin = petrel_status::fifo::open_rw(&fin_path).unwrap();
        let deadline = Instant::now() + Duration::from_secs(30);
        loop {
            let pids = petrel_status::fifo::drain_pids(&mut fin).unwrap();
            if pids.iter().any(|&p| p < 0) {
                let mut fsa = FsaHandle::attach(&work_dir).unwrap();
                let h = fsa.host_mut(0);
                h.jobs_queued = 0;
                let js = &mut h.job_status[0];
                js.job_id = 2;
                js.error_file = 0;
                js.set_unique_name("2_0");
                return true;
            }
            if Instant::now() > deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    });

    let status = run_sender(job_args(&env.work_dir, 0, "1_0", 1)).await;
    assert_eq!(status, ExitStatus::TransferSuccess);
    assert!(dispatcher.await.unwrap(), "sender never asked for burst work");

    let commands = server.commands();
    // USER u2 is first rejected on the old connection, then accepted
    // on a fresh one, with TYPE and CWD forced again.
    let u2_count = commands.iter().filter(|c| c.as_str() == "USER u2").count();
    assert_eq!(u2_count, 2, "expected rejected + fresh USER u2: {commands:?}");
    let positions = command_positions(
        &commands,
        &["USER u1", "STOR A1", "USER u2", "QUIT", "CWD /out2", "STOR A2"],
    );
    assert!(positions.windows(2).all(|w| w[0] < w[1]), "out of order: {commands:?}");
    let type_count = commands.iter().filter(|c| c.as_str() == "TYPE I").count();
    assert_eq!(type_count, 2);

    assert_eq!(server.file("A1").unwrap(), b"first job payload");
    assert_eq!(server.file("A2").unwrap(), b"second job payload");
    assert!(!env.work_dir.job_file_dir("1_0").exists());
    assert!(!env.work_dir.job_file_dir("2_0").exists());
}

#[tokio::test]
async fn no_burst_slot_hangs_up_instead_of_asking() {
    let server = MockFtp::start(MockConfig::default()).await;
    let mut record = host_record("h1", 1, -1);
    record.number_of_no_bursts = 1; // slot 0 is reserved non-bursting
    let env = setup(&[record]);

    write_message(&env.work_dir, 1, server.addr.port(), "");
    spool_file(&env.work_dir, "1_0", "A", b"payload");
    {
        let mut fsa = FsaHandle::attach(&env.work_dir).unwrap();
        let h = fsa.host_mut(0);
        h.total_file_counter = 1;
        h.total_file_size = 7;
        h.active_transfers = 1;
        // Work is queued, which would normally trigger a burst probe.
        h.jobs_queued = 1;
    }

    // Hold the fin fifo open so anything the sender writes survives.
    let fin_path = env.work_dir.fifo(petrel_core::SF_FIN_FIFO);
    petrel_status::fifo::ensure_fifo(&fin_path).unwrap();
    let mut fin = petrel_status::fifo::open_rw(&fin_path).unwrap();

    let status = run_sender(job_args(&env.work_dir, 0, "1_0", 1)).await;
    assert_eq!(status, ExitStatus::TransferSuccess);

    // One job, one QUIT, and no negative-pid burst request.
    assert!(server.saw("QUIT"));
    let pids = petrel_status::fifo::drain_pids(&mut fin).unwrap();
    assert!(!pids.is_empty(), "sender never reported done");
    assert!(pids.iter().all(|&p| p > 0), "no-burst slot asked for work: {pids:?}");
}

#[tokio::test]
async fn data_connection_refused_gives_up_after_retries() {
    let server = MockFtp::start(MockConfig {
        never_connect_data: true,
        ..Default::default()
    })
    .await;
    let env = setup(&[host_record("h1", 5, -1)]);

    write_message(&env.work_dir, 6, server.addr.port(), "");
    spool_file(&env.work_dir, "6_0", "A", b"x");

    let status = run_sender(job_args(&env.work_dir, 0, "6_0", 6)).await;
    assert_eq!(status, ExitStatus::OpenRemoteError);

    // One initial attempt plus the bounded retries.
    let stor_count = server.commands().iter().filter(|c| c.starts_with("STOR A")).count();
    assert_eq!(stor_count as u32, 1 + petrel_core::MAX_DATA_CONNECT_RETRIES);
}

#[tokio::test]
async fn stalled_data_connection_times_out_at_twice_the_deadline() {
    let server = MockFtp::start(MockConfig {
        stall_data: true,
        ..Default::default()
    })
    .await;
    let mut record = host_record("h1", 5, -1);
    record.transfer_timeout = 1;
    let env = setup(&[record]);

    write_message(&env.work_dir, 8, server.addr.port(), "");
    spool_file(&env.work_dir, "8_0", "A", b"x");

    let started = Instant::now();
    let status = run_sender(job_args(&env.work_dir, 0, "8_0", 8)).await;
    let elapsed = started.elapsed();

    assert_eq!(status, ExitStatus::TimeoutError);
    assert!(elapsed >= Duration::from_secs(2), "accept gave up too early: {elapsed:?}");
    // No QUIT after a timeout; the kernel drains the socket.
    assert!(!server.saw("QUIT"), "{:?}", server.commands());
}
