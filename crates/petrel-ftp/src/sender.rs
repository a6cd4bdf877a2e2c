//! The outbound FTP send protocol.
//!
//! One call to [`run`] serves one authenticated connection: log in,
//! walk the job's spooled files, stream each one with the configured
//! lock discipline and resume semantics, keep the shared status area
//! honest after every file, then ask the dispatcher for another job on
//! the same connection before hanging up.

use std::io::{Read, Seek, SeekFrom};
use std::path::Path;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use petrel_core::{ExitStatus, FileSizeOffset, FTP_CTRL_KEEP_ALIVE_INTERVAL};
use petrel_core::types::special_flag;
use petrel_core::ConnectStatus;
use petrel_msg::message;
use petrel_msg::options::{FtpMode, LockMode, RestartFile};

use crate::archive::Archiver;
use crate::burst;
use crate::control::{Control, FtpError, FtpResult};
use crate::data::DataChannel;
use crate::session::SfSession;
use crate::TransferType;

/// Sentinel uploaded for LOCKFILE mode.
const LOCK_FILENAME: &str = ".lock";

/// Server wording that triggers the busy-rename retry. Which servers
/// say exactly this is folklore; the match is a plain substring.
const FILE_BUSY_MSG: &str = "Cannot open or remove a file containing a running program.";

/// Blocks between two looks at the keep-alive clock.
const KEEP_ALIVE_BLOCK_INTERVAL: u32 = 40;

/// One spooled file waiting to be sent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpoolFile {
    pub name: String,
    pub size: i64,
    pub mtime: i64,
}

/// List the job's spool directory in deposit order (mtime, then name).
pub fn collect_files(dir: &Path) -> std::io::Result<Vec<SpoolFile>> {
    let mut files = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let meta = entry.metadata()?;
        if !meta.is_file() {
            continue;
        }
        let Ok(name) = entry.file_name().into_string() else {
            tracing::warn!(path = %entry.path().display(), "skipping non-UTF-8 file name");
            continue;
        };
        let mtime = meta
            .modified()
            .ok()
            .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
            .map(|d| d.as_secs() as i64)
            .unwrap_or(0);
        files.push(SpoolFile {
            name,
            size: meta.len() as i64,
            mtime,
        });
    }
    files.sort_by(|a, b| a.mtime.cmp(&b.mtime).then_with(|| a.name.cmp(&b.name)));
    Ok(files)
}

/// The name a file is uploaded under before it is complete.
pub fn initial_name(lock: &LockMode, lock_postfix: Option<&str>, final_name: &str) -> String {
    match lock {
        LockMode::Dot | LockMode::DotVms => format!(".{final_name}"),
        LockMode::Custom(notation) => format!("{notation}{final_name}"),
        LockMode::Postfix => {
            let postfix = lock_postfix.unwrap_or(".lck");
            format!("{final_name}{postfix}")
        }
        _ => final_name.to_string(),
    }
}

/// `<SOH><CR><CR><LF>` + the file name with `_`, `-` and blank runs
/// collapsed to single blanks (stopping at `;`) + `<CR><CR><LF>`.
pub fn bulletin_header(file_name: &str) -> Vec<u8> {
    let mut header = vec![1u8, b'\r', b'\r', b'\n'];
    for c in file_name.bytes() {
        match c {
            b'\0' | b';' => break,
            b'_' | b'-' | b' ' => header.push(b' '),
            other => header.push(other),
        }
    }
    header.extend_from_slice(b"\r\r\n");
    header
}

pub fn bulletin_trailer() -> [u8; 4] {
    [b'\r', b'\r', b'\n', 3]
}

/// The fixed 32-byte envelope some downstream systems expect in front
/// of the payload: origin address, destination environment, size and
/// modification time, zero padded.
pub fn eumetsat_header(envelope: &[u8; 5], file_size: i64, mtime: i64) -> [u8; 32] {
    let mut header = [0u8; 32];
    header[..5].copy_from_slice(envelope);
    header[5..13].copy_from_slice(&(file_size as u64).to_be_bytes());
    header[13..21].copy_from_slice(&(mtime as u64).to_be_bytes());
    header
}

/// Read the size out of one LIST line: split at whitespace and take
/// the decimal token at `offset`. Servers disagree about LIST columns,
/// which is exactly why the index is per-host configuration.
pub fn list_line_size(line: &str, offset: usize) -> Option<i64> {
    let token = line.split_whitespace().nth(offset)?;
    let digits: String = token.chars().take_while(|c| c.is_ascii_digit()).collect();
    if digits.is_empty() {
        None
    } else {
        digits.parse().ok()
    }
}

fn is_epipe(e: &FtpError) -> bool {
    matches!(e, FtpError::Io(io) if io.kind() == std::io::ErrorKind::BrokenPipe)
}

/// Terminal failure: log, read the server's explanation after a broken
/// pipe, send QUIT when the connection is still usable, and map to the
/// process exit status. A latched timeout always wins the mapping.
async fn fail(mut control: Control, e: &FtpError, status: ExitStatus) -> ExitStatus {
    let timed = control.timed_out() || matches!(e, FtpError::Timeout);
    if is_epipe(e) {
        // The peer closed on us; whatever it said last is on the
        // control channel. No QUIT either, the connection is gone.
        if control.read_reply().await.is_ok() {
            tracing::error!(server = control.last_reply(), "server closed the data connection");
        }
    } else if !timed {
        let _ = control.quit().await;
    }
    if timed {
        ExitStatus::TimeoutError
    } else {
        status
    }
}

/// Open the remote file, retrying once under a mangled name when the
/// server reports the target busy.
async fn open_remote(
    control: &mut Control,
    passive: bool,
    verb: &str,
    name: &mut String,
    rename_file_busy: Option<char>,
) -> FtpResult<DataChannel> {
    let command = format!("{verb} {name}");
    let first = if passive {
        DataChannel::open_passive(control, &command).await
    } else {
        DataChannel::open_active(control, &command).await
    };
    match first {
        Ok(channel) => Ok(channel),
        Err(e) => {
            let Some(busy_char) = rename_file_busy else {
                return Err(e);
            };
            if control.timed_out() || !control.last_reply().contains(FILE_BUSY_MSG) {
                return Err(e);
            }
            name.push(busy_char);
            tracing::warn!(name = %name, "remote file busy, retrying under longer name");
            let command = format!("STOR {name}");
            if passive {
                DataChannel::open_passive(control, &command).await
            } else {
                DataChannel::open_active(control, &command).await
            }
        }
    }
}

/// Fetch one LIST line for `name` over a fresh data connection.
async fn list_single(control: &mut Control, passive: bool, name: &str) -> FtpResult<String> {
    let command = format!("LIST {name}");
    let channel = if passive {
        DataChannel::open_passive(control, &command).await?
    } else {
        DataChannel::open_active(control, &command).await?
    };
    let data = channel.read_to_end(control).await?;
    Ok(String::from_utf8_lossy(&data).trim().to_string())
}

/// Find the remote size of a partly sent file, per the host's size
/// policy. Probe failures only disable resume for this file.
async fn discover_remote_size(
    control: &mut Control,
    passive: bool,
    policy: FileSizeOffset,
    name: &str,
) -> i64 {
    match policy {
        FileSizeOffset::Disabled => 0,
        FileSizeOffset::Auto => match control.size(name).await {
            Ok(Some(size)) => size as i64,
            Ok(None) => 0,
            Err(e) => {
                tracing::debug!(name, "SIZE probe failed: {}", e);
                control.clear_timeout();
                0
            }
        },
        FileSizeOffset::ListToken(idx) => match list_single(control, passive, name).await {
            Ok(line) if !line.is_empty() => match list_line_size(&line, idx as usize) {
                Some(size) => size,
                None => {
                    tracing::warn!(line, "file size offset looks too large for this server");
                    0
                }
            },
            Ok(_) => 0,
            Err(e) => {
                tracing::debug!(name, "LIST probe failed: {}", e);
                control.clear_timeout();
                0
            }
        },
    }
}

struct KeepAlive {
    enabled: bool,
    blocks: u32,
    last: Instant,
}

impl KeepAlive {
    fn new(enabled: bool) -> Self {
        Self {
            enabled,
            blocks: 0,
            last: Instant::now(),
        }
    }

    /// Probe the control channel with STAT every so many blocks, but
    /// only when the interval elapsed and every earlier probe worked.
    async fn tick(&mut self, control: &mut Control) {
        if !self.enabled {
            return;
        }
        self.blocks += 1;
        if self.blocks <= KEEP_ALIVE_BLOCK_INTERVAL {
            return;
        }
        self.blocks = 0;
        if self.last.elapsed() < Duration::from_secs(FTP_CTRL_KEEP_ALIVE_INTERVAL) {
            return;
        }
        self.last = Instant::now();
        if let Err(e) = control.stat_keepalive().await {
            tracing::warn!("keep-alive STAT failed, disabling: {}", e);
            control.clear_timeout();
            self.enabled = false;
        }
    }
}

/// Drive one sender process: connect, send every queued job for this
/// host that the dispatcher hands us, disconnect. The returned status
/// is the process exit code.
pub async fn run(session: &mut SfSession) -> ExitStatus {
    let (hostname, port, transfer_timeout, passive_host, fso_raw) = {
        let host = session.fsa.host(session.host_idx());
        (
            host.active_hostname().to_string(),
            session.job.message.recipient.port_or_default(),
            Duration::from_secs(host.transfer_timeout.max(1) as u64),
            host.special_flag & special_flag::FTP_PASSIVE_MODE != 0,
            host.file_size_offset,
        )
    };
    let size_policy = FileSizeOffset::from_raw(fso_raw);
    let block_size = session.block_size();

    let (mut control, greeting) =
        match Control::connect(&hostname, port, transfer_timeout).await {
            Ok(ok) => ok,
            Err(e) => {
                tracing::error!(host = %hostname, port, "connection failed: {}", e);
                return if matches!(e, FtpError::Timeout) {
                    ExitStatus::TimeoutError
                } else {
                    ExitStatus::ConnectError
                };
            }
        };
    tracing::debug!(host = %hostname, greeting, "connected");

    let mut logged_in = greeting == 230;
    let mut type_pending = true;
    let mut cwd_pending = true;
    let mut login_pending = true;
    let mut exit_status = ExitStatus::TransferSuccess;

    loop {
        let passive = passive_host
            || session.job.message.options.ftp_mode == Some(FtpMode::Passive);

        // ---- login -----------------------------------------------------
        if login_pending && !logged_in {
            let user = session.job.message.recipient.user.clone();
            match control.user(&user).await {
                Ok(230) => logged_in = true,
                Ok(_) => {
                    let password = session
                        .job
                        .message
                        .recipient
                        .password
                        .clone()
                        .unwrap_or_default();
                    if let Err(e) = control.pass(&password).await {
                        tracing::error!(user = %user, "login rejected: {}", e);
                        return fail(control, &e, ExitStatus::PasswordError).await;
                    }
                    logged_in = true;
                }
                Err(e) => {
                    let reused = session.burst_count > 0;
                    let rejected_reuse =
                        matches!(e.reply_code(), Some(500) | Some(530)) && reused;
                    if !rejected_reuse {
                        tracing::error!(user = %user, "USER rejected: {}", e);
                        return fail(control, &e, ExitStatus::UserError).await;
                    }
                    // The server refuses a second USER on one
                    // connection. Log out and start over.
                    tracing::debug!("server refuses re-login, reconnecting for burst");
                    if let Err(e) = control.quit().await {
                        tracing::warn!("failed to log out for reconnect: {}", e);
                        return ExitStatus::QuitError;
                    }
                    let (fresh, code) =
                        match Control::connect(&hostname, port, transfer_timeout).await {
                            Ok(ok) => ok,
                            Err(e) => {
                                tracing::error!(host = %hostname, "reconnect failed: {}", e);
                                return if matches!(e, FtpError::Timeout) {
                                    ExitStatus::TimeoutError
                                } else {
                                    ExitStatus::ConnectError
                                };
                            }
                        };
                    control = fresh;
                    logged_in = code == 230;
                    if !logged_in {
                        match control.user(&user).await {
                            Ok(230) => logged_in = true,
                            Ok(_) => {
                                let password = session
                                    .job
                                    .message
                                    .recipient
                                    .password
                                    .clone()
                                    .unwrap_or_default();
                                if let Err(e) = control.pass(&password).await {
                                    return fail(control, &e, ExitStatus::PasswordError).await;
                                }
                                logged_in = true;
                            }
                            Err(e) => {
                                return fail(control, &e, ExitStatus::UserError).await;
                            }
                        }
                    }
                    // A fresh connection starts in ASCII mode and in
                    // the login directory.
                    type_pending = true;
                    cwd_pending = true;
                }
            }
        }
        login_pending = false;

        // ---- transfer type --------------------------------------------
        if type_pending {
            let type_char = session.job.transfer_type.command_char();
            if let Err(e) = control.transfer_type(type_char).await {
                tracing::error!(%type_char, "failed to set transfer type: {}", e);
                return fail(control, &e, ExitStatus::TypeError).await;
            }
            type_pending = false;
        }

        // ---- working directory ----------------------------------------
        if cwd_pending {
            if let Some(dir) = session.job.message.recipient.target_dir() {
                if let Err(e) = control.cwd(&dir).await {
                    tracing::error!(dir = %dir, "failed to change directory: {}", e);
                    return fail(control, &e, ExitStatus::ChdirError).await;
                }
            }
            cwd_pending = false;
        }

        // ---- collect the job's files ----------------------------------
        let file_dir = session.job.file_dir(&session.work_dir);
        let mut files = match collect_files(&file_dir) {
            Ok(files) => files,
            Err(e) => {
                tracing::error!(dir = %file_dir.display(), "cannot read spool directory: {}", e);
                let _ = control.quit().await;
                return ExitStatus::OpenLocalError;
            }
        };
        if let Some(age_limit) = session.job.message.options.age_limit_secs {
            files = apply_age_limit(session, &file_dir, files, age_limit);
        }
        let total_bytes: i64 = files.iter().map(|f| f.size).sum();

        session.refresh();
        if session.burst_count == 0 {
            session.mark_connected(files.len() as i32, total_bytes);
        } else {
            session.mark_bursting(files.len() as i32, total_bytes);
        }

        // ---- session lock file ----------------------------------------
        if session.job.message.options.lock == LockMode::Lockfile {
            let channel = match open_remote(
                &mut control,
                passive,
                "STOR",
                &mut LOCK_FILENAME.to_string(),
                None,
            )
            .await
            {
                Ok(channel) => channel,
                Err(e) => {
                    tracing::error!("failed to create remote lock file: {}", e);
                    return fail(control, &e, ExitStatus::WriteLockError).await;
                }
            };
            if let Err(e) = channel.close(&mut control, true).await {
                tracing::error!("failed to close remote lock file: {}", e);
                return fail(control, &e, ExitStatus::CloseRemoteError).await;
            }
        }

        // ---- per-file loop --------------------------------------------
        let restart_list = session.job.message.options.restart_files.clone();
        let mut appended_here = 0u32;
        let mut buffer = vec![0u8; block_size];

        'files: for file in &files {
            if session.shutdown_requested() {
                return ExitStatus::GotKilled;
            }
            let fullname = file_dir.join(&file.name);
            session.refresh();

            // Duplicate-in-flight guard: two slots of one host must
            // never stream the same name at once.
            if !session.host_gone {
                let idx = session.host_idx();
                let slot = session.slot;
                let claim_needed = session.fsa.host(idx).active_transfers > 1
                    && file.size > block_size as i64;
                if claim_needed {
                    let guard = session.fsa.lock_name_in_use(idx, slot);
                    let mut duplicate_of = None;
                    {
                        let record = session.fsa.host(idx);
                        let our_job = record.job_status[slot].job_id;
                        for j in 0..record.allowed_transfers.max(0) as usize {
                            if j != slot
                                && record.job_status[j].job_id == our_job
                                && record.job_status[j].file_name_in_use() == file.name
                            {
                                duplicate_of = Some(j);
                                break;
                            }
                        }
                    }
                    if let Some(other) = duplicate_of {
                        drop(guard);
                        tracing::warn!(
                            file = %file.name,
                            slot = other,
                            "file is already being transmitted by another slot, not sending again"
                        );
                        if let Err(e) = std::fs::remove_file(&fullname) {
                            tracing::warn!(path = %fullname.display(), "failed to unlink duplicate: {}", e);
                        }
                        let _ = session.fsa.retire_duplicate(idx, slot, file.size);
                        continue 'files;
                    }
                    let record = session.fsa.host_mut(idx);
                    record.job_status[slot].file_size_in_use = file.size;
                    record.job_status[slot].set_file_name_in_use(&file.name);
                    drop(guard);
                } else {
                    let record = session.fsa.host_mut(idx);
                    record.job_status[slot].file_size_in_use = file.size;
                    record.job_status[slot].set_file_name_in_use(&file.name);
                }
            }

            let mut final_filename = file.name.clone();
            let opt_lock = session.job.message.options.lock.clone();
            let opt_rename_busy = session.job.message.options.rename_file_busy;
            let opt_eumetsat = session.job.message.options.eumetsat_header;
            let opt_name_is_header = session.job.message.options.file_name_is_header;
            let opt_chmod = session.job.message.options.chmod.clone();
            let opt_ftp_exec = session.job.message.options.ftp_exec.clone();
            let mut remote_name = initial_name(
                &opt_lock,
                session.job.message.options.lock_postfix.as_deref(),
                &final_filename,
            );

            // ---- append decision --------------------------------------
            let mut append_offset: i64 = 0;
            let mut was_restart = false;
            if size_policy.enabled() && !restart_list.is_empty() {
                if in_restart_list(&restart_list, &final_filename) {
                    was_restart = true;
                    append_offset =
                        discover_remote_size(&mut control, passive, size_policy, &remote_name)
                            .await;
                    if append_offset > 0 && !session.host_gone {
                        let idx = session.host_idx();
                        let slot = session.slot;
                        let js = &mut session.fsa.host_mut(idx).job_status[slot];
                        js.file_size_done += append_offset;
                        js.file_size_in_use_done = append_offset;
                    }
                }
            }

            let mut sent_bytes: i64 = 0;
            if append_offset < file.size || file.size == 0 {
                let verb = if append_offset > 0 { "APPE" } else { "STOR" };
                let mut channel = match open_remote(
                    &mut control,
                    passive,
                    verb,
                    &mut remote_name,
                    opt_rename_busy,
                )
                .await
                {
                    Ok(channel) => channel,
                    Err(e) => {
                        tracing::error!(file = %remote_name, "failed to open remote file: {}", e);
                        return fail(control, &e, ExitStatus::OpenRemoteError).await;
                    }
                };

                let mut local = match std::fs::File::open(&fullname) {
                    Ok(f) => f,
                    Err(e) => {
                        tracing::error!(path = %fullname.display(), "failed to open local file: {}", e);
                        let _ = control.quit().await;
                        return ExitStatus::OpenLocalError;
                    }
                };
                if append_offset > 0 {
                    if let Err(e) = local.seek(SeekFrom::Start(append_offset as u64)) {
                        tracing::warn!(path = %fullname.display(), "seek failed, sending whole file: {}", e);
                        append_offset = 0;
                    } else {
                        session.append_total += 1;
                        appended_here += 1;
                        tracing::debug!(file = %final_filename, offset = append_offset, "appending");
                    }
                }

                let ascii = session.job.transfer_type == TransferType::Ascii;
                let mut keep_alive = KeepAlive::new(
                    session.fsa.host(session.host_idx()).special_flag
                        & special_flag::STAT_KEEPALIVE
                        != 0,
                );

                // ---- envelope headers ---------------------------------
                if append_offset == 0 {
                    if let Some(envelope) = &opt_eumetsat {
                        let header = eumetsat_header(envelope, file.size, file.mtime);
                        if let Err(e) = channel.write_block(&mut control, &header, false).await {
                            tracing::error!(file = %remote_name, "failed to write envelope header: {}", e);
                            return fail(control, &e, ExitStatus::WriteRemoteError).await;
                        }
                        bump_sent(session, header.len() as i64);
                    }
                    if opt_name_is_header {
                        let header = bulletin_header(&final_filename);
                        if let Err(e) = channel.write_block(&mut control, &header, ascii).await {
                            tracing::error!(file = %remote_name, "failed to write bulletin header: {}", e);
                            return fail(control, &e, ExitStatus::WriteRemoteError).await;
                        }
                        bump_sent(session, header.len() as i64);
                    }
                }

                // ---- stream the file ----------------------------------
                loop {
                    let n = match local.read(&mut buffer) {
                        Ok(n) => n,
                        Err(e) => {
                            tracing::error!(path = %fullname.display(), "local read failed: {}", e);
                            let _ = control.quit().await;
                            return ExitStatus::ReadLocalError;
                        }
                    };
                    if n == 0 {
                        break;
                    }
                    if let Err(e) = channel.write_block(&mut control, &buffer[..n], ascii).await {
                        tracing::error!(
                            file = %remote_name,
                            bytes = n,
                            "failed to write to remote file: {}", e
                        );
                        return fail(control, &e, ExitStatus::WriteRemoteError).await;
                    }
                    sent_bytes += n as i64;
                    if !session.host_gone {
                        session.refresh();
                        if !session.host_gone {
                            let idx = session.host_idx();
                            let slot = session.slot;
                            let js = &mut session.fsa.host_mut(idx).job_status[slot];
                            js.file_size_in_use_done = sent_bytes + append_offset;
                            js.file_size_done += n as i64;
                            js.bytes_send += n as u64;
                        }
                    }
                    keep_alive.tick(&mut control).await;
                    if n < buffer.len() {
                        break;
                    }
                }

                // Files are supposed to arrive complete; a size change
                // means the producer did not deposit in dot notation.
                if sent_bytes + append_offset != file.size {
                    tracing::warn!(
                        file = %final_filename,
                        expected = file.size,
                        actual = sent_bytes + append_offset,
                        "file size changed during transfer, sender does not use dot notation"
                    );
                }
                drop(local);

                if opt_name_is_header {
                    let trailer = bulletin_trailer();
                    if let Err(e) = channel.write_block(&mut control, &trailer, ascii).await {
                        tracing::error!(file = %remote_name, "failed to write bulletin trailer: {}", e);
                        return fail(control, &e, ExitStatus::WriteRemoteError).await;
                    }
                    bump_sent(session, trailer.len() as i64);
                }

                // ---- close data ---------------------------------------
                let tolerate = file.size == 0;
                if let Err(e) = channel.close(&mut control, tolerate).await {
                    tracing::error!(file = %remote_name, "failed to close remote file: {}", e);
                    return fail(control, &e, ExitStatus::CloseRemoteError).await;
                }

                // ---- post-transfer remote operations ------------------
                if let Some(mode) = &opt_chmod {
                    if let Err(e) = control.chmod(mode, &remote_name).await {
                        tracing::warn!(file = %remote_name, "SITE CHMOD failed: {}", e);
                        control.clear_timeout();
                    }
                }
            }

            // ---- rename into final name -------------------------------
            if opt_lock.renames_after_transfer() {
                if opt_lock == LockMode::DotVms {
                    final_filename.push('.');
                }
                if let Err(e) = control.rename(&remote_name, &final_filename).await {
                    tracing::error!(
                        from = %remote_name,
                        to = %final_filename,
                        "failed to rename remote file: {}", e
                    );
                    return fail(control, &e, ExitStatus::MoveRemoteError).await;
                }
                if opt_lock == LockMode::DotVms {
                    final_filename.pop();
                }
            }

            // ---- ready file -------------------------------------------
            if matches!(opt_lock, LockMode::ReadyA | LockMode::ReadyB) {
                let ready_type = if opt_lock == LockMode::ReadyA { 'A' } else { 'B' };
                let ready_name = format!("{final_filename}_rdy");
                let contents =
                    format!("{remote_name} {ready_type} U\n$$end_of_ready_file\n");
                let mut name = ready_name.clone();
                let channel =
                    match open_remote(&mut control, passive, "STOR", &mut name, None).await {
                        Ok(channel) => channel,
                        Err(e) => {
                            tracing::error!(file = %ready_name, "failed to open ready file: {}", e);
                            return fail(control, &e, ExitStatus::OpenRemoteError).await;
                        }
                    };
                let mut channel = channel;
                if let Err(e) = channel
                    .write_block(&mut control, contents.as_bytes(), false)
                    .await
                {
                    tracing::error!(file = %ready_name, "failed to write ready file: {}", e);
                    return fail(control, &e, ExitStatus::WriteRemoteError).await;
                }
                if let Err(e) = channel.close(&mut control, false).await {
                    tracing::error!(file = %ready_name, "failed to close ready file: {}", e);
                    return fail(control, &e, ExitStatus::CloseRemoteError).await;
                }
            }

            // ---- remote exec ------------------------------------------
            if let Some(cmd) = &opt_ftp_exec {
                if let Err(e) = control.site(&format!("{cmd} {final_filename}")).await {
                    tracing::warn!(cmd = %cmd, "SITE exec failed: {}", e);
                    control.clear_timeout();
                }
            }

            // ---- book-keeping -----------------------------------------
            session.refresh();
            if !session.host_gone {
                let idx = session.host_idx();
                let slot = session.slot;
                if let Err(e) =
                    session
                        .fsa
                        .record_file_done(idx, slot, file.size, sent_bytes as u64)
                {
                    tracing::warn!("status bookkeeping failed: {}", e);
                }
                let work_dir = session.work_dir.clone();
                match session.fsa.first_good_transfer(idx, slot, || {
                    let path = work_dir.fifo(petrel_core::FD_WAKE_UP_FIFO);
                    if let Err(e) = petrel_status::fifo::notify_wakeup(&path) {
                        tracing::warn!("failed to wake dispatcher: {}", e);
                    }
                }) {
                    Ok(true) => tracing::debug!(host = %session.host_alias, "error counter cleared"),
                    Ok(false) => {}
                    Err(e) => tracing::warn!("error counter reset failed: {}", e),
                }
            }

            if session.job.message.options.output_log {
                tracing::info!(
                    host = %session.host_alias,
                    job = session.job.job_id,
                    file = %final_filename,
                    bytes = sent_bytes + append_offset,
                    appended = append_offset > 0,
                    "file delivered"
                );
            }

            if was_restart {
                let msg_path = session.work_dir.msg_file(session.job.job_id);
                if let Err(e) = message::remove_append(&msg_path, &final_filename) {
                    tracing::warn!(file = %final_filename, "failed to trim restart list: {}", e);
                }
            }

            // ---- local exec -------------------------------------------
            if let Some(cmd) = session.job.message.options.trans_exec.clone() {
                run_trans_exec(&cmd, &fullname).await;
            }

            // ---- archive or unlink ------------------------------------
            archive_or_unlink(session, &fullname, &final_filename);
        }

        // ---- job epilogue ---------------------------------------------
        if session.job.message.options.lock == LockMode::Lockfile
            && !session.host_gone
            && session.fsa.host(session.host_idx()).active_transfers == 1
        {
            if let Err(e) = control.dele(LOCK_FILENAME).await {
                tracing::error!("failed to remove remote lock file: {}", e);
                return fail(control, &e, ExitStatus::RemoveLockfileError).await;
            }
        }

        // Stale restart names would otherwise survive in the message
        // forever once their files are gone.
        if !restart_list.is_empty()
            && appended_here as usize != restart_list.len()
            && !session.host_gone
            && session.fsa.host(session.host_idx()).total_file_counter == 0
        {
            let msg_path = session.work_dir.msg_file(session.job.job_id);
            if let Err(e) = message::remove_all_appends(&msg_path) {
                tracing::warn!("failed to clear restart list: {}", e);
            }
        }

        if let Err(e) = std::fs::remove_dir(&file_dir) {
            tracing::error!(dir = %file_dir.display(), "failed to remove spool directory: {}", e);
            exit_status = ExitStatus::StillFilesToSend;
        }

        // ---- burst continuation ---------------------------------------
        match burst::next_job(session).await {
            Some(changed) => {
                session.burst_count += 1;
                if changed.transfer_type {
                    type_pending = true;
                }
                if changed.target_dir {
                    cwd_pending = true;
                }
                if changed.user {
                    logged_in = false;
                    login_pending = true;
                }
                continue;
            }
            None => break,
        }
    }

    if !session.host_gone {
        let idx = session.host_idx();
        let slot = session.slot;
        session.fsa.host_mut(idx).job_status[slot].set_connect_status(ConnectStatus::Closing);
    }

    if let Err(e) = control.quit().await {
        // Everything was sent; a botched goodbye is only log noise.
        tracing::warn!("failed to log out: {}", e);
    }
    exit_status
}

fn bump_sent(session: &mut SfSession, bytes: i64) {
    if session.host_gone {
        return;
    }
    let idx = session.host_idx();
    let slot = session.slot;
    let js = &mut session.fsa.host_mut(idx).job_status[slot];
    js.file_size_done += bytes;
    js.bytes_send += bytes as u64;
}

/// Drop files the job's age limit says are no longer worth sending.
fn apply_age_limit(
    session: &mut SfSession,
    dir: &Path,
    files: Vec<SpoolFile>,
    age_limit: u64,
) -> Vec<SpoolFile> {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0);
    let mut kept = Vec::with_capacity(files.len());
    for file in files {
        if now - file.mtime > age_limit as i64 {
            tracing::info!(file = %file.name, age = now - file.mtime, "file over age limit, dropped");
            if let Err(e) = std::fs::remove_file(dir.join(&file.name)) {
                tracing::warn!(file = %file.name, "failed to unlink old file: {}", e);
            }
            if !session.host_gone {
                let idx = session.host_idx();
                let slot = session.slot;
                let _ = session.fsa.retire_duplicate(idx, slot, file.size);
            }
        } else {
            kept.push(file);
        }
    }
    kept
}

async fn run_trans_exec(cmd: &str, fullname: &Path) {
    match tokio::process::Command::new("sh")
        .arg("-c")
        .arg(format!("{cmd} {}", fullname.display()))
        .status()
        .await
    {
        Ok(status) if status.success() => {}
        Ok(status) => tracing::warn!(cmd, ?status, "post-transfer command failed"),
        Err(e) => tracing::warn!(cmd, "post-transfer command did not start: {}", e),
    }
}

/// After a successful send the local copy is either archived or gone;
/// leaving it would fill the spool.
fn archive_or_unlink(session: &mut SfSession, fullname: &Path, final_name: &str) {
    let archive_days = session.job.message.options.archive_days.unwrap_or(0);
    if archive_days > 0 {
        let mut archiver = Archiver::new(&session.work_dir);
        if archiver
            .archive(fullname, final_name, &session.job.msg_name, archive_days)
            .is_ok()
        {
            return;
        }
        tracing::error!(file = %final_name, "archiving failed, deleting instead");
    }
    if let Err(e) = std::fs::remove_file(fullname) {
        if e.kind() != std::io::ErrorKind::NotFound {
            tracing::error!(path = %fullname.display(), "failed to unlink sent file: {}", e);
        }
    }
}

/// True when `file` appears in the restart list with a matching name.
pub fn in_restart_list(restart: &[RestartFile], name: &str) -> bool {
    restart.iter().any(|r| r.name == name)
}
