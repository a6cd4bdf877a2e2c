//! The inbound FTP retrieve driver.
//!
//! Poll one remote directory: ask for an NLST, filter it through the
//! directory's mask groups, diff it against the retrieve list, then
//! fetch everything still outstanding into the local incoming
//! directory. Files land under a dotted temporary name and are renamed
//! into place only when complete, so downstream pickups never see a
//! partial file.

use std::io::Write;
use std::time::Duration;

use petrel_core::{ConnectStatus, ExitStatus, WorkDir};
use petrel_msg::Recipient;
use petrel_status::dupcheck::DupFlag;
use petrel_status::retrieve_list::RetrieveEntry;
use petrel_status::{DupStore, FsaHandle, RetrieveList};

use crate::control::{Control, FtpError};
use crate::data::DataChannel;

/// Filter masks for one polled directory, in groups. Within a group
/// the first positive match accepts the file; a negative mask (leading
/// `!`) that matches rejects it and skips the rest of the group.
#[derive(Debug, Clone, Default)]
pub struct FileMasks {
    groups: Vec<Vec<String>>,
}

impl FileMasks {
    pub fn new(groups: Vec<Vec<String>>) -> Self {
        Self { groups }
    }

    /// One flat list as a single group.
    pub fn single_group(masks: Vec<String>) -> Self {
        Self { groups: vec![masks] }
    }

    pub fn is_empty(&self) -> bool {
        self.groups.iter().all(|g| g.is_empty())
    }

    pub fn matches(&self, name: &str) -> bool {
        for group in &self.groups {
            for mask in group {
                let (negative, pattern) = match mask.strip_prefix('!') {
                    Some(rest) => (true, rest),
                    None => (false, mask.as_str()),
                };
                let hit = glob::Pattern::new(pattern)
                    .map(|p| p.matches(name))
                    .unwrap_or(false);
                if hit {
                    if negative {
                        // Definitely unwanted: skip this whole group.
                        break;
                    }
                    return true;
                }
            }
        }
        false
    }
}

#[derive(Debug, Clone)]
pub struct RetrieveConfig {
    pub work_dir: WorkDir,
    pub host_alias: String,
    pub slot: usize,
    pub dir_alias: String,
    pub recipient: Recipient,
    pub masks: FileMasks,
    /// Forget everything between passes; the list is not persisted.
    pub stupid_mode: bool,
    /// Delete remote files once fetched (implies a transient list).
    pub remove: bool,
    /// When set, fetched files are checked against the directory's
    /// duplicate store and thrown away when seen within this many
    /// seconds.
    pub dupcheck_timeout: Option<i64>,
}

impl RetrieveConfig {
    fn transient_list(&self) -> bool {
        self.stupid_mode || self.remove
    }
}

/// Fetch one pass worth of files. Returns the process exit status.
pub async fn run(cfg: &RetrieveConfig) -> ExitStatus {
    let mut fsa = match FsaHandle::attach(&cfg.work_dir) {
        Ok(fsa) => fsa,
        Err(e) => {
            tracing::error!("cannot attach status area: {}", e);
            return ExitStatus::Incorrect;
        }
    };
    let Some(host_idx) = fsa.host_position(&cfg.host_alias) else {
        tracing::error!(host = %cfg.host_alias, "host not in status area");
        return ExitStatus::Incorrect;
    };
    let (hostname, transfer_timeout, block_size) = {
        let host = fsa.host(host_idx);
        (
            host.active_hostname().to_string(),
            Duration::from_secs(host.transfer_timeout.max(1) as u64),
            if host.block_size > 0 { host.block_size as usize } else { 4096 },
        )
    };
    fsa.host_mut(host_idx).job_status[cfg.slot].set_connect_status(ConnectStatus::RetrieveActive);

    let status = run_pass(cfg, &mut fsa, host_idx, &hostname, transfer_timeout, block_size).await;

    if let Some(idx) = fsa.host_position(&cfg.host_alias) {
        fsa.reset_slot(idx, cfg.slot);
    }
    status
}

async fn run_pass(
    cfg: &RetrieveConfig,
    fsa: &mut FsaHandle,
    host_idx: usize,
    hostname: &str,
    transfer_timeout: Duration,
    block_size: usize,
) -> ExitStatus {
    let port = cfg.recipient.port_or_default();
    let (mut control, greeting) = match Control::connect(hostname, port, transfer_timeout).await {
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

    if greeting != 230 {
        match control.user(&cfg.recipient.user).await {
            Ok(230) => {}
            Ok(_) => {
                let password = cfg.recipient.password.clone().unwrap_or_default();
                if let Err(e) = control.pass(&password).await {
                    tracing::error!(user = %cfg.recipient.user, "login rejected: {}", e);
                    let _ = control.quit().await;
                    return ExitStatus::PasswordError;
                }
            }
            Err(e) => {
                tracing::error!(user = %cfg.recipient.user, "USER rejected: {}", e);
                let _ = control.quit().await;
                return ExitStatus::UserError;
            }
        }
    }
    if let Err(e) = control.transfer_type('I').await {
        tracing::error!("failed to set transfer type: {}", e);
        let _ = control.quit().await;
        return ExitStatus::TypeError;
    }
    if let Some(dir) = cfg.recipient.target_dir() {
        if let Err(e) = control.cwd(&dir).await {
            tracing::error!(dir = %dir, "failed to change directory: {}", e);
            let _ = control.quit().await;
            return ExitStatus::ChdirError;
        }
    }

    // ---- directory listing --------------------------------------------
    let listing = match DataChannel::open_passive(&mut control, "NLST").await {
        Ok(channel) => match channel.read_to_end(&mut control).await {
            Ok(data) => data,
            Err(e) => {
                tracing::error!("failed to read NLST data: {}", e);
                let _ = control.quit().await;
                return ExitStatus::ListError;
            }
        },
        Err(e) => {
            if e.reply_code() == Some(550) {
                // Empty directory on servers that report it as an
                // error; nothing to do.
                forget_list(cfg);
                tracing::info!(dir = %cfg.dir_alias, "no files on remote side");
                let _ = control.quit().await;
                return ExitStatus::TransferSuccess;
            }
            tracing::error!("NLST failed: {}", e);
            let _ = control.quit().await;
            return ExitStatus::ListError;
        }
    };
    let listing = String::from_utf8_lossy(&listing).to_string();
    if listing.trim().is_empty() {
        forget_list(cfg);
        tracing::info!(dir = %cfg.dir_alias, "no files on remote side");
        let _ = control.quit().await;
        return ExitStatus::TransferSuccess;
    }

    // ---- merge with the retrieve list ---------------------------------
    let mut list = if cfg.transient_list() {
        RetrieveList::transient()
    } else {
        match RetrieveList::open(&cfg.work_dir, &cfg.dir_alias) {
            Ok(list) => list,
            Err(e) => {
                tracing::error!(dir = %cfg.dir_alias, "cannot open retrieve list: {}", e);
                let _ = control.quit().await;
                return ExitStatus::Incorrect;
            }
        }
    };
    list.begin_pass();

    let mut check_date = true;
    let mut check_size = true;
    for name in listing.lines().map(str::trim).filter(|l| !l.is_empty()) {
        if !cfg.masks.matches(name) {
            continue;
        }
        match list.position(name) {
            Some(pos) => {
                list.entries_mut()[pos].in_list = 1;
                if check_date {
                    match control.mdtm(name).await {
                        Ok(Some(date)) => {
                            let entry = &mut list.entries_mut()[pos];
                            if !entry.date_matches(&date) {
                                entry.set_date(&date);
                                entry.retrieved = 0;
                            }
                        }
                        Ok(None) => check_date = false,
                        Err(e) => {
                            tracing::warn!(name, "MDTM failed: {}", e);
                            control.clear_timeout();
                            check_date = false;
                        }
                    }
                }
                if check_size {
                    match control.size(name).await {
                        Ok(Some(size)) => {
                            let entry = &mut list.entries_mut()[pos];
                            if entry.size != size as i64 {
                                entry.size = size as i64;
                                entry.retrieved = 0;
                            }
                        }
                        Ok(None) => check_size = false,
                        Err(e) => {
                            tracing::warn!(name, "SIZE failed: {}", e);
                            control.clear_timeout();
                            check_size = false;
                        }
                    }
                }
            }
            None => {
                let mut entry = RetrieveEntry::new(name);
                if check_date {
                    if let Ok(Some(date)) = control.mdtm(name).await {
                        entry.set_date(&date);
                    }
                }
                if check_size {
                    if let Ok(Some(size)) = control.size(name).await {
                        entry.size = size as i64;
                    }
                }
                if let Err(e) = list.push(entry) {
                    tracing::error!("retrieve list push failed: {}", e);
                    let _ = control.quit().await;
                    return ExitStatus::Incorrect;
                }
            }
        }
    }

    if !cfg.transient_list() {
        if let Err(e) = list.compact() {
            tracing::warn!("retrieve list compaction failed: {}", e);
        }
    }

    // ---- fetch outstanding files --------------------------------------
    let incoming = cfg.work_dir.incoming_dir();
    let mut buffer = vec![0u8; block_size];
    let mut dup_store = match cfg.dupcheck_timeout {
        Some(_) => match DupStore::attach(&cfg.work_dir, dir_store_id(&cfg.dir_alias)) {
            Ok(store) => Some(store),
            Err(e) => {
                tracing::warn!("cannot attach duplicate store, checks disabled: {}", e);
                None
            }
        },
        None => None,
    };
    for pos in 0..list.len() {
        let (name, expected_size) = {
            let entry = &list.entries()[pos];
            if entry.retrieved != 0 || entry.in_list == 0 {
                continue;
            }
            (entry.file_name().to_string(), entry.size)
        };

        let tmp_path = incoming.join(format!(".{name}"));
        let final_path = incoming.join(&name);
        let offset = std::fs::metadata(&tmp_path).map(|m| m.len()).unwrap_or(0);

        if offset > 0 {
            if let Err(e) = control.restart_offset(offset).await {
                tracing::warn!(name = %name, "REST rejected, fetching from scratch: {}", e);
                control.clear_timeout();
                let _ = std::fs::remove_file(&tmp_path);
            }
        }
        let resumed = offset > 0 && tmp_path.exists();

        let channel = match DataChannel::open_passive(&mut control, &format!("RETR {name}")).await {
            Ok(channel) => channel,
            Err(e) => {
                tracing::error!(name = %name, "failed to open remote file: {}", e);
                let _ = control.quit().await;
                return ExitStatus::OpenRemoteError;
            }
        };

        let mut local = match std::fs::OpenOptions::new()
            .create(true)
            .append(resumed)
            .write(true)
            .truncate(!resumed)
            .open(&tmp_path)
        {
            Ok(f) => f,
            Err(e) => {
                tracing::error!(path = %tmp_path.display(), "cannot open local file: {}", e);
                let _ = control.quit().await;
                return ExitStatus::OpenLocalError;
            }
        };

        let mut channel = channel;
        let mut fetched: i64 = resumed.then_some(offset as i64).unwrap_or(0);
        loop {
            let n = match channel.read_block(&mut control, &mut buffer).await {
                Ok(n) => n,
                Err(e) => {
                    tracing::error!(name = %name, "failed to read remote data: {}", e);
                    if control.timed_out() {
                        return ExitStatus::TimeoutError;
                    }
                    let _ = control.quit().await;
                    return ExitStatus::ReadRemoteError;
                }
            };
            if n == 0 {
                break;
            }
            if let Err(e) = local.write_all(&buffer[..n]) {
                tracing::error!(path = %tmp_path.display(), "local write failed: {}", e);
                let _ = control.quit().await;
                return ExitStatus::WriteLocalError;
            }
            fetched += n as i64;
            if let Some(idx) = refreshed_host(fsa, &cfg.host_alias) {
                let js = &mut fsa.host_mut(idx).job_status[cfg.slot];
                js.file_size_in_use_done = fetched;
                js.bytes_send += n as u64;
            }
        }
        drop(local);

        if let Err(e) = channel.close(&mut control, expected_size == 0).await {
            tracing::error!(name = %name, "failed to close remote file: {}", e);
            if control.timed_out() {
                return ExitStatus::TimeoutError;
            }
            let _ = control.quit().await;
            return ExitStatus::CloseRemoteError;
        }

        if expected_size >= 0 && fetched != expected_size {
            tracing::warn!(
                name = %name,
                expected = expected_size,
                actual = fetched,
                "fetched size differs from server SIZE"
            );
        }

        if let Err(e) = std::fs::rename(&tmp_path, &final_path) {
            tracing::error!(path = %final_path.display(), "failed to move file into place: {}", e);
            let _ = control.quit().await;
            return ExitStatus::WriteLocalError;
        }

        if cfg.remove {
            if let Err(e) = control.dele(&name).await {
                tracing::warn!(name = %name, "failed to delete remote file: {}", e);
                control.clear_timeout();
            }
        }

        if let (Some(store), Some(timeout)) = (dup_store.as_mut(), cfg.dupcheck_timeout) {
            match store.is_duplicate(&final_path, fetched, timeout, DupFlag::FilenameAndSize) {
                Ok(true) => {
                    tracing::warn!(name = %name, "duplicate arrival, dropping local copy");
                    if let Err(e) = std::fs::remove_file(&final_path) {
                        tracing::warn!(path = %final_path.display(), "failed to drop duplicate: {}", e);
                    }
                }
                Ok(false) => {}
                Err(e) => tracing::warn!(name = %name, "duplicate check failed: {}", e),
            }
        }

        {
            let entry = &mut list.entries_mut()[pos];
            entry.retrieved = 1;
            if entry.size < 0 {
                entry.size = fetched;
            }
        }
        if let Some(idx) = refreshed_host(fsa, &cfg.host_alias) {
            let record = fsa.host_mut(idx);
            record.file_counter_done += 1;
            let js = &mut record.job_status[cfg.slot];
            js.no_of_files_done += 1;
            js.file_size_in_use_done = 0;
        }
        tracing::info!(name = %name, bytes = fetched, dir = %cfg.dir_alias, "retrieved");
    }

    if let Err(e) = control.quit().await {
        tracing::warn!("failed to log out: {}", e);
    }
    ExitStatus::TransferSuccess
}

/// The duplicate store of a polled directory is keyed by a stable hash
/// of its alias, the way outbound stores are keyed by job id.
fn dir_store_id(dir_alias: &str) -> u32 {
    petrel_status::error_queue::host_key(dir_alias)
}

fn refreshed_host(fsa: &mut FsaHandle, alias: &str) -> Option<usize> {
    match fsa.check_stale() {
        Ok(_) => fsa.host_position(alias),
        Err(_) => None,
    }
}

/// A 550/empty NLST invalidates what we remembered about a persistent
/// directory.
fn forget_list(cfg: &RetrieveConfig) {
    if !cfg.transient_list() {
        let path = cfg.work_dir.ls_data_file(&cfg.dir_alias);
        if path.exists() {
            if let Err(e) = std::fs::remove_file(&path) {
                tracing::warn!(path = %path.display(), "failed to drop retrieve list: {}", e);
            }
        }
    }
}
