//! The owning state of one sender process.
//!
//! Everything the C original kept in process globals lives here: the
//! status-area attachment, the current job with its parsed message,
//! transfer counters and the latched timeout flag. Dropping the
//! session resets the status slot and tells the dispatcher the process
//! is gone, so every exit path, including panics, leaves the shared
//! state clean.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use petrel_core::{ConnectStatus, ExitStatus, WorkDir, SF_FIN_FIFO};
use petrel_msg::password::PasswordStore;
use petrel_msg::{Message, Scheme};
use petrel_status::fifo;
use petrel_status::FsaHandle;

use crate::TransferType;

/// What the dispatcher passes to one sender invocation.
#[derive(Debug, Clone)]
pub struct JobArgs {
    pub work_dir: WorkDir,
    pub host_alias: String,
    pub slot: usize,
    pub msg_name: String,
    pub job_id: u32,
    pub error_file: bool,
    pub toggle_host: bool,
    pub transfer_type: TransferType,
}

/// The job a session is currently working on.
pub struct Job {
    pub msg_name: String,
    pub job_id: u32,
    pub error_file: bool,
    pub message: Message,
    pub transfer_type: TransferType,
}

impl Job {
    /// Load the message for `job_id` and resolve the password from the
    /// store when the URL carries none.
    pub fn load(
        work_dir: &WorkDir,
        msg_name: &str,
        job_id: u32,
        error_file: bool,
        transfer_type: TransferType,
    ) -> crate::control::FtpResult<Self> {
        let path = work_dir.msg_file(job_id);
        let mut message = Message::read(&path).map_err(|e| {
            crate::control::FtpError::Local(format!("cannot read message {}: {e}", path.display()))
        })?;

        if message.recipient.password.is_none() && message.recipient.scheme != Scheme::Loc {
            let uh_name = format!("{}@{}", message.recipient.user, message.recipient.host);
            match PasswordStore::lookup(work_dir, &uh_name) {
                Ok(Some(password)) => message.recipient.password = Some(password),
                Ok(None) => {}
                Err(e) => tracing::warn!(%uh_name, "password lookup failed: {}", e),
            }
        }

        Ok(Self {
            msg_name: msg_name.to_string(),
            job_id,
            error_file,
            message,
            transfer_type,
        })
    }

    /// The spool directory holding this job's files.
    pub fn file_dir(&self, work_dir: &WorkDir) -> PathBuf {
        work_dir.job_file_dir(&self.msg_name)
    }
}

pub struct SfSession {
    pub work_dir: WorkDir,
    pub fsa: FsaHandle,
    pub host_alias: String,
    pub slot: usize,
    pub job: Job,
    /// Set when the host vanished from a republished status area; all
    /// further status writes are skipped.
    pub host_gone: bool,
    /// Jobs completed on this connection beyond the first.
    pub burst_count: u32,
    /// Appended files across the whole connection.
    pub append_total: u32,
    host_idx: usize,
    shutdown: Arc<AtomicBool>,
    exit_status: ExitStatus,
}

impl SfSession {
    pub fn open(args: &JobArgs, shutdown: Arc<AtomicBool>) -> crate::control::FtpResult<Self> {
        let fsa = FsaHandle::attach(&args.work_dir)
            .map_err(|e| crate::control::FtpError::Local(format!("cannot attach status area: {e}")))?;
        let host_idx = fsa.host_position(&args.host_alias).ok_or_else(|| {
            crate::control::FtpError::Local(format!("host {} not in status area", args.host_alias))
        })?;
        if args.slot >= petrel_core::MAX_NO_PARALLEL_JOBS {
            return Err(crate::control::FtpError::Local(format!(
                "slot {} out of range",
                args.slot
            )));
        }
        let job = Job::load(
            &args.work_dir,
            &args.msg_name,
            args.job_id,
            args.error_file,
            args.transfer_type,
        )?;

        Ok(Self {
            work_dir: args.work_dir.clone(),
            fsa,
            host_alias: args.host_alias.clone(),
            slot: args.slot,
            job,
            host_gone: false,
            burst_count: 0,
            append_total: 0,
            host_idx,
            shutdown,
            exit_status: ExitStatus::Incorrect,
        })
    }

    pub fn host_idx(&self) -> usize {
        self.host_idx
    }

    /// Remap when the status area was republished and re-resolve the
    /// host index. After this, previously taken indices are invalid.
    pub fn refresh(&mut self) -> bool {
        match self.fsa.check_stale() {
            Ok(false) => {}
            Ok(true) => match self.fsa.host_position(&self.host_alias) {
                Some(idx) => self.host_idx = idx,
                None => {
                    tracing::warn!(host = %self.host_alias, "host removed from status area");
                    self.host_gone = true;
                }
            },
            Err(e) => {
                tracing::error!("status area refresh failed: {}", e);
                self.host_gone = true;
            }
        }
        self.host_gone
    }

    /// True when SIGINT/SIGTERM asked us to stop.
    pub fn shutdown_requested(&self) -> bool {
        self.shutdown.load(Ordering::Relaxed)
    }

    pub fn block_size(&self) -> usize {
        let bs = self.fsa.host(self.host_idx).block_size;
        if bs > 0 { bs as usize } else { petrel_core::DEFAULT_TRANSFER_BLOCK_SIZE }
    }

    /// Connection established: publish slot state and count the
    /// connection.
    pub fn mark_connected(&mut self, files_to_send: i32, bytes_to_send: i64) {
        if self.host_gone {
            return;
        }
        let Ok(_host_guard) = self.fsa.lock_host(self.host_idx) else { return };
        let idx = self.host_idx;
        let slot = self.slot;
        {
            let record = self.fsa.host_mut(idx);
            let js = &mut record.job_status[slot];
            js.set_connect_status(ConnectStatus::FtpActive);
            js.no_of_files = files_to_send;
            js.file_size = bytes_to_send;
            js.job_id = self.job.job_id;
        }
        if let Ok(_guard) = self.fsa.lock_connections(idx) {
            self.fsa.host_mut(idx).connections += 1;
        }
    }

    /// Burst granted: publish the new job in the slot.
    pub fn mark_bursting(&mut self, files_to_send: i32, bytes_to_send: i64) {
        if self.host_gone {
            return;
        }
        let idx = self.host_idx;
        let slot = self.slot;
        let record = self.fsa.host_mut(idx);
        let js = &mut record.job_status[slot];
        js.set_connect_status(ConnectStatus::FtpBurstActive);
        js.no_of_files = js.no_of_files_done + files_to_send;
        js.file_size = js.file_size_done + bytes_to_send;
        js.job_id = self.job.job_id;
    }

    pub fn set_exit_status(&mut self, status: ExitStatus) {
        self.exit_status = status;
    }
}

impl Drop for SfSession {
    fn drop(&mut self) {
        if !self.host_gone && self.host_idx < self.fsa.no_of_hosts().max(0) as usize {
            let idx = self.host_idx;
            let slot = self.slot;
            let (done_files, done_bytes) = {
                let js = &self.fsa.host(idx).job_status[slot];
                (js.no_of_files_done, js.file_size_done)
            };
            if done_files > 0 || done_bytes > 0 {
                let mut summary = format!("{done_bytes} bytes sent in {done_files} file(s)");
                if self.append_total > 0 {
                    summary.push_str(&format!(" [APPEND * {}]", self.append_total));
                }
                if self.burst_count > 0 {
                    summary.push_str(&format!(" [BURST * {}]", self.burst_count));
                }
                tracing::info!(host = %self.host_alias, status = ?self.exit_status, "{summary}");
            }
            if let Ok(_guard) = self.fsa.lock_connections(idx) {
                let record = self.fsa.host_mut(idx);
                record.connections = record.connections.saturating_sub(1);
            }
            self.fsa.reset_slot(idx, slot);
        }

        // Tell the dispatcher this pid is gone, whatever the outcome.
        let path = self.work_dir.fifo(SF_FIN_FIFO);
        if let Err(e) = fifo::notify_pid(&path, std::process::id() as i32) {
            tracing::error!("failed to notify dispatcher on {}: {}", path.display(), e);
        }
    }
}
