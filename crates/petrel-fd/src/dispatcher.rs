//! The dispatcher main loop.
//!
//! Publishes the status area from the host table, scans the spool for
//! queued jobs, starts one sender process per connection and keeps the
//! per-host error discipline: a failed job bumps the host's error
//! counter, lands in the error queue and waits out the retry interval;
//! the first good transfer (reported by the sender through the status
//! area) clears it all again.

use std::collections::HashMap;
use std::fs::File;
use std::time::{Duration, Instant};

use tokio::process::{Child, Command};

use petrel_core::{ConnectStatus, ExitStatus, WorkDir, FD_WAKE_UP_FIFO, SF_FIN_FIFO};
use petrel_msg::{HostConfig, HostConfigEntry, Message};
use petrel_status::error_queue::{host_key, ErrorQueue};
use petrel_status::fsa::{self, HostRecord};
use petrel_status::{fifo, FsaHandle};

use crate::config::FdConfig;
use crate::queue::{job_id_of, JobQueues, QueuedJob};
use crate::{FdError, Result};

/// A running sender process and the slot it owns.
struct SenderProc {
    child: Child,
    pid: i32,
    host_alias: String,
    slot: usize,
    msg_name: String,
    job_id: u32,
}

pub struct Dispatcher {
    config: FdConfig,
    work_dir: WorkDir,
    fsa: FsaHandle,
    error_queue: ErrorQueue,
    queues: JobQueues,
    senders: Vec<SenderProc>,
    fin_fifo: File,
    wakeup_fifo: File,
}

/// Build one status-area record from a host table entry.
pub fn record_from_entry(entry: &HostConfigEntry) -> HostRecord {
    let mut record = HostRecord::zeroed();
    record.set_host_alias(&entry.alias);
    record.set_real_hostname(0, &entry.real_hostname[0]);
    record.set_real_hostname(1, &entry.real_hostname[1]);
    record.host_toggle = entry.host_toggle;
    record.allowed_transfers = entry.allowed_transfers as i32;
    record.max_errors = entry.max_errors as i32;
    record.retry_interval = entry.retry_interval as i32;
    record.block_size = entry.transfer_block_size as i32;
    record.successful_retries = entry.successful_retries as i32;
    record.file_size_offset = entry.file_size_offset.to_raw();
    record.transfer_timeout = entry.transfer_timeout as i64;
    record.number_of_no_bursts = entry.number_of_no_bursts as u8;
    record.host_status = entry.host_status;
    record.special_flag = entry.special_flag;
    record
}

impl Dispatcher {
    /// Read the host table, publish a fresh status area and open the
    /// rendezvous fifos.
    pub fn start(config: FdConfig) -> Result<Self> {
        let work_dir = WorkDir::new(&config.work_dir);
        work_dir.create_all()?;

        let hosts = HostConfig::read(&config.host_config)
            .map_err(|e| FdError::Dispatch(format!("cannot read host table: {e}")))?;
        if hosts.entries.is_empty() {
            return Err(FdError::Dispatch("host table has no hosts".into()));
        }
        let records: Vec<HostRecord> = hosts.entries.iter().map(record_from_entry).collect();
        let id = fsa::publish(&work_dir, &records)
            .map_err(|e| FdError::Dispatch(format!("cannot publish status area: {e}")))?;
        tracing::info!(hosts = records.len(), id, "status area published");

        let fsa = FsaHandle::attach(&work_dir)
            .map_err(|e| FdError::Dispatch(format!("cannot attach status area: {e}")))?;
        let error_queue = ErrorQueue::attach(&work_dir)
            .map_err(|e| FdError::Dispatch(format!("cannot attach error queue: {e}")))?;

        let fin_path = work_dir.fifo(SF_FIN_FIFO);
        let wake_path = work_dir.fifo(FD_WAKE_UP_FIFO);
        fifo::ensure_fifo(&fin_path)?;
        fifo::ensure_fifo(&wake_path)?;
        let fin_fifo = fifo::open_rw(&fin_path)?;
        let wakeup_fifo = fifo::open_rw(&wake_path)?;

        Ok(Self {
            config,
            work_dir,
            fsa,
            error_queue,
            queues: JobQueues::new(),
            senders: Vec::new(),
            fin_fifo,
            wakeup_fifo,
        })
    }

    /// Run until `shutdown` resolves.
    pub async fn run(mut self, shutdown: impl std::future::Future<Output = ()>) -> Result<()> {
        tokio::pin!(shutdown);
        let interval = Duration::from_secs(self.config.scan_interval_secs);
        loop {
            self.tick()?;
            tokio::select! {
                _ = &mut shutdown => break,
                _ = tokio::time::sleep(interval) => {}
            }
        }
        tracing::info!("shutting down, stopping {} sender(s)", self.senders.len());
        for sender in &mut self.senders {
            let _ = sender.child.start_kill();
        }
        Ok(())
    }

    /// One dispatcher iteration. Split out for tests.
    pub fn tick(&mut self) -> Result<()> {
        let _ = fifo::drain_wakeups(&mut self.wakeup_fifo)?;
        self.harvest_fin_records()?;
        self.reap_children()?;
        self.scan_queue_dirs()?;
        self.start_senders()?;
        self.publish_queue_depths();
        Ok(())
    }

    /// Read `sf.fin`: negative pids are burst requests; positive pids
    /// confirm an exit (the real bookkeeping happens in
    /// `reap_children` via waitpid).
    fn harvest_fin_records(&mut self) -> Result<()> {
        for pid in fifo::drain_pids(&mut self.fin_fifo)? {
            if pid < 0 {
                self.answer_burst_request(-pid);
            }
        }
        Ok(())
    }

    /// A sender with an open connection asks for another job for its
    /// host. Hand one over through the unique-name mailbox, or stay
    /// silent and let it give up.
    fn answer_burst_request(&mut self, pid: i32) {
        let Some(proc_idx) = self.senders.iter().position(|s| s.pid == pid) else {
            tracing::debug!(pid, "burst request from unknown sender");
            return;
        };
        let host_alias = self.senders[proc_idx].host_alias.clone();
        let slot = self.senders[proc_idx].slot;

        let Some(idx) = self.fsa.host_position(&host_alias) else {
            return;
        };
        if !self.fsa.host(idx).slot_may_burst(slot) {
            // The slot sits in the reserved non-bursting band; its
            // sender will give up and hang up, and the job goes to a
            // fresh process instead.
            tracing::debug!(host = %host_alias, slot, "slot is reserved non-bursting, not handing work");
            return;
        }
        if self.fsa.host(idx).job_status[slot].mailbox_gave_up() {
            // Too late, the sender stopped waiting.
            return;
        }

        let Some(job) = self.queues.pop(&host_alias) else {
            tracing::debug!(host = %host_alias, "no queued job for burst request");
            return;
        };
        let Ok(_guard) = self.fsa.lock_slot_queue(idx, slot) else {
            self.queues.requeue_front(job);
            return;
        };
        tracing::info!(host = %host_alias, job = %job.msg_name, slot, "handing job to connected sender");
        let record = self.fsa.host_mut(idx);
        let js = &mut record.job_status[slot];
        js.job_id = job.job_id;
        js.error_file = job.error_file as u8;
        js.set_unique_name(&job.msg_name);

        // The sender only asks once its current job is through, so
        // that one is done now.
        let old_msg = std::mem::replace(&mut self.senders[proc_idx].msg_name, job.msg_name.clone());
        let old_job_id = std::mem::replace(&mut self.senders[proc_idx].job_id, job.job_id);
        self.queues.forget(&old_msg);
        let _ = self.error_queue.remove(old_job_id, &mut self.fsa);
    }

    /// Collect exited senders and apply the error discipline.
    fn reap_children(&mut self) -> Result<()> {
        let mut finished = Vec::new();
        for (i, sender) in self.senders.iter_mut().enumerate() {
            match sender.child.try_wait() {
                Ok(Some(status)) => finished.push((i, status.code().unwrap_or(-1))),
                Ok(None) => {}
                Err(e) => {
                    tracing::warn!(pid = sender.pid, "cannot reap sender: {}", e);
                }
            }
        }
        // Highest index first so removal keeps the others stable.
        finished.sort_by(|a, b| b.0.cmp(&a.0));
        for (i, code) in finished {
            let sender = self.senders.remove(i);
            let status = ExitStatus::from_code(code).unwrap_or(ExitStatus::Incorrect);
            self.job_finished(&sender, status)?;
        }
        Ok(())
    }

    fn job_finished(&mut self, sender: &SenderProc, status: ExitStatus) -> Result<()> {
        let Some(idx) = self.fsa.host_position(&sender.host_alias) else {
            self.queues.forget(&sender.msg_name);
            return Ok(());
        };
        {
            let record = self.fsa.host_mut(idx);
            record.active_transfers = (record.active_transfers - 1).max(0);
        }

        match status {
            ExitStatus::TransferSuccess => {
                tracing::info!(
                    host = %sender.host_alias,
                    job = %sender.msg_name,
                    "sender finished"
                );
                self.queues.forget(&sender.msg_name);
                let _ = self.error_queue.remove(sender.job_id, &mut self.fsa);
            }
            failure => {
                let (error_counter, retry_interval, max_errors) = {
                    let guard = self.fsa.lock_error_counter(idx);
                    let record = self.fsa.host_mut(idx);
                    record.error_counter += 1;
                    drop(guard);
                    (record.error_counter, record.retry_interval, record.max_errors)
                };
                tracing::warn!(
                    host = %sender.host_alias,
                    job = %sender.msg_name,
                    status = ?failure,
                    error_counter,
                    "sender failed"
                );
                if error_counter >= max_errors {
                    let record = self.fsa.host_mut(idx);
                    if record.host_status & petrel_core::types::host_status::AUTO_PAUSE_QUEUE == 0 {
                        record.host_status |= petrel_core::types::host_status::AUTO_PAUSE_QUEUE;
                        tracing::warn!(
                            host = %sender.host_alias,
                            "too many errors, pausing input queue"
                        );
                    }
                }
                // Park the job id so retries do not amplify, and hold
                // the message until the retry interval is over.
                if let Err(e) = self.error_queue.add(sender.job_id, host_key(&sender.host_alias)) {
                    tracing::warn!("cannot park job in error queue: {}", e);
                } else {
                    let record = self.fsa.host_mut(idx);
                    record.host_status |= petrel_core::types::host_status::ERROR_QUEUE_SET;
                }
                self.queues.hold(
                    &sender.msg_name,
                    Instant::now() + Duration::from_secs(retry_interval.max(1) as u64),
                );
            }
        }
        Ok(())
    }

    /// Find spool directories nobody is working on yet and queue them.
    fn scan_queue_dirs(&mut self) -> Result<()> {
        let files_root = self.work_dir.root().join("files");
        let now = Instant::now();
        for entry in std::fs::read_dir(&files_root)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let Ok(msg_name) = entry.file_name().into_string() else { continue };
            if msg_name == "incoming" || msg_name.starts_with('.') {
                continue;
            }
            if self.queues.knows(&msg_name) || self.queues.held(&msg_name, now) {
                continue;
            }
            let Some(job_id) = job_id_of(&msg_name) else {
                tracing::warn!(dir = %msg_name, "spool directory without job id prefix, ignored");
                continue;
            };
            match self.queue_job(&msg_name, job_id) {
                Ok(_) => {}
                Err(e) => tracing::warn!(job = %msg_name, "cannot queue job: {}", e),
            }
        }
        Ok(())
    }

    fn queue_job(&mut self, msg_name: &str, job_id: u32) -> Result<bool> {
        let msg_path = self.work_dir.msg_file(job_id);
        let message = match Message::read(&msg_path) {
            Ok(m) => m,
            Err(e) => {
                return Err(FdError::Dispatch(format!(
                    "message {} unusable: {e}",
                    msg_path.display()
                )));
            }
        };

        let Some(host_idx) = self.resolve_host(&message) else {
            return Err(FdError::Dispatch(format!(
                "no host record for {}",
                message.recipient.host
            )));
        };
        let host_alias = self.fsa.host(host_idx).host_alias().to_string();
        if self.fsa.host(host_idx).host_status
            & (petrel_core::types::host_status::PAUSE_QUEUE
                | petrel_core::types::host_status::AUTO_PAUSE_QUEUE
                | petrel_core::types::host_status::HOST_DISABLED)
            != 0
        {
            return Ok(false);
        }

        let spool = self.work_dir.job_file_dir(msg_name);
        let (files, bytes) = spool_totals(&spool)?;
        if files == 0 {
            // Upstream is still filling the directory, or it is a
            // leftover. Either way nothing to do yet.
            return Ok(false);
        }

        // The dispatcher owns the global counters; the senders retire
        // from them file by file.
        {
            let guard = self.fsa.lock_counters(host_idx);
            let record = self.fsa.host_mut(host_idx);
            record.total_file_counter += files;
            record.total_file_size += bytes;
            drop(guard);
        }

        tracing::info!(host = %host_alias, job = %msg_name, files, bytes, "job queued");
        self.queues.push(QueuedJob {
            msg_name: msg_name.to_string(),
            job_id,
            host_alias,
            error_file: false,
            files,
            bytes,
        });
        Ok(true)
    }

    /// A message addresses a host either by its alias or by one of its
    /// real host names.
    fn resolve_host(&self, message: &Message) -> Option<usize> {
        let wanted = message.recipient.host.as_str();
        (0..self.fsa.no_of_hosts().max(0) as usize).find(|&i| {
            let record = self.fsa.host(i);
            record.host_alias() == wanted
                || record.active_hostname() == wanted
        })
    }

    /// Start senders for hosts with queued work and free slots.
    fn start_senders(&mut self) -> Result<()> {
        for host_alias in self.queues.hosts_with_work() {
            loop {
                if self.senders.len() >= self.config.max_connections {
                    return Ok(());
                }
                let Some(idx) = self.fsa.host_position(&host_alias) else { break };
                let (active, allowed) = {
                    let record = self.fsa.host(idx);
                    (record.active_transfers, record.allowed_transfers)
                };
                if active >= allowed {
                    break;
                }
                let Some(slot) = self.free_slot(idx) else { break };
                let Some(job) = self.queues.pop(&host_alias) else { break };

                match self.spawn_sender(&job, slot) {
                    Ok(child) => {
                        let pid = child.id().map(|p| p as i32).unwrap_or(-1);
                        {
                            // A predecessor that died hard may have
                            // left stale state in the slot.
                            self.fsa.reset_slot(idx, slot);
                            let record = self.fsa.host_mut(idx);
                            record.active_transfers += 1;
                            record.job_status[slot].set_connect_status(ConnectStatus::Disconnect);
                            record.job_status[slot].job_id = job.job_id;
                        }
                        tracing::info!(
                            host = %host_alias,
                            job = %job.msg_name,
                            slot,
                            pid,
                            "sender started"
                        );
                        self.senders.push(SenderProc {
                            child,
                            pid,
                            host_alias: host_alias.clone(),
                            slot,
                            msg_name: job.msg_name,
                            job_id: job.job_id,
                        });
                    }
                    Err(e) => {
                        tracing::error!(host = %host_alias, "cannot start sender: {}", e);
                        self.queues.hold(&job.msg_name, Instant::now() + Duration::from_secs(30));
                        break;
                    }
                }
            }
        }
        Ok(())
    }

    /// The first slot not currently owned by a live sender.
    fn free_slot(&self, host_idx: usize) -> Option<usize> {
        let record = self.fsa.host(host_idx);
        let host_alias = record.host_alias();
        (0..record.allowed_transfers.max(0) as usize).find(|&slot| {
            !self
                .senders
                .iter()
                .any(|s| s.host_alias == host_alias && s.slot == slot)
        })
    }

    fn spawn_sender(&self, job: &QueuedJob, slot: usize) -> std::io::Result<Child> {
        let mut command = Command::new(&self.config.sender_binary);
        command
            .arg("--work-dir")
            .arg(self.work_dir.root())
            .arg("--host-alias")
            .arg(&job.host_alias)
            .arg("--slot")
            .arg(slot.to_string())
            .arg("--msg-name")
            .arg(&job.msg_name)
            .arg("--job-id")
            .arg(job.job_id.to_string());
        if job.error_file {
            command.arg("--error-file");
        }
        command.kill_on_drop(false);
        command.spawn()
    }

    /// Keep the per-host queue depth visible to senders; the burst
    /// probe only asks while this is above zero.
    fn publish_queue_depths(&mut self) {
        for i in 0..self.fsa.no_of_hosts().max(0) as usize {
            let alias = self.fsa.host(i).host_alias().to_string();
            let depth = self.queues.queued_for(&alias) as i32;
            self.fsa.host_mut(i).jobs_queued = depth;
        }
    }
}

fn spool_totals(dir: &std::path::Path) -> Result<(i32, i64)> {
    let mut files = 0;
    let mut bytes = 0i64;
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let meta = entry.metadata()?;
        if meta.is_file() {
            files += 1;
            bytes += meta.len() as i64;
        }
    }
    Ok((files, bytes))
}

#[cfg(test)]
mod tests {
    use super::*;
    use petrel_core::FileSizeOffset;

    #[test]
    fn record_carries_host_table_fields() {
        let entry = HostConfigEntry {
            alias: "h1".into(),
            real_hostname: ["srv".into(), "srv2".into()],
            allowed_transfers: 3,
            transfer_block_size: 1024,
            file_size_offset: FileSizeOffset::Auto,
            number_of_no_bursts: 1,
            ..Default::default()
        };
        let record = record_from_entry(&entry);
        assert_eq!(record.host_alias(), "h1");
        assert_eq!(record.active_hostname(), "srv");
        assert_eq!(record.allowed_transfers, 3);
        assert_eq!(record.block_size, 1024);
        assert_eq!(FileSizeOffset::from_raw(record.file_size_offset), FileSizeOffset::Auto);
        assert_eq!(record.number_of_no_bursts, 1);
    }

    #[test]
    fn spool_totals_counts_files() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a"), vec![0u8; 10]).unwrap();
        std::fs::write(dir.path().join("b"), vec![0u8; 22]).unwrap();
        let (files, bytes) = spool_totals(dir.path()).unwrap();
        assert_eq!(files, 2);
        assert_eq!(bytes, 32);
    }
}
