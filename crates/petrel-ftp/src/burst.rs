//! Burst continuation: reuse of an authenticated connection.
//!
//! When a sender drains its file list and the dispatcher still has
//! jobs queued for the same host, tearing the connection down just to
//! reconnect seconds later is waste. Instead the sender arms the
//! unique-name mailbox in its status slot, writes its negative pid
//! into `sf.fin` as a work request and polls the mailbox. The
//! dispatcher either delivers a fresh message name (and job id and
//! error-file flag) or stays silent until the sender gives up.

use std::time::Duration;

use petrel_core::SF_FIN_FIFO;
use petrel_status::fifo;

use crate::session::{Job, SfSession};

/// How long a sender keeps the connection open waiting for more work.
const BURST_WAIT_TOTAL: Duration = Duration::from_secs(120);
const BURST_POLL_STEP: Duration = Duration::from_millis(50);

/// Which connection-level settings the new job changed; each one
/// forces the matching setup command to run again.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ValuesChanged {
    pub user: bool,
    pub target_dir: bool,
    pub transfer_type: bool,
}

/// Ask the dispatcher for another job on this connection. `Some` means
/// the session's job has been replaced and reports what changed;
/// `None` means hang up.
pub async fn next_job(session: &mut SfSession) -> Option<ValuesChanged> {
    loop {
        if session.refresh() {
            // Host gone from the status area: nobody left to talk to.
            return None;
        }
        let idx = session.host_idx();
        let slot = session.slot;
        {
            let host = session.fsa.host(idx);
            // Reserved non-bursting slots hang up after every job.
            if !host.slot_may_burst(slot) {
                return None;
            }
            // Only worth asking while every slot is busy; otherwise
            // the dispatcher can simply start another sender.
            if host.jobs_queued <= 0 || host.active_transfers < host.allowed_transfers {
                return None;
            }
        }

        session.fsa.host_mut(idx).job_status[slot].mailbox_arm();

        let fin = session.work_dir.fifo(SF_FIN_FIFO);
        if let Err(e) = fifo::notify_pid(&fin, -(std::process::id() as i32)) {
            tracing::warn!("failed to request burst work: {}", e);
            return None;
        }

        let mut waited = Duration::ZERO;
        let delivered = loop {
            if session.refresh() {
                return None;
            }
            let idx = session.host_idx();
            if session.fsa.host(idx).job_status[slot].mailbox_delivered() {
                break true;
            }
            if waited >= BURST_WAIT_TOTAL {
                break false;
            }
            tokio::time::sleep(BURST_POLL_STEP).await;
            waited += BURST_POLL_STEP;
        };

        let idx = session.host_idx();
        if !delivered {
            session.fsa.host_mut(idx).job_status[slot].mailbox_give_up();
            tracing::debug!(
                host = %session.host_alias,
                "no burst work arrived within {}s",
                BURST_WAIT_TOTAL.as_secs()
            );
            return None;
        }

        let (msg_name, new_job_id, error_file) = {
            let js = &session.fsa.host(idx).job_status[slot];
            (js.unique_name().to_string(), js.job_id, js.error_file != 0)
        };

        if new_job_id == session.job.job_id {
            // Same job id: the message on disk is unchanged, only the
            // spool directory moved.
            session.job.msg_name = msg_name;
            session.job.error_file = error_file;
            return Some(ValuesChanged::default());
        }

        let old = &session.job;
        let new_job = match Job::load(
            &session.work_dir,
            &msg_name,
            new_job_id,
            error_file,
            old.transfer_type,
        ) {
            Ok(job) => job,
            Err(e) => {
                tracing::error!(job_id = new_job_id, "burst job has an unusable message: {}", e);
                // Report the slot free again and try once more; the
                // dispatcher may have something else queued.
                continue;
            }
        };

        let changed = ValuesChanged {
            user: new_job.message.recipient.user != old.message.recipient.user
                || new_job.message.recipient.password != old.message.recipient.password,
            target_dir: new_job.message.recipient.target_dir() != old.message.recipient.target_dir(),
            transfer_type: new_job.transfer_type != old.transfer_type,
        };
        session.job = new_job;
        return Some(changed);
    }
}
