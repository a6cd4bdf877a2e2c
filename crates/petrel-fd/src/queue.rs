//! Per-host job queues.
//!
//! A queued job is a spool directory under `files/` named
//! `<job_id>_<sequence>` plus the message file `msgs/<job_id>`. The
//! dispatcher keeps one FIFO queue per host alias and a small amount
//! of retry state so failed jobs wait out their host's retry interval
//! instead of hammering a dead server.

use std::collections::{HashMap, HashSet, VecDeque};
use std::time::Instant;

/// One unit of work bound to a host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueuedJob {
    pub msg_name: String,
    pub job_id: u32,
    pub host_alias: String,
    /// Came back from a failed attempt.
    pub error_file: bool,
    pub files: i32,
    pub bytes: i64,
}

/// The spool-directory naming convention: `<job_id>_<sequence>`.
pub fn job_id_of(msg_name: &str) -> Option<u32> {
    msg_name.split('_').next()?.parse().ok()
}

#[derive(Default)]
pub struct JobQueues {
    queues: HashMap<String, VecDeque<QueuedJob>>,
    /// Jobs currently queued or running; keyed by msg_name so a
    /// directory scan never double-queues.
    known: HashSet<String>,
    /// Earliest next attempt per msg_name, set when a job failed.
    hold_until: HashMap<String, Instant>,
}

impl JobQueues {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn knows(&self, msg_name: &str) -> bool {
        self.known.contains(msg_name)
    }

    /// True when the job is parked waiting for its retry interval.
    pub fn held(&self, msg_name: &str, now: Instant) -> bool {
        self.hold_until.get(msg_name).is_some_and(|&t| t > now)
    }

    pub fn push(&mut self, job: QueuedJob) {
        if self.known.insert(job.msg_name.clone()) {
            self.queues.entry(job.host_alias.clone()).or_default().push_back(job);
        }
    }

    pub fn queued_for(&self, host_alias: &str) -> usize {
        self.queues.get(host_alias).map(VecDeque::len).unwrap_or(0)
    }

    pub fn pop(&mut self, host_alias: &str) -> Option<QueuedJob> {
        self.queues.get_mut(host_alias)?.pop_front()
    }

    /// Put a popped job back at the head of its queue. The name is
    /// still in `known` after a pop, so this must bypass the
    /// double-queue guard that `push` applies.
    pub fn requeue_front(&mut self, job: QueuedJob) {
        self.known.insert(job.msg_name.clone());
        self.queues.entry(job.host_alias.clone()).or_default().push_front(job);
    }

    pub fn hosts_with_work(&self) -> Vec<String> {
        self.queues
            .iter()
            .filter(|(_, q)| !q.is_empty())
            .map(|(h, _)| h.clone())
            .collect()
    }

    /// The job finished (or was abandoned): allow the scanner to pick
    /// its directory up again if it still exists.
    pub fn forget(&mut self, msg_name: &str) {
        self.known.remove(msg_name);
        self.hold_until.remove(msg_name);
    }

    /// The job failed: forget it but refuse to requeue before
    /// `retry_at`.
    pub fn hold(&mut self, msg_name: &str, retry_at: Instant) {
        self.known.remove(msg_name);
        self.hold_until.insert(msg_name.to_string(), retry_at);
    }
}
