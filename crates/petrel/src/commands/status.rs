use std::path::PathBuf;

use petrel_core::WorkDir;
use petrel_status::FsaHandle;

#[derive(serde::Serialize)]
struct HostStatusLine {
    alias: String,
    hostname: String,
    error_counter: i32,
    total_file_counter: i32,
    total_file_size: i64,
    file_counter_done: u32,
    bytes_send: u64,
    active_transfers: i32,
    allowed_transfers: i32,
    jobs_queued: i32,
    connections: u32,
    host_status: u32,
}

pub fn show(work_dir: Option<PathBuf>, json: bool) -> anyhow::Result<()> {
    let work_dir = WorkDir::resolve(work_dir)?;
    let fsa = FsaHandle::attach(&work_dir)?;

    let lines: Vec<HostStatusLine> = fsa
        .hosts()
        .map(|h| HostStatusLine {
            alias: h.host_alias().to_string(),
            hostname: h.active_hostname().to_string(),
            error_counter: h.error_counter,
            total_file_counter: h.total_file_counter,
            total_file_size: h.total_file_size,
            file_counter_done: h.file_counter_done,
            bytes_send: h.bytes_send,
            active_transfers: h.active_transfers,
            allowed_transfers: h.allowed_transfers,
            jobs_queued: h.jobs_queued,
            connections: h.connections,
            host_status: h.host_status,
        })
        .collect();

    if json {
        println!("{}", serde_json::to_string_pretty(&lines)?);
        return Ok(());
    }

    println!(
        "{:<9} {:<24} {:>5} {:>7} {:>12} {:>7} {:>12} {:>5} {:>6}",
        "ALIAS", "HOST", "ERR", "QUEUED", "QUEUED_BYTES", "DONE", "SENT_BYTES", "ACT", "JOBS"
    );
    for l in lines {
        println!(
            "{:<9} {:<24} {:>5} {:>7} {:>12} {:>7} {:>12} {:>3}/{:<2} {:>6}",
            l.alias,
            l.hostname,
            l.error_counter,
            l.total_file_counter,
            l.total_file_size,
            l.file_counter_done,
            l.bytes_send,
            l.active_transfers,
            l.allowed_transfers,
            l.jobs_queued,
        );
    }
    Ok(())
}
