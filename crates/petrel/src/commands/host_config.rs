use std::path::Path;

use petrel_msg::HostConfig;

pub fn check(path: &Path) -> anyhow::Result<()> {
    let config = HostConfig::read(path)?;
    if config.entries.is_empty() {
        anyhow::bail!("{} contains no hosts", path.display());
    }
    for entry in &config.entries {
        println!(
            "{:<9} real={}/{} transfers={} max_errors={} retry={}s blksize={} fso={:?} timeout={}s no_bursts={}",
            entry.alias,
            entry.real_hostname[0],
            if entry.real_hostname[1].is_empty() { "-" } else { &entry.real_hostname[1] },
            entry.allowed_transfers,
            entry.max_errors,
            entry.retry_interval,
            entry.transfer_block_size,
            entry.file_size_offset,
            entry.transfer_timeout,
            entry.number_of_no_bursts,
        );
    }
    println!("{} host(s) ok", config.entries.len());
    Ok(())
}

pub fn init(path: &Path) -> anyhow::Result<()> {
    let sample = HostConfig::parse("example:ftp.example.org::::2:10:120:4096:0:-1:120:0:0:0\n");
    sample.write(path)?;
    println!("wrote sample host table to {}", path.display());
    Ok(())
}
