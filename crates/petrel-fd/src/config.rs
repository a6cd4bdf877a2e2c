use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::{FdError, Result};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FdConfig {
    /// Root of the shared on-disk layout (fifos, msgs, files, archive).
    pub work_dir: PathBuf,
    /// The host table.
    pub host_config: PathBuf,
    /// Seconds between queue-directory scans when nothing wakes us.
    pub scan_interval_secs: u64,
    /// Hard ceiling on concurrently running sender processes.
    pub max_connections: usize,
    /// Sender binary to spawn; looked up in PATH when relative.
    pub sender_binary: PathBuf,
    pub logging: LoggingConfig,
}

impl Default for FdConfig {
    fn default() -> Self {
        Self {
            work_dir: PathBuf::from("/var/lib/petrel"),
            host_config: PathBuf::from("/etc/petrel/HOST_CONFIG"),
            scan_interval_secs: 5,
            max_connections: 50,
            sender_binary: PathBuf::from("petrel-sf-ftp"),
            logging: LoggingConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub file: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            file: None,
        }
    }
}

pub fn load_config(path: &std::path::Path) -> Result<FdConfig> {
    let contents = std::fs::read_to_string(path)?;
    let config: FdConfig = toml::from_str(&contents)
        .map_err(|e| FdError::Dispatch(format!("invalid config file {}: {e}", path.display())))?;
    Ok(config)
}

pub fn write_default_config(path: &std::path::Path) -> Result<()> {
    let contents = toml::to_string_pretty(&FdConfig::default())
        .map_err(|e| FdError::Dispatch(format!("failed to serialize default config: {e}")))?;
    std::fs::write(path, contents)?;
    Ok(())
}

/// Reject configurations that cannot work before any process starts.
pub fn validate_config(config: &FdConfig) -> Result<()> {
    if !config.work_dir.is_absolute() {
        return Err(FdError::Dispatch("work_dir must be an absolute path".into()));
    }
    if config.scan_interval_secs == 0 {
        return Err(FdError::Dispatch("scan_interval_secs must be non-zero".into()));
    }
    if config.max_connections == 0 {
        return Err(FdError::Dispatch("max_connections must be non-zero".into()));
    }
    match std::fs::metadata(&config.host_config) {
        Ok(meta) if meta.is_file() => {}
        Ok(_) => {
            return Err(FdError::Dispatch(format!(
                "host_config {} is not a file",
                config.host_config.display()
            )));
        }
        Err(e) => {
            return Err(FdError::Dispatch(format!(
                "host_config {}: {e}",
                config.host_config.display()
            )));
        }
    }
    Ok(())
}
