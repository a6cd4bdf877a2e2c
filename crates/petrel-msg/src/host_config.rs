//! The HOST_CONFIG host table.
//!
//! One host per non-comment line, 15 colon-separated fields:
//!
//! ```text
//! alias:real1:real2:toggle:proxy:allowed:max_errors:retry:blksize:
//! succ_retries:fs_offset:timeout:no_bursts:host_status:special_flag
//! ```
//!
//! Missing trailing fields fall back to documented defaults, overlong
//! name fields warn and truncate, and numeric fields accept only
//! decimal digits (the file size offset also a leading `-`); anything
//! else warns and keeps the default.

use std::path::Path;

use petrel_core::{
    FileSizeOffset, DEFAULT_MAX_ERRORS, DEFAULT_RETRY_INTERVAL, DEFAULT_TRANSFER_BLOCK_SIZE,
    DEFAULT_TRANSFER_TIMEOUT, MAX_HOST_ALIAS_LENGTH, MAX_NO_PARALLEL_JOBS,
    MAX_PROXY_NAME_LENGTH, MAX_REAL_HOSTNAME_LENGTH,
};

use crate::Result;

pub const DEFAULT_ALLOWED_TRANSFERS: u32 = 2;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostConfigEntry {
    pub alias: String,
    pub real_hostname: [String; 2],
    pub host_toggle: u8,
    pub proxy_name: String,
    pub allowed_transfers: u32,
    pub max_errors: u32,
    pub retry_interval: u32,
    pub transfer_block_size: u32,
    pub successful_retries: u32,
    pub file_size_offset: FileSizeOffset,
    pub transfer_timeout: u64,
    pub number_of_no_bursts: u32,
    pub host_status: u32,
    pub special_flag: u32,
}

impl Default for HostConfigEntry {
    fn default() -> Self {
        Self {
            alias: String::new(),
            real_hostname: [String::new(), String::new()],
            host_toggle: 1,
            proxy_name: String::new(),
            allowed_transfers: DEFAULT_ALLOWED_TRANSFERS,
            max_errors: DEFAULT_MAX_ERRORS,
            retry_interval: DEFAULT_RETRY_INTERVAL as u32,
            transfer_block_size: DEFAULT_TRANSFER_BLOCK_SIZE as u32,
            successful_retries: 0,
            file_size_offset: FileSizeOffset::Disabled,
            transfer_timeout: DEFAULT_TRANSFER_TIMEOUT,
            number_of_no_bursts: 0,
            host_status: 0,
            special_flag: 0,
        }
    }
}

fn truncate_name(field: &str, value: &str, max: usize) -> String {
    if value.len() > max {
        tracing::warn!(
            field,
            value,
            max,
            "name longer than allowed, truncating"
        );
        value[..max].to_string()
    } else {
        value.to_string()
    }
}

fn parse_number<T>(field: &str, alias: &str, value: &str, default: T) -> T
where
    T: std::str::FromStr + Copy,
{
    if value.is_empty() {
        return default;
    }
    if !value.chars().all(|c| c.is_ascii_digit()) {
        tracing::warn!(field, host = alias, value, "non numeric character, using default");
        return default;
    }
    value.parse().unwrap_or(default)
}

impl HostConfigEntry {
    /// Parse one non-comment HOST_CONFIG line. Only an empty alias is
    /// unrecoverable.
    pub fn parse_line(line: &str) -> Option<Self> {
        let mut fields = line.split(':');
        let alias = fields.next()?.trim();
        if alias.is_empty() {
            return None;
        }
        let mut entry = HostConfigEntry {
            alias: truncate_name("alias", alias, MAX_HOST_ALIAS_LENGTH),
            ..Default::default()
        };

        let mut next = |entry_field: &mut dyn FnMut(&mut HostConfigEntry, &str)| {
            if let Some(value) = fields.next() {
                entry_field(&mut entry, value.trim());
            }
        };

        next(&mut |e, v| {
            e.real_hostname[0] = truncate_name("real hostname 1", v, MAX_REAL_HOSTNAME_LENGTH)
        });
        next(&mut |e, v| {
            e.real_hostname[1] = truncate_name("real hostname 2", v, MAX_REAL_HOSTNAME_LENGTH)
        });
        next(&mut |e, v| {
            if !v.is_empty() {
                e.host_toggle = parse_number("host toggle", &e.alias.clone(), v, 1u8).clamp(1, 2);
            }
        });
        next(&mut |e, v| e.proxy_name = truncate_name("proxy name", v, MAX_PROXY_NAME_LENGTH));
        next(&mut |e, v| {
            let alias = e.alias.clone();
            e.allowed_transfers =
                parse_number("allowed transfers", &alias, v, DEFAULT_ALLOWED_TRANSFERS);
            if e.allowed_transfers > MAX_NO_PARALLEL_JOBS as u32 {
                tracing::warn!(
                    host = %alias,
                    value = e.allowed_transfers,
                    max = MAX_NO_PARALLEL_JOBS,
                    "too many parallel transfers, clamping"
                );
                e.allowed_transfers = MAX_NO_PARALLEL_JOBS as u32;
            }
        });
        next(&mut |e, v| {
            e.max_errors = parse_number("max errors", &e.alias.clone(), v, DEFAULT_MAX_ERRORS)
        });
        next(&mut |e, v| {
            e.retry_interval =
                parse_number("retry interval", &e.alias.clone(), v, DEFAULT_RETRY_INTERVAL as u32)
        });
        next(&mut |e, v| {
            e.transfer_block_size = parse_number(
                "transfer block size",
                &e.alias.clone(),
                v,
                DEFAULT_TRANSFER_BLOCK_SIZE as u32,
            )
        });
        next(&mut |e, v| {
            e.successful_retries = parse_number("successful retries", &e.alias.clone(), v, 0)
        });
        next(&mut |e, v| {
            if v.is_empty() {
                return;
            }
            let ok = v.strip_prefix('-').unwrap_or(v).chars().all(|c| c.is_ascii_digit());
            match (ok, v.parse::<i8>()) {
                (true, Ok(raw)) => e.file_size_offset = FileSizeOffset::from_raw(raw),
                _ => tracing::warn!(
                    host = %e.alias,
                    value = v,
                    "non numeric character in file size offset, using default"
                ),
            }
        });
        next(&mut |e, v| {
            e.transfer_timeout =
                parse_number("transfer timeout", &e.alias.clone(), v, DEFAULT_TRANSFER_TIMEOUT)
        });
        next(&mut |e, v| {
            let alias = e.alias.clone();
            e.number_of_no_bursts = parse_number("number of no bursts", &alias, v, 0);
            if e.number_of_no_bursts > e.allowed_transfers {
                tracing::warn!(
                    host = %alias,
                    value = e.number_of_no_bursts,
                    allowed = e.allowed_transfers,
                    "more no-burst slots than allowed transfers, clamping"
                );
                e.number_of_no_bursts = e.allowed_transfers;
            }
        });
        next(&mut |e, v| e.host_status = parse_number("host status", &e.alias.clone(), v, 0));
        next(&mut |e, v| e.special_flag = parse_number("special flag", &e.alias.clone(), v, 0));

        Some(entry)
    }

    pub fn render_line(&self) -> String {
        format!(
            "{}:{}:{}:{}:{}:{}:{}:{}:{}:{}:{}:{}:{}:{}:{}",
            self.alias,
            self.real_hostname[0],
            self.real_hostname[1],
            self.host_toggle,
            self.proxy_name,
            self.allowed_transfers,
            self.max_errors,
            self.retry_interval,
            self.transfer_block_size,
            self.successful_retries,
            self.file_size_offset.to_raw(),
            self.transfer_timeout,
            self.number_of_no_bursts,
            self.host_status,
            self.special_flag,
        )
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HostConfig {
    pub entries: Vec<HostConfigEntry>,
}

impl HostConfig {
    pub fn parse(text: &str) -> Self {
        let entries = text
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty() && !l.starts_with('#'))
            .filter_map(HostConfigEntry::parse_line)
            .collect();
        Self { entries }
    }

    pub fn read(path: &Path) -> Result<Self> {
        Ok(Self::parse(&std::fs::read_to_string(path)?))
    }

    pub fn render(&self) -> String {
        let mut out = String::from(
            "# Host table: alias:real1:real2:toggle:proxy:allowed:max_errors:\\\n\
             #             retry:blksize:succ_retries:fs_offset:timeout:no_bursts:\\\n\
             #             host_status:special_flag\n",
        );
        for entry in &self.entries {
            out.push_str(&entry.render_line());
            out.push('\n');
        }
        out
    }

    pub fn write(&self, path: &Path) -> Result<()> {
        std::fs::write(path, self.render())?;
        Ok(())
    }

    pub fn get(&self, alias: &str) -> Option<&HostConfigEntry> {
        self.entries.iter().find(|e| e.alias == alias)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use petrel_core::types::AUTO_SIZE_DETECT;

    #[test]
    fn seed_host_line() {
        let e = HostConfigEntry::parse_line("h1:srv::::5:10:30:1024:10:-1:60:1:0:0");
        // Field order: alias, real1, real2, toggle, proxy, allowed, ...
        let e = e.unwrap();
        assert_eq!(e.alias, "h1");
        assert_eq!(e.real_hostname[0], "srv");
        assert_eq!(e.allowed_transfers, 5);
        assert_eq!(e.max_errors, 10);
        assert_eq!(e.retry_interval, 30);
        assert_eq!(e.transfer_block_size, 1024);
        assert_eq!(e.successful_retries, 10);
        assert_eq!(e.file_size_offset, FileSizeOffset::Disabled);
        assert_eq!(e.transfer_timeout, 60);
        assert_eq!(e.number_of_no_bursts, 1);
    }

    #[test]
    fn missing_trailing_fields_default() {
        let e = HostConfigEntry::parse_line("wx:gate.wmo").unwrap();
        assert_eq!(e.alias, "wx");
        assert_eq!(e.allowed_transfers, DEFAULT_ALLOWED_TRANSFERS);
        assert_eq!(e.max_errors, DEFAULT_MAX_ERRORS);
        assert_eq!(e.transfer_timeout, DEFAULT_TRANSFER_TIMEOUT);
        assert_eq!(e.number_of_no_bursts, 0);
    }

    #[test]
    fn numeric_fields_reject_garbage() {
        let e = HostConfigEntry::parse_line("h:r:::::abc:10x:::-9z").unwrap();
        assert_eq!(e.allowed_transfers, DEFAULT_ALLOWED_TRANSFERS);
        assert_eq!(e.max_errors, DEFAULT_MAX_ERRORS);
        assert_eq!(e.file_size_offset, FileSizeOffset::Disabled);
    }

    #[test]
    fn no_bursts_clamped_to_allowed() {
        let line = ["h", "r", "", "", "", "3", "", "", "", "", "", "", "9", "", ""].join(":");
        let e = HostConfigEntry::parse_line(&line).unwrap();
        assert_eq!(e.allowed_transfers, 3);
        assert_eq!(e.number_of_no_bursts, 3);
    }

    #[test]
    fn allowed_transfers_clamped() {
        let e = HostConfigEntry::parse_line("h:r:::::99").unwrap();
        assert_eq!(e.allowed_transfers, MAX_NO_PARALLEL_JOBS as u32);
    }

    #[test]
    fn overlong_alias_truncates() {
        let e = HostConfigEntry::parse_line("verylonghostalias:r").unwrap();
        assert_eq!(e.alias, "verylong");
    }

    #[test]
    fn auto_size_detect_round_trip() {
        let mut entry = HostConfigEntry { alias: "h".into(), ..Default::default() };
        entry.real_hostname[0] = "r".into();
        entry.file_size_offset = FileSizeOffset::from_raw(AUTO_SIZE_DETECT);

        let parsed = HostConfigEntry::parse_line(&entry.render_line()).unwrap();
        assert_eq!(parsed, entry);
    }

    #[test]
    fn file_parse_skips_comments() {
        let cfg = HostConfig::parse("# comment\n\nh1:r1\nh2:r2\n");
        assert_eq!(cfg.entries.len(), 2);
        assert!(cfg.get("h2").is_some());
        assert!(cfg.get("h3").is_none());
    }

    #[test]
    fn render_read_round_trip() {
        let cfg = HostConfig::parse("h1:srv::::5:10:30:1024:10:-1:60:1:0:0\nh2:backup:alt:2::4:5:60:4096:0:-2:120:0:0:6\n");
        let again = HostConfig::parse(&cfg.render());
        assert_eq!(again, cfg);
    }
}
