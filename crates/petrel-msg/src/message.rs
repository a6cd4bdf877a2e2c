//! Reading and writing job message files.
//!
//! A message file is line-delimited text: a `[destination]` section
//! whose next line is the recipient URL, then an optional `[options]`
//! section of identifier lines. The dispatcher writes them, a sender
//! reads one per job and owns it until the job completes.

use std::path::Path;

use crate::options::{Options, RestartFile};
use crate::recipient::Recipient;
use crate::{MsgError, Result};

pub const DESTINATION_MARKER: &str = "[destination]";
pub const OPTIONS_MARKER: &str = "[options]";

#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub recipient: Recipient,
    pub options: Options,
}

impl Message {
    pub fn parse(text: &str) -> Result<Self> {
        let mut lines = text.lines();

        // Everything before the destination marker is ignored.
        let found = lines.by_ref().any(|l| l.trim() == DESTINATION_MARKER);
        if !found {
            return Err(MsgError::Invalid("no [destination] section".into()));
        }
        let url = lines
            .by_ref()
            .map(str::trim)
            .find(|l| !l.is_empty())
            .ok_or_else(|| MsgError::Invalid("no recipient after [destination]".into()))?;
        if url.starts_with('[') {
            return Err(MsgError::Invalid("no recipient after [destination]".into()));
        }
        let recipient = Recipient::parse(url)?;

        let mut option_lines = Vec::new();
        let mut in_options = false;
        for line in lines {
            let line = line.trim();
            if line == OPTIONS_MARKER {
                in_options = true;
                continue;
            }
            if in_options {
                if line.starts_with('[') {
                    break;
                }
                option_lines.push(line);
            }
        }
        let options = Options::parse_lines(option_lines.into_iter(), recipient.scheme);

        Ok(Self { recipient, options })
    }

    pub fn read(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::parse(&text)
    }

    /// Render the message so that reading it back yields the same
    /// value.
    pub fn render(&self) -> String {
        let mut out = String::new();
        out.push_str(DESTINATION_MARKER);
        out.push('\n');
        out.push_str(&self.recipient.to_url());
        out.push('\n');
        let option_lines = self.options.render_lines();
        if !option_lines.is_empty() {
            out.push('\n');
            out.push_str(OPTIONS_MARKER);
            out.push('\n');
            for line in option_lines {
                out.push_str(&line);
                out.push('\n');
            }
        }
        out
    }

    pub fn write(&self, path: &Path) -> Result<()> {
        std::fs::write(path, self.render())?;
        Ok(())
    }
}

/// Drop one entry from the restart list of the message at `path`. Used
/// after a file that was being appended finally went through.
pub fn remove_append(path: &Path, name: &str) -> Result<()> {
    let mut message = Message::read(path)?;
    let before = message.options.restart_files.len();
    message.options.restart_files.retain(|r| r.name != name);
    if message.options.restart_files.len() != before {
        message.write(path)?;
    }
    Ok(())
}

/// Drop the whole restart list, used once every file of the job is
/// through so stale append names cannot linger forever.
pub fn remove_all_appends(path: &Path) -> Result<()> {
    let mut message = Message::read(path)?;
    if !message.options.restart_files.is_empty() {
        message.options.restart_files.clear();
        message.write(path)?;
    }
    Ok(())
}

/// Record a partly transferred file in the restart list so the next
/// attempt can append instead of starting over.
pub fn log_append(path: &Path, entry: RestartFile) -> Result<()> {
    let mut message = Message::read(path)?;
    if let Some(existing) = message
        .options
        .restart_files
        .iter_mut()
        .find(|r| r.name == entry.name)
    {
        existing.date = entry.date;
    } else {
        message.options.restart_files.push(entry);
    }
    message.write(path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::options::LockMode;

    #[test]
    fn minimal_message() {
        let m = Message::parse("[destination]\nftp://u:p@srv/out/\n").unwrap();
        assert_eq!(m.recipient.host, "srv");
        // No [options] section: everything at defaults.
        assert_eq!(m.options, Options::default());
    }

    #[test]
    fn message_with_options() {
        let m = Message::parse(
            "[destination]\n\
             ftp://u:p@srv/out/\n\
             \n\
             [options]\n\
             lock DOT_VMS\n\
             archive 1\n",
        )
        .unwrap();
        assert_eq!(m.options.lock, LockMode::DotVms);
        assert_eq!(m.options.archive_days, Some(1));
    }

    #[test]
    fn missing_destination_is_fatal() {
        assert!(Message::parse("[options]\narchive 1\n").is_err());
        assert!(Message::parse("").is_err());
        assert!(Message::parse("[destination]\n[options]\n").is_err());
    }

    #[test]
    fn bad_recipient_is_fatal() {
        assert!(Message::parse("[destination]\nnot a url\n").is_err());
    }

    #[test]
    fn write_read_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("4711");

        let mut message = Message::parse("[destination]\nftp://u:p@srv:2121/out/\n").unwrap();
        message.options.archive_days = Some(2);
        message.options.lock = LockMode::Postfix;
        message.options.lock_postfix = Some(".part".into());
        message.options.restart_files = vec![RestartFile { name: "A".into(), date: 9 }];

        message.write(&path).unwrap();
        let back = Message::read(&path).unwrap();
        assert_eq!(back, message);
    }

    #[test]
    fn append_list_editing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("4711");
        Message::parse("[destination]\nftp://u:p@srv/out/\n")
            .unwrap()
            .write(&path)
            .unwrap();

        log_append(&path, RestartFile { name: "A".into(), date: 111 }).unwrap();
        log_append(&path, RestartFile { name: "B".into(), date: 222 }).unwrap();
        log_append(&path, RestartFile { name: "A".into(), date: 333 }).unwrap();

        let m = Message::read(&path).unwrap();
        assert_eq!(m.options.restart_files.len(), 2);
        assert_eq!(m.options.restart_files[0].date, 333);

        remove_append(&path, "A").unwrap();
        let m = Message::read(&path).unwrap();
        assert_eq!(m.options.restart_files.len(), 1);
        assert_eq!(m.options.restart_files[0].name, "B");

        remove_all_appends(&path).unwrap();
        assert!(Message::read(&path).unwrap().options.restart_files.is_empty());
    }
}
