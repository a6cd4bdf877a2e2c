//! The `[options]` section of a job message.
//!
//! Each line starts with a recognized identifier; the parser is a table
//! mapping identifiers to typed field parsers. Parsing is forgiving:
//! unknown identifiers, duplicate identifiers and malformed values all
//! warn and skip the line, they never fail the job.

use std::path::PathBuf;

use chrono::{DateTime, Local};
use petrel_core::MAX_RULE_HEADER_LENGTH;

use crate::recipient::Scheme;

/// How an in-progress file is distinguished from a complete one on the
/// remote side.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum LockMode {
    /// Upload directly under the final name.
    #[default]
    Off,
    /// Upload under a dotted prefix, rename into place when done.
    Dot,
    /// Like `Dot`, but the rename appends the dot at the end (VMS).
    DotVms,
    /// Upload under the final name plus a postfix, rename when done.
    Postfix,
    /// Create a `.lock` sentinel once per session.
    Lockfile,
    /// Write a `<name>_rdy` file of type A after the transfer.
    ReadyA,
    /// Write a `<name>_rdy` file of type B after the transfer.
    ReadyB,
    /// A custom dotted prefix (at most 40 characters).
    Custom(String),
}

impl LockMode {
    /// The prefix prepended to the remote name while transferring.
    pub fn dot_notation(&self) -> Option<&str> {
        match self {
            LockMode::Dot | LockMode::DotVms => Some("."),
            LockMode::Custom(notation) => Some(notation),
            _ => None,
        }
    }

    /// Whether the transfer ends with a rename to the final name.
    pub fn renames_after_transfer(&self) -> bool {
        matches!(
            self,
            LockMode::Dot | LockMode::DotVms | LockMode::Postfix | LockMode::Custom(_)
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Subject {
    Literal(String),
    File(PathBuf),
}

impl Subject {
    /// Expand `%t<c>` time placeholders against `now`.
    pub fn expand(raw: &str, now: DateTime<Local>) -> String {
        let mut out = String::with_capacity(raw.len());
        let mut chars = raw.chars().peekable();
        while let Some(c) = chars.next() {
            if c == '%' && chars.peek() == Some(&'t') {
                chars.next();
                match chars.next() {
                    Some(spec) => out.push_str(&now.format(&format!("%{spec}")).to_string()),
                    None => out.push_str("%t"),
                }
            } else {
                out.push(c);
            }
        }
        out
    }
}

/// One `<name>|<date>` entry of the restart (append) list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RestartFile {
    pub name: String,
    pub date: i64,
}

impl RestartFile {
    pub fn parse(token: &str) -> Self {
        match token.split_once('|') {
            Some((name, date)) => Self {
                name: name.to_string(),
                date: date.parse().unwrap_or(0),
            },
            // Legacy entries carry no date.
            None => Self {
                name: token.to_string(),
                date: 0,
            },
        }
    }

    pub fn render(&self) -> String {
        format!("{}|{}", self.name, self.date)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FtpMode {
    Active,
    Passive,
}

/// Every option a job message can carry. Fields not mentioned in the
/// message keep their defaults.
#[derive(Debug, Clone, PartialEq)]
pub struct Options {
    pub archive_days: Option<u32>,
    pub age_limit_secs: Option<u64>,
    pub lock: LockMode,
    pub lock_postfix: Option<String>,
    pub trans_rename_rule: Option<String>,
    pub chmod: Option<String>,
    pub chown: Option<(String, Option<String>)>,
    pub output_log: bool,
    pub restart_files: Vec<RestartFile>,
    pub file_name_is_header: bool,
    pub subject: Option<Subject>,
    pub force_copy: bool,
    pub file_name_is_subject: bool,
    pub file_name_is_user: bool,
    pub encode_ansi: bool,
    pub check_reply: bool,
    pub with_sequence_number: bool,
    pub attach_file: bool,
    pub attach_all_files: bool,
    pub reply_to: Option<String>,
    pub from: Option<String>,
    pub charset: Option<String>,
    pub add_mail_header: Option<Option<PathBuf>>,
    pub ftp_exec: Option<String>,
    pub trans_exec: Option<String>,
    pub eumetsat_header: Option<[u8; 5]>,
    pub rename_file_busy: Option<char>,
    pub ftp_mode: Option<FtpMode>,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            archive_days: None,
            age_limit_secs: None,
            lock: LockMode::default(),
            lock_postfix: None,
            trans_rename_rule: None,
            chmod: None,
            chown: None,
            output_log: true,
            restart_files: Vec::new(),
            file_name_is_header: false,
            subject: None,
            force_copy: false,
            file_name_is_subject: false,
            file_name_is_user: false,
            encode_ansi: false,
            check_reply: false,
            with_sequence_number: false,
            attach_file: false,
            attach_all_files: false,
            reply_to: None,
            from: None,
            charset: None,
            add_mail_header: None,
            ftp_exec: None,
            trans_exec: None,
            eumetsat_header: None,
            rename_file_busy: None,
            ftp_mode: None,
        }
    }
}

type Setter = fn(&mut Options, &str, Scheme) -> std::result::Result<(), String>;

/// Identifier table. Longer identifiers that share a prefix with a
/// shorter one (`lock postfix` vs `lock`) come first so the prefix
/// match picks the right row.
const TABLE: &[(&str, Setter)] = &[
    ("archive", set_archive),
    ("age-limit", set_age_limit),
    ("lock postfix", set_lock_postfix),
    ("lock", set_lock),
    ("trans_rename", set_trans_rename),
    ("chmod", set_chmod),
    ("chown", set_chown),
    ("no output log", set_no_output_log),
    ("restart file", set_restart_files),
    ("file name is header", set_name_is_header),
    ("file name is subject", set_name_is_subject),
    ("file name is user", set_name_is_user),
    ("subject", set_subject),
    ("force copy", set_force_copy),
    ("reply-to", set_reply_to),
    ("from", set_from),
    ("charset", set_charset),
    ("encode ansi", set_encode_ansi),
    ("check reply", set_check_reply),
    ("with sequence number", set_with_sequence_number),
    ("attach all files", set_attach_all_files),
    ("attach file", set_attach_file),
    ("add mail header", set_add_mail_header),
    ("ftp exec", set_ftp_exec),
    ("trans exec", set_trans_exec),
    ("eumetsat header", set_eumetsat_header),
    ("rename file busy", set_rename_file_busy),
    ("passive", set_passive),
    ("active", set_active),
];

impl Options {
    /// Parse the identifier lines following `[options]`. Never fails;
    /// problems are logged and the line is skipped.
    pub fn parse_lines<'a>(lines: impl Iterator<Item = &'a str>, scheme: Scheme) -> Self {
        let mut options = Options::default();
        let mut seen = [false; TABLE.len()];

        for line in lines {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let Some(row) = TABLE
                .iter()
                .position(|(id, _)| line == *id || line.starts_with(&format!("{id} ")))
            else {
                tracing::warn!(line, "unknown option, ignored");
                continue;
            };
            if seen[row] {
                tracing::warn!(option = TABLE[row].0, "option given twice, second ignored");
                continue;
            }
            let value = line[TABLE[row].0.len()..].trim();
            match (TABLE[row].1)(&mut options, value, scheme) {
                Ok(()) => seen[row] = true,
                Err(reason) => {
                    tracing::warn!(option = TABLE[row].0, %reason, "malformed option, ignored");
                }
            }
        }
        options
    }

    /// Render back into identifier lines; the inverse of
    /// [`Options::parse_lines`] for every recognized option.
    pub fn render_lines(&self) -> Vec<String> {
        let mut lines = Vec::new();
        if let Some(days) = self.archive_days {
            lines.push(format!("archive {days}"));
        }
        if let Some(secs) = self.age_limit_secs {
            lines.push(format!("age-limit {secs}"));
        }
        match &self.lock {
            LockMode::Off => {}
            LockMode::Dot => lines.push("lock DOT".into()),
            LockMode::DotVms => lines.push("lock DOT_VMS".into()),
            LockMode::Postfix => lines.push("lock POSTFIX".into()),
            LockMode::Lockfile => lines.push("lock LOCKFILE".into()),
            LockMode::ReadyA => lines.push("lock READY_A".into()),
            LockMode::ReadyB => lines.push("lock READY_B".into()),
            LockMode::Custom(notation) => lines.push(format!("lock {notation}")),
        }
        if let Some(postfix) = &self.lock_postfix {
            lines.push(format!("lock postfix {postfix}"));
        }
        if let Some(rule) = &self.trans_rename_rule {
            lines.push(format!("trans_rename {rule}"));
        }
        if let Some(chmod) = &self.chmod {
            lines.push(format!("chmod {chmod}"));
        }
        if let Some((user, group)) = &self.chown {
            match group {
                Some(group) => lines.push(format!("chown {user}:{group}")),
                None => lines.push(format!("chown {user}")),
            }
        }
        if !self.output_log {
            lines.push("no output log".into());
        }
        if !self.restart_files.is_empty() {
            let list: Vec<String> = self.restart_files.iter().map(RestartFile::render).collect();
            lines.push(format!("restart file {}", list.join(" ")));
        }
        if self.file_name_is_header {
            lines.push("file name is header".into());
        }
        match &self.subject {
            Some(Subject::Literal(text)) => lines.push(format!("subject \"{text}\"")),
            Some(Subject::File(path)) => lines.push(format!("subject {}", path.display())),
            None => {}
        }
        if self.force_copy {
            lines.push("force copy".into());
        }
        if self.file_name_is_subject {
            lines.push("file name is subject".into());
        }
        if self.file_name_is_user {
            lines.push("file name is user".into());
        }
        if self.encode_ansi {
            lines.push("encode ansi".into());
        }
        if self.check_reply {
            lines.push("check reply".into());
        }
        if self.with_sequence_number {
            lines.push("with sequence number".into());
        }
        if self.attach_file {
            lines.push("attach file".into());
        }
        if self.attach_all_files {
            lines.push("attach all files".into());
        }
        if let Some(reply_to) = &self.reply_to {
            lines.push(format!("reply-to {reply_to}"));
        }
        if let Some(from) = &self.from {
            lines.push(format!("from {from}"));
        }
        if let Some(charset) = &self.charset {
            lines.push(format!("charset {charset}"));
        }
        match &self.add_mail_header {
            Some(Some(path)) => lines.push(format!("add mail header {}", path.display())),
            Some(None) => lines.push("add mail header".into()),
            None => {}
        }
        if let Some(cmd) = &self.ftp_exec {
            lines.push(format!("ftp exec {cmd}"));
        }
        if let Some(cmd) = &self.trans_exec {
            lines.push(format!("trans exec {cmd}"));
        }
        if let Some(header) = &self.eumetsat_header {
            lines.push(format!(
                "eumetsat header {}.{}.{}.{} {}",
                header[0], header[1], header[2], header[3], header[4]
            ));
        }
        if let Some(c) = self.rename_file_busy {
            lines.push(format!("rename file busy {c}"));
        }
        match self.ftp_mode {
            Some(FtpMode::Passive) => lines.push("passive".into()),
            Some(FtpMode::Active) => lines.push("active".into()),
            None => {}
        }
        lines
    }
}

fn set_archive(o: &mut Options, v: &str, _: Scheme) -> std::result::Result<(), String> {
    o.archive_days = Some(v.parse().map_err(|_| format!("bad day count `{v}`"))?);
    Ok(())
}

fn set_age_limit(o: &mut Options, v: &str, _: Scheme) -> std::result::Result<(), String> {
    o.age_limit_secs = Some(v.parse().map_err(|_| format!("bad second count `{v}`"))?);
    Ok(())
}

fn set_lock(o: &mut Options, v: &str, _: Scheme) -> std::result::Result<(), String> {
    o.lock = match v {
        "DOT" => LockMode::Dot,
        "DOT_VMS" => LockMode::DotVms,
        "LOCKFILE" => LockMode::Lockfile,
        "OFF" => LockMode::Off,
        "POSTFIX" => LockMode::Postfix,
        "READY_A" => LockMode::ReadyA,
        "READY_B" => LockMode::ReadyB,
        "" => return Err("missing lock mode".into()),
        custom => {
            if custom.len() > 40 {
                return Err(format!("lock notation `{custom}` longer than 40 characters"));
            }
            LockMode::Custom(custom.to_string())
        }
    };
    Ok(())
}

fn set_lock_postfix(o: &mut Options, v: &str, _: Scheme) -> std::result::Result<(), String> {
    if v.is_empty() {
        return Err("missing postfix notation".into());
    }
    o.lock_postfix = Some(v.to_string());
    Ok(())
}

fn set_trans_rename(o: &mut Options, v: &str, _: Scheme) -> std::result::Result<(), String> {
    if v.is_empty() || v.len() > MAX_RULE_HEADER_LENGTH {
        return Err(format!("bad rule header `{v}`"));
    }
    o.trans_rename_rule = Some(v.to_string());
    Ok(())
}

fn set_chmod(o: &mut Options, v: &str, _: Scheme) -> std::result::Result<(), String> {
    let digits = v.len() == 3 || v.len() == 4;
    if !digits || !v.chars().all(|c| ('0'..='7').contains(&c)) {
        return Err(format!("`{v}` is not 3 or 4 octal digits"));
    }
    o.chmod = Some(v.to_string());
    Ok(())
}

fn set_chown(o: &mut Options, v: &str, scheme: Scheme) -> std::result::Result<(), String> {
    if scheme != Scheme::Loc {
        return Err("chown is only honoured for local delivery".into());
    }
    if v.is_empty() {
        return Err("missing owner".into());
    }
    match v.split_once([':', '.']) {
        Some((user, group)) => o.chown = Some((user.to_string(), Some(group.to_string()))),
        None => o.chown = Some((v.to_string(), None)),
    }
    Ok(())
}

fn set_no_output_log(o: &mut Options, _: &str, _: Scheme) -> std::result::Result<(), String> {
    o.output_log = false;
    Ok(())
}

fn set_restart_files(o: &mut Options, v: &str, _: Scheme) -> std::result::Result<(), String> {
    if v.is_empty() {
        return Err("empty restart list".into());
    }
    o.restart_files = v.split_whitespace().map(RestartFile::parse).collect();
    Ok(())
}

fn set_name_is_header(o: &mut Options, _: &str, _: Scheme) -> std::result::Result<(), String> {
    o.file_name_is_header = true;
    Ok(())
}

fn set_subject(o: &mut Options, v: &str, _: Scheme) -> std::result::Result<(), String> {
    if let Some(stripped) = v.strip_prefix('"') {
        let text = stripped.strip_suffix('"').unwrap_or(stripped);
        o.subject = Some(Subject::Literal(text.to_string()));
    } else if v.starts_with('/') {
        o.subject = Some(Subject::File(PathBuf::from(v)));
    } else {
        return Err(format!("subject must be quoted or an absolute path, got `{v}`"));
    }
    Ok(())
}

fn set_force_copy(o: &mut Options, _: &str, _: Scheme) -> std::result::Result<(), String> {
    o.force_copy = true;
    Ok(())
}

fn set_name_is_subject(o: &mut Options, _: &str, _: Scheme) -> std::result::Result<(), String> {
    o.file_name_is_subject = true;
    Ok(())
}

fn set_name_is_user(o: &mut Options, _: &str, _: Scheme) -> std::result::Result<(), String> {
    o.file_name_is_user = true;
    Ok(())
}

fn set_encode_ansi(o: &mut Options, _: &str, _: Scheme) -> std::result::Result<(), String> {
    o.encode_ansi = true;
    Ok(())
}

fn set_check_reply(o: &mut Options, _: &str, _: Scheme) -> std::result::Result<(), String> {
    o.check_reply = true;
    Ok(())
}

fn set_with_sequence_number(o: &mut Options, _: &str, _: Scheme) -> std::result::Result<(), String> {
    o.with_sequence_number = true;
    Ok(())
}

fn set_attach_file(o: &mut Options, _: &str, _: Scheme) -> std::result::Result<(), String> {
    o.attach_file = true;
    Ok(())
}

fn set_attach_all_files(o: &mut Options, _: &str, _: Scheme) -> std::result::Result<(), String> {
    o.attach_all_files = true;
    Ok(())
}

fn set_reply_to(o: &mut Options, v: &str, _: Scheme) -> std::result::Result<(), String> {
    o.reply_to = Some(v.to_string());
    Ok(())
}

fn set_from(o: &mut Options, v: &str, _: Scheme) -> std::result::Result<(), String> {
    o.from = Some(v.to_string());
    Ok(())
}

fn set_charset(o: &mut Options, v: &str, _: Scheme) -> std::result::Result<(), String> {
    o.charset = Some(v.to_string());
    Ok(())
}

fn set_add_mail_header(o: &mut Options, v: &str, _: Scheme) -> std::result::Result<(), String> {
    o.add_mail_header = if v.is_empty() {
        Some(None)
    } else {
        Some(Some(PathBuf::from(v)))
    };
    Ok(())
}

fn set_ftp_exec(o: &mut Options, v: &str, _: Scheme) -> std::result::Result<(), String> {
    if v.is_empty() {
        return Err("missing command".into());
    }
    o.ftp_exec = Some(v.to_string());
    Ok(())
}

fn set_trans_exec(o: &mut Options, v: &str, _: Scheme) -> std::result::Result<(), String> {
    if v.is_empty() {
        return Err("missing command".into());
    }
    o.trans_exec = Some(v.to_string());
    Ok(())
}

fn set_eumetsat_header(o: &mut Options, v: &str, _: Scheme) -> std::result::Result<(), String> {
    let mut parts = v.split_whitespace();
    let addr = parts.next().ok_or("missing address")?;
    let env_id: u16 = parts
        .next()
        .ok_or("missing DestEnvId")?
        .parse()
        .map_err(|_| "bad DestEnvId".to_string())?;
    if env_id > 255 {
        return Err(format!("DestEnvId {env_id} above 255"));
    }
    let octets: Vec<u8> = addr
        .split('.')
        .map(|t| t.parse::<u8>())
        .collect::<std::result::Result<_, _>>()
        .map_err(|_| format!("bad IPv4 address `{addr}`"))?;
    if octets.len() != 4 {
        return Err(format!("bad IPv4 address `{addr}`"));
    }
    o.eumetsat_header = Some([octets[0], octets[1], octets[2], octets[3], env_id as u8]);
    Ok(())
}

fn set_rename_file_busy(o: &mut Options, v: &str, _: Scheme) -> std::result::Result<(), String> {
    let mut chars = v.chars();
    match (chars.next(), chars.next()) {
        (Some(c), None) => {
            o.rename_file_busy = Some(c);
            Ok(())
        }
        _ => Err(format!("expected one character, got `{v}`")),
    }
}

fn set_passive(o: &mut Options, _: &str, _: Scheme) -> std::result::Result<(), String> {
    o.ftp_mode = Some(FtpMode::Passive);
    Ok(())
}

fn set_active(o: &mut Options, _: &str, _: Scheme) -> std::result::Result<(), String> {
    o.ftp_mode = Some(FtpMode::Active);
    Ok(())
}
