use std::path::PathBuf;

use petrel_core::WorkDir;
use petrel_msg::message::{Message, DESTINATION_MARKER, OPTIONS_MARKER};

/// Write a job message by hand, mostly useful for testing a setup:
/// the option lines are validated by parsing the rendered message
/// back before it is put where the dispatcher looks.
pub fn write_message(
    work_dir: Option<PathBuf>,
    job_id: u32,
    url: &str,
    option_lines: &[String],
) -> anyhow::Result<()> {
    let work_dir = WorkDir::resolve(work_dir)?;
    work_dir.create_all()?;

    let mut text = format!("{DESTINATION_MARKER}\n{url}\n");
    if !option_lines.is_empty() {
        text.push('\n');
        text.push_str(OPTIONS_MARKER);
        text.push('\n');
        for line in option_lines {
            text.push_str(line);
            text.push('\n');
        }
    }

    let message = Message::parse(&text)?;
    let path = work_dir.msg_file(job_id);
    message.write(&path)?;
    println!("wrote message {} for {}", path.display(), message.recipient.host);
    println!(
        "spool files under {}",
        work_dir.job_file_dir(&format!("{job_id}_0")).display()
    );
    Ok(())
}
