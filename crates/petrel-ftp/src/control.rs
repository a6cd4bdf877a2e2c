//! The FTP control channel.
//!
//! One TCP connection, strictly command/response: write
//! `VERB SP args CRLF`, then read reply lines until one starts with
//! three digits followed by a space. Continuation lines (digits
//! followed by a dash, or anything else) are collected but do not end
//! the reply. The numeric code is what callers branch on; the reply
//! text is kept for logging.
//!
//! Every read and write is guarded by the transfer timeout. Once a
//! timeout fired the connection is considered dead: `quit` stops
//! waiting for replies so the kernel can drain the socket through
//! TIME_WAIT.

use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufStream};
use tokio::net::TcpStream;
use tokio::time::timeout;

use petrel_core::MAX_RET_MSG_LENGTH;

/// Type-of-service hints: low delay for the chatty control connection,
/// throughput for the bulk data connection.
pub const IPTOS_LOWDELAY: u32 = 0x10;
pub const IPTOS_THROUGHPUT: u32 = 0x08;

const USER_BUSY_RETRIES: u32 = 10;
const USER_BUSY_DELAY: Duration = Duration::from_millis(700);

#[derive(Error, Debug)]
pub enum FtpError {
    /// Local failure: socket error, unparsable reply, closed peer.
    #[error("ftp: {0}")]
    Local(String),

    /// The server answered, but with a code outside the accepted set.
    #[error("ftp reply {code}: {text}")]
    Reply { code: u16, text: String },

    /// A deadline elapsed. The session must skip QUIT afterwards.
    #[error("ftp: transfer timeout")]
    Timeout,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl FtpError {
    /// The numeric server code, if the server said anything at all.
    pub fn reply_code(&self) -> Option<u16> {
        match self {
            FtpError::Reply { code, .. } => Some(*code),
            _ => None,
        }
    }
}

pub type FtpResult<T> = std::result::Result<T, FtpError>;

pub struct Control {
    stream: BufStream<TcpStream>,
    local_addr: SocketAddr,
    peer_ip: IpAddr,
    transfer_timeout: Duration,
    /// Latched once any deadline elapses; `quit` then skips the
    /// goodbye handshake.
    timeout_flag: bool,
    /// Last full reply text, for logging unexpected server behaviour.
    last_reply: String,
}

fn set_tos(stream: &TcpStream, tos: u32) {
    let sock = socket2::SockRef::from(stream);
    if let Err(e) = sock.set_tos_v4(tos) {
        tracing::warn!("failed to set IP_TOS: {}", e);
    }
}

impl Control {
    /// Connect and consume the greeting. Returns the greeting code:
    /// 220 (or 120) normally, 230 when the server needs no login.
    pub async fn connect(
        host: &str,
        port: u16,
        transfer_timeout: Duration,
    ) -> FtpResult<(Self, u16)> {
        let stream = timeout(transfer_timeout, TcpStream::connect((host, port)))
            .await
            .map_err(|_| FtpError::Timeout)?
            .map_err(|e| FtpError::Local(format!("failed to connect to {host}:{port}: {e}")))?;
        set_tos(&stream, IPTOS_LOWDELAY);

        let local_addr = stream.local_addr()?;
        let peer_ip = stream.peer_addr()?.ip();
        let mut control = Self {
            stream: BufStream::new(stream),
            local_addr,
            peer_ip,
            transfer_timeout,
            timeout_flag: false,
            last_reply: String::new(),
        };

        let code = control.read_reply().await?;
        match code {
            120 | 220 | 230 => Ok((control, code)),
            _ => Err(control.unexpected(code)),
        }
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn peer_ip(&self) -> IpAddr {
        self.peer_ip
    }

    pub fn transfer_timeout(&self) -> Duration {
        self.transfer_timeout
    }

    pub fn timed_out(&self) -> bool {
        self.timeout_flag
    }

    pub fn last_reply(&self) -> &str {
        &self.last_reply
    }

    fn unexpected(&self, code: u16) -> FtpError {
        FtpError::Reply {
            code,
            text: self.last_reply.clone(),
        }
    }

    pub async fn send_command(&mut self, line: &str) -> FtpResult<()> {
        let mut wire = String::with_capacity(line.len() + 2);
        wire.push_str(line);
        wire.push_str("\r\n");
        match timeout(self.transfer_timeout, async {
            self.stream.write_all(wire.as_bytes()).await?;
            self.stream.flush().await
        })
        .await
        {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(e.into()),
            Err(_) => {
                self.timeout_flag = true;
                Err(FtpError::Timeout)
            }
        }
    }

    /// Read one complete reply and return its numeric code. Lines not
    /// shaped like `ddd<SP>` are continuations and skipped, exactly as
    /// multi-line replies require.
    pub async fn read_reply(&mut self) -> FtpResult<u16> {
        loop {
            let mut line = String::new();
            let n = match timeout(self.transfer_timeout, self.stream.read_line(&mut line)).await {
                Ok(Ok(n)) => n,
                Ok(Err(e)) => return Err(e.into()),
                Err(_) => {
                    self.timeout_flag = true;
                    return Err(FtpError::Timeout);
                }
            };
            if n == 0 {
                return Err(FtpError::Local("remote hung up".into()));
            }
            if line.len() > MAX_RET_MSG_LENGTH {
                return Err(FtpError::Local("reply line too long".into()));
            }
            let trimmed = line.trim_end_matches(['\r', '\n']);
            let bytes = trimmed.as_bytes();
            if bytes.len() >= 4
                && bytes[0].is_ascii_digit()
                && bytes[1].is_ascii_digit()
                && bytes[2].is_ascii_digit()
                && bytes[3] == b' '
            {
                self.last_reply = trimmed.to_string();
                let code = (bytes[0] - b'0') as u16 * 100
                    + (bytes[1] - b'0') as u16 * 10
                    + (bytes[2] - b'0') as u16;
                return Ok(code);
            }
            // Continuation line (`ddd-...` or free text), keep reading.
        }
    }

    async fn command_expect(&mut self, line: &str, accepted: &[u16]) -> FtpResult<u16> {
        self.send_command(line).await?;
        let code = self.read_reply().await?;
        if accepted.contains(&code) {
            Ok(code)
        } else {
            Err(self.unexpected(code))
        }
    }

    /// Send the user name. Returns 230 when no password is wanted.
    /// Servers that still think we are logged on answer 430 for a
    /// while; those are waited out.
    pub async fn user(&mut self, name: &str) -> FtpResult<u16> {
        let mut attempts = 0;
        loop {
            self.send_command(&format!("USER {name}")).await?;
            let code = self.read_reply().await?;
            if code == 430 && attempts < USER_BUSY_RETRIES {
                attempts += 1;
                tracing::debug!("server still thinks we are logged on, waiting");
                tokio::time::sleep(USER_BUSY_DELAY).await;
                continue;
            }
            return match code {
                230 | 331 | 332 => Ok(code),
                _ => Err(self.unexpected(code)),
            };
        }
    }

    pub async fn pass(&mut self, password: &str) -> FtpResult<()> {
        self.command_expect(&format!("PASS {password}"), &[202, 230, 332])
            .await?;
        Ok(())
    }

    pub async fn transfer_type(&mut self, type_char: char) -> FtpResult<()> {
        self.command_expect(&format!("TYPE {type_char}"), &[200]).await?;
        Ok(())
    }

    pub async fn cwd(&mut self, directory: &str) -> FtpResult<()> {
        self.command_expect(&format!("CWD {directory}"), &[200, 250]).await?;
        Ok(())
    }

    /// RNFR/RNTO pair.
    pub async fn rename(&mut self, from: &str, to: &str) -> FtpResult<()> {
        self.command_expect(&format!("RNFR {from}"), &[200, 350]).await?;
        self.command_expect(&format!("RNTO {to}"), &[200, 250]).await?;
        Ok(())
    }

    pub async fn dele(&mut self, filename: &str) -> FtpResult<()> {
        self.command_expect(&format!("DELE {filename}"), &[200, 250]).await?;
        Ok(())
    }

    /// SIZE. `Ok(None)` when the server does not implement it.
    pub async fn size(&mut self, filename: &str) -> FtpResult<Option<u64>> {
        self.send_command(&format!("SIZE {filename}")).await?;
        let code = self.read_reply().await?;
        match code {
            213 => {
                let size = self
                    .last_reply
                    .get(4..)
                    .and_then(|s| s.trim().parse().ok())
                    .ok_or_else(|| FtpError::Local(format!("bad SIZE reply `{}`", self.last_reply)))?;
                Ok(Some(size))
            }
            500 | 502 => Ok(None),
            _ => Err(self.unexpected(code)),
        }
    }

    /// MDTM. `Ok(None)` when the server does not implement it.
    pub async fn mdtm(&mut self, filename: &str) -> FtpResult<Option<String>> {
        self.send_command(&format!("MDTM {filename}")).await?;
        let code = self.read_reply().await?;
        match code {
            213 => Ok(self.last_reply.get(4..).map(|s| s.trim().to_string())),
            500 | 502 => Ok(None),
            _ => Err(self.unexpected(code)),
        }
    }

    /// SITE with implementation-defined replies: anything below 500
    /// counts as success.
    pub async fn site(&mut self, args: &str) -> FtpResult<()> {
        self.send_command(&format!("SITE {args}")).await?;
        let code = self.read_reply().await?;
        if code < 500 {
            Ok(())
        } else {
            Err(self.unexpected(code))
        }
    }

    pub async fn chmod(&mut self, mode: &str, filename: &str) -> FtpResult<()> {
        self.site(&format!("CHMOD {mode} {filename}")).await
    }

    pub async fn idle(&mut self, seconds: u64) -> FtpResult<()> {
        self.site(&format!("IDLE {seconds}")).await
    }

    /// STAT keep-alive probe. Any complete reply keeps the session
    /// alive; the caller disables further probes on failure.
    pub async fn stat_keepalive(&mut self) -> FtpResult<()> {
        self.send_command("STAT").await?;
        self.read_reply().await?;
        Ok(())
    }

    /// REST: restart the next retrieval at `offset`.
    pub async fn restart_offset(&mut self, offset: u64) -> FtpResult<()> {
        self.command_expect(&format!("REST {offset}"), &[350]).await?;
        Ok(())
    }

    /// Log out. After a timeout the reply is not waited for and the
    /// socket is just dropped, leaving TIME_WAIT to the kernel.
    pub async fn quit(mut self) -> FtpResult<()> {
        self.send_command("QUIT").await?;
        if !self.timeout_flag {
            let code = self.read_reply().await?;
            // 421 on the way out is not worth an error.
            if code != 221 && code != 421 {
                return Err(self.unexpected(code));
            }
            let _ = self.stream.get_mut().shutdown().await;
        }
        Ok(())
    }

    pub(crate) fn stream_mut(&mut self) -> &mut BufStream<TcpStream> {
        &mut self.stream
    }

    pub(crate) fn note_timeout(&mut self) {
        self.timeout_flag = true;
    }

    /// Forget a latched timeout after a non-fatal probe (SIZE, LIST,
    /// STAT, SITE CHMOD) so the session can carry on.
    pub fn clear_timeout(&mut self) {
        self.timeout_flag = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    /// Minimal scripted server: send greeting, then answer each
    /// received command with the next canned reply.
    async fn scripted(replies: Vec<&'static str>) -> (SocketAddr, tokio::task::JoinHandle<Vec<String>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            let mut seen = Vec::new();
            let mut replies = replies.into_iter();
            sock.write_all(replies.next().unwrap().as_bytes()).await.unwrap();
            let mut buf = vec![0u8; 1024];
            for reply in replies {
                let n = sock.read(&mut buf).await.unwrap();
                if n == 0 {
                    break;
                }
                seen.push(String::from_utf8_lossy(&buf[..n]).trim_end().to_string());
                sock.write_all(reply.as_bytes()).await.unwrap();
            }
            seen
        });
        (addr, handle)
    }

    const T: Duration = Duration::from_secs(5);

    #[tokio::test]
    async fn greeting_and_login() {
        let (addr, server) = scripted(vec![
            "220 ready\r\n",
            "331 send password\r\n",
            "230 logged in\r\n",
            "200 type set\r\n",
        ])
        .await;

        let (mut c, code) = Control::connect("127.0.0.1", addr.port(), T).await.unwrap();
        assert_eq!(code, 220);
        assert_eq!(c.user("u").await.unwrap(), 331);
        c.pass("p").await.unwrap();
        c.transfer_type('I').await.unwrap();

        drop(c);
        let seen = server.await.unwrap();
        assert_eq!(seen, vec!["USER u", "PASS p", "TYPE I"]);
    }

    #[tokio::test]
    async fn multiline_reply_is_skipped_to_terminator() {
        let (addr, _server) = scripted(vec![
            "220-welcome\r\nplain noise\r\n220 ready\r\n",
            "250-CWD notes\r\n250 done\r\n",
        ])
        .await;

        let (mut c, code) = Control::connect("127.0.0.1", addr.port(), T).await.unwrap();
        assert_eq!(code, 220);
        c.cwd("/out").await.unwrap();
    }

    #[tokio::test]
    async fn unexpected_code_carries_server_reply() {
        let (addr, _server) = scripted(vec!["220 ready\r\n", "530 not welcome\r\n"]).await;

        let (mut c, _) = Control::connect("127.0.0.1", addr.port(), T).await.unwrap();
        let err = c.user("u").await.unwrap_err();
        assert_eq!(err.reply_code(), Some(530));
    }

    #[tokio::test]
    async fn size_unsupported_is_none() {
        let (addr, _server) = scripted(vec![
            "220 ready\r\n",
            "502 no SIZE here\r\n",
            "213 8192\r\n",
        ])
        .await;

        let (mut c, _) = Control::connect("127.0.0.1", addr.port(), T).await.unwrap();
        assert_eq!(c.size("A").await.unwrap(), None);
        assert_eq!(c.size("A").await.unwrap(), Some(8192));
    }

    #[tokio::test]
    async fn reply_timeout_sets_flag() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            sock.write_all(b"220 ready\r\n").await.unwrap();
            // Swallow the command, never answer.
            let mut buf = [0u8; 64];
            let _ = sock.read(&mut buf).await;
            tokio::time::sleep(Duration::from_secs(60)).await;
        });

        let (mut c, _) = Control::connect("127.0.0.1", addr.port(), Duration::from_millis(200))
            .await
            .unwrap();
        let err = c.cwd("/out").await.unwrap_err();
        assert!(matches!(err, FtpError::Timeout));
        assert!(c.timed_out());
    }
}
