//! The FTP data channel.
//!
//! Active mode opens a one-shot listener next to the control socket's
//! local address, announces it with PORT and waits for the server to
//! connect back; the wait is bounded by twice the transfer timeout
//! because a lost connection would otherwise park the process in
//! accept forever. Passive mode asks with PASV and connects outbound.
//!
//! A 425 on the transfer command means the server could not reach our
//! listener; the listener is torn down and the whole dance retried a
//! few times with a short pause.

use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;

use petrel_core::MAX_DATA_CONNECT_RETRIES;

use crate::control::{Control, FtpError, FtpResult, IPTOS_THROUGHPUT};

const DATA_RETRY_DELAY: Duration = Duration::from_millis(10);

/// Accepted replies to a transfer command (STOR, APPE, RETR, LIST,
/// NLST). 425 is handled separately by the retry loop.
const TRANSFER_ACCEPTED: &[u16] = &[120, 125, 150, 200, 250];

pub struct DataChannel {
    stream: TcpStream,
    transfer_timeout: Duration,
    /// Scratch buffer for ASCII mode LF -> CRLF expansion.
    ascii_scratch: Vec<u8>,
}

fn port_arguments(addr: SocketAddr) -> FtpResult<String> {
    match addr.ip() {
        IpAddr::V4(ip) => {
            let o = ip.octets();
            let p = addr.port();
            Ok(format!(
                "{},{},{},{},{},{}",
                o[0],
                o[1],
                o[2],
                o[3],
                p >> 8,
                p & 0xff
            ))
        }
        IpAddr::V6(_) => Err(FtpError::Local(
            "active mode needs an IPv4 control connection".into(),
        )),
    }
}

/// Pull the `h1,h2,h3,h4,p1,p2` six-tuple out of a 227 reply.
fn parse_pasv_reply(text: &str) -> FtpResult<SocketAddr> {
    // Skip the reply code itself before hunting for the tuple.
    let tail = text.get(4..).unwrap_or("");
    let start = tail
        .find(|c: char| c.is_ascii_digit())
        .ok_or_else(|| FtpError::Local(format!("unparsable PASV reply `{text}`")))?;
    let digits: Vec<u16> = tail[start..]
        .trim_end_matches(|c: char| !c.is_ascii_digit())
        .split(',')
        .map(|t| {
            t.chars()
                .filter(|c| c.is_ascii_digit())
                .collect::<String>()
                .parse::<u16>()
                .map_err(|_| FtpError::Local(format!("unparsable PASV reply `{text}`")))
        })
        .collect::<FtpResult<_>>()?;
    if digits.len() != 6 || digits[..4].iter().any(|&d| d > 255) {
        return Err(FtpError::Local(format!("unparsable PASV reply `{text}`")));
    }
    let ip = IpAddr::from([
        digits[0] as u8,
        digits[1] as u8,
        digits[2] as u8,
        digits[3] as u8,
    ]);
    Ok(SocketAddr::new(ip, (digits[4] << 8) | digits[5]))
}

impl DataChannel {
    /// Open the data connection in active mode and issue `command`.
    /// Returns the channel once the server has both accepted the
    /// command and connected back.
    pub async fn open_active(control: &mut Control, command: &str) -> FtpResult<Self> {
        let transfer_timeout = control.transfer_timeout();
        let mut retries = 0;
        loop {
            let listener = TcpListener::bind(SocketAddr::new(control.local_addr().ip(), 0)).await?;
            let port_args = port_arguments(listener.local_addr()?)?;

            control.send_command(&format!("PORT {port_args}")).await?;
            let code = control.read_reply().await?;
            if code != 200 {
                return Err(FtpError::Reply {
                    code,
                    text: control.last_reply().to_string(),
                });
            }

            control.send_command(command).await?;
            let code = control.read_reply().await?;
            if !TRANSFER_ACCEPTED.contains(&code) {
                // The server could not open the connection to our
                // listener; a fresh listener on a fresh port often
                // helps.
                if code == 425 && retries < MAX_DATA_CONNECT_RETRIES {
                    retries += 1;
                    drop(listener);
                    tokio::time::sleep(DATA_RETRY_DELAY).await;
                    continue;
                }
                return Err(FtpError::Reply {
                    code,
                    text: control.last_reply().to_string(),
                });
            }

            // accept() can wedge on a dead connection, so it gets a
            // hard deadline of twice the transfer timeout.
            let (stream, _) = match timeout(transfer_timeout * 2, listener.accept()).await {
                Ok(Ok(accepted)) => accepted,
                Ok(Err(e)) => return Err(e.into()),
                Err(_) => {
                    tracing::error!("accept() timeout on data connection");
                    control.note_timeout();
                    return Err(FtpError::Timeout);
                }
            };
            return Ok(Self::from_stream(stream, transfer_timeout));
        }
    }

    /// Open the data connection in passive mode and issue `command`.
    pub async fn open_passive(control: &mut Control, command: &str) -> FtpResult<Self> {
        let transfer_timeout = control.transfer_timeout();
        control.send_command("PASV").await?;
        let code = control.read_reply().await?;
        if code != 227 {
            return Err(FtpError::Reply {
                code,
                text: control.last_reply().to_string(),
            });
        }
        let addr = parse_pasv_reply(control.last_reply())?;

        let stream = timeout(transfer_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| {
                control.note_timeout();
                FtpError::Timeout
            })?
            .map_err(|e| FtpError::Local(format!("passive connect to {addr} failed: {e}")))?;

        control.send_command(command).await?;
        let code = control.read_reply().await?;
        if !TRANSFER_ACCEPTED.contains(&code) {
            return Err(FtpError::Reply {
                code,
                text: control.last_reply().to_string(),
            });
        }
        Ok(Self::from_stream(stream, transfer_timeout))
    }

    fn from_stream(stream: TcpStream, transfer_timeout: Duration) -> Self {
        let sock = socket2::SockRef::from(&stream);
        if let Err(e) = sock.set_tos_v4(IPTOS_THROUGHPUT) {
            tracing::warn!("failed to set IP_TOS on data socket: {}", e);
        }
        Self {
            stream,
            transfer_timeout,
            ascii_scratch: Vec::new(),
        }
    }

    /// Write one block. In ASCII mode every LF becomes CRLF on the
    /// wire. A broken pipe is surfaced as-is so the caller can skip
    /// QUIT; an elapsed deadline marks the control session timed out.
    pub async fn write_block(
        &mut self,
        control: &mut Control,
        block: &[u8],
        ascii: bool,
    ) -> FtpResult<()> {
        let data: &[u8] = if ascii {
            self.ascii_scratch.clear();
            self.ascii_scratch.reserve(block.len() * 2);
            for &byte in block {
                if byte == b'\n' {
                    self.ascii_scratch.push(b'\r');
                }
                self.ascii_scratch.push(byte);
            }
            &self.ascii_scratch
        } else {
            block
        };

        match timeout(self.transfer_timeout, self.stream.write_all(data)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(e.into()),
            Err(_) => {
                control.note_timeout();
                Err(FtpError::Timeout)
            }
        }
    }

    /// Write one block with BLOCK_MODE framing: a 3-byte header of
    /// descriptor plus big-endian length, then the payload.
    pub async fn write_block_mode(
        &mut self,
        control: &mut Control,
        descriptor: u8,
        block: &[u8],
    ) -> FtpResult<()> {
        let len = u16::try_from(block.len())
            .map_err(|_| FtpError::Local("block too large for block mode".into()))?;
        let header = [descriptor, (len >> 8) as u8, (len & 0xff) as u8];
        match timeout(self.transfer_timeout, async {
            self.stream.write_all(&header).await?;
            self.stream.write_all(block).await
        })
        .await
        {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(e.into()),
            Err(_) => {
                control.note_timeout();
                Err(FtpError::Timeout)
            }
        }
    }

    /// Read one block from the channel; `Ok(0)` is end of stream.
    pub async fn read_block(&mut self, control: &mut Control, buf: &mut [u8]) -> FtpResult<usize> {
        match timeout(self.transfer_timeout, self.stream.read(buf)).await {
            Ok(Ok(n)) => Ok(n),
            Ok(Err(e)) => Err(e.into()),
            Err(_) => {
                control.note_timeout();
                Err(FtpError::Timeout)
            }
        }
    }

    /// Read the whole data stream, for buffered directory listings.
    pub async fn read_to_end(mut self, control: &mut Control) -> FtpResult<Vec<u8>> {
        let mut out = Vec::new();
        let mut buf = [0u8; 4096];
        loop {
            let n = self.read_block(control, &mut buf).await?;
            if n == 0 {
                break;
            }
            out.extend_from_slice(&buf[..n]);
        }
        self.close(control, false).await?;
        Ok(out)
    }

    /// Flush, half-close and collect the 226 transfer-complete reply
    /// from the control channel. With `tolerate_missing_reply` (used
    /// for zero-byte files, which some servers acknowledge with
    /// nothing at all) a missing or odd close reply is only logged.
    pub async fn close(mut self, control: &mut Control, tolerate_missing_reply: bool) -> FtpResult<()> {
        let flushed: FtpResult<()> =
            match timeout(self.transfer_timeout, async {
                self.stream.flush().await?;
                self.stream.shutdown().await
            })
            .await
            {
                Ok(Ok(())) => Ok(()),
                Ok(Err(e)) => Err(e.into()),
                Err(_) => {
                    control.note_timeout();
                    Err(FtpError::Timeout)
                }
            };
        flushed?;
        drop(self.stream);

        if control.timed_out() {
            return Ok(());
        }
        match control.read_reply().await {
            Ok(226) => Ok(()),
            Ok(code) if tolerate_missing_reply => {
                tracing::warn!(code, "odd close reply for empty file, ignoring");
                Ok(())
            }
            Ok(code) => Err(FtpError::Reply {
                code,
                text: control.last_reply().to_string(),
            }),
            Err(e) if tolerate_missing_reply && !matches!(e, FtpError::Timeout) => {
                tracing::warn!("no close reply for empty file, ignoring: {}", e);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use petrel_core::types::block_mode;
    use tokio::io::AsyncReadExt as _;
    use tokio::net::TcpListener;

    /// A control connection that only ever greets, plus a raw data
    /// socket pair for inspecting what goes on the wire.
    async fn harness() -> (Control, DataChannel, TcpStream) {
        let control_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let control_addr = control_listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut sock, _) = control_listener.accept().await.unwrap();
            use tokio::io::AsyncWriteExt as _;
            sock.write_all(b"220 ready\r\n").await.unwrap();
            // Keep the socket open for the lifetime of the test.
            let mut buf = [0u8; 64];
            let _ = sock.read(&mut buf).await;
        });
        let (control, _) = Control::connect("127.0.0.1", control_addr.port(), Duration::from_secs(5))
            .await
            .unwrap();

        let data_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let data_addr = data_listener.local_addr().unwrap();
        let client = TcpStream::connect(data_addr).await.unwrap();
        let (server_side, _) = data_listener.accept().await.unwrap();
        let channel = DataChannel::from_stream(client, Duration::from_secs(5));
        (control, channel, server_side)
    }

    #[tokio::test]
    async fn ascii_mode_expands_lf_to_crlf() {
        let (mut control, mut channel, mut wire) = harness().await;
        channel
            .write_block(&mut control, b"a\nb\nc", true)
            .await
            .unwrap();
        drop(channel);
        let mut seen = Vec::new();
        wire.read_to_end(&mut seen).await.unwrap();
        assert_eq!(seen, b"a\r\nb\r\nc");
    }

    #[tokio::test]
    async fn image_mode_is_verbatim() {
        let (mut control, mut channel, mut wire) = harness().await;
        channel
            .write_block(&mut control, b"a\nb\x00c", false)
            .await
            .unwrap();
        drop(channel);
        let mut seen = Vec::new();
        wire.read_to_end(&mut seen).await.unwrap();
        assert_eq!(seen, b"a\nb\x00c");
    }

    #[tokio::test]
    async fn block_mode_frames_with_descriptor_and_length() {
        let (mut control, mut channel, mut wire) = harness().await;
        channel
            .write_block_mode(&mut control, block_mode::DATA_BLOCK, b"payload")
            .await
            .unwrap();
        channel
            .write_block_mode(&mut control, block_mode::END_BLOCK, b"")
            .await
            .unwrap();
        drop(channel);
        let mut seen = Vec::new();
        wire.read_to_end(&mut seen).await.unwrap();
        assert_eq!(&seen[..3], &[block_mode::DATA_BLOCK, 0, 7]);
        assert_eq!(&seen[3..10], b"payload");
        assert_eq!(&seen[10..], &[block_mode::END_BLOCK, 0, 0]);
    }

    #[test]
    fn pasv_six_tuple() {
        let addr =
            parse_pasv_reply("227 Entering Passive Mode (192,168,1,9,19,137)").unwrap();
        assert_eq!(addr, "192.168.1.9:5001".parse().unwrap());
    }

    #[test]
    fn pasv_reply_without_parens() {
        let addr = parse_pasv_reply("227 ok 10,0,0,1,0,21").unwrap();
        assert_eq!(addr, "10.0.0.1:21".parse().unwrap());
    }

    #[test]
    fn pasv_garbage_is_error() {
        assert!(parse_pasv_reply("227 what").is_err());
        assert!(parse_pasv_reply("227 (1,2,3)").is_err());
        assert!(parse_pasv_reply("227 (999,2,3,4,5,6)").is_err());
    }

    #[test]
    fn port_argument_encoding() {
        let args = port_arguments("10.1.2.3:5001".parse().unwrap()).unwrap();
        assert_eq!(args, "10,1,2,3,19,137");
        assert!(port_arguments("[::1]:5001".parse().unwrap()).is_err());
    }
}
