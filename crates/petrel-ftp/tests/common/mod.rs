#![allow(dead_code)]

//! A small in-process FTP server for exercising the real engine end
//! to end: it speaks just enough of the protocol for the sender and
//! retriever flows, records every command it sees and keeps uploaded
//! files in memory.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};

#[derive(Default, Clone)]
pub struct MockConfig {
    /// Refuse a second USER on the same control connection with 530.
    pub reject_second_user: bool,
    /// SIZE replies; absent names answer 502.
    pub sizes: HashMap<String, u64>,
    /// MDTM replies; absent names answer 502.
    pub mdtm: HashMap<String, String>,
    /// NLST body; `None` answers 550.
    pub nlst: Option<Vec<String>>,
    /// LIST replies per file name.
    pub list_lines: HashMap<String, String>,
    /// Answer every transfer command with 425.
    pub never_connect_data: bool,
    /// Accept the transfer command with 150 but never open the data
    /// connection.
    pub stall_data: bool,
}

pub struct MockFtp {
    pub addr: SocketAddr,
    pub log: Arc<Mutex<Vec<String>>>,
    pub storage: Arc<Mutex<HashMap<String, Vec<u8>>>>,
    pub deleted: Arc<Mutex<Vec<String>>>,
}

impl MockFtp {
    pub async fn start(config: MockConfig) -> Self {
        Self::start_with_storage(config, HashMap::new()).await
    }

    pub async fn start_with_storage(
        config: MockConfig,
        initial: HashMap<String, Vec<u8>>,
    ) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let log = Arc::new(Mutex::new(Vec::new()));
        let storage = Arc::new(Mutex::new(initial));
        let deleted = Arc::new(Mutex::new(Vec::new()));

        let server = Server {
            config,
            log: log.clone(),
            storage: storage.clone(),
            deleted: deleted.clone(),
        };
        tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else { break };
                // Connections are handled one after the other; a
                // reconnect test needs exactly that.
                server.handle_connection(stream).await;
            }
        });

        Self {
            addr,
            log,
            storage,
            deleted,
        }
    }

    pub fn commands(&self) -> Vec<String> {
        self.log.lock().unwrap().clone()
    }

    pub fn file(&self, name: &str) -> Option<Vec<u8>> {
        self.storage.lock().unwrap().get(name).cloned()
    }

    pub fn saw(&self, prefix: &str) -> bool {
        self.commands().iter().any(|c| c.starts_with(prefix))
    }
}

#[derive(Clone)]
struct Server {
    config: MockConfig,
    log: Arc<Mutex<Vec<String>>>,
    storage: Arc<Mutex<HashMap<String, Vec<u8>>>>,
    deleted: Arc<Mutex<Vec<String>>>,
}

struct ConnState {
    users_seen: u32,
    port_addr: Option<SocketAddr>,
    pasv_listener: Option<TcpListener>,
    rest_offset: u64,
    rename_from: Option<String>,
}

impl Server {
    async fn handle_connection(&self, stream: TcpStream) {
        let (read_half, mut write) = stream.into_split();
        let mut read = BufReader::new(read_half);
        let _ = write.write_all(b"220 mock ready\r\n").await;

        let mut state = ConnState {
            users_seen: 0,
            port_addr: None,
            pasv_listener: None,
            rest_offset: 0,
            rename_from: None,
        };

        loop {
            let mut line = String::new();
            match read.read_line(&mut line).await {
                Ok(0) | Err(_) => return,
                Ok(_) => {}
            }
            let line = line.trim_end().to_string();
            self.log.lock().unwrap().push(line.clone());
            let (verb, arg) = match line.split_once(' ') {
                Some((v, a)) => (v.to_uppercase(), a.to_string()),
                None => (line.to_uppercase(), String::new()),
            };

            let reply: String = match verb.as_str() {
                "USER" => {
                    state.users_seen += 1;
                    if self.config.reject_second_user && state.users_seen > 1 {
                        "530 cannot switch user\r\n".into()
                    } else {
                        "331 need password\r\n".into()
                    }
                }
                "PASS" => "230 logged in\r\n".into(),
                "TYPE" => "200 type set\r\n".into(),
                "CWD" => "250 ok\r\n".into(),
                "PORT" => {
                    state.port_addr = parse_port(&arg);
                    if state.port_addr.is_some() {
                        "200 port ok\r\n".into()
                    } else {
                        "501 bad port\r\n".into()
                    }
                }
                "PASV" => {
                    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
                    let a = listener.local_addr().unwrap();
                    state.pasv_listener = Some(listener);
                    let [o1, o2, o3, o4] = match a.ip() {
                        std::net::IpAddr::V4(ip) => ip.octets(),
                        _ => [127, 0, 0, 1],
                    };
                    format!(
                        "227 entering passive mode ({},{},{},{},{},{})\r\n",
                        o1,
                        o2,
                        o3,
                        o4,
                        a.port() >> 8,
                        a.port() & 0xff
                    )
                }
                "REST" => {
                    state.rest_offset = arg.parse().unwrap_or(0);
                    "350 restarting\r\n".into()
                }
                "STOR" | "APPE" => {
                    if self.config.never_connect_data {
                        state.pasv_listener = None;
                        state.port_addr = None;
                        let _ = write.write_all(b"425 cannot open data connection\r\n").await;
                        continue;
                    }
                    if self.config.stall_data {
                        state.pasv_listener = None;
                        state.port_addr = None;
                        let _ = write.write_all(b"150 opening data connection\r\n").await;
                        continue;
                    }
                    let Some(mut data) = self.open_data(&mut state).await else {
                        let _ = write.write_all(b"425 cannot open data connection\r\n").await;
                        continue;
                    };
                    let _ = write.write_all(b"150 opening data connection\r\n").await;
                    let mut body = Vec::new();
                    let _ = data.read_to_end(&mut body).await;
                    drop(data);
                    {
                        let mut storage = self.storage.lock().unwrap();
                        if verb == "APPE" {
                            storage.entry(arg.clone()).or_default().extend_from_slice(&body);
                        } else {
                            storage.insert(arg.clone(), body);
                        }
                    }
                    state.rest_offset = 0;
                    "226 transfer complete\r\n".into()
                }
                "RETR" => {
                    let body = self.storage.lock().unwrap().get(&arg).cloned();
                    let Some(body) = body else {
                        let _ = write.write_all(b"550 no such file\r\n").await;
                        continue;
                    };
                    let Some(mut data) = self.open_data(&mut state).await else {
                        let _ = write.write_all(b"425 cannot open data connection\r\n").await;
                        continue;
                    };
                    let _ = write.write_all(b"150 opening data connection\r\n").await;
                    let from = (state.rest_offset as usize).min(body.len());
                    let _ = data.write_all(&body[from..]).await;
                    let _ = data.shutdown().await;
                    drop(data);
                    state.rest_offset = 0;
                    "226 transfer complete\r\n".into()
                }
                "NLST" => match &self.config.nlst {
                    None => "550 no files found\r\n".into(),
                    Some(names) => {
                        let Some(mut data) = self.open_data(&mut state).await else {
                            let _ = write.write_all(b"425 cannot open data connection\r\n").await;
                            continue;
                        };
                        let _ = write.write_all(b"150 here it comes\r\n").await;
                        for name in names {
                            let _ = data.write_all(format!("{name}\r\n").as_bytes()).await;
                        }
                        let _ = data.shutdown().await;
                        drop(data);
                        "226 transfer complete\r\n".into()
                    }
                },
                "LIST" => {
                    let line = self.config.list_lines.get(&arg).cloned().unwrap_or_default();
                    let Some(mut data) = self.open_data(&mut state).await else {
                        let _ = write.write_all(b"425 cannot open data connection\r\n").await;
                        continue;
                    };
                    let _ = write.write_all(b"150 here it comes\r\n").await;
                    if !line.is_empty() {
                        let _ = data.write_all(format!("{line}\r\n").as_bytes()).await;
                    }
                    let _ = data.shutdown().await;
                    drop(data);
                    "226 transfer complete\r\n".into()
                }
                "SIZE" => match self.config.sizes.get(&arg) {
                    Some(size) => format!("213 {size}\r\n"),
                    None => "502 SIZE not supported\r\n".into(),
                },
                "MDTM" => match self.config.mdtm.get(&arg) {
                    Some(date) => format!("213 {date}\r\n"),
                    None => "502 MDTM not supported\r\n".into(),
                },
                "DELE" => {
                    self.deleted.lock().unwrap().push(arg.clone());
                    self.storage.lock().unwrap().remove(&arg);
                    "250 deleted\r\n".into()
                }
                "RNFR" => {
                    state.rename_from = Some(arg.clone());
                    "350 ready\r\n".into()
                }
                "RNTO" => {
                    if let Some(from) = state.rename_from.take() {
                        let mut storage = self.storage.lock().unwrap();
                        if let Some(body) = storage.remove(&from) {
                            storage.insert(arg.clone(), body);
                        }
                    }
                    "250 renamed\r\n".into()
                }
                "SITE" => "200 ok\r\n".into(),
                "STAT" => "211 fine\r\n".into(),
                "QUIT" => {
                    let _ = write.write_all(b"221 bye\r\n").await;
                    return;
                }
                _ => "502 not implemented\r\n".into(),
            };
            if write.write_all(reply.as_bytes()).await.is_err() {
                return;
            }
        }
    }

    /// Open the data connection the client arranged: accept on the
    /// passive listener, or connect back to the announced PORT.
    async fn open_data(&self, state: &mut ConnState) -> Option<TcpStream> {
        if let Some(listener) = state.pasv_listener.take() {
            return listener.accept().await.ok().map(|(s, _)| s);
        }
        if let Some(addr) = state.port_addr.take() {
            return TcpStream::connect(addr).await.ok();
        }
        None
    }
}

fn parse_port(arg: &str) -> Option<SocketAddr> {
    let parts: Vec<u16> = arg
        .split(',')
        .map(|t| t.trim().parse::<u16>().ok())
        .collect::<Option<_>>()?;
    if parts.len() != 6 {
        return None;
    }
    let ip = std::net::Ipv4Addr::new(
        parts[0] as u8,
        parts[1] as u8,
        parts[2] as u8,
        parts[3] as u8,
    );
    Some(SocketAddr::new(ip.into(), (parts[4] << 8) | parts[5]))
}
