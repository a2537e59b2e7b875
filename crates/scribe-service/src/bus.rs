//! Fire-and-forget publication of dispatch summaries to a NATS server.
//!
//! Workers hand messages to a bounded channel and never wait on the network.
//! A single publisher thread owns the connection, speaks the NATS text
//! protocol (`CONNECT`, `PUB`, `PONG`) and reconnects with backoff.

use std::io::{self, BufRead, BufReader, Write};
use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, SyncSender, TrySendError};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use serde::Serialize;
use tracing::{debug, info, warn};

use scribe_core::dispatcher::DispatchResult;

const CHANNEL_CAPACITY: usize = 1024;
const DEFAULT_NATS_PORT: u16 = 4222;
const CONNECT_TIMEOUT: Duration = Duration::from_secs(2);
const MAX_BACKOFF: Duration = Duration::from_secs(30);

#[derive(Debug, Serialize)]
struct DispatchSummary<'a> {
    rule_id: &'a str,
    event_id: &'a str,
    file_path: String,
    success: bool,
    successful_actions: usize,
    failed_actions: usize,
    rejected_by_breaker: bool,
    timestamp: String,
}

struct BusMessage {
    subject: String,
    payload: Vec<u8>,
}

/// Cheap handle used by workers.
#[derive(Clone)]
pub struct BusPublisher {
    tx: SyncSender<BusMessage>,
}

impl BusPublisher {
    pub fn publish(&self, file_path: &Path, result: &DispatchResult) {
        let summary = DispatchSummary {
            rule_id: &result.rule_id,
            event_id: &result.event_id,
            file_path: file_path.display().to_string(),
            success: result.success,
            successful_actions: result.successful_actions,
            failed_actions: result.failed_actions,
            rejected_by_breaker: result.rejected_by_breaker(),
            timestamp: chrono::Utc::now().to_rfc3339(),
        };
        let payload = match serde_json::to_vec(&summary) {
            Ok(p) => p,
            Err(err) => {
                warn!(error = %err, "failed to encode dispatch summary");
                return;
            }
        };
        let message = BusMessage {
            subject: subject_for(&result.rule_id),
            payload,
        };
        match self.tx.try_send(message) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                debug!(rule_id = %result.rule_id, "bus channel full, summary dropped")
            }
            Err(TrySendError::Disconnected(_)) => {}
        }
    }
}

/// Owns the publisher thread.
pub struct Bus {
    stop: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl Bus {
    pub fn start(url: &str) -> Result<(Self, BusPublisher)> {
        let target = parse_nats_url(url).with_context(|| format!("invalid NATS_URL {url:?}"))?;
        let target_addr = target.addr.clone();
        let authenticated = target.user.is_some() || target.token.is_some();
        let (tx, rx) = mpsc::sync_channel(CHANNEL_CAPACITY);
        let stop = Arc::new(AtomicBool::new(false));
        let thread = {
            let stop = stop.clone();
            thread::Builder::new()
                .name("bus-publisher".into())
                .spawn(move || publisher_loop(target, rx, stop))
                .context("failed to spawn bus publisher")?
        };
        info!(addr = %target_addr, authenticated, "dispatch bus enabled");
        Ok((
            Self {
                stop,
                thread: Some(thread),
            },
            BusPublisher { tx },
        ))
    }

    pub fn stop(&mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(handle) = self.thread.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for Bus {
    fn drop(&mut self) {
        self.stop();
    }
}

pub fn subject_for(rule_id: &str) -> String {
    // NATS subjects cannot carry whitespace; dots would split tokens.
    let token: String = rule_id
        .chars()
        .map(|c| if c.is_whitespace() || c == '.' || c == '*' || c == '>' { '_' } else { c })
        .collect();
    format!("scribe.dispatch.{token}")
}

/// Accepts `nats://host:port`, `host:port` or bare `host`.
/// Where to connect and how to authenticate, from a `nats://` URL.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NatsTarget {
    pub addr: String,
    pub user: Option<String>,
    pub pass: Option<String>,
    pub token: Option<String>,
}

impl NatsTarget {
    /// The `CONNECT` line, carrying credentials when the URL had any.
    fn connect_line(&self) -> String {
        let mut options = serde_json::json!({
            "verbose": false,
            "pedantic": false,
            "name": "scribe",
        });
        if let Some(user) = &self.user {
            options["user"] = user.clone().into();
        }
        if let Some(pass) = &self.pass {
            options["pass"] = pass.clone().into();
        }
        if let Some(token) = &self.token {
            options["auth_token"] = token.clone().into();
        }
        format!("CONNECT {options}\r\n")
    }
}

/// `nats://[user:pass@|token@]host[:port]`
pub fn parse_nats_url(url: &str) -> Option<NatsTarget> {
    let rest = url.strip_prefix("nats://").unwrap_or(url);
    let authority = rest.split('/').next()?;
    let (userinfo, host_port) = match authority.rsplit_once('@') {
        Some((info, host)) => (Some(info), host),
        None => (None, authority),
    };
    if host_port.is_empty() {
        return None;
    }
    let addr = if host_port
        .rsplit_once(':')
        .is_some_and(|(_, port)| port.parse::<u16>().is_ok())
    {
        host_port.to_string()
    } else {
        format!("{host_port}:{DEFAULT_NATS_PORT}")
    };

    let mut target = NatsTarget {
        addr,
        ..NatsTarget::default()
    };
    if let Some(info) = userinfo.filter(|info| !info.is_empty()) {
        match info.split_once(':') {
            Some((user, pass)) => {
                target.user = Some(user.to_string());
                target.pass = Some(pass.to_string());
            }
            None => target.token = Some(info.to_string()),
        }
    }
    Some(target)
}

struct Connection {
    stream: TcpStream,
    reader: Option<JoinHandle<()>>,
}

impl Connection {
    fn open(target: &NatsTarget) -> io::Result<Self> {
        let addr = target.addr.as_str();
        let sock: SocketAddr = match addr.parse() {
            Ok(sock) => sock,
            Err(_) => addr
                .to_socket_addrs()?
                .next()
                .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "no address"))?,
        };
        let mut stream = TcpStream::connect_timeout(&sock, CONNECT_TIMEOUT)?;
        stream.set_write_timeout(Some(CONNECT_TIMEOUT))?;
        stream.write_all(target.connect_line().as_bytes())?;

        // The server pings idle clients; answer from a side thread.
        let mut ponger = stream.try_clone()?;
        let reader_stream = stream.try_clone()?;
        let reader = thread::Builder::new()
            .name("bus-reader".into())
            .spawn(move || {
                for line in BufReader::new(reader_stream).lines() {
                    let Ok(line) = line else { break };
                    if line.starts_with("PING") && ponger.write_all(b"PONG\r\n").is_err() {
                        break;
                    }
                    if line.starts_with("-ERR") {
                        warn!(reply = %line, "bus server reported an error");
                    }
                }
            })?;
        Ok(Self {
            stream,
            reader: Some(reader),
        })
    }

    fn publish(&mut self, message: &BusMessage) -> io::Result<()> {
        let header = format!("PUB {} {}\r\n", message.subject, message.payload.len());
        self.stream.write_all(header.as_bytes())?;
        self.stream.write_all(&message.payload)?;
        self.stream.write_all(b"\r\n")
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        let _ = self.stream.shutdown(std::net::Shutdown::Both);
        if let Some(reader) = self.reader.take() {
            let _ = reader.join();
        }
    }
}

fn publisher_loop(target: NatsTarget, rx: Receiver<BusMessage>, stop: Arc<AtomicBool>) {
    let addr = target.addr.clone();
    let mut conn: Option<Connection> = None;
    let mut backoff = Duration::from_millis(250);
    let mut retry_at = Instant::now();

    while !stop.load(Ordering::Acquire) {
        let message = match rx.recv_timeout(Duration::from_millis(200)) {
            Ok(m) => m,
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => break,
        };
        if conn.is_none() {
            if Instant::now() < retry_at {
                continue;
            }
            match Connection::open(&target) {
                Ok(c) => {
                    debug!(%addr, "connected to bus");
                    backoff = Duration::from_millis(250);
                    conn = Some(c);
                }
                Err(err) => {
                    warn!(
                        %addr,
                        error = %err,
                        "bus unavailable, dropping summaries until reconnect"
                    );
                    retry_at = Instant::now() + backoff;
                    backoff = (backoff * 2).min(MAX_BACKOFF);
                    continue;
                }
            }
        }
        if let Some(c) = conn.as_mut() {
            if let Err(err) = c.publish(&message) {
                warn!(%addr, error = %err, "bus publish failed");
                conn = None;
                retry_at = Instant::now() + backoff;
            }
        }
    }
}
