//! Redis settings, connector, and pool factory.
//!
//! Connection setup authenticates (when a password is configured) and then
//! checks liveness with `PING`:
//!
//! ```text
//! Client → Server:  *2\r\n$4\r\nAUTH\r\n$<n>\r\n<password>\r\n
//! Server → Client:  +OK\r\n
//! Client → Server:  PING\r\n
//! Server → Client:  +PONG\r\n
//! ```

use std::io::{Read, Write};
use std::time::Duration;

use poolkeeper_core::{BackendSettings, InstanceKey, PoolError, PoolResult, Section};

use crate::factory::PoolFactory;
use crate::pool::{ConnectionBackend, ConnectionPool, Connector, PoolLimits, non_zero};
use crate::tcp::{self, TcpBackend};

/// Redis PING command in inline format.
const REDIS_PING: &[u8] = b"PING\r\n";

/// Expected PING reply (RESP simple string).
const REDIS_PONG: &[u8] = b"+PONG\r\n";

/// Longest status line accepted during setup.
const MAX_REPLY_LINE: usize = 512;

// ── RedisSettings ───────────────────────────────────────────────────

/// Resolved settings for one Redis instance.
#[derive(Clone, PartialEq, Eq)]
pub struct RedisSettings {
    pub host: String,
    pub port: u16,
    /// Empty means no `AUTH`.
    pub password: String,
    pub max_idle: usize,
    pub max_open: usize,
    pub connect_timeout: Duration,
    pub read_timeout: Duration,
    pub write_timeout: Duration,
    pub idle_timeout: Duration,
}

impl RedisSettings {
    pub const DEFAULT_MAX_IDLE: usize = 10;
    pub const DEFAULT_MAX_OPEN: usize = 1000;
    pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(1);
    pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(1);
    pub const DEFAULT_WRITE_TIMEOUT: Duration = Duration::from_secs(1);
    pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(300);

    pub fn limits(&self) -> PoolLimits {
        PoolLimits {
            max_open: self.max_open,
            max_idle: self.max_idle,
            max_lifetime: None,
            idle_timeout: non_zero(self.idle_timeout),
            wait_timeout: self.connect_timeout,
        }
    }
}

impl BackendSettings for RedisSettings {
    const KIND: &'static str = "redis";

    fn from_section(section: &Section<'_>) -> PoolResult<Self> {
        Ok(Self {
            host: section.required_str("host")?,
            port: section.required_port("port")?,
            password: section.optional_str("password", ""),
            max_idle: section.optional_usize("maxIdle", Self::DEFAULT_MAX_IDLE),
            max_open: section.optional_usize("maxOpen", Self::DEFAULT_MAX_OPEN),
            connect_timeout: section
                .optional_secs("connect_timeout", Self::DEFAULT_CONNECT_TIMEOUT),
            read_timeout: section.optional_secs("read_timeout", Self::DEFAULT_READ_TIMEOUT),
            write_timeout: section.optional_secs("write_timeout", Self::DEFAULT_WRITE_TIMEOUT),
            idle_timeout: section.optional_secs("idle_timeout", Self::DEFAULT_IDLE_TIMEOUT),
        })
    }
}

impl std::fmt::Debug for RedisSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisSettings")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("password", &if self.password.is_empty() { "" } else { "<redacted>" })
            .field("max_idle", &self.max_idle)
            .field("max_open", &self.max_open)
            .field("connect_timeout", &self.connect_timeout)
            .field("read_timeout", &self.read_timeout)
            .field("write_timeout", &self.write_timeout)
            .field("idle_timeout", &self.idle_timeout)
            .finish()
    }
}

// ── Connection setup ────────────────────────────────────────────────

/// Encode a command as a RESP array of bulk strings.
pub fn encode_command(args: &[&[u8]]) -> Vec<u8> {
    let mut out = format!("*{}\r\n", args.len()).into_bytes();
    for arg in args {
        out.extend_from_slice(format!("${}\r\n", arg.len()).as_bytes());
        out.extend_from_slice(arg);
        out.extend_from_slice(b"\r\n");
    }
    out
}

/// Read one CRLF-terminated reply line, without the terminator.
///
/// Reads byte by byte so nothing past the line is consumed from the stream.
fn read_line<R: Read>(stream: &mut R) -> PoolResult<String> {
    let mut line = Vec::new();
    let mut byte = [0u8; 1];
    while line.len() < MAX_REPLY_LINE {
        stream
            .read_exact(&mut byte)
            .map_err(|e| PoolError::unreachable(format!("redis reply: {e}")))?;
        if byte[0] == b'\n' && line.last() == Some(&b'\r') {
            line.pop();
            return Ok(String::from_utf8_lossy(&line).into_owned());
        }
        line.push(byte[0]);
    }
    Err(PoolError::unreachable("redis reply: line too long"))
}

fn command<S: Read + Write>(stream: &mut S, request: &[u8]) -> PoolResult<String> {
    stream
        .write_all(request)
        .and_then(|()| stream.flush())
        .map_err(|e| PoolError::unreachable(format!("redis send: {e}")))?;
    read_line(stream)
}

/// Authenticate (if `password` is non-empty) and verify `PING` → `+PONG`.
pub fn handshake<S: Read + Write>(stream: &mut S, password: &str) -> PoolResult<()> {
    if !password.is_empty() {
        let reply = command(stream, &encode_command(&[&b"AUTH"[..], password.as_bytes()]))?;
        if reply != "+OK" {
            return Err(PoolError::unreachable(format!("redis AUTH rejected: {reply}")));
        }
    }

    let reply = command(stream, REDIS_PING)?;
    if reply != "+PONG" {
        return Err(PoolError::unreachable(format!("redis PING failed: {reply}")));
    }
    Ok(())
}

// ── RedisBackend ────────────────────────────────────────────────────

/// A [`ConnectionBackend`] wrapper that adds Redis `PING` health checking.
pub struct RedisBackend {
    inner: Box<dyn ConnectionBackend>,
}

impl std::fmt::Debug for RedisBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisBackend")
            .field("inner", &self.inner)
            .finish()
    }
}

impl RedisBackend {
    pub fn new(inner: Box<dyn ConnectionBackend>) -> Self {
        Self { inner }
    }
}

impl ConnectionBackend for RedisBackend {
    fn send(&mut self, data: &[u8]) -> PoolResult<usize> {
        self.inner.send(data)
    }

    fn recv(&mut self, max_bytes: usize) -> PoolResult<Vec<u8>> {
        self.inner.recv(max_bytes)
    }

    fn ping(&mut self) -> bool {
        if self.inner.send(REDIS_PING).is_err() {
            return false;
        }
        match self.inner.recv(REDIS_PONG.len()) {
            Ok(data) => data == REDIS_PONG,
            Err(_) => false,
        }
    }

    fn close(&mut self) {
        self.inner.close();
    }
}

// ── RedisConnector / RedisPoolFactory ───────────────────────────────

/// Opens authenticated Redis connections for one instance.
#[derive(Clone, Debug)]
pub struct RedisConnector {
    key: InstanceKey,
    settings: RedisSettings,
}

impl RedisConnector {
    pub fn new(key: InstanceKey, settings: &RedisSettings) -> Self {
        Self {
            key,
            settings: settings.clone(),
        }
    }
}

impl Connector for RedisConnector {
    fn connect(&self) -> PoolResult<Box<dyn ConnectionBackend>> {
        let s = &self.settings;
        let mut stream = tcp::connect(
            &s.host,
            s.port,
            s.connect_timeout,
            s.read_timeout,
            s.write_timeout,
        )?;
        handshake(&mut stream, &s.password)?;
        tracing::debug!(
            instance = %self.key,
            host = %s.host,
            port = s.port,
            auth = !s.password.is_empty(),
            "redis connection ready"
        );
        Ok(Box::new(RedisBackend::new(Box::new(TcpBackend::new(stream)))))
    }
}

/// Builds Redis pools; the first connection doubles as the liveness check.
#[derive(Debug, Clone, Copy, Default)]
pub struct RedisPoolFactory;

impl PoolFactory for RedisPoolFactory {
    type Settings = RedisSettings;
    type Pool = ConnectionPool;

    fn build(&self, key: &InstanceKey, settings: &RedisSettings) -> PoolResult<ConnectionPool> {
        let connector = RedisConnector::new(key.clone(), settings);
        let first = connector.connect()?;
        let pool = ConnectionPool::new(key.clone(), settings.limits(), connector);
        pool.seed(first);
        Ok(pool)
    }
}

// ── Tests ────────────────────────────────────────────────────────────
