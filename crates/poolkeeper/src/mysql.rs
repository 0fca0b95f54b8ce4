//! MySQL settings, connector, and pool factory.
//!
//! The liveness check is the server greeting: a freshly accepted MySQL
//! connection starts with a protocol-10 handshake packet, or an ERR packet
//! when the server refuses the client (too many connections, host blocked).
//!
//! ```text
//! Server → Client (greeting):
//!   [payload_len: 3 LE] [seq_id: 1] [0x0a] [server_version\0] [connection_id: 4 LE] ...
//!
//! Server → Client (ERR):
//!   [payload_len: 3 LE] [seq_id: 1] [0xff] [error_code: 2 LE] [#sqlstate: 6]? [message]
//! ```
//!
//! Authentication is left to the caller: the greeting is kept on the
//! connection so a driver can continue the handshake from there.

use std::io::Read;
use std::time::Duration;

use poolkeeper_core::{BackendSettings, InstanceKey, PoolError, PoolResult, Section};

use crate::factory::PoolFactory;
use crate::pool::{ConnectionBackend, ConnectionPool, Connector, PoolLimits, non_zero};
use crate::tcp::{self, TcpBackend};

/// MySQL packet header size (3 bytes length + 1 byte sequence).
const MYSQL_HEADER_SIZE: usize = 4;

/// Handshake protocol version sent by every supported server.
const PROTOCOL_V10: u8 = 0x0a;

/// ERR packet marker (first byte of payload).
const ERR_MARKER: u8 = 0xff;

/// Greetings are small; anything larger is not a MySQL server.
const MAX_GREETING_LEN: usize = 16 * 1024;

/// `url.QueryEscape("Asia/Shanghai")`, the session location in the DSN.
const DSN_LOCATION: &str = "Asia%2FShanghai";

// ── MysqlSettings ───────────────────────────────────────────────────

/// Resolved settings for one MySQL instance.
#[derive(Clone, PartialEq, Eq)]
pub struct MysqlSettings {
    pub driver: String,
    pub host: String,
    pub port: u16,
    pub database: String,
    pub username: String,
    pub password: String,
    /// Connect / read / write timeout.
    pub timeout: Duration,
    pub max_idle: usize,
    pub max_open: usize,
    pub max_lifetime: Duration,
}

impl MysqlSettings {
    pub const DEFAULT_DRIVER: &'static str = "mysql";
    pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(1);
    pub const DEFAULT_MAX_IDLE: usize = 10;
    pub const DEFAULT_MAX_OPEN: usize = 1000;
    pub const DEFAULT_MAX_LIFETIME: Duration = Duration::from_secs(300);

    /// Driver DSN, e.g. `app:secret@tcp(db:3306)/orders?charset=utf8&...`.
    pub fn dsn(&self) -> String {
        format!(
            "{}:{}@tcp({}:{})/{}?charset=utf8&loc={}&parseTime=true&timeout=5s&readTimeout={}s",
            self.username,
            self.password,
            self.host,
            self.port,
            self.database,
            DSN_LOCATION,
            self.timeout.as_secs()
        )
    }

    pub fn limits(&self) -> PoolLimits {
        PoolLimits {
            max_open: self.max_open,
            max_idle: self.max_idle,
            max_lifetime: non_zero(self.max_lifetime),
            idle_timeout: None,
            wait_timeout: self.timeout,
        }
    }
}

impl BackendSettings for MysqlSettings {
    const KIND: &'static str = "mysql";

    fn from_section(section: &Section<'_>) -> PoolResult<Self> {
        Ok(Self {
            driver: section.optional_str("driver", Self::DEFAULT_DRIVER),
            host: section.required_str("host")?,
            port: section.required_port("port")?,
            database: section.required_str("database")?,
            username: section.required_str("username")?,
            password: section.required_str("password")?,
            timeout: section.optional_secs("timeout", Self::DEFAULT_TIMEOUT),
            max_idle: section.optional_usize("maxIdle", Self::DEFAULT_MAX_IDLE),
            max_open: section.optional_usize("maxOpen", Self::DEFAULT_MAX_OPEN),
            max_lifetime: section.optional_secs("maxLifetime", Self::DEFAULT_MAX_LIFETIME),
        })
    }
}

impl std::fmt::Debug for MysqlSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MysqlSettings")
            .field("driver", &self.driver)
            .field("host", &self.host)
            .field("port", &self.port)
            .field("database", &self.database)
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("timeout", &self.timeout)
            .field("max_idle", &self.max_idle)
            .field("max_open", &self.max_open)
            .field("max_lifetime", &self.max_lifetime)
            .finish()
    }
}

// ── Server greeting ─────────────────────────────────────────────────

/// The parts of the initial handshake packet worth keeping.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ServerGreeting {
    pub server_version: String,
    pub connection_id: u32,
}

/// Read and validate the server's first packet.
pub fn read_greeting<R: Read>(stream: &mut R) -> PoolResult<ServerGreeting> {
    let mut header = [0u8; MYSQL_HEADER_SIZE];
    stream
        .read_exact(&mut header)
        .map_err(|e| PoolError::unreachable(format!("mysql greeting: {e}")))?;
    let len = u32::from_le_bytes([header[0], header[1], header[2], 0]) as usize;
    if len == 0 || len > MAX_GREETING_LEN {
        return Err(PoolError::unreachable(format!(
            "mysql greeting: implausible packet length {len}"
        )));
    }

    let mut payload = vec![0u8; len];
    stream
        .read_exact(&mut payload)
        .map_err(|e| PoolError::unreachable(format!("mysql greeting: {e}")))?;

    match payload[0] {
        PROTOCOL_V10 => parse_handshake_v10(&payload[1..]),
        ERR_MARKER => Err(PoolError::unreachable(describe_err_packet(&payload[1..]))),
        other => Err(PoolError::unreachable(format!(
            "mysql greeting: unsupported protocol version {other:#04x}"
        ))),
    }
}

fn parse_handshake_v10(body: &[u8]) -> PoolResult<ServerGreeting> {
    let malformed = || PoolError::unreachable("mysql greeting: malformed handshake packet");
    let nul = body.iter().position(|b| *b == 0).ok_or_else(malformed)?;
    let server_version = String::from_utf8_lossy(&body[..nul]).into_owned();
    let id_bytes: [u8; 4] = body
        .get(nul + 1..nul + 5)
        .and_then(|b| b.try_into().ok())
        .ok_or_else(malformed)?;
    Ok(ServerGreeting {
        server_version,
        connection_id: u32::from_le_bytes(id_bytes),
    })
}

fn describe_err_packet(body: &[u8]) -> String {
    if body.len() < 2 {
        return "mysql server rejected connection".to_string();
    }
    let code = u16::from_le_bytes([body[0], body[1]]);
    let mut message = &body[2..];
    // Optional `#` + 5-byte SQL state.
    if message.first() == Some(&b'#') && message.len() >= 6 {
        message = &message[6..];
    }
    format!(
        "mysql server rejected connection ({code}): {}",
        String::from_utf8_lossy(message)
    )
}

// ── MysqlBackend ────────────────────────────────────────────────────

/// A MySQL connection that has received its server greeting.
///
/// `ping()` is a socket-level check: the session is not authenticated, so
/// `COM_PING` would be read by the server as a handshake response.
pub struct MysqlBackend {
    inner: Box<dyn ConnectionBackend>,
    greeting: ServerGreeting,
}

impl std::fmt::Debug for MysqlBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MysqlBackend")
            .field("inner", &self.inner)
            .field("greeting", &self.greeting)
            .finish()
    }
}

impl MysqlBackend {
    pub fn new(inner: Box<dyn ConnectionBackend>, greeting: ServerGreeting) -> Self {
        Self { inner, greeting }
    }

    pub fn greeting(&self) -> &ServerGreeting {
        &self.greeting
    }
}

impl ConnectionBackend for MysqlBackend {
    fn send(&mut self, data: &[u8]) -> PoolResult<usize> {
        self.inner.send(data)
    }

    fn recv(&mut self, max_bytes: usize) -> PoolResult<Vec<u8>> {
        self.inner.recv(max_bytes)
    }

    fn ping(&mut self) -> bool {
        self.inner.ping()
    }

    fn close(&mut self) {
        self.inner.close();
    }

    fn server_version(&self) -> Option<&str> {
        Some(&self.greeting.server_version)
    }
}

// ── MysqlConnector / MysqlPoolFactory ───────────────────────────────

/// Opens MySQL connections for one instance.
#[derive(Debug, Clone)]
pub struct MysqlConnector {
    key: InstanceKey,
    host: String,
    port: u16,
    timeout: Duration,
}

impl MysqlConnector {
    pub fn new(key: InstanceKey, settings: &MysqlSettings) -> Self {
        Self {
            key,
            host: settings.host.clone(),
            port: settings.port,
            timeout: settings.timeout,
        }
    }
}

impl Connector for MysqlConnector {
    fn connect(&self) -> PoolResult<Box<dyn ConnectionBackend>> {
        let mut stream = tcp::connect(
            &self.host,
            self.port,
            self.timeout,
            self.timeout,
            self.timeout,
        )?;
        let greeting = read_greeting(&mut stream)?;
        tracing::debug!(
            instance = %self.key,
            host = %self.host,
            port = self.port,
            server_version = %greeting.server_version,
            connection_id = greeting.connection_id,
            "received mysql server greeting"
        );
        Ok(Box::new(MysqlBackend::new(
            Box::new(TcpBackend::new(stream)),
            greeting,
        )))
    }
}

/// Builds MySQL pools; the first connection doubles as the liveness check.
#[derive(Debug, Clone, Copy, Default)]
pub struct MysqlPoolFactory;

impl PoolFactory for MysqlPoolFactory {
    type Settings = MysqlSettings;
    type Pool = ConnectionPool;

    fn build(&self, key: &InstanceKey, settings: &MysqlSettings) -> PoolResult<ConnectionPool> {
        let connector = MysqlConnector::new(key.clone(), settings);
        let first = connector.connect()?;
        let pool = ConnectionPool::new(key.clone(), settings.limits(), connector);
        pool.seed(first);
        Ok(pool)
    }
}

// ── Tests ────────────────────────────────────────────────────────────
