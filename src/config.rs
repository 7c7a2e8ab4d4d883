//! Server and client configuration.
//!
//! Values here are plain data; validation happens in the transport adapter
//! ([`check_port`](crate::protocol::check_port),
//! [`validate_timeout`](crate::protocol::validate_timeout)) when a configuration is applied.
use std::{
    env,
    net::{IpAddr, Ipv4Addr},
    path::{Path, PathBuf},
    time::Duration,
};

/// Highest valid port number.
pub const PORT_LIMIT: i64 = 65535;
/// Default listen backlog (pending, not yet accepted connections).
pub const DEFAULT_LIMIT: u32 = 50;
/// Default client read timeout in milliseconds.
pub const DEFAULT_TIMEOUT: i64 = 3000;
/// Default size of the server's bounded worker pool.
pub const DEFAULT_WORKERS: usize = 15;

const CERTS_DIR_ENV: &str = "COURIER_CERTS_DIR";
const DEFAULT_CERTS_DIR: &str = "certs";

/// PEM files used to set up TLS.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlsSettings {
    /// Certificate chain presented by the server.
    pub cert_path: PathBuf,
    /// Private key matching `cert_path`.
    pub key_path: PathBuf,
    /// Certificate authority bundle trusted by clients.
    pub ca_path: PathBuf,
}

impl TlsSettings {
    /// Expect `server.pem`, `server.key.pem` and `root-ca.pem` inside `dir`.
    pub fn from_dir(dir: impl AsRef<Path>) -> Self {
        let dir = dir.as_ref();
        Self {
            cert_path: dir.join("server.pem"),
            key_path: dir.join("server.key.pem"),
            ca_path: dir.join("root-ca.pem"),
        }
    }

    /// Same as [`TlsSettings::from_dir`] using `$COURIER_CERTS_DIR`, or `./certs` when unset.
    pub fn from_env() -> Self {
        let dir = env::var(CERTS_DIR_ENV).unwrap_or(DEFAULT_CERTS_DIR.to_string());
        Self::from_dir(dir)
    }
}

/// Whether sockets are wrapped in TLS.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum SecurityMode {
    #[default]
    Plain,
    Tls(TlsSettings),
}

/// How accepted connections are mapped onto threads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerPolicy {
    /// Fixed number of workers fed by a queue of accepted connections.
    Bounded(usize),
    /// One fresh thread per accepted connection, without an upper bound.
    PerConnection,
}

impl Default for WorkerPolicy {
    fn default() -> Self {
        WorkerPolicy::Bounded(DEFAULT_WORKERS)
    }
}

/// What `stop()` does with connections that are already in the hands of workers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ShutdownPolicy {
    /// Let in-flight handlers run to completion on their own.
    #[default]
    Detach,
    /// Drop queued connections and wait up to `timeout` for running handlers.
    Join { timeout: Duration },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    pub address: IpAddr,
    /// Listening port. `0` lets the OS pick one, see `Server::local_addr`.
    pub port: i64,
    pub backlog: u32,
    /// Read timeout on accepted connections. `Duration::ZERO` blocks indefinitely, so idle
    /// peers can hold a bounded worker for as long as they stay connected.
    pub read_timeout: Duration,
    pub workers: WorkerPolicy,
    pub shutdown: ShutdownPolicy,
    pub security: SecurityMode,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            address: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: 0,
            backlog: DEFAULT_LIMIT,
            read_timeout: Duration::ZERO,
            workers: WorkerPolicy::default(),
            shutdown: ShutdownPolicy::default(),
            security: SecurityMode::default(),
        }
    }
}

impl ServerConfig {
    pub fn with_port(port: i64) -> Self {
        Self {
            port,
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientConfig {
    pub host: String,
    pub port: i64,
    /// Read timeout in milliseconds, `0` blocks indefinitely.
    pub timeout: i64,
    pub security: SecurityMode,
}

impl ClientConfig {
    pub fn new(host: impl Into<String>, port: i64) -> Self {
        Self {
            host: host.into(),
            port,
            timeout: DEFAULT_TIMEOUT,
            security: SecurityMode::default(),
        }
    }
}
