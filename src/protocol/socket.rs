//! Socket factory: validation, outbound connections, listening sockets and TLS wrapping.
use std::{
    fs,
    io::{self, BufReader, Read, Write},
    net::{IpAddr, Shutdown, SocketAddr, TcpListener, TcpStream, ToSocketAddrs},
    path::Path,
    sync::Arc,
    time::Duration,
};

use log::{debug, warn};
use rustls::{
    ClientConfig, ClientConnection, RootCertStore, ServerConfig, ServerConnection, StreamOwned,
    crypto::{CryptoProvider, ring},
    pki_types::{CertificateDer, PrivateKeyDer, ServerName},
};
use rustls_pemfile::{certs, private_key};
use socket2::{Domain, Protocol, Socket, Type};

use crate::config::{PORT_LIMIT, SecurityMode, TlsSettings};

use super::TransportError;

/// Fail unless `port` lies in `[0, 65535]`.
pub fn check_port(port: i64) -> Result<u16, TransportError> {
    u16::try_from(port).map_err(|_| {
        TransportError::InvalidArgument(format!(
            "port {port} is not valid (0 <= port <= {PORT_LIMIT})"
        ))
    })
}

/// Fail if `timeout` (milliseconds) is negative. Zero means "no timeout".
pub fn validate_timeout(timeout: i64) -> Result<Duration, TransportError> {
    u64::try_from(timeout).map(Duration::from_millis).map_err(|_| {
        TransportError::InvalidArgument(format!("timeout {timeout} must not be negative"))
    })
}

/// An open byte stream, optionally wrapped in TLS.
pub enum Stream {
    Plain(TcpStream),
    TlsServer(Box<StreamOwned<ServerConnection, TcpStream>>),
    TlsClient(Box<StreamOwned<ClientConnection, TcpStream>>),
}

impl Stream {
    fn tcp(&self) -> &TcpStream {
        match self {
            Stream::Plain(s) => s,
            Stream::TlsServer(s) => &s.sock,
            Stream::TlsClient(s) => &s.sock,
        }
    }

    pub fn peer_addr(&self) -> io::Result<SocketAddr> {
        self.tcp().peer_addr()
    }

    pub fn is_secure(&self) -> bool {
        !matches!(self, Stream::Plain(_))
    }

    /// Close both directions. Errors are logged, never returned.
    pub fn shutdown(&mut self) {
        let notified = match self {
            Stream::Plain(_) => Ok(()),
            Stream::TlsServer(s) => {
                s.conn.send_close_notify();
                s.flush()
            }
            Stream::TlsClient(s) => {
                s.conn.send_close_notify();
                s.flush()
            }
        };
        if let Err(e) = notified {
            debug!("failed to send close_notify: {e}");
        }

        if let Err(e) = self.tcp().shutdown(Shutdown::Both) {
            // Already closed by the peer in most cases.
            debug!("failed to shut down socket: {e}");
        }
    }
}

impl Read for Stream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Stream::Plain(s) => s.read(buf),
            Stream::TlsServer(s) => s.read(buf),
            Stream::TlsClient(s) => s.read(buf),
        }
    }
}

impl Write for Stream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Stream::Plain(s) => s.write(buf),
            Stream::TlsServer(s) => s.write(buf),
            Stream::TlsClient(s) => s.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Stream::Plain(s) => s.flush(),
            Stream::TlsServer(s) => s.flush(),
            Stream::TlsClient(s) => s.flush(),
        }
    }
}

/// TLS material for either side of a connection. The default is plain TCP.
#[derive(Clone, Default)]
pub struct Security {
    acceptor: Option<Arc<ServerConfig>>,
    connector: Option<Arc<ClientConfig>>,
}

impl Security {
    pub fn plain() -> Self {
        Self::default()
    }

    /// Server side: certificate chain and key for accepting, CA bundle for outbound sends.
    pub fn for_server(mode: &SecurityMode) -> Result<Self, TransportError> {
        match mode {
            SecurityMode::Plain => Ok(Self::plain()),
            SecurityMode::Tls(settings) => Ok(Self {
                acceptor: Some(Arc::new(server_config(settings)?)),
                connector: Some(Arc::new(client_config(settings)?)),
            }),
        }
    }

    /// Client side: only the CA bundle is needed.
    pub fn for_client(mode: &SecurityMode) -> Result<Self, TransportError> {
        match mode {
            SecurityMode::Plain => Ok(Self::plain()),
            SecurityMode::Tls(settings) => Ok(Self {
                acceptor: None,
                connector: Some(Arc::new(client_config(settings)?)),
            }),
        }
    }

    pub fn is_secure(&self) -> bool {
        self.acceptor.is_some() || self.connector.is_some()
    }

    /// Open an outbound connection, secured when this side has a TLS connector.
    pub fn connect(
        &self,
        host: &str,
        port: u16,
        timeout: Duration,
    ) -> Result<Stream, TransportError> {
        match &self.connector {
            Some(config) => create_secure_socket(host, port, timeout, config),
            None => create_socket(host, port, timeout),
        }
    }

    /// Wrap a freshly accepted socket, completing the TLS handshake if configured.
    pub fn accept(&self, tcp: TcpStream) -> Result<Stream, TransportError> {
        match &self.acceptor {
            Some(config) => {
                let mut tcp = tcp;
                let mut conn = ServerConnection::new(Arc::clone(config))?;
                while conn.is_handshaking() {
                    conn.complete_io(&mut tcp)?;
                }
                Ok(Stream::TlsServer(Box::new(StreamOwned::new(conn, tcp))))
            }
            None => Ok(Stream::Plain(tcp)),
        }
    }
}

/// Open a plain TCP connection with `timeout` applied to connecting and reading.
pub fn create_socket(host: &str, port: u16, timeout: Duration) -> Result<Stream, TransportError> {
    Ok(Stream::Plain(open_tcp(host, port, timeout)?))
}

/// Open a TCP connection and complete a TLS handshake, verifying the server against `config`.
pub fn create_secure_socket(
    host: &str,
    port: u16,
    timeout: Duration,
    config: &Arc<ClientConfig>,
) -> Result<Stream, TransportError> {
    let mut tcp = open_tcp(host, port, timeout)?;
    let name = ServerName::try_from(host.to_string()).map_err(|e| {
        TransportError::InvalidArgument(format!("invalid server name {host:?}: {e}"))
    })?;

    let mut conn = ClientConnection::new(Arc::clone(config), name)?;
    while conn.is_handshaking() {
        conn.complete_io(&mut tcp).map_err(|source| TransportError::Connect {
            address: format!("{host}:{port}"),
            source,
        })?;
    }
    debug!("TLS session established with {host}:{port}");
    Ok(Stream::TlsClient(Box::new(StreamOwned::new(conn, tcp))))
}

fn open_tcp(host: &str, port: u16, timeout: Duration) -> Result<TcpStream, TransportError> {
    let address = format!("{host}:{port}");
    let connect_err = |source| TransportError::Connect {
        address: address.clone(),
        source,
    };

    let mut last = io::Error::new(io::ErrorKind::NotFound, "host resolved to no addresses");
    for addr in (host, port).to_socket_addrs().map_err(connect_err)? {
        let attempt = if timeout.is_zero() {
            TcpStream::connect(addr)
        } else {
            TcpStream::connect_timeout(&addr, timeout)
        };

        match attempt {
            Ok(stream) => {
                if !timeout.is_zero() {
                    stream.set_read_timeout(Some(timeout)).map_err(connect_err)?;
                }
                if let Err(e) = stream.set_nodelay(true) {
                    warn!("failed to set TCP_NODELAY on {addr}: {e}");
                }
                debug!("connected to {addr}");
                return Ok(stream);
            }
            Err(e) => {
                debug!("connecting to {addr} failed: {e}");
                last = e;
            }
        }
    }

    Err(connect_err(last))
}

/// Bind a listening socket on `address:port` with at most `backlog` pending connections.
pub fn create_listening_socket(
    address: IpAddr,
    port: i64,
    backlog: u32,
) -> Result<TcpListener, TransportError> {
    let checked = check_port(port)?;
    let addr = SocketAddr::new(address, checked);
    let bind_err = |source| TransportError::Bind { port, source };

    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))
        .map_err(bind_err)?;
    socket.set_reuse_address(true).map_err(bind_err)?;
    socket.bind(&addr.into()).map_err(bind_err)?;
    socket
        .listen(i32::try_from(backlog).unwrap_or(i32::MAX))
        .map_err(bind_err)?;

    Ok(socket.into())
}

fn provider() -> Arc<CryptoProvider> {
    Arc::new(ring::default_provider())
}

fn server_config(settings: &TlsSettings) -> Result<ServerConfig, TransportError> {
    let chain = load_certs(&settings.cert_path)?;
    let key = load_key(&settings.key_path)?;

    let config = ServerConfig::builder_with_provider(provider())
        .with_safe_default_protocol_versions()?
        .with_no_client_auth()
        .with_single_cert(chain, key)?;
    Ok(config)
}

fn client_config(settings: &TlsSettings) -> Result<ClientConfig, TransportError> {
    let mut roots = RootCertStore::empty();
    roots.add_parsable_certificates(load_certs(&settings.ca_path)?);

    let config = ClientConfig::builder_with_provider(provider())
        .with_safe_default_protocol_versions()?
        .with_root_certificates(roots)
        .with_no_client_auth();
    Ok(config)
}

fn read_pem(path: &Path) -> Result<Vec<u8>, TransportError> {
    fs::read(path).map_err(|e| TransportError::Certificate {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })
}

fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>, TransportError> {
    let pem = read_pem(path)?;
    let chain = certs(&mut BufReader::new(&*pem))
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| TransportError::Certificate {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

    if chain.is_empty() {
        return Err(TransportError::Certificate {
            path: path.to_path_buf(),
            reason: "no certificates found".to_string(),
        });
    }
    Ok(chain)
}

fn load_key(path: &Path) -> Result<PrivateKeyDer<'static>, TransportError> {
    let pem = read_pem(path)?;
    private_key(&mut BufReader::new(&*pem))
        .map_err(|e| TransportError::Certificate {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?
        .ok_or_else(|| TransportError::Certificate {
            path: path.to_path_buf(),
            reason: "no private key found".to_string(),
        })
}
