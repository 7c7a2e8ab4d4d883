use std::{ops::Deref, path::Path, time::Duration};

use log::{debug, warn};

use crate::{
    Envelope, Value,
    config::{ClientConfig, DEFAULT_TIMEOUT},
};

use super::{
    Connection, Security, Stream, TransportError, check_port, create_socket, handshake,
    validate_timeout,
};

/// Timeout used by [`Client::is_reachable`].
const REACHABILITY_TIMEOUT: Duration = Duration::from_millis(DEFAULT_TIMEOUT as u64);

/// Owns at most one outbound connection and exchanges envelopes over it.
///
/// The connection is opened lazily by the first [`Client::send`] or [`Client::receive`] and
/// stays open until [`Client::close_connection`] (or until an envelope fails to transfer).
pub struct Client {
    host: String,
    port: u16,
    timeout: Duration,
    security: Security,
    connection: Option<Connection<Stream>>,
}

impl Client {
    pub fn new(host: impl Into<String>, port: i64) -> Result<Self, TransportError> {
        Self::with_timeout(host, port, DEFAULT_TIMEOUT)
    }

    pub fn with_timeout(
        host: impl Into<String>,
        port: i64,
        timeout: i64,
    ) -> Result<Self, TransportError> {
        let host = validate_host(host.into())?;
        Ok(Self {
            host,
            port: check_port(port)?,
            timeout: validate_timeout(timeout)?,
            security: Security::plain(),
            connection: None,
        })
    }

    pub fn from_config(config: &ClientConfig) -> Result<Self, TransportError> {
        let mut client = Self::with_timeout(config.host.clone(), config.port, config.timeout)?;
        client.security = Security::for_client(&config.security)?;
        Ok(client)
    }

    pub fn with_security(mut self, security: Security) -> Self {
        self.security = security;
        self
    }

    /// Validate and store all three values, or none of them. An open connection is kept.
    pub fn update_connection(
        &mut self,
        host: impl Into<String>,
        port: i64,
        timeout: i64,
    ) -> Result<(), TransportError> {
        let host = validate_host(host.into())?;
        let port = check_port(port)?;
        let timeout = validate_timeout(timeout)?;

        self.host = host;
        self.port = port;
        self.timeout = timeout;
        Ok(())
    }

    pub fn update_host(&mut self, host: impl Into<String>) -> Result<(), TransportError> {
        self.host = validate_host(host.into())?;
        Ok(())
    }

    pub fn update_port(&mut self, port: i64) -> Result<(), TransportError> {
        self.port = check_port(port)?;
        Ok(())
    }

    pub fn update_timeout(&mut self, timeout: i64) -> Result<(), TransportError> {
        self.timeout = validate_timeout(timeout)?;
        Ok(())
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn is_connected(&self) -> bool {
        self.connection.is_some()
    }

    fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    fn establish(&mut self) -> Result<&mut Connection<Stream>, TransportError> {
        match self.connection {
            Some(ref mut conn) => Ok(conn),
            None => {
                let stream = self.security.connect(&self.host, self.port, self.timeout)?;
                debug!("opened connection to {}", self.address());
                Ok(self.connection.insert(Connection::new(stream)))
            }
        }
    }

    /// Handshake as initiator, then write `envelope`.
    ///
    /// A rejected handshake leaves the connection open.
    pub fn send(&mut self, envelope: &Envelope) -> Result<(), TransportError> {
        let address = self.address();
        let conn = self.establish()?;
        if !handshake::initiate(conn) {
            return Err(TransportError::Handshake(address));
        }

        let res = conn.write_envelope(envelope);
        self.discard_on_error(res)
    }

    pub fn send_values<I, V>(
        &mut self,
        id: impl Into<String>,
        values: I,
    ) -> Result<(), TransportError>
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        let envelope = Envelope::new(id, values)?;
        self.send(&envelope)
    }

    /// Answer the peer's handshake, then read one envelope.
    pub fn receive(&mut self) -> Result<Envelope, TransportError> {
        let address = self.address();
        let conn = self.establish()?;
        let outcome = handshake::respond(conn);
        if !outcome.accepted {
            return Err(TransportError::Handshake(address));
        }

        let res = conn.read_envelope();
        self.discard_on_error(res)
    }

    /// Stream a file over the current connection, opening one if needed.
    pub fn send_file(&mut self, path: impl AsRef<Path>) -> Result<u64, TransportError> {
        let res = self.establish()?.send_file(path);
        self.discard_on_error(res)
    }

    pub fn receive_file(&mut self, path: impl AsRef<Path>) -> Result<u64, TransportError> {
        let res = self.establish()?.receive_file(path);
        self.discard_on_error(res)
    }

    /// After a failed transfer the stream position is unknown, so the connection is dropped.
    fn discard_on_error<T>(&mut self, res: Result<T, TransportError>) -> Result<T, TransportError> {
        if let Err(e) = &res {
            warn!("transfer with {} failed, closing connection: {e}", self.address());
            self.close_connection();
        }
        res
    }

    /// Try to open a plain TCP connection to the configured host and port.
    pub fn is_reachable(&self) -> bool {
        match create_socket(&self.host, self.port, REACHABILITY_TIMEOUT) {
            Ok(mut stream) => {
                stream.shutdown();
                true
            }
            Err(e) => {
                debug!("{} is not reachable: {e}", self.address());
                false
            }
        }
    }

    /// Close the active connection, if there is one.
    pub fn close_connection(&mut self) {
        if let Some(mut conn) = self.connection.take() {
            conn.flush_quietly();
            conn.get_mut().shutdown();
            debug!("closed connection to {}", self.address());
        }
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.close_connection();
    }
}

fn validate_host(host: String) -> Result<String, TransportError> {
    if host.trim().is_empty() {
        return Err(TransportError::InvalidArgument(
            "host must not be empty".to_string(),
        ));
    }
    Ok(host)
}

/// A [`Client`] that closes its connection after every send or receive.
pub struct AutoCloseClient {
    inner: Client,
}

impl AutoCloseClient {
    pub fn new(host: impl Into<String>, port: i64) -> Result<Self, TransportError> {
        Ok(Self {
            inner: Client::new(host, port)?,
        })
    }

    pub fn with_timeout(
        host: impl Into<String>,
        port: i64,
        timeout: i64,
    ) -> Result<Self, TransportError> {
        Ok(Self {
            inner: Client::with_timeout(host, port, timeout)?,
        })
    }

    pub fn from_config(config: &ClientConfig) -> Result<Self, TransportError> {
        Ok(Self {
            inner: Client::from_config(config)?,
        })
    }

    pub fn update_connection(
        &mut self,
        host: impl Into<String>,
        port: i64,
        timeout: i64,
    ) -> Result<(), TransportError> {
        self.inner.update_connection(host, port, timeout)
    }

    pub fn send(&mut self, envelope: &Envelope) -> Result<(), TransportError> {
        let res = self.inner.send(envelope);
        self.inner.close_connection();
        res
    }

    pub fn send_values<I, V>(
        &mut self,
        id: impl Into<String>,
        values: I,
    ) -> Result<(), TransportError>
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        let res = self.inner.send_values(id, values);
        self.inner.close_connection();
        res
    }

    pub fn receive(&mut self) -> Result<Envelope, TransportError> {
        let res = self.inner.receive();
        self.inner.close_connection();
        res
    }

    pub fn into_inner(self) -> Client {
        self.inner
    }
}

impl Deref for AutoCloseClient {
    type Target = Client;

    fn deref(&self) -> &Self::Target {
        &self.inner
    }
}
