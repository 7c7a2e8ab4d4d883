use std::{
    fs::File,
    io::{self, BufRead, BufReader, BufWriter, Read, Write},
    path::{Path, PathBuf},
};

use bincode::{
    config::{BigEndian, Configuration, Fixint, Limit},
    decode_from_std_read, encode_to_vec,
    error::{DecodeError, EncodeError},
};
use log::{debug, trace, warn};
use thiserror::Error;

use crate::envelope::{Envelope, EnvelopeError, WireEnvelope};

/// Upper bound on a single encoded envelope.
pub const MAX_ENVELOPE_BYTES: usize = 16 * 1024 * 1024;
/// Upper bound on a handshake line, terminator included.
pub const MAX_LINE_BYTES: u64 = 256;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("failed to connect to {address}: {source}")]
    Connect { address: String, source: io::Error },
    #[error("failed to bind port {port}: {source}")]
    Bind { port: i64, source: io::Error },
    #[error("handshake with {0} was not accepted")]
    Handshake(String),
    #[error("failed to encode message: {0}")]
    Serialize(#[from] EncodeError),
    #[error("failed to decode message: {0}")]
    Deserialize(#[from] DecodeError),
    #[error("received invalid envelope: {0}")]
    Envelope(#[from] EnvelopeError),
    #[error("TLS error: {0}")]
    Tls(#[from] rustls::Error),
    #[error("failed to load certificate material from {path:?}: {reason}")]
    Certificate { path: PathBuf, reason: String },
    #[error("Transport IO Error: {0}")]
    Io(#[from] io::Error),
}

/// A single open byte stream carrying handshake lines, envelopes and raw file contents.
///
/// Reads go through one buffer for the lifetime of the connection, so bytes read ahead
/// while looking for a line terminator are never lost to the envelope decoder.
pub struct Connection<S: Read + Write> {
    stream: BufReader<S>,
    config: Configuration<BigEndian, Fixint, Limit<MAX_ENVELOPE_BYTES>>,
}

impl<S: Read + Write> Connection<S> {
    pub fn new(stream: S) -> Self {
        let config = bincode::config::standard()
            .with_big_endian()
            .with_fixed_int_encoding()
            .with_limit::<MAX_ENVELOPE_BYTES>();
        Self {
            stream: BufReader::new(stream),
            config,
        }
    }

    pub fn get_ref(&self) -> &S {
        self.stream.get_ref()
    }

    pub fn get_mut(&mut self) -> &mut S {
        self.stream.get_mut()
    }

    /// Write `line` followed by `\n` and flush.
    pub fn write_line(&mut self, line: &str) -> io::Result<()> {
        trace!("writing line {line:?}");
        let writer = self.stream.get_mut();
        writer.write_all(line.as_bytes())?;
        writer.write_all(b"\n")?;
        writer.flush()
    }

    /// Read one line without its terminator. `None` means the peer closed the stream.
    pub fn read_line(&mut self) -> io::Result<Option<String>> {
        let mut buf = String::new();
        let read = (&mut self.stream).take(MAX_LINE_BYTES).read_line(&mut buf)?;
        if read == 0 {
            return Ok(None);
        }

        let line = buf.trim_end_matches(['\n', '\r']).to_string();
        trace!("read line {line:?}");
        Ok(Some(line))
    }

    pub fn write_envelope(&mut self, envelope: &Envelope) -> Result<(), TransportError> {
        let bytes = encode_to_vec(WireEnvelope::from(envelope), self.config)?;
        let writer = self.stream.get_mut();
        writer.write_all(&bytes)?;
        writer.flush()?;
        debug!("wrote envelope {} ({} bytes)", envelope.id(), bytes.len());
        Ok(())
    }

    pub fn read_envelope(&mut self) -> Result<Envelope, TransportError> {
        let wire: WireEnvelope = match decode_from_std_read(&mut self.stream, self.config) {
            Ok(wire) => wire,
            Err(DecodeError::Io { inner, .. }) => return Err(TransportError::Io(inner)),
            Err(e) => return Err(TransportError::Deserialize(e)),
        };
        let envelope = Envelope::try_from(wire)?;
        debug!("read envelope {}", envelope.id());
        Ok(envelope)
    }

    /// Stream the contents of `path` to the peer, prefixed by its length. Returns the byte count.
    pub fn send_file(&mut self, path: impl AsRef<Path>) -> Result<u64, TransportError> {
        let mut file = File::open(path.as_ref())?;
        let len = file.metadata()?.len();

        let writer = self.stream.get_mut();
        writer.write_all(&len.to_be_bytes())?;
        let copied = io::copy(&mut file, writer)?;
        writer.flush()?;

        if copied != len {
            return Err(TransportError::Io(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("{:?} changed while sending", path.as_ref()),
            )));
        }
        debug!("sent file {:?} ({copied} bytes)", path.as_ref());
        Ok(copied)
    }

    /// Receive a file written by [`Connection::send_file`] and store it at `path`.
    pub fn receive_file(&mut self, path: impl AsRef<Path>) -> Result<u64, TransportError> {
        let mut len = [0u8; 8];
        self.stream.read_exact(&mut len)?;
        let len = u64::from_be_bytes(len);

        let mut out = BufWriter::new(File::create(path.as_ref())?);
        let copied = io::copy(&mut (&mut self.stream).take(len), &mut out)?;
        out.flush()?;

        if copied != len {
            return Err(TransportError::Io(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("expected {len} bytes, peer sent {copied}"),
            )));
        }
        debug!("received file {:?} ({copied} bytes)", path.as_ref());
        Ok(copied)
    }

    /// Flush pending writes, logging instead of failing.
    pub fn flush_quietly(&mut self) {
        if let Err(e) = self.stream.get_mut().flush() {
            warn!("failed to flush connection: {e}");
        }
    }
}
