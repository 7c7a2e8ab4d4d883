pub mod config;
pub mod envelope;
pub mod protocol;

pub use config::{
    ClientConfig, SecurityMode, ServerConfig, ShutdownPolicy, TlsSettings, WorkerPolicy,
};
pub use envelope::{Envelope, EnvelopeError, Value};
pub use protocol::{AutoCloseClient, Client, Peer, Server, TransportError};
