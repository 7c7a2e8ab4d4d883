//! Client-server messaging protocol.
//!
//! This module implements the connection lifecycle shared by [`Client`] and [`Server`]: opening
//! (optionally TLS-secured) sockets, the line-based handshake that precedes every exchange,
//! the binary envelope codec, and id-based dispatch of incoming envelopes to handlers.
//!
//! # Wire Format
//!
//! Each exchange on a connection runs in this order:
//!
//! 1. The initiator writes `HANDSHAKE_REQUEST\n`.
//! 2. The responder answers `HANDSHAKE_ACCEPTED\n`, or `HANDSHAKE_DENIED\n` for anything else.
//! 3. The initiator continues only after `HANDSHAKE_ACCEPTED`.
//! 4. The initiator writes one [`Envelope`](crate::Envelope), encoded with bincode (big endian,
//!    fixed-width integers). The encoding is self-delimiting, so no extra framing is added.
//!
//! A server reads exactly one envelope per accepted connection. A handler may answer on the same
//! connection by running the exchange again with the roles swapped, see [`Peer::send`] and
//! [`Client::receive`].
//!
//! # Key Components
//!
//! - [`Connection`]: line, envelope and file I/O over one byte stream.
//! - [`Security`]: socket factory for plain TCP or rustls-backed TLS streams.
//! - [`Registry`] and [`Handler`]: id to handler mapping consulted by the server.
//! - [`ThreadPool`]: workers that run accepted connections.
//!
//! # See Also
//!
//! - [`config`](crate::config): ports, timeouts, worker and shutdown policies.
mod client;
mod handshake;
mod registry;
mod server;
mod socket;
mod thread;
mod transport;

pub use client::{AutoCloseClient, Client};
pub use handshake::{
    HANDSHAKE_ACCEPTED, HANDSHAKE_DENIED, HANDSHAKE_REQUEST, HandshakeOutcome,
    initiate as perform_handshake, respond as handle_handshake,
};
pub use registry::{Handler, LogUnidentified, Registry};
pub use server::{Duplex, Peer, Server, ServerState};
pub use socket::{
    Security, Stream, check_port, create_listening_socket, create_secure_socket, create_socket,
    validate_timeout,
};
pub use thread::ThreadPool;
pub use transport::{Connection, MAX_ENVELOPE_BYTES, MAX_LINE_BYTES, TransportError};
