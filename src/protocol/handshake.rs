//! Line-based readiness check exchanged before the first envelope on a connection.
//!
//! ```text
//! initiator                      responder
//!     HANDSHAKE_REQUEST\n   --->
//!                           <--- HANDSHAKE_ACCEPTED\n   (or HANDSHAKE_DENIED\n)
//! ```
use std::io::{Read, Write};

use log::{debug, warn};

use super::transport::Connection;

pub const HANDSHAKE_REQUEST: &str = "HANDSHAKE_REQUEST";
pub const HANDSHAKE_ACCEPTED: &str = "HANDSHAKE_ACCEPTED";
pub const HANDSHAKE_DENIED: &str = "HANDSHAKE_DENIED";

/// Result of the responder side of a handshake.
///
/// `completed` means the read/write cycle finished without an I/O error; `accepted` means the
/// peer sent a well-formed request and was answered with [`HANDSHAKE_ACCEPTED`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HandshakeOutcome {
    pub completed: bool,
    pub accepted: bool,
}

impl HandshakeOutcome {
    const FAILED: Self = Self {
        completed: false,
        accepted: false,
    };
}

/// Send a request and wait for the reply. Returns `true` only for [`HANDSHAKE_ACCEPTED`].
///
/// The connection is left open either way.
pub fn initiate<S: Read + Write>(conn: &mut Connection<S>) -> bool {
    if let Err(e) = conn.write_line(HANDSHAKE_REQUEST) {
        warn!("failed to send handshake request: {e}");
        return false;
    }

    match conn.read_line() {
        Ok(Some(reply)) if reply == HANDSHAKE_ACCEPTED => true,
        Ok(reply) => {
            debug!("handshake rejected, peer replied {reply:?}");
            false
        }
        Err(e) => {
            warn!("failed to read handshake reply: {e}");
            false
        }
    }
}

/// Read a request and answer it.
pub fn respond<S: Read + Write>(conn: &mut Connection<S>) -> HandshakeOutcome {
    let request = match conn.read_line() {
        Ok(line) => line,
        Err(e) => {
            warn!("failed to read handshake request: {e}");
            return HandshakeOutcome::FAILED;
        }
    };

    let accepted = request.as_deref() == Some(HANDSHAKE_REQUEST);
    let reply = if accepted {
        HANDSHAKE_ACCEPTED
    } else {
        HANDSHAKE_DENIED
    };

    if let Err(e) = conn.write_line(reply) {
        warn!("failed to send handshake reply: {e}");
        return HandshakeOutcome::FAILED;
    }

    if !accepted {
        debug!("denied handshake, peer sent {request:?}");
    }
    HandshakeOutcome {
        completed: true,
        accepted,
    }
}
