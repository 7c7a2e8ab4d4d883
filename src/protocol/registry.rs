use std::{
    collections::HashMap,
    sync::{Arc, PoisonError, RwLock},
};

use log::{debug, warn};

use crate::Envelope;

use super::Peer;

/// Consumes one incoming envelope. May reply through `peer`.
///
/// Handlers run on worker threads and can be invoked concurrently for different connections.
pub trait Handler: Send + Sync {
    fn handle(&self, envelope: Envelope, peer: &mut Peer);
}

impl<F> Handler for F
where
    F: Fn(Envelope, &mut Peer) + Send + Sync,
{
    fn handle(&self, envelope: Envelope, peer: &mut Peer) {
        self(envelope, peer)
    }
}

/// Default hook for envelopes without a registered handler: log and drop.
pub struct LogUnidentified;

impl Handler for LogUnidentified {
    fn handle(&self, envelope: Envelope, peer: &mut Peer) {
        warn!(
            "no handler for unidentified message {envelope} from {}",
            peer.describe()
        );
    }
}

/// Maps envelope ids to handlers. Registering an id twice replaces the earlier handler.
#[derive(Default)]
pub struct Registry {
    handlers: RwLock<HashMap<String, Arc<dyn Handler>>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `true` if an earlier handler for `id` was replaced.
    pub fn register(&self, id: impl Into<String>, handler: Arc<dyn Handler>) -> bool {
        let id = id.into();
        let replaced = self
            .handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id.clone(), handler)
            .is_some();

        debug!("registered handler for {id:?} (replaced: {replaced})");
        replaced
    }

    pub fn lookup(&self, id: &str) -> Option<Arc<dyn Handler>> {
        self.handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
