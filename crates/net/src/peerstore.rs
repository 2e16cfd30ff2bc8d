use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::debug;

use crate::error::NetworkError;
use crate::peer::Peer;

type PeerHandler = Arc<dyn Fn(Peer) + Send + Sync>;

/// Thread safe in-memory directory of known peers.
///
/// Multiple readers, exclusive writer. Registered handlers are invoked with
/// the post-merge record after every successful `put`, outside the write
/// lock so a handler may call back into the store.
#[derive(Default)]
pub struct Peerstore {
    inner: RwLock<Inner>,
}

#[derive(Default)]
struct Inner {
    peers: HashMap<String, Peer>,
    handlers: Vec<PeerHandler>,
}

impl Peerstore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts or updates a record. Novel addresses are appended to an
    /// existing record in order of first occurrence; duplicates are dropped.
    pub fn put(&self, peer: Peer) {
        let (updated, handlers) = {
            let mut inner = self.inner.write();
            let updated = match inner.peers.get_mut(&peer.id) {
                Some(existing) => {
                    for addr in peer.addresses {
                        if !existing.addresses.contains(&addr) {
                            existing.addresses.push(addr);
                        }
                    }
                    existing.clone()
                }
                None => {
                    inner.peers.insert(peer.id.clone(), peer.clone());
                    peer
                }
            };
            debug!(pid = %updated.id, addrs = ?updated.addresses, "updated peer record");
            (updated, inner.handlers.clone())
        };
        for handler in handlers {
            handler(updated.clone());
        }
    }

    pub fn get(&self, id: &str) -> Result<Peer, NetworkError> {
        self.inner
            .read()
            .peers
            .get(id)
            .cloned()
            .ok_or_else(|| NetworkError::UnknownPeer(id.to_string()))
    }

    /// Erases the record. Put handlers are not notified; removal is
    /// idempotent.
    pub fn remove(&self, id: &str) -> Option<Peer> {
        self.inner.write().peers.remove(id)
    }

    /// Snapshot of all records.
    pub fn peers(&self) -> Vec<Peer> {
        self.inner.read().peers.values().cloned().collect()
    }

    pub fn register_peer_handler<F>(&self, handler: F)
    where
        F: Fn(Peer) + Send + Sync + 'static,
    {
        self.inner.write().handlers.push(Arc::new(handler));
    }
}
