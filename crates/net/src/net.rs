use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use futures::AsyncWriteExt;
use parking_lot::{Mutex, RwLock};
use tokio::sync::Mutex as AsyncMutex;
use tokio_util::compat::{FuturesAsyncReadCompatExt, TokioAsyncReadCompatExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};
use yamux::Mode;

use crate::addr::parse_dial_target;
use crate::config::NetConfig;
use crate::error::NetworkError;
use crate::peer::Peer;
use crate::peerstore::Peerstore;
use crate::relay::{RELAY_PROTOCOL, RelayTransport};
use crate::selector::{ProtocolMux, SESSION_PROTOCOL, select_proto};
use crate::session::Session;
use crate::transport::{Conn, Listener, MAX_LINE, TcpTransport, Transport, read_line};

/// The networking core: establishes addressable, multi-protocol,
/// bidirectional byte streams between named peers.
///
/// Higher-level code registers sub-protocol handlers and either dials a
/// `<peer-id>/<sub-protocol>` target or lets incoming substreams be
/// dispatched to the matching handler. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct Network {
    inner: Arc<Shared>,
}

struct Shared {
    local: RwLock<Peer>,
    config: NetConfig,
    peerstore: Peerstore,
    /// Dial priority is list order: TCP first, relay last, then user-added.
    transports: RwLock<Vec<Arc<dyn Transport>>>,
    /// At most one live session per remote peer id; closed sessions are
    /// evicted by the next dial that observes them.
    sessions: RwLock<HashMap<String, Arc<Session>>>,
    /// Per-target dial serialization, so concurrent dials to one peer
    /// coalesce onto a single session.
    dialing: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
    /// Stream-level selector: registered sub-protocols plus `relay`.
    mux: Arc<ProtocolMux>,
    /// Connection-level selector: accepts only the session protocol.
    cmux: Arc<ProtocolMux>,
}

/// Non-owning handle held by parts the network itself owns, such as the
/// relay transport and the spawned accept loops.
#[derive(Clone)]
pub(crate) struct WeakNetwork(Weak<Shared>);

impl WeakNetwork {
    pub(crate) fn upgrade(&self) -> Result<Network, NetworkError> {
        self.0
            .upgrade()
            .map(|inner| Network { inner })
            .ok_or(NetworkError::Shutdown)
    }
}

/// Builds a network and starts listening on every local address. Addresses
/// that bind are rewritten to their resolved form (so an ephemeral `:0`
/// port becomes observable); addresses no transport can listen on, such as
/// relay addresses, stay advertised untouched.
pub async fn start_network(local: Peer, config: NetConfig) -> Result<Network, NetworkError> {
    let network = Network::new(local, config);
    let advertised = network.local_peer().addresses;
    let mut resolved = Vec::new();
    for addr in &advertised {
        match network.listen(addr).await {
            Ok(bound) => resolved.extend(bound),
            Err(err) => {
                warn!(addr = %addr, error = %err, "could not listen on address");
                resolved.push(addr.clone());
            }
        }
    }
    network.inner.local.write().addresses = resolved;
    Ok(network)
}

impl Network {
    pub fn new(local: Peer, config: NetConfig) -> Self {
        let network = Network {
            inner: Arc::new(Shared {
                local: RwLock::new(local),
                peerstore: Peerstore::new(),
                transports: RwLock::new(Vec::new()),
                sessions: RwLock::new(HashMap::new()),
                dialing: Mutex::new(HashMap::new()),
                mux: Arc::new(ProtocolMux::new()),
                cmux: Arc::new(ProtocolMux::new()),
                config,
            }),
        };

        let weak = network.downgrade();
        network
            .inner
            .cmux
            .add_handler(SESSION_PROTOCOL, move |_, conn| {
                let weak = weak.clone();
                async move {
                    let network = weak.upgrade()?;
                    network.handle_connection(conn).await
                }
            });

        // The relay is both the last-resort transport and a sub-protocol
        // handler on the network it wraps.
        let relay = Arc::new(RelayTransport::new(network.downgrade()));
        let bridging = Arc::clone(&relay);
        network
            .inner
            .mux
            .add_handler(RELAY_PROTOCOL, move |protocol, conn| {
                let relay = Arc::clone(&bridging);
                async move { relay.handle_new_stream(protocol, conn).await }
            });

        {
            let mut transports = network.inner.transports.write();
            transports.push(Arc::new(TcpTransport::new(
                network.inner.config.dial_timeout,
            )));
            transports.push(relay);
        }
        network
    }

    fn downgrade(&self) -> WeakNetwork {
        WeakNetwork(Arc::downgrade(&self.inner))
    }

    /// Dials `<peer-id>/<sub-protocol>`, returning a stream with the
    /// sub-protocol fully negotiated and ready for I/O.
    pub async fn dial(&self, target: &str) -> Result<Conn, NetworkError> {
        self.dial_with_cancel(target, CancellationToken::new()).await
    }

    /// Like [`Network::dial`], bounded by a cancellation token. The token
    /// is honored exactly on the connect; later phases observe it
    /// best-effort and drop the half-negotiated stream.
    pub async fn dial_with_cancel(
        &self,
        target: &str,
        cancel: CancellationToken,
    ) -> Result<Conn, NetworkError> {
        let (peer_id, protocol) = parse_dial_target(target)?;
        let local_id = self.local_peer().id;
        if peer_id == local_id {
            return Err(NetworkError::SelfDial);
        }
        debug!(lpid = %local_id, tpid = %peer_id, protocol = %protocol, "dialing peer");

        // Cache lookup, connection establishment and cache insertion stay
        // in one per-peer critical section so concurrent dials to the
        // same peer coalesce onto one session. Per-peer rather than
        // network-wide, because a relay dial re-enters `dial` for the
        // relay's own id.
        let dial_lock = self.dial_lock(&peer_id);
        let _guard = dial_lock.lock().await;

        if let Some(session) = self.session(&peer_id) {
            if session.is_closed() {
                warn!(tpid = %peer_id, "cached session is closed, dialing again");
                self.evict(&peer_id, &session);
            } else {
                debug!(tpid = %peer_id, "reusing existing session");
                return self.open_negotiated(&session, &protocol).await;
            }
        }

        let peer = self.inner.peerstore.get(&peer_id)?;
        if peer.addresses.is_empty() {
            return Err(NetworkError::NoAddresses(peer_id));
        }

        let transports: Vec<Arc<dyn Transport>> = self.inner.transports.read().clone();
        let mut dialed: Option<(Conn, bool)> = None;
        'addresses: for raddr in &peer.addresses {
            let daddr = format!("{raddr}/{protocol}");
            for transport in &transports {
                match transport.dial(&daddr, cancel.clone()).await {
                    Ok(conn) => {
                        debug!(tpid = %peer_id, daddr = %daddr, "transport connected");
                        dialed = Some((conn, transport.provides_stream()));
                        break 'addresses;
                    }
                    Err(err) => trace!(daddr = %daddr, error = %err, "transport dial failed"),
                }
            }
        }
        let Some((conn, relayed)) = dialed else {
            debug!(tpid = %peer_id, "all transports failed");
            return Err(NetworkError::TransportNotSupported);
        };

        // A relayed connection is already a negotiated logical stream;
        // the endpoints use it directly, with no session on top.
        if relayed {
            debug!(tpid = %peer_id, "dialing complete, relayed");
            return Ok(conn);
        }

        let established = cancel
            .run_until_cancelled(async {
                let session = self.establish_session(&peer_id, &local_id, conn).await?;
                self.open_negotiated(&session, &protocol).await
            })
            .await;
        match established {
            None => Err(NetworkError::Cancelled),
            Some(result) => result,
        }
    }

    /// Selects the session protocol on a fresh connection, announces our
    /// id, and installs the resulting session in the cache.
    async fn establish_session(
        &self,
        peer_id: &str,
        local_id: &str,
        conn: Conn,
    ) -> Result<Arc<Session>, NetworkError> {
        debug!(tpid = %peer_id, "selecting session protocol");
        let mut io = select_proto(conn.compat(), SESSION_PROTOCOL).await?;

        // One identity line lets the other side key its session cache by
        // our id and reuse this connection for dials back to us.
        io.write_all(format!("{local_id}\n").as_bytes()).await?;
        io.flush().await?;

        let session = Arc::new(Session::new(
            io,
            Mode::Server,
            self.inner.config.substream_backlog,
        ));
        self.install_session(peer_id, &session);
        Ok(session)
    }

    /// Opens a substream on a live session and negotiates the
    /// sub-protocol on it.
    async fn open_negotiated(
        &self,
        session: &Arc<Session>,
        protocol: &str,
    ) -> Result<Conn, NetworkError> {
        let stream = session.open_substream().await?;
        trace!(protocol = %protocol, "selecting stream protocol");
        let stream = select_proto(stream, protocol).await?;
        Ok(Box::new(stream.compat()))
    }

    /// Inbound path for a raw connection that selected the session
    /// protocol: read the dialler's identity line, wrap the rest of the
    /// connection in a session and start accepting its substreams.
    async fn handle_connection(&self, mut conn: Conn) -> Result<(), NetworkError> {
        let remote_id = read_line(&mut conn, MAX_LINE).await?;
        debug!(lpid = %self.local_peer().id, rpid = %remote_id, "got remote peer id");
        let session = Arc::new(Session::new(
            conn.compat(),
            Mode::Client,
            self.inner.config.substream_backlog,
        ));
        self.install_session(&remote_id, &session);
        Ok(())
    }

    /// Caches a session and spawns its accept loop: every substream the
    /// remote opens runs through the stream-level selector on its own
    /// task. When accepting fails the session is closed and evicted; the
    /// listeners keep running.
    fn install_session(&self, peer_id: &str, session: &Arc<Session>) {
        self.inner
            .sessions
            .write()
            .insert(peer_id.to_string(), Arc::clone(session));

        let weak = self.downgrade();
        let session = Arc::clone(session);
        let peer_id = peer_id.to_string();
        tokio::spawn(async move {
            loop {
                match session.accept_substream().await {
                    Ok(stream) => {
                        let Ok(network) = weak.upgrade() else { break };
                        network.inner.mux.spawn_dispatch(stream);
                    }
                    Err(err) => {
                        debug!(rpid = %peer_id, error = %err, "session accept loop exiting");
                        session.close().await;
                        if let Ok(network) = weak.upgrade() {
                            network.evict(&peer_id, &session);
                        }
                        break;
                    }
                }
            }
        });
    }

    /// Fans the address out to every transport and starts an accept loop
    /// for each listener that binds. Returns the tagged bound addresses.
    pub async fn listen(&self, addr: &str) -> Result<Vec<String>, NetworkError> {
        let transports: Vec<Arc<dyn Transport>> = self.inner.transports.read().clone();
        let mut bound = Vec::new();
        let mut last_error = None;
        for transport in &transports {
            match transport.listen(addr).await {
                Ok(listener) => {
                    let local = listener.local_addr();
                    info!(addr = %local, "started listening");
                    bound.push(local);
                    self.spawn_accept_loop(listener);
                }
                Err(err) => {
                    debug!(addr = %addr, error = %err, "transport will not listen");
                    last_error = Some(err);
                }
            }
        }
        if bound.is_empty() {
            return Err(last_error.unwrap_or(NetworkError::TransportNotSupported));
        }
        Ok(bound)
    }

    fn spawn_accept_loop(&self, mut listener: Box<dyn Listener>) {
        let weak = self.downgrade();
        tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok(conn) => {
                        let Ok(network) = weak.upgrade() else { break };
                        network.inner.cmux.spawn_dispatch(conn.compat());
                    }
                    Err(err) => {
                        warn!(error = %err, "listener accept failed");
                        tokio::time::sleep(Duration::from_secs(1)).await;
                    }
                }
            }
        });
    }

    /// Registers a handler for an accepted substream negotiated as
    /// `protocol`. Handlers live for the lifetime of the network.
    pub fn register_stream_handler<F, Fut>(&self, protocol: impl Into<String>, handler: F)
    where
        F: Fn(String, Conn) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), NetworkError>> + Send + 'static,
    {
        self.inner.mux.add_handler(protocol, handler);
    }

    /// Registers a handler invoked with the merged record on every
    /// peerstore put.
    pub fn register_peer_handler<F>(&self, handler: F)
    where
        F: Fn(Peer) + Send + Sync + 'static,
    {
        self.inner.peerstore.register_peer_handler(handler);
    }

    /// Appends a transport; it is tried after the defaults.
    pub fn add_transport(&self, transport: Arc<dyn Transport>) {
        self.inner.transports.write().push(transport);
    }

    pub fn put_peer(&self, peer: Peer) {
        self.inner.peerstore.put(peer);
    }

    pub fn remove_peer(&self, id: &str) -> Option<Peer> {
        self.inner.peerstore.remove(id)
    }

    pub fn get_peer(&self, id: &str) -> Result<Peer, NetworkError> {
        self.inner.peerstore.get(id)
    }

    pub fn get_peers(&self) -> Vec<Peer> {
        self.inner.peerstore.peers()
    }

    pub fn local_peer(&self) -> Peer {
        self.inner.local.read().clone()
    }

    /// Ids of the peers with a live cached session.
    pub fn sessions(&self) -> Vec<String> {
        self.inner
            .sessions
            .read()
            .iter()
            .filter(|(_, session)| !session.is_closed())
            .map(|(id, _)| id.clone())
            .collect()
    }

    /// Live session to a peer, if one is cached.
    pub fn session(&self, peer_id: &str) -> Option<Arc<Session>> {
        self.inner.sessions.read().get(peer_id).cloned()
    }

    fn evict(&self, peer_id: &str, session: &Arc<Session>) {
        let mut sessions = self.inner.sessions.write();
        if sessions
            .get(peer_id)
            .is_some_and(|current| Arc::ptr_eq(current, session))
        {
            sessions.remove(peer_id);
        }
    }

    fn dial_lock(&self, peer_id: &str) -> Arc<AsyncMutex<()>> {
        let mut dialing = self.inner.dialing.lock();
        Arc::clone(dialing.entry(peer_id.to_string()).or_default())
    }
}
