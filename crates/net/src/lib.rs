//! Peer-to-peer networking core.
//!
//! Establishes addressable, multi-protocol, bidirectional byte streams
//! between named peers over pluggable transports. A peer is a stable
//! string id plus transport-tagged addresses; dialling
//! `<peer-id>/<sub-protocol>` resolves the peer through the peerstore,
//! connects over the first transport that accepts one of its addresses,
//! and negotiates the sub-protocol on a fresh substream of a cached,
//! multiplexed session. Incoming substreams are dispatched to the handler
//! registered under the negotiated name. A relay transport tunnels dials
//! through a third peer when no direct address works.

mod addr;
mod config;
mod error;
mod net;
mod peer;
mod peerstore;
mod relay;
mod selector;
mod session;
mod transport;

pub use config::NetConfig;
pub use error::NetworkError;
pub use net::{Network, start_network};
pub use peer::Peer;
pub use peerstore::Peerstore;
pub use relay::RELAY_PROTOCOL;
pub use selector::SESSION_PROTOCOL;
pub use session::{Session, Substream};
pub use transport::{Conn, Listener, RawStream, TcpTransport, Transport};
