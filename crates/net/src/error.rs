use std::io;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum NetworkError {
    #[error("missing protocol in dial target")]
    MissingProtocol,
    #[error("refusing to dial the local peer")]
    SelfDial,
    #[error("peer {0} not found")]
    UnknownPeer(String),
    #[error("peer {0} has no addresses")]
    NoAddresses(String),
    #[error("invalid address {0}")]
    InvalidAddress(String),
    #[error("transport not supported")]
    TransportNotSupported,
    #[error("protocol negotiation failed: {0}")]
    Selector(#[from] multistream_select::NegotiationError),
    #[error("session closed")]
    SessionClosed,
    #[error("multiplexer error: {0}")]
    Mux(String),
    #[error("relay refused to bridge: {0}")]
    RelayRejected(String),
    #[error("dial cancelled")]
    Cancelled,
    #[error("network has shut down")]
    Shutdown,
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

impl From<yamux::ConnectionError> for NetworkError {
    fn from(err: yamux::ConnectionError) -> Self {
        match err {
            yamux::ConnectionError::Closed => NetworkError::SessionClosed,
            yamux::ConnectionError::Io(err) => NetworkError::Io(err),
            other => NetworkError::Mux(other.to_string()),
        }
    }
}

impl From<NetworkError> for io::Error {
    fn from(err: NetworkError) -> Self {
        match err {
            NetworkError::Io(e) => e,
            other => io::Error::other(other),
        }
    }
}
