//! Relay transport.
//!
//! Lets peer A reach peer B through a third peer R by opening a `relay`
//! sub-protocol stream on R, naming the target, and having R splice that
//! stream onto a fresh dial of its own. The transport is registered on the
//! network it wraps both as a transport (the dialling half) and as a
//! stream handler (the bridging half), so a chain of relays recurses
//! naturally.
//!
//! Connections produced here are already negotiated logical streams; the
//! network returns them to the dialler without session establishment.

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::addr::transport_tag;
use crate::error::NetworkError;
use crate::net::WeakNetwork;
use crate::transport::{Conn, Listener, MAX_LINE, Transport, read_line};

/// Sub-protocol name the bridging half answers on.
pub const RELAY_PROTOCOL: &str = "relay";

const RELAY_TAG: &str = "relay";

/// Line sent back once the relay has bridged the target.
const BRIDGED: &str = "ok";

pub struct RelayTransport {
    net: WeakNetwork,
}

impl RelayTransport {
    pub(crate) fn new(net: WeakNetwork) -> Self {
        Self { net }
    }

    /// Peer id of the relay itself: the segment between `relay:` and the
    /// first `/`.
    fn relay_id(addr: &str) -> Result<String, NetworkError> {
        let head = addr.split('/').next().unwrap_or_default();
        match head.split_once(':') {
            Some((_tag, id)) if !id.is_empty() => Ok(id.to_string()),
            _ => Err(NetworkError::InvalidAddress(addr.to_string())),
        }
    }

    /// Dial target to hand to the relay: everything after the first `/`.
    fn target_addr(addr: &str) -> Result<String, NetworkError> {
        match addr.split_once('/') {
            Some((_, target)) if !target.is_empty() => Ok(target.to_string()),
            _ => Err(NetworkError::InvalidAddress(addr.to_string())),
        }
    }

    /// Bridging half, run for every inbound `relay` substream: read the
    /// target line, dial it through our own network, confirm, splice.
    pub(crate) async fn handle_new_stream(
        &self,
        _protocol: String,
        mut stream: Conn,
    ) -> Result<(), NetworkError> {
        let target = read_line(&mut stream, MAX_LINE).await?;
        info!(taddr = %target, "bridging relay stream");
        let net = self.net.upgrade()?;

        let mut outbound = match net.dial(&target).await {
            Ok(conn) => conn,
            Err(err) => {
                warn!(taddr = %target, error = %err, "could not dial relay target");
                return Err(err);
            }
        };

        stream.write_all(format!("{BRIDGED}\n").as_bytes()).await?;
        stream.flush().await?;

        // Copy both directions until either side closes or errors, then
        // tear both halves down together.
        match tokio::io::copy_bidirectional(&mut stream, &mut outbound).await {
            Ok((to_target, from_target)) => {
                debug!(to_target, from_target, "relay bridge closed")
            }
            Err(err) => debug!(error = %err, "relay bridge failed"),
        }
        Ok(())
    }
}

#[async_trait]
impl Transport for RelayTransport {
    fn matches(&self, addr: &str) -> bool {
        transport_tag(addr) == RELAY_TAG
    }

    fn provides_stream(&self) -> bool {
        true
    }

    async fn dial(&self, addr: &str, cancel: CancellationToken) -> Result<Conn, NetworkError> {
        if !self.matches(addr) {
            return Err(NetworkError::TransportNotSupported);
        }
        let relay_id = Self::relay_id(addr)?;
        let target = Self::target_addr(addr)?;
        let net = self.net.upgrade()?;
        debug!(raddr = %relay_id, taddr = %target, "dialing through relay");

        let mut conn = net
            .dial_with_cancel(&format!("{relay_id}/{RELAY_PROTOCOL}"), cancel)
            .await?;
        conn.write_all(format!("{target}\n").as_bytes()).await?;
        conn.flush().await?;

        let answer = read_line(&mut conn, MAX_LINE).await?;
        if answer != BRIDGED {
            return Err(NetworkError::RelayRejected(answer));
        }
        Ok(conn)
    }

    async fn listen(&self, _addr: &str) -> Result<Box<dyn Listener>, NetworkError> {
        Err(NetworkError::TransportNotSupported)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_relay_and_target_segments() {
        let addr = "relay:hub/spoke/echo/v1";
        assert_eq!(RelayTransport::relay_id(addr).expect("relay id"), "hub");
        assert_eq!(
            RelayTransport::target_addr(addr).expect("target"),
            "spoke/echo/v1"
        );
    }

    #[test]
    fn relay_id_may_contain_colons() {
        let addr = "relay:hub:extra/spoke/echo/v1";
        assert_eq!(
            RelayTransport::relay_id(addr).expect("relay id"),
            "hub:extra"
        );
    }

    #[test]
    fn rejects_malformed_relay_addresses() {
        assert!(RelayTransport::relay_id("relay:/spoke").is_err());
        assert!(RelayTransport::target_addr("relay:hub").is_err());
    }
}
