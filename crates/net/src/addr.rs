//! Address parsing.
//!
//! A dial target is `<peer-id>/<sub-protocol>`; the sub-protocol may itself
//! contain slashes, so only the first `/` splits. Peer addresses are
//! transport-tagged: the tag is everything before the first `:`.

use crate::error::NetworkError;

/// Splits a dial target into peer id and sub-protocol name.
pub fn parse_dial_target(target: &str) -> Result<(String, String), NetworkError> {
    match target.split_once('/') {
        Some((peer_id, protocol)) if !protocol.is_empty() => {
            Ok((peer_id.to_string(), protocol.to_string()))
        }
        _ => Err(NetworkError::MissingProtocol),
    }
}

/// Transport tag of an address: the prefix before the first colon.
pub fn transport_tag(addr: &str) -> &str {
    addr.split(':').next().unwrap_or_default()
}

/// Strips the transport tag and any trailing `/sub-protocol` suffix,
/// leaving the `host:port` the underlying transport should dial.
pub fn clean_addr(addr: &str) -> Result<String, NetworkError> {
    let head = addr.split('/').next().unwrap_or_default();
    match head.split_once(':') {
        Some((_tag, rest)) if !rest.is_empty() => Ok(rest.to_string()),
        _ => Err(NetworkError::InvalidAddress(addr.to_string())),
    }
}
