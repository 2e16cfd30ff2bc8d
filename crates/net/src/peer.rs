use serde::{Deserialize, Serialize};

/// Addressable endpoint identified by a stable string id.
///
/// Addresses are transport-tagged strings such as `tcp4:10.0.0.1:8644`,
/// `tcp6:[::1]:8644` or `relay:<relay-id>/<peer-id>`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Peer {
    pub id: String,
    pub addresses: Vec<String>,
}

impl Peer {
    pub fn new(id: impl Into<String>, addresses: Vec<String>) -> Self {
        Self {
            id: id.into(),
            addresses,
        }
    }
}
