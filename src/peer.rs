use crate::key::PeerId;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::hash::{Hash, Hasher};

/// Routable handle of a peer. Two handles are the same peer iff their ids match;
/// the address is only a hint for the transport.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerIdentity {
    pub id: PeerId,
    pub address: String,
}

impl PeerIdentity {
    #[must_use]
    pub fn new(id: PeerId, address: impl Into<String>) -> Self {
        Self {
            id,
            address: address.into(),
        }
    }

    /// Peer with a random id, handy for simulations.
    #[must_use]
    pub fn random(address: impl Into<String>) -> Self {
        Self::new(PeerId::random(), address)
    }
}

impl PartialEq for PeerIdentity {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for PeerIdentity {}

impl Hash for PeerIdentity {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl fmt::Display for PeerIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", &self.id.to_hex()[..8], self.address)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_equality_ignores_address() {
        let id = PeerId::random();
        assert_eq!(PeerIdentity::new(id, "10.0.0.1:4000"), PeerIdentity::new(id, "10.0.0.2:4000"));
        assert_ne!(PeerIdentity::random("a"), PeerIdentity::random("a"));
    }
}
