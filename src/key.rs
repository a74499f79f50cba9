//! 160-bit identifiers shared by songs and peers.
//!
//! Both content keys and peer ids live in the same key space, so the overlay
//! can route a song key (or a tag term) to the peer whose id is closest to it.

use anyhow::{bail, Context, Result};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;

/// Length of a key in bytes.
pub const KEY_LEN: usize = 20;

/// A 160-bit key, rendered as 40 lowercase hex characters.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Key160([u8; KEY_LEN]);

/// Content key of a song.
pub type SongKey = Key160;

/// Identifier of a peer in the overlay.
pub type PeerId = Key160;

impl Key160 {
    #[must_use]
    pub const fn from_bytes(bytes: [u8; KEY_LEN]) -> Self {
        Self(bytes)
    }

    /// Hash arbitrary data into the key space (truncated SHA-256).
    #[must_use]
    pub fn hash(data: &[u8]) -> Self {
        let digest = Sha256::digest(data);
        let mut bytes = [0u8; KEY_LEN];
        bytes.copy_from_slice(&digest[..KEY_LEN]);
        Self(bytes)
    }

    /// Key for a DHT term such as an artist or genre name.
    #[must_use]
    pub fn for_term(term: &str) -> Self {
        Self::hash(term.trim().to_lowercase().as_bytes())
    }

    /// Fresh random key, used for peer ids.
    #[must_use]
    pub fn random() -> Self {
        let mut bytes = [0u8; KEY_LEN];
        rand::thread_rng().fill_bytes(&mut bytes);
        Self(bytes)
    }

    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }

    /// XOR distance to `other`. Compares lexicographically, like Kademlia.
    #[must_use]
    pub fn distance(&self, other: &Self) -> [u8; KEY_LEN] {
        let mut out = [0u8; KEY_LEN];
        for (i, byte) in out.iter_mut().enumerate() {
            *byte = self.0[i] ^ other.0[i];
        }
        out
    }

    #[must_use]
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Display for Key160 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for Key160 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Key160({})", &self.to_hex()[..8])
    }
}

impl FromStr for Key160 {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        if s.len() != KEY_LEN * 2 {
            bail!("Key must be {} hex characters, got {}", KEY_LEN * 2, s.len());
        }

        let mut bytes = [0u8; KEY_LEN];
        hex::decode_to_slice(s, &mut bytes).with_context(|| format!("Invalid hex in key {s}"))?;
        Ok(Self(bytes))
    }
}

impl TryFrom<String> for Key160 {
    type Error = anyhow::Error;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<Key160> for String {
    fn from(key: Key160) -> Self {
        key.to_hex()
    }
}
