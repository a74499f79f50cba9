//! # Overlay Interface
//!
//! Everything the node needs from the peer-to-peer network: a DHT for
//! published values, a tracker recording which peers hold which song, routed
//! delivery of votes and direct song requests between peers.
//!
//! The transport itself is not part of this crate. [`memory`] provides an
//! in-process implementation for tests and simulations.
//!
//! ## DHT Layout
//!
//! | key                           | value                        |
//! |-------------------------------|------------------------------|
//! | peer id (hex)                 | catalog filter bytes         |
//! | `affinity:` + peer id (hex)   | JSON affinity list           |
//! | song key (hex), tracker       | set of peers holding it      |

pub mod memory;

use crate::key::SongKey;
use crate::peer::PeerIdentity;
use crate::tagger::VotingMessage;
use anyhow::Result;
use std::sync::Arc;

/// Prefix for affinity lists in the DHT.
pub const AFFINITY_PREFIX: &str = "affinity:";

/// Handler for messages other peers send to this node.
pub trait MessageListener: Send + Sync {
    /// Audio bytes for `key` if this node has the song.
    fn on_song_request(&self, key: &SongKey) -> Option<Vec<u8>>;

    /// A vote routed here because this node is responsible for its term.
    fn on_vote(&self, message: VotingMessage);
}

/// Peer-to-peer overlay as seen by the node. All calls block until the
/// network answers or fails.
pub trait Overlay: Send + Sync {
    fn local_peer(&self) -> PeerIdentity;

    /// Store `value` under `key` in the DHT.
    ///
    /// # Errors
    ///
    /// Network or storage failure.
    fn put(&self, key: &str, value: Vec<u8>) -> Result<()>;

    /// Value under `key`, `None` if nothing is stored.
    ///
    /// # Errors
    ///
    /// Network or storage failure.
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// Announce that this node holds the content under `key`.
    fn add_to_tracker(&self, key: &str) -> bool;

    /// Peers that announced `key`.
    ///
    /// # Errors
    ///
    /// Network failure.
    fn tracker_peers(&self, key: &str) -> Result<Vec<PeerIdentity>>;

    /// Route `message` to the peer responsible for `key`.
    ///
    /// # Errors
    ///
    /// No route, or the responsible peer could not be reached.
    fn lookup_and_send_message(&self, key: &str, message: &VotingMessage) -> Result<()>;

    /// Ask `peer` directly for the audio of `key`.
    ///
    /// # Errors
    ///
    /// Peer unreachable or it does not have the song.
    fn request_song(&self, peer: &PeerIdentity, key: &SongKey) -> Result<Vec<u8>>;

    /// Install the handler for incoming messages, replacing any previous one.
    fn set_message_listener(&self, listener: Arc<dyn MessageListener>);
}

/// DHT key of a peer's catalog filter.
#[must_use]
pub fn song_list_key(peer: &PeerIdentity) -> String {
    peer.id.to_hex()
}

/// DHT key of a peer's affinity list.
#[must_use]
pub fn affinity_key(peer: &PeerIdentity) -> String {
    format!("{AFFINITY_PREFIX}{}", peer.id.to_hex())
}

/// Tracker key of a song.
#[must_use]
pub fn tracker_key(song: &SongKey) -> String {
    song.to_hex()
}
