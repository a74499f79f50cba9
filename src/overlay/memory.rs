//! In-process overlay.
//!
//! All peers share one [`MemoryNetwork`]; each gets its own [`MemoryOverlay`]
//! handle. Votes are routed to the registered peer whose id is XOR-closest to
//! the term's key, like a Kademlia lookup would. Faults can be injected to
//! exercise the fail-soft paths: unreachable peers, tracker keys that refuse
//! announcements, and a DHT that is down.

use super::{MessageListener, Overlay};
use crate::key::{Key160, PeerId, SongKey};
use crate::peer::PeerIdentity;
use crate::tagger::VotingMessage;
use anyhow::{anyhow, bail, Result};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

struct PeerSlot {
    identity: PeerIdentity,
    listener: Option<Arc<dyn MessageListener>>,
}

#[derive(Default)]
struct NetworkState {
    dht: HashMap<String, Vec<u8>>,
    trackers: HashMap<String, Vec<PeerIdentity>>,
    peers: BTreeMap<PeerId, PeerSlot>,
    unreachable: HashSet<PeerId>,
    failing_tracker_keys: HashSet<String>,
    dht_down: bool,
}

/// Shared state of an in-process network.
#[derive(Default)]
pub struct MemoryNetwork {
    state: Mutex<NetworkState>,
}

impl MemoryNetwork {
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Register a new peer at `address` and return its overlay handle.
    #[must_use]
    pub fn join(self: &Arc<Self>, address: &str) -> MemoryOverlay {
        let identity = PeerIdentity::random(address);
        self.lock().peers.insert(
            identity.id,
            PeerSlot {
                identity: identity.clone(),
                listener: None,
            },
        );
        log::debug!("Peer {identity} joined the network");

        MemoryOverlay {
            network: Arc::clone(self),
            identity,
            calls: AtomicUsize::new(0),
        }
    }

    /// Make `peer` drop every message and refuse every request.
    pub fn set_unreachable(&self, peer: &PeerIdentity, unreachable: bool) {
        let mut state = self.lock();
        if unreachable {
            state.unreachable.insert(peer.id);
        } else {
            state.unreachable.remove(&peer.id);
        }
    }

    /// Make announcements under `key` fail.
    pub fn fail_tracker_key(&self, key: &str) {
        self.lock().failing_tracker_keys.insert(key.to_string());
    }

    /// Take the whole DHT down (or bring it back).
    pub fn set_dht_down(&self, down: bool) {
        self.lock().dht_down = down;
    }

    #[must_use]
    pub fn peers(&self) -> Vec<PeerIdentity> {
        self.lock().peers.values().map(|slot| slot.identity.clone()).collect()
    }

    /// Raw DHT value, bypassing fault injection.
    #[must_use]
    pub fn stored(&self, key: &str) -> Option<Vec<u8>> {
        self.lock().dht.get(key).cloned()
    }

    fn lock(&self) -> MutexGuard<'_, NetworkState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Listener of the reachable peer closest to `target`.
    fn route(&self, target: &Key160) -> Result<(PeerIdentity, Arc<dyn MessageListener>)> {
        let state = self.lock();
        let slot = state
            .peers
            .values()
            .min_by_key(|slot| slot.identity.id.distance(target))
            .ok_or_else(|| anyhow!("No peers in the network"))?;

        if state.unreachable.contains(&slot.identity.id) {
            bail!("Responsible peer {} is unreachable", slot.identity);
        }
        let listener = slot
            .listener
            .clone()
            .ok_or_else(|| anyhow!("Peer {} has no message listener", slot.identity))?;
        Ok((slot.identity.clone(), listener))
    }

    fn listener_of(&self, peer: &PeerIdentity) -> Result<Arc<dyn MessageListener>> {
        let state = self.lock();
        if state.unreachable.contains(&peer.id) {
            bail!("Peer {peer} is unreachable");
        }
        state
            .peers
            .get(&peer.id)
            .and_then(|slot| slot.listener.clone())
            .ok_or_else(|| anyhow!("Peer {peer} is not listening"))
    }
}

/// One peer's view of a [`MemoryNetwork`].
pub struct MemoryOverlay {
    network: Arc<MemoryNetwork>,
    identity: PeerIdentity,
    calls: AtomicUsize,
}

impl MemoryOverlay {
    /// Number of overlay operations issued through this handle.
    #[must_use]
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn network(&self) -> &Arc<MemoryNetwork> {
        &self.network
    }

    fn count(&self) {
        self.calls.fetch_add(1, Ordering::SeqCst);
    }

    fn check_dht(&self, state: &NetworkState) -> Result<()> {
        if state.dht_down {
            bail!("DHT unavailable");
        }
        if state.unreachable.contains(&self.identity.id) {
            bail!("Local peer {} is cut off from the network", self.identity);
        }
        Ok(())
    }
}

impl Overlay for MemoryOverlay {
    fn local_peer(&self) -> PeerIdentity {
        self.identity.clone()
    }

    fn put(&self, key: &str, value: Vec<u8>) -> Result<()> {
        self.count();
        let mut state = self.network.lock();
        self.check_dht(&state)?;
        state.dht.insert(key.to_string(), value);
        Ok(())
    }

    fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        self.count();
        let state = self.network.lock();
        self.check_dht(&state)?;
        Ok(state.dht.get(key).cloned())
    }

    fn add_to_tracker(&self, key: &str) -> bool {
        self.count();
        let mut state = self.network.lock();
        if state.dht_down || state.failing_tracker_keys.contains(key) {
            return false;
        }

        let holders = state.trackers.entry(key.to_string()).or_default();
        if !holders.contains(&self.identity) {
            holders.push(self.identity.clone());
        }
        true
    }

    fn tracker_peers(&self, key: &str) -> Result<Vec<PeerIdentity>> {
        self.count();
        let state = self.network.lock();
        self.check_dht(&state)?;
        Ok(state.trackers.get(key).cloned().unwrap_or_default())
    }

    fn lookup_and_send_message(&self, key: &str, message: &VotingMessage) -> Result<()> {
        self.count();
        let (target, listener) = self.network.route(&Key160::for_term(key))?;
        log::trace!("Routing vote on `{key}' to {target}");
        listener.on_vote(message.clone());
        Ok(())
    }

    fn request_song(&self, peer: &PeerIdentity, key: &SongKey) -> Result<Vec<u8>> {
        self.count();
        let listener = self.network.listener_of(peer)?;
        listener
            .on_song_request(key)
            .ok_or_else(|| anyhow!("Peer {peer} does not have song {key}"))
    }

    fn set_message_listener(&self, listener: Arc<dyn MessageListener>) {
        if let Some(slot) = self.network.lock().peers.get_mut(&self.identity.id) {
            slot.listener = Some(listener);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::song::Song;
    use crate::tagger::{SongTag, VoteDirection};
    use std::sync::Mutex as StdMutex;

    #[derive(Default)]
    struct Recorder {
        votes: StdMutex<Vec<VotingMessage>>,
        songs: HashMap<SongKey, Vec<u8>>,
    }

    impl MessageListener for Recorder {
        fn on_song_request(&self, key: &SongKey) -> Option<Vec<u8>> {
            self.songs.get(key).cloned()
        }

        fn on_vote(&self, message: VotingMessage) {
            self.votes.lock().unwrap().push(message);
        }
    }

    fn vote(term: &str) -> VotingMessage {
        VotingMessage::new(term, vec![SongTag::new("x")], Song::new("t", "a", "g"), VoteDirection::Up)
    }

    #[test]
    fn test_dht_put_get() {
        let network = MemoryNetwork::new();
        let a = network.join("a");
        let b = network.join("b");

        a.put("k", vec![1, 2, 3]).unwrap();
        assert_eq!(b.get("k").unwrap(), Some(vec![1, 2, 3]));
        assert_eq!(b.get("missing").unwrap(), None);
        assert_eq!(a.calls(), 1);
    }

    #[test]
    fn test_dht_down_fails() {
        let network = MemoryNetwork::new();
        let a = network.join("a");
        network.set_dht_down(true);
        assert!(a.put("k", vec![]).is_err());
        assert!(a.get("k").is_err());
        assert!(!a.add_to_tracker("k"));
    }

    #[test]
    fn test_tracker_announcements() {
        let network = MemoryNetwork::new();
        let a = network.join("a");
        let b = network.join("b");

        assert!(a.add_to_tracker("song"));
        assert!(a.add_to_tracker("song"));
        assert!(b.add_to_tracker("song"));
        assert_eq!(a.tracker_peers("song").unwrap().len(), 2);

        network.fail_tracker_key("bad");
        assert!(!a.add_to_tracker("bad"));
    }

    #[test]
    fn test_votes_route_to_one_responsible_peer() {
        let network = MemoryNetwork::new();
        let overlays: Vec<_> = (0..5).map(|i| network.join(&format!("p{i}"))).collect();
        let recorders: Vec<_> = overlays
            .iter()
            .map(|overlay| {
                let recorder = Arc::new(Recorder::default());
                overlay.set_message_listener(Arc::clone(&recorder) as Arc<dyn MessageListener>);
                recorder
            })
            .collect();

        overlays[0].lookup_and_send_message("Jazz", &vote("Jazz")).unwrap();
        overlays[3].lookup_and_send_message("jazz", &vote("Jazz")).unwrap();

        let receivers: Vec<_> = recorders
            .iter()
            .filter(|r| !r.votes.lock().unwrap().is_empty())
            .collect();
        assert_eq!(receivers.len(), 1, "Same term must always land on the same peer");
        assert_eq!(receivers[0].votes.lock().unwrap().len(), 2);
    }

    #[test]
    fn test_song_requests() {
        let network = MemoryNetwork::new();
        let a = network.join("a");
        let b = network.join("b");
        let key = SongKey::hash(b"song");

        let mut recorder = Recorder::default();
        recorder.songs.insert(key, b"audio".to_vec());
        b.set_message_listener(Arc::new(recorder));

        assert_eq!(a.request_song(&b.local_peer(), &key).unwrap(), b"audio".to_vec());
        assert!(a.request_song(&b.local_peer(), &SongKey::hash(b"other")).is_err());

        network.set_unreachable(&b.local_peer(), true);
        assert!(a.request_song(&b.local_peer(), &key).is_err());
    }
}
