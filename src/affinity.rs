//! Affinity rankings: which peers have tastes similar to ours.
//!
//! The store is written from the network delivery side (remote lists coming
//! in) and read from the recommendation side at the same time. All access goes
//! through a single `RwLock` around the whole ranking, so a reader sees either
//! the state before a `put` or after it, never a half-inserted entry.

use crate::key::PeerId;
use crate::peer::PeerIdentity;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::cmp::{Ordering, Reverse};
use std::collections::{BTreeMap, HashMap};
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

/// One (score, peer) pair as published in the DHT.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AffinityEntry {
    pub score: f32,
    pub peer: PeerIdentity,
}

impl AffinityEntry {
    #[must_use]
    pub const fn new(score: f32, peer: PeerIdentity) -> Self {
        Self { score, peer }
    }
}

/// Wrapper for f32 to get a total order (NaN is rejected before insertion).
#[derive(Debug, Clone, Copy)]
struct Score(f32);

impl PartialEq for Score {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Score {}

impl PartialOrd for Score {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Score {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.total_cmp(&other.0)
    }
}

/// Highest score first, then earliest insertion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct RankKey {
    score: Reverse<Score>,
    seq: u64,
}

#[derive(Debug, Default)]
struct Ranking {
    by_rank: BTreeMap<RankKey, PeerIdentity>,
    by_peer: HashMap<PeerId, RankKey>,
    next_seq: u64,
}

/// Sorted, thread-safe index from affinity score to peer.
///
/// Equal scores from different peers are all kept, ordered by insertion. A
/// peer appears at most once: putting a known peer again replaces its score.
#[derive(Debug, Default)]
pub struct AffinityRankingStore {
    inner: RwLock<Ranking>,
}

impl AffinityRankingStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a store from published entries, keeping their order for ties.
    pub fn from_entries(entries: impl IntoIterator<Item = AffinityEntry>) -> Self {
        let store = Self::new();
        for entry in entries {
            store.put(entry.score, entry.peer);
        }
        store
    }

    /// Insert or overwrite the score for `peer`. Returns false for NaN scores,
    /// which are dropped.
    pub fn put(&self, score: f32, peer: PeerIdentity) -> bool {
        if score.is_nan() {
            log::warn!("Ignoring NaN affinity score for peer {peer}");
            return false;
        }

        let mut ranking = self.write();
        if let Some(old) = ranking.by_peer.remove(&peer.id) {
            ranking.by_rank.remove(&old);
        }

        let key = RankKey {
            score: Reverse(Score(score)),
            seq: ranking.next_seq,
        };
        ranking.next_seq += 1;
        ranking.by_peer.insert(peer.id, key);
        ranking.by_rank.insert(key, peer);
        true
    }

    /// The `n` best peers, highest score first.
    #[must_use]
    pub fn top_k(&self, n: usize) -> Vec<PeerIdentity> {
        self.read().by_rank.values().take(n).cloned().collect()
    }

    /// Remove `peer` wherever it is ranked. Returns whether it was present.
    pub fn remove(&self, peer: &PeerIdentity) -> bool {
        let mut ranking = self.write();
        match ranking.by_peer.remove(&peer.id) {
            Some(key) => {
                ranking.by_rank.remove(&key);
                true
            }
            None => false,
        }
    }

    #[must_use]
    pub fn score_of(&self, peer: &PeerIdentity) -> Option<f32> {
        self.read().by_peer.get(&peer.id).map(|key| key.score.0 .0)
    }

    /// Consistent copy of the whole ranking, best first.
    #[must_use]
    pub fn entries(&self) -> Vec<AffinityEntry> {
        self.read()
            .by_rank
            .iter()
            .map(|(key, peer)| AffinityEntry::new(key.score.0 .0, peer.clone()))
            .collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.read().by_rank.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        let mut ranking = self.write();
        ranking.by_rank.clear();
        ranking.by_peer.clear();
    }

    /// JSON encoding used for the DHT.
    ///
    /// # Errors
    ///
    /// Only fails if serde_json cannot serialize the entries.
    pub fn to_json(&self) -> Result<Vec<u8>> {
        encode_entries(&self.entries())
    }

    /// Decode a ranking published by another peer.
    ///
    /// # Errors
    ///
    /// Fails when the payload is not a JSON list of entries.
    pub fn from_json(bytes: &[u8]) -> Result<Self> {
        let entries: Vec<AffinityEntry> =
            serde_json::from_slice(bytes).context("Malformed affinity list")?;
        Ok(Self::from_entries(entries))
    }

    fn read(&self) -> RwLockReadGuard<'_, Ranking> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Ranking> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Encode a raw list of entries, as handed out by a recommender.
///
/// # Errors
///
/// Only fails if serde_json cannot serialize the entries.
pub fn encode_entries(entries: &[AffinityEntry]) -> Result<Vec<u8>> {
    serde_json::to_vec(entries).context("Failed to encode affinity list")
}
