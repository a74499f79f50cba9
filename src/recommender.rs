//! Recommender interface.
//!
//! How songs are scored is up to the recommender; the node only needs the
//! next candidate to prefetch and the current affinity ranking to publish.

use crate::affinity::{AffinityEntry, AffinityRankingStore};
use crate::peer::PeerIdentity;
use crate::song::Song;
use rand::seq::SliceRandom;
use rand::thread_rng;
use std::collections::HashSet;
use std::sync::{Mutex, PoisonError};

pub trait RecommenderSystem: Send + Sync {
    /// Current affinity ranking, best peer first.
    fn affinity_list(&self) -> Vec<AffinityEntry>;

    /// Next song worth prefetching, `None` when there is nothing to suggest.
    fn next_song(&self) -> Option<Song>;
}

/// Minimal recommender: draws uniformly from a pool of candidate songs,
/// never suggesting the same song twice.
#[derive(Debug, Default)]
pub struct ShuffleRecommender {
    candidates: Mutex<Vec<Song>>,
    suggested: Mutex<HashSet<Song>>,
    affinity: AffinityRankingStore,
}

impl ShuffleRecommender {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add songs to the pool. Songs already in the pool or already suggested
    /// are skipped.
    pub fn add_candidates(&self, songs: impl IntoIterator<Item = Song>) {
        let suggested = self.suggested.lock().unwrap_or_else(PoisonError::into_inner);
        let mut candidates = self.candidates.lock().unwrap_or_else(PoisonError::into_inner);
        for song in songs {
            if !suggested.contains(&song) && !candidates.contains(&song) {
                candidates.push(song);
            }
        }
    }

    /// Record how close `peer` is to us.
    pub fn rate_peer(&self, score: f32, peer: PeerIdentity) {
        self.affinity.put(score, peer);
    }

    #[must_use]
    pub fn remaining(&self) -> usize {
        self.candidates.lock().unwrap_or_else(PoisonError::into_inner).len()
    }
}

impl RecommenderSystem for ShuffleRecommender {
    fn affinity_list(&self) -> Vec<AffinityEntry> {
        self.affinity.entries()
    }

    fn next_song(&self) -> Option<Song> {
        let mut candidates = self.candidates.lock().unwrap_or_else(PoisonError::into_inner);
        if candidates.is_empty() {
            return None;
        }

        candidates.shuffle(&mut thread_rng());
        let song = candidates.pop()?;
        drop(candidates);

        self.suggested
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(song.clone());
        Some(song)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_suggests_each_song_once() {
        let recommender = ShuffleRecommender::new();
        let songs: Vec<_> = (0..10).map(|i| Song::new(format!("t{i}"), "a", "g")).collect();
        recommender.add_candidates(songs.clone());
        recommender.add_candidates(songs.clone());
        assert_eq!(recommender.remaining(), 10);

        let mut seen = HashSet::new();
        while let Some(song) = recommender.next_song() {
            assert!(seen.insert(song));
        }
        assert_eq!(seen.len(), 10);

        recommender.add_candidates(songs);
        assert!(recommender.next_song().is_none(), "Suggested songs are not re-added");
    }

    #[test]
    fn test_affinity_list_sorted() {
        let recommender = ShuffleRecommender::new();
        let near = PeerIdentity::random("near");
        recommender.rate_peer(0.2, PeerIdentity::random("far"));
        recommender.rate_peer(0.9, near.clone());

        let list = recommender.affinity_list();
        assert_eq!(list[0].peer, near);
        assert_eq!(list.len(), 2);
    }
}
