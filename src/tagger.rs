//! # Tag Consensus
//!
//! Peers crowd-source genre and artist tags by voting. When a peer publishes
//! a song it sends two votes: one routed to the peer responsible for the
//! artist name (tagging the song with its genre) and one routed to the peer
//! responsible for the genre (tagging it with its artist). The receiving peer
//! tallies the votes here.
//!
//! Votes are not deduplicated by origin: every vote counts. A peer voting the
//! same song up twice moves its score by two.

use crate::scheduler::Scheduler;
use crate::song::Song;
use crate::key::SongKey;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard};
use std::time::Duration;

/// How often an idle loop checks whether it was stopped.
const STOP_POLL: Duration = Duration::from_millis(100);

/// A single tag token (an artist or genre name).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SongTag(pub String);

impl SongTag {
    #[must_use]
    pub fn new(tag: impl Into<String>) -> Self {
        Self(tag.into())
    }
}

impl fmt::Display for SongTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum VoteDirection {
    Up,
    Down,
}

impl VoteDirection {
    #[must_use]
    pub const fn delta(self) -> i64 {
        match self {
            Self::Up => 1,
            Self::Down => -1,
        }
    }
}

/// A vote, routed by the overlay to whoever is responsible for `term`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VotingMessage {
    pub term: String,
    pub tags: Vec<SongTag>,
    pub song: Song,
    pub direction: VoteDirection,
}

impl VotingMessage {
    #[must_use]
    pub fn new(term: impl Into<String>, tags: Vec<SongTag>, song: Song, direction: VoteDirection) -> Self {
        Self {
            term: term.into(),
            tags,
            song,
            direction,
        }
    }

    /// The two upvotes a peer sends for a song it owns.
    #[must_use]
    pub fn proposals_for(song: &Song) -> [Self; 2] {
        [
            Self::new(song.artist(), vec![SongTag::new(song.genre())], song.clone(), VoteDirection::Up),
            Self::new(song.genre(), vec![SongTag::new(song.artist())], song.clone(), VoteDirection::Up),
        ]
    }

    /// # Errors
    ///
    /// Only fails if serde_json cannot serialize the message.
    pub fn to_json(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self).context("Failed to encode voting message")
    }

    /// # Errors
    ///
    /// Fails for anything that is not a JSON voting message.
    pub fn from_json(bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes).context("Malformed voting message")
    }
}

/// Tally for one (term, song) pair.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TagScore {
    pub score: i64,
    pub tags: BTreeMap<SongTag, i64>,
}

#[derive(Debug, Default)]
struct TagEntry {
    song: Option<Song>,
    tally: TagScore,
}

type TagTable = HashMap<(String, SongKey), TagEntry>;

/// Vote aggregator. Cloning gives another handle to the same table.
#[derive(Debug, Clone)]
pub struct TagConsensus {
    table: Arc<RwLock<TagTable>>,
    sender: Sender<VotingMessage>,
    running: Arc<AtomicBool>,
}

impl TagConsensus {
    /// Start the aggregation loop on `scheduler`.
    ///
    /// The loop ends on [`stop`](Self::stop), or once every handle (and
    /// every sender obtained from [`sender`](Self::sender)) has been dropped.
    ///
    /// # Errors
    ///
    /// Fails if `scheduler` has no free thread for the loop.
    pub fn start(scheduler: &Scheduler) -> Result<Self> {
        let lease = scheduler.lease("tag consensus")?;
        let (sender, receiver) = mpsc::channel();
        let table = Arc::new(RwLock::new(TagTable::new()));
        let running = Arc::new(AtomicBool::new(true));

        let loop_table = Arc::clone(&table);
        let loop_running = Arc::clone(&running);
        lease.spawn(move || run(&loop_table, &receiver, &loop_running));
        log::info!("Tag consensus started");

        Ok(Self { table, sender, running })
    }

    /// Stop the background loop. Votes still queued are discarded; the
    /// table stays readable and [`apply`](Self::apply) keeps working.
    pub fn stop(&self) {
        self.running.store(false, Ordering::Release);
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Queue a vote for the background loop.
    pub fn submit(&self, message: VotingMessage) {
        if self.sender.send(message).is_err() {
            log::warn!("Tag consensus loop is gone, vote dropped");
        }
    }

    /// Sender for delivery threads such as the overlay message listener.
    #[must_use]
    pub fn sender(&self) -> Sender<VotingMessage> {
        self.sender.clone()
    }

    /// Apply a vote right away, bypassing the queue.
    pub fn apply(&self, message: &VotingMessage) {
        apply_vote(&self.table, message);
    }

    /// Net score of `song` under `term`; zero if nobody voted.
    #[must_use]
    pub fn score(&self, term: &str, song: &SongKey) -> i64 {
        self.read()
            .get(&(normalize_term(term), *song))
            .map_or(0, |entry| entry.tally.score)
    }

    /// Full tally, including the per-tag breakdown.
    #[must_use]
    pub fn tags(&self, term: &str, song: &SongKey) -> Option<TagScore> {
        self.read()
            .get(&(normalize_term(term), *song))
            .map(|entry| entry.tally.clone())
    }

    /// Songs voted under `term`, best score first.
    #[must_use]
    pub fn songs_for_term(&self, term: &str) -> Vec<(Song, i64)> {
        let term = normalize_term(term);
        let mut ranked: Vec<(Song, i64)> = self
            .read()
            .iter()
            .filter(|((entry_term, _), _)| *entry_term == term)
            .filter_map(|(_, entry)| entry.song.clone().map(|song| (song, entry.tally.score)))
            .collect();
        ranked.sort_by(|(a_song, a), (b_song, b)| b.cmp(a).then_with(|| a_song.key().cmp(b_song.key())));
        ranked
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.read().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn read(&self) -> RwLockReadGuard<'_, TagTable> {
        self.table.read().unwrap_or_else(PoisonError::into_inner)
    }
}

fn run(table: &RwLock<TagTable>, receiver: &Receiver<VotingMessage>, running: &AtomicBool) {
    while running.load(Ordering::Acquire) {
        match receiver.recv_timeout(STOP_POLL) {
            Ok(message) => apply_vote(table, &message),
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }
    running.store(false, Ordering::Release);
    log::info!("Tag consensus stopped");
}

fn apply_vote(table: &RwLock<TagTable>, message: &VotingMessage) {
    let delta = message.direction.delta();
    let mut table = table.write().unwrap_or_else(PoisonError::into_inner);
    let entry = table
        .entry((normalize_term(&message.term), *message.song.key()))
        .or_default();

    entry.song.get_or_insert_with(|| message.song.clone());
    entry.tally.score += delta;
    for tag in &message.tags {
        *entry.tally.tags.entry(tag.clone()).or_insert(0) += delta;
    }

    log::debug!(
        "Vote {:?} on `{}' for {} -> {}",
        message.direction,
        message.term,
        message.song,
        entry.tally.score
    );
}

fn normalize_term(term: &str) -> String {
    term.trim().to_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, Instant};

    fn consensus() -> TagConsensus {
        TagConsensus::start(&Scheduler::new(4).unwrap()).unwrap()
    }

    fn wait_for(mut condition: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if condition() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        false
    }

    #[test]
    fn test_up_and_down_votes_tally() {
        let tagger = consensus();
        let song = Song::new("Paranoid", "Black Sabbath", "Metal");
        let up = VotingMessage::new("Metal", vec![SongTag::new("Black Sabbath")], song.clone(), VoteDirection::Up);
        let down = VotingMessage { direction: VoteDirection::Down, ..up.clone() };

        tagger.apply(&up);
        tagger.apply(&up);
        tagger.apply(&down);

        assert_eq!(tagger.score("metal", song.key()), 1);
        let tally = tagger.tags("Metal", song.key()).unwrap();
        assert_eq!(tally.tags.get(&SongTag::new("Black Sabbath")), Some(&1));
    }

    #[test]
    fn test_repeated_votes_are_not_deduplicated() {
        let tagger = consensus();
        let song = Song::new("t", "a", "g");
        let vote = VotingMessage::new("g", vec![], song.clone(), VoteDirection::Up);
        for _ in 0..5 {
            tagger.apply(&vote);
        }
        assert_eq!(tagger.score("g", song.key()), 5);
    }

    #[test]
    fn test_submitted_votes_are_applied_in_background() {
        let scheduler = Scheduler::new(4).unwrap();
        let tagger = TagConsensus::start(&scheduler).unwrap();
        let song = Song::new("Giant Steps", "John Coltrane", "Jazz");
        for vote in VotingMessage::proposals_for(&song) {
            tagger.submit(vote);
        }

        assert!(wait_for(|| tagger.len() == 2));
        assert_eq!(tagger.score("John Coltrane", song.key()), 1);
        assert_eq!(tagger.score("jazz", song.key()), 1);
    }

    #[test]
    fn test_stop_ends_background_loop() {
        let scheduler = Scheduler::new(4).unwrap();
        let tagger = TagConsensus::start(&scheduler).unwrap();
        let _listener_side = tagger.sender();
        assert!(tagger.is_running());

        tagger.stop();
        assert!(!tagger.is_running());

        let song = Song::new("t", "a", "g");
        tagger.apply(&VotingMessage::new("g", vec![], song.clone(), VoteDirection::Up));
        assert_eq!(tagger.score("g", song.key()), 1);
    }

    #[test]
    fn test_songs_for_term_ranked() {
        let tagger = consensus();
        let weak = Song::new("Weak", "x", "Rock");
        let strong = Song::new("Strong", "y", "Rock");
        tagger.apply(&VotingMessage::new("Rock", vec![], weak.clone(), VoteDirection::Up));
        for _ in 0..3 {
            tagger.apply(&VotingMessage::new("Rock", vec![], strong.clone(), VoteDirection::Up));
        }
        tagger.apply(&VotingMessage::new("Jazz", vec![], weak, VoteDirection::Up));

        let ranked = tagger.songs_for_term("rock");
        assert_eq!(ranked.len(), 2);
        assert_eq!(ranked[0], (strong, 3));
    }

    #[test]
    fn test_unknown_pair_scores_zero() {
        let tagger = consensus();
        assert_eq!(tagger.score("nothing", &SongKey::hash(b"nope")), 0);
        assert!(tagger.tags("nothing", &SongKey::hash(b"nope")).is_none());
    }

    #[test]
    fn test_message_json() {
        let song = Song::new("t", "a", "g");
        let [first, _] = VotingMessage::proposals_for(&song);
        let decoded = VotingMessage::from_json(&first.to_json().unwrap()).unwrap();
        assert_eq!(decoded, first);
        assert_eq!(decoded.term, "a");
        assert_eq!(decoded.tags, vec![SongTag::new("g")]);
    }
}
