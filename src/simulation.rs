//! # In-Process Simulation
//!
//! Runs a small network of nodes inside one process on top of
//! [`MemoryNetwork`](crate::overlay::memory::MemoryNetwork). Every peer gets a
//! scratch library of fake audio files drawn from a shared catalog, so peers
//! overlap the way real collections do.
//!
//! The first peer acts as the listener. It reads everyone else's catalog
//! filter, rates them by how much of its own music they share, and lets the
//! prefetch worker download songs it does not have yet.

use crate::config::NodeConfig;
use crate::coordinator::{Coordinator, PublishReport};
use crate::overlay::memory::MemoryNetwork;
use crate::recommender::ShuffleRecommender;
use crate::scheduler::Scheduler;
use crate::song::{PlayListEntry, Song};
use crate::ui::LogUi;
use anyhow::{ensure, Context, Result};
use log::{info, warn};
use rand::seq::SliceRandom;
use rand::thread_rng;
use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

const GENRES: [&str; 5] = ["Jazz", "Rock", "Folk", "Metal", "Pop"];

/// Parameters of a simulation run.
#[derive(Debug, Clone)]
pub struct SimulationOptions {
    pub peers: usize,
    pub songs_per_peer: usize,
    /// Songs the listener tries to play.
    pub plays: usize,
    /// How long to wait for each song to become ready.
    pub wait: Duration,
}

impl Default for SimulationOptions {
    fn default() -> Self {
        Self {
            peers: 4,
            songs_per_peer: 20,
            plays: 5,
            wait: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct SimulationReport {
    pub published: Vec<PublishReport>,
    /// Remote catalog filters the listener could read.
    pub song_lists_found: usize,
    /// Songs the listener had no local copy of but some peer did.
    pub candidates: usize,
    pub played: Vec<PlayListEntry>,
    pub affinity_published: bool,
}

/// The shared catalog all peers draw from.
#[must_use]
pub fn catalog(size: usize) -> Vec<Song> {
    (0..size)
        .map(|i| Song::new(format!("Track {i}"), format!("Artist {}", i / 4), GENRES[i % GENRES.len()]))
        .collect()
}

/// Lay out `songs` under `root` as `<genre>/<artist>/<title>.mp3`.
///
/// # Errors
///
/// Fails on any filesystem error.
pub fn write_library(root: &Path, songs: &[Song]) -> Result<()> {
    for song in songs {
        let dir = root.join(song.genre()).join(song.artist());
        fs::create_dir_all(&dir).with_context(|| format!("Failed to create {}", dir.display()))?;
        fs::write(dir.join(format!("{}.mp3", song.title())), song.to_string())
            .with_context(|| format!("Failed to write {song}"))?;
    }
    Ok(())
}

/// Run a simulation with scratch files under `workdir`.
///
/// # Errors
///
/// Fails when a peer's library cannot be created or a node cannot start.
/// Network trouble during the run is logged, not returned.
pub fn run(workdir: &Path, options: &SimulationOptions, config: &NodeConfig) -> Result<SimulationReport> {
    ensure!(options.peers >= 2, "A simulation needs at least two peers");

    let network = MemoryNetwork::new();
    let universe = catalog(options.songs_per_peer * 2);
    let mut rng = thread_rng();

    let mut nodes = Vec::with_capacity(options.peers);
    for i in 0..options.peers {
        let peer_dir = workdir.join(format!("peer-{i}"));
        let music = peer_dir.join("music");
        let owned: Vec<Song> = universe
            .choose_multiple(&mut rng, options.songs_per_peer)
            .cloned()
            .collect();
        write_library(&music, &owned)?;

        let node_config = NodeConfig {
            cache_dir: peer_dir.join("cache"),
            library_db: None,
            ..config.clone()
        };
        let scheduler = Scheduler::new(node_config.scheduler_threads)?;
        let overlay = Arc::new(network.join(&format!("peer-{i}")));
        let node = Coordinator::new(overlay, &music, node_config, &scheduler)
            .with_context(|| format!("Failed to start peer {i}"))?;
        node.register_message_listener();
        nodes.push(node);
    }

    let mut report = SimulationReport {
        published: nodes.iter().map(Coordinator::publish_local_music).collect(),
        ..SimulationReport::default()
    };

    let listener = &nodes[0];
    listener.register_ui(Arc::new(LogUi));
    let local = listener.fetch_local_song_list();
    let recommender = Arc::new(ShuffleRecommender::new());

    for other in &nodes[1..] {
        let peer = other.local_peer();
        let Some(filter) = listener.fetch_remote_song_list(&peer) else {
            warn!("No song list from {peer}");
            continue;
        };
        report.song_lists_found += 1;

        let shared = local.iter().filter(|song| filter.contains(song)).count();
        let affinity = if local.is_empty() { 0.0 } else { shared as f32 / local.len() as f32 };
        recommender.rate_peer(affinity, peer);

        recommender.add_candidates(
            universe
                .iter()
                .filter(|song| !local.contains(*song) && filter.contains(song))
                .cloned(),
        );
    }
    report.candidates = recommender.remaining();
    info!("Listener sees {} songs it does not have", report.candidates);

    listener.register_recommender_system(recommender);
    report.affinity_published = listener.store_local_affinity_list();
    listener.start_prefetch_worker();

    for _ in 0..options.plays.min(report.candidates) {
        let Some(entry) = wait_for_song(listener, options.wait) else {
            warn!("Nothing became ready within {:?}", options.wait);
            break;
        };
        listener.update_current_song(&entry.song, &entry.origin);
        report.played.push(entry);
    }
    listener.stop_prefetch_worker();

    Ok(report)
}

fn wait_for_song(node: &Coordinator, wait: Duration) -> Option<PlayListEntry> {
    let deadline = Instant::now() + wait;
    loop {
        if let Some(entry) = node.get_rdy_song() {
            return Some(entry);
        }
        if Instant::now() >= deadline {
            return None;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
}
