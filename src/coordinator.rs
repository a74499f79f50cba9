//! # Coordinator
//!
//! Façade of a node. It owns the local library, the prefetch queue and
//! worker, and the tag consensus loop, and it talks to the rest of the
//! network through an [`Overlay`].
//!
//! ## Failure Model
//!
//! Only construction can fail: a missing music root is rejected before the
//! overlay is touched. After that every network problem is logged and turned
//! into `None`, `false` or a counter in [`PublishReport`].
//!
//! ## Background Work
//!
//! Three loops share the node's [`Scheduler`]: the prefetch worker, tag
//! consensus, and a dispatcher that forwards queue snapshots to the UI.
//! Construction leases a pool thread for each, so several nodes can share
//! one scheduler as long as it has three threads per node. Dropping the
//! coordinator stops all three and gives the threads back.

use crate::affinity::{encode_entries, AffinityRankingStore};
use crate::config::NodeConfig;
use crate::fetcher::{OverlaySongFetcher, SongFetcher};
use crate::filter::CatalogFilter;
use crate::library::LocalLibrary;
use crate::listener::PeerMessageHandler;
use crate::overlay::{affinity_key, song_list_key, tracker_key, Overlay};
use crate::peer::PeerIdentity;
use crate::queue::PrefetchQueue;
use crate::recommender::RecommenderSystem;
use crate::scheduler::{Lease, Scheduler};
use crate::slot::Slot;
use crate::song::{PlayListEntry, Song};
use crate::tagger::{TagConsensus, VotingMessage};
use crate::ui::{notify, Ui};
use crate::worker::{PrefetchWorker, WorkerState};
use anyhow::{bail, Context, Result};
use log::{debug, error, info, warn};
use path_absolutize::Absolutize;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

/// How long dropping a coordinator waits for the prefetch loop.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Outcome of [`Coordinator::publish_local_music`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PublishReport {
    pub songs: usize,
    pub announced: usize,
    pub failed_announcements: usize,
    pub votes_sent: usize,
    pub vote_failures: usize,
    pub filter_stored: bool,
}

pub struct Coordinator {
    overlay: Arc<dyn Overlay>,
    library: Arc<LocalLibrary>,
    config: NodeConfig,
    queue: Arc<PrefetchQueue>,
    worker: PrefetchWorker,
    tagger: TagConsensus,
    ui: Slot<dyn Ui>,
    recommender: Slot<dyn RecommenderSystem>,
}

impl Coordinator {
    /// Build a node serving the music under `music_root`. Songs it lacks are
    /// downloaded from other peers into `config.cache_dir`.
    ///
    /// # Errors
    ///
    /// Fails if `music_root` does not exist or cannot be indexed, or if
    /// `scheduler` lacks a free thread for each of the node's three loops.
    pub fn new(
        overlay: Arc<dyn Overlay>,
        music_root: &Path,
        config: NodeConfig,
        scheduler: &Scheduler,
    ) -> Result<Self> {
        let library = open_library(music_root, &config)?;
        let fetcher = Arc::new(OverlaySongFetcher::new(
            Arc::clone(&overlay),
            Arc::clone(&library),
            &config.cache_dir,
        ));
        Self::assemble(overlay, library, config, scheduler, fetcher)
    }

    /// Like [`new`](Self::new) with a custom fetcher.
    ///
    /// # Errors
    ///
    /// Same as [`new`](Self::new).
    pub fn with_fetcher(
        overlay: Arc<dyn Overlay>,
        music_root: &Path,
        config: NodeConfig,
        scheduler: &Scheduler,
        fetcher: Arc<dyn SongFetcher>,
    ) -> Result<Self> {
        let library = open_library(music_root, &config)?;
        Self::assemble(overlay, library, config, scheduler, fetcher)
    }

    fn assemble(
        overlay: Arc<dyn Overlay>,
        library: Arc<LocalLibrary>,
        config: NodeConfig,
        scheduler: &Scheduler,
        fetcher: Arc<dyn SongFetcher>,
    ) -> Result<Self> {
        let queue = Arc::new(PrefetchQueue::new(config.download_list_length));
        let ui: Slot<dyn Ui> = Slot::empty();
        let recommender: Slot<dyn RecommenderSystem> = Slot::empty();

        let dispatcher = scheduler.lease("ui dispatcher")?;
        let worker = PrefetchWorker::new(
            scheduler.clone(),
            Arc::clone(&queue),
            fetcher,
            recommender.clone(),
            config.idle_backoff(),
        )?;
        let tagger = TagConsensus::start(scheduler)?;
        spawn_ui_dispatcher(dispatcher, &queue, ui.clone());

        info!(
            "Node {} ready with {} local songs",
            overlay.local_peer(),
            library.len()
        );

        Ok(Self {
            overlay,
            library,
            config,
            queue,
            worker,
            tagger,
            ui,
            recommender,
        })
    }

    #[must_use]
    pub fn local_peer(&self) -> PeerIdentity {
        self.overlay.local_peer()
    }

    #[must_use]
    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    #[must_use]
    pub fn library(&self) -> &Arc<LocalLibrary> {
        &self.library
    }

    #[must_use]
    pub fn tagger(&self) -> &TagConsensus {
        &self.tagger
    }

    /// Announce every local song, vote its tags, then store the catalog
    /// filter. A failure in one step never skips the others.
    ///
    /// If the library cannot be read nothing is published, so the catalog
    /// stored by an earlier call stays in place.
    pub fn publish_local_music(&self) -> PublishReport {
        let mut report = PublishReport::default();
        let songs = match self.library.songs() {
            Ok(songs) => songs,
            Err(e) => {
                error!("Cannot list local songs, skipping publish: {e:#}");
                return report;
            }
        };
        report.songs = songs.len();

        for song in &songs {
            if self.overlay.add_to_tracker(&tracker_key(song.key())) {
                report.announced += 1;
            } else {
                warn!("Tracker announcement failed for {song}");
                report.failed_announcements += 1;
            }

            for vote in VotingMessage::proposals_for(song) {
                match self.overlay.lookup_and_send_message(&vote.term, &vote) {
                    Ok(()) => report.votes_sent += 1,
                    Err(e) => {
                        warn!("Vote on `{}' for {song} not delivered: {e:#}", vote.term);
                        report.vote_failures += 1;
                    }
                }
            }
        }

        let filter = CatalogFilter::from_songs(
            &songs,
            self.config.filter_expected_items.max(songs.len()),
            self.config.filter_fp_rate,
        );
        match self.overlay.put(&song_list_key(&self.local_peer()), filter.to_bytes()) {
            Ok(()) => report.filter_stored = true,
            Err(e) => error!("Failed to publish song list: {e:#}"),
        }

        info!(
            "Published {} songs: {} announced, {} votes sent, {} votes lost",
            report.songs, report.announced, report.votes_sent, report.vote_failures
        );
        report
    }

    /// Catalog filter `peer` published, or `None` on any failure.
    #[must_use]
    pub fn fetch_remote_song_list(&self, peer: &PeerIdentity) -> Option<CatalogFilter> {
        let bytes = self.fetch_published(&song_list_key(peer), peer, "song list")?;
        CatalogFilter::from_bytes(&bytes)
            .map_err(|e| warn!("Song list of {peer} is unreadable: {e:#}"))
            .ok()
    }

    /// Affinity ranking `peer` published, or `None` on any failure.
    #[must_use]
    pub fn fetch_remote_affinity_list(&self, peer: &PeerIdentity) -> Option<AffinityRankingStore> {
        let bytes = self.fetch_published(&affinity_key(peer), peer, "affinity list")?;
        AffinityRankingStore::from_json(&bytes)
            .map_err(|e| warn!("Affinity list of {peer} is unreadable: {e:#}"))
            .ok()
    }

    fn fetch_published(&self, key: &str, peer: &PeerIdentity, what: &str) -> Option<Vec<u8>> {
        match self.overlay.get(key) {
            Ok(Some(bytes)) => Some(bytes),
            Ok(None) => {
                debug!("{peer} has not published a {what}");
                None
            }
            Err(e) => {
                warn!("Failed to fetch {what} of {peer}: {e:#}");
                None
            }
        }
    }

    /// Publish the recommender's ranking. `false` without a recommender or
    /// when the DHT refuses the value.
    pub fn store_local_affinity_list(&self) -> bool {
        let Some(recommender) = self.recommender.get() else {
            debug!("No recommender registered, nothing to publish");
            return false;
        };

        let bytes = match encode_entries(&recommender.affinity_list()) {
            Ok(bytes) => bytes,
            Err(e) => {
                error!("Cannot encode affinity list: {e:#}");
                return false;
            }
        };

        match self.overlay.put(&affinity_key(&self.local_peer()), bytes) {
            Ok(()) => true,
            Err(e) => {
                warn!("Failed to publish affinity list: {e:#}");
                false
            }
        }
    }

    /// Start prefetching, or resume after [`stop_prefetch_worker`](Self::stop_prefetch_worker).
    pub fn start_prefetch_worker(&self) {
        self.worker.start();
    }

    /// Pause prefetching after the current fetch.
    pub fn stop_prefetch_worker(&self) {
        self.worker.pause();
    }

    #[must_use]
    pub fn prefetch_state(&self) -> WorkerState {
        self.worker.state()
    }

    #[must_use]
    pub fn prefetch_worker(&self) -> &PrefetchWorker {
        &self.worker
    }

    /// Next ready song, if any.
    #[must_use]
    pub fn get_rdy_song(&self) -> Option<PlayListEntry> {
        self.queue.poll()
    }

    /// Queue `entry` without waiting. `false` if the queue is full or closed.
    pub fn add_song_to_play_list(&self, entry: PlayListEntry) -> bool {
        match self.queue.try_offer(entry) {
            Ok(()) => true,
            Err(rejected) => {
                debug!("Play list refused entry: {rejected:?}");
                false
            }
        }
    }

    pub fn clear_rdy_songs(&self) {
        self.queue.clear();
    }

    /// Songs ready to play, head first.
    #[must_use]
    pub fn rdy_songs(&self) -> Vec<PlayListEntry> {
        self.queue.snapshot()
    }

    pub fn register_ui(&self, ui: Arc<dyn Ui>) {
        self.ui.set(ui);
    }

    pub fn register_recommender_system(&self, recommender: Arc<dyn RecommenderSystem>) {
        self.recommender.set(recommender);
    }

    /// Tell the UI what is playing. No-op without a UI.
    pub fn update_current_song(&self, song: &Song, origin: &str) {
        if let Some(ui) = self.ui.get() {
            notify("update_current_song", || ui.update_current_song(song, origin));
        }
    }

    /// Answer song requests and accept votes from other peers.
    pub fn register_message_listener(&self) {
        let handler = PeerMessageHandler::new(Arc::clone(&self.library), self.tagger.sender());
        self.overlay.set_message_listener(Arc::new(handler));
        debug!("Message listener registered for {}", self.local_peer());
    }

    /// The local catalog.
    #[must_use]
    pub fn fetch_local_song_list(&self) -> HashSet<Song> {
        self.library.song_set().unwrap_or_else(|e| {
            error!("Cannot list local songs: {e:#}");
            HashSet::new()
        })
    }
}

impl Drop for Coordinator {
    fn drop(&mut self) {
        self.queue.close();
        self.worker.shutdown(SHUTDOWN_GRACE);
        self.tagger.stop();
        debug!("Node {} shut down", self.overlay.local_peer());
    }
}

fn open_library(music_root: &Path, config: &NodeConfig) -> Result<Arc<LocalLibrary>> {
    let root: PathBuf = music_root
        .absolutize()
        .with_context(|| format!("Invalid music root: {}", music_root.display()))?
        .into_owned();
    if !root.is_dir() {
        bail!("Music root does not exist: {}", root.display());
    }

    let library = LocalLibrary::open(&root, config.library_db.as_deref())?;
    Ok(Arc::new(library))
}

fn spawn_ui_dispatcher(lease: Lease, queue: &PrefetchQueue, ui: Slot<dyn Ui>) {
    let snapshots = queue.subscribe();
    lease.spawn(move || {
        for snapshot in snapshots {
            if let Some(ui) = ui.get() {
                notify("update_play_list", || ui.update_play_list(&snapshot));
            }
        }
        debug!("UI dispatcher stopped");
    });
}
