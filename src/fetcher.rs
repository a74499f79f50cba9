//! Turning a recommended song into a playable file.

use crate::library::LocalLibrary;
use crate::overlay::{tracker_key, Overlay};
use crate::song::{PlayListEntry, Song, LOCAL_ORIGIN};
use anyhow::{bail, Context, Result};
use log::{debug, warn};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Resolves a song to a local file, downloading it if needed.
pub trait SongFetcher: Send + Sync {
    /// # Errors
    ///
    /// The song is not local and no peer could deliver it.
    fn fetch(&self, song: &Song) -> Result<PlayListEntry>;
}

/// Fetcher backed by the local library and the overlay tracker.
///
/// Local songs are served from their own file. Anything else is requested
/// from the peers the tracker lists for the song, one after another, and the
/// first answer is written to the cache directory.
///
/// Cached files are named by content key and overwritten when the same song
/// is fetched again, but nothing deletes them once they were played. The
/// cache directory grows with every distinct song fetched until it is
/// cleaned up from outside.
pub struct OverlaySongFetcher {
    overlay: Arc<dyn Overlay>,
    library: Arc<LocalLibrary>,
    cache_dir: PathBuf,
}

impl OverlaySongFetcher {
    #[must_use]
    pub fn new(overlay: Arc<dyn Overlay>, library: Arc<LocalLibrary>, cache_dir: &Path) -> Self {
        Self {
            overlay,
            library,
            cache_dir: cache_dir.to_path_buf(),
        }
    }

    fn cache_path(&self, song: &Song) -> PathBuf {
        self.cache_dir.join(song.key().to_hex())
    }
}

impl SongFetcher for OverlaySongFetcher {
    fn fetch(&self, song: &Song) -> Result<PlayListEntry> {
        if let Some(path) = self.library.path_of(song.key())? {
            debug!("{song} is local: {}", path.display());
            return Ok(PlayListEntry::new(song.clone(), path, LOCAL_ORIGIN));
        }

        let me = self.overlay.local_peer();
        let holders = self
            .overlay
            .tracker_peers(&tracker_key(song.key()))
            .with_context(|| format!("Tracker lookup failed for {song}"))?;

        for peer in holders.into_iter().filter(|peer| *peer != me) {
            match self.overlay.request_song(&peer, song.key()) {
                Ok(bytes) => {
                    fs::create_dir_all(&self.cache_dir).with_context(|| {
                        format!("Failed to create cache directory {}", self.cache_dir.display())
                    })?;
                    let path = self.cache_path(song);
                    fs::write(&path, &bytes)
                        .with_context(|| format!("Failed to cache {song} at {}", path.display()))?;
                    debug!("Fetched {song} ({} bytes) from {peer}", bytes.len());
                    return Ok(PlayListEntry::new(song.clone(), path, peer.id.to_hex()));
                }
                Err(e) => warn!("Peer {peer} could not deliver {song}: {e:#}"),
            }
        }

        bail!("No peer could deliver {song}")
    }
}
