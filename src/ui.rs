//! Observer interface for whatever presents the node to a user.

use crate::song::{PlayListEntry, Song};
use std::panic::{catch_unwind, AssertUnwindSafe};

/// Fire-and-forget presentation hooks. Implementations must not block.
pub trait Ui: Send + Sync {
    fn update_current_song(&self, song: &Song, origin: &str);

    fn update_play_list(&self, entries: &[PlayListEntry]);
}

/// Run a UI callback, containing any panic so it never reaches the caller.
pub(crate) fn notify(what: &str, callback: impl FnOnce()) {
    if catch_unwind(AssertUnwindSafe(callback)).is_err() {
        log::error!("UI callback `{what}' panicked, ignoring");
    }
}

/// UI that writes updates to the log, used by the command line.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogUi;

impl Ui for LogUi {
    fn update_current_song(&self, song: &Song, origin: &str) {
        log::info!("Now playing: {song} (from {origin})");
    }

    fn update_play_list(&self, entries: &[PlayListEntry]) {
        log::info!("Upcoming: {} song(s)", entries.len());
        for (i, entry) in entries.iter().enumerate() {
            log::debug!("  {}. {entry}", i + 1);
        }
    }
}
