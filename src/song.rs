use crate::key::SongKey;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::path::PathBuf;

/// Separator between metadata fields when deriving a content key.
/// Unit separator, so "a b" + "c" never collides with "a" + "b c".
const KEY_FIELD_SEPARATOR: char = '\u{1f}';

/// A song as it is shared between peers.
///
/// Identity is the content key alone: two songs with the same key are the
/// same song, whatever their genre says. That keeps catalogs proper sets.
/// The key is serialized for readers but recomputed on deserialization, so a
/// peer cannot attach a song's metadata to another song's key.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(from = "SongFields")]
pub struct Song {
    title: String,
    artist: String,
    genre: String,
    key: SongKey,
}

/// Wire form of a [`Song`]. Any `key` field is ignored.
#[derive(Deserialize)]
struct SongFields {
    title: String,
    artist: String,
    genre: String,
}

impl From<SongFields> for Song {
    fn from(fields: SongFields) -> Self {
        Self::new(fields.title, fields.artist, fields.genre)
    }
}

impl Song {
    #[must_use]
    pub fn new(title: impl Into<String>, artist: impl Into<String>, genre: impl Into<String>) -> Self {
        let title = title.into();
        let artist = artist.into();
        let key = content_key(&artist, &title);
        log::trace!("Derived key `{key}' for `{artist} - {title}'.");

        Self {
            title,
            artist,
            genre: genre.into(),
            key,
        }
    }

    #[must_use]
    pub fn title(&self) -> &str {
        &self.title
    }

    #[must_use]
    pub fn artist(&self) -> &str {
        &self.artist
    }

    #[must_use]
    pub fn genre(&self) -> &str {
        &self.genre
    }

    #[must_use]
    pub const fn key(&self) -> &SongKey {
        &self.key
    }
}

impl PartialEq for Song {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key
    }
}

impl Eq for Song {}

impl Hash for Song {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.key.hash(state);
    }
}

impl fmt::Display for Song {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} - {} [{}]", self.artist, self.title, self.genre)
    }
}

/// Derives the content key from the identifying metadata.
///
/// Case and surrounding whitespace are ignored, so differently tagged copies
/// of the same track end up under one key.
#[must_use]
pub fn content_key(artist: &str, title: &str) -> SongKey {
    let normalized = format!(
        "{}{KEY_FIELD_SEPARATOR}{}",
        artist.trim().to_lowercase(),
        title.trim().to_lowercase()
    );
    SongKey::hash(normalized.as_bytes())
}

/// A song that has been retrieved and is ready to play.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlayListEntry {
    pub song: Song,
    /// Where the audio lives on this machine.
    pub path: PathBuf,
    /// `local` or the id of the peer the audio came from.
    pub origin: String,
}

/// Origin marker for entries served from the local library.
pub const LOCAL_ORIGIN: &str = "local";

impl PlayListEntry {
    #[must_use]
    pub fn new(song: Song, path: PathBuf, origin: impl Into<String>) -> Self {
        Self {
            song,
            path,
            origin: origin.into(),
        }
    }

    #[must_use]
    pub fn is_local(&self) -> bool {
        self.origin == LOCAL_ORIGIN
    }
}

impl fmt::Display for PlayListEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (from {})", self.song, self.origin)
    }
}
