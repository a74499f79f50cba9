//! # Local Library
//!
//! Index of the songs under the music root. The directory tree is scanned
//! recursively, tags are read in parallel, and the result lands in an SQLite
//! table keyed by content key, so two files carrying the same song count once.
//!
//! ## Metadata
//!
//! Title, artist and genre come from the file's tags. Missing fields fall back
//! to the layout `<genre>/<artist>/<title>.<ext>` relative to the root.

use crate::filter::CatalogFilter;
use crate::key::SongKey;
use crate::song::Song;
use anyhow::{bail, Context, Result};
use lofty::file::TaggedFileExt;
use lofty::prelude::Accessor;
use log::{debug, info, trace, warn};
use rayon::prelude::*;
use rusqlite::{Connection, OptionalExtension};
use std::borrow::Cow;
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};
use walkdir::WalkDir;

/// Supported formats: FLAC, MP3, OGG, M4A, WAV.
pub const SUPPORTED_EXTENSIONS: [&str; 5] = ["flac", "mp3", "ogg", "m4a", "wav"];

const UNKNOWN_ARTIST: &str = "Unknown Artist";
const UNKNOWN_GENRE: &str = "Unknown";

/// How many directory levels below the root the scanner looks at.
const MAX_SCAN_DEPTH: usize = 16;

/// The local catalog. Safe to share between threads.
#[derive(Debug)]
pub struct LocalLibrary {
    root: PathBuf,
    conn: Mutex<Connection>,
}

impl LocalLibrary {
    /// Open the index (in memory unless `db_path` is given) and scan `root`.
    ///
    /// # Errors
    ///
    /// Fails if `root` is not a directory or the index cannot be created.
    pub fn open(root: &Path, db_path: Option<&Path>) -> Result<Self> {
        if !root.is_dir() {
            bail!("Music library root is not a directory: {}", root.display());
        }

        let conn = match db_path {
            Some(path) => Connection::open(path)
                .with_context(|| format!("Rusqlite DB connection refused. DB location: {path:?}"))?,
            None => Connection::open_in_memory().context("Failed to open in-memory library index")?,
        };

        conn.execute(
            "CREATE TABLE IF NOT EXISTS song (
                key     TEXT PRIMARY KEY,
                title   TEXT NOT NULL,
                artist  TEXT NOT NULL,
                genre   TEXT NOT NULL,
                path    TEXT NOT NULL
            )",
            (),
        )
        .context("Invalid SQL command when CREATEing song TABLE.")?;

        let library = Self {
            root: root.to_path_buf(),
            conn: Mutex::new(conn),
        };
        library.refresh()?;
        Ok(library)
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Rescan the root and replace the index. Returns the number of songs.
    ///
    /// # Errors
    ///
    /// SQL errors only. Unreadable directories are logged and skipped.
    pub fn refresh(&self) -> Result<usize> {
        let files = collect_audio_files(&self.root);
        debug!("Found {} audio files under {}", files.len(), self.root.display());

        let scanned: Vec<(Song, PathBuf)> = files
            .into_par_iter()
            .map(|path| (song_from_file(&self.root, &path), path))
            .collect();

        let mut conn = self.lock();
        let tx = conn.transaction()?;
        tx.execute("DELETE FROM song", ())?;
        {
            let mut stmt = tx.prepare(
                "INSERT OR IGNORE INTO song (key, title, artist, genre, path) VALUES (?1, ?2, ?3, ?4, ?5)",
            )?;
            for (song, path) in &scanned {
                stmt.execute((
                    song.key().to_hex(),
                    song.title(),
                    song.artist(),
                    song.genre(),
                    path.to_string_lossy(),
                ))
                .with_context(|| format!("Invalid SQL statement when INSERTing {song}"))?;
            }
        }
        tx.commit().context("Commiting SQL transaction failed.")?;

        let count: usize = conn.query_row("SELECT COUNT(*) FROM song", [], |row| row.get(0))?;
        info!("Indexed {count} songs from {}", self.root.display());
        Ok(count)
    }

    /// Every song in the library.
    ///
    /// # Errors
    ///
    /// SQL errors only.
    pub fn songs(&self) -> Result<Vec<Song>> {
        let conn = self.lock();
        let mut stmt = conn
            .prepare("SELECT title, artist, genre FROM song ORDER BY artist, title")
            .context("Invalid SQL statement when SELECTing songs.")?;

        let songs = stmt
            .query_map([], |row| {
                Ok(Song::new(
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                ))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("Cannot query songs.")?;
        Ok(songs)
    }

    /// The library as a set.
    ///
    /// # Errors
    ///
    /// SQL errors only.
    pub fn song_set(&self) -> Result<HashSet<Song>> {
        Ok(self.songs()?.into_iter().collect())
    }

    /// File backing `key`, if the song is local.
    ///
    /// # Errors
    ///
    /// SQL errors only.
    pub fn path_of(&self, key: &SongKey) -> Result<Option<PathBuf>> {
        let path: Option<String> = self
            .lock()
            .query_row("SELECT path FROM song WHERE key = ?1", [key.to_hex()], |row| row.get(0))
            .optional()
            .context("Failed to look up song path")?;
        Ok(path.map(PathBuf::from))
    }

    /// Audio bytes of `key`, for serving other peers.
    ///
    /// # Errors
    ///
    /// SQL errors or an unreadable file.
    pub fn read_song_bytes(&self, key: &SongKey) -> Result<Option<Vec<u8>>> {
        match self.path_of(key)? {
            Some(path) => {
                let bytes = fs::read(&path).with_context(|| format!("Failed to read {}", path.display()))?;
                Ok(Some(bytes))
            }
            None => Ok(None),
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.lock()
            .query_row("SELECT COUNT(*) FROM song", [], |row| row.get(0))
            .unwrap_or(0)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Counting filter of the whole library. Sized for at least
    /// `expected_items`, more if the library is already bigger.
    ///
    /// # Errors
    ///
    /// SQL errors only.
    pub fn to_filter(&self, expected_items: usize, fp_rate: f64) -> Result<CatalogFilter> {
        let songs = self.songs()?;
        Ok(CatalogFilter::from_songs(&songs, expected_items.max(songs.len()), fp_rate))
    }

    fn lock(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Whether `path` has one of the supported extensions.
#[must_use]
pub fn is_audio_file(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| SUPPORTED_EXTENSIONS.contains(&ext.to_lowercase().as_str()))
}

fn collect_audio_files(root: &Path) -> Vec<PathBuf> {
    let mut files: Vec<PathBuf> = WalkDir::new(root)
        .max_depth(MAX_SCAN_DEPTH)
        .into_iter()
        .filter_map(|entry| entry.map_err(|e| warn!("Skipping unreadable entry: {e}")).ok())
        .filter(|entry| entry.file_type().is_file() && is_audio_file(entry.path()))
        .map(walkdir::DirEntry::into_path)
        .collect();

    files.sort();
    files
}

/// Build a song from tags, falling back to the directory layout.
fn song_from_file(root: &Path, path: &Path) -> Song {
    let tags = read_tags(path);
    let (fallback_title, fallback_artist, fallback_genre) = metadata_from_path(root, path);

    let title = tags.title.unwrap_or(fallback_title);
    let artist = tags.artist.unwrap_or(fallback_artist);
    let genre = tags.genre.unwrap_or(fallback_genre);
    trace!("Scanned {} as {artist} - {title} [{genre}]", path.display());

    Song::new(title, artist, genre)
}

#[derive(Debug, Default)]
struct Tags {
    title: Option<String>,
    artist: Option<String>,
    genre: Option<String>,
}

fn read_tags(path: &Path) -> Tags {
    let Ok(tagged_file) = lofty::read_from_path(path) else {
        trace!("No readable tags in {}", path.display());
        return Tags::default();
    };
    let Some(tag) = tagged_file.primary_tag().or_else(|| tagged_file.first_tag()) else {
        return Tags::default();
    };

    Tags {
        title: non_empty(tag.title()),
        artist: non_empty(tag.artist()),
        genre: non_empty(tag.genre()),
    }
}

fn non_empty(value: Option<Cow<'_, str>>) -> Option<String> {
    value.map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}

/// `(title, artist, genre)` from `<genre>/<artist>/<title>.<ext>`.
fn metadata_from_path(root: &Path, path: &Path) -> (String, String, String) {
    let title = path
        .file_stem()
        .map_or_else(|| "Untitled".to_string(), |stem| stem.to_string_lossy().into_owned());

    let relative = path.strip_prefix(root).unwrap_or(path);
    let dirs: Vec<String> = relative
        .parent()
        .map(|parent| {
            parent
                .components()
                .map(|c| c.as_os_str().to_string_lossy().into_owned())
                .collect()
        })
        .unwrap_or_default();

    let artist = dirs.last().cloned().unwrap_or_else(|| UNKNOWN_ARTIST.to_string());
    let genre = if dirs.len() >= 2 {
        dirs[dirs.len() - 2].clone()
    } else {
        UNKNOWN_GENRE.to_string()
    };

    (title, artist, genre)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    /// Helper: lay out fake audio files under a temporary root.
    fn create_test_library(files: &[&str]) -> TempDir {
        let temp_dir = TempDir::new().expect("Failed to create temp directory");
        for file in files {
            let path = temp_dir.path().join(file);
            fs::create_dir_all(path.parent().unwrap()).unwrap();
            fs::write(&path, format!("audio of {file}")).unwrap();
        }
        temp_dir
    }

    #[test]
    fn test_scan_uses_path_layout() {
        let dir = create_test_library(&[
            "Jazz/Miles Davis/So What.mp3",
            "Rock/Queen/Bohemian Rhapsody.flac",
            "notes.txt",
        ]);
        let library = LocalLibrary::open(dir.path(), None).unwrap();

        assert_eq!(library.len(), 2);
        let songs = library.songs().unwrap();
        let so_what = songs.iter().find(|s| s.title() == "So What").unwrap();
        assert_eq!(so_what.artist(), "Miles Davis");
        assert_eq!(so_what.genre(), "Jazz");
    }

    #[test]
    fn test_duplicate_keys_collapse() {
        let dir = create_test_library(&["Jazz/Miles Davis/So What.mp3", "Modal/Miles Davis/So What.flac"]);
        let library = LocalLibrary::open(dir.path(), None).unwrap();
        assert_eq!(library.len(), 1);
    }

    #[test]
    fn test_flat_layout_fallbacks() {
        let dir = create_test_library(&["Loose Track.ogg"]);
        let library = LocalLibrary::open(dir.path(), None).unwrap();
        let song = &library.songs().unwrap()[0];
        assert_eq!(song.artist(), UNKNOWN_ARTIST);
        assert_eq!(song.genre(), UNKNOWN_GENRE);
    }

    #[test]
    fn test_path_and_bytes_lookup() {
        let dir = create_test_library(&["Pop/ABBA/Waterloo.mp3"]);
        let library = LocalLibrary::open(dir.path(), None).unwrap();
        let song = Song::new("Waterloo", "ABBA", "Pop");

        let path = library.path_of(song.key()).unwrap().unwrap();
        assert!(path.ends_with("Waterloo.mp3"));
        let bytes = library.read_song_bytes(song.key()).unwrap().unwrap();
        assert_eq!(bytes, b"audio of Pop/ABBA/Waterloo.mp3".to_vec());

        let stranger = Song::new("Nope", "Nobody", "None");
        assert!(library.path_of(stranger.key()).unwrap().is_none());
    }

    #[test]
    fn test_refresh_picks_up_changes() {
        let dir = create_test_library(&["Pop/ABBA/Waterloo.mp3"]);
        let library = LocalLibrary::open(dir.path(), None).unwrap();

        let new_file = dir.path().join("Pop/ABBA/SOS.mp3");
        fs::write(&new_file, "sos").unwrap();
        assert_eq!(library.refresh().unwrap(), 2);

        fs::remove_file(new_file).unwrap();
        assert_eq!(library.refresh().unwrap(), 1);
    }

    #[test]
    fn test_filter_covers_library() {
        let dir = create_test_library(&["A/B/One.mp3", "A/B/Two.mp3", "C/D/Three.wav"]);
        let library = LocalLibrary::open(dir.path(), None).unwrap();
        let filter = library.to_filter(100, 0.01).unwrap();

        for song in library.songs().unwrap() {
            assert!(filter.contains(&song));
        }
    }

    #[test]
    fn test_on_disk_index() {
        let dir = create_test_library(&["A/B/One.mp3"]);
        let db_dir = TempDir::new().unwrap();
        let db_path = db_dir.path().join("library.db3");

        let library = LocalLibrary::open(dir.path(), Some(&db_path)).unwrap();
        assert_eq!(library.len(), 1);
        assert!(db_path.exists());
    }

    #[test]
    fn test_scan_stops_at_max_depth() {
        let nested = |levels: usize| (0..levels).map(|i| format!("d{i}/")).collect::<String>();
        let too_deep = format!("{}Buried.mp3", nested(MAX_SCAN_DEPTH));
        let deepest = format!("{}Reachable.mp3", nested(MAX_SCAN_DEPTH - 1));
        let dir = create_test_library(&[too_deep.as_str(), deepest.as_str()]);

        let library = LocalLibrary::open(dir.path(), None).unwrap();
        let titles: Vec<String> = library.songs().unwrap().iter().map(|s| s.title().to_string()).collect();
        assert_eq!(titles, ["Reachable"]);
    }

    #[test]
    fn test_missing_root_fails() {
        assert!(LocalLibrary::open(Path::new("/definitely/not/here"), None).is_err());
    }

    #[test]
    fn test_is_audio_file() {
        assert!(is_audio_file(Path::new("x/y.MP3")));
        assert!(is_audio_file(Path::new("y.flac")));
        assert!(!is_audio_file(Path::new("y.txt")));
        assert!(!is_audio_file(Path::new("noext")));
    }
}
