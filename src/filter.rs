//! # Catalog Filter
//!
//! A counting bloom filter describing a peer's song catalog. Peers publish it
//! instead of their full song list: the encoding has a fixed size no matter
//! how many songs it holds, filters from several publish cycles can be merged,
//! and songs can be removed again.
//!
//! ## Guarantees
//!
//! - `contains` never returns `false` for a song that was added and not
//!   removed (no false negatives).
//! - It may return `true` for a song that was never added. The rate depends
//!   on the number of counters `m`, hash functions `k` and the load.
//! - Counters saturate at 255. A saturated counter is never decremented
//!   again, since its true count is unknown.
//!
//! ## Wire Format
//!
//! ```text
//! "SMCF" | version: u8 | k: u8 | m: u32 BE | items: u32 BE | m counter bytes
//! ```

use crate::key::SongKey;
use crate::song::Song;
use anyhow::{bail, ensure, Result};
use sha2::{Digest, Sha256};
use std::f64::consts::LN_2;

const MAGIC: &[u8; 4] = b"SMCF";
const VERSION: u8 = 1;
const HEADER_LEN: usize = 4 + 1 + 1 + 4 + 4;

/// Counter value that is treated as "unknown, at least this many".
const SATURATED: u8 = u8::MAX;

/// Default counter count, sized for roughly 2k songs at ~1% false positives.
pub const DEFAULT_COUNTERS: usize = 19_171;
/// Default number of hash functions.
pub const DEFAULT_HASHES: u8 = 7;

/// Counting bloom filter over songs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CatalogFilter {
    counters: Vec<u8>,
    hashes: u8,
    /// Approximate: adds minus removes.
    items: u32,
}

impl Default for CatalogFilter {
    fn default() -> Self {
        Self::new(DEFAULT_COUNTERS, DEFAULT_HASHES)
    }
}

impl CatalogFilter {
    /// Filter with `counters` slots and `hashes` hash functions.
    ///
    /// Both are clamped to at least one.
    #[must_use]
    pub fn new(counters: usize, hashes: u8) -> Self {
        Self {
            counters: vec![0; counters.max(1)],
            hashes: hashes.max(1),
            items: 0,
        }
    }

    /// Filter sized for `expected_items` at false-positive rate `fp_rate`.
    ///
    /// ```
    /// use songmesh::filter::CatalogFilter;
    ///
    /// let filter = CatalogFilter::with_rate(1000, 0.01);
    /// assert!(filter.counters() > 9000);
    /// assert_eq!(filter.hashes(), 7);
    /// ```
    #[must_use]
    pub fn with_rate(expected_items: usize, fp_rate: f64) -> Self {
        let n = expected_items.max(1) as f64;
        let p = fp_rate.clamp(1e-9, 0.5);

        let m = (-n * p.ln() / (LN_2 * LN_2)).ceil();
        let k = (m / n * LN_2).round().clamp(1.0, f64::from(u8::MAX));

        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        Self::new(m as usize, k as u8)
    }

    /// Build a filter from a whole catalog.
    pub fn from_songs<'a>(songs: impl IntoIterator<Item = &'a Song>, expected_items: usize, fp_rate: f64) -> Self {
        let mut filter = Self::with_rate(expected_items, fp_rate);
        for song in songs {
            filter.add(song);
        }
        filter
    }

    pub fn add(&mut self, song: &Song) {
        self.add_key(song.key());
    }

    pub fn add_key(&mut self, key: &SongKey) {
        for index in self.indexes(key) {
            let counter = &mut self.counters[index];
            *counter = counter.saturating_add(1);
        }
        self.items = self.items.saturating_add(1);
    }

    /// Decrement the song's counters, clamped at zero.
    ///
    /// Removing a song that was never added is allowed but lowers accuracy
    /// for songs sharing those counters.
    pub fn remove(&mut self, song: &Song) {
        self.remove_key(song.key());
    }

    pub fn remove_key(&mut self, key: &SongKey) {
        for index in self.indexes(key) {
            let counter = &mut self.counters[index];
            if *counter != SATURATED && *counter > 0 {
                *counter -= 1;
            }
        }
        self.items = self.items.saturating_sub(1);
    }

    #[must_use]
    pub fn contains(&self, song: &Song) -> bool {
        self.contains_key(song.key())
    }

    #[must_use]
    pub fn contains_key(&self, key: &SongKey) -> bool {
        self.indexes(key).all(|index| self.counters[index] > 0)
    }

    /// Add `other`'s counters into this filter.
    ///
    /// # Errors
    ///
    /// Fails if the filters do not share `m` and `k`.
    pub fn merge(&mut self, other: &Self) -> Result<()> {
        ensure!(
            self.counters.len() == other.counters.len() && self.hashes == other.hashes,
            "Cannot merge filters of different shape (m={}, k={} vs m={}, k={})",
            self.counters.len(),
            self.hashes,
            other.counters.len(),
            other.hashes
        );

        for (mine, theirs) in self.counters.iter_mut().zip(&other.counters) {
            *mine = mine.saturating_add(*theirs);
        }
        self.items = self.items.saturating_add(other.items);
        Ok(())
    }

    /// Number of counters (`m`).
    #[must_use]
    pub fn counters(&self) -> usize {
        self.counters.len()
    }

    /// Number of hash functions (`k`).
    #[must_use]
    pub const fn hashes(&self) -> u8 {
        self.hashes
    }

    /// Approximate number of songs in the filter.
    #[must_use]
    pub const fn len(&self) -> u32 {
        self.items
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.counters.iter().all(|&c| c == 0)
    }

    /// Counter value at `index`, mostly for inspection in tests and tools.
    #[must_use]
    pub fn counter(&self, index: usize) -> Option<u8> {
        self.counters.get(index).copied()
    }

    /// Estimated false-positive rate at the current load.
    #[must_use]
    pub fn false_positive_rate(&self) -> f64 {
        let m = self.counters.len() as f64;
        let k = f64::from(self.hashes);
        let n = f64::from(self.items);
        (1.0 - (-k * n / m).exp()).powf(k)
    }

    /// Encode into the fixed-size wire format.
    #[must_use]
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(HEADER_LEN + self.counters.len());
        out.extend_from_slice(MAGIC);
        out.push(VERSION);
        out.push(self.hashes);
        #[allow(clippy::cast_possible_truncation)]
        out.extend_from_slice(&(self.counters.len() as u32).to_be_bytes());
        out.extend_from_slice(&self.items.to_be_bytes());
        out.extend_from_slice(&self.counters);
        out
    }

    /// Decode the wire format produced by [`CatalogFilter::to_bytes`].
    ///
    /// # Errors
    ///
    /// Fails on a wrong magic, an unknown version, zero `m` or `k`, or a
    /// payload whose length does not match `m`.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        ensure!(
            bytes.len() >= HEADER_LEN,
            "Catalog filter too short: {} bytes",
            bytes.len()
        );
        if &bytes[..4] != MAGIC {
            bail!("Not a catalog filter (bad magic)");
        }
        if bytes[4] != VERSION {
            bail!("Unsupported catalog filter version {}", bytes[4]);
        }

        let hashes = bytes[5];
        let m = u32::from_be_bytes([bytes[6], bytes[7], bytes[8], bytes[9]]) as usize;
        let items = u32::from_be_bytes([bytes[10], bytes[11], bytes[12], bytes[13]]);

        ensure!(hashes > 0 && m > 0, "Catalog filter has zero counters or hashes");
        ensure!(
            bytes.len() - HEADER_LEN == m,
            "Catalog filter declares {m} counters but carries {}",
            bytes.len() - HEADER_LEN
        );

        Ok(Self {
            counters: bytes[HEADER_LEN..].to_vec(),
            hashes,
            items,
        })
    }

    /// Counter indexes for `key`, by double hashing over SHA-256 of the key.
    fn indexes(&self, key: &SongKey) -> impl Iterator<Item = usize> {
        let digest = Sha256::digest(key.as_bytes());
        let mut h1_bytes = [0u8; 8];
        let mut h2_bytes = [0u8; 8];
        h1_bytes.copy_from_slice(&digest[..8]);
        h2_bytes.copy_from_slice(&digest[8..16]);

        let h1 = u64::from_le_bytes(h1_bytes);
        // Odd step, so the probe sequence does not collapse onto one slot.
        let h2 = u64::from_le_bytes(h2_bytes) | 1;
        let m = self.counters.len() as u64;

        #[allow(clippy::cast_possible_truncation)]
        (0..u64::from(self.hashes)).map(move |i| (h1.wrapping_add(i.wrapping_mul(h2)) % m) as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn catalog(n: usize) -> Vec<Song> {
        (0..n)
            .map(|i| Song::new(format!("Title {i}"), format!("Artist {}", i % 17), "Genre"))
            .collect()
    }

    #[test]
    fn test_no_false_negatives() {
        let songs = catalog(500);
        let filter = CatalogFilter::from_songs(&songs, 500, 0.01);

        for song in &songs {
            assert!(filter.contains(song), "Added song must always be found: {song}");
        }
    }

    #[test]
    fn test_add_then_remove_restores_counters() {
        let mut filter = CatalogFilter::from_songs(&catalog(50), 100, 0.01);
        let before = filter.clone();
        let extra = Song::new("Extra", "Someone", "Pop");

        filter.add(&extra);
        filter.add(&extra);
        assert!(filter.contains(&extra));

        filter.remove(&extra);
        filter.remove(&extra);
        assert_eq!(filter, before);
    }

    #[test]
    fn test_remove_never_goes_below_zero() {
        let mut filter = CatalogFilter::new(64, 3);
        let song = Song::new("Ghost", "Nobody", "None");
        filter.remove(&song);
        assert!(filter.is_empty());
        assert_eq!(filter.len(), 0);
    }

    #[test]
    fn test_counters_saturate() {
        let mut filter = CatalogFilter::new(16, 2);
        let song = Song::new("Loop", "Repeat", "Drone");
        for _ in 0..300 {
            filter.add(&song);
        }
        assert!((0..16).filter_map(|i| filter.counter(i)).any(|c| c == SATURATED));

        // Saturated counters stick, so the song stays visible.
        for _ in 0..300 {
            filter.remove(&song);
        }
        assert!(filter.contains(&song));
    }

    #[test]
    fn test_false_positive_rate_is_reasonable() {
        let songs = catalog(1000);
        let filter = CatalogFilter::from_songs(&songs, 1000, 0.01);

        let strangers = (0..5000).map(|i| Song::new(format!("Unknown {i}"), "Stranger", "x"));
        let hits = strangers.filter(|s| filter.contains(s)).count();
        assert!(hits < 250, "Too many false positives: {hits} of 5000");
        assert!(filter.false_positive_rate() < 0.05);
    }

    #[test]
    fn test_wire_format_round_trip() {
        let filter = CatalogFilter::from_songs(&catalog(20), 20, 0.01);
        let bytes = filter.to_bytes();
        assert_eq!(bytes.len(), HEADER_LEN + filter.counters());

        let decoded = CatalogFilter::from_bytes(&bytes).expect("valid encoding");
        assert_eq!(decoded, filter);
        assert_eq!(decoded.len(), 20);
    }

    #[test]
    fn test_encoding_size_is_fixed() {
        let empty = CatalogFilter::with_rate(100, 0.01);
        let full = CatalogFilter::from_songs(&catalog(100), 100, 0.01);
        assert_eq!(empty.to_bytes().len(), full.to_bytes().len());
    }

    #[test]
    fn test_rejects_corrupt_encoding() {
        let mut bytes = CatalogFilter::new(32, 3).to_bytes();
        assert!(CatalogFilter::from_bytes(&bytes[..10]).is_err());

        bytes.pop();
        assert!(CatalogFilter::from_bytes(&bytes).is_err());

        let mut bad_magic = CatalogFilter::new(32, 3).to_bytes();
        bad_magic[0] = b'X';
        assert!(CatalogFilter::from_bytes(&bad_magic).is_err());
    }

    #[test]
    fn test_merge() {
        let songs = catalog(40);
        let (left, right) = songs.split_at(20);
        let mut a = CatalogFilter::from_songs(left, 40, 0.01);
        let b = CatalogFilter::from_songs(right, 40, 0.01);

        a.merge(&b).expect("same shape");
        assert!(songs.iter().all(|s| a.contains(s)));
        assert_eq!(a.len(), 40);

        let other_shape = CatalogFilter::new(10, 2);
        assert!(a.merge(&other_shape).is_err());
    }
}
