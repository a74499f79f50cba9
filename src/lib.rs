//! Peer-to-peer music sharing and recommendation node.
//!
//! Each node publishes what it owns to a DHT-style overlay, learns which
//! peers have similar taste, and prefetches songs a recommender suggests so
//! they are ready before playback asks for them.
//!
//! Core modules:
//! - [`filter`] - Counting bloom filter summarizing a peer's catalog
//! - [`affinity`] - Peers ranked by taste similarity
//! - [`queue`] - Bounded queue of songs ready to play
//! - [`worker`] - Background prefetch loop
//! - [`tagger`] - Crowd-sourced genre/artist tag votes
//! - [`coordinator`] - Façade wiring a node together
//!
//! ### Supporting Modules
//!
//! - [`key`], [`song`], [`peer`] - Identifiers and the song model
//! - [`library`] - Local music index (tags, SQLite)
//! - [`overlay`] - Network interface and an in-process implementation
//! - [`fetcher`], [`listener`] - Moving songs between peers
//! - [`recommender`], [`ui`] - Pluggable collaborators
//! - [`scheduler`], [`slot`] - Background threads and late-bound handles
//! - [`config`] - Configuration and data directory management
//! - [`simulation`] - Several nodes in one process
//! - [`cli`], [`completion`] - Command-line interface
//!
//! ## Quick Start Example
//!
//! ```no_run
//! use songmesh::config::NodeConfig;
//! use songmesh::coordinator::Coordinator;
//! use songmesh::overlay::memory::MemoryNetwork;
//! use songmesh::recommender::ShuffleRecommender;
//! use songmesh::scheduler::Scheduler;
//! use std::path::Path;
//! use std::sync::Arc;
//!
//! let network = MemoryNetwork::new();
//! let config = NodeConfig::default();
//! let scheduler = Scheduler::new(config.scheduler_threads)?;
//!
//! let node = Coordinator::new(Arc::new(network.join("me")), Path::new("/music"), config, &scheduler)?;
//! node.register_message_listener();
//! let report = node.publish_local_music();
//! println!("Announced {} of {} songs", report.announced, report.songs);
//!
//! node.register_recommender_system(Arc::new(ShuffleRecommender::new()));
//! node.start_prefetch_worker();
//! if let Some(entry) = node.get_rdy_song() {
//!     node.update_current_song(&entry.song, &entry.origin);
//! }
//! # Ok::<(), anyhow::Error>(())
//! ```

pub mod affinity;
pub mod cli;
pub mod completion;
pub mod config;
pub mod coordinator;
pub mod fetcher;
pub mod filter;
pub mod key;
pub mod library;
pub mod listener;
pub mod overlay;
pub mod peer;
pub mod queue;
pub mod recommender;
pub mod scheduler;
pub mod simulation;
pub mod slot;
pub mod song;
pub mod tagger;
pub mod ui;
pub mod worker;
