//! # Songmesh
//!
//! Command-line front end of a Songmesh node.
//!
//! ## Usage
//!
//! ```bash
//! # Index a music directory
//! songmesh scan /path/to/music
//!
//! # Run five peers in-process and prefetch between them
//! songmesh simulate /tmp/mesh --peers 5
//!
//! # Shell completions
//! songmesh completion fish > ~/.config/fish/completions/songmesh.fish
//! ```

use anyhow::{Context, Result};
use clap::{CommandFactory, Parser};
use log::{debug, info};
use songmesh::cli::{self, ConfigAction};
use songmesh::completion;
use songmesh::config::{self, NodeConfig};
use songmesh::library::LocalLibrary;
use songmesh::simulation::{self, SimulationOptions};
use std::path::Path;

/// Main entry point.
///
/// Logging is controlled via `RUST_LOG`:
/// - `RUST_LOG=debug songmesh scan ~/Music` - Enable debug logging
/// - `RUST_LOG=songmesh::worker=trace songmesh simulate /tmp/mesh` - Module-specific logging
fn main() -> Result<()> {
    env_logger::init();

    let args = cli::Args::parse();
    let config_path = match args.config {
        Some(path) => path,
        None => config::get_config_path()?,
    };

    match args.command {
        cli::Command::Scan { path, verbose } => {
            let config = NodeConfig::load(&config_path)?;
            scan(&path, &config, verbose)?;
        }
        cli::Command::Simulate { path, peers, songs, plays } => {
            let config = NodeConfig::load(&config_path)?;
            let options = SimulationOptions {
                peers,
                songs_per_peer: songs,
                plays,
                ..SimulationOptions::default()
            };
            simulate(&path, &options, &config)?;
        }
        cli::Command::Config { action } => match action {
            ConfigAction::Show => println!("{}", NodeConfig::load(&config_path)?.to_json()?),
            ConfigAction::Path => println!("{}", config_path.display()),
        },
        cli::Command::Completion { shell } => {
            let mut cmd = cli::Args::command();
            completion::generate_completions(completion::shell_to_completion_shell(shell), &mut cmd);
        }
    }

    Ok(())
}

fn scan(path: &Path, config: &NodeConfig, verbose: bool) -> Result<()> {
    info!("Scanning music library: {}", path.display());
    let library = LocalLibrary::open(path, config.library_db.as_deref())
        .with_context(|| format!("Failed to index {}", path.display()))?;

    let songs = library.songs()?;
    let filter = library.to_filter(config.filter_expected_items, config.filter_fp_rate)?;

    println!("Songs:            {}", songs.len());
    println!("Filter counters:  {}", filter.counters());
    println!("Filter hashes:    {}", filter.hashes());
    println!("Filter size:      {} bytes", filter.to_bytes().len());
    println!("Estimated FP rate: {:.4}%", filter.false_positive_rate() * 100.0);

    if verbose {
        for song in &songs {
            println!("  {song}  {}", song.key());
        }
    }
    Ok(())
}

fn simulate(path: &Path, options: &SimulationOptions, config: &NodeConfig) -> Result<()> {
    debug!("Simulation options: {options:?}");
    let report = simulation::run(path, options, config)?;

    for (i, published) in report.published.iter().enumerate() {
        println!(
            "peer-{i}: {} songs, {} announced, {} votes sent, {} votes lost, filter stored: {}",
            published.songs,
            published.announced,
            published.votes_sent,
            published.vote_failures,
            published.filter_stored
        );
    }
    println!("Song lists read:  {}", report.song_lists_found);
    println!("Candidates:       {}", report.candidates);
    println!("Affinity stored:  {}", report.affinity_published);
    println!("Played:");
    for entry in &report.played {
        println!("  {entry}");
    }
    Ok(())
}
