//! # Command-Line Interface Module
//!
//! This module defines the command-line interface for Songmesh using Clap
//! derive macros. The binary is a thin shell around the library: it can index
//! a music directory, run an in-process network simulation, and show the
//! node configuration.
//!
//! ## Commands
//!
//! - `scan`: Index a music directory and report catalog filter statistics
//! - `simulate`: Run several nodes in one process and prefetch between them
//! - `config`: Show the effective configuration or where it is read from
//! - `completion`: Generate shell completion scripts
//!
//! ## Examples
//!
//! ```bash
//! songmesh scan /home/user/Music
//! songmesh simulate /tmp/mesh --peers 5 --songs 30
//! songmesh config show
//! ```

use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

/// Shell types supported for completion generation
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, ValueEnum, Debug)]
#[allow(clippy::enum_variant_names)]
pub enum Shell {
    /// Bash shell
    Bash,
    /// Zsh shell
    Zsh,
    /// Fish shell
    Fish,
    /// PowerShell
    PowerShell,
    /// Elvish shell
    Elvish,
}

/// Main application arguments structure.
#[derive(Parser)]
#[command(name = "songmesh")]
#[command(about = "Songmesh: peer-to-peer music sharing and recommendation node")]
#[command(version)]
pub struct Args {
    /// Properties file to read instead of the default one
    #[arg(long, global = true, env = "SONGMESH_CONFIG")]
    pub config: Option<PathBuf>,

    /// The subcommand to execute
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Index a music directory
    ///
    /// Scans the directory recursively, reads title, artist and genre from
    /// the tags (falling back to `<genre>/<artist>/<title>.<ext>`), and
    /// prints how large the published catalog filter would be.
    ///
    /// Supported formats: FLAC, MP3, OGG, M4A, WAV
    Scan {
        /// Root of the music collection
        path: PathBuf,

        /// List every indexed song
        #[arg(short, long)]
        verbose: bool,
    },

    /// Simulate a network of nodes in this process
    ///
    /// Every peer gets a scratch library of fake songs under PATH, publishes
    /// it, and the first peer prefetches songs it does not have from the
    /// others.
    Simulate {
        /// Scratch directory for the peers' libraries and caches
        path: PathBuf,

        /// Number of peers
        #[arg(long, default_value = "4")]
        peers: usize,

        /// Songs per peer
        #[arg(long, default_value = "20")]
        songs: usize,

        /// Songs the first peer plays
        #[arg(long, default_value = "5")]
        plays: usize,
    },

    /// Inspect the configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },

    /// Generate shell completions
    ///
    /// Outputs completion script for the specified shell to stdout.
    /// Redirect to appropriate file for your shell.
    Completion {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: Shell,
    },
}

#[derive(Subcommand)]
pub enum ConfigAction {
    /// Print the effective configuration as JSON
    Show,
    /// Print the path of the properties file
    Path,
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_is_consistent() {
        Args::command().debug_assert();
    }

    #[test]
    fn test_parse_simulate() {
        let args = Args::parse_from(["songmesh", "simulate", "/tmp/mesh", "--peers", "3"]);
        match args.command {
            Command::Simulate { path, peers, songs, plays } => {
                assert_eq!(path, PathBuf::from("/tmp/mesh"));
                assert_eq!(peers, 3);
                assert_eq!(songs, 20);
                assert_eq!(plays, 5);
            }
            _ => panic!("expected simulate"),
        }
    }

    #[test]
    fn test_global_config_flag() {
        let args = Args::parse_from(["songmesh", "config", "show", "--config", "/etc/songmesh.properties"]);
        assert_eq!(args.config, Some(PathBuf::from("/etc/songmesh.properties")));
        assert!(matches!(args.command, Command::Config { action: ConfigAction::Show }));
    }
}
