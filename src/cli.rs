use std::path::PathBuf;

use clap::{Parser, Subcommand};

use crate::config::CoverMode;

/// Filesystem whose directories are tags and whose paths are tag sets
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Mount the virtual filesystem
    Mount {
        /// Where to mount
        mountpoint: PathBuf,

        /// Backing directory holding the persisted state and file bytes
        #[arg(long, default_value = "/")]
        root: PathBuf,

        /// When readdir swaps the restrictive listing for a covering one
        #[arg(long, value_enum, default_value_t = CoverMode::Default)]
        cover_mode: CoverMode,

        /// Listing size beyond which the covering fallback kicks in
        #[arg(long, default_value_t = 210)]
        max_dir_entries: u32,
    },

    /// Initialize the persisted state under a backing root
    Setup {
        root: PathBuf,

        /// Wipe anything already under the root first
        #[arg(long)]
        force: bool,
    },

    /// Import an existing directory tree into the index
    Ingest {
        /// Directory to import
        source: PathBuf,

        /// Backing root to import into (must be set up)
        #[arg(long, default_value = "/")]
        root: PathBuf,

        /// Tag to attach to every imported file; repeatable
        #[arg(short, long = "tag")]
        tags: Vec<String>,

        /// Descend into subdirectories
        #[arg(short, long)]
        recursive: bool,

        /// Walk into leading-dot directories
        #[arg(long)]
        include_hidden_dirs: bool,

        /// Import leading-dot files
        #[arg(long)]
        include_hidden_files: bool,

        /// Directory name to skip; repeatable
        #[arg(long = "exclude-dir")]
        exclude_dirs: Vec<String>,

        /// Tag each file with the path components of its directory
        #[arg(long)]
        tag_by_path: bool,

        /// With --tag-by-path, keep the components above the source too
        #[arg(long, requires = "tag_by_path")]
        include_original_path_prefix: bool,

        /// Tag each file with its guessed MIME type and subtype
        #[arg(long)]
        tag_by_mime: bool,
    },
}
