use std::path::PathBuf;

use clap::ValueEnum;

/// When `readdir` swaps the restrictive listing for a covering one.
///
/// `Default` keeps the restrictive result unless it is degenerate (fewer
/// than two files) or too large to be useful; `Never` disables only the
/// too-large fallback; `Always` skips the restrictive query entirely.
#[derive(ValueEnum, Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum CoverMode {
    Never,
    #[default]
    Default,
    Always,
}

#[derive(Debug, Clone)]
pub struct Config {
    /// Backing directory holding the persisted state and the file bytes.
    pub root: PathBuf,
    pub cover_mode: CoverMode,
    /// Listing size beyond which the covering fallback kicks in.
    pub max_dir_entries: u32,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            root: PathBuf::from("/"),
            cover_mode: CoverMode::Default,
            max_dir_entries: 210,
        }
    }
}
