//! Bulk import of an existing directory tree into the index.
//!
//! Files stay where they are; only records pointing at them are created.
//! Anything that cannot be imported (unreadable entries, malformed tags,
//! locations already owned by another record) is logged and skipped; a
//! bulk import never dies halfway.

use std::path::{Component, Path};

use log::{info, warn};
use mime_guess::MimeGuess;
use walkdir::WalkDir;

use crate::error::FsResult;
use crate::fs::handler::TagDirFs;
use crate::index::{FileRecord, Tag};

#[derive(Debug, Clone, Default)]
pub struct IngestOptions {
    /// Explicit tags attached to every imported file.
    pub tags: Vec<String>,
    pub recursive: bool,
    /// Leading-dot entries are skipped unless asked for.
    pub include_hidden_dirs: bool,
    pub include_hidden_files: bool,
    /// Directory names pruned from the descent.
    pub exclude_dirs: Vec<String>,
    /// Tag each file with the path components of its directory, relative
    /// to the ingest source.
    pub tag_by_path: bool,
    /// With `tag_by_path`, keep the components leading up to the source
    /// directory too.
    pub include_original_path_prefix: bool,
    /// Tag each file with its guessed MIME type and subtype.
    pub tag_by_mime: bool,
}

/// Walk `source` depth-first and index every regular file found. Returns
/// how many files were imported. The index is persisted once, at the end.
pub fn ingest(fs: &mut TagDirFs, source: &Path, opts: &IngestOptions) -> FsResult<usize> {
    let source = source.canonicalize()?;
    let explicit = parse_tags(&opts.tags);

    let max_depth = if opts.recursive { usize::MAX } else { 1 };
    let walker = WalkDir::new(&source)
        .max_depth(max_depth)
        .into_iter()
        .filter_entry(|entry| {
            if entry.depth() == 0 || !entry.file_type().is_dir() {
                return true;
            }
            let name = entry.file_name().to_string_lossy();
            if opts.exclude_dirs.iter().any(|d| d.as_str() == name) {
                return false;
            }
            opts.include_hidden_dirs || !name.starts_with('.')
        });

    let mut imported = 0;
    for entry in walker {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                warn!("skipping unreadable entry: {e}");
                continue;
            }
        };
        if !entry.file_type().is_file() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().into_owned();
        if !opts.include_hidden_files && name.starts_with('.') {
            continue;
        }

        let mut tags = explicit.clone();
        if opts.tag_by_path {
            tags.extend(path_tags(entry.path(), &source, opts.include_original_path_prefix));
        }
        if opts.tag_by_mime {
            tags.extend(mime_tags(entry.path()));
        }

        let record = FileRecord::new(entry.path(), name);
        match fs.import(record, &tags) {
            Ok(()) => imported += 1,
            Err(e) => warn!("skipping {}: {e}", entry.path().display()),
        }
    }

    fs.persist_index()?;
    info!("imported {imported} files from {}", source.display());
    Ok(imported)
}

fn parse_tags(names: &[String]) -> Vec<Tag> {
    names
        .iter()
        .filter_map(|name| match Tag::new(name.clone()) {
            Ok(tag) => Some(tag),
            Err(e) => {
                warn!("skipping tag: {e}");
                None
            }
        })
        .collect()
}

/// The components of the file's directory, relative to the ingest source
/// (or to the filesystem root with the prefix option).
fn path_tags(file: &Path, source: &Path, from_root: bool) -> Vec<Tag> {
    let Some(dir) = file.parent() else {
        return Vec::new();
    };
    let dir = if from_root {
        dir
    } else {
        dir.strip_prefix(source).unwrap_or(dir)
    };
    dir.components()
        .filter_map(|c| match c {
            Component::Normal(part) => Tag::new(part.to_string_lossy()).ok(),
            _ => None,
        })
        .collect()
}

/// Type and subtype of the guessed MIME type, as two tags.
fn mime_tags(file: &Path) -> Vec<Tag> {
    match MimeGuess::from_path(file).first() {
        Some(mime) => [mime.type_().as_str(), mime.subtype().as_str()]
            .into_iter()
            .filter_map(|part| Tag::new(part).ok())
            .collect(),
        None => Vec::new(),
    }
}
