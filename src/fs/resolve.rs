//! Virtual-path classification.
//!
//! A virtual path is a `/`-separated string whose directory components are
//! tags and whose final component is either a tag or a display name. The
//! resolver turns it into a backing path; misses land on the sentinel name
//! so callers can tell "create this" apart from "does not exist".

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use crate::index::{Tag, TagIndex};
use crate::{MISSING_FILE, TAG_DIR_PREFIX};

/// Virtual path → backing path, as of the most recent `readdir`.
///
/// Purely an optimization: every resolution must also succeed with a cold
/// cache. The index stays the source of truth.
#[derive(Debug, Default)]
pub struct ReaddirCache {
    entries: HashMap<String, PathBuf>,
}

impl ReaddirCache {
    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn insert(&mut self, vpath: String, backing: PathBuf) {
        self.entries.insert(vpath, backing);
    }

    pub fn get(&self, vpath: &str) -> Option<&PathBuf> {
        self.entries.get(vpath)
    }

    pub fn remove(&mut self, vpath: &str) {
        self.entries.remove(vpath);
    }
}

/// Non-empty components of a virtual path.
pub fn components(vpath: &str) -> Vec<&str> {
    vpath.split('/').filter(|c| !c.is_empty()).collect()
}

pub fn basename(vpath: &str) -> &str {
    vpath.rsplit('/').next().unwrap_or_default()
}

pub fn dirname(vpath: &str) -> &str {
    match vpath.rfind('/') {
        Some(idx) => &vpath[..idx],
        None => "",
    }
}

/// The directory components of `vpath` as tags. Empty components carry no
/// meaning and are skipped, so `Tag::new` cannot fail here.
pub fn parent_tags(vpath: &str) -> Vec<Tag> {
    components(dirname(vpath))
        .into_iter()
        .filter_map(|c| Tag::new(c).ok())
        .collect()
}

pub fn join(dir: &str, name: &str) -> String {
    if dir.ends_with('/') {
        format!("{dir}{name}")
    } else {
        format!("{dir}/{name}")
    }
}

/// The physical directory standing in for a registered tag.
pub fn tag_dir(root: &Path, tag: &str) -> PathBuf {
    root.join(format!("{TAG_DIR_PREFIX}{tag}"))
}

/// Where a virtual path lives on the backing filesystem.
///
/// Classification order: cache hit, the root itself, a known tag, a display
/// name under the parent's tag set, and finally the sentinel.
pub fn backing_path(root: &Path, index: &TagIndex, cache: &ReaddirCache, vpath: &str) -> PathBuf {
    if let Some(hit) = cache.get(vpath) {
        return hit.clone();
    }
    if vpath == "/" {
        return root.to_path_buf();
    }
    let name = basename(vpath);
    if index.contains_tag(name) {
        return tag_dir(root, name);
    }
    let tags = parent_tags(vpath);
    match index
        .files_of_tags(&tags)
        .into_iter()
        .find(|f| f.name == name)
    {
        Some(file) => root.join(&file.location),
        None => root.join(MISSING_FILE),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::FileRecord;

    fn tag(name: &str) -> Tag {
        Tag::new(name).unwrap()
    }

    fn sample_index() -> TagIndex {
        let mut index = TagIndex::default();
        index
            .attach(
                &[FileRecord::new("f_0001", "hello.txt")],
                &[tag("A"), tag("B")],
            )
            .unwrap();
        index
    }

    #[test]
    fn path_helpers_split_where_expected() {
        assert_eq!(components("/A/B/c.txt"), ["A", "B", "c.txt"]);
        assert_eq!(components("/"), Vec::<&str>::new());
        assert_eq!(basename("/A/c.txt"), "c.txt");
        assert_eq!(dirname("/A/c.txt"), "/A");
        assert_eq!(dirname("/c.txt"), "");
        assert_eq!(join("/", "A"), "/A");
        assert_eq!(join("/A", "c.txt"), "/A/c.txt");
    }

    #[test]
    fn parent_tags_ignore_empty_components() {
        let tags = parent_tags("//A//B/c.txt");
        assert_eq!(tags, [tag("A"), tag("B")]);
    }

    #[test]
    fn root_resolves_to_the_backing_root() {
        let index = TagIndex::default();
        let cache = ReaddirCache::default();
        let backing = backing_path(Path::new("/data"), &index, &cache, "/");
        assert_eq!(backing, Path::new("/data"));
    }

    #[test]
    fn known_tags_resolve_to_their_physical_directory() {
        let index = sample_index();
        let cache = ReaddirCache::default();
        let backing = backing_path(Path::new("/data"), &index, &cache, "/A");
        assert_eq!(backing, Path::new("/data/t_A"));
        // Tag classification looks only at the final component.
        let backing = backing_path(Path::new("/data"), &index, &cache, "/A/B");
        assert_eq!(backing, Path::new("/data/t_B"));
    }

    #[test]
    fn display_names_resolve_through_the_parent_tag_set() {
        let index = sample_index();
        let cache = ReaddirCache::default();
        let backing = backing_path(Path::new("/data"), &index, &cache, "/A/hello.txt");
        assert_eq!(backing, Path::new("/data/f_0001"));
        let backing = backing_path(Path::new("/data"), &index, &cache, "/A/B/hello.txt");
        assert_eq!(backing, Path::new("/data/f_0001"));
    }

    #[test]
    fn misses_resolve_to_the_sentinel() {
        let index = sample_index();
        let cache = ReaddirCache::default();
        let backing = backing_path(Path::new("/data"), &index, &cache, "/A/nope.txt");
        assert_eq!(backing, Path::new("/data/__MISSING_FILE__"));
    }

    #[test]
    fn cache_hits_win_over_classification() {
        let index = sample_index();
        let mut cache = ReaddirCache::default();
        cache.insert("/A/hello.txt".to_string(), PathBuf::from("/elsewhere/x"));
        let backing = backing_path(Path::new("/data"), &index, &cache, "/A/hello.txt");
        assert_eq!(backing, Path::new("/elsewhere/x"));

        cache.remove("/A/hello.txt");
        let backing = backing_path(Path::new("/data"), &index, &cache, "/A/hello.txt");
        assert_eq!(backing, Path::new("/data/f_0001"));
    }

    #[test]
    fn absolute_locations_ignore_the_root_join() {
        let mut index = TagIndex::default();
        index
            .attach(&[FileRecord::new("/srv/media/song.mp3", "song.mp3")], &[tag("music")])
            .unwrap();
        let cache = ReaddirCache::default();
        let backing = backing_path(Path::new("/data"), &index, &cache, "/music/song.mp3");
        assert_eq!(backing, Path::new("/srv/media/song.mp3"));
    }
}
