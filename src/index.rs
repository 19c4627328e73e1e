use std::borrow::Borrow;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::path::{Path, PathBuf};

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::error::{FsError, FsResult};
use crate::store::{Snapshot, Store};
use crate::INDEX_FILE;

/// An opaque, non-empty name under which files are collectively reachable.
/// Any resemblance to path separators is incidental; no hierarchy lives in
/// the string.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Tag(String);

impl Tag {
    pub fn new<S: Into<String>>(name: S) -> FsResult<Tag> {
        let name = name.into();
        if name.is_empty() {
            return Err(FsError::Invalid("empty tag name".to_string()));
        }
        Ok(Tag(name))
    }

    pub fn name(&self) -> &str {
        &self.0
    }
}

impl Borrow<str> for Tag {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Index-side identity of a file: where the bytes live and the name the
/// user sees. Two records are the same file iff both fields match.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FileRecord {
    /// Backing location, joined to the mount root at resolution time.
    /// Absolute locations survive the join unchanged.
    pub location: PathBuf,
    pub name: String,
}

impl FileRecord {
    pub fn new<P: Into<PathBuf>, S: Into<String>>(location: P, name: S) -> FileRecord {
        FileRecord {
            location: location.into(),
            name: name.into(),
        }
    }
}

/// Which tags a listing offers as subdirectories.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ListingMode {
    /// Every neighbor tag.
    Unrestricted,
    /// Only neighbor tags that would actually shrink the selection.
    Restrictive,
    /// A minimal set of neighbor tags jointly reaching every selected file.
    Cover,
}

/// Bipartite relation between tags and file records, held as two maps kept
/// in lockstep. Tags with no files are legal; files with no tags stay
/// reachable through the empty-tag query until explicitly detached.
#[derive(Serialize, Deserialize, Debug, Default, Clone, PartialEq)]
pub struct TagIndex {
    #[serde(with = "indexmap::serde_seq")]
    tag_files: IndexMap<Tag, HashSet<FileRecord>>,
    file_tags: HashMap<FileRecord, HashSet<Tag>>,
}

impl TagIndex {
    /// Register `tags` and add every (tag, file) edge. An empty `files`
    /// registers the tags and nothing else. A location already owned by a
    /// different record is rejected.
    pub fn attach(&mut self, files: &[FileRecord], tags: &[Tag]) -> FsResult<()> {
        for file in files {
            if let Some(owner) = self
                .file_tags
                .keys()
                .find(|r| r.location == file.location && *r != file)
            {
                return Err(FsError::Invalid(format!(
                    "{} is already indexed as `{}`",
                    file.location.display(),
                    owner.name
                )));
            }
        }
        for tag in tags {
            let set = self.tag_files.entry(tag.clone()).or_default();
            for file in files {
                set.insert(file.clone());
            }
        }
        for file in files {
            self.file_tags
                .entry(file.clone())
                .or_default()
                .extend(tags.iter().cloned());
        }
        Ok(())
    }

    /// Remove (tag, file) edges. With `files` of `None` the tags are
    /// deleted outright together with every edge they appear in; files
    /// that lose their last tag are left in place either way.
    pub fn detach_tags_from_files(&mut self, tags: &[Tag], files: Option<&[FileRecord]>) {
        match files {
            Some(files) => {
                for tag in tags {
                    if let Some(set) = self.tag_files.get_mut(tag) {
                        for file in files {
                            set.remove(file);
                        }
                    }
                }
                for file in files {
                    if let Some(set) = self.file_tags.get_mut(file) {
                        for tag in tags {
                            set.remove(tag);
                        }
                    }
                }
            }
            None => {
                for tag in tags {
                    self.tag_files.shift_remove(tag);
                    for set in self.file_tags.values_mut() {
                        set.remove(tag);
                    }
                }
            }
        }
    }

    /// Drop every edge touching `files` and forget the records.
    pub fn detach_files(&mut self, files: &[FileRecord]) {
        for file in files {
            self.file_tags.remove(file);
            for set in self.tag_files.values_mut() {
                set.remove(file);
            }
        }
    }

    pub fn all_tags(&self) -> Vec<Tag> {
        let mut tags: Vec<Tag> = self.tag_files.keys().cloned().collect();
        tags.sort();
        tags
    }

    pub fn contains_tag(&self, name: &str) -> bool {
        self.tag_files.contains_key(name)
    }

    /// Tags carried by every one of `files`.
    pub fn tags_of_files(&self, files: &[FileRecord]) -> HashSet<Tag> {
        let Some((first, rest)) = files.split_first() else {
            return HashSet::new();
        };
        let mut common = self.file_tags.get(first).cloned().unwrap_or_default();
        for file in rest {
            match self.file_tags.get(file) {
                Some(tags) => common.retain(|t| tags.contains(t)),
                None => return HashSet::new(),
            }
        }
        common
    }

    /// Files carrying every tag in `tags`; every known file when `tags` is
    /// empty.
    pub fn files_of_tags(&self, tags: &[Tag]) -> HashSet<FileRecord> {
        let Some((first, rest)) = tags.split_first() else {
            return self.file_tags.keys().cloned().collect();
        };
        let mut selected = self.tag_files.get(first).cloned().unwrap_or_default();
        for tag in rest {
            match self.tag_files.get(tag) {
                Some(files) => selected.retain(|f| files.contains(f)),
                None => return HashSet::new(),
            }
        }
        selected
    }

    /// Tags that could narrow the selection further: every tag carried by
    /// at least one selected file, minus the selection tags themselves. An
    /// empty `tags` selects the whole index, so every known tag qualifies.
    pub fn neighbor_tags(&self, tags: &[Tag]) -> HashSet<Tag> {
        if tags.is_empty() {
            return self.tag_files.keys().cloned().collect();
        }
        let mut neighbors = HashSet::new();
        for file in self.files_of_tags(tags) {
            if let Some(ts) = self.file_tags.get(&file) {
                neighbors.extend(ts.iter().cloned());
            }
        }
        for tag in tags {
            neighbors.remove(tag);
        }
        neighbors
    }

    /// The listing operation behind `readdir`: which files the tag set
    /// selects and which further tags are worth offering as
    /// subdirectories. Results come back sorted (tags lexicographic, files
    /// by display name then location) so listings are deterministic.
    pub fn query(&self, tags: &[Tag], mode: ListingMode) -> (Vec<Tag>, Vec<FileRecord>) {
        let selected = self.files_of_tags(tags);
        let neighbors = self.neighbor_tags(tags);
        let (child_tags, files) = match mode {
            ListingMode::Unrestricted => (neighbors, selected),
            ListingMode::Restrictive => (self.restrict(tags, &selected, neighbors), selected),
            ListingMode::Cover => self.cover(&selected, neighbors),
        };
        let mut child_tags: Vec<Tag> = child_tags.into_iter().collect();
        child_tags.sort();
        let mut files: Vec<FileRecord> = files.into_iter().collect();
        files.sort_by(|a, b| a.name.cmp(&b.name).then_with(|| a.location.cmp(&b.location)));
        (child_tags, files)
    }

    // A neighbor that selects the same file set again is navigational
    // noise. The root listing is exempt so every tag stays reachable
    // from `/`.
    fn restrict(
        &self,
        tags: &[Tag],
        selected: &HashSet<FileRecord>,
        neighbors: HashSet<Tag>,
    ) -> HashSet<Tag> {
        if tags.is_empty() {
            return neighbors;
        }
        neighbors
            .into_iter()
            .filter(|tag| {
                let overlap = self
                    .tag_files
                    .get(tag)
                    .map(|files| selected.iter().filter(|f| files.contains(*f)).count())
                    .unwrap_or(0);
                overlap < selected.len()
            })
            .collect()
    }

    // Greedy set cover: repeatedly take the candidate reaching the most
    // still-uncovered files, smaller tag first on ties. Candidates that
    // reach no selected file at all only occur on the root listing, where
    // every known tag is a candidate; those stay in the result so empty
    // tags remain visible. Leftover files are the selected ones no chosen
    // tag reaches.
    fn cover(
        &self,
        selected: &HashSet<FileRecord>,
        neighbors: HashSet<Tag>,
    ) -> (HashSet<Tag>, HashSet<FileRecord>) {
        let mut candidates: Vec<Tag> = neighbors.into_iter().collect();
        candidates.sort();
        let mut uncovered = selected.clone();
        let mut chosen: HashSet<Tag> = HashSet::new();

        loop {
            let mut best: Option<(usize, usize)> = None;
            for (i, tag) in candidates.iter().enumerate() {
                if chosen.contains(tag) {
                    continue;
                }
                let gain = self
                    .tag_files
                    .get(tag)
                    .map(|files| uncovered.iter().filter(|f| files.contains(*f)).count())
                    .unwrap_or(0);
                if gain > best.map_or(0, |(_, g)| g) {
                    best = Some((i, gain));
                }
            }
            let Some((i, _)) = best else { break };
            let tag = candidates[i].clone();
            if let Some(files) = self.tag_files.get(&tag) {
                uncovered.retain(|f| !files.contains(f));
            }
            chosen.insert(tag);
        }

        for tag in candidates {
            let reaches = self
                .tag_files
                .get(&tag)
                .map(|files| files.iter().any(|f| selected.contains(f)))
                .unwrap_or(false);
            if !reaches {
                chosen.insert(tag);
            }
        }

        (chosen, uncovered)
    }

    pub fn open_store(root: &Path) -> Store<TagIndex> {
        Store::new(root.join(INDEX_FILE))
    }

    /// Create or, with `force`, truncate the persisted relation.
    pub fn init(store: &mut Store<TagIndex>, force: bool) -> FsResult<()> {
        match store.load_rw()? {
            Snapshot::Value(_) if !force => {
                store.abort();
                Ok(())
            }
            _ => store.store(&TagIndex::default()),
        }
    }

    /// Load the persisted relation. Absence means the root was never set
    /// up; that is the caller's cue to refuse, not to improvise.
    pub fn load(store: &Store<TagIndex>) -> FsResult<TagIndex> {
        match store.load_ro() {
            Snapshot::Value(index) => Ok(index),
            Snapshot::Absent => Err(FsError::NotFound(format!(
                "{} (run `setup` first)",
                store.path().display()
            ))),
            Snapshot::Unreadable => Err(FsError::Corrupt {
                path: store.path().to_path_buf(),
                detail: "tag index does not decode".to_string(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tag(name: &str) -> Tag {
        Tag::new(name).unwrap()
    }

    fn rec(location: &str, name: &str) -> FileRecord {
        FileRecord::new(location, name)
    }

    fn names(files: &[FileRecord]) -> Vec<&str> {
        files.iter().map(|f| f.name.as_str()).collect()
    }

    fn tag_names(tags: &[Tag]) -> Vec<&str> {
        tags.iter().map(|t| t.name()).collect()
    }

    /// Three files under X, two of them also under Y.
    fn xy_index() -> TagIndex {
        let mut index = TagIndex::default();
        index
            .attach(
                &[rec("f_1", "a"), rec("f_2", "b"), rec("f_3", "c")],
                &[tag("X")],
            )
            .unwrap();
        index
            .attach(&[rec("f_1", "a"), rec("f_2", "b")], &[tag("Y")])
            .unwrap();
        index
    }

    #[test]
    fn empty_tag_name_is_invalid() {
        assert!(matches!(Tag::new(""), Err(FsError::Invalid(_))));
    }

    #[test]
    fn intersection_narrows_per_tag() {
        let index = xy_index();
        assert_eq!(index.files_of_tags(&[tag("X")]).len(), 3);
        assert_eq!(index.files_of_tags(&[tag("Y")]).len(), 2);
        assert_eq!(index.files_of_tags(&[tag("X"), tag("Y")]).len(), 2);
        assert!(index.files_of_tags(&[tag("X"), tag("nope")]).is_empty());
    }

    #[test]
    fn narrower_tag_set_selects_a_subset() {
        let index = xy_index();
        let wide = index.files_of_tags(&[tag("X")]);
        let narrow = index.files_of_tags(&[tag("X"), tag("Y")]);
        assert!(narrow.is_subset(&wide));
    }

    #[test]
    fn tags_of_files_takes_the_common_set() {
        let index = xy_index();
        let common = index.tags_of_files(&[rec("f_1", "a"), rec("f_3", "c")]);
        assert_eq!(common, HashSet::from([tag("X")]));
        assert!(index.tags_of_files(&[rec("f_9", "z")]).is_empty());
    }

    #[test]
    fn restrictive_query_offers_only_narrowing_tags() {
        let index = xy_index();
        let (dirs, files) = index.query(&[tag("X")], ListingMode::Restrictive);
        assert_eq!(tag_names(&dirs), ["Y"]);
        assert_eq!(names(&files), ["a", "b", "c"]);

        let (dirs, files) = index.query(&[tag("X"), tag("Y")], ListingMode::Restrictive);
        assert!(dirs.is_empty());
        assert_eq!(names(&files), ["a", "b"]);
    }

    #[test]
    fn restrictive_drops_tags_that_do_not_narrow() {
        let mut index = TagIndex::default();
        let files = [rec("f_1", "a"), rec("f_2", "b")];
        index.attach(&files, &[tag("X"), tag("Y")]).unwrap();

        // Y selects exactly what X already selected.
        let (dirs, _) = index.query(&[tag("X")], ListingMode::Restrictive);
        assert!(dirs.is_empty());

        let (dirs, _) = index.query(&[tag("X")], ListingMode::Unrestricted);
        assert_eq!(tag_names(&dirs), ["Y"]);
    }

    #[test]
    fn empty_query_lists_everything() {
        let index = xy_index();
        let (dirs, files) = index.query(&[], ListingMode::Restrictive);
        assert_eq!(tag_names(&dirs), ["X", "Y"]);
        assert_eq!(names(&files), ["a", "b", "c"]);
    }

    #[test]
    fn unknown_tag_queries_come_back_empty() {
        let index = xy_index();
        for mode in [
            ListingMode::Unrestricted,
            ListingMode::Restrictive,
            ListingMode::Cover,
        ] {
            let (dirs, files) = index.query(&[tag("nope")], mode);
            assert!(dirs.is_empty());
            assert!(files.is_empty());
        }
    }

    #[test]
    fn cover_reaches_every_file_with_few_tags() {
        let mut index = TagIndex::default();
        let all: Vec<FileRecord> = (0..6)
            .map(|i| rec(&format!("f_{i}"), &format!("file{i}")))
            .collect();
        index.attach(&all, &[tag("X")]).unwrap();
        index.attach(&all[..3], &[tag("Y")]).unwrap();
        index.attach(&all[3..], &[tag("Z")]).unwrap();

        let (dirs, files) = index.query(&[tag("X")], ListingMode::Cover);
        assert_eq!(tag_names(&dirs), ["Y", "Z"]);
        assert!(files.is_empty());
    }

    #[test]
    fn cover_breaks_ties_toward_the_smaller_tag() {
        let mut index = TagIndex::default();
        let files = [rec("f_1", "a"), rec("f_2", "b")];
        index.attach(&files, &[tag("X")]).unwrap();
        index.attach(&files, &[tag("Z"), tag("Y")]).unwrap();

        // Y and Z both reach both files; Y wins and Z becomes redundant.
        let (dirs, leftover) = index.query(&[tag("X")], ListingMode::Cover);
        assert_eq!(tag_names(&dirs), ["Y"]);
        assert!(leftover.is_empty());
    }

    #[test]
    fn cover_passes_unreachable_files_through() {
        let mut index = TagIndex::default();
        index
            .attach(&[rec("f_1", "a"), rec("f_2", "b")], &[tag("X")])
            .unwrap();
        index.attach(&[rec("f_1", "a")], &[tag("Y")]).unwrap();

        let (dirs, files) = index.query(&[tag("X")], ListingMode::Cover);
        assert_eq!(tag_names(&dirs), ["Y"]);
        assert_eq!(names(&files), ["b"]);
    }

    #[test]
    fn cover_with_no_neighbors_returns_files_directly() {
        let mut index = TagIndex::default();
        index.attach(&[rec("f_1", "only")], &[tag("X")]).unwrap();

        let (dirs, files) = index.query(&[tag("X")], ListingMode::Cover);
        assert!(dirs.is_empty());
        assert_eq!(names(&files), ["only"]);
    }

    #[test]
    fn cover_keeps_empty_tags_visible_at_the_root() {
        let mut index = TagIndex::default();
        index.attach(&[], &[tag("A")]).unwrap();

        let (dirs, files) = index.query(&[], ListingMode::Cover);
        assert_eq!(tag_names(&dirs), ["A"]);
        assert!(files.is_empty());

        index.attach(&[rec("f_1", "x")], &[tag("B")]).unwrap();
        let (dirs, files) = index.query(&[], ListingMode::Cover);
        assert_eq!(tag_names(&dirs), ["A", "B"]);
        assert!(files.is_empty());
    }

    #[test]
    fn attach_then_detach_restores_the_relation() {
        let mut index = xy_index();
        let before = index.clone();

        // An edge that does not exist yet: c under Y.
        let files = [rec("f_3", "c")];
        index.attach(&files, &[tag("Y")]).unwrap();
        assert_ne!(before, index);

        index.detach_tags_from_files(&[tag("Y")], Some(&files));
        assert_eq!(before, index);
    }

    #[test]
    fn registering_a_tag_twice_is_a_noop() {
        let mut index = TagIndex::default();
        index.attach(&[], &[tag("A")]).unwrap();
        index.attach(&[], &[tag("A")]).unwrap();
        assert_eq!(index.all_tags(), [tag("A")]);
    }

    #[test]
    fn deleting_a_tag_keeps_its_files_reachable() {
        let mut index = xy_index();
        index.detach_tags_from_files(&[tag("X")], None);

        assert!(!index.contains_tag("X"));
        assert_eq!(index.all_tags(), [tag("Y")]);
        // c lost its only tag but still answers the empty-tag query.
        assert_eq!(index.files_of_tags(&[]).len(), 3);
        assert!(index.tags_of_files(&[rec("f_3", "c")]).is_empty());
    }

    #[test]
    fn detach_files_forgets_the_records() {
        let mut index = xy_index();
        index.detach_files(&[rec("f_1", "a")]);

        assert_eq!(index.files_of_tags(&[]).len(), 2);
        assert_eq!(index.files_of_tags(&[tag("Y")]).len(), 1);
    }

    #[test]
    fn one_record_per_backing_location() {
        let mut index = TagIndex::default();
        index.attach(&[rec("f_1", "a")], &[tag("X")]).unwrap();
        let clash = index.attach(&[rec("f_1", "b")], &[tag("X")]);
        assert!(matches!(clash, Err(FsError::Invalid(_))));
        // The same record under another tag is fine.
        index.attach(&[rec("f_1", "a")], &[tag("Y")]).unwrap();
    }

    #[test]
    fn persists_and_reloads_equal() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = TagIndex::open_store(dir.path());
        TagIndex::init(&mut store, false).unwrap();

        let index = xy_index();
        store.store(&index).unwrap();
        assert_eq!(TagIndex::load(&store).unwrap(), index);
    }

    #[test]
    fn load_without_setup_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let store = TagIndex::open_store(dir.path());
        assert!(matches!(TagIndex::load(&store), Err(FsError::NotFound(_))));
    }

    #[test]
    fn forced_init_truncates() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = TagIndex::open_store(dir.path());
        store.store(&xy_index()).unwrap();

        TagIndex::init(&mut store, true).unwrap();
        assert_eq!(TagIndex::load(&store).unwrap(), TagIndex::default());
    }
}
