use std::path::Path;

use crate::error::{FsError, FsResult};
use crate::store::{Snapshot, Store};
use crate::SEQ_FILE;

/// Monotonically increasing 64-bit counter persisted through the store
/// adapter. Every successful [`Sequence::next`] strictly exceeds every
/// value returned before it, across process restarts included.
pub struct Sequence {
    store: Store<u64>,
}

impl Sequence {
    pub fn open<P: AsRef<Path>>(root: P) -> Sequence {
        Sequence {
            store: Store::new(root.as_ref().join(SEQ_FILE)),
        }
    }

    /// Seed the counter at zero when none is present, or unconditionally
    /// with `force`.
    pub fn init(&mut self, force: bool) -> FsResult<()> {
        match self.store.load_rw()? {
            Snapshot::Value(_) if !force => {
                self.store.abort();
                Ok(())
            }
            _ => self.store.store(&0),
        }
    }

    pub fn is_setup(&self) -> bool {
        matches!(self.store.load_ro(), Snapshot::Value(_))
    }

    /// Allocate the next value.
    pub fn next(&mut self) -> FsResult<u64> {
        let current = match self.store.load_rw()? {
            Snapshot::Value(v) => v,
            Snapshot::Absent => 0,
            Snapshot::Unreadable => {
                self.store.abort();
                return Err(FsError::Corrupt {
                    path: self.store.path().to_path_buf(),
                    detail: "sequence counter is not a u64".to_string(),
                });
            }
        };
        let next = current + 1;
        self.store.store(&next)?;
        Ok(next)
    }
}

/// Opaque backing filename minted from a counter value: `f_` plus the hex
/// digits of the counter, zero-padded to 32.
pub fn backing_name(seq: u64) -> String {
    format!("f_{seq:032x}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counts_up_from_one() {
        let dir = tempfile::tempdir().unwrap();
        let mut seq = Sequence::open(dir.path());
        seq.init(false).unwrap();
        assert_eq!(seq.next().unwrap(), 1);
        assert_eq!(seq.next().unwrap(), 2);
        assert_eq!(seq.next().unwrap(), 3);
    }

    #[test]
    fn survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let mut seq = Sequence::open(dir.path());
        seq.init(false).unwrap();
        seq.next().unwrap();
        seq.next().unwrap();

        let mut reopened = Sequence::open(dir.path());
        assert_eq!(reopened.next().unwrap(), 3);
    }

    #[test]
    fn init_without_force_keeps_the_counter() {
        let dir = tempfile::tempdir().unwrap();
        let mut seq = Sequence::open(dir.path());
        seq.init(false).unwrap();
        seq.next().unwrap();

        seq.init(false).unwrap();
        assert_eq!(seq.next().unwrap(), 2);

        seq.init(true).unwrap();
        assert_eq!(seq.next().unwrap(), 1);
    }

    #[test]
    fn backing_names_are_zero_padded_hex() {
        assert_eq!(backing_name(1), format!("f_{}1", "0".repeat(31)));
        assert_eq!(backing_name(0x2a), format!("f_{}2a", "0".repeat(30)));
        assert_eq!(backing_name(1).len(), 34);
    }
}
