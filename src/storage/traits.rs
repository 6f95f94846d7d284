use crate::error::Result;

use super::Index;

/// Opaque marker returned by a commit. For the git store this is the commit
/// SHA-1; other backends may use anything that orders their history.
pub type CommitId = String;

/// Read access to one user's state tree.
pub trait TreeReader {
    /// Read the blob stored at `path`.
    /// Returns `Error::NotFound` if no such entry exists.
    fn read_entry(&self, path: &str) -> Result<Vec<u8>>;

    /// List the paths of all entries under `prefix` (e.g. `"functions/"`).
    /// An absent prefix yields an empty list.
    fn list_entries(&self, prefix: &str) -> Result<Vec<String>>;
}

/// A tree that can also be written.
pub trait TreeStore: TreeReader {
    /// Atomically apply every staged write and removal in `index`.
    /// Either all of them become visible or none do.
    fn commit(&self, index: Index, message: &str) -> Result<CommitId>;
}
