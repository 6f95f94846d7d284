use std::cell::RefCell;
use std::collections::BTreeMap;

use super::{CommitId, Index, IndexOp, TreeReader, TreeStore};
use crate::error::{Error, Result};

/// In-memory tree store. Each commit bumps a counter used as the commit id.
#[derive(Debug, Default)]
pub struct MemoryTreeStore {
    entries: RefCell<BTreeMap<String, Vec<u8>>>,
    commits: RefCell<Vec<String>>,
}

impl MemoryTreeStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Messages of every commit so far, oldest first.
    pub fn history(&self) -> Vec<String> {
        self.commits.borrow().clone()
    }

    /// Overwrite an entry outside of any commit, for seeding fixtures.
    pub fn insert_raw(&self, path: impl Into<String>, content: impl Into<Vec<u8>>) {
        self.entries.borrow_mut().insert(path.into(), content.into());
    }
}

impl TreeReader for MemoryTreeStore {
    fn read_entry(&self, path: &str) -> Result<Vec<u8>> {
        self.entries
            .borrow()
            .get(path)
            .cloned()
            .ok_or_else(|| Error::not_found(format!("entry `{path}`")))
    }

    fn list_entries(&self, prefix: &str) -> Result<Vec<String>> {
        Ok(self
            .entries
            .borrow()
            .keys()
            .filter(|path| path.starts_with(prefix))
            .cloned()
            .collect())
    }
}

impl TreeStore for MemoryTreeStore {
    fn commit(&self, index: Index, message: &str) -> Result<CommitId> {
        let mut entries = self.entries.borrow_mut();
        for (path, op) in index.into_ops() {
            match op {
                IndexOp::Write(content) => {
                    entries.insert(path, content);
                }
                IndexOp::Remove => {
                    entries.remove(&path);
                }
            }
        }
        let mut commits = self.commits.borrow_mut();
        commits.push(message.to_string());
        Ok(commits.len().to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_commit_applies_writes_and_removals() -> Result<()> {
        let store = MemoryTreeStore::new();
        store.insert_raw("structs/old.toml", "x");

        let mut index = Index::new();
        index.write_entry("functions/1000.toml", "[metadata]\naddr = 4096\n");
        index.remove_entry("structs/old.toml");
        let id = store.commit(index, "first")?;

        assert_eq!(id, "1");
        assert_eq!(store.list_entries("functions/")?, vec!["functions/1000.toml"]);
        assert!(matches!(
            store.read_entry("structs/old.toml"),
            Err(Error::NotFound(_))
        ));
        assert_eq!(store.history(), vec!["first".to_string()]);
        Ok(())
    }
}
