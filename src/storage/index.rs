use std::collections::BTreeMap;

/// A staged change to one tree entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IndexOp {
    Write(Vec<u8>),
    Remove,
}

/// Changes staged for the next commit, keyed by entry path.
///
/// Staging the same path twice keeps only the last operation.
#[derive(Debug, Clone, Default)]
pub struct Index {
    ops: BTreeMap<String, IndexOp>,
}

impl Index {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn write_entry(&mut self, path: impl Into<String>, content: impl Into<Vec<u8>>) {
        self.ops.insert(path.into(), IndexOp::Write(content.into()));
    }

    pub fn remove_entry(&mut self, path: impl Into<String>) {
        self.ops.insert(path.into(), IndexOp::Remove);
    }

    pub fn get(&self, path: &str) -> Option<&IndexOp> {
        self.ops.get(path)
    }

    pub fn into_ops(self) -> impl Iterator<Item = (String, IndexOp)> {
        self.ops.into_iter()
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_last_op_wins() {
        let mut index = Index::new();
        index.write_entry("structs/foo.toml", "a");
        index.remove_entry("structs/foo.toml");
        assert_eq!(index.len(), 1);
        assert_eq!(index.get("structs/foo.toml"), Some(&IndexOp::Remove));

        index.write_entry("structs/foo.toml", "b");
        assert_eq!(
            index.get("structs/foo.toml"),
            Some(&IndexOp::Write(b"b".to_vec()))
        );
    }
}
