//! Git tree object encoding: a sequence of `"<mode> <name>\0<20-byte id>"`.

use std::cmp::Ordering;

use crate::error::{Error, Result};

pub const MODE_BLOB: &str = "100644";
pub const MODE_TREE: &str = "40000";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TreeEntry {
    pub mode: String,
    pub name: String,
    pub id: String,
}

impl TreeEntry {
    pub fn blob(name: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            mode: MODE_BLOB.to_string(),
            name: name.into(),
            id: id.into(),
        }
    }

    pub fn tree(name: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            mode: MODE_TREE.to_string(),
            name: name.into(),
            id: id.into(),
        }
    }

    pub fn is_tree(&self) -> bool {
        self.mode == MODE_TREE
    }
}

/// Git sorts subtrees as if their name ended in `/`.
fn git_order(a: &TreeEntry, b: &TreeEntry) -> Ordering {
    let key = |e: &TreeEntry| {
        let mut k = e.name.as_bytes().to_vec();
        if e.is_tree() {
            k.push(b'/');
        }
        k
    };
    key(a).cmp(&key(b))
}

/// Encode entries as tree object data, sorting them into git order first.
pub fn encode_tree(mut entries: Vec<TreeEntry>) -> Result<Vec<u8>> {
    entries.sort_by(git_order);
    let mut data = Vec::new();
    for entry in &entries {
        let raw = hex::decode(&entry.id)
            .map_err(|e| Error::Git(format!("bad object id {}: {e}", entry.id)))?;
        if raw.len() != 20 {
            return Err(Error::Git(format!("bad object id {}", entry.id)));
        }
        data.extend_from_slice(entry.mode.as_bytes());
        data.push(b' ');
        data.extend_from_slice(entry.name.as_bytes());
        data.push(0);
        data.extend_from_slice(&raw);
    }
    Ok(data)
}

/// Parse tree object data with gix-object. Entries that are neither trees
/// nor blobs (symlinks, submodules) keep their raw mode.
pub fn decode_tree(data: &[u8]) -> Result<Vec<TreeEntry>> {
    let tree = gix_object::TreeRef::from_bytes(data)
        .map_err(|e| Error::Git(format!("malformed tree object: {e}")))?;
    tree.entries
        .iter()
        .map(|entry| -> Result<TreeEntry> {
            let name = std::str::from_utf8(entry.filename)
                .map_err(|_| Error::Git("non-UTF-8 tree entry name".into()))?;
            let mode = if entry.mode.is_tree() {
                MODE_TREE.to_string()
            } else if entry.mode.is_blob() {
                MODE_BLOB.to_string()
            } else {
                let mut buf = [0u8; 6];
                entry.mode.as_bytes(&mut buf).to_string()
            };
            Ok(TreeEntry {
                mode,
                name: name.to_string(),
                id: entry.oid.to_hex().to_string(),
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    const ID_A: &str = "9daeafb9864cf43055ae93beb0afd6c7d144bfa4";
    const ID_B: &str = "4b825dc642cb6eb9a060e54bf8d69288fbee4904";

    #[test]
    fn test_subtrees_sort_with_trailing_slash() -> Result<()> {
        // "foo.toml" < "foo/" because '.' (0x2e) < '/' (0x2f)
        let data = encode_tree(vec![
            TreeEntry::tree("foo", ID_B),
            TreeEntry::blob("foo.toml", ID_A),
        ])?;
        let decoded = decode_tree(&data)?;
        assert_eq!(decoded[0].name, "foo.toml");
        assert_eq!(decoded[1].name, "foo");
        assert!(decoded[1].is_tree());
        assert_eq!(decoded[1].id, ID_B);
        Ok(())
    }

    #[test]
    fn test_bad_id_rejected() {
        assert!(encode_tree(vec![TreeEntry::blob("x", "abc")]).is_err());
    }

    #[test]
    fn test_executable_blob_and_symlink_modes() -> Result<()> {
        let mut data = Vec::new();
        for (mode, name, id) in [("100755", "run.sh", ID_A), ("120000", "link", ID_B)] {
            data.extend_from_slice(format!("{mode} {name}\0").as_bytes());
            data.extend_from_slice(&hex::decode(id).expect("hex"));
        }
        let decoded = decode_tree(&data)?;
        assert_eq!(decoded[0].mode, MODE_BLOB);
        assert_eq!(decoded[0].name, "run.sh");
        assert!(!decoded[0].is_tree());
        assert_eq!(decoded[1].mode, "120000");
        assert_eq!(decoded[1].id, ID_B);
        Ok(())
    }

    #[test]
    fn test_truncated_tree_rejected() {
        assert!(decode_tree(b"100644 x\0abc").is_err());
    }
}
