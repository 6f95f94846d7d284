use crate::error::{Error, Result};

/// The fields of a commit object this crate reads and writes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitInfo {
    pub tree: String,
    pub parent: Option<String>,
    pub author: String,
    pub message: String,
}

impl CommitInfo {
    /// Encode as commit object data. `author` is `Name <email>`; the same
    /// identity and `timestamp` are used for the committer line.
    pub fn encode(&self, timestamp: i64) -> Vec<u8> {
        let mut out = format!("tree {}\n", self.tree);
        if let Some(parent) = &self.parent {
            out.push_str(&format!("parent {parent}\n"));
        }
        out.push_str(&format!("author {} {timestamp} +0000\n", self.author));
        out.push_str(&format!("committer {} {timestamp} +0000\n", self.author));
        out.push('\n');
        out.push_str(&self.message);
        if !self.message.ends_with('\n') {
            out.push('\n');
        }
        out.into_bytes()
    }

    /// Parse commit object data with gix-object. Merge commits keep their
    /// first parent only.
    pub fn decode(data: &[u8]) -> Result<Self> {
        let commit = gix_object::CommitRef::from_bytes(data)
            .map_err(|e| Error::Git(format!("malformed commit object: {e}")))?;
        let message = std::str::from_utf8(commit.message)
            .map_err(|_| Error::Git("non-UTF-8 commit message".into()))?;
        let author = commit.author();
        let decoded = Self {
            tree: commit.tree().to_string(),
            parent: commit.parents().next().map(|id| id.to_string()),
            author: format!("{} <{}>", author.name, author.email),
            message: message.to_string(),
        };
        Ok(decoded)
    }
}
