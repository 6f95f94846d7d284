use serde::{Deserialize, Serialize};

use crate::artifact::{addr, opt_addr, Artifact, ArtifactKind};

/// A comment at an address.
///
/// `decompiled` comments target pseudocode positions rather than raw
/// instructions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Comment {
    #[serde(with = "addr")]
    pub addr: u64,
    pub comment: String,
    #[serde(default, with = "opt_addr", skip_serializing_if = "Option::is_none")]
    pub func_addr: Option<u64>,
    #[serde(default)]
    pub decompiled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_change: Option<i64>,
}

impl Comment {
    pub fn new(addr: u64, comment: impl Into<String>) -> Self {
        Self {
            addr,
            comment: comment.into(),
            func_addr: None,
            decompiled: false,
            last_change: None,
        }
    }

    pub fn in_function(mut self, func_addr: u64) -> Self {
        self.func_addr = Some(func_addr);
        self
    }

    pub fn decompiled(mut self, decompiled: bool) -> Self {
        self.decompiled = decompiled;
        self
    }

    /// True when this is the comment on the function's own header.
    pub fn is_function_header(&self) -> bool {
        self.func_addr == Some(self.addr)
    }
}

impl PartialEq for Comment {
    fn eq(&self, other: &Self) -> bool {
        self.addr == other.addr
            && self.comment == other.comment
            && self.func_addr == other.func_addr
            && self.decompiled == other.decompiled
    }
}

impl Artifact for Comment {
    const KIND: ArtifactKind = ArtifactKind::Comment;
    const REQUIRED_INTEGERS: &'static [&'static str] = &["addr"];

    fn last_change(&self) -> Option<i64> {
        self.last_change
    }

    fn set_last_change(&mut self, last_change: Option<i64>) {
        self.last_change = last_change;
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;
    use crate::artifact::{dump_many, load_many};

    #[test]
    fn test_combined_file_skips_bad_entries() {
        let mut comments: BTreeMap<u64, Comment> = BTreeMap::new();
        comments.insert(0x10, Comment::new(0x10, "first"));
        comments.insert(0x9, Comment::new(0x9, "second").in_function(0x0));
        let mut text = dump_many(&comments).unwrap();
        // 0x9 sorts before 0x10 numerically
        assert!(text.find("second").unwrap() < text.find("first").unwrap());

        text.push_str("\n[ff]\naddr = \"bogus\"\ncomment = \"x\"\n");
        let loaded: Vec<Comment> = load_many(&text).unwrap();
        assert_eq!(loaded.len(), 2);
        assert!(loaded.contains(&Comment::new(0x10, "first")));
    }

    #[test]
    fn test_header_detection() {
        assert!(Comment::new(0x400000, "hi").in_function(0x400000).is_function_header());
        assert!(!Comment::new(0x400004, "hi").in_function(0x400000).is_function_header());
        assert!(!Comment::new(0x400000, "hi").is_function_header());
    }
}
