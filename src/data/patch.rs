use serde::{Deserialize, Serialize};

use crate::artifact::{addr, hex_bytes, Artifact, ArtifactKind};

/// Bytes written over the binary at `offset`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Patch {
    #[serde(with = "addr")]
    pub offset: u64,
    /// Object or segment the offset is relative to, when the loader has one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub obj_name: Option<String>,
    #[serde(with = "hex_bytes")]
    pub bytes: Vec<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_change: Option<i64>,
}

impl Patch {
    pub fn new(offset: u64, bytes: Vec<u8>) -> Self {
        Self {
            offset,
            obj_name: None,
            bytes,
            last_change: None,
        }
    }
}

impl PartialEq for Patch {
    fn eq(&self, other: &Self) -> bool {
        self.offset == other.offset && self.obj_name == other.obj_name && self.bytes == other.bytes
    }
}

impl Artifact for Patch {
    const KIND: ArtifactKind = ArtifactKind::Patch;
    const REQUIRED_INTEGERS: &'static [&'static str] = &["offset"];

    fn last_change(&self) -> Option<i64> {
        self.last_change
    }

    fn set_last_change(&mut self, last_change: Option<i64>) {
        self.last_change = last_change;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;

    #[test]
    fn test_bytes_as_hex() {
        let mut patch = Patch::new(0x1234, vec![0x90, 0x90, 0xcc]);
        patch.obj_name = Some(".text".into());
        let text = patch.dump().unwrap();
        assert!(text.contains("bytes = \"9090cc\""));
        assert_eq!(Patch::parse(&text).unwrap(), patch);
    }

    #[test]
    fn test_bad_payload_is_malformed() {
        let text = "offset = 16\nbytes = \"zz\"\n";
        assert!(matches!(Patch::parse(text), Err(Error::Malformed { .. })));
    }
}
