use serde::{Deserialize, Serialize};

use crate::artifact::{addr, Artifact, ArtifactKind};
use crate::error::{Error, Result};

/// Which decompiler's stack-offset convention produced an offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StackOffsetType {
    Binja,
    Ida,
    Ghidra,
    Angr,
}

impl StackOffsetType {
    /// Conventions that share one offset space.
    fn frame_relative(self) -> bool {
        matches!(self, StackOffsetType::Binja | StackOffsetType::Ida)
    }
}

/// A named, typed slot in a function's stack frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StackVariable {
    pub stack_offset: i64,
    pub offset_type: StackOffsetType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub type_str: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
    #[serde(with = "addr")]
    pub func_addr: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_change: Option<i64>,
}

impl StackVariable {
    pub fn new(
        stack_offset: i64,
        offset_type: StackOffsetType,
        name: impl Into<String>,
        type_str: Option<String>,
        size: Option<u64>,
        func_addr: u64,
    ) -> Self {
        Self {
            stack_offset,
            offset_type,
            name: Some(name.into()),
            type_str,
            size,
            func_addr,
            last_change: None,
        }
    }

    /// The offset expressed in another decompiler's convention.
    ///
    /// Only Binary Ninja and IDA offsets are interchangeable; every other
    /// pairing fails rather than guessing.
    pub fn get_offset(&self, target: StackOffsetType) -> Result<i64> {
        if target == self.offset_type {
            return Ok(self.stack_offset);
        }
        if self.offset_type.frame_relative() && target.frame_relative() {
            Ok(self.stack_offset)
        } else {
            Err(Error::UnsupportedConversion {
                from: self.offset_type,
                to: target,
            })
        }
    }
}

impl PartialEq for StackVariable {
    fn eq(&self, other: &Self) -> bool {
        self.stack_offset == other.stack_offset
            && self.name == other.name
            && self.type_str == other.type_str
            && self.size == other.size
            && self.func_addr == other.func_addr
    }
}

impl Artifact for StackVariable {
    const KIND: ArtifactKind = ArtifactKind::StackVariable;
    const REQUIRED_INTEGERS: &'static [&'static str] = &["stack_offset", "func_addr"];

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

    fn var(offset_type: StackOffsetType) -> StackVariable {
        StackVariable::new(-0x18, offset_type, "buf", Some("char[16]".into()), Some(16), 0x401000)
    }

    #[test]
    fn test_equality_ignores_offset_type_and_time() {
        let a = var(StackOffsetType::Ida);
        let mut b = var(StackOffsetType::Angr);
        b.last_change = Some(1234);
        assert_eq!(a, b);

        b.name = Some("dst".into());
        assert_ne!(a, b);
    }

    #[test]
    fn test_offset_conversion() {
        let v = var(StackOffsetType::Binja);
        assert_eq!(v.get_offset(StackOffsetType::Binja).unwrap(), -0x18);
        assert_eq!(v.get_offset(StackOffsetType::Ida).unwrap(), -0x18);
        assert!(matches!(
            v.get_offset(StackOffsetType::Ghidra),
            Err(Error::UnsupportedConversion {
                from: StackOffsetType::Binja,
                to: StackOffsetType::Ghidra
            })
        ));

        let v = var(StackOffsetType::Angr);
        assert_eq!(v.get_offset(StackOffsetType::Angr).unwrap(), -0x18);
        assert!(v.get_offset(StackOffsetType::Ida).is_err());
    }

    #[test]
    fn test_parse_rejects_string_offset() {
        let text = "stack_offset = \"8\"\noffset_type = \"ida\"\nfunc_addr = 4096\n";
        assert!(matches!(
            StackVariable::parse(text),
            Err(Error::TypeMismatch { .. })
        ));
    }

    #[test]
    fn test_dump_parse() {
        let mut v = var(StackOffsetType::Ghidra);
        v.last_change = Some(99);
        let text = v.dump().unwrap();
        assert!(text.contains("type = \"char[16]\""));
        let parsed = StackVariable::parse(&text).unwrap();
        assert_eq!(parsed, v);
        assert_eq!(parsed.offset_type, StackOffsetType::Ghidra);
        assert_eq!(parsed.last_change, Some(99));
    }
}
