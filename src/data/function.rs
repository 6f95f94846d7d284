use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::StackVariable;
use crate::artifact::{addr, hex_map, Artifact, ArtifactKind};

/// One positional argument in a function signature.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunctionArgument {
    pub index: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub type_str: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_change: Option<i64>,
}

impl FunctionArgument {
    pub fn new(index: u32, name: Option<String>, type_str: Option<String>, size: Option<u64>) -> Self {
        Self {
            index,
            name,
            type_str,
            size,
            last_change: None,
        }
    }
}

impl PartialEq for FunctionArgument {
    fn eq(&self, other: &Self) -> bool {
        self.index == other.index
            && self.name == other.name
            && self.type_str == other.type_str
            && self.size == other.size
    }
}

impl Artifact for FunctionArgument {
    const KIND: ArtifactKind = ArtifactKind::FunctionArgument;
    const REQUIRED_INTEGERS: &'static [&'static str] = &["index"];

    fn last_change(&self) -> Option<i64> {
        self.last_change
    }

    fn set_last_change(&mut self, last_change: Option<i64>) {
        self.last_change = last_change;
    }
}

/// Name, comment and signature of a function.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunctionHeader {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(with = "addr")]
    pub addr: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ret_type: Option<String>,
    #[serde(default, with = "hex_map", skip_serializing_if = "BTreeMap::is_empty")]
    pub args: BTreeMap<u32, FunctionArgument>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_change: Option<i64>,
}

impl FunctionHeader {
    pub fn new(name: Option<String>, addr: u64) -> Self {
        Self {
            name,
            addr,
            comment: None,
            ret_type: None,
            args: BTreeMap::new(),
            last_change: None,
        }
    }

    /// Insert or replace the argument at `arg.index`.
    pub fn set_arg(&mut self, arg: FunctionArgument) {
        self.args.insert(arg.index, arg);
    }
}

impl PartialEq for FunctionHeader {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name
            && self.addr == other.addr
            && self.comment == other.comment
            && self.ret_type == other.ret_type
            && self.args == other.args
    }
}

impl Artifact for FunctionHeader {
    const KIND: ArtifactKind = ArtifactKind::FunctionHeader;
    const REQUIRED_INTEGERS: &'static [&'static str] = &["addr"];

    fn last_change(&self) -> Option<i64> {
        self.last_change
    }

    fn set_last_change(&mut self, last_change: Option<i64>) {
        self.last_change = last_change;
    }
}

/// A function and everything analysts attach to it.
///
/// Persisted as three groups: `[metadata]`, an optional `[header]` and
/// `[stack_vars]`, the last omitted when empty.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(from = "FunctionRecord", into = "FunctionRecord")]
pub struct Function {
    pub addr: u64,
    pub header: Option<FunctionHeader>,
    pub stack_vars: BTreeMap<i64, StackVariable>,
    pub last_change: Option<i64>,
}

impl Function {
    pub fn new(addr: u64) -> Self {
        Self {
            addr,
            header: None,
            stack_vars: BTreeMap::new(),
            last_change: None,
        }
    }

    pub fn with_header(header: FunctionHeader) -> Self {
        let mut func = Self::new(header.addr);
        func.header = Some(header);
        func
    }

    /// The header, created at this function's address if absent.
    pub fn ensure_header(&mut self) -> &mut FunctionHeader {
        let addr = self.addr;
        self.header
            .get_or_insert_with(|| FunctionHeader::new(None, addr))
    }

    pub fn name(&self) -> Option<&str> {
        self.header.as_ref().and_then(|h| h.name.as_deref())
    }

    /// Sets the header name, creating the header if needed.
    pub fn set_name(&mut self, name: Option<String>) {
        self.ensure_header().name = name;
    }

    pub fn comment(&self) -> Option<&str> {
        self.header.as_ref().and_then(|h| h.comment.as_deref())
    }

    /// Sets the header comment, creating the header if needed.
    pub fn set_comment(&mut self, comment: Option<String>) {
        self.ensure_header().comment = comment;
    }
}

impl PartialEq for Function {
    fn eq(&self, other: &Self) -> bool {
        self.addr == other.addr && self.header == other.header && self.stack_vars == other.stack_vars
    }
}

impl Artifact for Function {
    const KIND: ArtifactKind = ArtifactKind::Function;
    const REQUIRED_INTEGERS: &'static [&'static str] = &["metadata.addr"];

    fn last_change(&self) -> Option<i64> {
        self.last_change
    }

    fn set_last_change(&mut self, last_change: Option<i64>) {
        self.last_change = last_change;
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct FunctionMetadata {
    #[serde(with = "addr")]
    addr: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    last_change: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct FunctionRecord {
    metadata: FunctionMetadata,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    header: Option<FunctionHeader>,
    #[serde(default, with = "hex_map", skip_serializing_if = "BTreeMap::is_empty")]
    stack_vars: BTreeMap<i64, StackVariable>,
}

impl From<FunctionRecord> for Function {
    fn from(record: FunctionRecord) -> Self {
        let addr = record.metadata.addr;
        // Records carry their own identity; the table key is only for humans.
        let stack_vars = record
            .stack_vars
            .into_values()
            .map(|var| (var.stack_offset, var))
            .collect();
        // The header always describes the function named in metadata.
        let header = record.header.map(|mut header| {
            header.addr = addr;
            header.args = header
                .args
                .into_values()
                .map(|arg| (arg.index, arg))
                .collect();
            header
        });
        Function {
            addr,
            header,
            stack_vars,
            last_change: record.metadata.last_change,
        }
    }
}

impl From<Function> for FunctionRecord {
    fn from(func: Function) -> Self {
        FunctionRecord {
            metadata: FunctionMetadata {
                addr: func.addr,
                last_change: func.last_change,
            },
            header: func.header,
            stack_vars: func.stack_vars,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::StackOffsetType;
    use crate::error::Error;

    fn sample() -> Function {
        let mut header = FunctionHeader::new(Some("main".into()), 0x400000);
        header.ret_type = Some("int".into());
        header.comment = Some("entry point".into());
        header.set_arg(FunctionArgument::new(0, Some("argc".into()), Some("int".into()), Some(4)));
        header.set_arg(FunctionArgument::new(1, Some("argv".into()), Some("char **".into()), Some(8)));
        let mut func = Function::with_header(header);
        func.stack_vars.insert(
            -0x10,
            StackVariable::new(-0x10, StackOffsetType::Ida, "i", Some("int".into()), Some(4), 0x400000),
        );
        func.last_change = Some(1_700_000_000);
        func
    }

    #[test]
    fn test_dump_groups() {
        let text = sample().dump().unwrap();
        assert!(text.contains("[metadata]"));
        assert!(text.contains("[header]"));
        assert!(text.contains("stack_vars"));
        assert!(text.contains("-10"));

        let bare = Function::new(0x1000).dump().unwrap();
        assert!(bare.contains("[metadata]"));
        assert!(!bare.contains("header"));
        assert!(!bare.contains("stack_vars"));
    }

    #[test]
    fn test_roundtrip() {
        let func = sample();
        let parsed = Function::parse(&func.dump().unwrap()).unwrap();
        assert_eq!(parsed, func);
        assert_eq!(parsed.last_change, Some(1_700_000_000));
        assert_eq!(parsed.comment(), Some("entry point"));
        assert_eq!(parsed.header.as_ref().unwrap().args.len(), 2);
    }

    #[test]
    fn test_equality_ignores_last_change() {
        let a = sample();
        let mut b = sample();
        b.last_change = None;
        b.header.as_mut().unwrap().last_change = Some(5);
        assert_eq!(a, b);
    }

    #[test]
    fn test_accessors_create_header() {
        let mut func = Function::new(0x2000);
        assert_eq!(func.name(), None);
        assert!(func.header.is_none());

        func.set_name(Some("helper".into()));
        assert_eq!(func.name(), Some("helper"));
        assert_eq!(func.header.as_ref().unwrap().addr, 0x2000);

        let mut func = Function::new(0x3000);
        func.ensure_header().comment = Some("c".into());
        assert_eq!(func.comment(), Some("c"));
    }

    #[test]
    fn test_metadata_addr_owns_header() {
        let text = "[metadata]\naddr = 4096\n\n[header]\nname = \"init\"\naddr = 8192\n\n\
                    [stack_vars.-8]\nstack_offset = -16\noffset_type = \"ida\"\nfunc_addr = 4096\n";
        let func = Function::parse(text).unwrap();
        assert_eq!(func.addr, 0x1000);
        assert_eq!(func.header.as_ref().unwrap().addr, 0x1000);
        assert!(func.stack_vars.get(&-8).is_none());
        assert_eq!(func.stack_vars[&-16].name, None);
    }

    #[test]
    fn test_kernel_address_roundtrip() {
        let header = FunctionHeader::new(Some("start_kernel".into()), 0xffffffff81000000);
        let mut func = Function::with_header(header);
        func.stack_vars.insert(
            -8,
            StackVariable::new(-8, StackOffsetType::Binja, "flags", None, Some(8), 0xffffffff81000000),
        );
        let text = func.dump().unwrap();
        let parsed = Function::parse(&text).unwrap();
        assert_eq!(parsed, func);
        assert_eq!(parsed.addr, 0xffffffff81000000);
        assert_eq!(parsed.header.unwrap().addr, 0xffffffff81000000);
    }

    #[test]
    fn test_string_address_rejected() {
        let text = "[metadata]\naddr = \"0x400000\"\n";
        assert!(matches!(Function::parse(text), Err(Error::TypeMismatch { .. })));
    }
}
