use std::collections::BTreeMap;

use serde::{Deserialize, Deserializer, Serialize};

use crate::artifact::{addr, hex_map, Artifact, ArtifactKind};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StructMember {
    pub name: String,
    #[serde(with = "addr")]
    pub offset: u64,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub type_str: Option<String>,
    pub size: u64,
}

impl StructMember {
    pub fn new(name: impl Into<String>, offset: u64, type_str: Option<String>, size: u64) -> Self {
        Self {
            name: name.into(),
            offset,
            type_str,
            size,
        }
    }
}

/// A user-defined type. Identity is the name; a rename is a delete of the
/// old name plus an insert of the new one.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Struct {
    pub name: String,
    pub size: u64,
    #[serde(
        default,
        serialize_with = "hex_map::serialize",
        deserialize_with = "members_by_offset",
        skip_serializing_if = "BTreeMap::is_empty"
    )]
    pub members: BTreeMap<u64, StructMember>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_change: Option<i64>,
}

/// Members are keyed by the offset inside each record, whatever the table
/// key on disk says.
fn members_by_offset<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> std::result::Result<BTreeMap<u64, StructMember>, D::Error> {
    let members: BTreeMap<u64, StructMember> = hex_map::deserialize(deserializer)?;
    Ok(members
        .into_values()
        .map(|member| (member.offset, member))
        .collect())
}

impl Struct {
    pub fn new(name: impl Into<String>, size: u64) -> Self {
        Self {
            name: name.into(),
            size,
            members: BTreeMap::new(),
            last_change: None,
        }
    }

    pub fn add_member(&mut self, member: StructMember) {
        self.members.insert(member.offset, member);
    }
}

impl PartialEq for Struct {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name && self.size == other.size && self.members == other.members
    }
}

impl Artifact for Struct {
    const KIND: ArtifactKind = ArtifactKind::Struct;
    const REQUIRED_INTEGERS: &'static [&'static str] = &["size"];

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

    #[test]
    fn test_members_keyed_by_offset() {
        let mut s = Struct::new("sockaddr_in", 16);
        s.add_member(StructMember::new("sin_family", 0, Some("short".into()), 2));
        s.add_member(StructMember::new("sin_port", 2, Some("unsigned short".into()), 2));
        s.add_member(StructMember::new("sin_addr", 4, Some("in_addr".into()), 4));
        s.last_change = Some(42);

        let text = s.dump().unwrap();
        let parsed = Struct::parse(&text).unwrap();
        assert_eq!(parsed, s);
        assert_eq!(parsed.members[&2].name, "sin_port");
        assert_eq!(parsed.last_change, Some(42));
    }

    #[test]
    fn test_members_rekeyed_on_load() {
        let text = "name = \"pair\"\nsize = 16\n\n\
                    [members.0]\nname = \"first\"\noffset = 0\nsize = 8\n\n\
                    [members.1]\nname = \"second\"\noffset = 8\nsize = 8\n";
        let parsed = Struct::parse(text).unwrap();
        assert_eq!(parsed.members.keys().copied().collect::<Vec<_>>(), vec![0, 8]);
        assert_eq!(parsed.members[&8].name, "second");

        // Re-dumping keys the table by the real offset.
        let again = Struct::parse(&parsed.dump().unwrap()).unwrap();
        assert_eq!(again, parsed);
        assert!(parsed.dump().unwrap().contains("[members.8]"));
    }
}
