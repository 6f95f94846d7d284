//! The base contract every versioned record implements.
//!
//! Artifacts serialize to flat TOML tables. Containers keyed by integers
//! (function arguments, stack variables, struct members, the combined comment
//! and patch files) use lowercase hex keys without a prefix so the files on
//! disk sort and diff in address order.

use std::collections::BTreeMap;
use std::fmt;

use serde::{de::DeserializeOwned, Deserialize, Serialize};

use crate::error::{Error, Result};

/// Tag naming every concrete artifact type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactKind {
    Function,
    FunctionHeader,
    FunctionArgument,
    StackVariable,
    Comment,
    Patch,
    Struct,
    Metadata,
}

impl ArtifactKind {
    /// The top-level mapping of a state this kind of artifact is filed under.
    pub fn group(self) -> Option<ArtifactGroup> {
        match self {
            ArtifactKind::Function
            | ArtifactKind::FunctionHeader
            | ArtifactKind::FunctionArgument
            | ArtifactKind::StackVariable => Some(ArtifactGroup::Function),
            ArtifactKind::Comment => Some(ArtifactGroup::Comment),
            ArtifactKind::Patch => Some(ArtifactGroup::Patch),
            ArtifactKind::Struct => Some(ArtifactGroup::Struct),
            ArtifactKind::Metadata => None,
        }
    }
}

impl fmt::Display for ArtifactKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ArtifactKind::Function => "function",
            ArtifactKind::FunctionHeader => "function header",
            ArtifactKind::FunctionArgument => "function argument",
            ArtifactKind::StackVariable => "stack variable",
            ArtifactKind::Comment => "comment",
            ArtifactKind::Patch => "patch",
            ArtifactKind::Struct => "struct",
            ArtifactKind::Metadata => "metadata",
        };
        f.write_str(s)
    }
}

/// The four top-level mappings of a state, used for "what changed most
/// recently" bookkeeping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactGroup {
    Function,
    Comment,
    Patch,
    Struct,
}

impl fmt::Display for ArtifactGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ArtifactGroup::Function => "function",
            ArtifactGroup::Comment => "comment",
            ArtifactGroup::Patch => "patch",
            ArtifactGroup::Struct => "struct",
        };
        f.write_str(s)
    }
}

impl std::str::FromStr for ArtifactGroup {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "function" | "functions" => Ok(ArtifactGroup::Function),
            "comment" | "comments" => Ok(ArtifactGroup::Comment),
            "patch" | "patches" => Ok(ArtifactGroup::Patch),
            "struct" | "structs" => Ok(ArtifactGroup::Struct),
            other => Err(Error::not_found(format!("artifact group `{other}`"))),
        }
    }
}

/// Identity of an artifact within its group: an address/offset, or a name
/// for structs.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ArtifactKey {
    Addr(#[serde(with = "addr")] u64),
    Name(String),
}

impl fmt::Display for ArtifactKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ArtifactKey::Addr(addr) => write!(f, "{addr:#x}"),
            ArtifactKey::Name(name) => f.write_str(name),
        }
    }
}

impl From<u64> for ArtifactKey {
    fn from(addr: u64) -> Self {
        ArtifactKey::Addr(addr)
    }
}

impl From<&str> for ArtifactKey {
    fn from(name: &str) -> Self {
        ArtifactKey::Name(name.to_string())
    }
}

/// Seconds since the Unix epoch, the unit of every `last_change`.
pub fn now() -> i64 {
    chrono::Utc::now().timestamp()
}

/// A versioned record.
///
/// `PartialEq` on every implementor compares content only and ignores
/// `last_change`, so convergence checks do not depend on when an edit
/// happened.
pub trait Artifact: Serialize + DeserializeOwned + Clone + PartialEq {
    const KIND: ArtifactKind;

    /// Dotted paths of fields that must be TOML integers.
    const REQUIRED_INTEGERS: &'static [&'static str];

    fn last_change(&self) -> Option<i64>;

    fn set_last_change(&mut self, last_change: Option<i64>);

    /// Serialize to TOML text.
    fn dump(&self) -> Result<String> {
        Ok(toml::to_string(self)?)
    }

    /// Reconstruct from TOML text.
    fn parse(text: &str) -> Result<Self> {
        let table: toml::Table = text.parse().map_err(|source| Error::Malformed {
            kind: Self::KIND,
            source,
        })?;
        Self::from_value(toml::Value::Table(table))
    }

    /// Reconstruct from an already parsed TOML value, e.g. one entry of a
    /// combined file.
    fn from_value(value: toml::Value) -> Result<Self> {
        let table = value.as_table().ok_or_else(|| Error::TypeMismatch {
            field: Self::KIND.to_string(),
            expected: "table",
            found: value.type_str().to_string(),
        })?;
        for path in Self::REQUIRED_INTEGERS {
            expect_integer(table, path)?;
        }
        value.try_into().map_err(|source| Error::Malformed {
            kind: Self::KIND,
            source,
        })
    }
}

fn expect_integer(table: &toml::Table, path: &str) -> Result<()> {
    let mut current = table;
    let mut segments = path.split('.').peekable();
    while let Some(segment) = segments.next() {
        let value = current
            .get(segment)
            .ok_or_else(|| Error::TypeMismatch {
                field: path.to_string(),
                expected: "integer",
                found: "nothing".to_string(),
            })?;
        if segments.peek().is_none() {
            return match value {
                toml::Value::Integer(_) => Ok(()),
                other => Err(Error::TypeMismatch {
                    field: path.to_string(),
                    expected: "integer",
                    found: other.type_str().to_string(),
                }),
            };
        }
        current = value.as_table().ok_or_else(|| Error::TypeMismatch {
            field: path.to_string(),
            expected: "table",
            found: value.type_str().to_string(),
        })?;
    }
    Ok(())
}

/// Integer keys rendered as lowercase hex without a prefix.
pub trait HexKey: Sized + Ord {
    fn to_hex(&self) -> String;
    fn from_hex(s: &str) -> std::result::Result<Self, std::num::ParseIntError>;
}

impl HexKey for u32 {
    fn to_hex(&self) -> String {
        format!("{self:x}")
    }

    fn from_hex(s: &str) -> std::result::Result<Self, std::num::ParseIntError> {
        u32::from_str_radix(s, 16)
    }
}

impl HexKey for u64 {
    fn to_hex(&self) -> String {
        format!("{self:x}")
    }

    fn from_hex(s: &str) -> std::result::Result<Self, std::num::ParseIntError> {
        u64::from_str_radix(s, 16)
    }
}

impl HexKey for i64 {
    fn to_hex(&self) -> String {
        if *self < 0 {
            format!("-{:x}", self.unsigned_abs())
        } else {
            format!("{self:x}")
        }
    }

    fn from_hex(s: &str) -> std::result::Result<Self, std::num::ParseIntError> {
        i64::from_str_radix(s, 16)
    }
}

/// serde adapter for `BTreeMap<K, V>` with hex-encoded integer keys.
pub mod hex_map {
    use std::collections::BTreeMap;

    use serde::{
        de::Error as _, ser::SerializeMap, Deserialize, Deserializer, Serialize, Serializer,
    };

    use super::HexKey;

    pub fn serialize<K, V, S>(map: &BTreeMap<K, V>, serializer: S) -> Result<S::Ok, S::Error>
    where
        K: HexKey,
        V: Serialize,
        S: Serializer,
    {
        let mut out = serializer.serialize_map(Some(map.len()))?;
        for (key, value) in map {
            out.serialize_entry(&key.to_hex(), value)?;
        }
        out.end()
    }

    pub fn deserialize<'de, K, V, D>(deserializer: D) -> Result<BTreeMap<K, V>, D::Error>
    where
        K: HexKey,
        V: Deserialize<'de>,
        D: Deserializer<'de>,
    {
        let raw = BTreeMap::<String, V>::deserialize(deserializer)?;
        raw.into_iter()
            .map(|(key, value)| {
                K::from_hex(&key)
                    .map(|key| (key, value))
                    .map_err(|e| D::Error::custom(format!("invalid hex key `{key}`: {e}")))
            })
            .collect()
    }
}

/// serde adapter storing a `u64` address as the TOML (signed 64-bit)
/// integer with the same bits, so addresses above `i64::MAX` survive.
pub mod addr {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(addr: &u64, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_i64(*addr as i64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u64, D::Error> {
        i64::deserialize(deserializer).map(|bits| bits as u64)
    }
}

/// [`addr`] for optional addresses.
pub mod opt_addr {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(addr: &Option<u64>, serializer: S) -> Result<S::Ok, S::Error> {
        match addr {
            Some(addr) => serializer.serialize_some(&(*addr as i64)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<u64>, D::Error> {
        Option::<i64>::deserialize(deserializer).map(|bits| bits.map(|bits| bits as u64))
    }
}

/// serde adapter for byte payloads stored as a lowercase hex string.
pub mod hex_bytes {
    use serde::{de::Error as _, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(deserializer)?;
        hex::decode(&s).map_err(D::Error::custom)
    }
}

/// Render a map of artifacts as one combined TOML document keyed by hex
/// identity, as used for `comments.toml` and `patches.toml`.
pub fn dump_many<K: HexKey, A: Artifact>(items: &BTreeMap<K, A>) -> Result<String> {
    Ok(toml::to_string(&HexKeyed(items))?)
}

/// Keeps numeric key order in the output instead of string order.
struct HexKeyed<'a, K, V>(&'a BTreeMap<K, V>);

impl<K: HexKey, V: Serialize> Serialize for HexKeyed<'_, K, V> {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        hex_map::serialize(self.0, serializer)
    }
}

/// Parse a combined TOML document, skipping every entry that fails to
/// deserialize. A document that does not parse at all is an error.
pub fn load_many<A: Artifact>(text: &str) -> Result<Vec<A>> {
    let table: toml::Table = text.parse().map_err(|source| Error::Malformed {
        kind: A::KIND,
        source,
    })?;
    let mut loaded = Vec::with_capacity(table.len());
    for (key, value) in table {
        match A::from_value(value) {
            Ok(artifact) => loaded.push(artifact),
            Err(e) => tracing::warn!("skipping unparsable {} entry `{}`: {}", A::KIND, key, e),
        }
    }
    Ok(loaded)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hex_key_roundtrip_negative() {
        assert_eq!((-16i64).to_hex(), "-10");
        assert_eq!(i64::from_hex("-10").unwrap(), -16);
        assert_eq!(0x400000u64.to_hex(), "400000");
    }

    #[test]
    fn test_expect_integer_nested() {
        let table: toml::Table = "[metadata]\naddr = 16\n".parse().unwrap();
        assert!(expect_integer(&table, "metadata.addr").is_ok());

        let table: toml::Table = "[metadata]\naddr = \"x\"\n".parse().unwrap();
        match expect_integer(&table, "metadata.addr") {
            Err(Error::TypeMismatch { field, found, .. }) => {
                assert_eq!(field, "metadata.addr");
                assert_eq!(found, "string");
            }
            other => panic!("unexpected: {other:?}"),
        }

        let table: toml::Table = "name = \"f\"\n".parse().unwrap();
        assert!(matches!(
            expect_integer(&table, "metadata.addr"),
            Err(Error::TypeMismatch { .. })
        ));
    }

    #[test]
    fn test_group_parse() {
        assert_eq!("structs".parse::<ArtifactGroup>().unwrap(), ArtifactGroup::Struct);
        assert!("bogus".parse::<ArtifactGroup>().is_err());
        assert_eq!(ArtifactKind::StackVariable.group(), Some(ArtifactGroup::Function));
    }

    #[test]
    fn test_high_addresses_keep_their_bits() -> Result<()> {
        #[derive(Debug, PartialEq, Serialize, Deserialize)]
        struct Located {
            #[serde(with = "addr")]
            at: u64,
            #[serde(default, with = "opt_addr", skip_serializing_if = "Option::is_none")]
            within: Option<u64>,
            key: ArtifactKey,
        }

        let value = Located {
            at: 0xffffffff81000000,
            within: Some(u64::MAX),
            key: ArtifactKey::Addr(0xffff800000000000),
        };
        let text = toml::to_string(&value)?;
        assert!(text.contains("within = -1"));
        let back: Located = toml::from_str(&text).map_err(|source| Error::Malformed {
            kind: ArtifactKind::Metadata,
            source,
        })?;
        assert_eq!(back, value);
        Ok(())
    }

    #[test]
    fn test_key_display() {
        assert_eq!(ArtifactKey::Addr(0x10).to_string(), "0x10");
        assert_eq!(ArtifactKey::from("foo").to_string(), "foo");
    }
}
