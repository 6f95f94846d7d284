//! Loose git objects: `"<kind> <size>\0<data>"`, zlib-compressed, named by
//! the SHA-1 of the uncompressed bytes.

use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use gix_object::Kind;
use sha1::{Digest, Sha1};

use crate::error::{Error, Result};

/// Git object SHA-1 identifier (40 hex characters)
pub type ObjectId = String;

#[derive(Debug, Clone)]
pub struct GitObject {
    pub id: ObjectId,
    pub kind: Kind,
    pub data: Vec<u8>,
}

impl GitObject {
    /// Create a GitObject from raw object data (without header)
    pub fn from_raw(kind: Kind, data: Vec<u8>) -> Self {
        let id = compute_object_id(kind, &data);
        Self { id, kind, data }
    }

    /// Parse the decompressed loose format (with header)
    pub fn from_loose_format(content: &[u8]) -> Result<Self> {
        let null_pos = content
            .iter()
            .position(|&b| b == 0)
            .ok_or_else(|| Error::Git("no null terminator in object header".into()))?;

        let header = std::str::from_utf8(&content[..null_pos])
            .map_err(|_| Error::Git("invalid UTF-8 in object header".into()))?;

        let (kind, size) = header
            .split_once(' ')
            .ok_or_else(|| Error::Git(format!("invalid object header: {header}")))?;

        let kind = match kind {
            "commit" => Kind::Commit,
            "tree" => Kind::Tree,
            "blob" => Kind::Blob,
            "tag" => Kind::Tag,
            other => return Err(Error::Git(format!("unknown object type: {other}"))),
        };

        let data = content[null_pos + 1..].to_vec();
        let declared: usize = size
            .parse()
            .map_err(|_| Error::Git(format!("invalid object size: {size}")))?;
        if declared != data.len() {
            return Err(Error::Git(format!(
                "object size mismatch: header says {declared}, found {}",
                data.len()
            )));
        }

        Ok(Self::from_raw(kind, data))
    }

    /// Serialize to loose object format (with header)
    pub fn to_loose_format(&self) -> Vec<u8> {
        let header = format!("{} {}\0", kind_name(self.kind), self.data.len());
        let mut result = header.into_bytes();
        result.extend_from_slice(&self.data);
        result
    }

    /// Fail unless the object is of `kind`.
    pub fn expect_kind(&self, kind: Kind) -> Result<()> {
        if self.kind == kind {
            Ok(())
        } else {
            Err(Error::Git(format!(
                "object {} is a {}, expected a {}",
                self.id,
                kind_name(self.kind),
                kind_name(kind)
            )))
        }
    }
}

fn kind_name(kind: Kind) -> &'static str {
    match kind {
        Kind::Commit => "commit",
        Kind::Tree => "tree",
        Kind::Blob => "blob",
        Kind::Tag => "tag",
    }
}

/// Compute Git SHA-1 object ID from object type and data
fn compute_object_id(kind: Kind, data: &[u8]) -> ObjectId {
    let header = format!("{} {}\0", kind_name(kind), data.len());
    let mut hasher = Sha1::new();
    hasher.update(header.as_bytes());
    hasher.update(data);
    hex::encode(hasher.finalize())
}

/// Path of a loose object below `objects_dir`: `ab/cdef123...`
pub fn loose_object_path(objects_dir: &Path, id: &str) -> Result<PathBuf> {
    if id.len() != 40 || !id.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(Error::Git(format!("invalid object id: {id}")));
    }
    let (dir, file) = id.split_at(2);
    Ok(objects_dir.join(dir).join(file))
}

/// Read a loose object from filesystem path
pub fn read_loose_object(path: &Path) -> Result<GitObject> {
    let file = std::fs::File::open(path).map_err(|e| match e.kind() {
        std::io::ErrorKind::NotFound => Error::not_found(format!("git object {}", path.display())),
        _ => Error::Io(e),
    })?;
    let mut decoder = flate2::read::ZlibDecoder::new(file);
    let mut content = Vec::new();
    decoder.read_to_end(&mut content)?;

    GitObject::from_loose_format(&content)
}

/// Write a loose object below `objects_dir` unless it already exists.
pub fn write_loose_object(obj: &GitObject, objects_dir: &Path) -> Result<PathBuf> {
    let obj_path = loose_object_path(objects_dir, &obj.id)?;
    if obj_path.exists() {
        return Ok(obj_path);
    }
    let obj_dir = obj_path
        .parent()
        .ok_or_else(|| Error::Git(format!("bad object path {}", obj_path.display())))?;
    std::fs::create_dir_all(obj_dir)?;

    // Write under a temporary name so readers never see a partial object.
    let mut tmp = tempfile::NamedTempFile::new_in(obj_dir)?;
    {
        let mut encoder =
            flate2::write::ZlibEncoder::new(tmp.as_file_mut(), flate2::Compression::default());
        encoder.write_all(&obj.to_loose_format())?;
        encoder.finish()?;
    }
    tmp.persist(&obj_path).map_err(|e| Error::Io(e.error))?;

    Ok(obj_path)
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;

    #[test]
    fn test_compute_object_id() {
        // Known blob: "test\n" -> SHA-1: 9daeafb9864cf43055ae93beb0afd6c7d144bfa4
        let id = compute_object_id(Kind::Blob, b"test\n");
        assert_eq!(id, "9daeafb9864cf43055ae93beb0afd6c7d144bfa4");
    }

    #[test]
    fn test_empty_tree_id() {
        let obj = GitObject::from_raw(Kind::Tree, Vec::new());
        assert_eq!(obj.id, "4b825dc642cb6eb9a060e54bf8d69288fbee4904");
    }

    #[test]
    fn test_write_then_read() -> Result<()> {
        let temp = TempDir::new()?;
        let obj = GitObject::from_raw(Kind::Blob, b"hello world\n".to_vec());
        let path = write_loose_object(&obj, temp.path())?;
        assert!(path.ends_with(&obj.id[2..]));

        let read = read_loose_object(&path)?;
        assert_eq!(read.id, obj.id);
        assert_eq!(read.data, obj.data);
        assert_eq!(read.kind, Kind::Blob);
        Ok(())
    }

    #[test]
    fn test_size_mismatch_rejected() {
        assert!(GitObject::from_loose_format(b"blob 3\0ab").is_err());
        assert!(GitObject::from_loose_format(b"blob 2").is_err());
    }
}
