use std::cell::RefCell;
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::rc::Rc;

use gix_object::Kind;

use super::{CommitId, Index, IndexOp, TreeReader, TreeStore};
use crate::error::{Error, Result};
use crate::git::commit::CommitInfo;
use crate::git::objects::{loose_object_path, read_loose_object, write_loose_object, GitObject};
use crate::git::tree::{decode_tree, encode_tree, TreeEntry};

/// Every user's state lives on `refs/heads/binsync/<user>`.
pub const BRANCH_PREFIX: &str = "refs/heads/binsync/";

/// The flattened tree of the branch head: entry path -> blob id.
#[derive(Debug, Default)]
struct Snapshot {
    head: Option<String>,
    blobs: BTreeMap<String, String>,
}

/// One user's branch in a git directory.
///
/// Objects are written loose; the branch ref is moved with a temp-file
/// rename so a crash leaves either the old or the new commit in place.
#[derive(Debug)]
pub struct GitTreeStore {
    git_dir: PathBuf,
    user: String,
    author: String,
    snapshot: RefCell<Option<Rc<Snapshot>>>,
}

impl GitTreeStore {
    /// Create a minimal repository at `path` (worktree with a `.git`
    /// directory) unless one already exists. Returns the git directory.
    pub fn init(path: &Path) -> Result<PathBuf> {
        if let Some(existing) = find_git_dir(path) {
            return Ok(existing);
        }
        let git_dir = path.join(".git");
        fs::create_dir_all(git_dir.join("objects"))?;
        fs::create_dir_all(git_dir.join("refs/heads"))?;
        fs::create_dir_all(git_dir.join("refs/tags"))?;
        fs::write(git_dir.join("HEAD"), "ref: refs/heads/master\n")?;
        fs::write(
            git_dir.join("config"),
            "[core]\n\trepositoryformatversion = 0\n\tfilemode = true\n\tbare = false\n",
        )?;
        tracing::info!("initialized binsync repository in {:?}", git_dir);
        Ok(git_dir)
    }

    /// Open `user`'s branch in the repository at `path` (a worktree or a
    /// bare git directory). The branch need not exist yet.
    pub fn open(path: &Path, user: &str) -> Result<Self> {
        validate_user(user)?;
        let git_dir = find_git_dir(path)
            .ok_or_else(|| Error::Git(format!("{} is not a git repository", path.display())))?;
        Ok(Self {
            git_dir,
            user: user.to_string(),
            author: format!("{user} <{user}@binsync>"),
            snapshot: RefCell::new(None),
        })
    }

    /// Use `email` in the author line of future commits.
    pub fn with_author_email(mut self, email: &str) -> Self {
        self.author = format!("{} <{}>", self.user, email);
        self
    }

    pub fn user(&self) -> &str {
        &self.user
    }

    pub fn git_dir(&self) -> &Path {
        &self.git_dir
    }

    /// Whether this user's branch has at least one commit.
    pub fn exists(&self) -> Result<bool> {
        Ok(self.snapshot()?.head.is_some())
    }

    /// The commit the branch points at, if any.
    pub fn head(&self) -> Result<Option<CommitId>> {
        Ok(self.snapshot()?.head.clone())
    }

    /// Names of all users with a branch in the repository at `path`.
    pub fn users(path: &Path) -> Result<Vec<String>> {
        let git_dir = find_git_dir(path)
            .ok_or_else(|| Error::Git(format!("{} is not a git repository", path.display())))?;
        let mut users = BTreeSet::new();

        let loose = git_dir.join(BRANCH_PREFIX);
        if loose.is_dir() {
            for entry in fs::read_dir(&loose)? {
                let entry = entry?;
                if entry.file_type()?.is_file() {
                    if let Some(name) = entry.file_name().to_str() {
                        if !name.ends_with(".lock") {
                            users.insert(name.to_string());
                        }
                    }
                }
            }
        }

        for (refname, _) in read_packed_refs(&git_dir)? {
            if let Some(user) = refname.strip_prefix(BRANCH_PREFIX) {
                users.insert(user.to_string());
            }
        }

        Ok(users.into_iter().collect())
    }

    fn ref_name(&self) -> String {
        format!("{BRANCH_PREFIX}{}", self.user)
    }

    fn objects_dir(&self) -> PathBuf {
        self.git_dir.join("objects")
    }

    fn resolve_ref(&self) -> Result<Option<String>> {
        let ref_name = self.ref_name();
        match fs::read_to_string(self.git_dir.join(&ref_name)) {
            Ok(content) => return Ok(Some(content.trim().to_string())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        Ok(read_packed_refs(&self.git_dir)?
            .into_iter()
            .find(|(name, _)| *name == ref_name)
            .map(|(_, id)| id))
    }

    fn read_object(&self, id: &str, kind: Kind) -> Result<GitObject> {
        let path = loose_object_path(&self.objects_dir(), id)?;
        let obj = read_loose_object(&path)?;
        obj.expect_kind(kind)?;
        Ok(obj)
    }

    fn write_object(&self, kind: Kind, data: Vec<u8>) -> Result<String> {
        let obj = GitObject::from_raw(kind, data);
        write_loose_object(&obj, &self.objects_dir())?;
        Ok(obj.id)
    }

    fn snapshot(&self) -> Result<Rc<Snapshot>> {
        if let Some(snapshot) = self.snapshot.borrow().as_ref() {
            return Ok(Rc::clone(snapshot));
        }
        let loaded = Rc::new(self.load_snapshot()?);
        *self.snapshot.borrow_mut() = Some(Rc::clone(&loaded));
        Ok(loaded)
    }

    fn load_snapshot(&self) -> Result<Snapshot> {
        let Some(head) = self.resolve_ref()? else {
            return Ok(Snapshot::default());
        };
        let commit = CommitInfo::decode(&self.read_object(&head, Kind::Commit)?.data)?;

        let mut blobs = BTreeMap::new();
        let mut pending = vec![(String::new(), commit.tree)];
        while let Some((prefix, tree_id)) = pending.pop() {
            for entry in decode_tree(&self.read_object(&tree_id, Kind::Tree)?.data)? {
                let path = format!("{prefix}{}", entry.name);
                if entry.is_tree() {
                    pending.push((format!("{path}/"), entry.id));
                } else {
                    blobs.insert(path, entry.id);
                }
            }
        }
        tracing::debug!("loaded {} entries from {} at {}", blobs.len(), self.ref_name(), head);

        Ok(Snapshot {
            head: Some(head),
            blobs,
        })
    }

    /// Write the nested trees for a flat path -> blob map, returning the
    /// root tree id.
    fn write_trees(&self, blobs: &BTreeMap<String, String>) -> Result<String> {
        let mut root = Dir::default();
        for (path, id) in blobs {
            root.insert(path, id)?;
        }
        root.write(self)
    }

    fn update_ref(&self, expected: Option<&str>, new: &str) -> Result<()> {
        if self.resolve_ref()?.as_deref() != expected {
            return Err(Error::Git(format!(
                "{} moved while committing",
                self.ref_name()
            )));
        }
        let ref_path = self.git_dir.join(self.ref_name());
        let ref_dir = ref_path
            .parent()
            .ok_or_else(|| Error::Git(format!("bad ref path {}", ref_path.display())))?;
        fs::create_dir_all(ref_dir)?;

        let mut tmp = tempfile::NamedTempFile::new_in(ref_dir)?;
        writeln!(tmp, "{new}")?;
        tmp.persist(&ref_path).map_err(|e| Error::Io(e.error))?;
        Ok(())
    }
}

impl TreeReader for GitTreeStore {
    fn read_entry(&self, path: &str) -> Result<Vec<u8>> {
        let snapshot = self.snapshot()?;
        let id = snapshot
            .blobs
            .get(path)
            .ok_or_else(|| Error::not_found(format!("entry `{path}` on {}", self.ref_name())))?;
        Ok(self.read_object(id, Kind::Blob)?.data)
    }

    fn list_entries(&self, prefix: &str) -> Result<Vec<String>> {
        Ok(self
            .snapshot()?
            .blobs
            .keys()
            .filter(|path| path.starts_with(prefix))
            .cloned()
            .collect())
    }
}

impl TreeStore for GitTreeStore {
    fn commit(&self, index: Index, message: &str) -> Result<CommitId> {
        let snapshot = self.snapshot()?;
        let mut blobs = snapshot.blobs.clone();
        for (path, op) in index.into_ops() {
            match op {
                IndexOp::Write(content) => {
                    let id = self.write_object(Kind::Blob, content)?;
                    tracing::debug!("staged {} as {}", path, id);
                    blobs.insert(path, id);
                }
                IndexOp::Remove => {
                    blobs.remove(&path);
                }
            }
        }

        let tree = self.write_trees(&blobs)?;
        let info = CommitInfo {
            tree,
            parent: snapshot.head.clone(),
            author: self.author.clone(),
            message: message.to_string(),
        };
        let commit_id = self.write_object(Kind::Commit, info.encode(crate::artifact::now()))?;
        self.update_ref(snapshot.head.as_deref(), &commit_id)?;

        tracing::info!("committed {} to {}", commit_id, self.ref_name());
        *self.snapshot.borrow_mut() = Some(Rc::new(Snapshot {
            head: Some(commit_id.clone()),
            blobs,
        }));
        Ok(commit_id)
    }
}

/// Directory node used while rebuilding trees from flat paths.
#[derive(Debug, Default)]
struct Dir {
    blobs: BTreeMap<String, String>,
    dirs: BTreeMap<String, Dir>,
}

impl Dir {
    fn insert(&mut self, path: &str, id: &str) -> Result<()> {
        match path.split_once('/') {
            Some((dir, rest)) => {
                if self.blobs.contains_key(dir) {
                    return Err(Error::Git(format!("`{dir}` is both a file and a directory")));
                }
                self.dirs.entry(dir.to_string()).or_default().insert(rest, id)
            }
            None => {
                if self.dirs.contains_key(path) {
                    return Err(Error::Git(format!("`{path}` is both a file and a directory")));
                }
                self.blobs.insert(path.to_string(), id.to_string());
                Ok(())
            }
        }
    }

    fn write(&self, store: &GitTreeStore) -> Result<String> {
        let mut entries: Vec<TreeEntry> = self
            .blobs
            .iter()
            .map(|(name, id)| TreeEntry::blob(name.as_str(), id.as_str()))
            .collect();
        for (name, dir) in &self.dirs {
            entries.push(TreeEntry::tree(name.as_str(), dir.write(store)?));
        }
        store.write_object(Kind::Tree, encode_tree(entries)?)
    }
}

/// `path` itself if it is a git directory, else `path/.git`.
fn find_git_dir(path: &Path) -> Option<PathBuf> {
    let dot_git = path.join(".git");
    if dot_git.join("objects").is_dir() {
        Some(dot_git)
    } else if path.join("objects").is_dir() && path.join("HEAD").is_file() {
        Some(path.to_path_buf())
    } else {
        None
    }
}

/// `(refname, object id)` pairs from `packed-refs`, if present.
fn read_packed_refs(git_dir: &Path) -> Result<Vec<(String, String)>> {
    let content = match fs::read_to_string(git_dir.join("packed-refs")) {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };
    Ok(content
        .lines()
        .filter(|line| !line.starts_with('#') && !line.starts_with('^'))
        .filter_map(|line| line.split_once(' '))
        .map(|(id, name)| (name.trim().to_string(), id.to_string()))
        .collect())
}

fn validate_user(user: &str) -> Result<()> {
    let valid = !user.is_empty()
        && user != "."
        && user != ".."
        && !user.ends_with(".lock")
        && !user
            .chars()
            .any(|c| c == '/' || c == '\\' || c.is_whitespace() || c.is_control() || "~^:?*[".contains(c));
    if valid {
        Ok(())
    } else {
        Err(Error::Precondition(format!("`{user}` is not a valid user name")))
    }
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;

    fn store(temp: &TempDir, user: &str) -> Result<GitTreeStore> {
        GitTreeStore::init(temp.path())?;
        GitTreeStore::open(temp.path(), user)
    }

    #[test]
    fn test_empty_branch() -> Result<()> {
        let temp = TempDir::new()?;
        let store = store(&temp, "alice")?;
        assert!(!store.exists()?);
        assert!(store.list_entries("")?.is_empty());
        assert!(matches!(
            store.read_entry("metadata.toml"),
            Err(Error::NotFound(_))
        ));
        Ok(())
    }

    #[test]
    fn test_commit_and_reopen() -> Result<()> {
        let temp = TempDir::new()?;
        let store = store(&temp, "alice")?;

        let mut index = Index::new();
        index.write_entry("metadata.toml", "version = 1\n");
        index.write_entry("functions/401000.toml", "[metadata]\naddr = 4198400\n");
        index.write_entry("structs/foo.toml", "name = \"foo\"\nsize = 8\n");
        let first = store.commit(index, "first")?;

        let mut index = Index::new();
        index.remove_entry("structs/foo.toml");
        index.write_entry("metadata.toml", "version = 2\n");
        let second = store.commit(index, "second")?;
        assert_ne!(first, second);

        // A fresh handle reads everything back from disk.
        let reopened = GitTreeStore::open(temp.path(), "alice")?;
        assert_eq!(reopened.head()?, Some(second.clone()));
        assert_eq!(reopened.read_entry("metadata.toml")?, b"version = 2\n");
        assert_eq!(
            reopened.list_entries("")?,
            vec!["functions/401000.toml", "metadata.toml"]
        );
        assert!(reopened.list_entries("structs/")?.is_empty());

        let head = reopened.read_object(&second, Kind::Commit)?;
        let info = CommitInfo::decode(&head.data)?;
        assert_eq!(info.parent, Some(first));
        assert_eq!(info.author, "alice <alice@binsync>");
        Ok(())
    }

    #[test]
    fn test_users_are_isolated() -> Result<()> {
        let temp = TempDir::new()?;
        let alice = store(&temp, "alice")?;
        let bob = GitTreeStore::open(temp.path(), "bob")?.with_author_email("bob@example.com");

        let mut index = Index::new();
        index.write_entry("metadata.toml", "user = \"alice\"\n");
        alice.commit(index, "alice")?;
        let mut index = Index::new();
        index.write_entry("metadata.toml", "user = \"bob\"\n");
        bob.commit(index, "bob")?;

        assert_eq!(alice.read_entry("metadata.toml")?, b"user = \"alice\"\n");
        assert_eq!(bob.read_entry("metadata.toml")?, b"user = \"bob\"\n");
        assert_eq!(GitTreeStore::users(temp.path())?, vec!["alice", "bob"]);
        Ok(())
    }

    #[test]
    fn test_packed_refs_are_resolved() -> Result<()> {
        let temp = TempDir::new()?;
        let alice = store(&temp, "alice")?;
        let mut index = Index::new();
        index.write_entry("metadata.toml", "version = 1\n");
        let head = alice.commit(index, "first")?;

        // Move the loose ref into packed-refs like `git pack-refs` would.
        let git_dir = alice.git_dir().to_path_buf();
        fs::remove_file(git_dir.join("refs/heads/binsync/alice"))?;
        fs::write(
            git_dir.join("packed-refs"),
            format!("# pack-refs with: peeled fully-peeled sorted\n{head} refs/heads/binsync/alice\n"),
        )?;

        let reopened = GitTreeStore::open(temp.path(), "alice")?;
        assert_eq!(reopened.head()?, Some(head));
        assert_eq!(GitTreeStore::users(temp.path())?, vec!["alice"]);
        Ok(())
    }

    #[test]
    fn test_stale_handle_refuses_to_commit() -> Result<()> {
        let temp = TempDir::new()?;
        let first = store(&temp, "alice")?;
        let second = GitTreeStore::open(temp.path(), "alice")?;
        assert!(!second.exists()?);

        let mut index = Index::new();
        index.write_entry("metadata.toml", "version = 1\n");
        first.commit(index, "first")?;

        let mut index = Index::new();
        index.write_entry("metadata.toml", "version = 1\n");
        assert!(matches!(second.commit(index, "late"), Err(Error::Git(_))));
        Ok(())
    }

    #[test]
    fn test_invalid_user_rejected() -> Result<()> {
        let temp = TempDir::new()?;
        GitTreeStore::init(temp.path())?;
        for bad in ["", "a/b", "..", "x y", "me.lock"] {
            assert!(matches!(
                GitTreeStore::open(temp.path(), bad),
                Err(Error::Precondition(_))
            ));
        }
        Ok(())
    }

    #[test]
    fn test_open_requires_repository() -> Result<()> {
        let temp = TempDir::new()?;
        assert!(matches!(
            GitTreeStore::open(temp.path(), "alice"),
            Err(Error::Git(_))
        ));
        Ok(())
    }
}
