//! One user's complete set of artifacts at one version.
//!
//! Every setter compares before it writes: a content-equal value is a no-op
//! that returns `false`. A real change stamps the artifact, propagates the
//! stamp to the owning function, records what was pushed last, and sets the
//! dirty bit, which stays set until the next successful [`State::save`].

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::rc::Rc;

use serde::{Deserialize, Serialize};

use crate::artifact::{self, dump_many, load_many, Artifact, ArtifactGroup, ArtifactKey, ArtifactKind};
use crate::data::{Comment, Function, FunctionHeader, Patch, StackVariable, Struct};
use crate::error::{Error, Result};
use crate::storage::{CommitId, Index, TreeReader, TreeStore};

pub const METADATA_PATH: &str = "metadata.toml";
pub const FUNCTIONS_DIR: &str = "functions/";
pub const STRUCTS_DIR: &str = "structs/";
pub const COMMENTS_PATH: &str = "comments.toml";
pub const PATCHES_PATH: &str = "patches.toml";

/// Whether a setter stamps the artifact with the current time or keeps the
/// `last_change` it already carries (bulk imports from another user).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Stamp {
    #[default]
    Now,
    Preserve,
}

impl Stamp {
    fn apply<A: Artifact>(self, artifact: &mut A) -> Option<i64> {
        if self == Stamp::Now {
            artifact.set_last_change(Some(artifact::now()));
        }
        artifact.last_change()
    }
}

/// The artifact most recently changed through a setter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LastPush {
    pub artifact: ArtifactKey,
    pub group: ArtifactGroup,
    pub time: i64,
}

/// What a setter changed, for timestamp propagation.
enum Touched {
    Function(u64),
    FunctionHeader(u64),
    StackVariable { func_addr: u64 },
    Comment { addr: u64, func_addr: Option<u64> },
    Patch(u64),
    Struct(String),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
struct Metadata {
    user: String,
    version: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    last_push_artifact: Option<ArtifactKey>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    last_push_artifact_type: Option<ArtifactGroup>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    last_push_time: Option<i64>,
}

impl Artifact for Metadata {
    const KIND: ArtifactKind = ArtifactKind::Metadata;
    const REQUIRED_INTEGERS: &'static [&'static str] = &["version"];

    fn last_change(&self) -> Option<i64> {
        self.last_push_time
    }

    fn set_last_change(&mut self, last_change: Option<i64>) {
        self.last_push_time = last_change;
    }
}

#[derive(Clone)]
pub struct State {
    pub user: String,
    pub version: u64,
    functions: BTreeMap<u64, Function>,
    comments: BTreeMap<u64, Comment>,
    structs: BTreeMap<String, Struct>,
    patches: BTreeMap<u64, Patch>,
    last_push: Option<LastPush>,
    dirty: bool,
    /// Persisted entries to delete on the next dump.
    pending_removals: BTreeSet<String>,
    store: Option<Rc<dyn TreeStore>>,
}

impl State {
    pub fn new(user: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            version: 0,
            functions: BTreeMap::new(),
            comments: BTreeMap::new(),
            structs: BTreeMap::new(),
            patches: BTreeMap::new(),
            last_push: None,
            dirty: false,
            pending_removals: BTreeSet::new(),
            store: None,
        }
    }

    /// Attach the store that [`State::save`] commits to.
    pub fn bind(&mut self, store: Rc<dyn TreeStore>) {
        self.store = Some(store);
    }

    pub fn is_bound(&self) -> bool {
        self.store.is_some()
    }

    /// Unsaved changes exist.
    pub fn dirty(&self) -> bool {
        self.dirty
    }

    pub fn last_push(&self) -> Option<&LastPush> {
        self.last_push.as_ref()
    }

    //
    // Setters
    //

    /// Replace a whole function, header and stack variables included.
    pub fn set_function(&mut self, mut func: Function, stamp: Stamp) -> bool {
        let addr = func.addr;
        if self.functions.get(&addr) == Some(&func) {
            return false;
        }
        let ts = stamp.apply(&mut func);
        self.functions.insert(addr, func);
        self.pending_removals.remove(&function_path(addr));
        self.touch(Touched::Function(addr), ts);
        true
    }

    pub fn set_function_header(&mut self, mut header: FunctionHeader, stamp: Stamp) -> bool {
        let addr = header.addr;
        if self.functions.get(&addr).and_then(|f| f.header.as_ref()) == Some(&header) {
            return false;
        }
        let ts = stamp.apply(&mut header);
        self.get_or_create_function(addr).header = Some(header);
        self.touch(Touched::FunctionHeader(addr), ts);
        true
    }

    /// Set a comment. A comment whose address is its function's address
    /// becomes that function's header comment.
    pub fn set_comment(&mut self, mut comment: Comment, stamp: Stamp) -> bool {
        let addr = comment.addr;
        if comment.is_function_header() {
            let current = self.functions.get(&addr).and_then(Function::comment);
            let shadowed = self.comments.contains_key(&addr);
            if current == Some(comment.comment.as_str()) && !shadowed {
                return false;
            }
            // A standalone comment at the same address would hide the header.
            self.comments.remove(&addr);
            let ts = stamp.apply(&mut comment);
            let header = self.get_or_create_function(addr).ensure_header();
            header.comment = Some(comment.comment);
            if ts.is_some() {
                header.last_change = ts;
            }
            self.touch(
                Touched::Comment {
                    addr,
                    func_addr: Some(addr),
                },
                ts,
            );
            return true;
        }

        if self.comments.get(&addr) == Some(&comment) {
            return false;
        }
        let func_addr = comment.func_addr;
        if let Some(func_addr) = func_addr {
            self.get_or_create_function(func_addr);
        }
        let ts = stamp.apply(&mut comment);
        self.comments.insert(addr, comment);
        self.touch(Touched::Comment { addr, func_addr }, ts);
        true
    }

    pub fn set_patch(&mut self, mut patch: Patch, stamp: Stamp) -> bool {
        let offset = patch.offset;
        if self.patches.get(&offset) == Some(&patch) {
            return false;
        }
        let ts = stamp.apply(&mut patch);
        self.patches.insert(offset, patch);
        self.touch(Touched::Patch(offset), ts);
        true
    }

    /// Set a stack variable in the function at `var.func_addr`, creating the
    /// function if needed.
    pub fn set_stack_variable(&mut self, mut var: StackVariable, stamp: Stamp) -> bool {
        let func_addr = var.func_addr;
        let current = self
            .functions
            .get(&func_addr)
            .and_then(|f| f.stack_vars.get(&var.stack_offset));
        if current == Some(&var) {
            return false;
        }
        let ts = stamp.apply(&mut var);
        self.get_or_create_function(func_addr)
            .stack_vars
            .insert(var.stack_offset, var);
        self.touch(Touched::StackVariable { func_addr }, ts);
        true
    }

    /// Insert, rename or delete a struct.
    ///
    /// With `old_name` set to a different name than `new`'s, the old struct
    /// is removed and its record queued for deletion. `new` of `None` with an
    /// `old_name` deletes that struct.
    pub fn set_struct(&mut self, new: Option<Struct>, old_name: Option<&str>, stamp: Stamp) -> bool {
        let mut removed = false;

        let replaced = old_name.filter(|old| new.as_ref().map_or(true, |s| s.name != *old));
        if let Some(old) = replaced {
            if self.structs.remove(old).is_some() {
                self.pending_removals.insert(struct_path(old));
                removed = true;
                if new.is_none() {
                    self.touch(Touched::Struct(old.to_string()), None);
                }
            }
        }

        let Some(mut new) = new else {
            return removed;
        };
        let name = new.name.clone();
        if self.structs.get(&name) == Some(&new) {
            // Renamed onto an identical struct: only the old name went away.
            if removed {
                let ts = self.structs.get(&name).and_then(|s| s.last_change);
                self.touch(Touched::Struct(name), ts);
            }
            return removed;
        }
        let ts = stamp.apply(&mut new);
        self.pending_removals.remove(&struct_path(&name));
        self.structs.insert(name.clone(), new);
        self.touch(Touched::Struct(name), ts);
        true
    }

    pub fn remove_function(&mut self, addr: u64) -> bool {
        if self.functions.remove(&addr).is_none() {
            return false;
        }
        // Comments scoped to the function go with it.
        self.comments.retain(|_, c| c.func_addr != Some(addr));
        self.pending_removals.insert(function_path(addr));
        self.dirty = true;
        true
    }

    /// Remove the standalone comment at `addr`, or else the header comment
    /// of the function at `addr`.
    pub fn remove_comment(&mut self, addr: u64) -> bool {
        if self.comments.remove(&addr).is_some() {
            self.dirty = true;
            return true;
        }
        match self.functions.get_mut(&addr).and_then(|f| f.header.as_mut()) {
            Some(header) if header.comment.is_some() => {
                header.comment = None;
                self.dirty = true;
                true
            }
            _ => false,
        }
    }

    pub fn remove_stack_variable(&mut self, func_addr: u64, stack_offset: i64) -> bool {
        let Some(func) = self.functions.get_mut(&func_addr) else {
            return false;
        };
        if func.stack_vars.remove(&stack_offset).is_none() {
            return false;
        }
        func.last_change = Some(artifact::now());
        self.dirty = true;
        true
    }

    pub fn remove_patch(&mut self, offset: u64) -> bool {
        let removed = self.patches.remove(&offset).is_some();
        self.dirty |= removed;
        removed
    }

    fn get_or_create_function(&mut self, addr: u64) -> &mut Function {
        self.pending_removals.remove(&function_path(addr));
        self.functions.entry(addr).or_insert_with(|| Function::new(addr))
    }

    fn touch(&mut self, touched: Touched, ts: Option<i64>) {
        let (artifact, group, owner) = match touched {
            Touched::Function(addr) => (ArtifactKey::Addr(addr), ArtifactGroup::Function, None),
            Touched::FunctionHeader(addr) => {
                (ArtifactKey::Addr(addr), ArtifactGroup::Function, Some(addr))
            }
            Touched::StackVariable { func_addr } => {
                (ArtifactKey::Addr(func_addr), ArtifactGroup::Function, Some(func_addr))
            }
            Touched::Comment { addr, func_addr } => {
                (ArtifactKey::Addr(addr), ArtifactGroup::Comment, func_addr)
            }
            Touched::Patch(offset) => (ArtifactKey::Addr(offset), ArtifactGroup::Patch, None),
            Touched::Struct(name) => (ArtifactKey::Name(name), ArtifactGroup::Struct, None),
        };

        if let (Some(owner), Some(ts)) = (owner, ts) {
            if let Some(func) = self.functions.get_mut(&owner) {
                func.last_change = Some(ts);
            }
        }

        tracing::debug!("{} {} changed in state of {}", group, artifact, self.user);
        self.last_push = Some(LastPush {
            artifact,
            group,
            time: artifact::now(),
        });
        self.dirty = true;
    }

    //
    // Getters
    //

    pub fn functions(&self) -> &BTreeMap<u64, Function> {
        &self.functions
    }

    pub fn comments(&self) -> &BTreeMap<u64, Comment> {
        &self.comments
    }

    pub fn structs(&self) -> &BTreeMap<String, Struct> {
        &self.structs
    }

    pub fn patches(&self) -> &BTreeMap<u64, Patch> {
        &self.patches
    }

    pub fn get_function(&self, addr: u64) -> Result<&Function> {
        self.functions
            .get(&addr)
            .ok_or_else(|| Error::not_found(format!("function {addr:#x}")))
    }

    pub fn get_function_header(&self, addr: u64) -> Result<&FunctionHeader> {
        self.get_function(addr)?
            .header
            .as_ref()
            .ok_or_else(|| Error::not_found(format!("header of function {addr:#x}")))
    }

    pub fn get_stack_variable(&self, func_addr: u64, stack_offset: i64) -> Result<&StackVariable> {
        self.get_function(func_addr)?
            .stack_vars
            .get(&stack_offset)
            .ok_or_else(|| {
                Error::not_found(format!(
                    "stack variable at offset {stack_offset:#x} in function {func_addr:#x}"
                ))
            })
    }

    pub fn get_stack_variables(&self, func_addr: u64) -> Result<&BTreeMap<i64, StackVariable>> {
        Ok(&self.get_function(func_addr)?.stack_vars)
    }

    /// The standalone comment at `addr`, or else the header comment of the
    /// function at `addr`.
    pub fn get_comment(&self, addr: u64) -> Result<Comment> {
        if let Some(comment) = self.comments.get(&addr) {
            return Ok(comment.clone());
        }
        self.functions
            .get(&addr)
            .and_then(|f| f.header.as_ref())
            .and_then(|header| {
                header
                    .comment
                    .as_ref()
                    .map(|text| header_comment(addr, text, header.last_change))
            })
            .ok_or_else(|| Error::not_found(format!("comment at {addr:#x}")))
    }

    /// The header comment (empty when unset) plus every standalone comment
    /// scoped to the function.
    pub fn get_comments_in_function(&self, func_addr: u64) -> Result<BTreeMap<u64, Comment>> {
        let func = self.get_function(func_addr)?;
        let (text, last_change) = func
            .header
            .as_ref()
            .map(|h| (h.comment.as_deref().unwrap_or_default(), h.last_change))
            .unwrap_or_default();

        let mut comments: BTreeMap<u64, Comment> = self
            .comments
            .values()
            .filter(|c| c.func_addr == Some(func_addr))
            .map(|c| (c.addr, c.clone()))
            .collect();
        comments.insert(func_addr, header_comment(func_addr, text, last_change));
        Ok(comments)
    }

    /// Standalone comments with `start <= addr < end`, in address order.
    pub fn get_comments_in_range(&self, start: u64, end: u64) -> Vec<&Comment> {
        if start >= end {
            return Vec::new();
        }
        self.comments.range(start..end).map(|(_, c)| c).collect()
    }

    pub fn get_patch(&self, offset: u64) -> Result<&Patch> {
        self.patches
            .get(&offset)
            .ok_or_else(|| Error::not_found(format!("patch at {offset:#x}")))
    }

    pub fn get_struct(&self, name: &str) -> Result<&Struct> {
        self.structs
            .get(name)
            .ok_or_else(|| Error::not_found(format!("struct `{name}`")))
    }

    /// The most recently changed artifact of `group` and its timestamp.
    /// Artifacts that were never stamped are not considered.
    pub fn get_last_push_for_artifact_type(&self, group: ArtifactGroup) -> Option<(ArtifactKey, i64)> {
        fn latest<'a, K: 'a, A: Artifact + 'a>(
            items: impl Iterator<Item = (&'a K, &'a A)>,
            key: impl Fn(&K) -> ArtifactKey,
        ) -> Option<(ArtifactKey, i64)> {
            items
                .filter_map(|(k, a)| a.last_change().map(|ts| (k, ts)))
                .max_by_key(|(_, ts)| *ts)
                .map(|(k, ts)| (key(k), ts))
        }

        match group {
            ArtifactGroup::Function => latest(self.functions.iter(), |&a| ArtifactKey::Addr(a)),
            ArtifactGroup::Comment => latest(self.comments.iter(), |&a| ArtifactKey::Addr(a)),
            ArtifactGroup::Patch => latest(self.patches.iter(), |&a| ArtifactKey::Addr(a)),
            ArtifactGroup::Struct => latest(self.structs.iter(), |n: &String| ArtifactKey::Name(n.clone())),
        }
    }

    /// Replace all artifacts with `other`'s. Records that no longer exist are
    /// queued for deletion. Returns whether anything changed.
    pub fn copy_state(&mut self, other: &State) -> bool {
        if *self == *other {
            return false;
        }
        for addr in self.functions.keys().filter(|a| !other.functions.contains_key(a)) {
            self.pending_removals.insert(function_path(*addr));
        }
        for name in self.structs.keys().filter(|n| !other.structs.contains_key(*n)) {
            self.pending_removals.insert(struct_path(name));
        }
        for addr in other.functions.keys() {
            self.pending_removals.remove(&function_path(*addr));
        }
        for name in other.structs.keys() {
            self.pending_removals.remove(&struct_path(name));
        }

        self.functions = other.functions.clone();
        self.comments = other.comments.clone();
        self.structs = other.structs.clone();
        self.patches = other.patches.clone();
        self.dirty = true;
        true
    }

    //
    // Persistence
    //

    /// Stage every record of this state, plus queued deletions, into `index`.
    pub fn dump(&self, index: &mut Index) -> Result<()> {
        self.dump_version(index, self.version)
    }

    fn dump_version(&self, index: &mut Index, version: u64) -> Result<()> {
        let metadata = Metadata {
            user: self.user.clone(),
            version,
            last_push_artifact: self.last_push.as_ref().map(|p| p.artifact.clone()),
            last_push_artifact_type: self.last_push.as_ref().map(|p| p.group),
            last_push_time: self.last_push.as_ref().map(|p| p.time),
        };
        index.write_entry(METADATA_PATH, metadata.dump()?);

        for (addr, func) in &self.functions {
            index.write_entry(function_path(*addr), func.dump()?);
        }
        for (name, s) in &self.structs {
            index.write_entry(struct_path(name), s.dump()?);
        }
        index.write_entry(COMMENTS_PATH, dump_many(&self.comments)?);
        index.write_entry(PATCHES_PATH, dump_many(&self.patches)?);

        for path in &self.pending_removals {
            if index.get(path).is_none() {
                index.remove_entry(path.as_str());
            }
        }
        Ok(())
    }

    /// Commit this state as `version + 1` through the bound store.
    pub fn save(&mut self) -> Result<CommitId> {
        let store = self
            .store
            .clone()
            .ok_or_else(|| Error::Precondition(format!("state of {} is not bound to a repository", self.user)))?;

        let version = self.version + 1;
        let mut index = Index::new();
        self.dump_version(&mut index, version)?;
        let commit = store.commit(index, &format!("Save state of {} (version {})", self.user, version))?;

        tracing::info!("saved state of {} at version {} ({})", self.user, version, commit);
        self.version = version;
        self.dirty = false;
        self.pending_removals.clear();
        Ok(commit)
    }

    /// Rebuild a state from a tree. Only a missing or malformed
    /// `metadata.toml` is fatal; unreadable records are logged and skipped.
    pub fn parse(reader: &dyn TreeReader, version: Option<u64>) -> Result<State> {
        let metadata = match reader.read_entry(METADATA_PATH) {
            Ok(bytes) => Metadata::parse(&entry_text(METADATA_PATH, bytes)?)?,
            Err(Error::NotFound(_)) => return Err(Error::MetadataNotFound),
            Err(e) => return Err(e),
        };

        let mut state = State::new(metadata.user);
        state.version = version.unwrap_or(metadata.version);
        state.last_push = match (
            metadata.last_push_artifact,
            metadata.last_push_artifact_type,
            metadata.last_push_time,
        ) {
            (Some(artifact), Some(group), Some(time)) => Some(LastPush {
                artifact,
                group,
                time,
            }),
            _ => None,
        };

        state.functions = load_records::<Function>(reader, FUNCTIONS_DIR)
            .into_iter()
            .map(|mut func| {
                let addr = func.addr;
                func.stack_vars.retain(|offset, var| {
                    let owned = var.func_addr == addr;
                    if !owned {
                        tracing::warn!(
                            "dropping stack variable {:#x} of function {:#x} claiming function {:#x}",
                            offset,
                            addr,
                            var.func_addr
                        );
                    }
                    owned
                });
                (addr, func)
            })
            .collect();
        state.structs = load_records::<Struct>(reader, STRUCTS_DIR)
            .into_iter()
            .map(|s| (s.name.clone(), s))
            .collect();
        state.comments = load_combined::<Comment>(reader, COMMENTS_PATH)
            .into_iter()
            .map(|c| (c.addr, c))
            .collect();
        state.patches = load_combined::<Patch>(reader, PATCHES_PATH)
            .into_iter()
            .map(|p| (p.offset, p))
            .collect();

        tracing::debug!(
            "parsed state of {} v{}: {} functions, {} comments, {} structs, {} patches",
            state.user,
            state.version,
            state.functions.len(),
            state.comments.len(),
            state.structs.len(),
            state.patches.len()
        );
        Ok(state)
    }
}

impl PartialEq for State {
    fn eq(&self, other: &Self) -> bool {
        self.functions == other.functions
            && self.comments == other.comments
            && self.structs == other.structs
            && self.patches == other.patches
    }
}

impl fmt::Debug for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("State")
            .field("user", &self.user)
            .field("version", &self.version)
            .field("functions", &self.functions.len())
            .field("comments", &self.comments.len())
            .field("structs", &self.structs.len())
            .field("patches", &self.patches.len())
            .field("dirty", &self.dirty)
            .field("bound", &self.store.is_some())
            .finish()
    }
}

fn header_comment(addr: u64, text: &str, last_change: Option<i64>) -> Comment {
    let mut comment = Comment::new(addr, text).in_function(addr);
    comment.last_change = last_change;
    comment
}

pub fn function_path(addr: u64) -> String {
    format!("{FUNCTIONS_DIR}{addr:x}.toml")
}

/// Struct names may contain `/`, which would otherwise start a subtree.
pub fn struct_path(name: &str) -> String {
    let escaped = name.replace('%', "%25").replace('/', "%2F");
    format!("{STRUCTS_DIR}{escaped}.toml")
}

/// Every record under `dir` that reads and parses.
fn load_records<A: Artifact>(reader: &dyn TreeReader, dir: &str) -> Vec<A> {
    let paths = match reader.list_entries(dir) {
        Ok(paths) => paths,
        Err(e) => {
            tracing::warn!("cannot list {}: {}", dir, e);
            return Vec::new();
        }
    };
    paths
        .into_iter()
        .filter_map(|path| {
            let loaded = reader
                .read_entry(&path)
                .and_then(|bytes| A::parse(&entry_text(&path, bytes)?));
            match loaded {
                Ok(record) => Some(record),
                Err(e) => {
                    tracing::warn!("skipping {} record {}: {}", A::KIND, path, e);
                    None
                }
            }
        })
        .collect()
}

fn entry_text(path: &str, bytes: Vec<u8>) -> Result<String> {
    String::from_utf8(bytes).map_err(|source| Error::NotUtf8 {
        path: path.to_string(),
        source,
    })
}

/// Every entry of a combined file that parses. A missing file is empty.
fn load_combined<A: Artifact>(reader: &dyn TreeReader, path: &str) -> Vec<A> {
    let loaded = reader
        .read_entry(path)
        .and_then(|bytes| load_many::<A>(&entry_text(path, bytes)?));
    match loaded {
        Ok(records) => records,
        Err(Error::NotFound(_)) => Vec::new(),
        Err(e) => {
            tracing::warn!("skipping {}: {}", path, e);
            Vec::new()
        }
    }
}
