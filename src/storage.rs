mod git_tree;
mod index;
mod memory;
mod traits;

pub use git_tree::{GitTreeStore, BRANCH_PREFIX};
pub use index::{Index, IndexOp};
pub use memory::MemoryTreeStore;
pub use traits::{CommitId, TreeReader, TreeStore};
