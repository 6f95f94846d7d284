//! Concrete artifact types.

mod comment;
mod function;
mod patch;
mod stack_variable;
mod structure;

pub use comment::Comment;
pub use function::{Function, FunctionArgument, FunctionHeader};
pub use patch::Patch;
pub use stack_variable::{StackOffsetType, StackVariable};
pub use structure::{Struct, StructMember};
