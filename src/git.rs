//! The slice of git's object model needed to keep one branch per user:
//! loose objects, trees and commits.

pub mod commit;
pub mod objects;
pub mod tree;
