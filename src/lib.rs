#![deny(clippy::mod_module_files)]
//! Versioned, per-user reverse-engineering state stored as git branches.
//!
//! Each analyst's [`State`] (functions, stack variables, comments, structs
//! and patches) is dumped into a tree of TOML records and committed to
//! `refs/heads/binsync/<user>` through a [`TreeStore`].

pub mod activity;
pub mod artifact;
pub mod client;
pub mod config;
pub mod data;
pub mod error;
pub mod git;
pub mod state;
pub mod storage;

pub use artifact::{Artifact, ArtifactGroup, ArtifactKey, ArtifactKind};
pub use client::Client;
pub use config::BinsyncConfig;
pub use error::{Error, Result};
pub use state::{LastPush, Stamp, State};
pub use storage::{GitTreeStore, Index, MemoryTreeStore, TreeReader, TreeStore};
