//! In-memory merged directory tree

pub mod node;
pub mod tree;

pub use node::{Metadata, Node, NodeKind};
pub use tree::{DirectoryTree, RemoteAction, Resolved};
