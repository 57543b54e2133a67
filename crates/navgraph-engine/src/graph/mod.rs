//! Navigation graph storage and pathfinding.
//!
//! The `GraphStore` holds validated, indexed navigation trees and the
//! parent/child relations between nested trees. The `Pathfinder` computes
//! shortest hop sequences over them, crossing tree boundaries through the
//! mirrored entry nodes of sub-trees.

pub mod pathfinder;
pub mod store;

pub use pathfinder::{PathHop, Pathfinder};
pub use store::{GraphStore, IndexedTree, TreeHandle, MAX_NESTING_DEPTH};
