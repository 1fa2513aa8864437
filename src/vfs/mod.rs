//! Virtual filesystem core: the node tree and the root handler surface.

pub mod fs;
pub mod node;
