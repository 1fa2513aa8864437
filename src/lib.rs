// Library crate for poolfs: re-export internal modules for the mount binary
// and external embedders.

pub mod alloc;
pub mod drive;
pub mod error;
pub mod fuse;
pub mod staging;
pub mod vfs;
