//! Drive backends and the capability contract they implement.
//!
//! Submodules:
//! - `client`: the `DriveCapability` trait every backend satisfies
//! - `localdir`: directory-backed drive for local mounts and integration tests
//! - `memory`: in-memory drive with fault injection for unit tests
//!
//! Real cloud backends (OAuth, vendor SDK calls) live outside this crate and
//! only need to implement `DriveCapability`.

pub mod client;
pub mod localdir;
pub mod memory;

pub use client::{DriveCapability, DriveError};
