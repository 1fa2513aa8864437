//! Mount helpers for starting/stopping FUSE
//!
//! Notes:
//! - Only supported on Unix-like systems. On Linux we support unprivileged
//!   mount via fusermount3.
//! - These helpers are thin wrappers over rfuse3 raw Session APIs.

use std::path::Path;

use rfuse3::MountOptions;

use crate::vfs::fs::FilesystemRoot;

/// Build default mount options for poolfs.
fn default_mount_options() -> MountOptions {
    let mut mo = MountOptions::default();
    mo.fs_name("poolfs");
    // Keep defaults conservative: no allow_other, require empty mountpoint.
    mo
}

/// Mount a filesystem root at the given empty directory using unprivileged
/// mode when available.
#[cfg(target_os = "linux")]
pub async fn mount_unprivileged(
    fs: FilesystemRoot,
    mount_point: impl AsRef<Path>,
) -> std::io::Result<rfuse3::raw::MountHandle> {
    let opts = default_mount_options();
    let session = rfuse3::raw::Session::new(opts);
    // Prefer unprivileged mount on Linux (requires fusermount3 in PATH)
    session.mount_with_unprivileged(fs, mount_point).await
}

/// Fallback stub for non-Linux targets.
#[cfg(not(target_os = "linux"))]
pub async fn mount_unprivileged(
    _fs: FilesystemRoot,
    _mount_point: impl AsRef<Path>,
) -> std::io::Result<rfuse3::raw::MountHandle> {
    Err(std::io::Error::new(
        std::io::ErrorKind::Unsupported,
        "FUSE mount is only supported on Linux in this build",
    ))
}
