//! Error taxonomy shared by the filesystem core.
//!
//! The transport adapter collapses these onto errno values; inside the core
//! every failure keeps enough context to pick the right one.

use thiserror::Error;

use crate::drive::DriveError;

#[derive(Debug, Error)]
pub enum FsError {
    #[error("entry not found")]
    NotFound,

    #[error("node is not open")]
    NotOpen,

    #[error("not a directory")]
    NotDirectory,

    #[error("is a directory")]
    IsDirectory,

    #[error("entry already exists")]
    AlreadyExists,

    /// No registered drive reported enough free space for the request.
    #[error("no drive with {0} bytes of free space")]
    AllocationFailed(u64),

    /// Download into the staging spool failed; the cache stays empty and a
    /// later open may retry.
    #[error("failed to load remote object: {0}")]
    Load(#[source] DriveError),

    /// The delete-then-upload sequence failed; the staging spool is kept
    /// intact so a retry can re-attempt the upload without local data loss.
    #[error("failed to store remote object: {0}")]
    Flush(#[source] DriveError),

    /// Writes never create sparse holes: an offset past the current end of
    /// staged data is rejected outright.
    #[error("write offset {offset} beyond staged length {len}")]
    OutOfRange { offset: u64, len: u64 },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
