//! The capability contract a remote drive must satisfy.
//!
//! A drive is a quota-bound blob store with an opaque object namespace: the
//! core never interprets object ids, it only hands them back for download and
//! delete. All calls are point-in-time network operations with no retry
//! policy at this layer.

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};

pub type DriveError = Box<dyn std::error::Error + Send + Sync>;

#[async_trait]
pub trait DriveCapability: Send + Sync {
    /// Stream the object named `object_id` into `out`.
    async fn download(
        &self,
        object_id: &str,
        out: &mut (dyn AsyncWrite + Send + Unpin),
    ) -> Result<(), DriveError>;

    /// Store everything readable from `source` as a new object and return the
    /// id the drive assigned to it.
    async fn upload(
        &self,
        source: &mut (dyn AsyncRead + Send + Unpin),
    ) -> Result<String, DriveError>;

    /// Remove an object. Deleting an object that no longer exists must be
    /// reported as success so flush retries stay idempotent.
    async fn delete(&self, object_id: &str) -> Result<(), DriveError>;

    /// Report `(used, total)` bytes against this drive's quota.
    async fn get_space(&self) -> Result<(u64, u64), DriveError>;
}
