//! Per-open-file staging spool.
//!
//! A `StagingCache` lazily mirrors one remote object into a local temp file
//! and writes it back in full on flush (providers generally disallow in-place
//! overwrite, so every flush is delete-then-upload of the whole object). The
//! spool is disposable scratch space with no durability contract: a process
//! restart loses unflushed writes.
//!
//! State machine: `Empty -> Ready -> (flush) -> Empty`. A failed load leaves
//! `Empty` so a later open can retry; a failed flush leaves `Ready` with the
//! spool intact so a retry can re-attempt the upload.

use crate::drive::DriveCapability;
use crate::error::FsError;
use std::io::SeekFrom;
use std::sync::Arc;
use tempfile::TempPath;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};

/// Where a closed file's bytes live: the single source of truth for the
/// file's content whenever no staging spool supersedes it.
#[derive(Clone)]
pub struct RemoteObjectRef {
    pub drive: Arc<dyn DriveCapability>,
    pub object_id: String,
    pub size: u64,
}

struct Spool {
    file: File,
    // Keeps the temp file alive; dropping it unlinks the spool.
    _path: TempPath,
    len: u64,
}

pub struct StagingCache {
    drive: Arc<dyn DriveCapability>,
    remote: Option<RemoteObjectRef>,
    spool: Option<Spool>,
    // Informational only: flush re-uploads whether or not anything was written.
    dirty: bool,
}

impl StagingCache {
    pub fn new(drive: Arc<dyn DriveCapability>, remote: Option<RemoteObjectRef>) -> Self {
        Self {
            drive,
            remote,
            spool: None,
            dirty: false,
        }
    }

    pub fn is_ready(&self) -> bool {
        self.spool.is_some()
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Length of the staged data, if loaded.
    pub fn staged_len(&self) -> Option<u64> {
        self.spool.as_ref().map(|s| s.len)
    }

    /// Idempotent: populate the spool from the mirrored object, or start
    /// empty for a file that has never been flushed. On download failure the
    /// spool is discarded and the cache stays `Empty` for a later retry.
    pub async fn ensure_loaded(&mut self) -> Result<(), FsError> {
        if self.spool.is_some() {
            return Ok(());
        }
        let tmp = tempfile::Builder::new()
            .prefix("poolfs.")
            .suffix(".spool")
            .tempfile()?;
        let (std_file, path) = tmp.into_parts();
        let mut file = File::from_std(std_file);
        let mut len = 0u64;
        if let Some(remote) = &self.remote {
            remote
                .drive
                .download(&remote.object_id, &mut file)
                .await
                .map_err(FsError::Load)?;
            len = file.seek(SeekFrom::End(0)).await?;
            file.seek(SeekFrom::Start(0)).await?;
        }
        self.spool = Some(Spool {
            file,
            _path: path,
            len,
        });
        Ok(())
    }

    /// Read up to `len` bytes at `offset`; short (or empty) at end of data.
    pub async fn read(&mut self, offset: u64, len: usize) -> Result<Vec<u8>, FsError> {
        let Some(spool) = self.spool.as_mut() else {
            return Err(FsError::NotOpen);
        };
        if offset >= spool.len || len == 0 {
            return Ok(Vec::new());
        }
        let take = len.min((spool.len - offset) as usize);
        let mut buf = vec![0u8; take];
        spool.file.seek(SeekFrom::Start(offset)).await?;
        spool.file.read_exact(&mut buf).await?;
        Ok(buf)
    }

    /// Overwrite/extend in place. Loads the spool first if needed so
    /// unwritten regions are preserved; rejects offsets past the current end
    /// of data rather than filling holes.
    pub async fn write(&mut self, offset: u64, data: &[u8]) -> Result<usize, FsError> {
        self.ensure_loaded().await?;
        let Some(spool) = self.spool.as_mut() else {
            return Err(FsError::NotOpen);
        };
        if offset > spool.len {
            return Err(FsError::OutOfRange {
                offset,
                len: spool.len,
            });
        }
        spool.file.seek(SeekFrom::Start(offset)).await?;
        spool.file.write_all(data).await?;
        spool.len = spool.len.max(offset + data.len() as u64);
        self.dirty = true;
        Ok(data.len())
    }

    /// Replace the remote object with the full spool contents: delete the
    /// previous object (absence counts as deleted), upload, and hand back the
    /// new ref. On upload failure the spool and `Ready` state survive so the
    /// caller can retry. Between the delete and a successful upload the drive
    /// transiently holds no object for this file; that window is accepted.
    pub async fn flush(&mut self) -> Result<RemoteObjectRef, FsError> {
        let Some(spool) = self.spool.as_mut() else {
            return Err(FsError::NotOpen);
        };
        if let Some(prev) = &self.remote {
            prev.drive
                .delete(&prev.object_id)
                .await
                .map_err(FsError::Flush)?;
        }
        spool.file.flush().await?;
        spool.file.seek(SeekFrom::Start(0)).await?;
        let object_id = self
            .drive
            .upload(&mut spool.file)
            .await
            .map_err(FsError::Flush)?;
        let remote = RemoteObjectRef {
            drive: self.drive.clone(),
            object_id,
            size: spool.len,
        };
        self.remote = Some(remote.clone());
        self.dirty = false;
        // Flush completes the spool's life; the next write reloads from the
        // freshly uploaded object.
        self.spool = None;
        Ok(remote)
    }
}
