//! Directory-backed drive (implements `DriveCapability`).
//!
//! Objects are plain files under a root directory with freshly generated ids,
//! and the quota is a configured cap rather than anything the filesystem
//! enforces. Used by the local mount binary and integration tests in place of
//! a real cloud backend.

use crate::drive::client::{DriveCapability, DriveError};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::{fs, io};

pub struct LocalDirDrive {
    root: PathBuf,
    quota_bytes: u64,
}

impl LocalDirDrive {
    pub fn new<P: AsRef<Path>>(root: P, quota_bytes: u64) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
            quota_bytes,
        }
    }

    fn path_for(&self, object_id: &str) -> PathBuf {
        self.root.join(object_id)
    }

    async fn used_bytes(&self) -> std::io::Result<u64> {
        let mut used = 0u64;
        let mut entries = match fs::read_dir(&self.root).await {
            Ok(e) => e,
            // A drive that has never stored anything has no directory yet.
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e),
        };
        while let Some(entry) = entries.next_entry().await? {
            let meta = entry.metadata().await?;
            if meta.is_file() {
                used += meta.len();
            }
        }
        Ok(used)
    }
}

#[async_trait]
impl DriveCapability for LocalDirDrive {
    async fn download(
        &self,
        object_id: &str,
        out: &mut (dyn io::AsyncWrite + Send + Unpin),
    ) -> Result<(), DriveError> {
        let mut file = fs::File::open(self.path_for(object_id)).await?;
        io::copy(&mut file, out).await?;
        Ok(())
    }

    async fn upload(
        &self,
        source: &mut (dyn io::AsyncRead + Send + Unpin),
    ) -> Result<String, DriveError> {
        fs::create_dir_all(&self.root).await?;
        let object_id = uuid::Uuid::new_v4().simple().to_string();
        let mut file = fs::File::create(self.path_for(&object_id)).await?;
        io::copy(source, &mut file).await?;
        io::AsyncWriteExt::flush(&mut file).await?;
        Ok(object_id)
    }

    async fn delete(&self, object_id: &str) -> Result<(), DriveError> {
        match fs::remove_file(self.path_for(object_id)).await {
            Ok(()) => Ok(()),
            // Already gone counts as deleted.
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Box::new(e)),
        }
    }

    async fn get_space(&self) -> Result<(u64, u64), DriveError> {
        let used = self.used_bytes().await?;
        Ok((used, self.quota_bytes))
    }
}
