//! In-memory drive: quota accounting plus one-shot fault injection.
//!
//! Used for local development and unit tests. The fault switches arm a single
//! failure and clear themselves, which is exactly the shape the transient
//! failure and flush-retry cases need.

use crate::drive::client::{DriveCapability, DriveError};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

#[derive(Default)]
pub struct InMemoryDrive {
    objects: Mutex<HashMap<String, Vec<u8>>>,
    base_used: u64,
    total_bytes: u64,
    next_id: AtomicU64,
    fail_next_download: AtomicBool,
    fail_next_upload: AtomicBool,
    fail_next_space: AtomicBool,
}

impl InMemoryDrive {
    pub fn new(total_bytes: u64) -> Self {
        Self {
            total_bytes,
            ..Self::default()
        }
    }

    /// Drive that reports `used` bytes before any object is stored, for
    /// exercising allocation decisions against preset quotas.
    pub fn with_space(used: u64, total: u64) -> Self {
        Self {
            base_used: used,
            total_bytes: total,
            ..Self::default()
        }
    }

    pub fn fail_next_download(&self) {
        self.fail_next_download.store(true, Ordering::SeqCst);
    }

    pub fn fail_next_upload(&self) {
        self.fail_next_upload.store(true, Ordering::SeqCst);
    }

    pub fn fail_next_space_query(&self) {
        self.fail_next_space.store(true, Ordering::SeqCst);
    }

    pub fn object_count(&self) -> usize {
        self.objects.lock().unwrap().len()
    }
}

#[async_trait]
impl DriveCapability for InMemoryDrive {
    async fn download(
        &self,
        object_id: &str,
        out: &mut (dyn AsyncWrite + Send + Unpin),
    ) -> Result<(), DriveError> {
        if self.fail_next_download.swap(false, Ordering::SeqCst) {
            return Err("injected download failure".into());
        }
        let data = {
            let objects = self.objects.lock().unwrap();
            objects.get(object_id).cloned()
        };
        let Some(data) = data else {
            return Err(format!("no such object: {object_id}").into());
        };
        out.write_all(&data).await?;
        Ok(())
    }

    async fn upload(
        &self,
        source: &mut (dyn AsyncRead + Send + Unpin),
    ) -> Result<String, DriveError> {
        if self.fail_next_upload.swap(false, Ordering::SeqCst) {
            return Err("injected upload failure".into());
        }
        let mut data = Vec::new();
        source.read_to_end(&mut data).await?;
        let object_id = format!("obj-{}", self.next_id.fetch_add(1, Ordering::SeqCst) + 1);
        self.objects.lock().unwrap().insert(object_id.clone(), data);
        Ok(object_id)
    }

    async fn delete(&self, object_id: &str) -> Result<(), DriveError> {
        // absent object: success, so retried flushes stay idempotent
        self.objects.lock().unwrap().remove(object_id);
        Ok(())
    }

    async fn get_space(&self) -> Result<(u64, u64), DriveError> {
        if self.fail_next_space.swap(false, Ordering::SeqCst) {
            return Err("injected space query failure".into());
        }
        let stored: u64 = {
            let objects = self.objects.lock().unwrap();
            objects.values().map(|v| v.len() as u64).sum()
        };
        Ok((self.base_used + stored, self.total_bytes))
    }
}
