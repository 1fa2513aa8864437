//! First-fit drive allocation.
//!
//! The allocator owns the registered set of drives; registration order is the
//! only priority signal. `select_drive` queries live free space on every call
//! and takes the first drive with enough headroom. It is deliberately not
//! best-fit and makes no reservation, so two nearly-concurrent allocations
//! close to a drive's capacity boundary can both land on it. That gap is
//! documented and locked in by tests rather than hidden.

use crate::drive::DriveCapability;
use crate::error::FsError;
use std::sync::{Arc, Mutex};

#[derive(Default)]
pub struct DriveAllocator {
    drives: Mutex<Vec<Arc<dyn DriveCapability>>>,
}

impl DriveAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a drive. No dedup, no capacity validation.
    pub fn register_drive(&self, drive: Arc<dyn DriveCapability>) {
        self.drives.lock().unwrap().push(drive);
    }

    /// Snapshot of the registered drives in registration order.
    pub fn drives(&self) -> Vec<Arc<dyn DriveCapability>> {
        self.drives.lock().unwrap().clone()
    }

    /// First drive in registration order whose reported free space covers
    /// `bytes_needed`. A failed space query is a soft error: logged, and the
    /// drive is skipped for this call only.
    pub async fn select_drive(
        &self,
        bytes_needed: u64,
    ) -> Result<Arc<dyn DriveCapability>, FsError> {
        for (idx, drive) in self.drives().into_iter().enumerate() {
            match drive.get_space().await {
                Err(e) => {
                    log::error!("drive #{idx}: space query failed, skipping this round: {e}");
                }
                Ok((used, total)) => {
                    if total.saturating_sub(used) >= bytes_needed {
                        return Ok(drive);
                    }
                }
            }
        }
        Err(FsError::AllocationFailed(bytes_needed))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::drive::memory::InMemoryDrive;

    fn drive(used: u64, total: u64) -> Arc<InMemoryDrive> {
        Arc::new(InMemoryDrive::with_space(used, total))
    }

    #[tokio::test]
    async fn test_first_fit_not_best_fit() {
        let a = drive(90, 100);
        let b = drive(0, 100);
        let alloc = DriveAllocator::new();
        alloc.register_drive(a.clone());
        alloc.register_drive(b.clone());

        // A has 10 free: too small for 20, so B wins.
        let sel = alloc.select_drive(20).await.expect("select 20");
        assert!(Arc::ptr_eq(&sel, &(b.clone() as Arc<dyn DriveCapability>)));

        // A qualifies for 5, and B is never reached even though it has more room.
        let sel = alloc.select_drive(5).await.expect("select 5");
        assert!(Arc::ptr_eq(&sel, &(a.clone() as Arc<dyn DriveCapability>)));
    }

    #[tokio::test]
    async fn test_failed_space_query_is_skipped_not_fatal() {
        let a = drive(0, 100);
        let b = drive(0, 100);
        let alloc = DriveAllocator::new();
        alloc.register_drive(a.clone());
        alloc.register_drive(b.clone());

        a.fail_next_space_query();
        let sel = alloc.select_drive(10).await.expect("select");
        assert!(Arc::ptr_eq(&sel, &(b.clone() as Arc<dyn DriveCapability>)));

        // The failure was per-call: A is back in play and first again.
        let sel = alloc.select_drive(10).await.expect("select");
        assert!(Arc::ptr_eq(&sel, &(a as Arc<dyn DriveCapability>)));
    }

    #[tokio::test]
    async fn test_no_drive_qualifies() {
        let alloc = DriveAllocator::new();
        alloc.register_drive(drive(95, 100));
        match alloc.select_drive(50).await {
            Err(FsError::AllocationFailed(n)) => assert_eq!(n, 50),
            Err(e) => panic!("expected AllocationFailed, got {e}"),
            Ok(_) => panic!("expected AllocationFailed, got a drive"),
        }
    }

    #[tokio::test]
    async fn test_empty_allocator_fails() {
        let alloc = DriveAllocator::new();
        assert!(matches!(
            alloc.select_drive(0).await,
            Err(FsError::AllocationFailed(0))
        ));
    }
}
