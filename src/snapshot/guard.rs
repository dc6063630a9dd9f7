//! SnapshotGuard: A simple RAII-style guard to ensure that only one
//! snapshot operation is in progress at a time on a coordinator.
//!
//! When `SnapshotGuard::new` is called, it attempts to acquire exclusive
//! access by atomically setting the flag. If another snapshot is already in
//! progress, it returns an error. When the guard is dropped, the flag is
//! reset automatically.

use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;

use crate::Result;
use crate::SnapshotError;

// Snapshot state guard (RAII mode)
pub(crate) struct SnapshotGuard<'a> {
    flag: &'a AtomicBool,
}

impl<'a> SnapshotGuard<'a> {
    pub(crate) fn new(flag: &'a AtomicBool) -> Result<Self> {
        if flag
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Relaxed)
            .is_err()
        {
            return Err(SnapshotError::AlreadyInProgress.into());
        }

        Ok(Self { flag })
    }
}

impl Drop for SnapshotGuard<'_> {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::Release);
    }
}
