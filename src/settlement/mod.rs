// Self-healing sweeps: recovery of stuck payments and expiry of abandoned ones
pub mod expiry;
pub mod recovery;

pub use expiry::ExpirySweep;
pub use recovery::RecoverySweep;

use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};

/// Result of one sweep pass
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub skipped: bool,
    pub scanned: usize,
    pub transitioned: usize,
    pub failed: usize,
    pub orphans_released: usize,
}

impl SweepReport {
    fn skipped() -> Self {
        Self {
            skipped: true,
            ..Default::default()
        }
    }

    pub fn is_quiet(&self) -> bool {
        self.transitioned == 0 && self.failed == 0 && self.orphans_released == 0
    }
}

/// Held while a sweep pass runs; a second pass finding it taken is skipped
struct RunGuard<'a>(&'a AtomicBool);

impl<'a> RunGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| RunGuard(flag))
    }
}

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}
