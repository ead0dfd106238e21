// Clocks
//
// Time source for commit timestamps and idle eviction, supplied by the
// hosting process.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// Wall clock in microseconds since the Unix epoch.
pub trait MicrosecondClock: Send + Sync {
    fn ticks(&self) -> u64;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl MicrosecondClock for SystemClock {
    fn ticks(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_micros().min(u128::from(u64::MAX)) as u64)
            .unwrap_or(0)
    }
}

/// Clock that only moves when told to.
#[derive(Debug, Default)]
pub struct ManualClock {
    micros: AtomicU64,
}

impl ManualClock {
    pub fn new(micros: u64) -> Self {
        Self {
            micros: AtomicU64::new(micros),
        }
    }

    pub fn set(&self, micros: u64) {
        self.micros.store(micros, Ordering::Release);
    }

    pub fn advance(&self, micros: u64) {
        self.micros.fetch_add(micros, Ordering::AcqRel);
    }
}

impl MicrosecondClock for ManualClock {
    fn ticks(&self) -> u64 {
        self.micros.load(Ordering::Acquire)
    }
}
