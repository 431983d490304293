//! NTP-adjusted wall clock
//!
//! Spec.md §5: "NTP sync runs every 30 minutes in a background task; a
//! monotonic `now()` adds the last observed offset." We model the offset as
//! a signed millisecond adjustment applied on top of `SystemTime::now()`.
//! Writes that imprint wall time into signed records (access files,
//! invites) must first check [`Clock::is_synced`] and fail with
//! `NoSyncClock` otherwise (spec.md §4.5 "Write (export-access)"
//! preconditions).

use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::time::{Duration, SystemTime};

/// Default interval between NTP resync attempts.
pub const NTP_RESYNC_INTERVAL: Duration = Duration::from_secs(30 * 60);

/// Shared, thread-safe clock offset. One instance is owned by the process
/// and handed to every pool.
#[derive(Debug, Default)]
pub struct Clock {
    offset_ms: AtomicI64,
    synced: AtomicBool,
}

impl Clock {
    /// A clock that has never observed an NTP offset.
    pub fn unsynced() -> Self {
        Self {
            offset_ms: AtomicI64::new(0),
            synced: AtomicBool::new(false),
        }
    }

    /// Record a freshly observed NTP offset, in milliseconds (server time
    /// minus local time). Marks the clock as synced.
    pub fn record_offset(&self, offset_ms: i64) {
        self.offset_ms.store(offset_ms, Ordering::Release);
        self.synced.store(true, Ordering::Release);
    }

    /// Whether any NTP offset has been observed yet.
    pub fn is_synced(&self) -> bool {
        self.synced.load(Ordering::Acquire)
    }

    /// The current adjusted time. Panics never: falls back to unadjusted
    /// local time when unsynced, but callers that must not do that should
    /// check [`Clock::is_synced`] first and raise `NoSyncClock`.
    pub fn now(&self) -> DateTime<Utc> {
        let offset = self.offset_ms.load(Ordering::Acquire);
        Utc::now() + chrono::Duration::milliseconds(offset)
    }

    /// `now()` expressed as [`SystemTime`], used by snowflake minting.
    pub fn now_system(&self) -> SystemTime {
        self.now().into()
    }
}
