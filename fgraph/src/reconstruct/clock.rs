//! Probe timestamps to wall-clock time
//!
//! Probes stamp events with `bpf_ktime_get_ns`, i.e. `CLOCK_MONOTONIC`. The
//! wall-clock instant of monotonic zero is sampled once at startup.

use chrono::{DateTime, FixedOffset, Local, TimeDelta};

#[derive(Debug, Clone, Copy)]
pub struct BootClock {
    boot: DateTime<FixedOffset>,
}

impl BootClock {
    #[must_use]
    pub fn new() -> Self {
        let now = Local::now().fixed_offset();
        let since_boot = i64::try_from(monotonic_ns()).map_or(TimeDelta::zero(), TimeDelta::nanoseconds);
        Self { boot: now - since_boot }
    }

    /// Clock whose monotonic zero is `boot`
    #[must_use]
    pub fn starting_at(boot: DateTime<FixedOffset>) -> Self {
        Self { boot }
    }

    /// `DD HH:MM:SS.ffff`
    #[must_use]
    pub fn format(&self, time_ns: u64) -> String {
        let at = self.boot + i64::try_from(time_ns).map_or(TimeDelta::zero(), TimeDelta::nanoseconds);
        let tenths_of_ms = at.timestamp_subsec_nanos() / 100_000;
        format!("{}.{tenths_of_ms:04}", at.format("%d %H:%M:%S"))
    }
}

impl Default for BootClock {
    fn default() -> Self {
        Self::new()
    }
}

fn monotonic_ns() -> u64 {
    let mut ts = libc::timespec { tv_sec: 0, tv_nsec: 0 };
    #[allow(unsafe_code)]
    // SAFETY: `ts` is a valid, writable timespec
    let rc = unsafe { libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts) };
    if rc != 0 {
        return 0;
    }
    let secs = u64::try_from(ts.tv_sec).unwrap_or(0);
    let nanos = u64::try_from(ts.tv_nsec).unwrap_or(0);
    secs * 1_000_000_000 + nanos
}

/// Seconds between two probe timestamps
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn seconds_between(earlier: u64, later: u64) -> f64 {
    later.saturating_sub(earlier) as f64 / 1e9
}
