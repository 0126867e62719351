use std::sync::atomic::{AtomicU8, AtomicU64, Ordering};
use std::time::Duration;

/// Whether interception does any work beyond forwarding the call.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LatencyMode {
    Active,
    /// Augmentation is off for good; calls are forwarded untouched.
    Passthrough,
}

const MODE_ACTIVE: u8 = 0;
const MODE_PASSTHROUGH: u8 = 1;

/// Tracks the cumulative average interception overhead and trips into
/// passthrough once it exceeds the threshold. The transition never
/// reverses.
///
/// Written from the presenting thread only; every field is atomic so
/// diagnostics can read it from anywhere.
#[derive(Debug)]
pub struct LatencyGovernor {
    threshold_ms: f64,
    /// `f64` bits.
    running_average_ms: AtomicU64,
    frame_count: AtomicU64,
    mode: AtomicU8,
}

/// Point-in-time copy of the governor state.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct LatencySnapshot {
    pub running_average_ms: f64,
    pub frame_count: u64,
    pub threshold_ms: f64,
    pub mode: LatencyMode,
}

impl LatencyGovernor {
    pub fn new(threshold_ms: f64) -> Self {
        Self {
            threshold_ms,
            running_average_ms: AtomicU64::new(0f64.to_bits()),
            frame_count: AtomicU64::new(0),
            mode: AtomicU8::new(MODE_ACTIVE),
        }
    }

    #[inline]
    pub fn mode(&self) -> LatencyMode {
        match self.mode.load(Ordering::Acquire) {
            MODE_PASSTHROUGH => LatencyMode::Passthrough,
            _ => LatencyMode::Active,
        }
    }

    #[inline]
    pub fn is_passthrough(&self) -> bool {
        self.mode() == LatencyMode::Passthrough
    }

    pub fn observe_duration(&self, elapsed: Duration) -> LatencyMode {
        self.observe(elapsed.as_secs_f64() * 1000.0)
    }

    /// Fold one frame's overhead into the running average and return the
    /// resulting mode.
    pub fn observe(&self, frame_time_ms: f64) -> LatencyMode {
        let count = self.frame_count.load(Ordering::Relaxed);
        let average = f64::from_bits(self.running_average_ms.load(Ordering::Relaxed));
        let updated = (average * count as f64 + frame_time_ms) / (count as f64 + 1.0);

        self.running_average_ms
            .store(updated.to_bits(), Ordering::Relaxed);
        self.frame_count.store(count + 1, Ordering::Relaxed);

        if updated > self.threshold_ms
            && self
                .mode
                .compare_exchange(
                    MODE_ACTIVE,
                    MODE_PASSTHROUGH,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                )
                .is_ok()
        {
            tracing::warn!(
                average_ms = updated,
                threshold_ms = self.threshold_ms,
                frames = count + 1,
                "interception overhead over budget, switching to passthrough"
            );
        }
        self.mode()
    }

    pub fn snapshot(&self) -> LatencySnapshot {
        LatencySnapshot {
            running_average_ms: f64::from_bits(self.running_average_ms.load(Ordering::Relaxed)),
            frame_count: self.frame_count.load(Ordering::Relaxed),
            threshold_ms: self.threshold_ms,
            mode: self.mode(),
        }
    }
}
