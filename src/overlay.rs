//! Read-only feed for a diagnostic overlay.
//!
//! The overlay itself lives outside this crate. Sinks receive the captured
//! queue once and a by-value statistics snapshot per presented frame, so
//! nothing handed to them can reach back into the pipeline.

use std::sync::atomic::{AtomicBool, Ordering};

use crate::governor::LatencyMode;
use crate::queue_capture::QueueRef;

/// Per-frame numbers shown by an overlay.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct OverlayStats {
    pub frame_count: u64,
    pub running_latency_ms: f64,
    pub threshold_ms: f64,
    pub mode: LatencyMode,
    pub frames_interpolated: u64,
}

pub trait OverlaySink: Send + Sync {
    fn on_queue_captured(&self, queue: QueueRef);

    /// Called on the presenting thread; implementations must return quickly.
    fn on_frame(&self, stats: OverlayStats);
}

#[derive(Debug, Default)]
pub struct NoopOverlay;

impl OverlaySink for NoopOverlay {
    fn on_queue_captured(&self, _queue: QueueRef) {}

    fn on_frame(&self, _stats: OverlayStats) {}
}

/// Writes the overlay line to the log every `interval` frames.
#[derive(Debug)]
pub struct LogOverlay {
    interval: u64,
    queue_seen: AtomicBool,
}

impl LogOverlay {
    pub const DEFAULT_INTERVAL: u64 = 60;

    pub fn new(interval: u64) -> Self {
        Self {
            interval: interval.max(1),
            queue_seen: AtomicBool::new(false),
        }
    }

    pub fn queue_seen(&self) -> bool {
        self.queue_seen.load(Ordering::Acquire)
    }

    pub(crate) fn should_log(&self, frame_count: u64) -> bool {
        frame_count > 0 && frame_count % self.interval == 0
    }
}

impl Default for LogOverlay {
    fn default() -> Self {
        Self::new(Self::DEFAULT_INTERVAL)
    }
}

impl OverlaySink for LogOverlay {
    fn on_queue_captured(&self, queue: QueueRef) {
        self.queue_seen.store(true, Ordering::Release);
        tracing::info!(queue = ?queue.as_raw(), "overlay attached to command queue");
    }

    fn on_frame(&self, stats: OverlayStats) {
        if !self.should_log(stats.frame_count) {
            return;
        }
        tracing::info!(
            frames = stats.frame_count,
            latency_ms = format_args!("{:.2}", stats.running_latency_ms),
            threshold_ms = stats.threshold_ms,
            mode = ?stats.mode,
            interpolated = stats.frames_interpolated,
            "frame generation status"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_overlay_fires_on_interval_boundaries() {
        let overlay = LogOverlay::default();
        assert!(!overlay.should_log(0));
        assert!(!overlay.should_log(59));
        assert!(overlay.should_log(60));
        assert!(overlay.should_log(120));
        assert!(!overlay.should_log(121));
    }

    #[test]
    fn zero_interval_is_clamped() {
        let overlay = LogOverlay::new(0);
        assert!(overlay.should_log(1));
    }

    #[test]
    fn queue_notification_is_recorded() {
        let overlay = LogOverlay::default();
        let mut slot = 0u8;
        let queue = QueueRef::new((&mut slot as *mut u8).cast()).expect("non-null");
        assert!(!overlay.queue_seen());
        overlay.on_queue_captured(queue);
        assert!(overlay.queue_seen());
    }
}
