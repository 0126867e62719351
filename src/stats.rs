use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

/// Live pipeline counters, shared between the presenting thread and the
/// worker. Read them from any thread via [`PipelineStats::snapshot`].
#[derive(Debug, Default)]
pub struct PipelineStats {
    /// Present calls observed, including passthrough ones.
    pub frames_presented: AtomicU64,
    pub frames_captured: AtomicU64,
    pub capture_failures: AtomicU64,
    pub frames_enqueued: AtomicU64,
    /// Oldest frames evicted because the queue was full.
    pub queue_overflow_drops: AtomicU64,
    /// Frames taken off the queue by the worker.
    pub frames_processed: AtomicU64,
    pub frames_interpolated: AtomicU64,
    /// Frames the worker could not combine (export failure, accelerator
    /// not ready, size change).
    pub frames_skipped: AtomicU64,
    pub combine_failures: AtomicU64,
    /// Frames still queued when the worker was stopped.
    pub frames_discarded_at_shutdown: AtomicU64,
    pub passthrough: AtomicBool,
}

impl PipelineStats {
    pub(crate) fn bump(counter: &AtomicU64) -> u64 {
        counter.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn snapshot(&self) -> PipelineStatsSnapshot {
        PipelineStatsSnapshot {
            frames_presented: self.frames_presented.load(Ordering::Relaxed),
            frames_captured: self.frames_captured.load(Ordering::Relaxed),
            capture_failures: self.capture_failures.load(Ordering::Relaxed),
            frames_enqueued: self.frames_enqueued.load(Ordering::Relaxed),
            queue_overflow_drops: self.queue_overflow_drops.load(Ordering::Relaxed),
            frames_processed: self.frames_processed.load(Ordering::Relaxed),
            frames_interpolated: self.frames_interpolated.load(Ordering::Relaxed),
            frames_skipped: self.frames_skipped.load(Ordering::Relaxed),
            combine_failures: self.combine_failures.load(Ordering::Relaxed),
            frames_discarded_at_shutdown: self
                .frames_discarded_at_shutdown
                .load(Ordering::Relaxed),
            passthrough: self.passthrough.load(Ordering::Relaxed),
        }
    }
}

/// A point-in-time copy of [`PipelineStats`].
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PipelineStatsSnapshot {
    pub frames_presented: u64,
    pub frames_captured: u64,
    pub capture_failures: u64,
    pub frames_enqueued: u64,
    pub queue_overflow_drops: u64,
    pub frames_processed: u64,
    pub frames_interpolated: u64,
    pub frames_skipped: u64,
    pub combine_failures: u64,
    pub frames_discarded_at_shutdown: u64,
    pub passthrough: bool,
}
