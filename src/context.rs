//! Process-wide interception state.
//!
//! One `InterceptionContext` is built per process and shared by reference
//! with the hook trampolines, the presentation handler and the worker.
//! Everything that crosses threads is atomic or behind a lock.

use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};

use crate::config::FrameGenConfig;
use crate::error::FrameGenResult;
use crate::frame_queue::{FrameConsumer, FrameQueue, ProcessingWorker};
use crate::governor::LatencyGovernor;
use crate::overlay::{OverlaySink, OverlayStats};
use crate::queue_capture::CommandQueueCapture;
use crate::stats::PipelineStats;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum HookState {
    Uninstalled = 0,
    /// Probing dispatch tables.
    Scanning = 1,
    /// Both hooks written, no present seen yet.
    Installed = 2,
    /// The first present built the capture path.
    Active = 3,
    Failed = 4,
}

impl HookState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            1 => HookState::Scanning,
            2 => HookState::Installed,
            3 => HookState::Active,
            4 => HookState::Failed,
            _ => HookState::Uninstalled,
        }
    }
}

#[derive(Debug)]
pub struct HookStateCell(AtomicU8);

impl Default for HookStateCell {
    fn default() -> Self {
        Self(AtomicU8::new(HookState::Uninstalled as u8))
    }
}

impl HookStateCell {
    pub fn get(&self) -> HookState {
        HookState::from_u8(self.0.load(Ordering::Acquire))
    }

    pub fn set(&self, state: HookState) {
        let previous = HookState::from_u8(self.0.swap(state as u8, Ordering::AcqRel));
        if previous != state {
            tracing::debug!(from = ?previous, to = ?state, "hook state changed");
        }
    }

    /// Move from `from` to `to` only if the current state is `from`.
    pub fn transition(&self, from: HookState, to: HookState) -> bool {
        let moved = self
            .0
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        if moved {
            tracing::debug!(from = ?from, to = ?to, "hook state changed");
        }
        moved
    }
}

pub struct InterceptionContext {
    config: FrameGenConfig,
    hook_state: HookStateCell,
    queue_capture: CommandQueueCapture,
    governor: LatencyGovernor,
    stats: Arc<PipelineStats>,
    worker: ProcessingWorker,
    overlay: Arc<dyn OverlaySink>,
}

impl InterceptionContext {
    pub fn new(config: FrameGenConfig, overlay: Arc<dyn OverlaySink>) -> Self {
        let stats = Arc::new(PipelineStats::default());
        let queue = Arc::new(FrameQueue::new(config.queue_capacity));
        let worker = ProcessingWorker::new(queue, Arc::clone(&stats), config.worker_idle_sleep);

        let notify = Arc::clone(&overlay);
        let queue_capture = CommandQueueCapture::with_observer(move |queue| notify.on_queue_captured(queue));

        Self {
            governor: LatencyGovernor::new(config.latency_threshold_ms),
            config,
            hook_state: HookStateCell::default(),
            queue_capture,
            stats,
            worker,
            overlay,
        }
    }

    pub fn config(&self) -> &FrameGenConfig {
        &self.config
    }

    pub fn hook_state(&self) -> &HookStateCell {
        &self.hook_state
    }

    pub fn queue_capture(&self) -> &CommandQueueCapture {
        &self.queue_capture
    }

    pub fn governor(&self) -> &LatencyGovernor {
        &self.governor
    }

    pub fn stats(&self) -> &Arc<PipelineStats> {
        &self.stats
    }

    pub fn frame_queue(&self) -> &Arc<FrameQueue> {
        self.worker.queue()
    }

    pub fn worker(&self) -> &ProcessingWorker {
        &self.worker
    }

    pub fn overlay(&self) -> &dyn OverlaySink {
        self.overlay.as_ref()
    }

    pub fn start_worker<C: FrameConsumer>(&self, consumer: C) -> FrameGenResult<bool> {
        self.worker.start(consumer)
    }

    /// Stop the worker, discarding queued frames. Hooks stay installed.
    pub fn shutdown(&self) -> usize {
        self.worker.stop()
    }

    pub(crate) fn overlay_stats(&self) -> OverlayStats {
        let latency = self.governor.snapshot();
        OverlayStats {
            frame_count: latency.frame_count,
            running_latency_ms: latency.running_average_ms,
            threshold_ms: latency.threshold_ms,
            mode: latency.mode,
            frames_interpolated: self
                .stats
                .frames_interpolated
                .load(Ordering::Relaxed),
        }
    }
}

impl std::fmt::Debug for InterceptionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InterceptionContext")
            .field("hook_state", &self.hook_state.get())
            .field("queue_captured", &self.queue_capture.is_captured())
            .field("mode", &self.governor.mode())
            .field("worker_running", &self.worker.is_running())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::governor::LatencyMode;
    use crate::queue_capture::{QueueKind, QueueRef};
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingOverlay {
        queues: Mutex<Vec<usize>>,
    }

    impl OverlaySink for RecordingOverlay {
        fn on_queue_captured(&self, queue: QueueRef) {
            self.queues.lock().unwrap().push(queue.as_raw() as usize);
        }

        fn on_frame(&self, _stats: OverlayStats) {}
    }

    #[test]
    fn hook_state_transitions_are_conditional() {
        let cell = HookStateCell::default();
        assert_eq!(cell.get(), HookState::Uninstalled);
        assert!(cell.transition(HookState::Uninstalled, HookState::Scanning));
        assert!(!cell.transition(HookState::Uninstalled, HookState::Scanning));
        cell.set(HookState::Installed);
        assert!(cell.transition(HookState::Installed, HookState::Active));
        assert_eq!(cell.get(), HookState::Active);
        cell.set(HookState::Failed);
        assert_eq!(cell.get(), HookState::Failed);
    }

    #[test]
    fn captured_queue_reaches_the_overlay_once() {
        let overlay = Arc::new(RecordingOverlay::default());
        let context = InterceptionContext::new(FrameGenConfig::default(), overlay.clone());

        let mut a = 0u8;
        let mut b = 0u8;
        let pa: *mut u8 = &mut a;
        let pb: *mut u8 = &mut b;
        assert!(context.queue_capture().offer(pa.cast(), || QueueKind::Direct));
        assert!(!context.queue_capture().offer(pb.cast(), || QueueKind::Direct));
        assert_eq!(*overlay.queues.lock().unwrap(), vec![pa as usize]);
    }

    #[test]
    fn overlay_stats_mirror_the_governor() {
        let context = InterceptionContext::new(
            FrameGenConfig::default(),
            Arc::new(crate::overlay::NoopOverlay),
        );
        context.governor().observe(4.0);
        context.governor().observe(8.0);
        let stats = context.overlay_stats();
        assert_eq!(stats.frame_count, 2);
        assert!((stats.running_latency_ms - 6.0).abs() < 1e-9);
        assert_eq!(stats.mode, LatencyMode::Active);
        assert_eq!(stats.threshold_ms, 16.0);
    }
}
