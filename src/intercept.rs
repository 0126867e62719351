use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;

use crate::backend::InterceptBackend;
use crate::capture::FrameCaptureService;
use crate::context::{HookState, InterceptionContext};
use crate::error::FrameGenError;
use crate::governor::LatencyMode;
use crate::stats::PipelineStats;

const CAPTURE_FAILURE_LOG_INTERVAL: u64 = 60;

/// What the augmentation step did for one present.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PresentOutcome {
    /// The capture path was built (or could not be yet). One-off cost,
    /// kept out of the latency average.
    Setup,
    Captured,
    CaptureFailed,
    /// Worker not running or setup failed for good.
    Idle,
}

/// Runs on the application's render thread for every intercepted present.
///
/// The original present is always invoked exactly once with the caller's
/// arguments and its status is returned untouched, whatever happens here.
pub struct PresentationInterceptHandler<B: InterceptBackend> {
    context: Arc<InterceptionContext>,
    backend: B,
    capture: Mutex<Option<FrameCaptureService<B::Readback>>>,
}

impl<B: InterceptBackend> PresentationInterceptHandler<B> {
    pub fn new(context: Arc<InterceptionContext>, backend: B) -> Self {
        Self {
            context,
            backend,
            capture: Mutex::new(None),
        }
    }

    pub fn context(&self) -> &Arc<InterceptionContext> {
        &self.context
    }

    pub fn on_present<T>(&self, surface: &B::Surface, forward: impl FnOnce() -> T) -> T {
        let context = &*self.context;
        PipelineStats::bump(&context.stats().frames_presented);

        if context.governor().is_passthrough() || context.hook_state().get() == HookState::Failed {
            return forward();
        }

        let started = Instant::now();
        let outcome = self.augment(surface);
        if matches!(outcome, PresentOutcome::Captured | PresentOutcome::CaptureFailed)
            && context.governor().observe_duration(started.elapsed()) == LatencyMode::Passthrough
        {
            self.enter_passthrough();
        }
        context.overlay().on_frame(context.overlay_stats());

        forward()
    }

    fn augment(&self, surface: &B::Surface) -> PresentOutcome {
        let context = &*self.context;
        if !context.worker().is_running() {
            return PresentOutcome::Idle;
        }

        let mut slot = self.capture.lock().unwrap_or_else(PoisonError::into_inner);
        if slot.is_none() {
            let queue = context.queue_capture().get();
            match self.backend.create_readback(surface, queue, context.config()) {
                Ok(readback) => {
                    *slot = Some(FrameCaptureService::new(readback));
                    if !context.hook_state().transition(HookState::Installed, HookState::Active) {
                        tracing::debug!(
                            state = ?context.hook_state().get(),
                            "capture path ready before hook installation finished"
                        );
                    }
                    tracing::info!("capture path ready");
                }
                Err(FrameGenError::NotReady) => {
                    tracing::trace!("capture prerequisites not met yet");
                }
                Err(e) => {
                    context.hook_state().set(HookState::Failed);
                    tracing::error!(error = %e, "could not build capture path, augmentation disabled");
                    return PresentOutcome::Idle;
                }
            }
            return PresentOutcome::Setup;
        }
        let Some(service) = slot.as_mut() else {
            return PresentOutcome::Idle;
        };

        let stats = context.stats();
        match service.capture(surface) {
            Ok(frame) => {
                PipelineStats::bump(&stats.frames_captured);
                if context.frame_queue().push(frame).is_some() {
                    PipelineStats::bump(&stats.queue_overflow_drops);
                }
                PipelineStats::bump(&stats.frames_enqueued);
                PresentOutcome::Captured
            }
            Err(e) => {
                let failures = PipelineStats::bump(&stats.capture_failures);
                if failures % CAPTURE_FAILURE_LOG_INTERVAL == 1 {
                    tracing::warn!(error = %e, failures, "frame capture failed, frame skipped");
                }
                PresentOutcome::CaptureFailed
            }
        }
    }

    /// Passthrough never reverts, so the readback resources can go.
    fn enter_passthrough(&self) {
        self.context.stats().passthrough.store(true, std::sync::atomic::Ordering::Relaxed);
        let released = self
            .capture
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        drop(released);
        let discarded = self.context.frame_queue().clear();
        tracing::info!(discarded, "capture path released");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{ExportableTexture, SurfaceReadback};
    use crate::config::FrameGenConfig;
    use crate::error::FrameGenResult;
    use crate::frame::{CapturedFrame, SurfaceDesc, SurfaceFormat};
    use crate::frame_queue::FrameConsumer;
    use crate::overlay::NoopOverlay;
    use crate::queue_capture::{QueueKind, QueueRef};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    struct MockReadback {
        fail_reads: bool,
    }

    impl SurfaceReadback for MockReadback {
        type Surface = SurfaceDesc;

        fn describe(&mut self, surface: &SurfaceDesc) -> FrameGenResult<SurfaceDesc> {
            Ok(*surface)
        }

        fn reallocate(&mut self, _desc: &SurfaceDesc) -> FrameGenResult<()> {
            Ok(())
        }

        fn read_into(
            &mut self,
            _surface: &SurfaceDesc,
            _desc: &SurfaceDesc,
            dst: &mut [u8],
        ) -> FrameGenResult<Option<Arc<dyn ExportableTexture>>> {
            if self.fail_reads {
                return Err(FrameGenError::CaptureFailed("copy still in flight".into()));
            }
            dst.fill(1);
            Ok(None)
        }
    }

    /// Requires a captured queue, like the D3D12 backend.
    struct MockBackend {
        creations: AtomicUsize,
        fatal: bool,
        fail_reads: bool,
    }

    impl MockBackend {
        fn new() -> Self {
            Self {
                creations: AtomicUsize::new(0),
                fatal: false,
                fail_reads: false,
            }
        }
    }

    impl InterceptBackend for MockBackend {
        type Surface = SurfaceDesc;
        type Readback = MockReadback;

        fn create_readback(
            &self,
            _surface: &SurfaceDesc,
            queue: Option<QueueRef>,
            _config: &FrameGenConfig,
        ) -> FrameGenResult<MockReadback> {
            if self.fatal {
                return Err(FrameGenError::Platform(anyhow::anyhow!("device removed")));
            }
            if queue.is_none() {
                return Err(FrameGenError::NotReady);
            }
            self.creations.fetch_add(1, Ordering::SeqCst);
            Ok(MockReadback {
                fail_reads: self.fail_reads,
            })
        }
    }

    struct Recorder(Arc<Mutex<Vec<u64>>>);

    impl FrameConsumer for Recorder {
        fn process(&mut self, frame: CapturedFrame) {
            self.0.lock().unwrap().push(frame.sequence);
        }
    }

    const SURFACE: SurfaceDesc = SurfaceDesc {
        width: 4,
        height: 4,
        format: SurfaceFormat::Bgra8,
    };

    fn context() -> Arc<InterceptionContext> {
        let context = Arc::new(InterceptionContext::new(
            FrameGenConfig {
                worker_idle_sleep: Duration::from_millis(1),
                ..FrameGenConfig::default()
            },
            Arc::new(NoopOverlay),
        ));
        context.hook_state().set(HookState::Installed);
        context
    }

    fn capture_queue(context: &InterceptionContext, slot: &mut u8) {
        let raw: *mut u8 = slot;
        assert!(context.queue_capture().offer(raw.cast(), || QueueKind::Direct));
    }

    fn wait_for(mut done: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(2);
        while !done() && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(2));
        }
    }

    #[test]
    fn present_status_is_returned_unchanged() {
        let handler = PresentationInterceptHandler::new(context(), MockBackend::new());
        let mut calls = 0;
        let status = handler.on_present(&SURFACE, || {
            calls += 1;
            0x887A_0005_u32 as i32
        });
        assert_eq!(status, 0x887A_0005_u32 as i32);
        assert_eq!(calls, 1);
    }

    #[test]
    fn setup_waits_for_the_submission_queue() {
        let context = context();
        let seen = Arc::new(Mutex::new(Vec::new()));
        context.start_worker(Recorder(Arc::clone(&seen))).unwrap();
        let handler = PresentationInterceptHandler::new(Arc::clone(&context), MockBackend::new());

        handler.on_present(&SURFACE, || ());
        assert_eq!(context.hook_state().get(), HookState::Installed);
        assert_eq!(handler.backend.creations.load(Ordering::SeqCst), 0);

        let mut queue = 0u8;
        capture_queue(&context, &mut queue);
        handler.on_present(&SURFACE, || ());
        assert_eq!(context.hook_state().get(), HookState::Active);
        assert_eq!(handler.backend.creations.load(Ordering::SeqCst), 1);

        for _ in 0..3 {
            handler.on_present(&SURFACE, || ());
        }
        wait_for(|| seen.lock().unwrap().len() == 3);
        assert_eq!(*seen.lock().unwrap(), vec![1, 2, 3]);
        assert_eq!(handler.backend.creations.load(Ordering::SeqCst), 1);
        context.shutdown();

        let stats = context.stats().snapshot();
        assert_eq!(stats.frames_presented, 5);
        assert_eq!(stats.frames_captured, 3);
        // Setup calls stay out of the latency average.
        assert_eq!(context.governor().snapshot().frame_count, 3);
    }

    #[test]
    fn present_during_installation_does_not_jump_to_active() {
        let context = context();
        context.hook_state().set(HookState::Scanning);
        context.start_worker(Recorder(Default::default())).unwrap();
        let mut queue = 0u8;
        capture_queue(&context, &mut queue);
        let handler = PresentationInterceptHandler::new(Arc::clone(&context), MockBackend::new());

        handler.on_present(&SURFACE, || ());
        assert_eq!(handler.backend.creations.load(Ordering::SeqCst), 1);
        assert_eq!(context.hook_state().get(), HookState::Scanning);

        // Installation finishing later does not undo the built capture path.
        context.hook_state().set(HookState::Installed);
        handler.on_present(&SURFACE, || ());
        assert_eq!(context.stats().snapshot().frames_captured, 1);
        context.shutdown();
    }

    #[test]
    fn fatal_setup_error_leaves_calls_unhooked() {
        let context = context();
        context.start_worker(Recorder(Default::default())).unwrap();
        let handler = PresentationInterceptHandler::new(
            Arc::clone(&context),
            MockBackend {
                fatal: true,
                ..MockBackend::new()
            },
        );

        for _ in 0..3 {
            assert_eq!(handler.on_present(&SURFACE, || 7), 7);
        }
        assert_eq!(context.hook_state().get(), HookState::Failed);
        assert_eq!(context.stats().snapshot().frames_captured, 0);
        context.shutdown();
    }

    #[test]
    fn capture_failures_skip_the_frame_only() {
        let context = context();
        context.start_worker(Recorder(Default::default())).unwrap();
        let mut queue = 0u8;
        capture_queue(&context, &mut queue);
        let handler = PresentationInterceptHandler::new(
            Arc::clone(&context),
            MockBackend {
                fail_reads: true,
                ..MockBackend::new()
            },
        );

        for _ in 0..4 {
            handler.on_present(&SURFACE, || ());
        }
        let stats = context.stats().snapshot();
        assert_eq!(stats.capture_failures, 3);
        assert_eq!(stats.frames_enqueued, 0);
        assert_eq!(context.hook_state().get(), HookState::Active);
        context.shutdown();
    }

    #[test]
    fn passthrough_forwards_without_capturing() {
        let context = context();
        context.start_worker(Recorder(Default::default())).unwrap();
        let mut queue = 0u8;
        capture_queue(&context, &mut queue);
        context.governor().observe(1_000.0);
        let handler = PresentationInterceptHandler::new(Arc::clone(&context), MockBackend::new());

        for _ in 0..5 {
            handler.on_present(&SURFACE, || ());
        }
        let stats = context.stats().snapshot();
        assert_eq!(stats.frames_presented, 5);
        assert_eq!(stats.frames_captured, 0);
        assert_eq!(handler.backend.creations.load(Ordering::SeqCst), 0);
        assert_eq!(context.governor().snapshot().frame_count, 1);
        context.shutdown();
    }

    #[test]
    fn idle_worker_means_no_capture() {
        let context = context();
        let mut queue = 0u8;
        capture_queue(&context, &mut queue);
        let handler = PresentationInterceptHandler::new(Arc::clone(&context), MockBackend::new());
        handler.on_present(&SURFACE, || ());
        assert_eq!(handler.backend.creations.load(Ordering::SeqCst), 0);
        assert!(context.frame_queue().is_empty());
    }
}
