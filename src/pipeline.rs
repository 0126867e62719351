use std::sync::Arc;

use crate::accel::FrameCombiner;
use crate::error::FrameGenError;
use crate::frame::CapturedFrame;
use crate::frame_queue::FrameConsumer;
use crate::stats::PipelineStats;
use crate::transfer::FrameTransferBridge;

const INTERPOLATED_LOG_INTERVAL: u64 = 30;
const SKIPPED_LOG_INTERVAL: u64 = 60;

/// Worker-side consumer: exports each frame to the secondary device and
/// blends it with the frame before it.
///
/// The blended frame is not presented anywhere; it is counted and dropped.
pub struct InterpolationStage<C: FrameCombiner> {
    combiner: C,
    bridge: FrameTransferBridge,
    previous: Option<CapturedFrame>,
    blend_factor: f32,
    retry_frames: u64,
    /// Frames left before the next initialization attempt.
    retry_countdown: u64,
    stats: Arc<PipelineStats>,
}

impl<C: FrameCombiner> InterpolationStage<C> {
    pub fn new(combiner: C, blend_factor: f32, retry_frames: u64, stats: Arc<PipelineStats>) -> Self {
        Self {
            combiner,
            bridge: FrameTransferBridge::new(),
            previous: None,
            blend_factor,
            retry_frames,
            retry_countdown: 0,
            stats,
        }
    }

    pub fn combiner(&self) -> &C {
        &self.combiner
    }

    pub fn bridge(&self) -> &FrameTransferBridge {
        &self.bridge
    }

    fn skip(&self, sequence: u64, reason: &FrameGenError) {
        let skipped = PipelineStats::bump(&self.stats.frames_skipped);
        if skipped % SKIPPED_LOG_INTERVAL == 1 {
            tracing::debug!(sequence, skipped, reason = %reason, "frame not interpolated");
        }
    }

    /// Bring the combiner up, honoring the retry back-off.
    fn ensure_ready(&mut self) -> bool {
        if self.combiner.is_ready() {
            return true;
        }
        if self.retry_countdown > 0 {
            self.retry_countdown -= 1;
            return false;
        }
        if self.combiner.initialize() {
            tracing::info!("secondary accelerator ready");
            true
        } else {
            self.retry_countdown = self.retry_frames;
            tracing::warn!(
                retry_in_frames = self.retry_frames,
                "secondary accelerator unavailable, frames pass through unblended"
            );
            false
        }
    }
}

impl<C: FrameCombiner> FrameConsumer for InterpolationStage<C> {
    fn process(&mut self, mut frame: CapturedFrame) {
        // An export failure drops the frame entirely; the previous frame
        // stays as the blend partner for the next one.
        if let Some(texture) = frame.transfer.take() {
            let exported = self.bridge.export(texture.as_ref()).map(|_| ());
            if let Err(e) = exported {
                self.skip(frame.sequence, &e);
                return;
            }
        }

        if !self.ensure_ready() {
            self.skip(frame.sequence, &FrameGenError::NotReady);
            self.previous = Some(frame);
            return;
        }

        if let Some(previous) = self.previous.as_ref() {
            if !previous.is_compatible_with(&frame) {
                let reason = FrameGenError::FrameMismatch(format!(
                    "{}x{} -> {}x{}",
                    previous.width, previous.height, frame.width, frame.height
                ));
                self.skip(frame.sequence, &reason);
            } else {
                match self.combiner.combine(previous, &frame, self.blend_factor) {
                    Ok(blended) => {
                        let interpolated = PipelineStats::bump(&self.stats.frames_interpolated);
                        if interpolated % INTERPOLATED_LOG_INTERVAL == 0 {
                            tracing::debug!(
                                interpolated,
                                from = previous.sequence,
                                to = blended.sequence,
                                "interpolated frame"
                            );
                        }
                    }
                    Err(e) => {
                        PipelineStats::bump(&self.stats.combine_failures);
                        self.skip(frame.sequence, &e);
                    }
                }
            }
        }

        self.previous = Some(frame);
    }

    fn on_stop(&mut self) {
        self.previous = None;
        self.bridge.release();
    }
}
