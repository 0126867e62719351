//! Frame combination on a secondary compute device.

pub mod kernel;
pub mod processor;
pub mod selection;

use crate::error::FrameGenResult;
use crate::frame::CapturedFrame;

pub use processor::{CrossAcceleratorProcessor, ProcessorState};
pub use selection::{AdapterSummary, ComputePlatform, PlatformChoice};

/// Produces an intermediate frame from two consecutive captures.
pub trait FrameCombiner: Send + 'static {
    fn is_ready(&self) -> bool;

    /// Bring the combiner up. A `false` return means the current frame
    /// should be skipped; callers decide when to try again.
    fn initialize(&mut self) -> bool;

    fn combine(
        &mut self,
        previous: &CapturedFrame,
        current: &CapturedFrame,
        blend_factor: f32,
    ) -> FrameGenResult<CapturedFrame>;
}
