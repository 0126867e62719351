pub mod accel;
pub mod backend;
pub mod capture;
pub mod config;
pub mod context;
#[cfg_attr(not(target_os = "windows"), allow(dead_code))]
pub(crate) mod convert;
pub(crate) mod env_config;
pub mod error;
pub mod frame;
pub mod frame_queue;
pub mod governor;
pub mod hook;
pub mod intercept;
pub mod logging;
pub mod overlay;
pub mod pipeline;
mod platform;
pub mod queue_capture;
pub mod stats;
pub mod transfer;

use config::FrameGenConfig;
use error::FrameGenResult;

pub use accel::{CrossAcceleratorProcessor, FrameCombiner, ProcessorState};
pub use config::AcceleratorVendor;
pub use context::{HookState, InterceptionContext};
pub use error::{FrameGenError, FrameGenErrorClass};
pub use frame::{CapturedFrame, PixelFormat, SurfaceDesc, SurfaceFormat};
pub use governor::{LatencyGovernor, LatencyMode};
pub use logging::{LogLevel, init_logging};
pub use overlay::{LogOverlay, NoopOverlay, OverlaySink, OverlayStats};
pub use stats::{PipelineStats, PipelineStatsSnapshot};

/// Install the presentation hooks into the current process.
///
/// Called automatically from `DllMain` after the configured startup delay;
/// hosts that load the module themselves may call it directly instead.
pub fn activate(config: FrameGenConfig) -> FrameGenResult<()> {
    platform::activate(config)
}

/// Restore the original `Present` and `ExecuteCommandLists` and stop the
/// worker thread.
pub fn deactivate() -> FrameGenResult<()> {
    platform::deactivate()
}
