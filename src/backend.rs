use std::sync::Arc;

use crate::config::FrameGenConfig;
use crate::error::FrameGenResult;
use crate::frame::SurfaceDesc;
use crate::queue_capture::QueueRef;

/// Copies the application's current back buffer out of the primary GPU.
///
/// Implementations own the readback and transfer resources; the capture
/// service decides when they must be reallocated.
pub trait SurfaceReadback: Send {
    type Surface: ?Sized;

    /// Resolve the back buffer that is about to be presented.
    fn describe(&mut self, surface: &Self::Surface) -> FrameGenResult<SurfaceDesc>;

    /// (Re)create resources sized for `desc`. Only called when the
    /// described surface differs from the previous one.
    fn reallocate(&mut self, desc: &SurfaceDesc) -> FrameGenResult<()>;

    /// Record the copy of the back buffer and write tightly packed 4-byte
    /// pixels into `dst`. Returns the shareable GPU-side copy, if any.
    ///
    /// The copy is not required to be complete when this returns; pixels in
    /// `dst` may belong to an earlier present unless the implementation
    /// was configured to wait. The returned texture holds the same copy as
    /// the pixels and is not rewritten before the present after next.
    fn read_into(
        &mut self,
        surface: &Self::Surface,
        desc: &SurfaceDesc,
        dst: &mut [u8],
    ) -> FrameGenResult<Option<Arc<dyn ExportableTexture>>>;
}

/// A GPU texture that may be opened by another device through an OS handle.
///
/// The owning device is held by the implementation.
pub trait ExportableTexture: Send + Sync {
    fn desc(&self) -> SurfaceDesc;

    /// Whether the texture was allocated with cross-device share capability.
    fn query_shareable(&self) -> anyhow::Result<bool>;

    fn create_shared_handle(&self) -> anyhow::Result<Box<dyn SharedOsHandle>>;
}

/// An owned OS handle. Dropping it closes the handle.
pub trait SharedOsHandle: Send + Sync {
    fn raw(&self) -> usize;
}

/// Platform glue for the present hook: builds the readback for the device
/// that owns the intercepted swap chain.
pub trait InterceptBackend: Send + Sync {
    type Surface: ?Sized;
    type Readback: SurfaceReadback<Surface = Self::Surface>;

    /// Returns `NotReady` when a prerequisite (such as the submission queue)
    /// has not been observed yet; the caller retries on the next present.
    fn create_readback(
        &self,
        surface: &Self::Surface,
        queue: Option<QueueRef>,
        config: &FrameGenConfig,
    ) -> FrameGenResult<Self::Readback>;
}
