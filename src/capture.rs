use std::time::Instant;

use crate::backend::SurfaceReadback;
use crate::error::{FrameGenError, FrameGenResult};
use crate::frame::{CapturedFrame, SurfaceDesc, query_qpc_now};

/// Snapshots the surface being presented into an owned [`CapturedFrame`].
///
/// Readback resources are reallocated only when the back buffer's size or
/// format changes. Sequence numbers start at 1 and advance only on
/// successful captures, so a gap always means a frame was lost downstream.
pub struct FrameCaptureService<R: SurfaceReadback> {
    readback: R,
    current: Option<SurfaceDesc>,
    next_sequence: u64,
}

impl<R: SurfaceReadback> FrameCaptureService<R> {
    pub fn new(readback: R) -> Self {
        Self {
            readback,
            current: None,
            next_sequence: 1,
        }
    }

    /// Description of the surface the readback resources are sized for.
    pub fn allocated_for(&self) -> Option<SurfaceDesc> {
        self.current
    }

    pub fn readback(&self) -> &R {
        &self.readback
    }

    pub fn capture(&mut self, surface: &R::Surface) -> FrameGenResult<CapturedFrame> {
        let desc = self.readback.describe(surface).map_err(into_capture_failure)?;

        if self.current != Some(desc) {
            // Forget the old description first so a failed reallocation is
            // retried on the next present.
            self.current = None;
            self.readback
                .reallocate(&desc)
                .map_err(into_capture_failure)?;
            tracing::debug!(
                width = desc.width,
                height = desc.height,
                format = ?desc.format,
                "readback resources allocated"
            );
            self.current = Some(desc);
        }

        let mut frame = CapturedFrame::zeroed(desc.width, desc.height, desc.format.captured_format())?;
        frame.transfer = self
            .readback
            .read_into(surface, &desc, &mut frame.data)
            .map_err(into_capture_failure)?;

        frame.sequence = self.next_sequence;
        self.next_sequence += 1;
        frame.capture_time = Instant::now();
        frame.capture_time_qpc = query_qpc_now();
        Ok(frame)
    }
}

/// Keep typed per-frame errors as they are; wrap platform failures.
fn into_capture_failure(err: FrameGenError) -> FrameGenError {
    match err {
        FrameGenError::Platform(inner) => FrameGenError::CaptureFailed(format!("{inner:#}")),
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::ExportableTexture;
    use crate::frame::{PixelFormat, SurfaceFormat};
    use std::sync::{Arc, Mutex};

    /// The "surface" is just the description the mock should report.
    struct MockReadback {
        reallocations: Arc<Mutex<Vec<SurfaceDesc>>>,
        fail_next_read: bool,
        fill: u8,
    }

    impl MockReadback {
        fn new(reallocations: Arc<Mutex<Vec<SurfaceDesc>>>) -> Self {
            Self {
                reallocations,
                fail_next_read: false,
                fill: 0x7F,
            }
        }
    }

    impl SurfaceReadback for MockReadback {
        type Surface = SurfaceDesc;

        fn describe(&mut self, surface: &SurfaceDesc) -> FrameGenResult<SurfaceDesc> {
            Ok(*surface)
        }

        fn reallocate(&mut self, desc: &SurfaceDesc) -> FrameGenResult<()> {
            self.reallocations.lock().unwrap().push(*desc);
            Ok(())
        }

        fn read_into(
            &mut self,
            _surface: &SurfaceDesc,
            _desc: &SurfaceDesc,
            dst: &mut [u8],
        ) -> FrameGenResult<Option<Arc<dyn ExportableTexture>>> {
            if std::mem::take(&mut self.fail_next_read) {
                return Err(FrameGenError::Platform(anyhow::anyhow!("device removed")));
            }
            dst.fill(self.fill);
            Ok(None)
        }
    }

    fn desc(width: u32, height: u32, format: SurfaceFormat) -> SurfaceDesc {
        SurfaceDesc {
            width,
            height,
            format,
        }
    }

    #[test]
    fn sequence_numbers_increase_by_one() -> FrameGenResult<()> {
        let mut service = FrameCaptureService::new(MockReadback::new(Default::default()));
        let surface = desc(4, 2, SurfaceFormat::Bgra8);
        let sequences: Vec<u64> = (0..5)
            .map(|_| service.capture(&surface).map(|f| f.sequence))
            .collect::<FrameGenResult<_>>()?;
        assert_eq!(sequences, vec![1, 2, 3, 4, 5]);
        Ok(())
    }

    #[test]
    fn failed_capture_does_not_consume_a_sequence_number() -> FrameGenResult<()> {
        let mut service = FrameCaptureService::new(MockReadback::new(Default::default()));
        let surface = desc(4, 2, SurfaceFormat::Rgba8);
        assert_eq!(service.capture(&surface)?.sequence, 1);

        service.readback.fail_next_read = true;
        assert!(matches!(
            service.capture(&surface),
            Err(FrameGenError::CaptureFailed(_))
        ));
        assert_eq!(service.capture(&surface)?.sequence, 2);
        Ok(())
    }

    #[test]
    fn reallocates_only_when_surface_changes() -> FrameGenResult<()> {
        let reallocations = Arc::new(Mutex::new(Vec::new()));
        let mut service = FrameCaptureService::new(MockReadback::new(Arc::clone(&reallocations)));

        let small = desc(4, 4, SurfaceFormat::Bgra8);
        let large = desc(8, 4, SurfaceFormat::Bgra8);
        let hdr = desc(8, 4, SurfaceFormat::Rgba16Float);
        for surface in [small, small, large, large, hdr, hdr, small] {
            service.capture(&surface)?;
        }

        assert_eq!(*reallocations.lock().unwrap(), vec![small, large, hdr, small]);
        assert_eq!(service.allocated_for(), Some(small));
        Ok(())
    }

    #[test]
    fn frame_carries_size_format_and_pixels() -> FrameGenResult<()> {
        let mut service = FrameCaptureService::new(MockReadback::new(Default::default()));
        let frame = service.capture(&desc(3, 2, SurfaceFormat::Rgba16Float))?;
        assert_eq!(frame.dimensions(), (3, 2));
        assert_eq!(frame.format, PixelFormat::Rgba8);
        assert_eq!(frame.data.len(), 3 * 2 * 4);
        assert!(frame.data.iter().all(|&b| b == 0x7F));
        Ok(())
    }
}
