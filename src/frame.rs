use std::sync::Arc;
use std::time::Instant;

use crate::backend::ExportableTexture;
use crate::error::{FrameGenError, FrameGenResult};

/// Channel layout of a captured frame. Both layouts are 4 bytes per pixel
/// with alpha in the last byte, so channel-wise operations treat them alike.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum PixelFormat {
    #[default]
    Rgba8,
    Bgra8,
}

impl PixelFormat {
    pub const fn bytes_per_pixel(self) -> usize {
        4
    }
}

/// Pixel layout of the application's back buffer as reported by the driver.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SurfaceFormat {
    Rgba8,
    Bgra8,
    /// Scene-linear half floats, converted to sRGB RGBA8 on readback.
    Rgba16Float,
}

impl SurfaceFormat {
    pub const fn bytes_per_pixel(self) -> usize {
        match self {
            Self::Rgba8 | Self::Bgra8 => 4,
            Self::Rgba16Float => 8,
        }
    }

    /// Format of the frame produced when reading back this surface.
    pub const fn captured_format(self) -> PixelFormat {
        match self {
            Self::Bgra8 => PixelFormat::Bgra8,
            Self::Rgba8 | Self::Rgba16Float => PixelFormat::Rgba8,
        }
    }
}

/// Size and format of a presentable surface. A change in any field forces
/// the readback resources to be reallocated.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SurfaceDesc {
    pub width: u32,
    pub height: u32,
    pub format: SurfaceFormat,
}

/// A snapshot of one presented frame.
///
/// Owned by value once pushed into the frame queue. `transfer` points at
/// the GPU-resident copy that can be exported to a second device.
pub struct CapturedFrame {
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
    /// Strictly increasing per successful capture, starting at 1.
    pub sequence: u64,
    pub capture_time: Instant,
    /// QPC ticks at capture, when available.
    pub capture_time_qpc: Option<i64>,
    pub data: Vec<u8>,
    pub transfer: Option<Arc<dyn ExportableTexture>>,
}

impl CapturedFrame {
    /// Allocate a zeroed frame of the given size. `sequence` is left at 0
    /// until the capture service stamps it.
    pub fn zeroed(width: u32, height: u32, format: PixelFormat) -> FrameGenResult<Self> {
        let len = rgba_len(width, height)?;
        Ok(Self {
            width,
            height,
            format,
            sequence: 0,
            capture_time: Instant::now(),
            capture_time_qpc: None,
            data: vec![0; len],
            transfer: None,
        })
    }

    pub fn from_rgba8(width: u32, height: u32, data: Vec<u8>) -> FrameGenResult<Self> {
        let expected = rgba_len(width, height)?;
        if data.len() != expected {
            return Err(FrameGenError::FrameMismatch(format!(
                "buffer holds {} bytes, {width}x{height} needs {expected}",
                data.len()
            )));
        }
        Ok(Self {
            width,
            height,
            format: PixelFormat::Rgba8,
            sequence: 0,
            capture_time: Instant::now(),
            capture_time_qpc: None,
            data,
            transfer: None,
        })
    }

    pub fn dimensions(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    pub fn pixel_count(&self) -> usize {
        self.width as usize * self.height as usize
    }

    /// Whether two frames can be combined pixel-for-pixel.
    pub fn is_compatible_with(&self, other: &CapturedFrame) -> bool {
        self.dimensions() == other.dimensions()
            && self.format == other.format
            && self.data.len() == other.data.len()
    }
}

impl std::fmt::Debug for CapturedFrame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CapturedFrame")
            .field("width", &self.width)
            .field("height", &self.height)
            .field("format", &self.format)
            .field("sequence", &self.sequence)
            .field("bytes", &self.data.len())
            .field("has_transfer", &self.transfer.is_some())
            .finish()
    }
}

pub(crate) fn rgba_len(width: u32, height: u32) -> FrameGenResult<usize> {
    let width = usize::try_from(width).map_err(|_| FrameGenError::BufferOverflow)?;
    let height = usize::try_from(height).map_err(|_| FrameGenError::BufferOverflow)?;
    width
        .checked_mul(height)
        .and_then(|pixels| pixels.checked_mul(4))
        .ok_or(FrameGenError::BufferOverflow)
}

/// Query the current QPC counter value. Returns `None` on non-Windows
/// or if the call fails.
#[cfg(target_os = "windows")]
pub(crate) fn query_qpc_now() -> Option<i64> {
    use windows::Win32::System::Performance::QueryPerformanceCounter;
    let mut ticks = 0i64;
    let ok = unsafe { QueryPerformanceCounter(&mut ticks) };
    if ok.is_ok() { Some(ticks) } else { None }
}

#[cfg(not(target_os = "windows"))]
pub(crate) fn query_qpc_now() -> Option<i64> {
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rgba_len_rejects_overflow() {
        assert_eq!(rgba_len(2, 3).ok(), Some(24));
        assert!(matches!(
            rgba_len(u32::MAX, u32::MAX),
            Err(FrameGenError::BufferOverflow)
        ));
    }

    #[test]
    fn from_rgba8_validates_length() {
        assert!(CapturedFrame::from_rgba8(2, 2, vec![0; 16]).is_ok());
        assert!(matches!(
            CapturedFrame::from_rgba8(2, 2, vec![0; 15]),
            Err(FrameGenError::FrameMismatch(_))
        ));
    }

    #[test]
    fn compatibility_requires_same_size_and_format() -> FrameGenResult<()> {
        let a = CapturedFrame::zeroed(4, 4, PixelFormat::Rgba8)?;
        let b = CapturedFrame::zeroed(4, 4, PixelFormat::Rgba8)?;
        let c = CapturedFrame::zeroed(4, 4, PixelFormat::Bgra8)?;
        let d = CapturedFrame::zeroed(8, 4, PixelFormat::Rgba8)?;
        assert!(a.is_compatible_with(&b));
        assert!(!a.is_compatible_with(&c));
        assert!(!a.is_compatible_with(&d));
        Ok(())
    }

    #[test]
    fn half_float_surfaces_capture_as_rgba8() {
        assert_eq!(SurfaceFormat::Rgba16Float.captured_format(), PixelFormat::Rgba8);
        assert_eq!(SurfaceFormat::Bgra8.captured_format(), PixelFormat::Bgra8);
        assert_eq!(SurfaceFormat::Rgba16Float.bytes_per_pixel(), 8);
    }
}
