//! Readback row conversion into tightly packed 4-byte pixels.

use std::sync::OnceLock;

use half::f16;

use crate::error::{FrameGenError, FrameGenResult};
use crate::frame::SurfaceFormat;

/// Convert a linear-light value in [0, 1] to an sRGB-encoded byte.
///
/// IEC 61966-2-1 inverse transfer function: linear segment below
/// 0.0031308, 1/2.4 power curve above.
pub(crate) fn linear_to_srgb_u8(v: f32) -> u8 {
    let c = v.clamp(0.0, 1.0);
    let srgb = if c <= 0.003_130_8 {
        c * 12.92
    } else {
        1.055 * c.powf(1.0 / 2.4) - 0.055
    };
    (srgb * 255.0 + 0.5).floor().clamp(0.0, 255.0) as u8
}

/// Every binary16 bit pattern mapped to its sRGB byte, so a half-float
/// channel costs one table load.
fn f16_to_srgb_lut() -> &'static [u8] {
    static LUT: OnceLock<Vec<u8>> = OnceLock::new();
    LUT.get_or_init(|| {
        (0..=u16::MAX)
            .map(|bits| linear_to_srgb_u8(f16::from_bits(bits).to_f32()))
            .collect()
    })
}

fn convert_f16_row(src: &[u8], dst: &mut [u8]) {
    let lut = f16_to_srgb_lut();
    for (px_in, px_out) in src.chunks_exact(8).zip(dst.chunks_exact_mut(4)) {
        let channel = |i: usize| u16::from_le_bytes([px_in[i * 2], px_in[i * 2 + 1]]);
        px_out[0] = lut[channel(0) as usize];
        px_out[1] = lut[channel(1) as usize];
        px_out[2] = lut[channel(2) as usize];
        let alpha = f16::from_bits(channel(3)).to_f32().clamp(0.0, 1.0);
        px_out[3] = (alpha * 255.0 + 0.5) as u8;
    }
}

/// Copy `height` rows of `width` pixels out of a pitched readback buffer
/// into `dst`, converting half-float surfaces to sRGB RGBA8 on the way.
pub(crate) fn copy_surface_rows(
    format: SurfaceFormat,
    src: &[u8],
    src_pitch: usize,
    dst: &mut [u8],
    width: usize,
    height: usize,
) -> FrameGenResult<()> {
    let src_row = width
        .checked_mul(format.bytes_per_pixel())
        .ok_or(FrameGenError::BufferOverflow)?;
    let dst_row = width.checked_mul(4).ok_or(FrameGenError::BufferOverflow)?;
    if src_pitch < src_row {
        return Err(FrameGenError::CaptureFailed(format!(
            "row pitch {src_pitch} is smaller than a {src_row}-byte row"
        )));
    }
    let src_needed = src_pitch
        .checked_mul(height.saturating_sub(1))
        .and_then(|base| base.checked_add(src_row))
        .ok_or(FrameGenError::BufferOverflow)?;
    let dst_needed = dst_row
        .checked_mul(height)
        .ok_or(FrameGenError::BufferOverflow)?;
    if height > 0 && src.len() < src_needed {
        return Err(FrameGenError::CaptureFailed(format!(
            "readback holds {} bytes, need {src_needed}",
            src.len()
        )));
    }
    if dst.len() < dst_needed {
        return Err(FrameGenError::BufferOverflow);
    }

    for y in 0..height {
        let src_line = &src[y * src_pitch..y * src_pitch + src_row];
        let dst_line = &mut dst[y * dst_row..(y + 1) * dst_row];
        match format {
            SurfaceFormat::Rgba8 | SurfaceFormat::Bgra8 => dst_line.copy_from_slice(src_line),
            SurfaceFormat::Rgba16Float => convert_f16_row(src_line, dst_line),
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn srgb_endpoints() {
        assert_eq!(linear_to_srgb_u8(0.0), 0);
        assert_eq!(linear_to_srgb_u8(1.0), 255);
        assert_eq!(linear_to_srgb_u8(4.0), 255);
        assert_eq!(linear_to_srgb_u8(-1.0), 0);
        // Linear mid-grey lands well above 128 in sRGB.
        assert_eq!(linear_to_srgb_u8(0.5), 188);
    }

    #[test]
    fn pitched_rows_are_packed_tightly() -> FrameGenResult<()> {
        // 2x2 pixels, 12-byte pitch (4 padding bytes per row).
        let src: Vec<u8> = vec![
            1, 2, 3, 4, 5, 6, 7, 8, 0xEE, 0xEE, 0xEE, 0xEE, //
            9, 10, 11, 12, 13, 14, 15, 16, 0xEE, 0xEE, 0xEE, 0xEE,
        ];
        let mut dst = vec![0u8; 16];
        copy_surface_rows(SurfaceFormat::Bgra8, &src, 12, &mut dst, 2, 2)?;
        assert_eq!(dst, (1..=16).collect::<Vec<u8>>());
        Ok(())
    }

    #[test]
    fn last_row_may_omit_padding() -> FrameGenResult<()> {
        let src: Vec<u8> = vec![1, 2, 3, 4, 0, 0, 0, 0, 5, 6, 7, 8];
        let mut dst = vec![0u8; 8];
        copy_surface_rows(SurfaceFormat::Rgba8, &src, 8, &mut dst, 1, 2)?;
        assert_eq!(dst, vec![1, 2, 3, 4, 5, 6, 7, 8]);
        Ok(())
    }

    #[test]
    fn half_float_pixels_become_srgb_bytes() -> FrameGenResult<()> {
        let mut src = Vec::new();
        for value in [1.0f32, 0.0, 0.5, 1.0] {
            src.extend_from_slice(&f16::from_f32(value).to_bits().to_le_bytes());
        }
        let mut dst = vec![0u8; 4];
        copy_surface_rows(SurfaceFormat::Rgba16Float, &src, 8, &mut dst, 1, 1)?;
        assert_eq!(dst, vec![255, 0, 188, 255]);
        Ok(())
    }

    #[test]
    fn short_source_is_rejected() {
        let src = vec![0u8; 7];
        let mut dst = vec![0u8; 8];
        assert!(matches!(
            copy_surface_rows(SurfaceFormat::Rgba8, &src, 4, &mut dst, 1, 2),
            Err(FrameGenError::CaptureFailed(_))
        ));
    }
}
