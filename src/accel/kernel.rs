//! The frame blend kernel and its CPU reference.
//!
//! Pixels travel as packed little-endian `u32`s (byte 0 in the low bits), so
//! the kernel is agnostic to RGBA versus BGRA channel order. Colour channels
//! are interpolated with round-half-to-even; alpha is written as 0xFF.

use bytemuck::{Pod, Zeroable};

/// Threads per workgroup along each axis.
pub const WORKGROUP_SIZE: u32 = 16;

pub const ENTRY_POINT: &str = "blend_frames";

pub const BLEND_KERNEL_WGSL: &str = r#"
struct BlendParams {
    width: u32,
    height: u32,
    blend: f32,
    _pad: u32,
}

@group(0) @binding(0) var<storage, read>       frame_a: array<u32>;
@group(0) @binding(1) var<storage, read>       frame_b: array<u32>;
@group(0) @binding(2) var<storage, read_write> frame_out: array<u32>;
@group(0) @binding(3) var<uniform>             params: BlendParams;

fn channel(px: u32, shift: u32) -> f32 {
    return f32((px >> shift) & 0xffu);
}

fn mix_channel(a: u32, b: u32, shift: u32, t: f32) -> u32 {
    let v = channel(a, shift) * (1.0 - t) + channel(b, shift) * t;
    return u32(clamp(round(v), 0.0, 255.0)) << shift;
}

@compute @workgroup_size(16, 16, 1)
fn blend_frames(@builtin(global_invocation_id) gid: vec3<u32>) {
    if (gid.x >= params.width || gid.y >= params.height) {
        return;
    }
    let i = gid.y * params.width + gid.x;
    let a = frame_a[i];
    let b = frame_b[i];
    let t = params.blend;
    frame_out[i] = mix_channel(a, b, 0u, t)
                 | mix_channel(a, b, 8u, t)
                 | mix_channel(a, b, 16u, t)
                 | 0xff000000u;
}
"#;

/// Uniform block for `blend_frames`. Padded to 16 bytes.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct BlendParams {
    pub width: u32,
    pub height: u32,
    pub blend: f32,
    pub _pad: u32,
}

impl BlendParams {
    pub fn new(width: u32, height: u32, blend: f32) -> Self {
        Self {
            width,
            height,
            blend,
            _pad: 0,
        }
    }
}

/// Workgroup counts covering a `width` x `height` grid.
pub fn dispatch_size(width: u32, height: u32) -> (u32, u32) {
    (width.div_ceil(WORKGROUP_SIZE), height.div_ceil(WORKGROUP_SIZE))
}

fn mix_channel(a: u8, b: u8, t: f32) -> u8 {
    let v = f32::from(a) * (1.0 - t) + f32::from(b) * t;
    v.round_ties_even().clamp(0.0, 255.0) as u8
}

/// CPU rendition of `blend_frames` over 4-byte pixels. `out` must be at
/// least as long as the shorter input.
pub fn blend_rgba8(a: &[u8], b: &[u8], t: f32, out: &mut [u8]) {
    for ((pa, pb), po) in a
        .chunks_exact(4)
        .zip(b.chunks_exact(4))
        .zip(out.chunks_exact_mut(4))
    {
        po[0] = mix_channel(pa[0], pb[0], t);
        po[1] = mix_channel(pa[1], pb[1], t);
        po[2] = mix_channel(pa[2], pb[2], t);
        po[3] = 0xFF;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn params_match_the_wgsl_uniform_layout() {
        assert_eq!(std::mem::size_of::<BlendParams>(), 16);
        let params = BlendParams::new(3, 5, 0.5);
        let bytes = bytemuck::bytes_of(&params);
        assert_eq!(&bytes[0..4], &3u32.to_le_bytes());
        assert_eq!(&bytes[8..12], &0.5f32.to_le_bytes());
    }

    #[test]
    fn dispatch_covers_partial_tiles() {
        assert_eq!(dispatch_size(1920, 1080), (120, 68));
        assert_eq!(dispatch_size(16, 16), (1, 1));
        assert_eq!(dispatch_size(17, 1), (2, 1));
        assert_eq!(dispatch_size(0, 0), (0, 0));
    }

    #[test]
    fn midpoint_rounds_half_to_even() {
        let mut out = [0u8; 4];
        blend_rgba8(&[0, 0, 1, 7], &[255, 1, 2, 9], 0.5, &mut out);
        // 127.5 -> 128, 0.5 -> 0, 1.5 -> 2; alpha is forced opaque.
        assert_eq!(out, [128, 0, 2, 0xFF]);
    }

    #[test]
    fn endpoints_reproduce_inputs_exactly() {
        let a: Vec<u8> = (0..64).map(|i| (i * 7 % 256) as u8).collect();
        let b: Vec<u8> = (0..64).map(|i| (255 - i * 3) as u8).collect();
        let mut out = vec![0u8; 64];

        blend_rgba8(&a, &b, 0.0, &mut out);
        for (px_out, px_a) in out.chunks_exact(4).zip(a.chunks_exact(4)) {
            assert_eq!(&px_out[..3], &px_a[..3]);
            assert_eq!(px_out[3], 0xFF);
        }

        blend_rgba8(&a, &b, 1.0, &mut out);
        for (px_out, px_b) in out.chunks_exact(4).zip(b.chunks_exact(4)) {
            assert_eq!(&px_out[..3], &px_b[..3]);
        }
    }

    #[test]
    fn kernel_source_declares_the_entry_point() {
        assert!(BLEND_KERNEL_WGSL.contains(&format!("fn {ENTRY_POINT}(")));
        assert!(BLEND_KERNEL_WGSL.contains(&format!("@workgroup_size({WORKGROUP_SIZE}, {WORKGROUP_SIZE}, 1)")));
    }
}
