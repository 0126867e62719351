// Back buffer readback on the application's own D3D12 device.
//
// Every present records one small command list on the application's direct
// queue:
//
//   back buffer PRESENT -> COPY_SOURCE
//   CopyTextureRegion  back buffer -> READBACK buffer (placed footprint)
//   CopyResource       back buffer -> shared transfer texture
//   back buffer COPY_SOURCE -> PRESENT
//
// and signals a private fence. By default the presenting thread never waits
// for the GPU: pixels handed out on a present are the ones copied on the
// previous present, and a present that finds the previous copy unfinished
// is skipped. With `wait_for_copy` the thread blocks on the fence and
// pixels belong to the current present.
//
// Transfer textures alternate between two slots keyed by fence value, so
// the texture returned with a frame holds the same copy as its pixels and
// is not overwritten until the present after next.

use std::ffi::c_void;
use std::mem::ManuallyDrop;
use std::sync::Arc;

use anyhow::Context;
use windows::Win32::Foundation::{CloseHandle, HANDLE, WAIT_OBJECT_0};
use windows::Win32::Graphics::Direct3D12::{
    D3D12_COMMAND_LIST_TYPE_DIRECT, D3D12_FENCE_FLAG_NONE, D3D12_HEAP_FLAG_NONE,
    D3D12_HEAP_FLAG_SHARED, D3D12_HEAP_PROPERTIES, D3D12_HEAP_TYPE_DEFAULT,
    D3D12_HEAP_TYPE_READBACK, D3D12_PLACED_SUBRESOURCE_FOOTPRINT, D3D12_RANGE,
    D3D12_RESOURCE_BARRIER, D3D12_RESOURCE_BARRIER_0, D3D12_RESOURCE_BARRIER_ALL_SUBRESOURCES,
    D3D12_RESOURCE_BARRIER_FLAG_NONE, D3D12_RESOURCE_BARRIER_TYPE_TRANSITION, D3D12_RESOURCE_DESC,
    D3D12_RESOURCE_DIMENSION_BUFFER, D3D12_RESOURCE_DIMENSION_TEXTURE2D, D3D12_RESOURCE_FLAG_NONE,
    D3D12_RESOURCE_STATE_COMMON, D3D12_RESOURCE_STATE_COPY_DEST,
    D3D12_RESOURCE_STATE_COPY_SOURCE, D3D12_RESOURCE_STATE_PRESENT, D3D12_RESOURCE_STATES,
    D3D12_RESOURCE_TRANSITION_BARRIER, D3D12_TEXTURE_COPY_LOCATION, D3D12_TEXTURE_COPY_LOCATION_0,
    D3D12_TEXTURE_COPY_TYPE_PLACED_FOOTPRINT, D3D12_TEXTURE_COPY_TYPE_SUBRESOURCE_INDEX,
    D3D12_TEXTURE_LAYOUT_ROW_MAJOR, D3D12_TEXTURE_LAYOUT_UNKNOWN, ID3D12CommandAllocator,
    ID3D12CommandList, ID3D12CommandQueue, ID3D12Device, ID3D12Fence, ID3D12GraphicsCommandList,
    ID3D12PipelineState, ID3D12Resource,
};
use windows::Win32::Graphics::Dxgi::Common::{
    DXGI_FORMAT, DXGI_FORMAT_B8G8R8A8_UNORM, DXGI_FORMAT_B8G8R8A8_UNORM_SRGB,
    DXGI_FORMAT_R8G8B8A8_UNORM, DXGI_FORMAT_R8G8B8A8_UNORM_SRGB, DXGI_FORMAT_R16G16B16A16_FLOAT,
    DXGI_FORMAT_UNKNOWN, DXGI_SAMPLE_DESC,
};
use windows::Win32::Graphics::Dxgi::{IDXGISwapChain, IDXGISwapChain3};
use windows::Win32::System::Threading::{CreateEventW, WaitForSingleObject};
use windows::core::{Interface, PCWSTR};

use crate::backend::{ExportableTexture, InterceptBackend, SurfaceReadback};
use crate::config::FrameGenConfig;
use crate::convert::copy_surface_rows;
use crate::error::{FrameGenError, FrameGenResult};
use crate::frame::{SurfaceDesc, SurfaceFormat};
use crate::queue_capture::QueueRef;

use super::share::D3D12SharedTexture;

/// Upper bound on any fence wait, so a hung GPU cannot freeze the
/// application's render thread indefinitely.
const FENCE_WAIT_TIMEOUT_MS: u32 = 1_000;

const TRANSFER_SLOTS: usize = 2;

/// Transfer texture slot written by the submission that signals
/// `fence_value`.
fn transfer_slot(fence_value: u64) -> usize {
    (fence_value % TRANSFER_SLOTS as u64) as usize
}

fn surface_format(format: DXGI_FORMAT) -> Option<SurfaceFormat> {
    match format {
        DXGI_FORMAT_R8G8B8A8_UNORM | DXGI_FORMAT_R8G8B8A8_UNORM_SRGB => Some(SurfaceFormat::Rgba8),
        DXGI_FORMAT_B8G8R8A8_UNORM | DXGI_FORMAT_B8G8R8A8_UNORM_SRGB => Some(SurfaceFormat::Bgra8),
        DXGI_FORMAT_R16G16B16A16_FLOAT => Some(SurfaceFormat::Rgba16Float),
        _ => None,
    }
}

fn platform(err: impl Into<anyhow::Error>) -> FrameGenError {
    FrameGenError::Platform(err.into())
}

fn transition(
    resource: &ID3D12Resource,
    before: D3D12_RESOURCE_STATES,
    after: D3D12_RESOURCE_STATES,
) -> D3D12_RESOURCE_BARRIER {
    D3D12_RESOURCE_BARRIER {
        Type: D3D12_RESOURCE_BARRIER_TYPE_TRANSITION,
        Flags: D3D12_RESOURCE_BARRIER_FLAG_NONE,
        Anonymous: D3D12_RESOURCE_BARRIER_0 {
            Transition: ManuallyDrop::new(D3D12_RESOURCE_TRANSITION_BARRIER {
                // Borrowed without AddRef; the barrier never outlives `resource`.
                pResource: unsafe { std::mem::transmute_copy(resource) },
                Subresource: D3D12_RESOURCE_BARRIER_ALL_SUBRESOURCES,
                StateBefore: before,
                StateAfter: after,
            }),
        },
    }
}

/// Builds [`D3D12Readback`]s for intercepted swap chains.
#[derive(Debug, Default)]
pub(crate) struct D3D12Backend;

impl InterceptBackend for D3D12Backend {
    type Surface = IDXGISwapChain;
    type Readback = D3D12Readback;

    fn create_readback(
        &self,
        surface: &IDXGISwapChain,
        queue: Option<QueueRef>,
        config: &FrameGenConfig,
    ) -> FrameGenResult<D3D12Readback> {
        let Some(queue_ref) = queue else {
            return Err(FrameGenError::NotReady);
        };
        let raw = queue_ref.as_raw();
        let queue = unsafe { ID3D12CommandQueue::from_raw_borrowed(&raw) }
            .ok_or(FrameGenError::NotReady)?;

        let swap_chain: IDXGISwapChain3 = surface
            .cast()
            .context("swap chain does not implement IDXGISwapChain3")
            .map_err(platform)?;
        let back_buffer: ID3D12Resource = unsafe { swap_chain.GetBuffer(0) }
            .context("IDXGISwapChain::GetBuffer(0) failed")
            .map_err(platform)?;

        let mut device: Option<ID3D12Device> = None;
        unsafe { back_buffer.GetDevice(&mut device) }
            .context("ID3D12Resource::GetDevice failed")
            .map_err(platform)?;
        let device = device
            .ok_or_else(|| platform(anyhow::anyhow!("back buffer reported no device")))?;

        let mut queue_device: Option<ID3D12Device> = None;
        unsafe { queue.GetDevice(&mut queue_device) }
            .context("ID3D12CommandQueue::GetDevice failed")
            .map_err(platform)?;
        if queue_device.as_ref().map(|d| d.as_raw()) != Some(device.as_raw()) {
            return Err(platform(anyhow::anyhow!(
                "captured command queue belongs to a different device than the swap chain"
            )));
        }

        D3D12Readback::new(device, queue_ref, config.wait_for_copy).map_err(platform)
    }
}

struct FenceEvent(HANDLE);

impl Drop for FenceEvent {
    fn drop(&mut self) {
        let _ = unsafe { CloseHandle(self.0) };
    }
}

struct ReadbackTargets {
    buffer: ID3D12Resource,
    footprint: D3D12_PLACED_SUBRESOURCE_FOOTPRINT,
    total_bytes: u64,
    transfer: [Option<Arc<D3D12SharedTexture>>; TRANSFER_SLOTS],
}

impl ReadbackTargets {
    fn transfer_for(&self, fence_value: u64) -> Option<Arc<dyn ExportableTexture>> {
        self.transfer[transfer_slot(fence_value)]
            .clone()
            .map(|t| t as Arc<dyn ExportableTexture>)
    }
}

pub(crate) struct D3D12Readback {
    device: ID3D12Device,
    /// Borrowed from the application; never released here.
    queue: *mut c_void,
    allocator: ID3D12CommandAllocator,
    list: ID3D12GraphicsCommandList,
    fence: ID3D12Fence,
    event: FenceEvent,
    fence_value: u64,
    wait_for_copy: bool,
    targets: Option<ReadbackTargets>,
    /// Resolved by `describe`, consumed by `read_into` on the same present.
    back_buffer: Option<(ID3D12Resource, D3D12_RESOURCE_DESC)>,
    /// The readback buffer holds a finished copy nobody has read yet.
    pending_pixels: bool,
}

// D3D12 objects are free-threaded, and the readback is only driven from
// whichever thread presents.
unsafe impl Send for D3D12Readback {}

impl D3D12Readback {
    fn new(device: ID3D12Device, queue: QueueRef, wait_for_copy: bool) -> anyhow::Result<Self> {
        let allocator: ID3D12CommandAllocator =
            unsafe { device.CreateCommandAllocator(D3D12_COMMAND_LIST_TYPE_DIRECT) }
                .context("CreateCommandAllocator failed")?;
        let list: ID3D12GraphicsCommandList = unsafe {
            device.CreateCommandList(
                0,
                D3D12_COMMAND_LIST_TYPE_DIRECT,
                &allocator,
                None::<&ID3D12PipelineState>,
            )
        }
        .context("CreateCommandList failed")?;
        // Lists are created open.
        unsafe { list.Close() }.context("ID3D12GraphicsCommandList::Close failed")?;

        let fence: ID3D12Fence = unsafe { device.CreateFence(0, D3D12_FENCE_FLAG_NONE) }
            .context("CreateFence failed")?;
        let event = unsafe { CreateEventW(None, false, false, PCWSTR::null()) }
            .context("CreateEventW failed")?;

        Ok(Self {
            device,
            queue: queue.as_raw(),
            allocator,
            list,
            fence,
            event: FenceEvent(event),
            fence_value: 0,
            wait_for_copy,
            targets: None,
            back_buffer: None,
            pending_pixels: false,
        })
    }

    fn queue(&self) -> FrameGenResult<&ID3D12CommandQueue> {
        // SAFETY: the application keeps its queue alive while it presents.
        unsafe { ID3D12CommandQueue::from_raw_borrowed(&self.queue) }.ok_or(FrameGenError::NotReady)
    }

    fn copy_in_flight(&self) -> bool {
        unsafe { self.fence.GetCompletedValue() } < self.fence_value
    }

    fn wait_for_fence(&self) -> FrameGenResult<()> {
        if !self.copy_in_flight() {
            return Ok(());
        }
        unsafe { self.fence.SetEventOnCompletion(self.fence_value, self.event.0) }
            .context("ID3D12Fence::SetEventOnCompletion failed")
            .map_err(platform)?;
        let waited = unsafe { WaitForSingleObject(self.event.0, FENCE_WAIT_TIMEOUT_MS) };
        if waited != WAIT_OBJECT_0 {
            return Err(FrameGenError::CaptureFailed(format!(
                "readback copy did not finish within {FENCE_WAIT_TIMEOUT_MS} ms"
            )));
        }
        Ok(())
    }

    fn create_targets(
        &self,
        raw_desc: &D3D12_RESOURCE_DESC,
        desc: &SurfaceDesc,
    ) -> anyhow::Result<ReadbackTargets> {
        let mut footprint = D3D12_PLACED_SUBRESOURCE_FOOTPRINT::default();
        let mut total_bytes = 0u64;
        unsafe {
            self.device.GetCopyableFootprints(
                raw_desc,
                0,
                1,
                0,
                Some(&mut footprint as *mut _),
                None,
                None,
                Some(&mut total_bytes as *mut _),
            )
        };

        let buffer_desc = D3D12_RESOURCE_DESC {
            Dimension: D3D12_RESOURCE_DIMENSION_BUFFER,
            Alignment: 0,
            Width: total_bytes,
            Height: 1,
            DepthOrArraySize: 1,
            MipLevels: 1,
            Format: DXGI_FORMAT_UNKNOWN,
            SampleDesc: DXGI_SAMPLE_DESC {
                Count: 1,
                Quality: 0,
            },
            Layout: D3D12_TEXTURE_LAYOUT_ROW_MAJOR,
            Flags: D3D12_RESOURCE_FLAG_NONE,
        };
        let readback_heap = D3D12_HEAP_PROPERTIES {
            Type: D3D12_HEAP_TYPE_READBACK,
            ..Default::default()
        };
        let mut buffer: Option<ID3D12Resource> = None;
        unsafe {
            self.device.CreateCommittedResource(
                &readback_heap,
                D3D12_HEAP_FLAG_NONE,
                &buffer_desc,
                D3D12_RESOURCE_STATE_COPY_DEST,
                None,
                &mut buffer,
            )
        }
        .context("CreateCommittedResource(readback buffer) failed")?;
        let buffer = buffer.context("readback buffer was not returned")?;

        let transfer = std::array::from_fn(|slot| match self.create_transfer_texture(raw_desc, desc) {
            Ok(texture) => Some(Arc::new(texture)),
            Err(e) => {
                tracing::warn!(slot, error = %format!("{e:#}"), "shared transfer texture unavailable, export disabled");
                None
            }
        });

        Ok(ReadbackTargets {
            buffer,
            footprint,
            total_bytes,
            transfer,
        })
    }

    fn create_transfer_texture(
        &self,
        raw_desc: &D3D12_RESOURCE_DESC,
        desc: &SurfaceDesc,
    ) -> anyhow::Result<D3D12SharedTexture> {
        let texture_desc = D3D12_RESOURCE_DESC {
            Dimension: D3D12_RESOURCE_DIMENSION_TEXTURE2D,
            Alignment: 0,
            Width: raw_desc.Width,
            Height: raw_desc.Height,
            DepthOrArraySize: 1,
            MipLevels: 1,
            Format: raw_desc.Format,
            SampleDesc: DXGI_SAMPLE_DESC {
                Count: 1,
                Quality: 0,
            },
            Layout: D3D12_TEXTURE_LAYOUT_UNKNOWN,
            Flags: D3D12_RESOURCE_FLAG_NONE,
        };
        let default_heap = D3D12_HEAP_PROPERTIES {
            Type: D3D12_HEAP_TYPE_DEFAULT,
            ..Default::default()
        };
        let mut texture: Option<ID3D12Resource> = None;
        unsafe {
            self.device.CreateCommittedResource(
                &default_heap,
                D3D12_HEAP_FLAG_SHARED,
                &texture_desc,
                D3D12_RESOURCE_STATE_COMMON,
                None,
                &mut texture,
            )
        }
        .context("CreateCommittedResource(shared transfer texture) failed")?;
        let texture = texture.context("transfer texture was not returned")?;
        Ok(D3D12SharedTexture::new(self.device.clone(), texture, *desc))
    }

    fn record_and_submit(&mut self, back_buffer: &ID3D12Resource) -> FrameGenResult<()> {
        let targets = self.targets.as_ref().ok_or(FrameGenError::NotReady)?;
        let list = &self.list;
        let next = self.fence_value + 1;

        unsafe {
            self.allocator
                .Reset()
                .context("ID3D12CommandAllocator::Reset failed")
                .map_err(platform)?;
            list.Reset(&self.allocator, None::<&ID3D12PipelineState>)
                .context("ID3D12GraphicsCommandList::Reset failed")
                .map_err(platform)?;

            list.ResourceBarrier(&[transition(
                back_buffer,
                D3D12_RESOURCE_STATE_PRESENT,
                D3D12_RESOURCE_STATE_COPY_SOURCE,
            )]);

            let dst = D3D12_TEXTURE_COPY_LOCATION {
                pResource: std::mem::transmute_copy(&targets.buffer),
                Type: D3D12_TEXTURE_COPY_TYPE_PLACED_FOOTPRINT,
                Anonymous: D3D12_TEXTURE_COPY_LOCATION_0 {
                    PlacedFootprint: targets.footprint,
                },
            };
            let src = D3D12_TEXTURE_COPY_LOCATION {
                pResource: std::mem::transmute_copy(back_buffer),
                Type: D3D12_TEXTURE_COPY_TYPE_SUBRESOURCE_INDEX,
                Anonymous: D3D12_TEXTURE_COPY_LOCATION_0 {
                    SubresourceIndex: 0,
                },
            };
            list.CopyTextureRegion(&dst, 0, 0, 0, &src, None);

            if let Some(transfer) = targets.transfer[transfer_slot(next)].as_ref() {
                let shared = transfer.resource();
                list.ResourceBarrier(&[transition(
                    shared,
                    D3D12_RESOURCE_STATE_COMMON,
                    D3D12_RESOURCE_STATE_COPY_DEST,
                )]);
                list.CopyResource(shared, back_buffer);
                list.ResourceBarrier(&[
                    transition(shared, D3D12_RESOURCE_STATE_COPY_DEST, D3D12_RESOURCE_STATE_COMMON),
                ]);
            }

            list.ResourceBarrier(&[transition(
                back_buffer,
                D3D12_RESOURCE_STATE_COPY_SOURCE,
                D3D12_RESOURCE_STATE_PRESENT,
            )]);
            list.Close()
                .context("ID3D12GraphicsCommandList::Close failed")
                .map_err(platform)?;
        }

        let submitted: ID3D12CommandList = self
            .list
            .cast()
            .context("command list cast failed")
            .map_err(platform)?;
        let queue = self.queue()?;
        unsafe {
            queue.ExecuteCommandLists(&[Some(submitted)]);
            queue
                .Signal(&self.fence, next)
                .context("ID3D12CommandQueue::Signal failed")
                .map_err(platform)?;
        }
        self.fence_value = next;
        Ok(())
    }

    /// Transfer texture of the most recently signalled copy.
    fn transfer_for_current(&self) -> Option<Arc<dyn ExportableTexture>> {
        self.targets.as_ref()?.transfer_for(self.fence_value)
    }

    fn read_pixels(&self, desc: &SurfaceDesc, dst: &mut [u8]) -> FrameGenResult<()> {
        let targets = self.targets.as_ref().ok_or(FrameGenError::NotReady)?;
        let read_range = D3D12_RANGE {
            Begin: 0,
            End: targets.total_bytes as usize,
        };
        let mut mapped: *mut c_void = std::ptr::null_mut();
        unsafe {
            targets
                .buffer
                .Map(0, Some(&read_range as *const _), Some(&mut mapped as *mut _))
        }
        .context("ID3D12Resource::Map(readback) failed")
        .map_err(platform)?;
        if mapped.is_null() {
            return Err(FrameGenError::CaptureFailed("readback map returned null".into()));
        }

        // SAFETY: Map succeeded and exposes `total_bytes` bytes until Unmap.
        let src = unsafe {
            std::slice::from_raw_parts(
                (mapped as *const u8).add(targets.footprint.Offset as usize),
                targets.total_bytes as usize - targets.footprint.Offset as usize,
            )
        };
        let result = copy_surface_rows(
            desc.format,
            src,
            targets.footprint.Footprint.RowPitch as usize,
            dst,
            desc.width as usize,
            desc.height as usize,
        );

        let written = D3D12_RANGE { Begin: 0, End: 0 };
        unsafe { targets.buffer.Unmap(0, Some(&written as *const _)) };
        result
    }
}

impl SurfaceReadback for D3D12Readback {
    type Surface = IDXGISwapChain;

    fn describe(&mut self, surface: &IDXGISwapChain) -> FrameGenResult<SurfaceDesc> {
        let swap_chain: IDXGISwapChain3 = surface
            .cast()
            .context("swap chain does not implement IDXGISwapChain3")
            .map_err(platform)?;
        let index = unsafe { swap_chain.GetCurrentBackBufferIndex() };
        let back_buffer: ID3D12Resource = unsafe { swap_chain.GetBuffer(index) }
            .with_context(|| format!("IDXGISwapChain::GetBuffer({index}) failed"))
            .map_err(platform)?;
        let raw_desc = unsafe { back_buffer.GetDesc() };

        let format = surface_format(raw_desc.Format).ok_or_else(|| {
            FrameGenError::UnsupportedFormat(format!("DXGI format {}", raw_desc.Format.0))
        })?;
        let width = u32::try_from(raw_desc.Width).map_err(|_| FrameGenError::BufferOverflow)?;
        let desc = SurfaceDesc {
            width,
            height: raw_desc.Height,
            format,
        };
        self.back_buffer = Some((back_buffer, raw_desc));
        Ok(desc)
    }

    fn reallocate(&mut self, desc: &SurfaceDesc) -> FrameGenResult<()> {
        // Old targets may still be written by an in-flight copy.
        self.wait_for_fence()?;
        self.targets = None;
        self.pending_pixels = false;

        let raw_desc = self
            .back_buffer
            .as_ref()
            .map(|(_, raw)| *raw)
            .ok_or(FrameGenError::NotReady)?;
        let targets = self.create_targets(&raw_desc, desc).map_err(platform)?;
        tracing::debug!(
            bytes = targets.total_bytes,
            row_pitch = targets.footprint.Footprint.RowPitch,
            shared = targets.transfer.iter().filter(|t| t.is_some()).count(),
            "d3d12 readback targets created"
        );
        self.targets = Some(targets);
        Ok(())
    }

    fn read_into(
        &mut self,
        _surface: &IDXGISwapChain,
        desc: &SurfaceDesc,
        dst: &mut [u8],
    ) -> FrameGenResult<Option<Arc<dyn ExportableTexture>>> {
        let (back_buffer, _) = self.back_buffer.take().ok_or(FrameGenError::NotReady)?;

        if self.wait_for_copy {
            self.record_and_submit(&back_buffer)?;
            self.wait_for_fence()?;
            self.read_pixels(desc, dst)?;
            return Ok(self.transfer_for_current());
        }

        if self.copy_in_flight() {
            return Err(FrameGenError::CaptureFailed(
                "previous readback copy still in flight".into(),
            ));
        }
        let had_pixels = std::mem::take(&mut self.pending_pixels);
        // Pixels and texture both come from the copy signalled last.
        let transfer = self.transfer_for_current();
        if had_pixels {
            self.read_pixels(desc, dst)?;
        }
        self.record_and_submit(&back_buffer)?;
        self.pending_pixels = true;

        if had_pixels {
            Ok(transfer)
        } else {
            Err(FrameGenError::CaptureFailed(
                "first readback copy not finished yet".into(),
            ))
        }
    }
}

impl Drop for D3D12Readback {
    fn drop(&mut self) {
        if let Err(e) = self.wait_for_fence() {
            tracing::warn!(error = %e, "releasing readback resources with a copy in flight");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn consecutive_copies_use_different_transfer_slots() {
        for fence_value in 0..8u64 {
            assert!(transfer_slot(fence_value) < TRANSFER_SLOTS);
            // The texture handed out with the last copy is never the one the
            // next submission writes.
            assert_ne!(transfer_slot(fence_value), transfer_slot(fence_value + 1));
            assert_eq!(transfer_slot(fence_value), transfer_slot(fence_value + 2));
        }
    }

    #[test]
    fn surface_formats_map_to_capture_layouts() {
        assert_eq!(surface_format(DXGI_FORMAT_R8G8B8A8_UNORM_SRGB), Some(SurfaceFormat::Rgba8));
        assert_eq!(surface_format(DXGI_FORMAT_B8G8R8A8_UNORM), Some(SurfaceFormat::Bgra8));
        assert_eq!(
            surface_format(DXGI_FORMAT_R16G16B16A16_FLOAT),
            Some(SurfaceFormat::Rgba16Float)
        );
        assert_eq!(surface_format(DXGI_FORMAT_UNKNOWN), None);
    }
}
