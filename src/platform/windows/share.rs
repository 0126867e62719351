use anyhow::{Context, Result};
use windows::Win32::Foundation::{CloseHandle, GENERIC_ALL, HANDLE};
use windows::Win32::Graphics::Direct3D12::{
    D3D12_HEAP_FLAG_SHARED, D3D12_HEAP_FLAGS, D3D12_HEAP_PROPERTIES, ID3D12Device, ID3D12Resource,
};
use windows::core::PCWSTR;

use crate::backend::{ExportableTexture, SharedOsHandle};
use crate::frame::SurfaceDesc;

/// NT handle returned by `CreateSharedHandle`, closed on drop.
pub(crate) struct OwnedHandle(HANDLE);

// A kernel handle value may be used and closed from any thread.
unsafe impl Send for OwnedHandle {}
unsafe impl Sync for OwnedHandle {}

impl SharedOsHandle for OwnedHandle {
    fn raw(&self) -> usize {
        self.0.0 as usize
    }
}

impl Drop for OwnedHandle {
    fn drop(&mut self) {
        if !self.0.is_invalid() {
            let _ = unsafe { CloseHandle(self.0) };
        }
    }
}

/// The transfer copy of a back buffer, living on the application's device.
pub(crate) struct D3D12SharedTexture {
    device: ID3D12Device,
    resource: ID3D12Resource,
    desc: SurfaceDesc,
}

// D3D12 devices and resources are free-threaded.
unsafe impl Send for D3D12SharedTexture {}
unsafe impl Sync for D3D12SharedTexture {}

impl D3D12SharedTexture {
    pub(crate) fn new(device: ID3D12Device, resource: ID3D12Resource, desc: SurfaceDesc) -> Self {
        Self {
            device,
            resource,
            desc,
        }
    }

    pub(crate) fn resource(&self) -> &ID3D12Resource {
        &self.resource
    }
}

impl ExportableTexture for D3D12SharedTexture {
    fn desc(&self) -> SurfaceDesc {
        self.desc
    }

    fn query_shareable(&self) -> Result<bool> {
        let mut properties = D3D12_HEAP_PROPERTIES::default();
        let mut flags = D3D12_HEAP_FLAGS::default();
        unsafe {
            self.resource
                .GetHeapProperties(Some(&mut properties as *mut _), Some(&mut flags as *mut _))
        }
        .context("ID3D12Resource::GetHeapProperties failed")?;
        Ok(flags.0 & D3D12_HEAP_FLAG_SHARED.0 != 0)
    }

    fn create_shared_handle(&self) -> Result<Box<dyn SharedOsHandle>> {
        let handle = unsafe {
            self.device
                .CreateSharedHandle(&self.resource, None, GENERIC_ALL.0, PCWSTR::null())
        }
        .context("ID3D12Device::CreateSharedHandle failed")?;
        Ok(Box::new(OwnedHandle(handle)))
    }
}
