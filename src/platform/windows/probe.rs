// Throwaway D3D12 device, queue and swap chain, created only to read their
// method tables. Everything here is released before hooks are installed;
// the tables themselves live in d3d12.dll / dxgi.dll and stay valid.

use anyhow::{Context, Result};
use windows::Win32::Foundation::{BOOL, HWND, LPARAM, LRESULT, WPARAM};
use windows::Win32::Graphics::Direct3D::D3D_FEATURE_LEVEL_11_0;
use windows::Win32::Graphics::Direct3D12::{
    D3D12_COMMAND_LIST_TYPE_DIRECT, D3D12_COMMAND_QUEUE_DESC, D3D12_COMMAND_QUEUE_FLAG_NONE,
    D3D12CreateDevice, ID3D12CommandQueue, ID3D12Device,
};
use windows::Win32::Graphics::Dxgi::Common::{
    DXGI_ALPHA_MODE_IGNORE, DXGI_FORMAT_R8G8B8A8_UNORM, DXGI_SAMPLE_DESC,
};
use windows::Win32::Graphics::Dxgi::{
    CreateDXGIFactory2, DXGI_CREATE_FACTORY_FLAGS, DXGI_SCALING_STRETCH, DXGI_SWAP_CHAIN_DESC1,
    DXGI_SWAP_EFFECT_FLIP_DISCARD, DXGI_USAGE_RENDER_TARGET_OUTPUT, IDXGIFactory4, IDXGISwapChain1,
};
use windows::Win32::System::LibraryLoader::GetModuleHandleW;
use windows::Win32::UI::WindowsAndMessaging::{
    CreateWindowExW, DefWindowProcW, DestroyWindow, RegisterClassW, WNDCLASSW, WS_OVERLAPPEDWINDOW,
};
use windows::core::{Interface, PCWSTR};

use crate::error::{FrameGenError, FrameGenResult};
use crate::hook::DispatchTable;

const CLASS_NAME: &str = "CrossLinkFGProbe";

/// Method tables read from the probe objects.
#[derive(Debug, Clone, Copy)]
pub(crate) struct ProbedTables {
    pub swap_chain: DispatchTable,
    pub command_queue: DispatchTable,
}

/// Hidden window the probe swap chain is bound to. Never shown.
struct ProbeWindow(HWND);

impl ProbeWindow {
    fn create() -> Result<Self> {
        let class_name_wide: Vec<u16> = CLASS_NAME.encode_utf16().chain(std::iter::once(0)).collect();
        let hinstance = unsafe { GetModuleHandleW(None) }.context("GetModuleHandleW failed")?;

        let wc = WNDCLASSW {
            lpfnWndProc: Some(probe_wnd_proc),
            hInstance: hinstance.into(),
            lpszClassName: PCWSTR(class_name_wide.as_ptr()),
            ..Default::default()
        };
        // Already registered on a second probe; the class only has to exist.
        unsafe {
            RegisterClassW(&wc);
        }

        let hwnd = unsafe {
            CreateWindowExW(
                Default::default(),
                PCWSTR(class_name_wide.as_ptr()),
                PCWSTR::null(),
                WS_OVERLAPPEDWINDOW,
                0,
                0,
                64,
                64,
                None,
                None,
                hinstance,
                None,
            )
        }
        .context("CreateWindowExW for probe window failed")?;
        Ok(Self(hwnd))
    }
}

impl Drop for ProbeWindow {
    fn drop(&mut self) {
        let _ = unsafe { DestroyWindow(self.0) };
    }
}

unsafe extern "system" fn probe_wnd_proc(hwnd: HWND, msg: u32, wparam: WPARAM, lparam: LPARAM) -> LRESULT {
    unsafe { DefWindowProcW(hwnd, msg, wparam, lparam) }
}

fn probe() -> Result<ProbedTables> {
    let window = ProbeWindow::create()?;

    let factory: IDXGIFactory4 = unsafe { CreateDXGIFactory2(DXGI_CREATE_FACTORY_FLAGS(0)) }
        .context("CreateDXGIFactory2 failed")?;
    let adapter = unsafe { factory.EnumAdapters(0) }.context("IDXGIFactory::EnumAdapters(0) failed")?;

    let mut device: Option<ID3D12Device> = None;
    unsafe { D3D12CreateDevice(&adapter, D3D_FEATURE_LEVEL_11_0, &mut device) }
        .context("D3D12CreateDevice failed")?;
    let device = device.context("D3D12CreateDevice returned no device")?;

    let queue: ID3D12CommandQueue = unsafe {
        device.CreateCommandQueue(&D3D12_COMMAND_QUEUE_DESC {
            Type: D3D12_COMMAND_LIST_TYPE_DIRECT,
            Priority: 0,
            Flags: D3D12_COMMAND_QUEUE_FLAG_NONE,
            NodeMask: 0,
        })
    }
    .context("CreateCommandQueue failed")?;

    let desc = DXGI_SWAP_CHAIN_DESC1 {
        Width: 64,
        Height: 64,
        Format: DXGI_FORMAT_R8G8B8A8_UNORM,
        Stereo: BOOL(0),
        SampleDesc: DXGI_SAMPLE_DESC {
            Count: 1,
            Quality: 0,
        },
        BufferUsage: DXGI_USAGE_RENDER_TARGET_OUTPUT,
        BufferCount: 2,
        Scaling: DXGI_SCALING_STRETCH,
        SwapEffect: DXGI_SWAP_EFFECT_FLIP_DISCARD,
        AlphaMode: DXGI_ALPHA_MODE_IGNORE,
        Flags: 0,
    };
    let swap_chain: IDXGISwapChain1 =
        unsafe { factory.CreateSwapChainForHwnd(&queue, window.0, &desc, None, None) }
            .context("CreateSwapChainForHwnd failed")?;

    // SAFETY: both objects are alive for the duration of the reads.
    let swap_chain_table = unsafe { DispatchTable::of_object(swap_chain.as_raw()) }
        .context("probe swap chain has no method table")?;
    let queue_table = unsafe { DispatchTable::of_object(queue.as_raw()) }
        .context("probe command queue has no method table")?;

    // Release order: swap chain before the queue it presents on.
    drop(swap_chain);
    drop(queue);
    drop(device);
    drop(window);

    Ok(ProbedTables {
        swap_chain: swap_chain_table,
        command_queue: queue_table,
    })
}

pub(crate) fn probe_dispatch_tables() -> FrameGenResult<ProbedTables> {
    let tables = probe().map_err(|e| FrameGenError::ProbeDeviceCreation(format!("{e:#}")))?;
    tracing::debug!(
        swap_chain = ?tables.swap_chain.as_ptr(),
        command_queue = ?tables.command_queue.as_ptr(),
        "probe dispatch tables resolved"
    );
    Ok(tables)
}
