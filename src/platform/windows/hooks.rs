//! Hook trampolines and activation.
//!
//! The two replacement functions are plain `extern "system"` functions
//! reached through the patched method tables. Their state lives in
//! statics: the original pointers (published before each slot write) and
//! the runtime built once per process.

use std::ffi::c_void;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};

use windows::Win32::Foundation::E_FAIL;
use windows::Win32::Graphics::Direct3D12::{
    D3D12_COMMAND_LIST_TYPE_COMPUTE, D3D12_COMMAND_LIST_TYPE_COPY, D3D12_COMMAND_LIST_TYPE_DIRECT,
    ID3D12CommandQueue,
};
use windows::Win32::Graphics::Dxgi::IDXGISwapChain;
use windows::core::{HRESULT, Interface};

use super::probe::probe_dispatch_tables;
use super::protect::Win32PageProtection;
use super::readback::D3D12Backend;
use crate::accel::CrossAcceleratorProcessor;
use crate::config::FrameGenConfig;
use crate::context::{HookState, InterceptionContext};
use crate::error::{FrameGenError, FrameGenResult};
use crate::hook::{DispatchTablePatcher, TargetDescriptor, call_guarded};
use crate::intercept::PresentationInterceptHandler;
use crate::overlay::LogOverlay;
use crate::pipeline::InterpolationStage;
use crate::queue_capture::QueueKind;

type PresentFn = unsafe extern "system" fn(*mut c_void, u32, u32) -> HRESULT;
type ExecuteCommandListsFn = unsafe extern "system" fn(*mut c_void, u32, *const *mut c_void);

static ORIGINAL_PRESENT: AtomicUsize = AtomicUsize::new(0);
static ORIGINAL_EXECUTE: AtomicUsize = AtomicUsize::new(0);

static RUNTIME: OnceLock<HookRuntime> = OnceLock::new();

struct HookRuntime {
    context: Arc<InterceptionContext>,
    handler: PresentationInterceptHandler<D3D12Backend>,
    patcher: DispatchTablePatcher<Win32PageProtection>,
}

impl HookRuntime {
    fn new(config: FrameGenConfig) -> Self {
        let context = Arc::new(InterceptionContext::new(
            config,
            Arc::new(LogOverlay::default()),
        ));
        Self {
            handler: PresentationInterceptHandler::new(Arc::clone(&context), D3D12Backend),
            context,
            patcher: DispatchTablePatcher::new(Win32PageProtection),
        }
    }

    fn install(&self) -> FrameGenResult<()> {
        let context = &*self.context;
        context.hook_state().set(HookState::Scanning);

        let config = context.config();
        let stage = InterpolationStage::new(
            CrossAcceleratorProcessor::new(config.preferred_vendor),
            config.blend_factor,
            config.accelerator_retry_frames,
            Arc::clone(context.stats()),
        );
        context.start_worker(stage)?;

        let result = self.patch_tables();
        match &result {
            Ok(()) => context.hook_state().set(HookState::Installed),
            Err(e) => {
                tracing::error!(error = %e, "hook installation failed, host continues unhooked");
                context.hook_state().set(HookState::Failed);
                context.shutdown();
            }
        }
        result
    }

    fn patch_tables(&self) -> FrameGenResult<()> {
        let tables = probe_dispatch_tables()?;

        self.patcher.install(
            tables.command_queue,
            TargetDescriptor::EXECUTE_COMMAND_LISTS,
            execute_command_lists_hook as ExecuteCommandListsFn as usize,
            |original| ORIGINAL_EXECUTE.store(original, Ordering::Release),
        )?;

        let present = self.patcher.install(
            tables.swap_chain,
            TargetDescriptor::PRESENT,
            present_hook as PresentFn as usize,
            |original| ORIGINAL_PRESENT.store(original, Ordering::Release),
        );
        if let Err(e) = present {
            if let Err(undo) = self.patcher.uninstall(TargetDescriptor::EXECUTE_COMMAND_LISTS) {
                tracing::warn!(error = %undo, "could not remove submission hook after present hook failed");
            }
            return Err(e);
        }
        Ok(())
    }

    fn remove(&self) -> FrameGenResult<()> {
        // Present first so no new capture starts while the queue hook is
        // being removed.
        self.patcher.uninstall(TargetDescriptor::PRESENT)?;
        self.patcher.uninstall(TargetDescriptor::EXECUTE_COMMAND_LISTS)?;
        let discarded = self.context.shutdown();
        self.context.hook_state().set(HookState::Uninstalled);
        tracing::info!(discarded, stats = ?self.context.stats().snapshot(), "hooks removed");
        Ok(())
    }
}

fn queue_kind(queue: *mut c_void) -> QueueKind {
    // SAFETY: `queue` is the `this` pointer of a live command queue call.
    let Some(queue) = (unsafe { ID3D12CommandQueue::from_raw_borrowed(&queue) }) else {
        return QueueKind::Other;
    };
    let desc = unsafe { queue.GetDesc() };
    match desc.Type {
        D3D12_COMMAND_LIST_TYPE_DIRECT => QueueKind::Direct,
        D3D12_COMMAND_LIST_TYPE_COMPUTE => QueueKind::Compute,
        D3D12_COMMAND_LIST_TYPE_COPY => QueueKind::Copy,
        _ => QueueKind::Other,
    }
}

unsafe fn call_original_present(this: *mut c_void, sync_interval: u32, flags: u32) -> HRESULT {
    let original = ORIGINAL_PRESENT.load(Ordering::Acquire);
    if original == 0 {
        return E_FAIL;
    }
    // SAFETY: published from the patched slot before the hook went live.
    let original = unsafe { std::mem::transmute::<usize, PresentFn>(original) };
    unsafe { original(this, sync_interval, flags) }
}

unsafe extern "system" fn present_hook(this: *mut c_void, sync_interval: u32, flags: u32) -> HRESULT {
    let Some(runtime) = RUNTIME.get() else {
        return unsafe { call_original_present(this, sync_interval, flags) };
    };
    // SAFETY: `this` is the swap chain the application called Present on.
    let Some(swap_chain) = (unsafe { IDXGISwapChain::from_raw_borrowed(&this) }) else {
        return unsafe { call_original_present(this, sync_interval, flags) };
    };

    let outcome = call_guarded(
        |forward| runtime.handler.on_present(swap_chain, || forward()),
        || unsafe { call_original_present(this, sync_interval, flags) },
    );
    outcome.unwrap_or_else(|status| {
        tracing::error!("panic in present interception, disabling augmentation");
        runtime.context.hook_state().set(HookState::Failed);
        status
    })
}

unsafe fn call_original_execute(this: *mut c_void, count: u32, lists: *const *mut c_void) {
    let original = ORIGINAL_EXECUTE.load(Ordering::Acquire);
    if original != 0 {
        // SAFETY: published from the patched slot before the hook went live.
        let original = unsafe { std::mem::transmute::<usize, ExecuteCommandListsFn>(original) };
        unsafe { original(this, count, lists) };
    }
}

unsafe extern "system" fn execute_command_lists_hook(
    this: *mut c_void,
    count: u32,
    lists: *const *mut c_void,
) {
    let Some(runtime) = RUNTIME.get() else {
        return unsafe { call_original_execute(this, count, lists) };
    };

    let outcome = call_guarded(
        |forward| {
            runtime.context.queue_capture().offer(this, || queue_kind(this));
            forward()
        },
        || unsafe { call_original_execute(this, count, lists) },
    );
    if outcome.is_err() {
        tracing::error!("panic in submission interception, disabling augmentation");
        runtime.context.hook_state().set(HookState::Failed);
    }
}

/// Probe the dispatch tables, start the worker and redirect `Present` and
/// `ExecuteCommandLists`.
///
/// The runtime is built once per process; a later call after
/// [`deactivate`] reinstalls the hooks with the first configuration.
pub(crate) fn activate(config: FrameGenConfig) -> FrameGenResult<()> {
    config.validate()?;

    let runtime = match RUNTIME.get() {
        Some(existing) => {
            if existing.patcher.is_installed(TargetDescriptor::PRESENT) {
                tracing::debug!("hooks already installed");
                return Ok(());
            }
            tracing::warn!("reactivating with the configuration of the first activation");
            existing
        }
        None => {
            let _ = RUNTIME.set(HookRuntime::new(config));
            RUNTIME
                .get()
                .ok_or_else(|| FrameGenError::Platform(anyhow::anyhow!("hook runtime unavailable")))?
        }
    };

    tracing::info!(config = ?runtime.context.config(), "installing presentation hooks");
    runtime.install()
}

/// Restore both dispatch-table slots and stop the worker.
pub(crate) fn deactivate() -> FrameGenResult<()> {
    match RUNTIME.get() {
        Some(runtime) => runtime.remove(),
        None => Ok(()),
    }
}
