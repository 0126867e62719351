//! Dispatch-table patching.
//!
//! A COM object's first pointer-sized field points at its class's method
//! table. Every instance of the class shares that table, so the slot read
//! from a throwaway probe object is the same slot the application's own
//! objects dispatch through. Patching it redirects the live objects.

use std::cell::Cell;
use std::ffi::c_void;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::ptr::NonNull;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};

use rustc_hash::FxHashMap;

use crate::error::{FrameGenError, FrameGenResult};

/// A method to redirect: its name for diagnostics and its slot index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TargetDescriptor {
    pub name: &'static str,
    pub slot: usize,
}

impl TargetDescriptor {
    /// `IDXGISwapChain::Present`: 3 `IUnknown` + 4 `IDXGIObject` + 1
    /// `IDXGIDeviceSubObject` methods precede it.
    pub const PRESENT: Self = Self {
        name: "IDXGISwapChain::Present",
        slot: 8,
    };

    /// `ID3D12CommandQueue::ExecuteCommandLists`.
    pub const EXECUTE_COMMAND_LISTS: Self = Self {
        name: "ID3D12CommandQueue::ExecuteCommandLists",
        slot: 10,
    };
}

/// Pointer to the first slot of a method table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DispatchTable(NonNull<usize>);

// The table lives in a loaded module's image for the life of the process.
unsafe impl Send for DispatchTable {}
unsafe impl Sync for DispatchTable {}

impl DispatchTable {
    /// # Safety
    /// `table` must point at a method table with at least as many slots as
    /// any target later used with it.
    pub unsafe fn from_raw(table: *mut usize) -> Option<Self> {
        NonNull::new(table).map(Self)
    }

    /// Read the table pointer out of a COM object.
    ///
    /// # Safety
    /// `object` must point at a live COM object.
    pub unsafe fn of_object(object: *mut c_void) -> Option<Self> {
        if object.is_null() {
            return None;
        }
        // SAFETY: a COM object starts with its vtable pointer.
        let table = unsafe { *(object as *const *mut usize) };
        unsafe { Self::from_raw(table) }
    }

    pub fn as_ptr(self) -> *mut usize {
        self.0.as_ptr()
    }

    fn slot_ptr(self, slot: usize) -> *mut usize {
        self.0.as_ptr().wrapping_add(slot)
    }

    fn slot(self, slot: usize) -> &'static AtomicUsize {
        // SAFETY: slots are pointer-aligned and valid for the process
        // lifetime (see `from_raw`). Access is atomic so a concurrent
        // dispatch never observes a torn pointer.
        unsafe { AtomicUsize::from_ptr(self.slot_ptr(slot)) }
    }

    pub fn read(self, slot: usize) -> usize {
        self.slot(slot).load(Ordering::Acquire)
    }
}

/// Toggles page protection around a slot write.
pub trait PageProtection: Send + Sync {
    /// Make `len` bytes at `addr` writable, returning the previous
    /// protection to hand back to [`PageProtection::restore`].
    fn make_writable(&self, addr: *mut c_void, len: usize) -> anyhow::Result<u32>;

    fn restore(&self, addr: *mut c_void, len: usize, previous: u32) -> anyhow::Result<()>;
}

#[derive(Debug, Clone, Copy)]
struct PatchRecord {
    table: DispatchTable,
    slot: usize,
    original: usize,
    replacement: usize,
}

/// Installs and removes method-table redirections, remembering the
/// original pointer of each.
pub struct DispatchTablePatcher<P: PageProtection> {
    protection: P,
    patches: Mutex<FxHashMap<&'static str, PatchRecord>>,
}

impl<P: PageProtection> DispatchTablePatcher<P> {
    pub fn new(protection: P) -> Self {
        Self {
            protection,
            patches: Mutex::new(FxHashMap::default()),
        }
    }

    pub fn is_installed(&self, target: TargetDescriptor) -> bool {
        self.lock().contains_key(target.name)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, FxHashMap<&'static str, PatchRecord>> {
        self.patches.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Point `target`'s slot in `table` at `replacement` and return the
    /// original function pointer.
    ///
    /// `publish` receives the original before the slot is written, so a
    /// replacement that runs the instant the write lands can already
    /// forward to it.
    pub fn install(
        &self,
        table: DispatchTable,
        target: TargetDescriptor,
        replacement: usize,
        publish: impl FnOnce(usize),
    ) -> FrameGenResult<usize> {
        let mut patches = self.lock();
        if let Some(existing) = patches.get(target.name) {
            return Ok(existing.original);
        }

        let original = table.read(target.slot);
        if original == 0 {
            return Err(FrameGenError::MissingFunctionAddress(target.name));
        }
        if original == replacement {
            return Err(FrameGenError::AlreadyPatched(target.name));
        }
        publish(original);

        self.write_slot(table, target, replacement)?;

        patches.insert(
            target.name,
            PatchRecord {
                table,
                slot: target.slot,
                original,
                replacement,
            },
        );
        tracing::info!(
            target = target.name,
            slot = target.slot,
            original = format_args!("{original:#x}"),
            "dispatch table slot patched"
        );
        Ok(original)
    }

    /// Put the recorded original pointer back. Returns `false` when the
    /// target was not installed.
    ///
    /// The record is kept until the slot has been handled, so a failed
    /// protection change can be retried.
    pub fn uninstall(&self, target: TargetDescriptor) -> FrameGenResult<bool> {
        let mut patches = self.lock();
        let Some(record) = patches.get(target.name).copied() else {
            return Ok(false);
        };

        let addr = record.table.slot_ptr(record.slot).cast::<c_void>();
        let len = std::mem::size_of::<usize>();
        let previous = self
            .protection
            .make_writable(addr, len)
            .map_err(|e| FrameGenError::ProtectionToggle(format!("{}: {e:#}", target.name)))?;

        let restored = record
            .table
            .slot(record.slot)
            .compare_exchange(record.replacement, record.original, Ordering::AcqRel, Ordering::Acquire);
        if restored.is_err() {
            tracing::warn!(
                target = target.name,
                "slot was repatched by someone else, leaving it alone"
            );
        }
        // The slot no longer holds our replacement either way.
        patches.remove(target.name);

        self.protection
            .restore(addr, len, previous)
            .map_err(|e| FrameGenError::ProtectionToggle(format!("{}: {e:#}", target.name)))?;
        tracing::info!(target = target.name, "dispatch table slot restored");
        Ok(restored.is_ok())
    }

    fn write_slot(
        &self,
        table: DispatchTable,
        target: TargetDescriptor,
        value: usize,
    ) -> FrameGenResult<()> {
        let addr = table.slot_ptr(target.slot).cast::<c_void>();
        let len = std::mem::size_of::<usize>();
        let previous = self
            .protection
            .make_writable(addr, len)
            .map_err(|e| FrameGenError::ProtectionToggle(format!("{}: {e:#}", target.name)))?;

        let slot = table.slot(target.slot);
        let original = slot.swap(value, Ordering::AcqRel);

        if let Err(e) = self.protection.restore(addr, len, previous) {
            // The page is still writable; undo before reporting.
            slot.store(original, Ordering::Release);
            return Err(FrameGenError::ProtectionToggle(format!(
                "{}: {e:#}",
                target.name
            )));
        }
        Ok(())
    }
}

/// Run a replacement body that forwards to `original` through the callback
/// it is handed, without letting a panic unwind into the caller.
///
/// `original` runs exactly once either way. `Err` carries its result when
/// the body panicked; that result is the one it already returned if the
/// body had forwarded before panicking.
pub(crate) fn call_guarded<T: Copy>(
    body: impl FnOnce(&dyn Fn() -> T) -> T,
    original: impl Fn() -> T,
) -> Result<T, T> {
    let forwarded: Cell<Option<T>> = Cell::new(None);
    let forward = || {
        let result = original();
        forwarded.set(Some(result));
        result
    };
    match catch_unwind(AssertUnwindSafe(|| body(&forward))) {
        Ok(result) => Ok(result),
        Err(_) => Err(forwarded.get().unwrap_or_else(&original)),
    }
}
