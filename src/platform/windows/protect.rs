use std::ffi::c_void;

use anyhow::{Context, Result};
use windows::Win32::System::Memory::{PAGE_PROTECTION_FLAGS, PAGE_READWRITE, VirtualProtect};

use crate::hook::PageProtection;

/// `VirtualProtect`-backed page protection toggling.
#[derive(Debug, Default, Clone, Copy)]
pub(crate) struct Win32PageProtection;

impl PageProtection for Win32PageProtection {
    fn make_writable(&self, addr: *mut c_void, len: usize) -> Result<u32> {
        let mut previous = PAGE_PROTECTION_FLAGS::default();
        unsafe { VirtualProtect(addr, len, PAGE_READWRITE, &mut previous) }
            .with_context(|| format!("VirtualProtect(PAGE_READWRITE) failed at {addr:p}"))?;
        Ok(previous.0)
    }

    fn restore(&self, addr: *mut c_void, len: usize, previous: u32) -> Result<()> {
        let mut replaced = PAGE_PROTECTION_FLAGS::default();
        unsafe { VirtualProtect(addr, len, PAGE_PROTECTION_FLAGS(previous), &mut replaced) }
            .with_context(|| format!("VirtualProtect({previous:#x}) failed at {addr:p}"))?;
        Ok(())
    }
}
