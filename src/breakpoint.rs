//! Software breakpoint management.
//!
//! A single `0xCC` breakpoint is live at any time. Arming saves the original
//! byte behind execute-read-write protection and flushes the instruction
//! cache; disarming restores it the same way.

use std::ffi::c_void;

use tracing::{debug, warn};
use windows::Win32::System::Diagnostics::Debug::FlushInstructionCache;
use windows::Win32::System::Memory::{
    VirtualProtect, PAGE_EXECUTE_READWRITE, PAGE_PROTECTION_FLAGS,
};
use windows::Win32::System::Threading::GetCurrentProcess;

const INT3: u8 = 0xCC;

/// Scoped page-protection change. The original flags come back on every exit
/// path, including unwinds.
struct ProtectGuard {
    address: *mut c_void,
    size: usize,
    old: PAGE_PROTECTION_FLAGS,
}

impl ProtectGuard {
    fn new(address: usize, size: usize) -> Option<Self> {
        let address = address as *mut c_void;
        let mut old = PAGE_PROTECTION_FLAGS::default();

        let changed =
            unsafe { VirtualProtect(address, size, PAGE_EXECUTE_READWRITE, &mut old) };
        if let Err(err) = changed {
            warn!("VirtualProtect failed at {address:p}: {err}");
            return None;
        }

        Some(Self { address, size, old })
    }
}

impl Drop for ProtectGuard {
    fn drop(&mut self) {
        let mut ignored = PAGE_PROTECTION_FLAGS::default();
        unsafe {
            let _ = VirtualProtect(self.address, self.size, self.old, &mut ignored);
        }
    }
}

fn flush_one_byte(address: usize) {
    unsafe {
        let _ = FlushInstructionCache(GetCurrentProcess(), Some(address as *const c_void), 1);
    }
}

/// The process-wide software breakpoint.
#[derive(Default)]
pub struct Breakpoint {
    address: usize,
    saved: u8,
    armed: bool,
}

impl Breakpoint {
    pub fn new() -> Self {
        Self::default()
    }

    /// Write `0xCC` at `address`, saving the original byte. No-op while a
    /// breakpoint is already armed.
    pub fn arm(&mut self, address: usize) {
        if self.armed {
            return;
        }

        let Some(_guard) = ProtectGuard::new(address, 1) else {
            return;
        };

        unsafe {
            let target = address as *mut u8;
            self.saved = std::ptr::read_volatile(target);
            std::ptr::write_volatile(target, INT3);
        }
        flush_one_byte(address);

        self.address = address;
        self.armed = true;
        debug!("breakpoint armed at 0x{address:08x}");
    }

    /// Restore the saved byte. No-op while nothing is armed.
    pub fn disarm(&mut self) {
        if !self.armed {
            return;
        }

        let Some(_guard) = ProtectGuard::new(self.address, 1) else {
            return;
        };

        unsafe {
            std::ptr::write_volatile(self.address as *mut u8, self.saved);
        }
        flush_one_byte(self.address);

        self.armed = false;
        debug!("breakpoint removed from 0x{:08x}", self.address);
    }

    /// Currently armed address, or 0.
    pub fn address(&self) -> usize {
        if self.armed {
            self.address
        } else {
            0
        }
    }

    pub fn is_armed(&self) -> bool {
        self.armed
    }
}

impl Drop for Breakpoint {
    fn drop(&mut self) {
        self.disarm();
    }
}
