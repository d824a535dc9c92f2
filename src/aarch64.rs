// Copyright The Rusted Firmware-A Contributors.
//
// SPDX-License-Identifier: BSD-3-Clause

//! Barrier and low-power wait instructions.
//!
//! On anything other than an AArch64 target these are no-ops, so that the power coordination logic
//! can run unchanged in host unit tests.

#[cfg(all(target_arch = "aarch64", not(test)))]
use core::arch::asm;

/// Issues a data synchronization barrier (`dsb`) instruction for the full system (`sy`).
pub fn dsb_sy() {
    // SAFETY: `dsb` does not violate safe Rust guarantees.
    #[cfg(all(target_arch = "aarch64", not(test)))]
    unsafe {
        asm!("dsb sy", options(nostack));
    }
}

/// Issues an instruction synchronization barrier (`isb`) instruction.
pub fn isb() {
    // SAFETY: `isb` does not violate safe Rust guarantees.
    #[cfg(all(target_arch = "aarch64", not(test)))]
    unsafe {
        asm!("isb", options(nostack));
    }
}

/// Waits for an interrupt.
pub fn wfi() {
    // SAFETY: `wfi` only suspends execution until the next interrupt or wake-up event.
    #[cfg(all(target_arch = "aarch64", not(test)))]
    unsafe {
        asm!("wfi", options(nomem, nostack, preserves_flags));
    }
}

/// Waits for an event.
pub fn wfe() {
    // SAFETY: `wfe` only suspends execution until the next event.
    #[cfg(all(target_arch = "aarch64", not(test)))]
    unsafe {
        asm!("wfe", options(nomem, nostack, preserves_flags));
    }
}

/// Sends an event to all cores in the system.
pub fn sev() {
    // SAFETY: `sev` has no effect on memory, it only wakes cores waiting in `wfe`.
    #[cfg(all(target_arch = "aarch64", not(test)))]
    unsafe {
        asm!("sev", options(nomem, nostack, preserves_flags));
    }
}

/// Parks the current core forever.
pub fn park() -> ! {
    loop {
        wfi();
    }
}
