// Copyright The Rusted Firmware-A Contributors.
//
// SPDX-License-Identifier: BSD-3-Clause

//! The subset of the Arm semihosting calls needed to stop an emulator.
//! See https://github.com/ARM-software/abi-aa/blob/main/semihosting/semihosting.rst.

#[cfg(target_arch = "aarch64")]
use core::arch::asm;

/// `SYS_*` operation codes from the semihosting spec.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[repr(u32)]
enum Operation {
    Exit = 0x18,
}

/// Makes a semihosting call with the given operation code and parameters.
///
/// # Safety
///
/// `system_block_address` must be a valid pointer to an argument block of the appropriate length
/// for the operation being called.
#[cfg(target_arch = "aarch64")]
unsafe fn semihosting_call(operation: Operation, system_block_address: *const u64) -> u64 {
    let result;
    // SAFETY: The caller guarantees that `system_block_address` is valid and points to enough
    // memory for `operation`.
    unsafe {
        asm!(
            "hlt #0xf000",
            in("w0") operation as u32,
            inout("x1") system_block_address => _,
            lateout("x0") result,
            options(nostack)
        );
    }
    result
}

/// Reason codes for a `SYS_EXIT` call.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[repr(u32)]
pub enum AdpStopped {
    ApplicationExit = 0x20026,
}

impl From<AdpStopped> for u64 {
    fn from(value: AdpStopped) -> Self {
        (value as u32).into()
    }
}

/// Reports an exception to the debugger.
///
/// The most common use is to report that execution has completed, with reason
/// `AdpStopped::ApplicationExit`. Returns if there is no debugger attached which handles the
/// call.
pub fn semihosting_exit(reason: AdpStopped, subcode: u64) {
    let parameters: [u64; 2] = [reason.into(), subcode];
    #[cfg(target_arch = "aarch64")]
    // SAFETY: The `parameters` pointer is valid, and contains two parameters as expected by
    // `SYS_EXIT`.
    unsafe {
        semihosting_call(Operation::Exit, parameters.as_ptr());
    }
    #[cfg(not(target_arch = "aarch64"))]
    log::warn!(
        "Semihosting exit {:#x} ({subcode}) ignored on this host",
        parameters[0]
    );
}
