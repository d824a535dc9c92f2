// Copyright The Rusted Firmware-A Contributors.
//
// SPDX-License-Identifier: BSD-3-Clause

//! Typed access to memory-mapped device registers, and bounded polling of them.

use arm_sysregs::{read_cntfrq_el0, read_cntpct_el0};
use core::{
    fmt::{self, Display, Formatter},
    marker::PhantomData,
    ptr::{read_volatile, write_volatile},
    time::Duration,
};

/// An error accessing a device register.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum MmioError {
    /// The register address was null.
    Null,
    /// The register address was not aligned to the register size.
    Misaligned { address: usize },
    /// A polled register did not reach the expected value in time.
    Timeout,
}

impl Display for MmioError {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        match self {
            Self::Null => write!(f, "null device register address"),
            Self::Misaligned { address } => {
                write!(f, "misaligned device register address {address:#x}")
            }
            Self::Timeout => write!(f, "timed out polling device register"),
        }
    }
}

/// Value types which can be stored in a device register.
pub trait RegisterValue: Copy + sealed::Sealed {}

impl RegisterValue for u32 {}
impl RegisterValue for u64 {}

mod sealed {
    pub trait Sealed {}

    impl Sealed for u32 {}
    impl Sealed for u64 {}
}

/// A single memory-mapped device register holding a `T`.
#[derive(Debug)]
pub struct DeviceRegister<T: RegisterValue> {
    address: usize,
    _value: PhantomData<T>,
}

/// A 32-bit device register.
pub type Reg32 = DeviceRegister<u32>;
/// A 64-bit device register.
pub type Reg64 = DeviceRegister<u64>;

impl<T: RegisterValue> DeviceRegister<T> {
    /// Checks `address` and wraps it as a device register.
    ///
    /// # Safety
    ///
    /// `address` must be the address of a device register (or memory standing in for one) which is
    /// valid for volatile reads and writes of a `T` for as long as the returned value is used, and
    /// which is not otherwise accessed through Rust references.
    pub unsafe fn new(address: usize) -> Result<Self, MmioError> {
        if address == 0 {
            return Err(MmioError::Null);
        }
        if address % align_of::<T>() != 0 {
            return Err(MmioError::Misaligned { address });
        }
        Ok(Self {
            address,
            _value: PhantomData,
        })
    }

    /// Reads the current value of the register.
    pub fn read(&self) -> T {
        // SAFETY: `new` checked that the address is non-null and aligned, and its caller promised
        // that it is valid for volatile reads.
        unsafe { read_volatile(self.address as *const T) }
    }

    /// Writes `value` to the register.
    pub fn write(&self, value: T) {
        // SAFETY: `new` checked that the address is non-null and aligned, and its caller promised
        // that it is valid for volatile writes.
        unsafe { write_volatile(self.address as *mut T, value) }
    }
}

/// Reads the 32-bit device register at `address`.
///
/// # Safety
///
/// `address` must be valid for a volatile 32-bit read, as for [`DeviceRegister::new`].
pub unsafe fn read32(address: usize) -> Result<u32, MmioError> {
    // SAFETY: Our caller guarantees that the address is valid.
    let register = unsafe { Reg32::new(address) }?;
    Ok(register.read())
}

/// Writes `value` to the 32-bit device register at `address`.
///
/// # Safety
///
/// `address` must be valid for a volatile 32-bit write, as for [`DeviceRegister::new`].
pub unsafe fn write32(address: usize, value: u32) -> Result<(), MmioError> {
    // SAFETY: Our caller guarantees that the address is valid.
    let register = unsafe { Reg32::new(address) }?;
    register.write(value);
    Ok(())
}

/// A deadline on the generic timer's physical counter.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Deadline {
    counter: u64,
}

impl Deadline {
    /// Returns the deadline `duration` from now.
    pub fn after(duration: Duration) -> Self {
        let frequency = read_cntfrq_el0().bits();
        let ticks = (duration.as_micros() as u64).saturating_mul(frequency) / 1_000_000;
        Self {
            counter: read_cntpct_el0().bits().saturating_add(ticks),
        }
    }

    /// Returns whether the deadline has passed.
    pub fn has_passed(&self) -> bool {
        read_cntpct_el0().bits() >= self.counter
    }
}

/// Calls `done` repeatedly until it returns true, or `timeout` expires.
///
/// `done` is always called at least once, and once more after the deadline, so that a condition
/// which became true while this core was delayed is not reported as a timeout.
pub fn poll_until(timeout: Duration, mut done: impl FnMut() -> bool) -> Result<(), MmioError> {
    let deadline = Deadline::after(timeout);
    loop {
        let expired = deadline.has_passed();
        if done() {
            return Ok(());
        }
        if expired {
            return Err(MmioError::Timeout);
        }
        core::hint::spin_loop();
    }
}

/// Polls the register until `(value & mask) == expected`, or `timeout` expires.
pub fn poll_register(
    register: &Reg32,
    mask: u32,
    expected: u32,
    timeout: Duration,
) -> Result<u32, MmioError> {
    let mut value = 0;
    poll_until(timeout, || {
        value = register.read();
        value & mask == expected
    })?;
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::lock_fake_sysregs;
    use arm_sysregs::{CntpctEl0, fake::SYSREGS};

    #[test]
    fn read_write_register() {
        let mut backing = Box::new(0u32);
        let address = &raw mut *backing as usize;

        // SAFETY: `backing` outlives the register and is only accessed through it.
        let register = unsafe { Reg32::new(address) }.unwrap();
        register.write(0x1234_5678);
        assert_eq!(register.read(), 0x1234_5678);
        // SAFETY: As above.
        assert_eq!(unsafe { read32(address) }, Ok(0x1234_5678));
        // SAFETY: As above.
        unsafe { write32(address, 42) }.unwrap();
        assert_eq!(register.read(), 42);
    }

    #[test]
    fn reject_bad_addresses() {
        // SAFETY: The address is rejected before any access is made.
        assert_eq!(unsafe { read32(0) }.unwrap_err(), MmioError::Null);
        // SAFETY: As above.
        assert_eq!(
            unsafe { Reg64::new(0x1004) }.unwrap_err(),
            MmioError::Misaligned { address: 0x1004 }
        );
        // SAFETY: As above.
        assert_eq!(
            unsafe { write32(0x1002, 0) }.unwrap_err(),
            MmioError::Misaligned { address: 0x1002 }
        );
    }

    #[test]
    fn poll_succeeds_once_condition_holds() {
        let _sysregs = lock_fake_sysregs();
        let mut calls = 0;
        assert_eq!(
            poll_until(Duration::from_millis(100), || {
                calls += 1;
                calls == 3
            }),
            Ok(())
        );
        assert_eq!(calls, 3);
    }

    #[test]
    fn poll_times_out() {
        let _sysregs = lock_fake_sysregs();
        let mut calls = 0u64;
        assert_eq!(
            poll_until(Duration::from_millis(10), || {
                calls += 1;
                // Each poll takes a millisecond of the 1 MHz counter.
                let mut sysregs = SYSREGS.lock().unwrap();
                sysregs.cntpct_el0 = CntpctEl0::from_bits_retain(sysregs.cntpct_el0.bits() + 1000);
                false
            }),
            Err(MmioError::Timeout)
        );
        // Ten polls before the deadline, and one more after it.
        assert_eq!(calls, 11);
    }

    #[test]
    fn poll_register_masks_value() {
        let _sysregs = lock_fake_sysregs();
        let mut backing = Box::new(0b1010u32);
        // SAFETY: `backing` outlives the register and is only accessed through it.
        let register = unsafe { Reg32::new(&raw mut *backing as usize) }.unwrap();

        assert_eq!(
            poll_register(&register, 0b10, 0b10, Duration::from_millis(1)),
            Ok(0b1010)
        );
        assert_eq!(
            poll_register(&register, 0b1, 0b1, Duration::ZERO),
            Err(MmioError::Timeout)
        );
    }
}
