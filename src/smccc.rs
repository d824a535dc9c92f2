// Copyright The Rusted Firmware-A Contributors.
//
// SPDX-License-Identifier: BSD-3-Clause

//! Types and helpers related to the SMC Calling Convention.

use core::fmt::{self, Debug, Display, Formatter};
use uuid::Uuid;

const FAST_CALL: u32 = 0x8000_0000;
const SMC64: u32 = 0x4000_0000;
const OEN_MASK: u32 = 0x3f00_0000;
const OEN_SHIFT: u8 = 24;
const SVE_HINT: u32 = 1 << 16;
const RESERVED_BITS: u32 = 0x7f << 17;

/// The number of registers passed to and returned from an SMC handler.
pub const SMC_REGISTER_COUNT: usize = 18;

/// The call completed successfully.
pub const SUCCESS: i32 = 0;

/// The call is not supported by the implementation.
///
/// This is also the "unknown function" result of the dispatcher.
pub const NOT_SUPPORTED: i32 = -1;

/// The call is deemed not required by the implementation.
#[allow(unused)]
pub const NOT_REQUIRED: i32 = -2;

/// One of the call parameters has a non-supported value.
pub const INVALID_PARAMETER: i32 = -3;

/// Function number of the Call Count query, common to every owning entity.
pub const CALL_COUNT: u16 = 0xff00;
/// Function number of the Call UID query, common to every owning entity.
pub const CALL_UID: u16 = 0xff01;
/// Function number of the Revision query, common to every owning entity.
pub const REVISION: u16 = 0xff03;

/// The type of an SMCCC call: whether it is a fast call or yielding call, and which calling
/// convention it uses.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum SmcccCallType {
    /// An SMC32/HVC32 fast call.
    Fast32,
    /// An SMC64/HVC64 fast call.
    Fast64,
    /// A yielding call.
    Yielding,
}

/// Owning Entity Number (OEN)
#[derive(Copy, Clone, Eq, PartialEq)]
pub struct OwningEntityNumber(pub u8);

impl OwningEntityNumber {
    pub const ARM_ARCHITECTURE: Self = Self(0);
    pub const SIP: Self = Self(2);
    pub const OEM: Self = Self(3);
    pub const STANDARD_SECURE: Self = Self(4);
    pub const VENDOR_SPECIFIC_EL3_MONITOR: Self = Self(7);

    /// Returns a short human readable name of the entity which owns this range.
    pub fn name(self) -> &'static str {
        match self.0 {
            0 => "Arm architecture",
            1 => "CPU",
            2 => "SiP",
            3 => "OEM",
            4 => "standard secure",
            5 => "standard hypervisor",
            6 => "vendor hypervisor",
            7 => "vendor EL3 monitor",
            48..=49 => "trusted application",
            50..=63 => "trusted OS",
            _ => "reserved",
        }
    }
}

impl Display for OwningEntityNumber {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Debug for OwningEntityNumber {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        write!(f, "{} ({})", self.0, self.name())
    }
}

/// An SMCCC function ID.
#[derive(Copy, Clone, Eq, PartialEq)]
#[repr(transparent)]
pub struct FunctionId(pub u32);

impl FunctionId {
    /// Creates a new `FunctionId` from its components.
    pub const fn new(call_type: SmcccCallType, oen: OwningEntityNumber, number: u16) -> Self {
        let type_bits = match call_type {
            SmcccCallType::Fast32 => FAST_CALL,
            SmcccCallType::Fast64 => FAST_CALL | SMC64,
            SmcccCallType::Yielding => 0,
        };
        Self(type_bits | (((oen.0 as u32) << OEN_SHIFT) & OEN_MASK) | (number as u32))
    }

    /// Extracts the function ID from the value of `x0` on entry.
    ///
    /// The upper 32 bits of `x0` are ignored.
    pub fn from_register(x0: u64) -> Self {
        Self(x0 as u32)
    }

    /// Returns the Owning Entity Number of the function ID.
    pub fn oen(self) -> OwningEntityNumber {
        OwningEntityNumber(((self.0 & OEN_MASK) >> OEN_SHIFT) as u8)
    }

    /// Returns the lower 16 bits of the function ID.
    pub fn number(self) -> u16 {
        self.0 as u16
    }

    /// Returns what type of call this is.
    pub fn call_type(self) -> SmcccCallType {
        if self.0 & FAST_CALL != 0 {
            if self.0 & SMC64 != 0 {
                SmcccCallType::Fast64
            } else {
                SmcccCallType::Fast32
            }
        } else {
            SmcccCallType::Yielding
        }
    }

    /// Returns whether this is a fast call.
    pub fn is_fast(self) -> bool {
        self.0 & FAST_CALL != 0
    }

    /// Returns whether the call uses the SMC32 convention, whose arguments are 32 bits wide.
    pub fn is_smc32(self) -> bool {
        self.0 & SMC64 == 0
    }

    /// Returns whether the SVE hint bit is set.
    ///
    /// If this is true, the caller asserts that P0-P15, FFR and the bits with index greater than
    /// 127 in the Z0-Z31 registers do not contain any live state.
    #[allow(unused)]
    pub fn sve_hint(self) -> bool {
        self.0 & SVE_HINT != 0
    }

    /// Sets the SVE hint bit.
    #[allow(unused)]
    pub fn set_sve_hint(&mut self) {
        self.0 |= SVE_HINT
    }

    /// Clears the SVE hint bit.
    pub fn clear_sve_hint(&mut self) {
        self.0 &= !SVE_HINT
    }

    /// Returns false if this is a fast call but has any of bits 17-23 set.
    ///
    /// They are reserved for future use and should always be 0.
    pub fn valid(self) -> bool {
        self.call_type() == SmcccCallType::Yielding || self.0 & RESERVED_BITS == 0
    }
}

impl Display for FunctionId {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        write!(f, "{:#010x}", self.0)
    }
}

impl Debug for FunctionId {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        write!(
            f,
            "{:#010x} ({:?} OEN {:?} function {:#x})",
            self.0,
            self.call_type(),
            self.oen(),
            self.number()
        )
    }
}

/// Truncates every argument register to 32 bits, as required for SMC32 calls.
pub fn truncate_to_smc32(regs: &mut [u64; SMC_REGISTER_COUNT]) {
    for reg in regs.iter_mut() {
        *reg &= u64::from(u32::MAX);
    }
}

/// A value which can be returned from an SMC call by writing to the caller's registers.
#[derive(Clone, Default, Eq, PartialEq)]
pub struct SmcReturn {
    /// The number of elements from `values` that are actually used for this return.
    used: usize,
    values: [u64; Self::MAX_VALUES],
}

impl SmcReturn {
    pub const MAX_VALUES: usize = SMC_REGISTER_COUNT;

    /// A return which leaves the caller's registers untouched.
    pub const EMPTY: Self = Self {
        used: 0,
        values: [0; SMC_REGISTER_COUNT],
    };

    /// Creates a return value from the given registers.
    ///
    /// Panics if more than [`Self::MAX_VALUES`] are given.
    pub fn from_slice(values: &[u64]) -> Self {
        assert!(values.len() <= Self::MAX_VALUES);
        let mut result = Self::EMPTY;
        result.values[..values.len()].copy_from_slice(values);
        result.used = values.len();
        result
    }

    /// Returns a slice containing the used values.
    pub fn values(&self) -> &[u64] {
        &self.values[0..self.used]
    }

    /// Returns a mutable slice containing the used values.
    pub fn values_mut(&mut self) -> &mut [u64] {
        &mut self.values[0..self.used]
    }

    /// Returns true if no values are used.
    pub fn is_empty(&self) -> bool {
        self.used == 0
    }
}

impl Debug for SmcReturn {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        f.write_str("SmcReturn([")?;
        for (i, value) in self.values().iter().enumerate() {
            if i != 0 {
                f.write_str(", ")?;
            }
            write!(f, "{value:#x}")?;
        }
        f.write_str("])")
    }
}

impl From<()> for SmcReturn {
    fn from(_: ()) -> Self {
        Self::EMPTY
    }
}

impl From<u64> for SmcReturn {
    fn from(value: u64) -> Self {
        Self::from_slice(&[value])
    }
}

impl From<i64> for SmcReturn {
    fn from(value: i64) -> Self {
        Self::from(value as u64)
    }
}

impl From<u32> for SmcReturn {
    fn from(value: u32) -> Self {
        Self::from(u64::from(value))
    }
}

/// Negative 32-bit return codes are sign extended to the full register width.
impl From<i32> for SmcReturn {
    fn from(value: i32) -> Self {
        Self::from(i64::from(value))
    }
}

/// Section 5.3 of the SMCCC returns UUIDs as four 32-bit words in x0-x3, each holding four bytes
/// of the UUID with the first byte in the least significant bits.
impl From<Uuid> for SmcReturn {
    fn from(value: Uuid) -> Self {
        let words = value
            .as_bytes()
            .chunks_exact(4)
            .map(|word| u64::from(u32::from_le_bytes([word[0], word[1], word[2], word[3]])));
        let mut result = Self::EMPTY;
        for (slot, word) in result.values.iter_mut().zip(words) {
            *slot = word;
        }
        result.used = 4;
        result
    }
}

impl<const N: usize> From<[u64; N]> for SmcReturn {
    fn from(value: [u64; N]) -> Self {
        Self::from_slice(&value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_function_id() {
        let psci_cpu_on64 = FunctionId(0xc400_0003);
        assert_eq!(psci_cpu_on64.call_type(), SmcccCallType::Fast64);
        assert_eq!(psci_cpu_on64.oen(), OwningEntityNumber::STANDARD_SECURE);
        assert_eq!(psci_cpu_on64.number(), 3);
        assert!(psci_cpu_on64.is_fast());
        assert!(!psci_cpu_on64.is_smc32());
        assert!(psci_cpu_on64.valid());

        let yielding = FunctionId(0x3200_0001);
        assert_eq!(yielding.call_type(), SmcccCallType::Yielding);
        assert_eq!(yielding.oen().name(), "trusted OS");

        assert_eq!(
            FunctionId::new(SmcccCallType::Fast32, OwningEntityNumber::STANDARD_SECURE, 3),
            FunctionId(0x8400_0003)
        );
        assert_eq!(
            FunctionId::from_register(0xffff_ffff_8400_0000),
            FunctionId(0x8400_0000)
        );
    }

    #[test]
    fn reserved_bits_invalidate_fast_calls_only() {
        assert!(!FunctionId(0x8400_0000 | (1 << 17)).valid());
        assert!(!FunctionId(0x8400_0000 | (1 << 23)).valid());
        assert!(FunctionId(0x0400_0000 | (1 << 17)).valid());
    }

    #[test]
    fn sve_hint() {
        let mut function = FunctionId(0x8000_0000);
        function.set_sve_hint();
        assert!(function.sve_hint());
        assert!(function.valid());
        function.clear_sve_hint();
        assert_eq!(function, FunctionId(0x8000_0000));
    }

    #[test]
    fn truncate_arguments() {
        let mut regs = [0xffff_ffff_ffff_ffff; SMC_REGISTER_COUNT];
        regs[1] = 0x1234_5678_9abc_def0;
        truncate_to_smc32(&mut regs);
        assert_eq!(regs[0], 0xffff_ffff);
        assert_eq!(regs[1], 0x9abc_def0);
    }

    #[test]
    fn return_values() {
        assert!(SmcReturn::from(()).is_empty());
        assert_eq!(SmcReturn::from(NOT_SUPPORTED).values(), [u64::MAX]);
        assert_eq!(SmcReturn::from(7u32).values(), [7]);
        assert_eq!(SmcReturn::from([1, 2, 3]).values(), [1, 2, 3]);
        assert_eq!(
            format!("{:?}", SmcReturn::from([0x10, 0x20])),
            "SmcReturn([0x10, 0x20])"
        );
    }

    #[test]
    fn uuid_return() {
        let uuid = Uuid::from_bytes([
            0x00, 0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08, 0x09, 0x0a, 0x0b, 0x0c, 0x0d,
            0x0e, 0x0f,
        ]);
        assert_eq!(
            SmcReturn::from(uuid).values(),
            [0x0302_0100, 0x0706_0504, 0x0b0a_0908, 0x0f0e_0d0c]
        );
    }
}
