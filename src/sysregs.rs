// Copyright The Rusted Firmware-A Contributors.
//
// SPDX-License-Identifier: BSD-3-Clause

//! Helpers on top of `arm_sysregs` for the fields the monitor cares about.

use arm_sysregs::{MpidrEl1, SpsrEl3, read_id_aa64pfr0_el1};
#[cfg(not(feature = "sel2"))]
use arm_sysregs::SctlrEl1;

/// Mask of all four affinity fields of an MPIDR value.
pub const MPIDR_AFFINITY_MASK: u64 = (MpidrEl1::AFF0_MASK << MpidrEl1::AFF0_SHIFT)
    | (MpidrEl1::AFF1_MASK << MpidrEl1::AFF1_SHIFT)
    | (MpidrEl1::AFF2_MASK << MpidrEl1::AFF2_SHIFT)
    | (MpidrEl1::AFF3_MASK << MpidrEl1::AFF3_SHIFT);

/// The RES1 bits of SCTLR_EL1.
#[cfg(not(feature = "sel2"))]
pub const SCTLR_EL1_RES1: SctlrEl1 = SctlrEl1::LSMAOE
    .union(SctlrEl1::NTLSMD)
    .union(SctlrEl1::SPAN)
    .union(SctlrEl1::EIS)
    .union(SctlrEl1::TSCXT)
    .union(SctlrEl1::EOS);

const SPSR_M_MASK: u64 = 0b1111;

/// Returns whether EL2 is implemented, according to ID_AA64PFR0_EL1.EL2.
pub fn is_el2_implemented() -> bool {
    read_id_aa64pfr0_el1().el2() != 0
}

/// Returns a copy of `spsr` targeting EL1 instead of its current mode, keeping the stack pointer
/// selection.
pub fn spsr_with_el1_mode(spsr: SpsrEl3) -> SpsrEl3 {
    let mode = SpsrEl3::M_AARCH64_EL1T | (spsr & SpsrEl3::SP_ELX);
    SpsrEl3::from_bits_retain((spsr.bits() & !SPSR_M_MASK) | mode.bits())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::lock_fake_sysregs;
    use arm_sysregs::{ExceptionLevel, IdAa64pfr0El1, fake::SYSREGS};

    #[test]
    fn affinity_mask_covers_all_levels() {
        assert_eq!(MPIDR_AFFINITY_MASK, 0xff_00ff_ffff);
        assert_eq!(MPIDR_AFFINITY_MASK & (MpidrEl1::MT | MpidrEl1::U).bits(), 0);
    }

    #[test]
    fn spsr_el1_mode() {
        let flags = SpsrEl3::D | SpsrEl3::A | SpsrEl3::I | SpsrEl3::F;
        let el2h = flags | SpsrEl3::M_AARCH64_EL2H;
        assert_eq!(el2h.exception_level(), ExceptionLevel::El2);

        let el1h = spsr_with_el1_mode(el2h);
        assert_eq!(el1h.exception_level(), ExceptionLevel::El1);
        assert_eq!(el1h, flags | SpsrEl3::M_AARCH64_EL1H);

        assert_eq!(
            spsr_with_el1_mode(SpsrEl3::M_AARCH64_EL2T),
            SpsrEl3::M_AARCH64_EL1T
        );
    }

    #[test]
    fn el2_presence() {
        let _sysregs = lock_fake_sysregs();
        assert!(is_el2_implemented());

        SYSREGS.lock().unwrap().id_aa64pfr0_el1 = IdAa64pfr0El1::empty().with_el1(1);
        assert!(!is_el2_implemented());
    }
}
