// Copyright The Rusted Firmware-A Contributors.
//
// SPDX-License-Identifier: BSD-3-Clause

use crate::{
    services::{CallContext, Service, owns},
    smccc::{
        FunctionId, NOT_SUPPORTED, OwningEntityNumber, SMC_REGISTER_COUNT, SUCCESS, SmcReturn,
    },
};

pub const SMCCC_VERSION: u32 = 0x8000_0000;
const SMCCC_ARCH_FEATURES: u32 = 0x8000_0001;

pub const SMCCC_VERSION_1_5: i32 = 0x0001_0005;

/// Arm architecture SMCs.
pub struct Arch;

impl Service for Arch {
    owns!(OwningEntityNumber::ARM_ARCHITECTURE);

    fn handle_smc(&self, regs: &[u64; SMC_REGISTER_COUNT], _call: &mut CallContext) -> SmcReturn {
        let mut function = FunctionId::from_register(regs[0]);
        function.clear_sve_hint();

        match function.0 {
            SMCCC_VERSION => version().into(),
            SMCCC_ARCH_FEATURES => arch_features(regs[1] as u32).into(),
            _ => NOT_SUPPORTED.into(),
        }
    }
}

impl Arch {
    pub(super) fn new() -> Self {
        Self
    }
}

fn version() -> i32 {
    SMCCC_VERSION_1_5
}

/// This SMC is specified in §7.2 of [the Arm SMC Calling
/// Convention](https://developer.arm.com/documentation/den0028/galp1/?lang=en).
fn arch_features(arch_func_id: u32) -> i32 {
    match arch_func_id {
        SMCCC_VERSION | SMCCC_ARCH_FEATURES => SUCCESS,
        _ => NOT_SUPPORTED,
    }
}
