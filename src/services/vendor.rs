// Copyright The Rusted Firmware-A Contributors.
//
// SPDX-License-Identifier: BSD-3-Clause

//! Vendor-specific EL3 monitor calls.

use crate::{
    platform::PsciPlatformImpl,
    services::{CallContext, Service, owns, psci::PsciPlatformInterface},
    smccc::{
        CALL_COUNT, CALL_UID, FunctionId, INVALID_PARAMETER, NOT_SUPPORTED, OwningEntityNumber,
        REVISION, SMC_REGISTER_COUNT, SUCCESS, SmcReturn,
    },
};
use log::debug;
use num_enum::TryFromPrimitive;
use uuid::Uuid;

/// Identifies this firmware's EL3 monitor calls, as returned by `CALL_UID`.
const VENDOR_EL3_UUID: Uuid = Uuid::from_u128(0x8a4c_6d1e_5f3b_4e27_9c01_d2b7_43a8_e615);

const REVISION_MAJOR: u64 = 0;
const REVISION_MINOR: u64 = 1;

/// The number of topology entries returned by a single `POWER_DOMAIN_TOPOLOGY` call, in x2-x7.
const TOPOLOGY_ENTRIES_PER_CALL: usize = 6;

#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive)]
#[repr(u16)]
enum VendorFunction {
    PowerDomainTopology = 0x0000,
    CallCount = CALL_COUNT,
    CallUid = CALL_UID,
    Revision = REVISION,
}

impl VendorFunction {
    /// Functions other than the general queries.
    const COUNT: u64 = 1;
}

/// Vendor-specific EL3 monitor service.
pub struct VendorEl3;

impl Service for VendorEl3 {
    owns!(OwningEntityNumber::VENDOR_SPECIFIC_EL3_MONITOR);

    fn handle_smc(&self, regs: &[u64; SMC_REGISTER_COUNT], call: &mut CallContext) -> SmcReturn {
        let mut function = FunctionId::from_register(regs[0]);
        function.clear_sve_hint();

        let Ok(vendor_function) = VendorFunction::try_from(function.number()) else {
            debug!("Unknown vendor SMC {function:?} on core {}", call.core());
            return NOT_SUPPORTED.into();
        };

        match vendor_function {
            VendorFunction::PowerDomainTopology => power_domain_topology(regs[1]),
            VendorFunction::CallCount => VendorFunction::COUNT.into(),
            VendorFunction::CallUid => VENDOR_EL3_UUID.into(),
            VendorFunction::Revision => SmcReturn::from_slice(&[REVISION_MAJOR, REVISION_MINOR]),
        }
    }
}

impl VendorEl3 {
    pub(super) fn new() -> Self {
        Self
    }
}

/// Returns the power domain topology, in the breadth first format of
/// [`PsciPlatformInterface::topology`], starting at entry `start`.
///
/// x1 is the total number of entries, and x2-x7 hold the entries from `start` on. Registers past
/// the end of the topology are zero.
fn power_domain_topology(start: u64) -> SmcReturn {
    topology_page(PsciPlatformImpl::topology(), start)
}

fn topology_page(topology: &[usize], start: u64) -> SmcReturn {
    let Some(start) = usize::try_from(start)
        .ok()
        .filter(|start| *start <= topology.len())
    else {
        return INVALID_PARAMETER.into();
    };

    let mut values = [0; 2 + TOPOLOGY_ENTRIES_PER_CALL];
    values[0] = SUCCESS as u64;
    values[1] = topology.len() as u64;
    for (value, entry) in values[2..].iter_mut().zip(&topology[start..]) {
        *value = *entry as u64;
    }
    SmcReturn::from_slice(&values)
}
