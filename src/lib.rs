// Copyright The Rusted Firmware-A Contributors.
//
// SPDX-License-Identifier: BSD-3-Clause

//! The runtime core of an EL3 secure monitor: saved world contexts, SMC dispatch and PSCI power
//! state coordination.
//!
//! The exception vectors and boot code of the firmware image call into the `extern "C"` functions
//! below, and restore whichever [`CpuContext`] they return before the exception return.

#![cfg_attr(not(test), no_std)]

mod aarch64;
mod context;
mod logger;
mod mmio;
mod platform;
#[cfg(not(any(test, platform = "fvp")))]
mod semihosting;
mod services;
mod smccc;
mod sysregs;

pub use context::CpuContext;

use crate::{
    context::{CONTEXTS, CoreIndex, World},
    platform::{Platform, PlatformImpl},
    services::{Services, psci::WakeUpReason},
};
use log::{debug, info};

#[cfg(not(test))]
unsafe extern "C" {
    /// The warm boot entry point of the firmware image, where powered on and resumed cores start.
    pub fn bl31_warm_entrypoint() -> !;
}

/// Cold boot of the primary core.
///
/// Initialises the platform and the contexts of every world on the calling core, and returns the
/// normal world context to enter. The arguments are those passed by the previous boot stage.
///
/// No secure payload dispatcher runs the secure world's own initialisation first, so the secure
/// world is only entered once a service switches to it.
#[cfg_attr(not(test), unsafe(no_mangle))]
pub extern "C" fn bl31_main(arg0: u64, arg1: u64, arg2: u64, arg3: u64) -> *mut CpuContext {
    PlatformImpl::init(arg0, arg1, arg2, arg3);

    info!("Rust BL31 starting");
    info!("Parameters: {arg0:#0x} {arg1:#0x} {arg2:#0x} {arg3:#0x}");

    let core = CoreIndex::current();
    CONTEXTS.init_context(core, World::Secure, &PlatformImpl::secure_entry_point());
    CONTEXTS.init_context(core, World::NonSecure, &PlatformImpl::non_secure_entry_point());
    #[cfg(feature = "rme")]
    CONTEXTS.init_context(core, World::Realm, &PlatformImpl::realm_entry_point());

    // Set up the power domain tree with this core running before anything can call into PSCI.
    Services::get();

    info!("Booting Normal World");
    CONTEXTS.prepare_world_switch(core, World::NonSecure);
    CONTEXTS.active_context_ptr(core)
}

/// Warm boot of a core which was turned on with `CPU_ON`, or woke up from a power down suspend.
///
/// Returns the normal world context to enter.
#[cfg_attr(not(test), unsafe(no_mangle))]
pub extern "C" fn psci_warmboot_entrypoint() -> *mut CpuContext {
    let core = CoreIndex::current();
    debug!("Warmboot on core {core}");

    match Services::get().psci.handle_cpu_boot(core) {
        WakeUpReason::CpuOn(psci_entrypoint) => {
            // Power on for the first time or after CPU_OFF
            debug!("Wakeup from CPU_OFF");

            let mut non_secure_entry_point = PlatformImpl::non_secure_entry_point();
            non_secure_entry_point.pc = psci_entrypoint.entry_point_address() as usize;
            non_secure_entry_point.args.fill(0);
            non_secure_entry_point.args[0] = psci_entrypoint.context_id();

            let secure_entry_point = PlatformImpl::secure_world_pm().secondary_entry_point();
            CONTEXTS.init_context(core, World::Secure, &secure_entry_point);
            CONTEXTS.init_context(core, World::NonSecure, &non_secure_entry_point);
            #[cfg(feature = "rme")]
            CONTEXTS.init_context(core, World::Realm, &PlatformImpl::realm_entry_point());
        }
        WakeUpReason::SuspendFinished(psci_entrypoint) => {
            debug!("Wakeup from CPU_SUSPEND");
            CONTEXTS.update_for_resume(core, psci_entrypoint);
        }
    }

    CONTEXTS.prepare_world_switch(core, World::NonSecure);
    CONTEXTS.active_context_ptr(core)
}

/// Handles an SMC trapped from a lower EL, whose arguments are in the active context of the calling
/// core.
///
/// Returns the context to return to, which is different from the caller's if the call switched
/// world.
#[cfg_attr(not(test), unsafe(no_mangle))]
pub extern "C" fn handle_smc_from_lower_el() -> *mut CpuContext {
    let core = CoreIndex::current();
    Services::get().handle_smc(&CONTEXTS, core);
    CONTEXTS.active_context_ptr(core)
}
