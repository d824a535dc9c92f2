// Copyright The Rusted Firmware-A Contributors.
//
// SPDX-License-Identifier: BSD-3-Clause

pub mod arch;
pub mod psci;
pub mod vendor;

use crate::{
    context::{ContextStore, CoreIndex, World},
    platform::{Platform, PlatformImpl},
    smccc::{FunctionId, NOT_SUPPORTED, SMC_REGISTER_COUNT, SmcReturn},
};
use log::debug;
use spin::Lazy;

/// Helper macro to define the range of SMC function ID values covered by a service
#[macro_export]
macro_rules! owns {
    // service handles the entire Owning Entity Number (OEN)
    ($owning_entity:expr) => {
        #[inline(always)]
        fn owns(&self, function: $crate::smccc::FunctionId) -> bool {
            function.oen() == $owning_entity
                && matches!(
                    function.call_type(),
                    $crate::smccc::SmcccCallType::Fast32 | $crate::smccc::SmcccCallType::Fast64
                )
        }
    };
    // service handles a sub-range of the OEN
    // range refers to the lower 16 bits [15:0] of the SMC FunctionId
    ($owning_entity:expr, $range:expr) => {
        #[inline(always)]
        fn owns(&self, function: $crate::smccc::FunctionId) -> bool {
            function.oen() == $owning_entity
                && $range.contains(&function.number())
                && matches!(
                    function.call_type(),
                    $crate::smccc::SmcccCallType::Fast32 | $crate::smccc::SmcccCallType::Fast64
                )
        }
    };
}
pub(crate) use owns;

/// What a service knows about the SMC it is handling.
pub struct CallContext<'a> {
    core: CoreIndex,
    caller_world: World,
    store: &'a ContextStore,
}

impl<'a> CallContext<'a> {
    pub fn new(store: &'a ContextStore, core: CoreIndex, caller_world: World) -> Self {
        Self {
            core,
            caller_world,
            store,
        }
    }

    /// The core the call was made on.
    pub fn core(&self) -> CoreIndex {
        self.core
    }

    /// The world the SMC was taken from.
    pub fn caller_world(&self) -> World {
        self.caller_world
    }

    /// Returns whether the caller is less trusted than the secure world.
    pub fn from_less_trusted(&self) -> bool {
        self.caller_world.is_less_trusted()
    }

    /// The world whose context the result will be written to.
    pub fn active_world(&self) -> World {
        self.store
            .active_world(self.core)
            .unwrap_or_else(|| panic!("No world is active on core {}", self.core))
    }

    /// Makes the call return to `target` instead of the caller.
    pub fn switch_world(&mut self, target: World) {
        self.store.prepare_world_switch(self.core, target);
    }
}

/// A service which handles some range of SMC calls.
///
/// According to SMCCC v1.3+ the implementation must disregard the SVE hint bit in the function ID
/// and consider it to be 0 for the purpose of function identification.
pub trait Service {
    /// Returns whether this service is intended to handle the given function ID.
    fn owns(&self, function: FunctionId) -> bool;

    /// Handles the given SMC call.
    ///
    /// Errors are reported through the returned registers, a service never aborts the dispatch.
    fn handle_smc(&self, regs: &[u64; SMC_REGISTER_COUNT], call: &mut CallContext) -> SmcReturn;
}

/// The outcome of dispatching an SMC.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SmcOutcome {
    /// A service handled the call, although it may still have returned an error.
    Handled,
    /// No service owns the function ID, or it was malformed.
    UnknownFunction,
}

/// Dispatches the SMC saved in the active context of `core` to the service which owns it, and
/// writes the result back to whichever context is active afterwards.
pub fn dispatch(services: &[&dyn Service], store: &ContextStore, core: CoreIndex) -> SmcOutcome {
    let mut regs = store.call_registers(core);
    let caller_world = store
        .active_world(core)
        .unwrap_or_else(|| panic!("SMC on core {core} with no active world"));

    let mut function = FunctionId::from_register(regs[0]);
    function.clear_sve_hint();
    regs[0] = function.0.into();

    let service = if function.valid() {
        services.iter().find(|service| service.owns(function))
    } else {
        None
    };
    let Some(service) = service else {
        debug!("Unknown SMC {function:?} from {caller_world:?} on core {core}");
        store.write_return_value(core, &NOT_SUPPORTED.into());
        return SmcOutcome::UnknownFunction;
    };

    if function.is_smc32() {
        for reg in &mut regs[1..] {
            *reg &= u64::from(u32::MAX);
        }
    }

    let mut call = CallContext::new(store, core, caller_world);
    let result = service.handle_smc(&regs, &mut call);
    store.write_return_value(core, &result);

    SmcOutcome::Handled
}

static SERVICES: Lazy<Services> = Lazy::new(Services::new);

/// Contains an instance of all of the currently implemented services.
pub struct Services {
    pub arch: arch::Arch,
    pub psci: psci::Psci,
    pub vendor: vendor::VendorEl3,
}

impl Services {
    /// Returns a reference to the global Services instance.
    ///
    /// Also, initializes it if it hasn't been initialized yet.
    pub fn get() -> &'static Self {
        &SERVICES
    }

    fn new() -> Self {
        Self {
            arch: arch::Arch::new(),
            psci: psci::Psci::new(
                PlatformImpl::psci_platform().expect("PSCI platform already taken"),
                PlatformImpl::secure_world_pm(),
                CoreIndex::current(),
            ),
            vendor: vendor::VendorEl3::new(),
        }
    }

    /// Handles the SMC which `core` has just trapped with.
    pub fn handle_smc(&self, store: &ContextStore, core: CoreIndex) -> SmcOutcome {
        dispatch(&[&self.arch, &self.psci, &self.vendor], store, core)
    }
}
