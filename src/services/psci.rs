// Copyright The Rusted Firmware-A Contributors.
//
// SPDX-License-Identifier: BSD-3-Clause

//! Power State Coordination Interface.
//!
//! Cores ask to be suspended or turned off for themselves, and the coordinator works out which of
//! their ancestor power domains (clusters, SoCs, the whole system) may follow them into a deeper
//! state. All platform specific work is done through [`PsciPlatformInterface`].

mod power_domain_tree;

use crate::{
    aarch64::{dsb_sy, park, wfi},
    context::{CoreIndex, EntryPointInfo, World},
    platform::{Platform, PlatformError, PlatformImpl, PlatformPowerState, PsciPlatformImpl},
    services::{CallContext, Service, owns},
    smccc::{NOT_SUPPORTED, OwningEntityNumber, SMC_REGISTER_COUNT, SmcReturn},
};
use arm_sysregs::read_isr_el1;
use arm_psci::{
    AffinityInfo, Cookie, EntryPoint, ErrorCode, FeatureFlagsCpuSuspend, FeatureFlagsSystemOff2,
    Function, FunctionId, HwState, MemProtectRange, MigrateInfoType, Mpidr, PowerState,
    PsciFeature, ResetType, SuspendMode, SystemOff2Type, Version,
};
use bitflags::bitflags;
use core::fmt::{self, Debug, Display, Formatter};
use log::{debug, info, warn};
use power_domain_tree::{
    AncestorPowerDomains, LockedCpuNode, PowerDomainTree, PowerStateSnapshot,
    core_to_linear_index,
};
use spin::mutex::SpinMutex;

const FUNCTION_NUMBER_MIN: u16 = 0x0000;
const FUNCTION_NUMBER_MAX: u16 = 0x001F;

bitflags! {
    /// Optional platform feature flags
    #[derive(Debug, Eq, PartialEq, Clone, Copy)]
    #[repr(transparent)]
    pub struct PsciPlatformOptionalFeatures: u64 {
        const SYSTEM_OFF2 = 1 << 0;
        const SYSTEM_RESET2 = 1 << 1;
        const MEM_PROTECT = 1 << 2;
        const MEM_PROTECT_CHECK_RANGE = 1 << 3;
        const CPU_FREEZE = 1 << 4;
        const CPU_DEFAULT_SUSPEND = 1 << 5;
        const NODE_HW_STATE = 1 << 6;
        const SYSTEM_SUSPEND = 1 << 7;
        const OS_INITIATED_MODE = 1 << 8;
    }
}

/// Platform-specific power state interface
///
/// The platform has to provide a platform-specific power state type which implements this trait
/// and all of the dependent traits.
///
/// The type has to implement the `Ord` trait in a way the states are in ascending order from
/// running state to power down state.
pub trait PlatformPowerStateInterface: Debug + Clone + Copy + Eq + Ord {
    /// The deepest state, in which the domain is powered off.
    const OFF: Self;
    /// The shallowest state, in which the domain is running.
    const RUN: Self;

    /// Returns the type of the platform-specific power state.
    fn power_state_type(&self) -> PowerStateType;
}

/// PSCI platform interface
///
/// The interface contains mandatory and optional constants and functions. Whether the platform
/// implements the optional functions has to be in sync with the reported optional features in the
/// `FEATURES` constant.
///
/// Hooks which talk to the power controller return a [`PlatformError`] if the hardware doesn't
/// complete the request. Before the point of no return the coordinator undoes its own state change
/// and reports an internal failure to the caller; a failure of a finish hook is fatal.
pub trait PsciPlatformInterface {
    /// Count of all power domains
    const POWER_DOMAIN_COUNT: usize;
    /// Maximal power level in the system
    const MAX_POWER_LEVEL: usize;

    /// Flags for describing optional features implemented by the platform.
    const FEATURES: PsciPlatformOptionalFeatures;

    /// Platform-specific power state type
    type PlatformPowerState: PlatformPowerStateInterface;

    /// Returns the power domain topology as the count of child nodes in a BFS traversal order.
    fn topology() -> &'static [usize];

    /// Tries to convert extended PSCI power state value into `PsciCompositePowerState`.
    ///
    /// Returns `None` for power states the platform doesn't support.
    fn try_parse_power_state(power_state: PowerState) -> Option<PsciCompositePowerState>;

    /// Places the current CPU into standby state and continues execution on interrupt.
    /// The caller has to guarantee that `cpu_state` is a standby power state, otherwise
    /// `cpu_standby` should panic.
    fn cpu_standby(&self, cpu_state: PlatformPowerState) -> Result<(), PlatformError>;

    /// Prepares the power domains for the given suspend state, e.g. programs the power controller.
    /// The domains only go down when the CPU next waits for interrupts.
    fn power_domain_suspend(
        &self,
        target_state: &PsciCompositePowerState,
    ) -> Result<(), PlatformError>;

    /// Performs platform-specific operations after a wake-up from a suspend state.
    fn power_domain_suspend_finish(
        &self,
        previous_state: &PsciCompositePowerState,
    ) -> Result<(), PlatformError>;

    /// Callback for platform housekeeping before turning off the CPU, optional.
    fn power_domain_off_early(
        &self,
        _target_state: &PsciCompositePowerState,
    ) -> Result<(), ErrorCode> {
        Ok(())
    }

    /// Perform platform-specific actions to turn this cpu off e.g. program the power controller.
    fn power_domain_off(&self, target_state: &PsciCompositePowerState) -> Result<(), PlatformError>;

    /// Platform-specific function for entering WFI on power down, optional.
    fn power_domain_power_down_wfi(&self, _target_state: &PsciCompositePowerState) -> ! {
        dsb_sy();
        park()
    }

    /// Turn on power domain, which is identified by its MPIDR.
    fn power_domain_on(&self, mpidr: Mpidr) -> Result<(), PlatformError>;

    /// Perform platform-specific actions after the CPU has been turned on.
    fn power_domain_on_finish(
        &self,
        previous_state: &PsciCompositePowerState,
    ) -> Result<(), PlatformError>;

    /// Shuts down the system. Only returns if the hardware didn't accept the request.
    fn system_off(&self) -> Result<(), PlatformError>;

    /// Suspend to disk, optional.
    fn system_off2(&self, _off_type: SystemOff2Type, _cookie: Cookie) -> Result<(), ErrorCode> {
        unimplemented!("SYSTEM_OFF2 is not implemented for the platform")
    }

    /// Resets the system, the behavior is equivalent to a hardware power-cycle sequence. Only
    /// returns if the hardware didn't accept the request.
    fn system_reset(&self) -> Result<(), PlatformError>;

    /// Architectural or vendor specific reset function, optional.
    fn system_reset2(&self, _reset_type: ResetType, _cookie: Cookie) -> Result<(), ErrorCode> {
        unimplemented!("SYSTEM_RESET2 is not implemented for the platform")
    }

    /// Enable memory protection and returns the previous state, optional.
    fn mem_protect(&self, _enabled: bool) -> Result<bool, ErrorCode> {
        unimplemented!("MEM_PROTECT is not implemented for the platform")
    }

    /// Checks if the memory range is protected, optional.
    fn mem_protect_check_range(&self, _range: MemProtectRange) -> Result<(), ErrorCode> {
        unimplemented!("MEM_PROTECT_CHECK_RANGE is not implemented for the platform")
    }

    /// Places a core into an implementation defined low-power state where an interrupt does not
    /// return the core back into a running state.
    fn cpu_freeze(&self) -> ! {
        unimplemented!("CPU_FREEZE is not implemented for the platform")
    }

    /// Returns the power state for `CPU_DEFAULT_SUSPEND`, optional.
    fn cpu_default_suspend_power_state(&self) -> PowerState {
        unimplemented!("CPU_DEFAULT_SUSPEND is not implemented for the platform")
    }

    /// Returns the true hardware state of a power domain, optional.
    fn node_hw_state(&self, _mpidr: Mpidr, _power_level: u32) -> Result<HwState, ErrorCode> {
        unimplemented!("NODE_HW_STATE is not implemented for the platform")
    }

    /// Returns the power state for `SYSTEM_SUSPEND`, optional.
    fn sys_suspend_power_state(&self) -> PsciCompositePowerState {
        unimplemented!("SYSTEM_SUSPEND is not implemented for the platform")
    }

    /// Validates a non-secure entry point, optional.
    fn is_valid_ns_entrypoint(&self, _entry: &EntryPoint) -> bool {
        true
    }

    /// Checks if the CPU has pending interrupts
    fn has_pending_interrupts(&self) -> bool {
        !read_isr_el1().is_empty()
    }
}

/// Power management notifications for the secure world payload.
///
/// The coordinator calls these around power transitions of a core, so that the payload can save or
/// restore its own per-core state. All of them run on the affected core except `cpu_on`, which runs
/// on the core issuing `CPU_ON`.
pub trait SecureWorldPm: Sync {
    /// The core is about to be turned off. Returning an error denies the `CPU_OFF` call before any
    /// power state changes.
    fn cpu_off(&self, core: CoreIndex) -> Result<(), ErrorCode>;

    /// The core is about to enter a power down suspend state, in which power domains up to
    /// `max_off_level` lose their state.
    fn cpu_suspend(&self, core: CoreIndex, max_off_level: usize);

    /// `target` is about to be powered on.
    fn cpu_on(&self, target: CoreIndex);

    /// The core finished powering on, before its secure context is initialised.
    fn cpu_on_finish(&self, core: CoreIndex);

    /// The core woke up from a power down suspend state entered with the given `max_off_level`.
    fn cpu_suspend_finish(&self, core: CoreIndex, max_off_level: usize);

    /// Returns the entry point of the secure world for cores which were turned on with `CPU_ON`.
    fn secondary_entry_point(&self) -> EntryPointInfo;
}

/// [`SecureWorldPm`] for systems without a secure payload dispatcher, which ignores every event.
pub struct NoSecurePayload;

impl SecureWorldPm for NoSecurePayload {
    fn cpu_off(&self, _core: CoreIndex) -> Result<(), ErrorCode> {
        Ok(())
    }

    fn cpu_suspend(&self, _core: CoreIndex, _max_off_level: usize) {}

    fn cpu_on(&self, _target: CoreIndex) {}

    fn cpu_on_finish(&self, _core: CoreIndex) {}

    fn cpu_suspend_finish(&self, _core: CoreIndex, _max_off_level: usize) {}

    fn secondary_entry_point(&self) -> EntryPointInfo {
        PlatformImpl::secure_entry_point()
    }
}

/// Classification of platform power states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PowerStateType {
    /// The domain loses its state and must be restored on wake-up.
    PowerDown,
    /// The domain keeps its state but doesn't run.
    StandbyOrRetention,
    /// The domain is running.
    Run,
}

/// Why a core entered the firmware through the warm boot path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WakeUpReason {
    /// Another core turned this one on with `CPU_ON`.
    CpuOn(EntryPoint),
    /// The core woke up from a power down suspend state.
    SuspendFinished(EntryPoint),
}

/// The platform hook a power operation failed in.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum PowerHook {
    /// `cpu_standby`
    Standby,
    /// `power_domain_suspend`
    Suspend,
    /// `power_domain_off`
    Off,
    /// `power_domain_on`
    On,
    /// `system_off`
    SystemOff,
    /// `system_reset`
    SystemReset,
}

impl PowerHook {
    /// Records that this hook failed because of `cause`.
    pub fn failed(self, cause: PlatformError) -> PowerOpError {
        PowerOpError { hook: self, cause }
    }
}

impl Display for PowerHook {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        let name = match self {
            Self::Standby => "cpu_standby",
            Self::Suspend => "power_domain_suspend",
            Self::Off => "power_domain_off",
            Self::On => "power_domain_on",
            Self::SystemOff => "system_off",
            Self::SystemReset => "system_reset",
        };
        f.write_str(name)
    }
}

/// A power operation the platform couldn't carry out. The power domain tree was left as it was
/// before the operation started.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct PowerOpError {
    /// The hook which failed.
    pub hook: PowerHook,
    /// What went wrong in the hardware.
    pub cause: PlatformError,
}

impl Display for PowerOpError {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        write!(f, "{} failed: {}", self.hook, self.cause)
    }
}

/// Failure of a PSCI call.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum PsciError {
    /// The caller's request was rejected.
    Call(ErrorCode),
    /// The request was valid but the platform failed to carry it out.
    PowerOp(PowerOpError),
}

impl From<ErrorCode> for PsciError {
    fn from(error: ErrorCode) -> Self {
        Self::Call(error)
    }
}

impl From<PowerOpError> for PsciError {
    fn from(error: PowerOpError) -> Self {
        Self::PowerOp(error)
    }
}

impl From<PsciError> for ErrorCode {
    fn from(error: PsciError) -> Self {
        match error {
            PsciError::Call(error) => error,
            PsciError::PowerOp(_) => ErrorCode::InternalFailure,
        }
    }
}

/// Object for storing platform-specific power state for multiple power levels.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PsciCompositePowerState {
    /// The state of each power level, starting from the CPU.
    pub states: [PlatformPowerState; PsciPlatformImpl::MAX_POWER_LEVEL + 1],
}

impl PsciCompositePowerState {
    /// The power level of CPU nodes.
    pub const CPU_POWER_LEVEL: usize = 0;

    /// States set to OFF on all levels.
    pub const OFF: Self = Self {
        states: [PlatformPowerState::OFF; PsciPlatformImpl::MAX_POWER_LEVEL + 1],
    };

    /// States set to RUN on all levels.
    pub const RUN: Self = Self {
        states: [PlatformPowerState::RUN; PsciPlatformImpl::MAX_POWER_LEVEL + 1],
    };

    /// Creates a composite state from the state of each level, CPU level first.
    pub fn new(states: [PlatformPowerState; PsciPlatformImpl::MAX_POWER_LEVEL + 1]) -> Self {
        Self { states }
    }

    /// Returns the power state of the CPU level.
    pub fn cpu_level_state(&self) -> PlatformPowerState {
        self.states[Self::CPU_POWER_LEVEL]
    }

    /// Returns the power state of the highest level of the topology.
    pub fn highest_level_state(&self) -> PlatformPowerState {
        self.states[PsciPlatformImpl::MAX_POWER_LEVEL]
    }

    /// Find the highest power level which is not set to running state.
    pub fn find_highest_non_run_level(&self) -> Option<usize> {
        self.states
            .iter()
            .rposition(|state| state.power_state_type() != PowerStateType::Run)
    }

    /// Find the highest power level which is set to power down state.
    pub fn find_highest_power_down_level(&self) -> Option<usize> {
        self.states
            .iter()
            .rposition(|state| state.power_state_type() == PowerStateType::PowerDown)
    }

    /// Fill the structure with the current local states of the given CPU node and its ancestor
    /// non-CPU power domain nodes.
    fn set_local_states_from_nodes(&mut self, cpu: &LockedCpuNode, ancestors: &AncestorPowerDomains) {
        self.states[Self::CPU_POWER_LEVEL] = cpu.local_state();

        for (node, state) in ancestors
            .iter()
            .zip(&mut self.states[Self::CPU_POWER_LEVEL + 1..])
        {
            *state = node.local_state();
        }
    }

    /// Requests the power state for all ancestor nodes and sets the minimal local state for each
    /// node. When a CPU node enters a lower power state, its ancestor nodes may also be able to
    /// transition to a lower power state. Each non-CPU power node maintains a list of power states
    /// requested by its descendant nodes. This function sets the lowest power state permitted by
    /// the list of requested states.
    fn coordinate_state(&mut self, core: CoreIndex, ancestors: &mut AncestorPowerDomains) {
        let mut higher_levels_are_run = false;

        for (node, state) in ancestors
            .iter_mut()
            .zip(&mut self.states[Self::CPU_POWER_LEVEL + 1..])
        {
            node.set_requested_power_state(core, *state);

            if !higher_levels_are_run {
                node.set_minimal_allowed_state();
                *state = node.local_state();

                if state.power_state_type() == PowerStateType::Run {
                    // We reached a level where running states is required, so all power states
                    // on the higher level can be set to run.
                    higher_levels_are_run = true;
                }
            } else {
                // If there was a running state on a previous level, there's no need for finding
                // the minimal allowed state because it can only be in running state.
                *state = PlatformPowerState::RUN;
            }
        }
    }

    /// Checks that the composite state does not violate any PSCI rules.
    pub fn is_valid_suspend_request(&self, is_power_down_state: bool) -> bool {
        // There should be a non-run level
        if self.find_highest_non_run_level().is_none() {
            return false;
        };

        // Higher levels must be in less than or equal power state
        if !self.states.is_sorted_by(|a, b| a >= b) {
            return false;
        }

        if is_power_down_state {
            // There must be a power down state
            self.find_highest_power_down_level().is_some()
        } else {
            // Retention state, there should not be a power state on any level
            self.find_highest_power_down_level().is_none()
        }
    }
}

/// Main PSCI structure of the PSCI implementation that handles all the PSCI calls and stores the
/// the power state representation of each power domain.
pub struct Psci {
    platform: PsciPlatformImpl,
    secure_world: &'static dyn SecureWorldPm,
    power_domain_tree: PowerDomainTree,
    suspend_mode: SpinMutex<SuspendMode>,
}

impl Psci {
    /// Initialises the PSCI state, with `boot_core` as the only one running.
    ///
    /// This should be called exactly once, before any other PSCI methods are called or any
    /// secondary CPUs are started.
    pub(super) fn new(
        platform: PsciPlatformImpl,
        secure_world: &'static dyn SecureWorldPm,
        boot_core: CoreIndex,
    ) -> Self {
        info!("Initializing PSCI");

        let power_domain_tree = PowerDomainTree::new(PsciPlatformImpl::topology());

        {
            let core = boot_core;
            let mut cpu = power_domain_tree.locked_cpu_node(core);

            power_domain_tree.with_ancestors_locked(&mut cpu, |cpu, mut ancestors| {
                cpu.set_affinity_info(AffinityInfo::On);
                cpu.set_local_state(PlatformPowerState::RUN);
                ancestors.set_run(core);
            });
        }

        Self {
            platform,
            secure_world,
            power_domain_tree,
            suspend_mode: SpinMutex::new(SuspendMode::PlatformCoordinated),
        }
    }

    /// Handles `CPU_SUSPEND` PSCI call by following the steps below.
    /// * If the a standby power state is requested which only affects the CPU level, the wait for
    ///   interrupts by calling `cpu_standby` and then return after an interrupt.
    /// * If a power down state is requested or a standby request affects higher levels, then call
    ///   `cpu_suspend_start`.
    fn cpu_suspend(
        &self,
        core: CoreIndex,
        power_state: PowerState,
        entry_point: EntryPoint,
    ) -> Result<(), PsciError> {
        let composite_state = PsciPlatformImpl::try_parse_power_state(power_state)
            .ok_or(ErrorCode::InvalidParameters)?;

        let is_power_down_state = matches!(power_state, PowerState::PowerDown(_));

        if !composite_state.is_valid_suspend_request(is_power_down_state) {
            return Err(ErrorCode::InvalidParameters.into());
        }

        let highest_affected_level = composite_state
            .find_highest_non_run_level()
            .ok_or(ErrorCode::InvalidParameters)?;

        if !is_power_down_state
            && highest_affected_level == PsciCompositePowerState::CPU_POWER_LEVEL
        {
            // CPU standby which does not affect parent nodes
            let cpu_pd_state = composite_state.cpu_level_state();
            self.power_domain_tree
                .locked_cpu_node(core)
                .set_local_state(cpu_pd_state);

            // Wait for interrupts, then continue with the core running again either way.
            let result = self.platform.cpu_standby(cpu_pd_state);

            self.power_domain_tree
                .locked_cpu_node(core)
                .set_local_state(PlatformPowerState::RUN);

            result.map_err(|cause| PowerHook::Standby.failed(cause).into())
        } else {
            if is_power_down_state && !self.platform.is_valid_ns_entrypoint(&entry_point) {
                return Err(ErrorCode::InvalidAddress.into());
            }

            self.cpu_suspend_start(
                core,
                Some(power_state),
                entry_point,
                highest_affected_level,
                composite_state,
                is_power_down_state,
            )
        }
    }

    /// Handles the common part of `CPU_SUSPEND` and `SYSTEM_SUSPEND` PSCI calls. The `power_state`
    /// argument is `None` when coming from `SYSTEM_SUSPEND` handler because it does not have
    /// power state parameter.
    ///
    /// The function follows the steps below.
    /// * Return immediately if there's a pending interrupt.
    /// * In OS initiated mode, deny requests which would put a power domain into a deeper state
    ///   than one of its other cores has asked for.
    /// * Otherwise determine the valid state for each level without violating any power domain
    ///   rules.
    /// * Request this power state from the platform layer (`power_domain_suspend`). This step does
    ///   not trigger an immediate shutdown of the power domain. If the platform fails, the tree is
    ///   put back as it was and the error returned.
    /// * Power down the domain by calling `power_domain_power_down_wfi` if this is a power down
    ///   request. `cpu_suspend_start` does not return after this point. When the CPU wakes up, the
    ///   boot code must call `handle_cpu_boot` that completes the power down suspend operation.
    /// * If the requested power state is a standby state, call a `WFI` and restore running state
    ///   after waking up by an interrupt.
    fn cpu_suspend_start(
        &self,
        core: CoreIndex,
        power_state: Option<PowerState>,
        entry: EntryPoint,
        highest_affected_level: usize,
        mut composite_state: PsciCompositePowerState,
        is_power_down_state: bool,
    ) -> Result<(), PsciError> {
        let os_initiated =
            power_state.is_some() && *self.suspend_mode.lock() == SuspendMode::OsInitiated;

        let mut cpu = self.power_domain_tree.locked_cpu_node(core);
        let suspending = self.power_domain_tree.with_ancestors_locked_to_max_level(
            &mut cpu,
            highest_affected_level,
            |cpu, mut ancestors| -> Result<bool, PsciError> {
                if self.platform.has_pending_interrupts() {
                    return Ok(false);
                }

                if os_initiated {
                    Self::validate_os_initiated_request(
                        core,
                        &composite_state,
                        highest_affected_level,
                        &ancestors,
                    )?;
                }

                let snapshot = PowerStateSnapshot::take(cpu, &ancestors);

                composite_state.coordinate_state(core, &mut ancestors);
                cpu.set_local_state(composite_state.cpu_level_state());
                cpu.set_highest_affected_level(highest_affected_level);
                if is_power_down_state {
                    cpu.set_entry_point(entry);
                }

                if let Err(cause) = self.platform.power_domain_suspend(&composite_state) {
                    snapshot.restore(cpu, &mut ancestors);
                    return Err(PowerHook::Suspend.failed(cause).into());
                }
                Ok(true)
            },
        )?;
        drop(cpu); // Unlock CPU before entering suspend state

        if !suspending {
            debug!("Core {core} has pending interrupts, not suspending");
            return Ok(());
        }

        if is_power_down_state {
            if let Some(max_off_level) = composite_state.find_highest_power_down_level() {
                self.secure_world.cpu_suspend(core, max_off_level);
            }
            self.platform.power_domain_power_down_wfi(&composite_state);
        }

        // Go to suspend by waiting for interrupts.
        wfi();

        // Restore running state after wake-up.
        let mut cpu = self.power_domain_tree.locked_cpu_node(core);
        self.power_domain_tree.with_ancestors_locked_to_max_level(
            &mut cpu,
            highest_affected_level,
            |cpu, mut ancestors| {
                composite_state.set_local_states_from_nodes(cpu, &ancestors);

                if let Err(e) = self.platform.power_domain_suspend_finish(&composite_state) {
                    panic!("Core {core} failed to finish suspend: {e}");
                }
                cpu.clear_highest_affected_level();
                cpu.set_local_state(PlatformPowerState::RUN);
                ancestors.set_run(core);
            },
        );
        Ok(())
    }

    /// Checks an OS initiated suspend request against the requests of the other cores in each
    /// affected power domain.
    fn validate_os_initiated_request(
        core: CoreIndex,
        composite_state: &PsciCompositePowerState,
        highest_affected_level: usize,
        ancestors: &AncestorPowerDomains,
    ) -> Result<(), ErrorCode> {
        for (node, requested) in ancestors
            .iter()
            .zip(&composite_state.states[PsciCompositePowerState::CPU_POWER_LEVEL + 1..])
        {
            if *requested > node.get_minimal_allowed_state_without_core(core) {
                return Err(ErrorCode::Denied);
            }
        }

        if !ancestors.is_last_cpu_to_idle_at_power_level(core, highest_affected_level) {
            return Err(ErrorCode::Denied);
        }

        Ok(())
    }

    /// Handles `CPU_OFF` PSCI call.
    /// On success, turns off the current CPU and does not return.
    fn cpu_off(&self, core: CoreIndex) -> Result<(), PsciError> {
        let mut composite_state = PsciCompositePowerState::OFF;

        self.secure_world.cpu_off(core)?;

        self.platform.power_domain_off_early(&composite_state)?;

        let mut cpu = self.power_domain_tree.locked_cpu_node(core);
        self.power_domain_tree
            .with_ancestors_locked(&mut cpu, |cpu, mut ancestors| {
                let snapshot = PowerStateSnapshot::take(cpu, &ancestors);

                cpu.set_local_state(PlatformPowerState::OFF);
                composite_state.coordinate_state(core, &mut ancestors);

                if let Err(cause) = self.platform.power_domain_off(&composite_state) {
                    snapshot.restore(cpu, &mut ancestors);
                    return Err(PowerHook::Off.failed(cause));
                }
                Ok(())
            })?;

        cpu.set_affinity_info(AffinityInfo::Off);

        // Unlock CPU before actually turning it off
        drop(cpu);

        debug!("Core {core} powering down: {composite_state:?}");
        self.platform.power_domain_power_down_wfi(&composite_state)
    }

    /// Handles `CPU_ON` PSCI call by turning on the CPU identified by the given `target_cpu` MPIDR.
    /// The caller has to provide a valid non-secure entry point for the CPU.
    ///
    /// The entry point is stored under the target's lock before the platform is asked to power it
    /// on, so the target always finds it when it boots.
    fn cpu_on(&self, target_cpu: Mpidr, entry: EntryPoint) -> Result<(), PsciError> {
        let core = core_to_linear_index(target_cpu.into()).ok_or(ErrorCode::InvalidParameters)?;

        if !self.platform.is_valid_ns_entrypoint(&entry) {
            return Err(ErrorCode::InvalidAddress.into());
        }

        let mut cpu = self.power_domain_tree.locked_cpu_node(core);
        match cpu.affinity_info() {
            AffinityInfo::On => return Err(ErrorCode::AlreadyOn.into()),
            AffinityInfo::OnPending => return Err(ErrorCode::OnPending.into()),
            // The CPU was off, so continue CPU on operation.
            AffinityInfo::Off => {}
        }

        cpu.set_affinity_info(AffinityInfo::OnPending);
        cpu.set_entry_point(entry);
        self.secure_world.cpu_on(core);

        if let Err(cause) = self.platform.power_domain_on(target_cpu) {
            cpu.pop_entry_point();
            cpu.set_affinity_info(AffinityInfo::Off);
            return Err(PowerHook::On.failed(cause).into());
        }

        debug!("Core {core} powering on");
        Ok(())
    }

    /// This function must be called on `core` when it is powered up. It returns the non-secure
    /// entry point and the reason why the CPU was powered up.
    pub fn handle_cpu_boot(&self, core: CoreIndex) -> WakeUpReason {
        let mut cpu = self.power_domain_tree.locked_cpu_node(core);
        let mut composite_state = PsciCompositePowerState::RUN;

        let affinity_info = cpu.affinity_info();
        if affinity_info == AffinityInfo::Off {
            drop(cpu);
            panic!("Core {core} booted without being turned on");
        }

        let target_power_level = cpu
            .highest_affected_level()
            .unwrap_or(PsciPlatformImpl::MAX_POWER_LEVEL);

        let wake_from_suspend = self.power_domain_tree.with_ancestors_locked_to_max_level(
            &mut cpu,
            target_power_level,
            |cpu, mut ancestors| {
                composite_state.set_local_states_from_nodes(cpu, &ancestors);

                let wake_from_suspend = if affinity_info == AffinityInfo::OnPending {
                    // Finishing CPU_ON
                    if let Err(e) = self.platform.power_domain_on_finish(&composite_state) {
                        panic!("Core {core} failed to finish powering on: {e}");
                    }
                    self.secure_world.cpu_on_finish(core);
                    cpu.set_affinity_info(AffinityInfo::On);
                    false
                } else {
                    // Waking up from suspend
                    assert_eq!(
                        composite_state.cpu_level_state().power_state_type(),
                        PowerStateType::PowerDown
                    );

                    if let Err(e) = self.platform.power_domain_suspend_finish(&composite_state) {
                        panic!("Core {core} failed to finish suspend: {e}");
                    }
                    let max_off_level = composite_state
                        .find_highest_power_down_level()
                        .unwrap_or(PsciCompositePowerState::CPU_POWER_LEVEL);
                    self.secure_world.cpu_suspend_finish(core, max_off_level);
                    cpu.clear_highest_affected_level();
                    true
                };

                cpu.set_local_state(PlatformPowerState::RUN);
                ancestors.set_run(core);
                wake_from_suspend
            },
        );

        let entry_point = cpu.pop_entry_point();
        drop(cpu); // Unlock before possible panic

        let entry_point =
            entry_point.unwrap_or_else(|| panic!("Entry point not set for booting core {core}"));

        if wake_from_suspend {
            WakeUpReason::SuspendFinished(entry_point)
        } else {
            WakeUpReason::CpuOn(entry_point)
        }
    }

    /// Handles `AFFINITY_INFO` PSCI call.
    fn affinity_info(
        &self,
        target_affinity: Mpidr,
        lowest_affinity_level: u32,
    ) -> Result<AffinityInfo, ErrorCode> {
        let core =
            core_to_linear_index(target_affinity.into()).ok_or(ErrorCode::InvalidParameters)?;

        if lowest_affinity_level as usize > PsciCompositePowerState::CPU_POWER_LEVEL {
            // We don't support levels higher than CPU_POWER_LEVEL.
            return Err(ErrorCode::InvalidParameters);
        }

        Ok(self.power_domain_tree.locked_cpu_node(core).affinity_info())
    }

    /// Handles `SYSTEM_OFF` PSCI call.
    /// Turns off the system and only returns if the platform failed to do so.
    fn system_off(&self) -> PowerOpError {
        info!("System off requested");
        match self.platform.system_off() {
            Ok(()) => park(),
            Err(cause) => PowerHook::SystemOff.failed(cause),
        }
    }

    /// Handles `SYSTEM_OFF2` PSCI call.
    /// Suspends system to disk and never returns on success.
    fn system_off2(&self, off_type: SystemOff2Type, cookie: Cookie) -> Result<(), ErrorCode> {
        if !PsciPlatformImpl::FEATURES.contains(PsciPlatformOptionalFeatures::SYSTEM_OFF2) {
            return Err(ErrorCode::NotSupported);
        }

        self.platform.system_off2(off_type, cookie)
    }

    /// Handles `SYSTEM_RESET` PSCI call.
    /// Resets the system and only returns if the platform failed to do so.
    fn system_reset(&self) -> PowerOpError {
        info!("System reset requested");
        match self.platform.system_reset() {
            Ok(()) => park(),
            Err(cause) => PowerHook::SystemReset.failed(cause),
        }
    }

    /// Handles `SYSTEM_RESET2` PSCI call.
    /// Initiates an architectural or vendor specific system reset. Does not return on success.
    fn system_reset2(&self, reset_type: ResetType, cookie: Cookie) -> Result<(), ErrorCode> {
        if !PsciPlatformImpl::FEATURES.contains(PsciPlatformOptionalFeatures::SYSTEM_RESET2) {
            return Err(ErrorCode::NotSupported);
        }

        self.platform.system_reset2(reset_type, cookie)
    }

    /// Handles `MEM_PROTECT` PSCI call.
    fn mem_protect(&self, enabled: bool) -> Result<bool, ErrorCode> {
        if !PsciPlatformImpl::FEATURES.contains(PsciPlatformOptionalFeatures::MEM_PROTECT) {
            return Err(ErrorCode::NotSupported);
        }

        self.platform.mem_protect(enabled)
    }

    /// Handles `MEM_PROTECT_CHECK_RANGE` PSCI call.
    fn mem_protect_check_range(&self, range: MemProtectRange) -> Result<(), ErrorCode> {
        if !PsciPlatformImpl::FEATURES
            .contains(PsciPlatformOptionalFeatures::MEM_PROTECT_CHECK_RANGE)
        {
            return Err(ErrorCode::NotSupported);
        }

        self.platform.mem_protect_check_range(range)
    }

    /// Handles `PSCI_FEATURES` PSCI call.
    fn handle_features(&self, feature: PsciFeature) -> Result<u64, ErrorCode> {
        const SUCCESS: u64 = 0;

        let check_optional_feature = |feature| {
            if PsciPlatformImpl::FEATURES.contains(feature) {
                Ok(SUCCESS)
            } else {
                Err(ErrorCode::NotSupported)
            }
        };

        match feature {
            PsciFeature::PsciFunction(function_id) => match function_id {
                // Mandatory features without feature flags
                FunctionId::PsciVersion
                | FunctionId::CpuOff
                | FunctionId::CpuOn32
                | FunctionId::CpuOn64
                | FunctionId::AffinityInfo32
                | FunctionId::AffinityInfo64
                | FunctionId::SystemOff
                | FunctionId::SystemReset
                | FunctionId::PsciFeatures => Ok(SUCCESS),

                // CPU suspend features
                FunctionId::CpuSuspend32 | FunctionId::CpuSuspend64 => {
                    let mut flags = FeatureFlagsCpuSuspend::EXTENDED_POWER_STATE;
                    if PsciPlatformImpl::FEATURES
                        .contains(PsciPlatformOptionalFeatures::OS_INITIATED_MODE)
                    {
                        flags |= FeatureFlagsCpuSuspend::OS_INITIATED_MODE;
                    }
                    Ok(u32::from(flags).into())
                }

                // Migrate
                FunctionId::Migrate32
                | FunctionId::Migrate64
                | FunctionId::MigrateInfoUpCpu32
                | FunctionId::MigrateInfoUpCpu64 => Err(ErrorCode::NotSupported),
                FunctionId::MigrateInfoType => Ok(SUCCESS),
                FunctionId::SystemOff232 | FunctionId::SystemOff264 => {
                    if PsciPlatformImpl::FEATURES
                        .contains(PsciPlatformOptionalFeatures::SYSTEM_OFF2)
                    {
                        Ok(u32::from(FeatureFlagsSystemOff2::HIBERNATE_OFF).into())
                    } else {
                        Err(ErrorCode::NotSupported)
                    }
                }
                FunctionId::SystemReset232 | FunctionId::SystemReset264 => {
                    check_optional_feature(PsciPlatformOptionalFeatures::SYSTEM_RESET2)
                }
                FunctionId::MemProtect => {
                    check_optional_feature(PsciPlatformOptionalFeatures::MEM_PROTECT)
                }
                FunctionId::MemProtectCheckRange32 | FunctionId::MemProtectCheckRange64 => {
                    check_optional_feature(PsciPlatformOptionalFeatures::MEM_PROTECT_CHECK_RANGE)
                }
                FunctionId::CpuFreeze => {
                    check_optional_feature(PsciPlatformOptionalFeatures::CPU_FREEZE)
                }
                FunctionId::CpuDefaultSuspend32 | FunctionId::CpuDefaultSuspend64 => {
                    check_optional_feature(PsciPlatformOptionalFeatures::CPU_DEFAULT_SUSPEND)
                }
                FunctionId::NodeHwState32 | FunctionId::NodeHwState64 => {
                    check_optional_feature(PsciPlatformOptionalFeatures::NODE_HW_STATE)
                }
                FunctionId::SystemSuspend32 | FunctionId::SystemSuspend64 => {
                    check_optional_feature(PsciPlatformOptionalFeatures::SYSTEM_SUSPEND)
                }
                FunctionId::PsciSetSuspendMode => {
                    check_optional_feature(PsciPlatformOptionalFeatures::OS_INITIATED_MODE)
                }
                FunctionId::PsciStatResidency32
                | FunctionId::PsciStatResidency64
                | FunctionId::PsciStatCount32
                | FunctionId::PsciStatCount64 => Err(ErrorCode::NotSupported),
            },
            PsciFeature::SmcccVersion => Ok(SUCCESS),
        }
    }

    /// Handles `CPU_FREEZE` PSCI call.
    /// Does not return on success.
    fn cpu_freeze(&self) -> Result<(), ErrorCode> {
        if !PsciPlatformImpl::FEATURES.contains(PsciPlatformOptionalFeatures::CPU_FREEZE) {
            return Err(ErrorCode::NotSupported);
        }

        self.platform.cpu_freeze()
    }

    /// Handles `CPU_DEFAULT_SUSPEND` PSCI call.
    /// Places a core into an implementation defined low-power state. It might not return if the
    /// default state is a power down state.
    fn cpu_default_suspend(&self, core: CoreIndex, entry: EntryPoint) -> Result<(), PsciError> {
        if !PsciPlatformImpl::FEATURES.contains(PsciPlatformOptionalFeatures::CPU_DEFAULT_SUSPEND) {
            return Err(ErrorCode::NotSupported.into());
        }

        let power_state = self.platform.cpu_default_suspend_power_state();
        self.cpu_suspend(core, power_state, entry)
    }

    /// Handles `NODE_HW_STATE` PSCI call.
    fn node_hw_state(&self, target_cpu: Mpidr, power_level: u32) -> Result<HwState, ErrorCode> {
        if !PsciPlatformImpl::FEATURES.contains(PsciPlatformOptionalFeatures::NODE_HW_STATE) {
            return Err(ErrorCode::NotSupported);
        }

        if core_to_linear_index(target_cpu.into()).is_none()
            || power_level as usize > PsciPlatformImpl::MAX_POWER_LEVEL
        {
            return Err(ErrorCode::InvalidParameters);
        }

        self.platform.node_hw_state(target_cpu, power_level)
    }

    /// Handles `SYSTEM_SUSPEND` PSCI call.
    /// Suspends system into RAM, does not return on success.
    fn system_suspend(&self, core: CoreIndex, entry: EntryPoint) -> Result<(), PsciError> {
        if !PsciPlatformImpl::FEATURES.contains(PsciPlatformOptionalFeatures::SYSTEM_SUSPEND) {
            return Err(ErrorCode::NotSupported.into());
        }

        if !self.power_domain_tree.is_last_cpu(core) {
            return Err(ErrorCode::Denied.into());
        }

        if !self.platform.is_valid_ns_entrypoint(&entry) {
            return Err(ErrorCode::InvalidAddress.into());
        }

        let state = self.platform.sys_suspend_power_state();
        if state.find_highest_non_run_level() != Some(PsciPlatformImpl::MAX_POWER_LEVEL) {
            return Err(ErrorCode::Denied.into());
        }

        assert!(state.is_valid_suspend_request(true));
        assert_eq!(
            state.highest_level_state().power_state_type(),
            PowerStateType::PowerDown
        );

        self.cpu_suspend_start(
            core,
            None,
            entry,
            PsciPlatformImpl::MAX_POWER_LEVEL,
            state,
            true,
        )
    }

    /// Handles `PSCI_SET_SUSPEND_MODE` PSCI call.
    ///
    /// Switching to platform coordinated mode is only allowed from the last running core, and to
    /// OS initiated mode when all cores are running or the caller is the last one.
    fn set_suspend_mode(&self, core: CoreIndex, mode: SuspendMode) -> Result<u64, ErrorCode> {
        if !PsciPlatformImpl::FEATURES.contains(PsciPlatformOptionalFeatures::OS_INITIATED_MODE) {
            return Err(ErrorCode::NotSupported);
        }

        let mut suspend_mode = self.suspend_mode.lock();
        if *suspend_mode == mode {
            return Ok(0);
        }

        let allowed = match mode {
            SuspendMode::PlatformCoordinated => self.power_domain_tree.is_last_cpu(core),
            SuspendMode::OsInitiated => {
                self.power_domain_tree.are_all_cpus_on()
                    || self.power_domain_tree.is_last_cpu(core)
            }
        };
        if !allowed {
            return Err(ErrorCode::Denied);
        }

        *suspend_mode = mode;
        Ok(0)
    }

    fn handle_smc_inner(&self, core: CoreIndex, regs: &[u64; 4]) -> Result<u64, PsciError> {
        const SUCCESS: u64 = 0;
        let function = Function::try_from(regs).map_err(ErrorCode::from)?;

        match function {
            Function::Version => {
                let version = Version { major: 1, minor: 3 };
                Ok(u32::from(version).into())
            }
            Function::CpuSuspend { state, entry } => {
                self.cpu_suspend(core, state, entry)?;
                Ok(SUCCESS)
            }
            Function::CpuOff => {
                self.cpu_off(core)?;
                Ok(SUCCESS)
            }
            Function::CpuOn { target_cpu, entry } => {
                self.cpu_on(target_cpu, entry)?;
                Ok(SUCCESS)
            }
            Function::AffinityInfo {
                mpidr,
                lowest_affinity_level,
            } => {
                let affinity_info = self.affinity_info(mpidr, lowest_affinity_level)?;
                Ok(u32::from(affinity_info).into())
            }
            Function::Migrate { .. } => Err(ErrorCode::NotSupported.into()),
            Function::MigrateInfoType => {
                Ok(u32::from(MigrateInfoType::MigrationNotRequired).into())
            }
            Function::MigrateInfoUpCpu { .. } => Err(ErrorCode::NotSupported.into()),

            Function::SystemOff => Err(self.system_off().into()),
            Function::SystemOff2 { off_type, cookie } => {
                self.system_off2(off_type, cookie)?;
                Ok(SUCCESS)
            }
            Function::SystemReset => Err(self.system_reset().into()),
            Function::SystemReset2 { reset_type, cookie } => {
                self.system_reset2(reset_type, cookie)?;
                Ok(SUCCESS)
            }
            Function::MemProtect { enabled } => {
                let previous_state = self.mem_protect(enabled)?;
                Ok(previous_state.into())
            }
            Function::MemProtectCheckRange { range } => {
                self.mem_protect_check_range(range)?;
                Ok(SUCCESS)
            }
            Function::Features { psci_func_id } => Ok(self.handle_features(psci_func_id)?),
            Function::CpuFreeze => {
                self.cpu_freeze()?;
                Ok(SUCCESS)
            }
            Function::CpuDefaultSuspend { entry } => {
                self.cpu_default_suspend(core, entry)?;
                Ok(SUCCESS)
            }
            Function::NodeHwState {
                target_cpu,
                power_level,
            } => {
                let hw_state = self.node_hw_state(target_cpu, power_level)?;
                Ok(u32::from(hw_state).into())
            }
            Function::SystemSuspend { entry } => {
                self.system_suspend(core, entry)?;
                Ok(SUCCESS)
            }
            Function::SetSuspendMode { mode } => Ok(self.set_suspend_mode(core, mode)?),
            Function::StatResidency { .. } | Function::StatCount { .. } => {
                Err(ErrorCode::NotSupported.into())
            }
        }
    }
}

impl Service for Psci {
    owns!(
        OwningEntityNumber::STANDARD_SECURE,
        FUNCTION_NUMBER_MIN..=FUNCTION_NUMBER_MAX
    );

    fn handle_smc(&self, regs: &[u64; SMC_REGISTER_COUNT], call: &mut CallContext) -> SmcReturn {
        // Power management is requested by the normal world only.
        if call.caller_world() != World::NonSecure {
            return NOT_SUPPORTED.into();
        }

        let args = [regs[0], regs[1], regs[2], regs[3]];
        match self.handle_smc_inner(call.core(), &args) {
            Ok(result) => result.into(),
            Err(error) => {
                if let PsciError::PowerOp(power_op_error) = error {
                    warn!(
                        "PSCI call {:#x} on core {} failed: {power_op_error}",
                        regs[0],
                        call.core()
                    );
                }
                u64::from(ErrorCode::from(error)).into()
            }
        }
    }
}

impl Debug for Psci {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        self.power_domain_tree.fmt(f)
    }
}

#[cfg(test)]
mod tests {
    use super::power_domain_tree::test_helpers::{core, set_cpu_power_state_by_index};
    use super::*;
    use crate::{
        context::ContextStore,
        platform::{
            FakeSysregsGuard, TestHookCall, TestPsciPlatformImpl, TestSecureWorld,
            lock_fake_sysregs,
        },
    };
    use arm_psci::ArchitecturalResetType;
    use arm_sysregs::{IsrEl1, fake::SYSREGS};
    use std::{
        panic::{AssertUnwindSafe, catch_unwind, resume_unwind},
        sync::Barrier,
        thread,
    };

    const ENTRY_POINT: EntryPoint = EntryPoint::Entry64 {
        entry_point_address: 0x0123_4567_89ab_cdef,
        context_id: 0xfedc_ba98_7654_3210,
    };

    const CPU0_MPIDR: Mpidr = Mpidr {
        aff0: 0,
        aff1: 0,
        aff2: 0,
        aff3: Some(0),
    };
    const CPU1_MPIDR: Mpidr = Mpidr {
        aff0: 1,
        aff1: 0,
        aff2: 0,
        aff3: Some(0),
    };
    const INVALID_MPIDR: Mpidr = Mpidr {
        aff0: 100,
        aff1: 100,
        aff2: 100,
        aff3: Some(100),
    };

    const PSCI_VERSION: u64 = 0x8400_0000;
    const CPU_ON_64: u64 = 0xc400_0003;

    /// Creates a PSCI instance with core 0 running.
    ///
    /// The fake system registers are held until the returned guard is dropped, as pending
    /// interrupts are read from them.
    fn new_psci() -> (FakeSysregsGuard, Psci) {
        let sysregs = lock_fake_sysregs();
        TestPsciPlatformImpl::take_hook_calls();
        let psci = Psci::new(TestPsciPlatformImpl::new(), &TestSecureWorld, core(0));
        (sysregs, psci)
    }

    /// Turns on the given core, then finishes booting it.
    fn turn_on(psci: &Psci, mpidr: Mpidr) {
        assert_eq!(Ok(()), psci.cpu_on(mpidr, ENTRY_POINT));
        let target = core_to_linear_index(mpidr.into()).unwrap();
        assert_eq!(
            psci.handle_cpu_boot(target),
            WakeUpReason::CpuOn(ENTRY_POINT)
        );
    }

    #[test]
    fn psci_composite_power_state() {
        let mut composite_state = PsciCompositePowerState::OFF;
        assert_eq!(PlatformPowerState::OFF, composite_state.cpu_level_state());

        assert_eq!(
            PlatformPowerState::OFF,
            composite_state.highest_level_state()
        );

        composite_state.states[PsciCompositePowerState::CPU_POWER_LEVEL] = PlatformPowerState::RUN;
        assert_eq!(PlatformPowerState::RUN, composite_state.cpu_level_state());

        composite_state = PsciCompositePowerState::OFF;
        assert_eq!(
            Some(PsciPlatformImpl::MAX_POWER_LEVEL),
            composite_state.find_highest_power_down_level()
        );
        assert_eq!(
            Some(PsciPlatformImpl::MAX_POWER_LEVEL),
            composite_state.find_highest_non_run_level()
        );

        composite_state.states[PsciPlatformImpl::MAX_POWER_LEVEL] = PlatformPowerState::RUN;
        assert_eq!(
            Some(PsciPlatformImpl::MAX_POWER_LEVEL - 1),
            composite_state.find_highest_power_down_level()
        );
        assert_eq!(
            Some(PsciPlatformImpl::MAX_POWER_LEVEL - 1),
            composite_state.find_highest_non_run_level()
        );

        composite_state = PsciCompositePowerState::RUN;
        assert_eq!(None, composite_state.find_highest_power_down_level());
        assert_eq!(None, composite_state.find_highest_non_run_level());

        composite_state = PsciCompositePowerState::RUN;
        assert!(!composite_state.is_valid_suspend_request(false));

        composite_state = PsciCompositePowerState::OFF;
        composite_state.states[PsciCompositePowerState::CPU_POWER_LEVEL] = PlatformPowerState::RUN;
        assert!(!composite_state.is_valid_suspend_request(false));

        composite_state = PsciCompositePowerState::OFF;
        assert!(composite_state.is_valid_suspend_request(true));
        assert!(!composite_state.is_valid_suspend_request(false));

        composite_state = PsciCompositePowerState::RUN;
        composite_state.states[PsciCompositePowerState::CPU_POWER_LEVEL] = PlatformPowerState::OFF;
        assert!(composite_state.is_valid_suspend_request(true));
        assert!(!composite_state.is_valid_suspend_request(false));
    }

    #[test]
    fn psci_composite_power_state_set_from_nodes() {
        let mut composite_state = PsciCompositePowerState::OFF;
        let tree = PowerDomainTree::new(PsciPlatformImpl::topology());

        let mut cpu = tree.locked_cpu_node(core(2));
        tree.with_ancestors_locked(&mut cpu, |cpu, mut ancestors| {
            cpu.set_local_state(PlatformPowerState::RUN);
            for ancestor in ancestors.iter_mut() {
                ancestor.set_local_state(PlatformPowerState::RUN);
            }

            composite_state.set_local_states_from_nodes(cpu, &ancestors);
        });

        assert_eq!(PsciCompositePowerState::RUN, composite_state);
    }

    #[test]
    fn psci_composite_power_state_coordination() {
        let mut composite_state = PsciCompositePowerState::OFF;
        composite_state.states[PsciPlatformImpl::MAX_POWER_LEVEL - 1] = PlatformPowerState::RUN;
        composite_state.states[PsciPlatformImpl::MAX_POWER_LEVEL] = PlatformPowerState::RUN;
        let tree = PowerDomainTree::new(PsciPlatformImpl::topology());

        let mut cpu = tree.locked_cpu_node(core(2));
        tree.with_ancestors_locked(&mut cpu, |_cpu, mut ancestors| {
            composite_state.coordinate_state(core(2), &mut ancestors);
        });

        // The other cores of the cluster were never turned on, so the cluster may go off with it.
        assert_eq!(
            [
                PlatformPowerState::OFF,
                PlatformPowerState::OFF,
                PlatformPowerState::RUN,
                PlatformPowerState::RUN,
            ],
            composite_state.states
        );
    }

    #[test]
    fn coordination_never_goes_deeper_than_a_running_sibling() {
        let tree = PowerDomainTree::new(PsciPlatformImpl::topology());
        set_cpu_power_state_by_index(&tree, 1, PlatformPowerState::RUN);

        let mut composite_state = PsciCompositePowerState::OFF;
        let mut cpu = tree.locked_cpu_node(core(2));
        tree.with_ancestors_locked(&mut cpu, |_cpu, mut ancestors| {
            composite_state.coordinate_state(core(2), &mut ancestors);
        });

        assert_eq!(
            [
                PlatformPowerState::OFF,
                PlatformPowerState::RUN,
                PlatformPowerState::RUN,
                PlatformPowerState::RUN,
            ],
            composite_state.states
        );
    }

    /// The function expects the closure to power down the calling CPU. This would normally end in
    /// a function which never returns (`func() -> !`). This makes it impossible to test it so this
    /// function introduces a method for unwinding the power down call and enables further testing.
    fn expect_cpu_power_down<F>(magic: &str, f: F)
    where
        F: FnOnce(),
    {
        // Run closure and expect panic unwind. AssertUnwindSafe is required, because spin::Mutex
        // does not implement UnwindSafe.
        let result = catch_unwind(AssertUnwindSafe(f));

        if let Err(err) = result {
            // The closure has panicked, check for power down magic string.
            if let Some(s) = err.downcast_ref::<String>()
                && *s == magic
            {
                return;
            }

            // Propagate non power down panics.
            resume_unwind(err);
        } else {
            // The closure finished without power down panic.
            panic!("Expected CPU power down did not happen");
        }
    }

    fn expect_cpu_power_down_wfi<F>(f: F)
    where
        F: FnOnce(),
    {
        expect_cpu_power_down(TestPsciPlatformImpl::POWER_DOWN_WFI_MAGIC, f);
    }

    fn check_ancestor_state(psci: &Psci, cpu_index: usize, expected_states: &[PlatformPowerState]) {
        let mut cpu = psci.power_domain_tree.locked_cpu_node(core(cpu_index));
        assert_eq!(expected_states[0], cpu.local_state());
        psci.power_domain_tree
            .with_ancestors_locked(&mut cpu, |_cpu, ancestors| {
                for (parent, expected_state) in ancestors.iter().zip(&expected_states[1..]) {
                    assert_eq!(*expected_state, parent.local_state());
                }
            });
    }

    #[test]
    fn psci_cpu_suspend() {
        let (_sysregs, psci) = new_psci();

        assert_eq!(
            Err(PsciError::Call(ErrorCode::InvalidParameters)),
            psci.cpu_suspend(core(0), PowerState::StandbyOrRetention(100), ENTRY_POINT)
        );
        assert_eq!(
            Err(PsciError::Call(ErrorCode::InvalidParameters)),
            psci.cpu_suspend(core(0), PowerState::PowerDown(0), ENTRY_POINT)
        );

        assert_eq!(
            Ok(()),
            psci.cpu_suspend(core(0), PowerState::StandbyOrRetention(0), ENTRY_POINT)
        );

        assert_eq!(
            Ok(()),
            psci.cpu_suspend(core(0), PowerState::StandbyOrRetention(2), ENTRY_POINT)
        );

        // Standby 2 reaches up to the SoC level, so it goes through the full suspend sequence.
        // The secure world only hears about power down states.
        let retention = PsciCompositePowerState::new([
            PlatformPowerState::Standby2,
            PlatformPowerState::Standby1,
            PlatformPowerState::Standby0,
            PlatformPowerState::On,
        ]);
        assert_eq!(
            TestPsciPlatformImpl::take_hook_calls(),
            [
                TestHookCall::CpuStandby(PlatformPowerState::Standby0),
                TestHookCall::Suspend(retention.clone()),
                TestHookCall::SuspendFinish(retention),
            ]
        );
        check_ancestor_state(&psci, 0, &[PlatformPowerState::RUN; 4]);

        expect_cpu_power_down_wfi(|| {
            let _ = psci.cpu_suspend(core(0), PowerState::PowerDown(0x3), ENTRY_POINT);
        });
        let core_off = PsciCompositePowerState::new([
            PlatformPowerState::PowerDown,
            PlatformPowerState::On,
            PlatformPowerState::On,
            PlatformPowerState::On,
        ]);
        assert_eq!(
            TestPsciPlatformImpl::take_hook_calls(),
            [
                TestHookCall::Suspend(core_off.clone()),
                TestHookCall::SecureSuspend(0),
            ]
        );

        let wakeup_reason = psci.handle_cpu_boot(core(0));
        assert_eq!(wakeup_reason, WakeUpReason::SuspendFinished(ENTRY_POINT));
        assert_eq!(
            TestPsciPlatformImpl::take_hook_calls(),
            [
                TestHookCall::SuspendFinish(core_off),
                TestHookCall::SecureSuspendFinish(0),
            ]
        );
        check_ancestor_state(&psci, 0, &[PlatformPowerState::RUN; 4]);
    }

    #[test]
    fn pending_interrupt_cancels_suspend() {
        let (_sysregs, psci) = new_psci();

        SYSREGS.lock().unwrap().isr_el1 = IsrEl1::I;
        assert_eq!(
            Ok(()),
            psci.cpu_suspend(core(0), PowerState::PowerDown(0x33), ENTRY_POINT)
        );

        assert_eq!(TestPsciPlatformImpl::take_hook_calls(), []);
        check_ancestor_state(&psci, 0, &[PlatformPowerState::RUN; 4]);
    }

    #[test]
    fn standby_failure_leaves_core_running() {
        let (_sysregs, psci) = new_psci();

        TestPsciPlatformImpl::fail_next_hook(PlatformError::Timeout);
        assert_eq!(
            Err(PsciError::PowerOp(PowerOpError {
                hook: PowerHook::Standby,
                cause: PlatformError::Timeout,
            })),
            psci.cpu_suspend(core(0), PowerState::StandbyOrRetention(0), ENTRY_POINT)
        );
        check_ancestor_state(&psci, 0, &[PlatformPowerState::RUN; 4]);
    }

    #[test]
    fn suspend_failure_rolls_back() {
        let (_sysregs, psci) = new_psci();
        turn_on(&psci, CPU1_MPIDR);
        TestPsciPlatformImpl::take_hook_calls();

        TestPsciPlatformImpl::fail_next_hook(PlatformError::Rejected { status: 2 });
        assert_eq!(
            Err(PsciError::PowerOp(PowerOpError {
                hook: PowerHook::Suspend,
                cause: PlatformError::Rejected { status: 2 },
            })),
            psci.cpu_suspend(core(0), PowerState::PowerDown(0x3333), ENTRY_POINT)
        );
        // The secure world was never told about a suspend which didn't happen.
        assert_eq!(TestPsciPlatformImpl::take_hook_calls(), []);

        check_ancestor_state(&psci, 0, &[PlatformPowerState::RUN; 4]);
        {
            let mut cpu = psci.power_domain_tree.locked_cpu_node(core(0));
            assert_eq!(cpu.highest_affected_level(), None);
            assert_eq!(cpu.pop_entry_point(), None);
            psci.power_domain_tree
                .with_ancestors_locked(&mut cpu, |_cpu, ancestors| {
                    for node in ancestors.iter() {
                        assert_eq!(node.requested_power_state(core(0)), PlatformPowerState::RUN);
                    }
                });
        }

        // The core can still suspend afterwards.
        expect_cpu_power_down_wfi(|| {
            let _ = psci.cpu_suspend(core(0), PowerState::PowerDown(0x3), ENTRY_POINT);
        });
        assert_eq!(
            psci.handle_cpu_boot(core(0)),
            WakeUpReason::SuspendFinished(ENTRY_POINT)
        );
    }

    #[test]
    fn psci_cpu_on() {
        let (_sysregs, psci) = new_psci();

        assert_eq!(
            Err(PsciError::Call(ErrorCode::InvalidParameters)),
            psci.cpu_on(INVALID_MPIDR, ENTRY_POINT)
        );

        assert_eq!(Ok(()), psci.cpu_on(CPU1_MPIDR, ENTRY_POINT));
        assert_eq!(
            Err(PsciError::Call(ErrorCode::OnPending)),
            psci.cpu_on(CPU1_MPIDR, ENTRY_POINT)
        );
        assert_eq!(
            TestPsciPlatformImpl::take_hook_calls(),
            [
                TestHookCall::SecureOn(core(1)),
                TestHookCall::On(u64::from(CPU1_MPIDR)),
            ]
        );

        let wakeup_reason = psci.handle_cpu_boot(core(1));
        assert_eq!(wakeup_reason, WakeUpReason::CpuOn(ENTRY_POINT));
        let calls = TestPsciPlatformImpl::take_hook_calls();
        assert!(
            matches!(
                calls.as_slice(),
                [TestHookCall::OnFinish(_), TestHookCall::SecureOnFinish(booted)]
                    if *booted == core(1)
            ),
            "Unexpected hook calls {calls:?}"
        );

        assert_eq!(
            Err(PsciError::Call(ErrorCode::AlreadyOn)),
            psci.cpu_on(CPU1_MPIDR, ENTRY_POINT)
        );
    }

    #[test]
    fn cpu_on_rejects_absent_cores() {
        let (_sysregs, psci) = new_psci();

        for target in [
            // One past the last core of a cluster.
            Mpidr::from_aff3210(0, 0, 1, 3),
            // One past the last cluster.
            Mpidr::from_aff3210(0, 0, 2, 0),
            // One past the last SoC.
            Mpidr::from_aff3210(0, 2, 0, 0),
            // Core 0 with a wrong upper affinity.
            Mpidr::from_aff3210(1, 0, 0, 0),
            Mpidr::from_aff3210(0xff, 0xff, 0xff, 0xff),
        ] {
            assert_eq!(
                Err(PsciError::Call(ErrorCode::InvalidParameters)),
                psci.cpu_on(target, ENTRY_POINT)
            );
        }

        for cpu_index in 1..13 {
            assert_eq!(
                AffinityInfo::Off,
                psci.power_domain_tree
                    .locked_cpu_node(core(cpu_index))
                    .affinity_info()
            );
        }
        assert_eq!(TestPsciPlatformImpl::take_hook_calls(), []);
    }

    #[test]
    fn cpu_on_failure_rolls_back() {
        let (_sysregs, psci) = new_psci();

        TestPsciPlatformImpl::fail_next_hook(PlatformError::Timeout);
        assert_eq!(
            Err(PsciError::PowerOp(PowerOpError {
                hook: PowerHook::On,
                cause: PlatformError::Timeout,
            })),
            psci.cpu_on(CPU1_MPIDR, ENTRY_POINT)
        );
        assert_eq!(
            Ok(AffinityInfo::Off),
            psci.affinity_info(CPU1_MPIDR, PsciCompositePowerState::CPU_POWER_LEVEL as u32)
        );
        assert_eq!(
            psci.power_domain_tree
                .locked_cpu_node(core(1))
                .pop_entry_point(),
            None
        );

        // A retry starts from a clean state.
        turn_on(&psci, CPU1_MPIDR);
    }

    #[test]
    fn psci_cpu_off() {
        let (_sysregs, psci) = new_psci();
        turn_on(&psci, CPU1_MPIDR);

        TestPsciPlatformImpl::take_hook_calls();
        expect_cpu_power_down_wfi(|| {
            let _ = psci.cpu_off(core(1));
        });
        assert_eq!(
            TestPsciPlatformImpl::take_hook_calls(),
            [
                TestHookCall::SecureOff(core(1)),
                TestHookCall::Off(PsciCompositePowerState::new([
                    PlatformPowerState::OFF,
                    PlatformPowerState::RUN,
                    PlatformPowerState::RUN,
                    PlatformPowerState::RUN,
                ])),
            ]
        );

        assert_eq!(
            Ok(AffinityInfo::Off),
            psci.affinity_info(CPU1_MPIDR, PsciCompositePowerState::CPU_POWER_LEVEL as u32)
        );
    }

    #[test]
    fn secure_world_can_deny_cpu_off() {
        let (_sysregs, psci) = new_psci();
        turn_on(&psci, CPU1_MPIDR);
        TestPsciPlatformImpl::take_hook_calls();

        TestSecureWorld::refuse_next_off();
        assert_eq!(
            Err(PsciError::Call(ErrorCode::Denied)),
            psci.cpu_off(core(1))
        );
        assert_eq!(
            TestPsciPlatformImpl::take_hook_calls(),
            [TestHookCall::SecureOff(core(1))]
        );
        check_ancestor_state(&psci, 1, &[PlatformPowerState::RUN; 4]);
        assert_eq!(
            Ok(AffinityInfo::On),
            psci.affinity_info(CPU1_MPIDR, PsciCompositePowerState::CPU_POWER_LEVEL as u32)
        );

        // The refusal only applies once.
        expect_cpu_power_down_wfi(|| {
            let _ = psci.cpu_off(core(1));
        });
        assert_eq!(
            Ok(AffinityInfo::Off),
            psci.affinity_info(CPU1_MPIDR, PsciCompositePowerState::CPU_POWER_LEVEL as u32)
        );
    }

    #[test]
    fn cpu_off_failure_rolls_back() {
        let (_sysregs, psci) = new_psci();
        turn_on(&psci, CPU1_MPIDR);

        TestPsciPlatformImpl::fail_next_hook(PlatformError::Timeout);
        assert_eq!(
            Err(PsciError::PowerOp(PowerOpError {
                hook: PowerHook::Off,
                cause: PlatformError::Timeout,
            })),
            psci.cpu_off(core(1))
        );

        check_ancestor_state(&psci, 1, &[PlatformPowerState::RUN; 4]);
        assert_eq!(
            Ok(AffinityInfo::On),
            psci.affinity_info(CPU1_MPIDR, PsciCompositePowerState::CPU_POWER_LEVEL as u32)
        );
    }

    #[test]
    fn psci_affinity_info() {
        let (_sysregs, psci) = new_psci();

        assert_eq!(
            Err(ErrorCode::InvalidParameters),
            psci.affinity_info(
                INVALID_MPIDR,
                PsciCompositePowerState::CPU_POWER_LEVEL as u32
            )
        );

        assert_eq!(
            Err(ErrorCode::InvalidParameters),
            psci.affinity_info(CPU1_MPIDR, PsciPlatformImpl::MAX_POWER_LEVEL as u32)
        );

        assert_eq!(
            Ok(AffinityInfo::Off),
            psci.affinity_info(CPU1_MPIDR, PsciCompositePowerState::CPU_POWER_LEVEL as u32)
        );

        assert_eq!(Ok(()), psci.cpu_on(CPU1_MPIDR, ENTRY_POINT));

        assert_eq!(
            Ok(AffinityInfo::OnPending),
            psci.affinity_info(CPU1_MPIDR, PsciCompositePowerState::CPU_POWER_LEVEL as u32)
        );

        let _entry_point = psci.handle_cpu_boot(core(1));
        assert_eq!(
            Ok(AffinityInfo::On),
            psci.affinity_info(CPU1_MPIDR, PsciCompositePowerState::CPU_POWER_LEVEL as u32)
        );
    }

    #[test]
    fn psci_complex_suspend_scenario() {
        // Check correct state in the power domain tree while executing the following steps.
        // * Turn on all CPUs
        // * Power down CPUs 6-13
        // * Power down CPUs 0-5
        // * Wake up CPU0
        // * Wake up CPU6

        // Listed in linear index order.
        let cpus = [
            (0, 0, 0),
            (0, 0, 1),
            (0, 0, 2),
            (0, 1, 0),
            (0, 1, 1),
            (0, 1, 2),
            (1, 0, 0),
            (1, 0, 1),
            (1, 0, 2),
            (1, 1, 0),
            (1, 1, 1),
            (1, 1, 2),
            (1, 1, 3),
        ];
        let mpidr_of = |cpu: &(u8, u8, u8)| Mpidr::from_aff3210(0, cpu.0, cpu.1, cpu.2);

        const RUN: PlatformPowerState = PlatformPowerState::RUN;
        const OFF: PlatformPowerState = PlatformPowerState::OFF;

        let (_sysregs, psci) = new_psci();

        assert_eq!(
            Ok(AffinityInfo::On),
            psci.affinity_info(CPU0_MPIDR, PsciCompositePowerState::CPU_POWER_LEVEL as u32)
        );

        // Turning on all secondary CPUs
        for cpu in &cpus[1..] {
            let mpidr = mpidr_of(cpu);
            assert_eq!(Ok(()), psci.cpu_on(mpidr, ENTRY_POINT));
            assert_eq!(
                Ok(AffinityInfo::OnPending),
                psci.affinity_info(mpidr, PsciCompositePowerState::CPU_POWER_LEVEL as u32)
            );
        }

        // Boot secondary CPUs
        for (cpu_index, cpu) in cpus.iter().enumerate().skip(1) {
            let wakeup_reason = psci.handle_cpu_boot(core(cpu_index));
            assert_eq!(wakeup_reason, WakeUpReason::CpuOn(ENTRY_POINT));
            assert_eq!(
                Ok(AffinityInfo::On),
                psci.affinity_info(mpidr_of(cpu), PsciCompositePowerState::CPU_POWER_LEVEL as u32)
            );
        }

        for cpu_index in 0..cpus.len() {
            check_ancestor_state(&psci, cpu_index, &[RUN, RUN, RUN, RUN]);
        }

        // Put second SoC in power down suspend
        for cpu_index in 6..cpus.len() {
            expect_cpu_power_down_wfi(|| {
                let _ = psci.cpu_suspend(
                    core(cpu_index),
                    PowerState::PowerDown(0x3333),
                    ENTRY_POINT,
                );
            });
        }

        for cpu_index in 6..cpus.len() {
            check_ancestor_state(&psci, cpu_index, &[OFF, OFF, OFF, RUN]);
        }

        // Power down off all other CPUs
        for cpu_index in 0..6 {
            expect_cpu_power_down_wfi(|| {
                let _ = psci.cpu_suspend(
                    core(cpu_index),
                    PowerState::PowerDown(0x3333),
                    ENTRY_POINT,
                );
            });
        }

        for cpu_index in 0..cpus.len() {
            check_ancestor_state(&psci, cpu_index, &[OFF, OFF, OFF, OFF]);
        }

        // Wake up CPU 0
        let wakeup_reason = psci.handle_cpu_boot(core(0));
        assert_eq!(wakeup_reason, WakeUpReason::SuspendFinished(ENTRY_POINT));

        // First CPU is on
        check_ancestor_state(&psci, 0, &[RUN, RUN, RUN, RUN]);

        // First cluster is on, but the CPUs are off
        for cpu_index in 1..3 {
            check_ancestor_state(&psci, cpu_index, &[OFF, RUN, RUN, RUN]);
        }

        // Second cluster is off
        for cpu_index in 3..6 {
            check_ancestor_state(&psci, cpu_index, &[OFF, OFF, RUN, RUN]);
        }

        // The rest of the nodes are off except the top level node
        for cpu_index in 6..cpus.len() {
            check_ancestor_state(&psci, cpu_index, &[OFF, OFF, OFF, RUN]);
        }

        // Wake up CPU 6
        let wakeup_reason = psci.handle_cpu_boot(core(6));
        assert_eq!(wakeup_reason, WakeUpReason::SuspendFinished(ENTRY_POINT));

        // CPU 0 is still on
        check_ancestor_state(&psci, 0, &[RUN, RUN, RUN, RUN]);

        // First cluster is on, but the CPUs are off
        for cpu_index in 1..3 {
            check_ancestor_state(&psci, cpu_index, &[OFF, RUN, RUN, RUN]);
        }

        // Second cluster is off
        for cpu_index in 3..6 {
            check_ancestor_state(&psci, cpu_index, &[OFF, OFF, RUN, RUN]);
        }

        // CPU 6 is now on
        check_ancestor_state(&psci, 6, &[RUN, RUN, RUN, RUN]);

        // Third cluster is on, but the CPUs are off
        for cpu_index in 7..9 {
            check_ancestor_state(&psci, cpu_index, &[OFF, RUN, RUN, RUN]);
        }

        // Fourth cluster is off
        for cpu_index in 9..cpus.len() {
            check_ancestor_state(&psci, cpu_index, &[OFF, OFF, RUN, RUN]);
        }
    }

    #[test]
    fn concurrent_sibling_power_off() {
        // Cores 4 and 5 share cluster 1 with core 3, which was never turned on. Core 0 keeps SoC 0
        // running and cores 1 and 2 share its cluster.
        let core1 = Mpidr::from_aff3210(0, 0, 0, 1);
        let core4 = Mpidr::from_aff3210(0, 0, 1, 1);
        let core5 = Mpidr::from_aff3210(0, 0, 1, 2);
        const RUN: PlatformPowerState = PlatformPowerState::RUN;
        const OFF: PlatformPowerState = PlatformPowerState::OFF;

        let (_sysregs, psci) = new_psci();
        for target in [core1, core4, core5] {
            assert_eq!(Ok(()), psci.cpu_on(target, ENTRY_POINT));
        }

        let barrier = Barrier::new(3);
        thread::scope(|s| {
            for (target, index) in [(core1, 1), (core4, 4), (core5, 5)] {
                let psci = &psci;
                let barrier = &barrier;
                s.spawn(move || {
                    assert_eq!(
                        psci.handle_cpu_boot(core(index)),
                        WakeUpReason::CpuOn(ENTRY_POINT)
                    );
                    barrier.wait();
                    if target != core1 {
                        expect_cpu_power_down_wfi(|| {
                            let _ = psci.cpu_off(core(index));
                        });
                    }
                });
            }
        });

        // Both siblings are off, so their cluster is off too. SoC 0 still has running cores.
        check_ancestor_state(&psci, 4, &[OFF, OFF, RUN, RUN]);
        check_ancestor_state(&psci, 5, &[OFF, OFF, RUN, RUN]);
        for target in [core4, core5] {
            assert_eq!(
                Ok(AffinityInfo::Off),
                psci.affinity_info(target, PsciCompositePowerState::CPU_POWER_LEVEL as u32)
            );
        }

        // Core 1 turning off leaves core 0 running in the same cluster.
        thread::scope(|s| {
            s.spawn(|| {
                expect_cpu_power_down_wfi(|| {
                    let _ = psci.cpu_off(core(1));
                });
            });
        });
        check_ancestor_state(&psci, 1, &[OFF, RUN, RUN, RUN]);
        check_ancestor_state(&psci, 0, &[RUN, RUN, RUN, RUN]);
    }

    #[test]
    fn os_initiated_suspend() {
        let (_sysregs, psci) = new_psci();

        assert_eq!(Ok(0), psci.set_suspend_mode(core(0), SuspendMode::OsInitiated));
        turn_on(&psci, CPU1_MPIDR);

        // Core 1 still runs, so core 0 may not take their cluster down.
        assert_eq!(
            Err(PsciError::Call(ErrorCode::Denied)),
            psci.cpu_suspend(core(0), PowerState::PowerDown(0x33), ENTRY_POINT)
        );
        check_ancestor_state(&psci, 0, &[PlatformPowerState::RUN; 4]);

        // Nor switch back to platform coordination while it does.
        assert_eq!(
            Err(ErrorCode::Denied),
            psci.set_suspend_mode(core(0), SuspendMode::PlatformCoordinated)
        );

        expect_cpu_power_down_wfi(|| {
            let _ = psci.cpu_suspend(core(0), PowerState::PowerDown(0x3), ENTRY_POINT);
        });
        assert_eq!(
            psci.handle_cpu_boot(core(0)),
            WakeUpReason::SuspendFinished(ENTRY_POINT)
        );
    }

    #[test]
    fn psci_system_off() {
        let (_sysregs, psci) = new_psci();

        expect_cpu_power_down(TestPsciPlatformImpl::SYSTEM_OFF_MAGIC, || {
            psci.system_off();
        });

        TestPsciPlatformImpl::fail_next_hook(PlatformError::Timeout);
        assert_eq!(
            PowerOpError {
                hook: PowerHook::SystemOff,
                cause: PlatformError::Timeout
            },
            psci.system_off()
        );
    }

    #[test]
    fn psci_system_off2() {
        let (_sysregs, psci) = new_psci();

        let off_type = SystemOff2Type::HibernateOff;
        let cookie = Cookie::Cookie64(0);

        let magic = format!(
            "{} {:?} {:?}",
            TestPsciPlatformImpl::SYSTEM_OFF2_MAGIC,
            off_type,
            cookie
        );

        expect_cpu_power_down(magic.as_str(), || {
            let _ = psci.system_off2(off_type, cookie);
        });
    }

    #[test]
    fn psci_system_reset() {
        let (_sysregs, psci) = new_psci();

        expect_cpu_power_down(TestPsciPlatformImpl::SYSTEM_RESET_MAGIC, || {
            psci.system_reset();
        });

        TestPsciPlatformImpl::fail_next_hook(PlatformError::Rejected { status: 1 });
        assert_eq!(
            PowerOpError {
                hook: PowerHook::SystemReset,
                cause: PlatformError::Rejected { status: 1 }
            },
            psci.system_reset()
        );
    }

    #[test]
    fn psci_system_reset2() {
        let (_sysregs, psci) = new_psci();

        expect_cpu_power_down(TestPsciPlatformImpl::SYSTEM_RESET2_MAGIC, || {
            let _ = psci.system_reset2(
                ResetType::Architectural(ArchitecturalResetType::SystemWarmReset),
                Cookie::Cookie64(0),
            );
        });
    }

    #[test]
    fn psci_mem_protect() {
        let (_sysregs, psci) = new_psci();

        assert_eq!(Ok(true), psci.mem_protect(true));
        assert_eq!(
            Ok(()),
            psci.mem_protect_check_range(MemProtectRange::Range64 { base: 0, length: 4 })
        );
    }

    #[test]
    fn psci_features() {
        let (_sysregs, psci) = new_psci();

        let supported_functions = [
            FunctionId::PsciVersion,
            FunctionId::CpuOff,
            FunctionId::CpuOn32,
            FunctionId::CpuOn64,
            FunctionId::AffinityInfo32,
            FunctionId::AffinityInfo64,
            FunctionId::SystemOff,
            FunctionId::SystemReset,
            FunctionId::SystemReset232,
            FunctionId::SystemReset264,
            FunctionId::MemProtect,
            FunctionId::MemProtectCheckRange32,
            FunctionId::MemProtectCheckRange64,
            FunctionId::PsciFeatures,
            FunctionId::PsciSetSuspendMode,
            FunctionId::CpuFreeze,
            FunctionId::CpuDefaultSuspend32,
            FunctionId::CpuDefaultSuspend64,
            FunctionId::NodeHwState32,
            FunctionId::NodeHwState64,
            FunctionId::SystemSuspend32,
            FunctionId::SystemSuspend64,
        ];

        let not_supported_functions = [
            FunctionId::Migrate32,
            FunctionId::Migrate64,
            FunctionId::MigrateInfoUpCpu32,
            FunctionId::MigrateInfoUpCpu64,
            FunctionId::PsciStatResidency32,
            FunctionId::PsciStatResidency64,
            FunctionId::PsciStatCount32,
            FunctionId::PsciStatCount64,
        ];

        assert_eq!(Ok(0), psci.handle_features(PsciFeature::SmcccVersion));
        assert_eq!(
            Ok(0x0000_0003),
            psci.handle_features(PsciFeature::PsciFunction(FunctionId::CpuSuspend32))
        );
        assert_eq!(
            Ok(0x0000_0003),
            psci.handle_features(PsciFeature::PsciFunction(FunctionId::CpuSuspend64))
        );
        assert_eq!(
            Ok(0x0000_0001),
            psci.handle_features(PsciFeature::PsciFunction(FunctionId::SystemOff232))
        );
        assert_eq!(
            Ok(0x0000_0001),
            psci.handle_features(PsciFeature::PsciFunction(FunctionId::SystemOff264))
        );
        assert_eq!(
            Ok(0),
            psci.handle_features(PsciFeature::PsciFunction(FunctionId::MigrateInfoType))
        );

        for function_id in supported_functions {
            assert_eq!(
                Ok(0),
                psci.handle_features(PsciFeature::PsciFunction(function_id))
            );
        }
        for function_id in not_supported_functions {
            assert_eq!(
                Err(ErrorCode::NotSupported),
                psci.handle_features(PsciFeature::PsciFunction(function_id))
            );
        }
    }

    #[test]
    fn psci_cpu_freeze() {
        let (_sysregs, psci) = new_psci();
        expect_cpu_power_down(TestPsciPlatformImpl::CPU_FREEZE_MAGIC, || {
            let _ = psci.cpu_freeze();
        });
    }

    #[test]
    fn psci_cpu_default_suspend() {
        let (_sysregs, psci) = new_psci();
        assert_eq!(Ok(()), psci.cpu_default_suspend(core(0), ENTRY_POINT));
    }

    #[test]
    fn psci_node_hw_state() {
        let (_sysregs, psci) = new_psci();

        assert_eq!(
            Err(ErrorCode::InvalidParameters),
            psci.node_hw_state(
                INVALID_MPIDR,
                PsciCompositePowerState::CPU_POWER_LEVEL as u32
            )
        );

        assert_eq!(
            Err(ErrorCode::InvalidParameters),
            psci.node_hw_state(CPU1_MPIDR, PsciPlatformImpl::MAX_POWER_LEVEL as u32 + 1)
        );

        assert_eq!(
            Ok(HwState::Off),
            psci.node_hw_state(CPU1_MPIDR, PsciCompositePowerState::CPU_POWER_LEVEL as u32)
        );
    }

    #[test]
    fn psci_system_suspend() {
        let (_sysregs, psci) = new_psci();

        expect_cpu_power_down_wfi(|| {
            let _ = psci.system_suspend(core(0), ENTRY_POINT);
        });
        assert_eq!(
            TestPsciPlatformImpl::take_hook_calls(),
            [
                TestHookCall::Suspend(PsciCompositePowerState::OFF),
                TestHookCall::SecureSuspend(PsciPlatformImpl::MAX_POWER_LEVEL),
            ]
        );
        assert_eq!(
            psci.handle_cpu_boot(core(0)),
            WakeUpReason::SuspendFinished(ENTRY_POINT)
        );
        assert_eq!(
            TestPsciPlatformImpl::take_hook_calls(),
            [
                TestHookCall::SuspendFinish(PsciCompositePowerState::OFF),
                TestHookCall::SecureSuspendFinish(PsciPlatformImpl::MAX_POWER_LEVEL),
            ]
        );

        assert_eq!(Ok(()), psci.cpu_on(CPU1_MPIDR, ENTRY_POINT));
        // Not last CPU
        assert_eq!(
            Err(PsciError::Call(ErrorCode::Denied)),
            psci.system_suspend(core(0), ENTRY_POINT)
        );
    }

    fn call(psci: &Psci, caller_world: World, regs: &[u64]) -> SmcReturn {
        let store = ContextStore::new();
        let mut call_regs = [0; SMC_REGISTER_COUNT];
        call_regs[..regs.len()].copy_from_slice(regs);
        let mut call = CallContext::new(&store, core(0), caller_world);
        psci.handle_smc(&call_regs, &mut call)
    }

    #[test]
    fn smc_version() {
        let (_sysregs, psci) = new_psci();

        assert_eq!(
            call(&psci, World::NonSecure, &[PSCI_VERSION]).values(),
            [0x0001_0003]
        );
        assert_eq!(
            call(&psci, World::Secure, &[PSCI_VERSION]).values(),
            [NOT_SUPPORTED as u64]
        );
    }

    #[test]
    fn smc_cpu_on_errors() {
        let (_sysregs, psci) = new_psci();
        let entry = 0x8000_0000;

        // A well-formed MPIDR of a core the platform doesn't have.
        assert_eq!(
            call(&psci, World::NonSecure, &[CPU_ON_64, 0x103, entry, 0]).values(),
            [u64::from(ErrorCode::InvalidParameters)]
        );

        TestPsciPlatformImpl::fail_next_hook(PlatformError::Timeout);
        assert_eq!(
            call(&psci, World::NonSecure, &[CPU_ON_64, 0x1, entry, 0]).values(),
            [u64::from(ErrorCode::InternalFailure)]
        );
        assert_eq!(
            Ok(AffinityInfo::Off),
            psci.affinity_info(CPU1_MPIDR, PsciCompositePowerState::CPU_POWER_LEVEL as u32)
        );

        assert_eq!(
            call(&psci, World::NonSecure, &[CPU_ON_64, 0x1, entry, 0]).values(),
            [0]
        );
        assert_eq!(
            call(&psci, World::NonSecure, &[CPU_ON_64, 0x1, entry, 0]).values(),
            [u64::from(ErrorCode::OnPending)]
        );
    }

    #[test]
    fn power_op_errors_are_internal_failures() {
        let error = PsciError::from(PowerHook::Off.failed(PlatformError::Timeout));
        assert_eq!(ErrorCode::from(error), ErrorCode::InternalFailure);
        assert_eq!(
            ErrorCode::from(PsciError::from(ErrorCode::Denied)),
            ErrorCode::Denied
        );
        assert_eq!(
            PowerHook::Suspend
                .failed(PlatformError::Timeout)
                .to_string(),
            "power_domain_suspend failed: hardware handshake timed out"
        );
    }
}
