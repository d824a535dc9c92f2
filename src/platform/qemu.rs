// Copyright The Rusted Firmware-A Contributors.
//
// SPDX-License-Identifier: BSD-3-Clause

use super::{Platform, PlatformError};
use crate::{
    aarch64::{dsb_sy, sev, wfe, wfi},
    bl31_warm_entrypoint,
    context::{CoreIndex, EntryPointInfo},
    logger::{self, LockedWriter},
    mmio::{MmioError, Reg32, Reg64},
    semihosting::{AdpStopped, semihosting_exit},
    services::psci::{
        NoSecurePayload, PlatformPowerStateInterface, PowerStateType, PsciCompositePowerState,
        PsciPlatformInterface, PsciPlatformOptionalFeatures, SecureWorldPm,
    },
};
use arm_pl011_uart::{PL011Registers, Uart, UniqueMmioPointer};
use arm_psci::{Mpidr, PowerState};
use arm_sysregs::{MpidrEl1, SpsrEl3, read_mpidr_el1};
use core::ptr::NonNull;
use spin::Once;

#[cfg(feature = "rme")]
compile_error!("RME is not supported on QEMU");

const SEC_SRAM_BASE: usize = 0x0e00_0000;
const SHARED_RAM_BASE: usize = SEC_SRAM_BASE;
const BL32_BASE: usize = 0x0e10_0000;
const BL33_BASE: usize = 0x6000_0000;

/// Base address of the trusted mailbox.
/// The mailbox has a storage buffer at its base, and a doorbell for each CPU.
/// The size of the mailbox is 8 for the buffer plus memory reserved for the doorbells, or holding
/// pens, which is equal to Qemu::CORE_COUNT * 8.
const TRUSTED_MAILBOX_BASE: usize = SHARED_RAM_BASE;
/// Base address of hold entries for secondary cores. Writing `HOLD_STATE_GO` to the entry for a
/// secondary core will cause it to be released from its holding pen and jump to the address stored
/// at `TRUSTED_MAILBOX_BASE`.
const HOLD_BASE: usize = TRUSTED_MAILBOX_BASE + 8;
const HOLD_ENTRY_SHIFT: usize = 3;
const HOLD_STATE_WAIT: u64 = 0;
const HOLD_STATE_GO: u64 = 1;

/// Base address of the secure world PL011 UART, aka. UART1.
const UART1_BASE: usize = 0x0904_0000;
const PL011_BASE_ADDRESS: *mut PL011Registers = UART1_BASE as _;

/// Base address of the secure PL061 GPIO controller, whose pin 1 is wired to system reset.
const SECURE_GPIO_BASE: usize = 0x090b_0000;
const GPIODIR: usize = 0x400;
const SECURE_GPIO_RESET: u32 = 1 << 1;

/// The number of CPU clusters.
const CLUSTER_COUNT: usize = 1;
const PLATFORM_CPU_PER_CLUSTER_SHIFT: usize = 2;
/// The maximum number of CPUs in each cluster.
const MAX_CPUS_PER_CLUSTER: usize = 1 << PLATFORM_CPU_PER_CLUSTER_SHIFT;

/// The handle to the PSCI platform implementation, handed out once.
static PSCI_PLATFORM_TAKEN: Once = Once::new();

/// The aarch64 'virt' machine of the QEMU emulator.
pub struct Qemu;

// SAFETY: `core_position` returns `aff1 * MAX_CPUS_PER_CLUSTER + aff0`, which is unique and less
// than `CORE_COUNT` for every MPIDR accepted by `mpidr_is_valid`.
unsafe impl Platform for Qemu {
    const CORE_COUNT: usize = CLUSTER_COUNT * MAX_CPUS_PER_CLUSTER;

    type LogSinkImpl = LockedWriter<Uart<'static>>;
    type PsciPlatformImpl = QemuPsciPlatformImpl;

    fn init(_arg0: u64, _arg1: u64, _arg2: u64, _arg3: u64) {
        // SAFETY: `PL011_BASE_ADDRESS` is the base address of a PL011 device, and nothing else
        // accesses that address range.
        let uart_pointer =
            unsafe { UniqueMmioPointer::new(NonNull::new(PL011_BASE_ADDRESS).unwrap()) };
        logger::init(LockedWriter::new(Uart::new(uart_pointer)))
            .expect("Failed to initialise logger");
    }

    fn secure_entry_point() -> EntryPointInfo {
        let core_linear_id = CoreIndex::current().get() as u64;
        EntryPointInfo {
            pc: BL32_BASE,
            #[cfg(feature = "sel2")]
            spsr: SpsrEl3::D | SpsrEl3::A | SpsrEl3::I | SpsrEl3::F | SpsrEl3::M_AARCH64_EL2H,
            #[cfg(not(feature = "sel2"))]
            spsr: SpsrEl3::D | SpsrEl3::A | SpsrEl3::I | SpsrEl3::F | SpsrEl3::M_AARCH64_EL1H,
            args: [0, 0, 0, 0, core_linear_id, 0, 0, 0],
        }
    }

    fn non_secure_entry_point() -> EntryPointInfo {
        EntryPointInfo {
            pc: BL33_BASE,
            spsr: SpsrEl3::D | SpsrEl3::A | SpsrEl3::I | SpsrEl3::F | SpsrEl3::M_AARCH64_EL2H,
            args: Default::default(),
        }
    }

    fn mpidr_is_valid(mpidr: MpidrEl1) -> bool {
        mpidr.aff3() == 0
            && mpidr.aff2() == 0
            && usize::from(mpidr.aff1()) < CLUSTER_COUNT
            && usize::from(mpidr.aff0()) < MAX_CPUS_PER_CLUSTER
    }

    fn core_position(mpidr: u64) -> usize {
        let mpidr = MpidrEl1::from_bits_retain(mpidr);
        (usize::from(mpidr.aff1()) << PLATFORM_CPU_PER_CLUSTER_SHIFT) + usize::from(mpidr.aff0())
    }

    fn secure_world_pm() -> &'static dyn SecureWorldPm {
        &NoSecurePayload
    }

    fn psci_platform() -> Option<Self::PsciPlatformImpl> {
        let mut first = false;
        PSCI_PLATFORM_TAKEN.call_once(|| first = true);
        first.then_some(QemuPsciPlatformImpl)
    }
}

#[derive(PartialEq, PartialOrd, Debug, Eq, Ord, Clone, Copy)]
pub enum QemuPowerState {
    On,
    Standby,
    PowerDown,
}

impl PlatformPowerStateInterface for QemuPowerState {
    const OFF: Self = Self::PowerDown;
    const RUN: Self = Self::On;

    fn power_state_type(&self) -> PowerStateType {
        match self {
            Self::PowerDown => PowerStateType::PowerDown,
            Self::Standby => PowerStateType::StandbyOrRetention,
            Self::On => PowerStateType::Run,
        }
    }
}

/// Returns the holding pen entry of the given core.
fn hold_entry(core: usize) -> Result<Reg64, MmioError> {
    debug_assert!(core < Qemu::CORE_COUNT);
    // SAFETY: The holding pens are in the trusted mailbox, which is reserved for the warm boot
    // hand-off and only accessed through device registers. `core` is less than `CORE_COUNT` so the
    // entry is within the mailbox.
    unsafe { Reg64::new(HOLD_BASE + (core << HOLD_ENTRY_SHIFT)) }
}

pub struct QemuPsciPlatformImpl;

impl PsciPlatformInterface for QemuPsciPlatformImpl {
    const POWER_DOMAIN_COUNT: usize = 1 + CLUSTER_COUNT + Qemu::CORE_COUNT;
    const MAX_POWER_LEVEL: usize = 2;

    const FEATURES: PsciPlatformOptionalFeatures = PsciPlatformOptionalFeatures::empty();

    type PlatformPowerState = QemuPowerState;

    fn topology() -> &'static [usize] {
        &[1, CLUSTER_COUNT, MAX_CPUS_PER_CLUSTER]
    }

    fn try_parse_power_state(power_state: PowerState) -> Option<PsciCompositePowerState> {
        use QemuPowerState::{On, Standby};

        // A powered down core only leaves its holding pen through CPU_ON, so suspending is limited
        // to CPU retention. The state ID holds one 4-bit local state per level.
        match power_state {
            PowerState::StandbyOrRetention(0x01) => {
                Some(PsciCompositePowerState::new([Standby, On, On]))
            }
            _ => None,
        }
    }

    fn cpu_standby(&self, cpu_state: QemuPowerState) -> Result<(), PlatformError> {
        assert_eq!(cpu_state, QemuPowerState::Standby);

        dsb_sy();
        wfi();
        Ok(())
    }

    fn power_domain_suspend(
        &self,
        target_state: &PsciCompositePowerState,
    ) -> Result<(), PlatformError> {
        assert_eq!(target_state.cpu_level_state(), QemuPowerState::Standby);
        Ok(())
    }

    fn power_domain_suspend_finish(
        &self,
        _previous_state: &PsciCompositePowerState,
    ) -> Result<(), PlatformError> {
        Ok(())
    }

    fn power_domain_off(&self, target_state: &PsciCompositePowerState) -> Result<(), PlatformError> {
        assert_eq!(target_state.cpu_level_state(), QemuPowerState::PowerDown);

        hold_entry(Self::current_core())?.write(HOLD_STATE_WAIT);
        Ok(())
    }

    fn power_domain_power_down_wfi(&self, _target_state: &PsciCompositePowerState) -> ! {
        let core = Self::current_core();
        let hold = hold_entry(core)
            .unwrap_or_else(|e| panic!("Holding pen of core {core} unusable: {e}"));

        dsb_sy();
        while hold.read() != HOLD_STATE_GO {
            wfe();
        }
        hold.write(HOLD_STATE_WAIT);

        // SAFETY: The warm boot entry point sets up its own stack and never returns here.
        unsafe { bl31_warm_entrypoint() }
    }

    fn power_domain_on(&self, mpidr: Mpidr) -> Result<(), PlatformError> {
        let core = Qemu::core_position(u64::from(mpidr));

        // SAFETY: The first word of the trusted mailbox holds the warm boot entry point, and is
        // only accessed through device registers.
        let entry_point = unsafe { Reg64::new(TRUSTED_MAILBOX_BASE) }?;
        entry_point.write(bl31_warm_entrypoint as usize as u64);
        hold_entry(core)?.write(HOLD_STATE_GO);

        dsb_sy();
        sev();
        Ok(())
    }

    fn power_domain_on_finish(
        &self,
        previous_state: &PsciCompositePowerState,
    ) -> Result<(), PlatformError> {
        assert_eq!(previous_state.cpu_level_state(), QemuPowerState::PowerDown);
        Ok(())
    }

    fn system_off(&self) -> Result<(), PlatformError> {
        semihosting_exit(AdpStopped::ApplicationExit, 0);
        // Without a debugger to handle the call there is nothing else which can turn QEMU off.
        Err(PlatformError::Rejected { status: 0 })
    }

    fn system_reset(&self) -> Result<(), PlatformError> {
        // SAFETY: The secure GPIO controller is only used by EL3, for resetting the system.
        let direction = unsafe { Reg32::new(SECURE_GPIO_BASE + GPIODIR) }?;
        // SAFETY: As above. PL061 data accesses are masked by address bits 9:2.
        let data = unsafe { Reg32::new(SECURE_GPIO_BASE + ((SECURE_GPIO_RESET as usize) << 2)) }?;

        direction.write(SECURE_GPIO_RESET);
        data.write(SECURE_GPIO_RESET);
        dsb_sy();
        Ok(())
    }
}

impl QemuPsciPlatformImpl {
    fn current_core() -> usize {
        Qemu::core_position(read_mpidr_el1().bits())
    }
}
