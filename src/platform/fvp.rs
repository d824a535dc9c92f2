// Copyright The Rusted Firmware-A Contributors.
//
// SPDX-License-Identifier: BSD-3-Clause

use super::{Platform, PlatformError};
use crate::{
    aarch64::{dsb_sy, wfi},
    bl31_warm_entrypoint,
    context::{CoreIndex, EntryPointInfo},
    logger::{self, LockedWriter},
    mmio::{Reg32, Reg64, poll_register},
    services::psci::{
        NoSecurePayload, PlatformPowerStateInterface, PowerStateType, PsciCompositePowerState,
        PsciPlatformInterface, PsciPlatformOptionalFeatures, SecureWorldPm,
    },
};
use arm_pl011_uart::{PL011Registers, Uart, UniqueMmioPointer};
use arm_psci::{ErrorCode, HwState, Mpidr, PowerState};
use arm_sysregs::{MpidrEl1, SpsrEl3, read_mpidr_el1};
use core::{ptr::NonNull, time::Duration};
use log::{debug, warn};
use spin::Once;

const FVP_CLUSTER_COUNT: usize = 2;
const FVP_MAX_CPUS_PER_CLUSTER: usize = 4;
const FVP_MAX_PE_PER_CPU: usize = 1;
const PLATFORM_CORE_COUNT: usize = FVP_CLUSTER_COUNT * FVP_MAX_CPUS_PER_CLUSTER * FVP_MAX_PE_PER_CPU;

const ARM_TRUSTED_SRAM_BASE: usize = 0x0400_0000;
const ARM_SHARED_RAM_BASE: usize = ARM_TRUSTED_SRAM_BASE;
/// The first word of shared RAM holds the address at which cores leaving reset on a warm boot
/// continue.
const TRUSTED_MAILBOX_BASE: usize = ARM_SHARED_RAM_BASE;

/// Base address of the PL011 UART used for logs.
const PL011_BASE_ADDRESS: *mut PL011Registers = 0x1C09_0000 as _;

const BL32_BASE: usize = 0x0600_0000;
const BL33_BASE: usize = 0x8800_0000;
#[cfg(feature = "rme")]
const RMM_BASE: usize = 0xfdc0_0000;

// Physical addresses of the configuration blobs passed to the next stages.
const TOS_FW_CONFIG_ADDRESS: u64 = 0x0400_1500;
const NT_FW_CONFIG_ADDRESS: u64 = 0x8000_0000;
const HW_CONFIG_ADDRESS: u64 = 0x07f0_0000;
const HW_CONFIG_ADDRESS_NS: u64 = 0x8200_0000;

#[cfg(feature = "rme")]
const RMM_BOOT_VERSION: u64 = 0;
#[cfg(feature = "rme")]
const RMM_SHARED_AREA_BASE_ADDRESS: u64 = 0;

/// FVP power controller registers.
mod pwrc {
    pub const BASE: usize = 0x1c10_0000;
    /// Power off the core on its next WFI.
    pub const PPOFFR: usize = 0x0;
    /// Power on the core.
    pub const PPONR: usize = 0x4;
    /// Power off the cluster when its last core powers off.
    pub const PCOFFR: usize = 0x8;
    /// Wake up request enable.
    pub const PWKUPR: usize = 0xc;
    /// Status of the core selected by writing its MPIDR.
    pub const PSYSR: usize = 0x10;

    pub const PWKUPR_WEN: u32 = 1 << 31;
    pub const PSYSR_AFF_L1: u32 = 1 << 30;
    pub const PSYSR_AFF_L0: u32 = 1 << 29;
    pub const PSYSR_INVALID: u32 = 0xffff_ffff;
}

/// Versatile Express motherboard system registers.
mod v2m {
    pub const SYSREGS_BASE: usize = 0x1c01_0000;
    pub const SYS_CFGDATA: usize = 0xa0;
    pub const SYS_CFGCTRL: usize = 0xa4;
    pub const SYS_CFGSTAT: usize = 0xa8;

    pub const CFGCTRL_START: u32 = 1 << 31;
    pub const CFGCTRL_RW: u32 = 1 << 30;
    pub const CFGCTRL_FUNC_SHIFT: u32 = 20;
    pub const FUNC_SHUTDOWN: u32 = 0x08;
    pub const FUNC_REBOOT: u32 = 0x09;

    pub const CFGSTAT_COMPLETE: u32 = 1 << 0;
    pub const CFGSTAT_ERROR: u32 = 1 << 1;
}

/// How long to wait for the power controller or the motherboard configuration controller.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_millis(10);

static PSCI_PLATFORM_TAKEN: Once = Once::new();

/// Fixed Virtual Platform
pub struct Fvp;

// SAFETY: `core_position` computes `(cluster * CPUS_PER_CLUSTER + cpu) * PE_PER_CPU + thread`,
// which is unique and less than `CORE_COUNT` for every MPIDR accepted by `mpidr_is_valid`.
unsafe impl Platform for Fvp {
    const CORE_COUNT: usize = PLATFORM_CORE_COUNT;

    type LogSinkImpl = LockedWriter<Uart<'static>>;
    type PsciPlatformImpl = FvpPsciPlatformImpl;

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
            args: [
                TOS_FW_CONFIG_ADDRESS,
                HW_CONFIG_ADDRESS,
                0,
                0,
                core_linear_id,
                0,
                0,
                0,
            ],
        }
    }

    fn non_secure_entry_point() -> EntryPointInfo {
        EntryPointInfo {
            pc: BL33_BASE,
            spsr: SpsrEl3::D | SpsrEl3::A | SpsrEl3::I | SpsrEl3::F | SpsrEl3::M_AARCH64_EL2H,
            args: [NT_FW_CONFIG_ADDRESS, HW_CONFIG_ADDRESS_NS, 0, 0, 0, 0, 0, 0],
        }
    }

    #[cfg(feature = "rme")]
    fn realm_entry_point() -> EntryPointInfo {
        let core_linear_id = CoreIndex::current().get() as u64;
        EntryPointInfo {
            pc: RMM_BASE,
            spsr: SpsrEl3::D | SpsrEl3::A | SpsrEl3::I | SpsrEl3::F | SpsrEl3::M_AARCH64_EL2H,
            args: [
                core_linear_id,
                RMM_BOOT_VERSION,
                Self::CORE_COUNT as u64,
                RMM_SHARED_AREA_BASE_ADDRESS,
                0,
                0,
                0,
                0,
            ],
        }
    }

    fn mpidr_is_valid(mpidr: MpidrEl1) -> bool {
        if mpidr.contains(MpidrEl1::MT) {
            mpidr.aff3() == 0
                && usize::from(mpidr.aff2()) < FVP_CLUSTER_COUNT
                && usize::from(mpidr.aff1()) < FVP_MAX_CPUS_PER_CLUSTER
                && usize::from(mpidr.aff0()) < FVP_MAX_PE_PER_CPU
        } else {
            mpidr.aff3() == 0
                && mpidr.aff2() == 0
                && usize::from(mpidr.aff1()) < FVP_CLUSTER_COUNT
                && usize::from(mpidr.aff0()) < FVP_MAX_CPUS_PER_CLUSTER
        }
    }

    fn core_position(mpidr: u64) -> usize {
        let mut mpidr = MpidrEl1::from_bits_retain(mpidr);
        // Make a single threaded MPIDR look as if it came from a multithreaded implementation.
        if !mpidr.contains(MpidrEl1::MT) {
            mpidr = MpidrEl1::from_bits_retain(mpidr.bits() << MpidrEl1::AFF1_SHIFT);
        }
        let thread = usize::from(mpidr.aff0());
        let cpu = usize::from(mpidr.aff1());
        let cluster = usize::from(mpidr.aff2());

        (cluster * FVP_MAX_CPUS_PER_CLUSTER + cpu) * FVP_MAX_PE_PER_CPU + thread
    }

    fn secure_world_pm() -> &'static dyn SecureWorldPm {
        &NoSecurePayload
    }

    fn psci_platform() -> Option<Self::PsciPlatformImpl> {
        let mut first = false;
        PSCI_PLATFORM_TAKEN.call_once(|| first = true);
        first.then_some(FvpPsciPlatformImpl)
    }
}

#[derive(PartialEq, PartialOrd, Debug, Eq, Ord, Clone, Copy)]
pub enum FvpPowerState {
    On,
    Retention,
    PowerDown,
}

impl PlatformPowerStateInterface for FvpPowerState {
    const OFF: Self = Self::PowerDown;
    const RUN: Self = Self::On;

    fn power_state_type(&self) -> PowerStateType {
        match self {
            Self::PowerDown => PowerStateType::PowerDown,
            Self::Retention => PowerStateType::StandbyOrRetention,
            Self::On => PowerStateType::Run,
        }
    }
}

/// Returns the given power controller register.
fn pwrc_register(offset: usize) -> Result<Reg32, PlatformError> {
    // SAFETY: The power controller is only accessed by EL3, through device registers.
    Ok(unsafe { Reg32::new(pwrc::BASE + offset) }?)
}

/// Returns the given V2M system register.
fn v2m_register(offset: usize) -> Result<Reg32, PlatformError> {
    // SAFETY: The V2M system configuration registers are only accessed by EL3, through device
    // registers.
    Ok(unsafe { Reg32::new(v2m::SYSREGS_BASE + offset) }?)
}

/// Returns the affinity fields of `mpidr` in the format expected by the power controller.
fn pwrc_mpidr(mpidr: u64) -> u32 {
    (mpidr & 0x00ff_ffff) as u32
}

/// Reads the power controller status of the core with the given MPIDR.
fn read_psysr(mpidr: u64) -> Result<u32, PlatformError> {
    let psysr = pwrc_register(pwrc::PSYSR)?;
    psysr.write(pwrc_mpidr(mpidr));
    Ok(psysr.read())
}

/// Points cores leaving reset on a warm boot at the warm boot entry point.
fn program_trusted_mailbox() -> Result<(), PlatformError> {
    // SAFETY: The first word of shared RAM is reserved for the warm boot entry point, and is only
    // accessed through device registers.
    let mailbox = unsafe { Reg64::new(TRUSTED_MAILBOX_BASE) }?;
    mailbox.write(bl31_warm_entrypoint as usize as u64);
    dsb_sy();
    Ok(())
}

/// Asks the motherboard configuration controller to carry out `function`, and waits until it has.
fn v2m_system_config(function: u32) -> Result<(), PlatformError> {
    let status = v2m_register(v2m::SYS_CFGSTAT)?;
    status.write(0);
    v2m_register(v2m::SYS_CFGDATA)?.write(0);
    v2m_register(v2m::SYS_CFGCTRL)?.write(
        v2m::CFGCTRL_START | v2m::CFGCTRL_RW | (function << v2m::CFGCTRL_FUNC_SHIFT),
    );

    let status = poll_register(
        &status,
        v2m::CFGSTAT_COMPLETE,
        v2m::CFGSTAT_COMPLETE,
        HANDSHAKE_TIMEOUT,
    )?;
    if status & v2m::CFGSTAT_ERROR != 0 {
        return Err(PlatformError::Rejected { status });
    }
    Ok(())
}

pub struct FvpPsciPlatformImpl;

impl FvpPsciPlatformImpl {
    /// Programs the power controller to power off the cluster of this core along with it.
    fn cluster_power_down(&self, mpidr: u64) -> Result<(), PlatformError> {
        pwrc_register(pwrc::PCOFFR)?.write(pwrc_mpidr(mpidr));
        Ok(())
    }

    fn power_on_finish_common(
        &self,
        previous_state: &PsciCompositePowerState,
    ) -> Result<(), PlatformError> {
        assert_eq!(previous_state.cpu_level_state(), FvpPowerState::PowerDown);
        let mpidr = read_mpidr_el1().bits();

        if previous_state.states[1] == FvpPowerState::PowerDown {
            // The core may have woken up while the cluster was powering down, which leaves a
            // pending cluster power off request that must be cancelled.
            pwrc_register(pwrc::PPONR)?.write(pwrc_mpidr(mpidr));
        }

        // Stop interrupts from waking the core until it is suspended again.
        pwrc_register(pwrc::PWKUPR)?.write(pwrc_mpidr(mpidr));
        Ok(())
    }
}

impl PsciPlatformInterface for FvpPsciPlatformImpl {
    const POWER_DOMAIN_COUNT: usize = 1 + FVP_CLUSTER_COUNT + PLATFORM_CORE_COUNT;
    const MAX_POWER_LEVEL: usize = 2;

    const FEATURES: PsciPlatformOptionalFeatures = PsciPlatformOptionalFeatures::NODE_HW_STATE
        .union(PsciPlatformOptionalFeatures::SYSTEM_SUSPEND);

    type PlatformPowerState = FvpPowerState;

    fn topology() -> &'static [usize] {
        &[
            1,
            FVP_CLUSTER_COUNT,
            FVP_MAX_CPUS_PER_CLUSTER,
            FVP_MAX_CPUS_PER_CLUSTER,
        ]
    }

    fn try_parse_power_state(power_state: PowerState) -> Option<PsciCompositePowerState> {
        use FvpPowerState::{On, PowerDown, Retention};

        // The system level is only ever suspended through SYSTEM_SUSPEND, so deeper requests are
        // limited to the cluster.
        let states = match power_state {
            PowerState::StandbyOrRetention(0x01) => [Retention, On, On],
            PowerState::PowerDown(0x02) => [PowerDown, On, On],
            PowerState::PowerDown(0x22) | PowerState::PowerDown(0x222) => {
                [PowerDown, PowerDown, On]
            }
            _ => return None,
        };

        Some(PsciCompositePowerState::new(states))
    }

    fn cpu_standby(&self, cpu_state: FvpPowerState) -> Result<(), PlatformError> {
        assert_eq!(cpu_state, FvpPowerState::Retention);

        dsb_sy();
        wfi();
        Ok(())
    }

    fn power_domain_suspend(
        &self,
        target_state: &PsciCompositePowerState,
    ) -> Result<(), PlatformError> {
        // Retention only exists at the CPU level, and needs nothing from the power controller.
        if target_state.cpu_level_state() == FvpPowerState::Retention {
            return Ok(());
        }
        assert_eq!(target_state.cpu_level_state(), FvpPowerState::PowerDown);

        let mpidr = read_mpidr_el1().bits();
        program_trusted_mailbox()?;
        pwrc_register(pwrc::PWKUPR)?.write(pwrc::PWKUPR_WEN | pwrc_mpidr(mpidr));

        if target_state.states[1] == FvpPowerState::PowerDown {
            self.cluster_power_down(mpidr)?;
        }

        pwrc_register(pwrc::PPOFFR)?.write(pwrc_mpidr(mpidr));
        Ok(())
    }

    fn power_domain_suspend_finish(
        &self,
        previous_state: &PsciCompositePowerState,
    ) -> Result<(), PlatformError> {
        if previous_state.cpu_level_state() == FvpPowerState::Retention {
            return Ok(());
        }
        self.power_on_finish_common(previous_state)
    }

    fn power_domain_off(&self, target_state: &PsciCompositePowerState) -> Result<(), PlatformError> {
        assert_eq!(target_state.cpu_level_state(), FvpPowerState::PowerDown);

        let mpidr = read_mpidr_el1().bits();
        pwrc_register(pwrc::PPOFFR)?.write(pwrc_mpidr(mpidr));

        if target_state.states[1] == FvpPowerState::PowerDown {
            self.cluster_power_down(mpidr)?;
        }
        Ok(())
    }

    fn power_domain_on(&self, mpidr: Mpidr) -> Result<(), PlatformError> {
        let mpidr = u64::from(mpidr);
        program_trusted_mailbox()?;

        // Cancelling a power off request which is still in flight would leave the core stuck in
        // WFI, so wait for it to finish powering off first.
        let psysr = pwrc_register(pwrc::PSYSR)?;
        psysr.write(pwrc_mpidr(mpidr));
        poll_register(&psysr, pwrc::PSYSR_AFF_L0, 0, HANDSHAKE_TIMEOUT)?;

        pwrc_register(pwrc::PPONR)?.write(pwrc_mpidr(mpidr));
        debug!("Requested power on of core {mpidr:#x}");
        Ok(())
    }

    fn power_domain_on_finish(
        &self,
        previous_state: &PsciCompositePowerState,
    ) -> Result<(), PlatformError> {
        self.power_on_finish_common(previous_state)
    }

    fn system_off(&self) -> Result<(), PlatformError> {
        v2m_system_config(v2m::FUNC_SHUTDOWN)
    }

    fn system_reset(&self) -> Result<(), PlatformError> {
        v2m_system_config(v2m::FUNC_REBOOT)
    }

    fn node_hw_state(&self, mpidr: Mpidr, power_level: u32) -> Result<HwState, ErrorCode> {
        // Only the CPU and cluster levels are reported by the power controller.
        let mask = match power_level {
            0 => pwrc::PSYSR_AFF_L0,
            1 => pwrc::PSYSR_AFF_L1,
            _ => return Err(ErrorCode::InvalidParameters),
        };

        let psysr = read_psysr(u64::from(mpidr)).map_err(|e| {
            warn!("Failed to read power controller status: {e}");
            ErrorCode::InternalFailure
        })?;
        if psysr == pwrc::PSYSR_INVALID {
            return Err(ErrorCode::InvalidParameters);
        }

        Ok(if psysr & mask != 0 {
            HwState::On
        } else {
            HwState::Off
        })
    }

    fn sys_suspend_power_state(&self) -> PsciCompositePowerState {
        PsciCompositePowerState::OFF
    }
}
