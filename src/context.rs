// Copyright The Rusted Firmware-A Contributors.
//
// SPDX-License-Identifier: BSD-3-Clause

//! Per-core, per-world saved register contexts.

use crate::{
    aarch64::isb,
    platform::{Platform, PlatformImpl, exception_free},
    smccc::{SMC_REGISTER_COUNT, SmcReturn},
    sysregs::{is_el2_implemented, spsr_with_el1_mode},
};
#[cfg(not(feature = "sel2"))]
use crate::sysregs::SCTLR_EL1_RES1;
use arm_sysregs::{ExceptionLevel, PmcrEl0, ScrEl3, SpsrEl3, read_mpidr_el1, write_scr_el3};
#[cfg(feature = "sel2")]
use arm_sysregs::{
    CnthctlEl2, CntvoffEl2, ContextidrEl2, CptrEl2, ElrEl2, EsrEl2, FarEl2, HcrEl2, MairEl2,
    MdcrEl2, SctlrEl2, SpEl2, SpsrEl2, TcrEl2, TpidrEl2, Ttbr0El2, Ttbr1El2, VbarEl2, VmpidrEl2,
    VpidrEl2, VtcrEl2, VttbrEl2, read_actlr_el2, read_id_aa64mmfr1_el1, read_amair_el2, read_cnthctl_el2,
    read_cntvoff_el2, read_contextidr_el2, read_cptr_el2, read_elr_el2, read_esr_el2,
    read_far_el2, read_hcr_el2, read_hstr_el2, read_mair_el2, read_mdcr_el2, read_sctlr_el2,
    read_sp_el2, read_spsr_el2, read_tcr_el2, read_tpidr_el2, read_ttbr0_el2, read_ttbr1_el2,
    read_vbar_el2, read_vmpidr_el2, read_vpidr_el2, read_vtcr_el2, read_vttbr_el2,
    write_actlr_el2, write_amair_el2, write_cnthctl_el2, write_cntvoff_el2, write_contextidr_el2,
    write_cptr_el2, write_elr_el2, write_esr_el2, write_far_el2, write_hcr_el2, write_hstr_el2,
    write_mair_el2, write_mdcr_el2, write_sctlr_el2, write_sp_el2, write_spsr_el2,
    write_tcr_el2, write_tpidr_el2, write_ttbr0_el2, write_ttbr1_el2, write_vbar_el2,
    write_vmpidr_el2, write_vpidr_el2, write_vtcr_el2, write_vttbr_el2,
};
#[cfg(not(feature = "sel2"))]
use arm_sysregs::{
    ContextidrEl1, CpacrEl1, CsselrEl1, ElrEl1, EsrEl1, FarEl1, MairEl1, ParEl1, SctlrEl1, SpEl1,
    SpsrEl1, TcrEl1, TpidrEl0, TpidrEl1, TpidrroEl0, Ttbr0El1, Ttbr1El1, VbarEl1,
    read_actlr_el1, read_amair_el1, read_contextidr_el1, read_cpacr_el1, read_csselr_el1,
    read_elr_el1, read_esr_el1, read_far_el1, read_mair_el1, read_par_el1, read_sctlr_el1,
    read_sp_el1, read_spsr_el1, read_tcr_el1, read_tpidr_el0, read_tpidr_el1, read_tpidrro_el0,
    read_ttbr0_el1, read_ttbr1_el1, read_vbar_el1, write_actlr_el1, write_amair_el1,
    write_contextidr_el1, write_cpacr_el1, write_csselr_el1, write_elr_el1, write_esr_el1,
    write_far_el1, write_mair_el1, write_par_el1, write_sctlr_el1, write_sp_el1,
    write_spsr_el1, write_tcr_el1, write_tpidr_el0, write_tpidr_el1, write_tpidrro_el0,
    write_ttbr0_el1, write_ttbr1_el1, write_vbar_el1,
};
use arm_psci::EntryPoint;
use core::{
    cell::{RefCell, RefMut},
    fmt::{self, Display, Formatter},
    ops::{Index, IndexMut},
};
use log::debug;
use percore::{Cores, ExceptionFree, ExceptionLock, PerCore};

/// The number of contexts to store for each CPU core, one per security state.
const CPU_DATA_CONTEXT_NUM: usize = if cfg!(feature = "rme") { 3 } else { 2 };

/// Per-core mutable state.
pub type PerCoreState<T> =
    PerCore<[ExceptionLock<RefCell<T>>; PlatformImpl::CORE_COUNT], CoresImpl>;

/// A security state which a lower exception level can run in.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[repr(u32)]
pub enum World {
    Secure = 0,
    NonSecure = 1,
    #[cfg(feature = "rme")]
    Realm = 2,
}

impl World {
    fn index(self) -> usize {
        self as usize
    }

    /// Returns whether calls from this world come from a less trusted state than the secure world.
    pub fn is_less_trusted(self) -> bool {
        self != Self::Secure
    }
}

/// Implementation of the `Cores` trait to get the index of the current CPU core.
pub struct CoresImpl;

// SAFETY: This implementation never returns the same index for different cores because
// `core_position` is guaranteed not to.
unsafe impl Cores for CoresImpl {
    fn core_index() -> usize {
        PlatformImpl::core_position(read_mpidr_el1().bits())
    }
}

/// The linear index of a physical core, known to be less than [`Platform::CORE_COUNT`].
#[derive(Copy, Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct CoreIndex(usize);

impl CoreIndex {
    /// Returns the index if it is in range.
    pub const fn new(index: usize) -> Option<Self> {
        if index < PlatformImpl::CORE_COUNT {
            Some(Self(index))
        } else {
            None
        }
    }

    /// Returns the index of the core this is running on.
    pub fn current() -> Self {
        let index = CoresImpl::core_index();
        Self::new(index).unwrap_or_else(|| panic!("Core position {index} out of range"))
    }

    /// Returns the index as a `usize`, for indexing per-core arrays.
    pub const fn get(self) -> usize {
        self.0
    }

    /// Iterates over all cores of the platform.
    pub fn all() -> impl Iterator<Item = Self> {
        (0..PlatformImpl::CORE_COUNT).map(Self)
    }
}

impl Display for CoreIndex {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// The state of a core at the next lower EL in a given security state.
#[derive(Clone, Debug, Eq, PartialEq)]
#[repr(C)]
pub struct CpuContext {
    /// The general purpose registers, saved on entry to EL3.
    pub gpregs: GpRegs,
    /// The state EL3 returns to the lower EL with.
    pub el3_state: El3State,
    #[cfg(feature = "sel2")]
    el2_sysregs: El2Sysregs,
    #[cfg(not(feature = "sel2"))]
    el1_sysregs: El1Sysregs,
}

impl CpuContext {
    const EMPTY: Self = Self {
        gpregs: GpRegs::EMPTY,
        el3_state: El3State::EMPTY,
        #[cfg(feature = "sel2")]
        el2_sysregs: El2Sysregs::EMPTY,
        #[cfg(not(feature = "sel2"))]
        el1_sysregs: El1Sysregs::EMPTY,
    };

    fn save_lower_el_sysregs(&mut self) {
        #[cfg(feature = "sel2")]
        self.el2_sysregs.save();
        #[cfg(not(feature = "sel2"))]
        self.el1_sysregs.save();
    }

    fn restore_lower_el_sysregs(&self) {
        #[cfg(feature = "sel2")]
        self.el2_sysregs.restore();
        #[cfg(not(feature = "sel2"))]
        self.el1_sysregs.restore();
    }

    /// Returns the entry point the next exception return will resume at.
    pub fn resume_point(&self) -> EntryPointInfo {
        let mut args = [0; 8];
        args.copy_from_slice(&self.gpregs.registers[..8]);
        EntryPointInfo {
            pc: self.el3_state.elr_el3,
            spsr: self.el3_state.spsr_el3,
            args,
        }
    }
}

/// AArch64 general purpose registers x0-x30 and SP_EL0.
#[derive(Clone, Debug, Eq, PartialEq)]
#[repr(C, align(16))]
pub struct GpRegs {
    /// x0-x30 followed by SP_EL0.
    pub registers: [u64; Self::COUNT],
}

impl GpRegs {
    /// The number of (64-bit) registers included in `GpRegs`.
    const COUNT: usize = 32;

    const EMPTY: Self = Self {
        registers: [0; Self::COUNT],
    };

    /// Writes the given return value to the general-purpose registers.
    ///
    /// Registers beyond the length of `value` are left unchanged.
    pub fn write_return_value(&mut self, value: &SmcReturn) {
        self.registers[..value.values().len()].copy_from_slice(value.values());
    }

    /// Returns the SMC argument registers x0-x17.
    pub fn call_registers(&self) -> [u64; SMC_REGISTER_COUNT] {
        let mut regs = [0; SMC_REGISTER_COUNT];
        regs.copy_from_slice(&self.registers[..SMC_REGISTER_COUNT]);
        regs
    }
}

/// Registers used by EL3 to return to and re-enter a lower EL.
#[derive(Clone, Debug, Eq, PartialEq)]
#[repr(C, align(16))]
pub struct El3State {
    /// Secure configuration to apply before returning to the lower EL.
    pub scr_el3: ScrEl3,
    esr_el3: u64,
    // Adjacent, as the exception entry code saves them with a single `stp`.
    runtime_sp: u64,
    runtime_lr: u64,
    /// PSTATE to return with.
    pub spsr_el3: SpsrEl3,
    /// Address to return to.
    pub elr_el3: usize,
    pmcr_el0: u64,
}

impl El3State {
    const EMPTY: Self = Self {
        scr_el3: ScrEl3::empty(),
        esr_el3: 0,
        runtime_sp: 0,
        runtime_lr: 0,
        spsr_el3: SpsrEl3::empty(),
        elr_el3: 0,
        pmcr_el0: 0,
    };
}

/// EL1 system registers which must be preserved across world switches when there is no secure EL2.
#[derive(Clone, Debug, Eq, PartialEq)]
#[cfg(not(feature = "sel2"))]
struct El1Sysregs {
    spsr_el1: SpsrEl1,
    elr_el1: ElrEl1,
    sctlr_el1: SctlrEl1,
    tcr_el1: TcrEl1,
    cpacr_el1: CpacrEl1,
    csselr_el1: CsselrEl1,
    sp_el1: SpEl1,
    esr_el1: EsrEl1,
    ttbr0_el1: Ttbr0El1,
    ttbr1_el1: Ttbr1El1,
    mair_el1: MairEl1,
    amair_el1: u64,
    actlr_el1: u64,
    tpidr_el1: TpidrEl1,
    tpidr_el0: TpidrEl0,
    tpidrro_el0: TpidrroEl0,
    par_el1: ParEl1,
    far_el1: FarEl1,
    contextidr_el1: ContextidrEl1,
    vbar_el1: VbarEl1,
}

#[cfg(not(feature = "sel2"))]
impl El1Sysregs {
    const EMPTY: Self = Self {
        spsr_el1: SpsrEl1::empty(),
        elr_el1: ElrEl1::empty(),
        sctlr_el1: SctlrEl1::empty(),
        tcr_el1: TcrEl1::empty(),
        cpacr_el1: CpacrEl1::empty(),
        csselr_el1: CsselrEl1::empty(),
        sp_el1: SpEl1::empty(),
        esr_el1: EsrEl1::empty(),
        ttbr0_el1: Ttbr0El1::empty(),
        ttbr1_el1: Ttbr1El1::empty(),
        mair_el1: MairEl1::empty(),
        amair_el1: 0,
        actlr_el1: 0,
        tpidr_el1: TpidrEl1::empty(),
        tpidr_el0: TpidrEl0::empty(),
        tpidrro_el0: TpidrroEl0::empty(),
        par_el1: ParEl1::empty(),
        far_el1: FarEl1::empty(),
        contextidr_el1: ContextidrEl1::empty(),
        vbar_el1: VbarEl1::empty(),
    };

    fn save(&mut self) {
        self.spsr_el1 = read_spsr_el1();
        self.elr_el1 = read_elr_el1();
        self.sctlr_el1 = read_sctlr_el1();
        self.tcr_el1 = read_tcr_el1();
        self.cpacr_el1 = read_cpacr_el1();
        self.csselr_el1 = read_csselr_el1();
        self.sp_el1 = read_sp_el1();
        self.esr_el1 = read_esr_el1();
        self.ttbr0_el1 = read_ttbr0_el1();
        self.ttbr1_el1 = read_ttbr1_el1();
        self.mair_el1 = read_mair_el1();
        self.amair_el1 = read_amair_el1();
        self.actlr_el1 = read_actlr_el1();
        self.tpidr_el1 = read_tpidr_el1();
        self.tpidr_el0 = read_tpidr_el0();
        self.tpidrro_el0 = read_tpidrro_el0();
        self.par_el1 = read_par_el1();
        self.far_el1 = read_far_el1();
        self.contextidr_el1 = read_contextidr_el1();
        self.vbar_el1 = read_vbar_el1();
    }

    fn restore(&self) {
        // SAFETY: EL3 is not running at EL1, so these registers only affect the lower EL, and the
        // values were saved from the same world which is about to run with them again.
        unsafe {
            write_spsr_el1(self.spsr_el1);
            write_elr_el1(self.elr_el1);
            write_sctlr_el1(self.sctlr_el1);
            write_tcr_el1(self.tcr_el1);
            write_cpacr_el1(self.cpacr_el1);
            write_csselr_el1(self.csselr_el1);
            write_sp_el1(self.sp_el1);
            write_esr_el1(self.esr_el1);
            write_ttbr0_el1(self.ttbr0_el1);
            write_ttbr1_el1(self.ttbr1_el1);
            write_mair_el1(self.mair_el1);
            write_amair_el1(self.amair_el1);
            write_actlr_el1(self.actlr_el1);
            write_tpidr_el1(self.tpidr_el1);
            write_tpidr_el0(self.tpidr_el0);
            write_tpidrro_el0(self.tpidrro_el0);
            write_par_el1(self.par_el1);
            write_far_el1(self.far_el1);
            write_contextidr_el1(self.contextidr_el1);
            write_vbar_el1(self.vbar_el1);
        }
    }
}

/// EL2 system registers which must be preserved across world switches.
#[derive(Clone, Debug, Eq, PartialEq)]
#[cfg(feature = "sel2")]
struct El2Sysregs {
    actlr_el2: u64,
    amair_el2: u64,
    cnthctl_el2: CnthctlEl2,
    cntvoff_el2: CntvoffEl2,
    contextidr_el2: ContextidrEl2,
    cptr_el2: CptrEl2,
    elr_el2: ElrEl2,
    esr_el2: EsrEl2,
    far_el2: FarEl2,
    hcr_el2: HcrEl2,
    hstr_el2: u64,
    mair_el2: MairEl2,
    mdcr_el2: MdcrEl2,
    sctlr_el2: SctlrEl2,
    spsr_el2: SpsrEl2,
    sp_el2: SpEl2,
    tcr_el2: TcrEl2,
    tpidr_el2: TpidrEl2,
    ttbr0_el2: Ttbr0El2,
    ttbr1_el2: Ttbr1El2,
    vbar_el2: VbarEl2,
    vmpidr_el2: VmpidrEl2,
    vpidr_el2: VpidrEl2,
    vtcr_el2: VtcrEl2,
    vttbr_el2: VttbrEl2,
}

#[cfg(feature = "sel2")]
impl El2Sysregs {
    const EMPTY: Self = Self {
        actlr_el2: 0,
        amair_el2: 0,
        cnthctl_el2: CnthctlEl2::empty(),
        cntvoff_el2: CntvoffEl2::empty(),
        contextidr_el2: ContextidrEl2::empty(),
        cptr_el2: CptrEl2::empty(),
        elr_el2: ElrEl2::empty(),
        esr_el2: EsrEl2::empty(),
        far_el2: FarEl2::empty(),
        hcr_el2: HcrEl2::empty(),
        hstr_el2: 0,
        mair_el2: MairEl2::empty(),
        mdcr_el2: MdcrEl2::empty(),
        sctlr_el2: SctlrEl2::empty(),
        spsr_el2: SpsrEl2::empty(),
        sp_el2: SpEl2::empty(),
        tcr_el2: TcrEl2::empty(),
        tpidr_el2: TpidrEl2::empty(),
        ttbr0_el2: Ttbr0El2::empty(),
        ttbr1_el2: Ttbr1El2::empty(),
        vbar_el2: VbarEl2::empty(),
        vmpidr_el2: VmpidrEl2::empty(),
        vpidr_el2: VpidrEl2::empty(),
        vtcr_el2: VtcrEl2::empty(),
        vttbr_el2: VttbrEl2::empty(),
    };

    fn save(&mut self) {
        self.actlr_el2 = read_actlr_el2();
        self.amair_el2 = read_amair_el2();
        self.cnthctl_el2 = read_cnthctl_el2();
        self.cntvoff_el2 = read_cntvoff_el2();
        self.cptr_el2 = read_cptr_el2();
        self.elr_el2 = read_elr_el2();
        self.esr_el2 = read_esr_el2();
        self.far_el2 = read_far_el2();
        self.hcr_el2 = read_hcr_el2();
        self.hstr_el2 = read_hstr_el2();
        self.mair_el2 = read_mair_el2();
        self.mdcr_el2 = read_mdcr_el2();
        self.sctlr_el2 = read_sctlr_el2();
        self.spsr_el2 = read_spsr_el2();
        self.sp_el2 = read_sp_el2();
        self.tcr_el2 = read_tcr_el2();
        self.tpidr_el2 = read_tpidr_el2();
        self.ttbr0_el2 = read_ttbr0_el2();
        self.vbar_el2 = read_vbar_el2();
        self.vmpidr_el2 = read_vmpidr_el2();
        self.vpidr_el2 = read_vpidr_el2();
        self.vtcr_el2 = read_vtcr_el2();
        self.vttbr_el2 = read_vttbr_el2();

        if read_id_aa64mmfr1_el1().is_feat_vhe_present() {
            self.contextidr_el2 = read_contextidr_el2();
            self.ttbr1_el2 = read_ttbr1_el2();
        }
    }

    fn restore(&self) {
        // SAFETY: EL3 is not running at EL2, so these registers only affect the lower EL, and the
        // values were saved from the same world which is about to run with them again.
        unsafe {
            write_actlr_el2(self.actlr_el2);
            write_amair_el2(self.amair_el2);
            write_cnthctl_el2(self.cnthctl_el2);
            write_cntvoff_el2(self.cntvoff_el2);
            write_cptr_el2(self.cptr_el2);
            write_elr_el2(self.elr_el2);
            write_esr_el2(self.esr_el2);
            write_far_el2(self.far_el2);
            write_hcr_el2(self.hcr_el2);
            write_hstr_el2(self.hstr_el2);
            write_mair_el2(self.mair_el2);
            write_mdcr_el2(self.mdcr_el2);
            write_sctlr_el2(self.sctlr_el2);
            write_spsr_el2(self.spsr_el2);
            write_sp_el2(self.sp_el2);
            write_tcr_el2(self.tcr_el2);
            write_tpidr_el2(self.tpidr_el2);
            write_ttbr0_el2(self.ttbr0_el2);
            write_vbar_el2(self.vbar_el2);
            write_vmpidr_el2(self.vmpidr_el2);
            write_vpidr_el2(self.vpidr_el2);
            write_vtcr_el2(self.vtcr_el2);
            write_vttbr_el2(self.vttbr_el2);

            if read_id_aa64mmfr1_el1().is_feat_vhe_present() {
                write_contextidr_el2(self.contextidr_el2);
                write_ttbr1_el2(self.ttbr1_el2);
            }
        }
    }
}

/// An array with one `T` for each world.
#[derive(Clone, Debug, Eq, PartialEq)]
#[repr(transparent)]
pub struct PerWorld<T>([T; CPU_DATA_CONTEXT_NUM]);

impl<T> Index<World> for PerWorld<T> {
    type Output = T;

    fn index(&self, world: World) -> &Self::Output {
        &self.0[world.index()]
    }
}

impl<T> IndexMut<World> for PerWorld<T> {
    fn index_mut(&mut self, world: World) -> &mut Self::Output {
        &mut self.0[world.index()]
    }
}

/// The contexts of all worlds of a single core, and which of them is active.
#[derive(Debug)]
pub struct CoreContexts {
    contexts: PerWorld<Option<CpuContext>>,
    active: Option<World>,
}

impl CoreContexts {
    const EMPTY: Self = Self {
        contexts: PerWorld([const { None }; CPU_DATA_CONTEXT_NUM]),
        active: None,
    };

    fn context_mut(&mut self, core: CoreIndex, world: World) -> &mut CpuContext {
        self.contexts[world]
            .as_mut()
            .unwrap_or_else(|| panic!("{world:?} context of core {core} used before initialisation"))
    }

    fn active_world(&self, core: CoreIndex) -> World {
        self.active
            .unwrap_or_else(|| panic!("No world is active on core {core}"))
    }
}

/// Storage for the saved contexts of every world on every core.
///
/// Each core only ever accesses its own contexts, so all methods which take a [`CoreIndex`] must be
/// called on that core.
pub struct ContextStore {
    cores: PerCoreState<CoreContexts>,
}

/// The contexts used by the running firmware.
pub static CONTEXTS: ContextStore = ContextStore::new();

impl ContextStore {
    /// Creates a store with no initialised contexts.
    pub const fn new() -> Self {
        Self {
            cores: PerCore::new(
                [const { ExceptionLock::new(RefCell::new(CoreContexts::EMPTY)) };
                    PlatformImpl::CORE_COUNT],
            ),
        }
    }

    /// Returns the contexts of the current core, which must be `core`.
    fn core_contexts<'a>(
        &'a self,
        token: ExceptionFree<'a>,
        core: CoreIndex,
    ) -> RefMut<'a, CoreContexts> {
        assert_eq!(
            core,
            CoreIndex::current(),
            "Contexts of core {core} accessed from another core"
        );
        self.cores.get().borrow_mut(token)
    }

    /// Returns the context of `world` on `core`.
    ///
    /// Panics if the context was never initialised with [`Self::init_context`]: resuming from a
    /// zeroed context would enter a lower EL with undefined register state.
    pub fn get_context<'a>(
        &'a self,
        token: ExceptionFree<'a>,
        core: CoreIndex,
        world: World,
    ) -> RefMut<'a, CpuContext> {
        RefMut::map(self.core_contexts(token, core), |contexts| {
            contexts.context_mut(core, world)
        })
    }

    /// Returns the world whose context the next exception return on `core` restores.
    pub fn active_world(&self, core: CoreIndex) -> Option<World> {
        exception_free(|token| self.core_contexts(token, core).active)
    }

    /// Makes `world` the context restored by the next exception return on `core`.
    ///
    /// This doesn't touch any system registers, see [`Self::prepare_world_switch`] for that.
    pub fn set_active(&self, core: CoreIndex, world: World) {
        exception_free(|token| {
            let mut contexts = self.core_contexts(token, core);
            contexts.context_mut(core, world);
            contexts.active = Some(world);
        });
    }

    /// Returns a raw pointer to the active context of `core`, for the exception return path.
    pub fn active_context_ptr(&self, core: CoreIndex) -> *mut CpuContext {
        exception_free(|token| {
            let mut contexts = self.core_contexts(token, core);
            let world = contexts.active_world(core);
            &raw mut *contexts.context_mut(core, world)
        })
    }

    /// Initialises the context of `world` on `core` to enter `entry_point`.
    ///
    /// Any previous state of the context is discarded. This is used both before a world is entered
    /// for the first time and when a core is prepared to enter a world after being powered off.
    pub fn init_context(&self, core: CoreIndex, world: World, entry_point: &EntryPointInfo) {
        let mut context = CpuContext::EMPTY;
        match world {
            World::NonSecure => initialise_nonsecure(&mut context, entry_point),
            World::Secure => initialise_secure(&mut context, entry_point),
            #[cfg(feature = "rme")]
            World::Realm => initialise_realm(&mut context, entry_point),
        }
        debug!(
            "Initialised {world:?} context on core {core}: pc {:#x} spsr {:?}",
            entry_point.pc, entry_point.spsr
        );

        exception_free(|token| {
            let mut contexts = self.core_contexts(token, core);
            contexts.contexts[world] = Some(context);
            // The live system registers no longer belong to the new context, so it has to be
            // restored by the next world switch.
            if contexts.active == Some(world) {
                contexts.active = None;
            }
        });
    }

    /// Prepares `core` to return to `target`, and makes it the active world.
    ///
    /// The lower EL system registers of the currently active world (if any) are saved to its
    /// context, and those of `target` are restored. When entering the normal world at EL2 on
    /// hardware without EL2, the entry is moved to EL1.
    pub fn prepare_world_switch(&self, core: CoreIndex, target: World) {
        exception_free(|token| {
            let mut contexts = self.core_contexts(token, core);

            match contexts.active {
                Some(current) if current == target => return,
                Some(current) => contexts.context_mut(core, current).save_lower_el_sysregs(),
                None => {}
            }

            let context = contexts.context_mut(core, target);
            if target == World::NonSecure {
                select_non_secure_el(&mut context.el3_state);
            }

            // SCR_EL3 must be written before the lower EL registers, as it controls whether some
            // of them are accessible.
            // SAFETY: EL3 doesn't depend on any SCR_EL3 field while it is running, the value only
            // takes effect for the lower EL after the exception return.
            unsafe {
                write_scr_el3(context.el3_state.scr_el3);
            }
            isb();
            context.restore_lower_el_sysregs();

            contexts.active = Some(target);
        });
    }

    /// Returns the SMC argument registers of the active context of `core`.
    pub fn call_registers(&self, core: CoreIndex) -> [u64; SMC_REGISTER_COUNT] {
        exception_free(|token| {
            let mut contexts = self.core_contexts(token, core);
            let world = contexts.active_world(core);
            contexts.context_mut(core, world).gpregs.call_registers()
        })
    }

    /// Writes an SMC return value to the active context of `core`.
    pub fn write_return_value(&self, core: CoreIndex, value: &SmcReturn) {
        if value.is_empty() {
            return;
        }
        exception_free(|token| {
            let mut contexts = self.core_contexts(token, core);
            let world = contexts.active_world(core);
            contexts
                .context_mut(core, world)
                .gpregs
                .write_return_value(value);
        });
    }

    /// Updates the normal world context of `core` to resume at the entry point given to a power
    /// down suspend call.
    ///
    /// Other worlds, and the rest of the normal world state, are kept as they were when the core
    /// was suspended. The lower EL system registers were lost with the core's power, so no world is
    /// left active and the next [`Self::prepare_world_switch`] restores them from the saved context.
    pub fn update_for_resume(&self, core: CoreIndex, entry_point: EntryPoint) {
        exception_free(|token| {
            let mut contexts = self.core_contexts(token, core);
            let context = contexts.context_mut(core, World::NonSecure);
            context.el3_state.elr_el3 = entry_point.entry_point_address() as usize;
            context.gpregs.registers[0] = entry_point.context_id();
            context.gpregs.registers[1..8].fill(0);
            contexts.active = None;
        });
    }
}

impl Default for ContextStore {
    fn default() -> Self {
        Self::new()
    }
}

/// Initialises parts of the given CPU context that are the same for all worlds.
fn initialise_common(context: &mut CpuContext, entry_point: &EntryPointInfo) {
    context.el3_state.elr_el3 = entry_point.pc;
    context.el3_state.spsr_el3 = entry_point.spsr;
    context.gpregs.registers[..entry_point.args.len()].copy_from_slice(&entry_point.args);

    // All SCR_EL3 fields are UNKNOWN on reset, so set every one of them. WFI and WFE are not
    // trapped, SMC is enabled, instruction fetches from non-secure memory are disabled in secure
    // state and external aborts are routed to EL3.
    context.el3_state.scr_el3 = ScrEl3::RES1 | ScrEl3::HCE | ScrEl3::EA | ScrEl3::SIF | ScrEl3::RW;
    #[cfg(feature = "sel2")]
    {
        context.el3_state.scr_el3 |= ScrEl3::EEL2;
    }
    #[cfg(not(feature = "sel2"))]
    {
        context.el1_sysregs.sctlr_el1 = SCTLR_EL1_RES1;
    }
}

/// Initialises the given CPU context ready for booting NS-EL2 or NS-EL1.
fn initialise_nonsecure(context: &mut CpuContext, entry_point: &EntryPointInfo) {
    initialise_common(context, entry_point);
    context.el3_state.scr_el3 |= ScrEl3::NS;
    select_non_secure_el(&mut context.el3_state);
}

/// Initialises the given CPU context ready for booting S-EL2 or S-EL1.
fn initialise_secure(context: &mut CpuContext, entry_point: &EntryPointInfo) {
    initialise_common(context, entry_point);

    // Let S-EL1 access the secure physical timer, rather than only EL3.
    context.el3_state.scr_el3 |= ScrEl3::ST;
    // Stop the cycle counter while event counting is prohibited in secure state.
    context.el3_state.pmcr_el0 = PmcrEl0::DP.bits();
}

/// Initialises the given CPU context ready for booting Realm world.
#[cfg(feature = "rme")]
fn initialise_realm(context: &mut CpuContext, entry_point: &EntryPointInfo) {
    initialise_common(context, entry_point);
    // NS and NSE together select the Realm security state.
    context.el3_state.scr_el3 |= ScrEl3::NS | ScrEl3::NSE;
}

/// Chooses the exception level to enter the normal world at.
///
/// EL2 is used if the hardware implements it and hypervisor calls are enabled, otherwise the entry
/// is moved down to EL1 and HVC is disabled.
fn select_non_secure_el(el3_state: &mut El3State) {
    let el2_usable = is_el2_implemented() && el3_state.scr_el3.contains(ScrEl3::HCE);
    if el3_state.spsr_el3.exception_level() == ExceptionLevel::El2 && !el2_usable {
        el3_state.spsr_el3 = spsr_with_el1_mode(el3_state.spsr_el3);
    }
    if !is_el2_implemented() {
        el3_state.scr_el3.remove(ScrEl3::HCE);
    }
}

/// Information about the entry point for a next stage (e.g. BL32 or BL33).
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct EntryPointInfo {
    /// The entry point address.
    pub pc: usize,
    /// The `spsr_el3` value to set before `eret`, to set the appropriate PSTATE.
    pub spsr: SpsrEl3,
    /// Boot arguments to pass in `x0`-`x7`.
    pub args: [u64; 8],
}
