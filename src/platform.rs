// Copyright The Rusted Firmware-A Contributors.
//
// SPDX-License-Identifier: BSD-3-Clause

macro_rules! select_platform {
    (platform = $condition:literal, $mod:ident::$plat_impl:ident) => {
        #[cfg(all(platform = $condition, not(test)))]
        mod $mod;

        #[cfg(all(platform = $condition, not(test)))]
        pub use $mod::$plat_impl as PlatformImpl;
    };
    (default, $mod:ident::$plat_impl:ident) => {
        #[cfg(not(any(test, platform = "fvp")))]
        mod $mod;

        #[cfg(not(any(test, platform = "fvp")))]
        pub use $mod::$plat_impl as PlatformImpl;
    };
    (test, $mod:ident::$plat_impl:ident) => {
        #[cfg(test)]
        mod $mod;

        #[cfg(test)]
        pub use $mod::$plat_impl as PlatformImpl;
    };
}

select_platform!(platform = "fvp", fvp::Fvp);
select_platform!(default, qemu::Qemu);
select_platform!(test, test::TestPlatform);

#[cfg(test)]
pub use test::{
    FakeSysregsGuard, TestHookCall, TestPlatform, TestPsciPlatformImpl, TestSecureWorld,
    lock_fake_sysregs,
};

use crate::{
    context::EntryPointInfo,
    logger::LogSink,
    mmio::MmioError,
    services::psci::{PsciPlatformInterface, SecureWorldPm},
};
use arm_sysregs::MpidrEl1;
use core::fmt::{self, Display, Formatter};
#[cfg(all(target_arch = "aarch64", not(test)))]
pub use percore::exception_free;
#[cfg(not(any(target_arch = "aarch64", test)))]
use percore::ExceptionFree;
#[cfg(test)]
pub use test::exception_free;

/// Type alias for convenience, to avoid having to use the complicated type name everywhere.
pub type LogSinkImpl = <PlatformImpl as Platform>::LogSinkImpl;

pub type PsciPlatformImpl = <PlatformImpl as Platform>::PsciPlatformImpl;
pub type PlatformPowerState = <PsciPlatformImpl as PsciPlatformInterface>::PlatformPowerState;

/// A failure of a platform hook to complete a hardware handshake.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum PlatformError {
    /// The hardware didn't acknowledge the request in time.
    Timeout,
    /// A device register couldn't be accessed.
    Mmio(MmioError),
    /// The hardware reported that it couldn't carry out the request.
    Rejected { status: u32 },
}

impl From<MmioError> for PlatformError {
    fn from(error: MmioError) -> Self {
        match error {
            MmioError::Timeout => Self::Timeout,
            error => Self::Mmio(error),
        }
    }
}

impl Display for PlatformError {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        match self {
            Self::Timeout => write!(f, "hardware handshake timed out"),
            Self::Mmio(error) => write!(f, "{error}"),
            Self::Rejected { status } => {
                write!(f, "hardware rejected the request with status {status:#x}")
            }
        }
    }
}

/// The hooks implemented by all platforms.
///
/// # Safety
///
/// `core_position` must never return the same index for two different valid MPIDR values, and
/// must never return a value greater than or equal to `CORE_COUNT` for a valid MPIDR value. The
/// per-core storage relies on this to give each core exclusive access to its own entries.
pub unsafe trait Platform {
    /// The number of CPU cores.
    const CORE_COUNT: usize;

    /// Platform dependent LogSink implementation type for Logger.
    type LogSinkImpl: LogSink;

    /// Platform dependent PsciPlatformInterface implementation type.
    type PsciPlatformImpl: PsciPlatformInterface;

    /// Initialises the logger and anything else the platform needs, on the primary core during
    /// cold boot. The arguments are those passed by the previous boot stage.
    ///
    /// Any logs sent before this is called will be ignored.
    fn init(arg0: u64, arg1: u64, arg2: u64, arg3: u64);

    /// Returns the entry point for the secure world, i.e. BL32.
    fn secure_entry_point() -> EntryPointInfo;

    /// Returns the entry point for the non-secure world, i.e. BL33.
    fn non_secure_entry_point() -> EntryPointInfo;

    /// Returns the entry point for the realm world.
    #[cfg(feature = "rme")]
    fn realm_entry_point() -> EntryPointInfo;

    /// Returns whether the given MPIDR is valid for this platform.
    fn mpidr_is_valid(mpidr: MpidrEl1) -> bool;

    /// Given a valid MPIDR value, returns the corresponding linear core index.
    ///
    /// For an invalid MPIDR value no guarantees are made about the return value.
    fn core_position(mpidr: u64) -> usize;

    /// Returns the hooks through which the secure world payload is told about power state changes
    /// of the cores it runs on.
    fn secure_world_pm() -> &'static dyn SecureWorldPm;

    /// Returns an option with a PSCI platform implementation handle. The function should only be
    /// called once, when it returns `Some`. All subsequent calls must return `None`.
    fn psci_platform() -> Option<Self::PsciPlatformImpl>;
}

/// Runs the given function with a token proving that exceptions are masked.
///
/// Host builds have no exception handlers of their own which could interrupt `f`.
#[cfg(not(any(target_arch = "aarch64", test)))]
pub fn exception_free<T>(f: impl FnOnce(ExceptionFree<'_>) -> T) -> T {
    // SAFETY: Nothing on the host runs EL3 exception handlers, so nothing can preempt `f` and
    // access the same per-core state.
    let token = unsafe { ExceptionFree::new() };
    f(token)
}
