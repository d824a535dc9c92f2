// Copyright The Rusted Firmware-A Contributors.
//
// SPDX-License-Identifier: BSD-3-Clause

//! Collection of structures for describing the power domain tree.
//!
//! The shape of the tree (parents and descendant CPU ranges) is fixed when the tree is built, and
//! is read without locking. Only the power state of each node sits behind its own spin lock.

use super::{
    PlatformPowerState, PlatformPowerStateInterface as _, PsciCompositePowerState,
    PsciPlatformImpl, PsciPlatformInterface as _,
};
use crate::{
    context::CoreIndex,
    platform::{Platform, PlatformImpl},
    sysregs::MPIDR_AFFINITY_MASK,
};
use arm_psci::{AffinityInfo, EntryPoint};
use arm_sysregs::MpidrEl1;
use arrayvec::ArrayVec;
use core::{
    fmt::{self, Debug, Formatter},
    ops::{Deref, DerefMut, Range},
    slice::{Iter, IterMut},
};
use spin::mutex::{SpinMutex, SpinMutexGuard};

/// The mutable part of a non-CPU power domain node.
#[derive(Clone, Debug)]
pub struct NonCpuNodeState {
    /// Local power state of the node
    local_state: PlatformPowerState,
    /// Requested Nth level power state (where N is whichever level in the power tree this
    /// NonCpuPowerNode happens to be in) of descendant CPU nodes
    requested_states: ArrayVec<PlatformPowerState, { PowerDomainTree::CPU_DOMAIN_COUNT }>,
    // OPTIMIZE: The worst case memory usage of requested_states on all NonCpuPowerNode happens
    // when the power domain tree is a complete binary tree. In this case the memory usage is
    // n^2 + n where n is CPU_DOMAIN_COUNT. The optimal case would be n * log2(n) if using Vec of
    // required capacity for each node.
}

/// Represents a non-CPU power domain node in the power domain tree.
#[derive(Debug)]
pub struct NonCpuPowerNode {
    /// Parent node index or None if it is the top level node
    parent: Option<usize>,
    /// Range of descendant CPU indices
    cpu_range: Range<usize>,
    state: SpinMutex<NonCpuNodeState>,
}

impl NonCpuPowerNode {
    /// Create new non-CPU power node and assign its parent node index.
    pub fn new(parent: Option<usize>) -> Self {
        Self {
            parent,
            cpu_range: 0..0,
            state: SpinMutex::new(NonCpuNodeState {
                local_state: PlatformPowerState::OFF,
                requested_states: ArrayVec::new(),
            }),
        }
    }

    /// Assign descendant CPU node index incrementally.
    fn assign_cpu(&mut self, cpu_index: usize) {
        if self.cpu_range.is_empty() {
            self.cpu_range = cpu_index..cpu_index + 1;
        } else {
            debug_assert_eq!(self.cpu_range.end, cpu_index);
            self.cpu_range.end += 1;
        }

        self.state
            .get_mut()
            .requested_states
            .push(PlatformPowerState::OFF);
    }

    /// Returns the index of the parent node, or `None` for the root.
    pub fn parent(&self) -> Option<usize> {
        self.parent
    }

    /// Returns the range of linear indices of the descendant CPUs.
    pub fn cpu_range(&self) -> Range<usize> {
        self.cpu_range.clone()
    }

    /// Locks the power state of the node.
    pub fn lock(&self) -> LockedNonCpuNode<'_> {
        LockedNonCpuNode {
            node: self,
            state: self.state.lock(),
        }
    }
}

/// A non-CPU power domain node whose power state is locked by the current core.
pub struct LockedNonCpuNode<'a> {
    node: &'a NonCpuPowerNode,
    state: SpinMutexGuard<'a, NonCpuNodeState>,
}

impl LockedNonCpuNode<'_> {
    /// Returns the index of the parent node, or `None` for the root.
    pub fn parent(&self) -> Option<usize> {
        self.node.parent
    }

    fn local_cpu_index(&self, core: CoreIndex) -> usize {
        assert!(
            self.node.cpu_range.contains(&core.get()),
            "Core {core} is not a descendant of power domain with cores {:?}",
            self.node.cpu_range
        );
        core.get() - self.node.cpu_range.start
    }

    /// Store the requested power state of a descendant CPU node.
    pub fn set_requested_power_state(&mut self, core: CoreIndex, state: PlatformPowerState) {
        let local_cpu_index = self.local_cpu_index(core);
        self.state.requested_states[local_cpu_index] = state;
    }

    /// Returns the power state requested by a descendant CPU node.
    pub fn requested_power_state(&self, core: CoreIndex) -> PlatformPowerState {
        self.state.requested_states[self.local_cpu_index(core)]
    }

    /// Checks if all the cores are non-running state except the one identified by `core`.
    pub fn is_last_cpu_to_idle(&self, core: CoreIndex) -> bool {
        let local_cpu_index = self.local_cpu_index(core);
        self.state
            .requested_states
            .iter()
            .enumerate()
            .filter(|&(i, state)| {
                if i == local_cpu_index {
                    assert_eq!(*state, PlatformPowerState::RUN);
                    false
                } else {
                    true
                }
            })
            .all(|(_index, state)| *state != PlatformPowerState::RUN)
    }

    /// Returns the minimum value in requested_states except for the element of `core`.
    /// If this node only has a single descendant core, this returns OFF.
    pub fn get_minimal_allowed_state_without_core(&self, core: CoreIndex) -> PlatformPowerState {
        let local_cpu_index = self.local_cpu_index(core);
        self.state
            .requested_states
            .iter()
            .enumerate()
            .filter(|&(i, _)| i != local_cpu_index)
            .fold(PlatformPowerState::OFF, |acc, (_, &state)| acc.min(state))
    }

    /// Set the local power state of the node to the lowest possible level while still meeting the
    /// power requirements of its descendant CPU nodes. This means the node cannot enter a deeper
    /// power state than the shallowest power state requested by any of its descendant CPUs.
    /// Smaller power state values represent shallower power states, therefore, it should be set to
    /// the minimal requested power state.
    pub fn set_minimal_allowed_state(&mut self) {
        self.state.local_state = self
            .state
            .requested_states
            .iter()
            .fold(PlatformPowerState::OFF, |acc, &state| acc.min(state));
    }

    /// Get local power state of the node.
    pub fn local_state(&self) -> PlatformPowerState {
        self.state.local_state
    }

    /// Set local power state of the node.
    pub fn set_local_state(&mut self, local_state: PlatformPowerState) {
        self.state.local_state = local_state;
    }
}

impl Debug for LockedNonCpuNode<'_> {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        f.debug_struct("LockedNonCpuNode")
            .field("parent", &self.node.parent)
            .field("cpu_range", &self.node.cpu_range)
            .field("state", &*self.state)
            .finish()
    }
}

/// The mutable part of a CPU power domain node.
#[derive(Clone, Debug, PartialEq)]
pub struct CpuNodeState {
    /// Current affinity info of the CPU
    affinity_info: AffinityInfo,
    /// Local power state of the CPU node
    local_state: PlatformPowerState,
    /// Non-secure entry point of the CPU on waking up
    entry_point: Option<EntryPoint>,
    /// Highest power level affected by the suspend request in progress, if any
    highest_affected_level: Option<usize>,
}

impl CpuNodeState {
    const INITIAL: Self = Self {
        affinity_info: AffinityInfo::Off,
        local_state: PlatformPowerState::OFF,
        entry_point: None,
        highest_affected_level: None,
    };

    /// Get affinity info of the CPU.
    pub fn affinity_info(&self) -> AffinityInfo {
        self.affinity_info
    }

    /// Set affinity info of the CPU.
    pub fn set_affinity_info(&mut self, affinity_info: AffinityInfo) {
        self.affinity_info = affinity_info;
    }

    /// Get local state of the CPU.
    pub fn local_state(&self) -> PlatformPowerState {
        self.local_state
    }

    /// Set local state of the CPU.
    pub fn set_local_state(&mut self, local_state: PlatformPowerState) {
        self.local_state = local_state;
    }

    /// Store non-secure entry point of the CPU.
    pub fn set_entry_point(&mut self, entry_point: EntryPoint) {
        assert_eq!(self.entry_point, None);
        self.entry_point = Some(entry_point);
    }

    /// Get and clear stored non-secure entry point of the CPU.
    pub fn pop_entry_point(&mut self) -> Option<EntryPoint> {
        self.entry_point.take()
    }

    /// Returns the highest power level the pending suspend request affects.
    pub fn highest_affected_level(&self) -> Option<usize> {
        self.highest_affected_level
    }

    pub fn set_highest_affected_level(&mut self, level: usize) {
        self.highest_affected_level = Some(level);
    }

    pub fn clear_highest_affected_level(&mut self) {
        self.highest_affected_level = None;
    }
}

/// Represents a CPU power domain node in the power domain tree.
#[derive(Debug)]
pub struct CpuPowerNode {
    /// Parent non-CPU power node index
    parent: usize,
    state: SpinMutex<CpuNodeState>,
}

impl CpuPowerNode {
    pub fn new(parent: usize) -> Self {
        Self {
            parent,
            state: SpinMutex::new(CpuNodeState::INITIAL),
        }
    }

    /// Returns the index of the parent non-CPU node.
    pub fn parent(&self) -> usize {
        self.parent
    }
}

/// A CPU power domain node whose state is locked by the current core.
///
/// Dereferences to the [`CpuNodeState`] of the node.
#[derive(Debug)]
pub struct LockedCpuNode<'a> {
    index: CoreIndex,
    parent: usize,
    state: SpinMutexGuard<'a, CpuNodeState>,
}

impl LockedCpuNode<'_> {
    /// Returns the linear index of the CPU.
    pub fn index(&self) -> CoreIndex {
        self.index
    }
}

impl Deref for LockedCpuNode<'_> {
    type Target = CpuNodeState;

    fn deref(&self) -> &Self::Target {
        &self.state
    }
}

impl DerefMut for LockedCpuNode<'_> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.state
    }
}

/// Object for locking multiple non-CPU power nodes. In order to avoid deadlocks and race
/// conditions the non-CPU power nodes are always locked from the lower level to higher.
#[derive(Debug)]
pub struct AncestorPowerDomains<'a> {
    list: ArrayVec<LockedNonCpuNode<'a>, { PsciPlatformImpl::MAX_POWER_LEVEL }>,
}

impl<'a> AncestorPowerDomains<'a> {
    /// Lock the selected node and its ancestors up to `max_level`.
    pub fn new_with_max_level(index: usize, max_level: usize, nodes: &'a [NonCpuPowerNode]) -> Self {
        let mut list = ArrayVec::new();
        let mut parent = Some(index);
        let mut level = PsciCompositePowerState::CPU_POWER_LEVEL + 1;

        while let Some(index) = parent {
            assert!(level <= PsciPlatformImpl::MAX_POWER_LEVEL);
            if level > max_level {
                break;
            }

            let locked = nodes[index].lock();
            parent = locked.parent();
            list.push(locked);
            level += 1;
        }

        Self { list }
    }

    /// Create immutable iterator starting from the lowest level.
    pub fn iter(&self) -> Iter<'_, LockedNonCpuNode<'a>> {
        self.list.iter()
    }

    /// Create mutable iterator starting from the lowest level.
    pub fn iter_mut(&mut self) -> IterMut<'_, LockedNonCpuNode<'a>> {
        self.list.iter_mut()
    }

    /// Verifies that all other cores at `end_power_level` have been idled and that `core` is the
    /// last running CPU at `end_power_level`.
    pub fn is_last_cpu_to_idle_at_power_level(
        &self,
        core: CoreIndex,
        end_power_level: usize,
    ) -> bool {
        if end_power_level == PsciCompositePowerState::CPU_POWER_LEVEL {
            return true;
        }

        self.list[end_power_level - 1].is_last_cpu_to_idle(core)
    }

    /// Sets every locked level to run on behalf of `core`, from the root down.
    pub fn set_run(&mut self, core: CoreIndex) {
        for node in self.list.iter_mut().rev() {
            node.set_requested_power_state(core, PlatformPowerState::RUN);
            node.set_local_state(PlatformPowerState::RUN);
        }
    }
}

impl Drop for AncestorPowerDomains<'_> {
    fn drop(&mut self) {
        // Unlock from the root down, the reverse of the locking order.
        while let Some(guard) = self.list.pop() {
            drop(guard);
        }
    }
}

/// The power state a coordination may change, captured before the change so that it can be put
/// back if the platform fails to carry it out.
#[derive(Clone, Debug)]
pub struct PowerStateSnapshot {
    cpu: CpuNodeState,
    /// The requested and local state of each locked ancestor, lowest level first.
    ancestors: ArrayVec<(PlatformPowerState, PlatformPowerState), { PsciPlatformImpl::MAX_POWER_LEVEL }>,
}

impl PowerStateSnapshot {
    /// Captures the state of the locked CPU and its locked ancestors.
    pub fn take(cpu: &LockedCpuNode, ancestors: &AncestorPowerDomains) -> Self {
        Self {
            cpu: (*cpu.state).clone(),
            ancestors: ancestors
                .iter()
                .map(|node| (node.requested_power_state(cpu.index), node.local_state()))
                .collect(),
        }
    }

    /// Puts back the captured state. The same nodes must still be locked.
    pub fn restore(self, cpu: &mut LockedCpuNode, ancestors: &mut AncestorPowerDomains) {
        assert_eq!(self.ancestors.len(), ancestors.list.len());

        let core = cpu.index;
        *cpu.state = self.cpu;
        for (node, (requested, local)) in ancestors.iter_mut().zip(self.ancestors) {
            node.set_requested_power_state(core, requested);
            node.set_local_state(local);
        }
    }
}

/// The PowerDomainTree is responsible for storing the non-CPU and CPU power nodes and providing
/// safe ways to access for them.
pub struct PowerDomainTree {
    non_cpu_power_nodes: ArrayVec<NonCpuPowerNode, { Self::NON_CPU_DOMAIN_COUNT }>,
    cpu_power_nodes: ArrayVec<CpuPowerNode, { Self::CPU_DOMAIN_COUNT }>,
}

impl PowerDomainTree {
    const CPU_DOMAIN_COUNT: usize = PlatformImpl::CORE_COUNT;
    const NON_CPU_DOMAIN_COUNT: usize =
        PsciPlatformImpl::POWER_DOMAIN_COUNT - Self::CPU_DOMAIN_COUNT;

    /// Create power domain tree based on the BFS format topology description.
    ///
    /// `topology[0]` is the number of root nodes (always 1), followed by the number of children of
    /// each non-CPU node in BFS order. The entries for the lowest non-CPU level are CPU counts.
    pub fn new(topology: &[usize]) -> Self {
        // Initialize non-CPU power nodes.
        let mut non_cpu_power_nodes: ArrayVec<NonCpuPowerNode, { Self::NON_CPU_DOMAIN_COUNT }> =
            ArrayVec::new();
        let mut node_index = 0..Self::NON_CPU_DOMAIN_COUNT;
        let mut node_count: usize = 1;
        let mut parent_node_index: usize = 0;
        let mut parent_node = None;

        for _ in
            (PsciCompositePowerState::CPU_POWER_LEVEL + 1..=PsciPlatformImpl::MAX_POWER_LEVEL).rev()
        {
            let mut next_level_node_count = 0;

            for _ in 0..node_count {
                let child_count = topology[parent_node_index];

                for _ in (&mut node_index).take(child_count) {
                    non_cpu_power_nodes.push(NonCpuPowerNode::new(parent_node));
                }

                parent_node = Some(parent_node_index);
                next_level_node_count += child_count;
                parent_node_index += 1;
            }

            node_count = next_level_node_count;
        }

        assert!(
            node_index.is_empty(),
            "Topology describes fewer than {} non-CPU power domains",
            Self::NON_CPU_DOMAIN_COUNT
        );

        // Initialize CPU power nodes.
        let mut cpu_power_nodes = ArrayVec::new();
        let mut node_index = 0..Self::CPU_DOMAIN_COUNT;
        for num_children in &topology[parent_node_index..] {
            for cpu_index in (&mut node_index).take(*num_children) {
                cpu_power_nodes.push(CpuPowerNode::new(parent_node_index - 1));
                Self::assign_cpu(&mut non_cpu_power_nodes, parent_node_index - 1, cpu_index);
            }

            parent_node_index += 1;
        }

        assert!(
            node_index.is_empty(),
            "Topology describes fewer than {} CPUs",
            Self::CPU_DOMAIN_COUNT
        );

        PowerDomainTree {
            non_cpu_power_nodes,
            cpu_power_nodes,
        }
    }

    /// Assigns the CPU to the CPU index range of each of its ancestors. This can be only done when
    /// the BFS traversal reaches the CPU level.
    fn assign_cpu(non_cpu_power_nodes: &mut [NonCpuPowerNode], parent_index: usize, cpu_index: usize) {
        let mut next = Some(parent_index);
        while let Some(index) = next {
            let node = &mut non_cpu_power_nodes[index];
            node.assign_cpu(cpu_index);
            next = node.parent;
        }
    }

    /// Returns the indices of the non-CPU power domains containing `core`, from its cluster up to
    /// the root.
    pub fn ancestors_of(
        &self,
        core: CoreIndex,
    ) -> ArrayVec<usize, { PsciPlatformImpl::MAX_POWER_LEVEL }> {
        let mut ancestors = ArrayVec::new();
        let mut next = Some(self.cpu_power_nodes[core.get()].parent);
        while let Some(index) = next {
            ancestors.push(index);
            next = self.non_cpu_power_nodes[index].parent;
        }
        ancestors
    }

    /// Returns the non-CPU power domain node with the given index.
    pub fn non_cpu_node(&self, index: usize) -> &NonCpuPowerNode {
        &self.non_cpu_power_nodes[index]
    }

    /// Check if a given CPU is the last CPU in the system with is powered on.
    pub fn is_last_cpu(&self, core: CoreIndex) -> bool {
        self.cpu_power_nodes.iter().enumerate().all(|(index, cpu)| {
            let locked_cpu = cpu.state.lock();
            if index == core.get() {
                assert_eq!(locked_cpu.affinity_info(), AffinityInfo::On);
                true
            } else {
                locked_cpu.affinity_info() == AffinityInfo::Off
            }
        })
    }

    /// Return a lock-guarded CPU node by its index.
    pub fn locked_cpu_node(&self, core: CoreIndex) -> LockedCpuNode<'_> {
        let node = &self.cpu_power_nodes[core.get()];
        LockedCpuNode {
            index: core,
            parent: node.parent,
            state: node.state.lock(),
        }
    }

    /// Locks all ancestor nodes of a CPU, runs the closure and unlocks the nodes.
    /// This function ensures that power coordination is only possible with the proper locks
    /// acquired and it avoids deadlocks by always locking the nodes from the lowest level to the
    /// highest.
    pub fn with_ancestors_locked<'a, F, T>(&'a self, cpu: &mut LockedCpuNode<'a>, f: F) -> T
    where
        F: FnOnce(&mut LockedCpuNode<'a>, AncestorPowerDomains<'a>) -> T,
    {
        self.with_ancestors_locked_to_max_level(cpu, PsciPlatformImpl::MAX_POWER_LEVEL, f)
    }

    /// Locks all ancestor nodes of a CPU up to `max_level`, runs the closure and unlocks the
    /// nodes.
    pub fn with_ancestors_locked_to_max_level<'a, F, T>(
        &'a self,
        cpu: &mut LockedCpuNode<'a>,
        max_level: usize,
        f: F,
    ) -> T
    where
        F: FnOnce(&mut LockedCpuNode<'a>, AncestorPowerDomains<'a>) -> T,
    {
        let lock_list = AncestorPowerDomains::new_with_max_level(
            cpu.parent,
            max_level,
            &self.non_cpu_power_nodes,
        );
        f(cpu, lock_list)
    }

    /// Checks if all of the CPUs are on.
    pub fn are_all_cpus_on(&self) -> bool {
        self.cpu_power_nodes
            .iter()
            .all(|core| core.state.lock().affinity_info() == AffinityInfo::On)
    }
}

impl Debug for PowerDomainTree {
    /// Outputs the tree in Graphviz DOT format.
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        writeln!(f, "digraph {{")?;
        for (index, ncpu) in self.non_cpu_power_nodes.iter().enumerate() {
            if let Some(nc) = ncpu.state.try_lock() {
                writeln!(f, "NC{index} [label=\"{:?} {nc:#?}\"]", ncpu.cpu_range)?;
            } else {
                writeln!(f, "NC{index} [label=\"NonCpuPowerNode is locked\"]")?;
            }
            if let Some(parent) = ncpu.parent {
                writeln!(f, "NC{parent} -> NC{index}")?;
            }
        }

        for (index, cpu) in self.cpu_power_nodes.iter().enumerate() {
            if let Some(c) = cpu.state.try_lock() {
                writeln!(f, "C{index} [label=\"{c:#?}\"]")?;
            } else {
                writeln!(f, "C{index} [label=\"CpuPowerNode is locked\"]")?;
            }
            writeln!(f, "NC{} -> C{}", cpu.parent, index)?;
        }

        writeln!(f, "}}")?;

        Ok(())
    }
}

/// Returns the linear index of the core with the given PSCI MPIDR value.
///
/// This is total over the cores present on the platform, and returns distinct indices for distinct
/// cores. Values with bits set outside the affinity fields, and affinities the platform doesn't
/// have, give `None`.
pub fn core_to_linear_index(psci_mpidr: u64) -> Option<CoreIndex> {
    if psci_mpidr & !MPIDR_AFFINITY_MASK != 0 {
        return None;
    }

    // The PSCI MPIDR value doesn't include the MT or U bits, but they might be important for how
    // the platform validates MPIDR values and calculates core position, so add them in.
    let mpidr = MpidrEl1::from_psci_mpidr(psci_mpidr);
    if PlatformImpl::mpidr_is_valid(mpidr) {
        CoreIndex::new(PlatformImpl::core_position(mpidr.bits()))
    } else {
        None
    }
}
