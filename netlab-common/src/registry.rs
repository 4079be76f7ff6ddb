//! Process-wide counters and once-only checks, owned by whoever builds the topology.

use std::sync::atomic::{AtomicU32, Ordering};

use tokio::sync::OnceCell;

/// First spanning-tree priority handed out to bridges without an explicit one.
pub const STP_PRIORITY_BASE: u32 = 100;

/// First `ipfw nat` instance number handed out to NAT nodes without an explicit one.
pub const NAT_ID_BASE: u32 = 100;

/// First `ipfw` rule number used by NAT nodes, and the gap between consecutive ones.
pub const NAT_RULE_STEP: u32 = 10;

/// Shared state that would otherwise be class-level globals.
///
/// A single registry is created before any node and shared (usually behind an `Arc`) with every
/// constructor that allocates identifiers or runs a host-wide check. Counters only ever grow, and
/// each once-cell is initialized at most once; a failed initialization leaves the cell empty so
/// the next caller retries the check.
#[derive(Debug)]
pub struct Registry {
    next_stp_priority: AtomicU32,
    next_switch_unit: AtomicU32,
    next_pair_unit: AtomicU32,
    next_rdomain: AtomicU32,
    next_nat_id: AtomicU32,
    next_nat_rule: AtomicU32,
    ipfw_loaded: OnceCell<()>,
    cgroups_mounted: OnceCell<()>,
    rt_group_sched: OnceCell<()>,
}

impl Default for Registry {
    fn default() -> Self {
        Self {
            next_stp_priority: AtomicU32::new(STP_PRIORITY_BASE),
            next_switch_unit: AtomicU32::new(0),
            next_pair_unit: AtomicU32::new(0),
            next_rdomain: AtomicU32::new(1),
            next_nat_id: AtomicU32::new(NAT_ID_BASE),
            next_nat_rule: AtomicU32::new(NAT_RULE_STEP),
            ipfw_loaded: OnceCell::new(),
            cgroups_mounted: OnceCell::new(),
            rt_group_sched: OnceCell::new(),
        }
    }
}

impl Registry {
    /// An empty registry with every counter at its base.
    pub fn new() -> Self {
        Self::default()
    }

    /// Next default bridge priority for spanning tree. Strictly increasing.
    pub fn allocate_stp_priority(&self) -> u32 {
        self.next_stp_priority.fetch_add(1, Ordering::Relaxed)
    }

    /// Next unit number for an OpenBSD `switch(4)` device, e.g. the `0` of `switch0`.
    pub fn allocate_switch_unit(&self) -> u32 {
        self.next_switch_unit.fetch_add(1, Ordering::Relaxed)
    }

    /// Allocates two consecutive `pair(4)` unit numbers and returns the first.
    pub fn allocate_pair_units(&self) -> u32 {
        self.next_pair_unit.fetch_add(2, Ordering::Relaxed)
    }

    /// Next OpenBSD routing domain. Domain 0 is the host's own.
    pub fn allocate_rdomain(&self) -> u32 {
        self.next_rdomain.fetch_add(1, Ordering::Relaxed)
    }

    /// Next `ipfw nat` instance number.
    pub fn allocate_nat_id(&self) -> u32 {
        self.next_nat_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Next `ipfw` rule number for a NAT node, [`NAT_RULE_STEP`] apart from the previous one.
    pub fn allocate_nat_rule(&self) -> u32 {
        self.next_nat_rule.fetch_add(NAT_RULE_STEP, Ordering::Relaxed)
    }

    /// Set once the ipfw and ipfw_nat kernel modules have been loaded and configured.
    pub fn ipfw_loaded(&self) -> &OnceCell<()> {
        &self.ipfw_loaded
    }

    /// Set once the cgroup hierarchy has been verified (and the cpuset controller mounted).
    pub fn cgroups_mounted(&self) -> &OnceCell<()> {
        &self.cgroups_mounted
    }

    /// Set once the kernel has been verified to support realtime group scheduling.
    pub fn rt_group_sched(&self) -> &OnceCell<()> {
        &self.rt_group_sched
    }
}
