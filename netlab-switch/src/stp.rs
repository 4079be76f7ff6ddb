//! Spanning-tree helpers shared by the bridges.

use netlab_common::Registry;

/// The explicit bridge priority, or the next one from the registry.
pub fn resolve_priority(explicit: Option<u32>, registry: &Registry) -> u32 {
    explicit.unwrap_or_else(|| registry.allocate_stp_priority())
}

/// Whether `brctl showstp` reports a forwarding port.
pub fn brctl_forwarding(showstp: &str) -> bool {
    showstp.contains("forwarding")
}

/// Whether `ovs-ofctl show` reports ports forwarding and none still learning.
pub fn ofctl_forwarding(show: &str) -> bool {
    show.contains("STP_FORWARD") && !show.contains("STP_LEARN")
}

/// Whether `ifconfig <bridge>` reports the bridge up.
pub fn ifconfig_up(output: &str) -> bool {
    output.contains("UP")
}
