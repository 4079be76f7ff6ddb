//! Host kernel limits that are too small for large emulated networks.
//!
//! Every node is at least one process with a handful of open files, and every link adds entries
//! to the host's neighbour and route tables. [`fix_limits`] raises the resource limits of the
//! current process and the host-wide sysctls below, but never lowers a value that is already
//! larger than what is needed.
//!
//! ```no_run
//! netlab_node::sysctl::fix_limits();
//!
//! let max = netlab_node::sysctl::read(netlab_node::sysctl::Limit::FileMax)?;
//! # Ok::<(), std::io::Error>(())
//! ```

use std::io;

use nix::sys::resource::{getrlimit, setrlimit, Resource};

/// Minimum number of processes for the current user.
pub const NPROC_LIMIT: u64 = 8192;
/// Minimum number of open files for the current process.
pub const NOFILE_LIMIT: u64 = 16384;

/// Host-wide sysctl parameters raised by [`fix_limits`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Limit {
    /// Maximum number of open files on the system.
    FileMax,
    /// Maximum socket send buffer (bytes).
    WmemMax,
    /// Maximum socket receive buffer (bytes).
    RmemMax,
    /// TCP receive buffer sizes: "min default max".
    TcpRmem,
    /// TCP send buffer sizes: "min default max".
    TcpWmem,
    /// Packets queued on the input side when an interface receives faster than the kernel can
    /// process.
    NetdevMaxBacklog,
    /// Neighbour table garbage collection thresholds.
    GcThresh1,
    GcThresh2,
    GcThresh3,
    /// Maximum number of IPv4 routes.
    RouteMaxSize,
    /// Maximum number of pseudo terminals.
    PtyMax,
}

impl Limit {
    /// Every limit, in the order they are raised.
    pub const ALL: [Self; 11] = [
        Self::FileMax,
        Self::WmemMax,
        Self::RmemMax,
        Self::TcpRmem,
        Self::TcpWmem,
        Self::NetdevMaxBacklog,
        Self::GcThresh1,
        Self::GcThresh2,
        Self::GcThresh3,
        Self::RouteMaxSize,
        Self::PtyMax,
    ];

    /// Location of the setting under `/proc/sys`.
    pub fn path(&self) -> &'static str {
        match self {
            Self::FileMax => "/proc/sys/fs/file-max",
            Self::WmemMax => "/proc/sys/net/core/wmem_max",
            Self::RmemMax => "/proc/sys/net/core/rmem_max",
            Self::TcpRmem => "/proc/sys/net/ipv4/tcp_rmem",
            Self::TcpWmem => "/proc/sys/net/ipv4/tcp_wmem",
            Self::NetdevMaxBacklog => "/proc/sys/net/core/netdev_max_backlog",
            Self::GcThresh1 => "/proc/sys/net/ipv4/neigh/default/gc_thresh1",
            Self::GcThresh2 => "/proc/sys/net/ipv4/neigh/default/gc_thresh2",
            Self::GcThresh3 => "/proc/sys/net/ipv4/neigh/default/gc_thresh3",
            Self::RouteMaxSize => "/proc/sys/net/ipv4/route/max_size",
            Self::PtyMax => "/proc/sys/kernel/pty/max",
        }
    }

    /// The value the host needs at least.
    pub fn wanted(&self) -> &'static str {
        match self {
            Self::FileMax => "10000",
            Self::WmemMax | Self::RmemMax => "16777216",
            Self::TcpRmem => "10240 87380 16777216",
            Self::TcpWmem => "10240 87380 16777216",
            Self::NetdevMaxBacklog => "5000",
            Self::GcThresh1 => "4096",
            Self::GcThresh2 => "8192",
            Self::GcThresh3 => "16384",
            Self::RouteMaxSize => "32768",
            Self::PtyMax => "20000",
        }
    }
}

/// Current value of `limit`.
pub fn read(limit: Limit) -> io::Result<String> {
    std::fs::read_to_string(limit.path()).map(|s| s.trim().to_string())
}

/// Sets `limit` to `value`.
pub fn write(limit: Limit, value: &str) -> io::Result<()> {
    std::fs::write(limit.path(), value)
}

/// Whether `current` is below `wanted`. Multi-valued parameters compare their last (maximum)
/// field; unparsable values are always replaced.
pub fn needs_raise(current: &str, wanted: &str) -> bool {
    let last = |s: &str| s.split_whitespace().last().and_then(|v| v.parse::<u64>().ok());

    match (last(current), last(wanted)) {
        (Some(current), Some(wanted)) => current < wanted,
        _ => true,
    }
}

/// Raises `limit` to its wanted value if it is lower. Returns whether it was written.
pub fn raise(limit: Limit) -> io::Result<bool> {
    let current = read(limit)?;
    if !needs_raise(&current, limit.wanted()) {
        return Ok(false);
    }

    write(limit, limit.wanted())?;
    tracing::debug!(?limit, from = %current, to = limit.wanted(), "raised sysctl");

    Ok(true)
}

/// Raises the soft (and if needed hard) limit of `resource` to at least `wanted`.
pub fn raise_rlimit(resource: Resource, wanted: u64) -> nix::Result<()> {
    let wanted = wanted as nix::libc::rlim_t;
    let (soft, hard) = getrlimit(resource)?;

    if soft < wanted {
        setrlimit(resource, wanted, hard.max(wanted))?;
        tracing::debug!(?resource, wanted, "raised resource limit");
    }

    Ok(())
}

/// Raises process and host limits for large topologies. Failures are logged, not returned.
pub fn fix_limits() {
    for (resource, wanted) in [(Resource::RLIMIT_NPROC, NPROC_LIMIT), (Resource::RLIMIT_NOFILE, NOFILE_LIMIT)] {
        if let Err(e) = raise_rlimit(resource, wanted) {
            tracing::warn!(?resource, ?e, "could not raise resource limit");
        }
    }

    for limit in Limit::ALL {
        if let Err(e) = raise(limit) {
            tracing::warn!(?limit, ?e, "could not raise sysctl");
        }
    }
}
