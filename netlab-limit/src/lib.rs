#![cfg_attr(docsrs, feature(doc_cfg, doc_auto_cfg))]

//! CPU limits for emulated hosts.
//!
//! Two strategies implement [`CpuLimiter`]: [`CgroupLimiter`] drives Linux cgroups with CFS or
//! realtime bandwidth, [`RctlLimiter`] drives FreeBSD `rctl(8)` and `cpuset(1)` for jails. They
//! issue different numbers for the same fraction, but both grant roughly
//! `fraction × total CPU capacity`, which is what [`CpuLimiter::bandwidth`] reports.

use std::{fmt, str::FromStr, time::Duration};

use async_trait::async_trait;
use netlab_common::{Platform, Retry, RetryError};
use netlab_node::{Env, Node};

pub mod cgroup;
pub mod host;
pub mod rctl;

pub use cgroup::CgroupLimiter;
pub use host::{HostLimits, LimitedHost};
pub use rctl::RctlLimiter;

/// Default scheduling period.
pub const DEFAULT_PERIOD_US: u64 = 100_000;

/// Limits can briefly stay busy after the last process of a host exits.
pub const CLEANUP_RETRY: Retry = Retry::new(3, Duration::from_millis(100));

/// Errors from applying or removing CPU limits.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Node(#[from] netlab_node::Error),
    #[error("invalid cpu fraction {fraction} for {sched} scheduling; please set a positive fraction")]
    InvalidFraction { fraction: f64, sched: Sched },
    #[error("cannot assign {node} to core {core}; available cores: {available:?}")]
    InvalidCore { node: String, core: u32, available: Vec<u32> },
    #[error("could not remove the limits of {node}")]
    Cleanup {
        node: String,
        #[source]
        source: RetryError<String>,
    },
    #[error("unknown scheduler {0}")]
    UnknownSched(String),
    #[error("cpu limits are not supported on {0}")]
    Unsupported(Platform),
    #[error("{0}")]
    Precondition(String),
}

/// Result alias for limiter operations.
pub type Result<T> = std::result::Result<T, Error>;

/// CPU bandwidth scheme.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Sched {
    /// Realtime group scheduling. Needs `CONFIG_RT_GROUP_SCHED`.
    Rt,
    /// Completely fair scheduler bandwidth control.
    #[default]
    Cfs,
}

impl fmt::Display for Sched {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Rt => "rt",
            Self::Cfs => "cfs",
        })
    }
}

impl FromStr for Sched {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "rt" => Ok(Self::Rt),
            "cfs" => Ok(Self::Cfs),
            other => Err(Error::UnknownSched(other.to_owned())),
        }
    }
}

/// Turns an abstract CPU fraction into OS limits for one host.
///
/// Every method may be called repeatedly with the same arguments and issues the same commands
/// each time. Fractions can be set before or after cores are pinned.
#[async_trait]
pub trait CpuLimiter: Send + Sync + fmt::Debug {
    /// Limits `node` to `fraction` of the machine. A negative fraction removes the limit.
    /// Invalid fractions are rejected before any command runs.
    async fn set_cpu_fraction(
        &mut self,
        node: &mut Node,
        fraction: f64,
        sched: Option<Sched>,
    ) -> Result<()>;

    /// Pins `node` to `cores`. Unknown core ids are rejected before any command runs.
    async fn set_cores(&mut self, node: &mut Node, cores: &[u32]) -> Result<()>;

    /// Removes every limit, retrying while the OS reports the resource busy.
    async fn cleanup(&mut self) -> Result<()>;

    /// CPU capacity granted, in cores. `None` while unlimited.
    fn bandwidth(&self) -> Option<f64>;
}

/// Number of CPU cores on the host.
pub async fn num_cores(env: &Env) -> Result<u32> {
    let cmd = match env.platform {
        Platform::Linux => "grep -c processor /proc/cpuinfo",
        Platform::FreeBsd | Platform::OpenBsd => "sysctl -n hw.ncpu",
    };

    let output = env.run(cmd).await?;
    output
        .stdout
        .trim()
        .parse()
        .ok()
        .filter(|n| *n > 0)
        .ok_or_else(|| Error::Precondition(format!("could not count cpu cores: {output}")))
}
