use netlab_common::Platform;
use netlab_node::{Env, Node, NodeOptions};

use crate::{CgroupLimiter, CpuLimiter, Error, RctlLimiter, Result, Sched, DEFAULT_PERIOD_US};

/// CPU limits of a host. The default is unlimited and unpinned.
#[derive(Debug, Clone, PartialEq)]
pub struct HostLimits {
    /// Fraction of the whole machine. Negative means unlimited.
    pub cpu: Option<f64>,
    /// Cores the host is pinned to. Empty means any core.
    pub cores: Vec<u32>,
    pub sched: Sched,
    /// CFS period the quota is computed against, in microseconds.
    pub period_us: u64,
}

impl Default for HostLimits {
    fn default() -> Self {
        Self { cpu: None, cores: Vec::new(), sched: Sched::default(), period_us: DEFAULT_PERIOD_US }
    }
}

impl HostLimits {
    /// Limits the host to `fraction` of the machine.
    pub fn with_cpu(mut self, fraction: f64) -> Self {
        self.cpu = Some(fraction);
        self
    }

    /// Pins the host to `cores`.
    pub fn with_cores(mut self, cores: impl Into<Vec<u32>>) -> Self {
        self.cores = cores.into();
        self
    }

    /// Scheduler the CPU fraction is enforced with.
    pub fn with_sched(mut self, sched: Sched) -> Self {
        self.sched = sched;
        self
    }

    /// Overrides the CFS period.
    pub fn with_period_us(mut self, period_us: u64) -> Self {
        self.period_us = period_us;
        self
    }
}

/// A host whose CPU share is enforced by the platform's limiter.
#[derive(Debug)]
pub struct LimitedHost {
    node: Node,
    limiter: Box<dyn CpuLimiter>,
    limits: HostLimits,
}

impl LimitedHost {
    /// Starts a host named `name` and attaches the limiter for `env`'s platform. The limits are
    /// only applied by [`LimitedHost::apply`] or [`LimitedHost::config`].
    pub async fn create(
        name: impl Into<String>,
        options: NodeOptions,
        env: Env,
        limits: HostLimits,
    ) -> Result<Self> {
        let platform = env.platform;
        let mut node = Node::new(name, options, env);
        node.start_shell().await?;

        let limiter: Box<dyn CpuLimiter> = match platform {
            Platform::Linux => {
                Box::new(CgroupLimiter::create(&mut node, limits.sched, limits.period_us).await?)
            }
            Platform::FreeBsd => Box::new(RctlLimiter::create(&node).await?),
            Platform::OpenBsd => return Err(Error::Unsupported(platform)),
        };

        Ok(Self { node, limiter, limits })
    }

    /// The underlying node.
    pub fn node(&self) -> &Node {
        &self.node
    }

    /// Mutable access to the underlying node.
    pub fn node_mut(&mut self) -> &mut Node {
        &mut self.node
    }

    /// Limits as last applied, or as given at creation.
    pub fn limits(&self) -> &HostLimits {
        &self.limits
    }

    /// Applies the limits given at creation.
    pub async fn apply(&mut self) -> Result<()> {
        let limits = self.limits.clone();
        self.config(limits.cpu, &limits.cores).await
    }

    /// Sets the CPU fraction (if any) and then pins cores (if any).
    pub async fn config(&mut self, cpu: Option<f64>, cores: &[u32]) -> Result<()> {
        if let Some(fraction) = cpu {
            self.limiter.set_cpu_fraction(&mut self.node, fraction, Some(self.limits.sched)).await?;
            self.limits.cpu = Some(fraction);
        }

        if !cores.is_empty() {
            self.limiter.set_cores(&mut self.node, cores).await?;
            self.limits.cores = cores.to_vec();
        }

        Ok(())
    }

    /// CPU capacity granted, in cores. `None` while unlimited.
    pub fn bandwidth(&self) -> Option<f64> {
        self.limiter.bandwidth()
    }

    /// Terminates the host, then removes its limits. Cleanup runs even when terminating fails;
    /// the first error is returned.
    pub async fn stop(&mut self) -> Result<()> {
        let terminated = self.node.terminate().await;
        let cleaned = self.limiter.cleanup().await;

        terminated?;
        cleaned
    }
}
