//! Linux cgroup (v1) limits through the libcgroup tools.

use std::fmt::Display;

use async_trait::async_trait;
use netlab_node::{Env, Node};

use crate::{num_cores, CpuLimiter, Error, Result, Sched, CLEANUP_RETRY};

/// CFS refuses quotas below one millisecond.
pub const MIN_CFS_QUOTA_US: i64 = 1000;

/// `SCHED_RR` priority of realtime-limited hosts.
pub const RT_PRIORITY: i32 = 20;

const CGROUP_DIR: &str = "/sys/fs/cgroup";

/// Period and quota (both µs) granting `fraction` of `ncores` cores under CFS.
///
/// The quota is CPU time across all cores, so the fraction is scaled by the core count. When
/// that falls below [`MIN_CFS_QUOTA_US`] the period is widened instead, keeping the ratio. A
/// negative fraction yields the unlimited quota `-1`.
pub fn cfs_params(fraction: f64, period_us: u64, ncores: u32) -> Result<(u64, i64)> {
    if fraction.is_nan() || fraction == 0.0 {
        return Err(Error::InvalidFraction { fraction, sched: Sched::Cfs });
    }
    if fraction < 0.0 {
        return Ok((period_us, -1));
    }

    let scale = fraction * f64::from(ncores);
    let quota = (period_us as f64 * scale) as i64;

    if quota < MIN_CFS_QUOTA_US {
        tracing::debug!(quota, "increasing cfs period");
        return Ok(((MIN_CFS_QUOTA_US as f64 / scale) as u64, MIN_CFS_QUOTA_US));
    }

    Ok((period_us, quota))
}

/// Period and runtime (both µs) granting `fraction` under realtime group scheduling. The
/// runtime applies per core, so it is not scaled.
pub fn rt_params(fraction: f64, period_us: u64) -> Result<(u64, i64)> {
    if fraction.is_nan() || fraction <= 0.0 {
        return Err(Error::InvalidFraction { fraction, sched: Sched::Rt });
    }

    Ok((period_us, (period_us as f64 * fraction) as i64))
}

const fn param_names(sched: Sched) -> (&'static str, &'static str) {
    match sched {
        Sched::Rt => ("rt_period_us", "rt_runtime_us"),
        Sched::Cfs => ("cfs_period_us", "cfs_quota_us"),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Applied {
    sched: Sched,
    period_us: u64,
    quota_us: i64,
}

/// Limits one host through a cgroup named after it in the `cpu`, `cpuacct` and `cpuset`
/// hierarchies.
#[derive(Debug)]
pub struct CgroupLimiter {
    env: Env,
    name: String,
    pid: Option<u32>,
    sched: Sched,
    period_us: u64,
    ncores: u32,
    applied: Option<Applied>,
}

impl CgroupLimiter {
    /// Creates the cgroup of `node`, moves its holder in and routes its future commands there.
    pub async fn create(node: &mut Node, sched: Sched, period_us: u64) -> Result<Self> {
        let env = node.env().clone();
        ensure_mounted(&env).await?;
        if sched == Sched::Rt {
            check_rt_group_sched(&env).await?;
        }

        let name = node.name().to_owned();
        env.run_checked(&format!("cgcreate -g cpu,cpuacct,cpuset:/{name}")).await?;

        // The cpuset can only be joined once cpus and mems are set.
        if let Some(pid) = node.pid() {
            env.run_checked(&format!("cgclassify -g cpu,cpuacct:/{name} {pid}")).await?;
        }
        node.set_cgroup(Some(name.clone()));

        let ncores = num_cores(&env).await?;

        Ok(Self { env, name, pid: node.pid(), sched, period_us, ncores, applied: None })
    }

    /// Sets `resource.param` and reads it back. A value that did not stick is logged.
    async fn set(&self, resource: &str, param: &str, value: impl Display) -> Result<Option<String>> {
        let value = value.to_string();
        self.env.run(&format!("cgset -r {resource}.{param}={value} /{}", self.name)).await?;

        let got = self.get(resource, param).await?;
        if got.as_deref() != Some(value.as_str()) {
            tracing::error!(cgroup = %self.name, param, %value, ?got, "cgroup parameter did not stick");
        }

        Ok(got)
    }

    async fn get(&self, resource: &str, param: &str) -> Result<Option<String>> {
        let output = self.env.run(&format!("cgget -r {resource}.{param} /{}", self.name)).await?;
        Ok(output.stdout.split_whitespace().last().map(str::to_owned))
    }

    /// Gives the holder `SCHED_RR` and verifies the kernel agreed.
    async fn chrt(&self) -> Result<()> {
        let Some(pid) = self.pid else { return Ok(()) };

        self.env.run(&format!("chrt -p {RT_PRIORITY} {pid}")).await?;
        let output = self.env.run(&format!("chrt -p {pid}")).await?;
        let policy = output.stdout.lines().next().and_then(|line| line.split_whitespace().last());

        if policy != Some("SCHED_RR") {
            tracing::error!(cgroup = %self.name, ?policy, "could not assign SCHED_RR");
        }

        Ok(())
    }
}

#[async_trait]
impl CpuLimiter for CgroupLimiter {
    async fn set_cpu_fraction(
        &mut self,
        node: &mut Node,
        fraction: f64,
        sched: Option<Sched>,
    ) -> Result<()> {
        let sched = sched.unwrap_or(self.sched);
        let (period_us, quota_us) = match sched {
            Sched::Rt => rt_params(fraction, self.period_us)?,
            Sched::Cfs => cfs_params(fraction, self.period_us, self.ncores)?,
        };

        if sched == Sched::Rt {
            check_rt_group_sched(&self.env).await?;
        }

        let (period_param, quota_param) = param_names(sched);
        self.set("cpu", period_param, period_us).await?;
        self.set("cpu", quota_param, quota_us).await?;

        if sched == Sched::Rt {
            self.chrt().await?;
            // Without runtime in the group, SCHED_RR tasks could not run at all.
            node.set_rt_priority((quota_us > 0).then_some(RT_PRIORITY));
        } else {
            node.set_rt_priority(None);
        }

        tracing::info!(cgroup = %self.name, %sched, quota_us, period_us, "set cpu fraction");
        self.applied = Some(Applied { sched, period_us, quota_us });

        Ok(())
    }

    async fn set_cores(&mut self, _node: &mut Node, cores: &[u32]) -> Result<()> {
        if cores.is_empty() {
            return Ok(());
        }

        if let Some(core) = cores.iter().find(|core| **core >= self.ncores) {
            return Err(Error::InvalidCore {
                node: self.name.clone(),
                core: *core,
                available: (0..self.ncores).collect(),
            });
        }

        let list = cores.iter().map(u32::to_string).collect::<Vec<_>>().join(",");
        self.set("cpuset", "cpus", &list).await?;
        // Memory placement hardly matters, but a cpuset needs one.
        self.set("cpuset", "mems", 0).await?;

        if let Some(pid) = self.pid {
            self.env.run_checked(&format!("cgclassify -g cpuset:/{} {pid}", self.name)).await?;
        }

        tracing::info!(cgroup = %self.name, cores = %list, "pinned cores");

        Ok(())
    }

    async fn cleanup(&mut self) -> Result<()> {
        let cmd = format!("cgdelete -r cpu,cpuacct,cpuset:/{}", self.name);
        let (env, cmd) = (&self.env, &cmd);

        CLEANUP_RETRY
            .run(|_| async move {
                let output = env.run(cmd).await.map_err(|e| e.to_string())?;
                // cgdelete may report busy yet delete the group; the retry then finds nothing.
                if output.success() || output.stderr.to_lowercase().contains("no such file") {
                    Ok(())
                } else {
                    Err(output.stderr)
                }
            })
            .await
            .map_err(|source| Error::Cleanup { node: self.name.clone(), source })?;

        self.applied = None;
        tracing::debug!(cgroup = %self.name, "removed cgroup");

        Ok(())
    }

    fn bandwidth(&self) -> Option<f64> {
        let applied = self.applied?;
        if applied.quota_us < 0 {
            return None;
        }

        let share = applied.quota_us as f64 / applied.period_us as f64;
        match applied.sched {
            Sched::Cfs => Some(share),
            Sched::Rt => Some(share * f64::from(self.ncores)),
        }
    }
}

/// Verifies the cgroup hierarchy once per registry and mounts the cpuset controller if needed.
pub async fn ensure_mounted(env: &Env) -> Result<()> {
    env.registry
        .cgroups_mounted()
        .get_or_try_init(|| async move {
            let mounts = env.run("cat /proc/mounts").await?.stdout;

            if !mounts.contains(&format!("cgroup {CGROUP_DIR}"))
                && !mounts.contains(&format!("cgroups {CGROUP_DIR}"))
            {
                return Err(Error::Precondition(format!("cgroups not mounted on {CGROUP_DIR}")));
            }

            let cpuset = format!("{CGROUP_DIR}/cpuset");
            if !mounts.contains(&format!("cpuset {cpuset}")) {
                env.run_checked(&format!("mkdir -p {cpuset}")).await?;
                env.run_checked(&format!("mount -t cgroup -ocpuset cpuset {cpuset}")).await?;
            }

            Ok::<(), Error>(())
        })
        .await?;

    Ok(())
}

/// Fails unless the running kernel was built with realtime group scheduling. Checked once per
/// registry; a failed check is repeated on the next call.
pub async fn check_rt_group_sched(env: &Env) -> Result<()> {
    env.registry
        .rt_group_sched()
        .get_or_try_init(|| async move {
            let release = env.run("uname -r").await?.stdout.trim().to_owned();
            let config = env.run(&format!("grep CONFIG_RT_GROUP_SCHED /boot/config-{release}")).await?;

            if config.stdout.trim() == "# CONFIG_RT_GROUP_SCHED is not set" {
                tracing::error!(%release, "realtime group scheduling is disabled");
                return Err(Error::Precondition("please enable RT_GROUP_SCHED in your kernel".into()));
            }

            Ok::<(), Error>(())
        })
        .await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use netlab_common::{Platform, Registry};
    use netlab_node::{mock::MockShell, NodeOptions, Output};

    use super::*;
    use crate::DEFAULT_PERIOD_US;

    const MOUNTS: &str = "cgroup /sys/fs/cgroup tmpfs rw 0 0\ncpuset /sys/fs/cgroup/cpuset cgroup rw 0 0\n";

    async fn limited(shell: &Arc<MockShell>, sched: Sched) -> (Node, CgroupLimiter) {
        shell.respond("cat /proc/mounts", MOUNTS).respond("grep -c processor", "4\n");
        let env = Env::new(shell.clone(), Platform::Linux, Arc::new(Registry::new()));
        let mut node = Node::new("h1", NodeOptions::default(), env);
        node.start_shell().await.unwrap();

        let limiter = CgroupLimiter::create(&mut node, sched, DEFAULT_PERIOD_US).await.unwrap();
        (node, limiter)
    }

    #[test]
    fn cfs_scales_by_cores() {
        assert_eq!(cfs_params(0.5, 100_000, 4).unwrap(), (100_000, 200_000));
    }

    #[test]
    fn cfs_widens_the_period_below_the_minimum_quota() {
        let (period, quota) = cfs_params(0.001, 100_000, 4).unwrap();

        assert_eq!(quota, MIN_CFS_QUOTA_US);
        assert_eq!(period, 250_000);
        let ratio = quota as f64 / period as f64;
        assert!((ratio - 0.001 * 4.0).abs() < 1e-9);
    }

    #[test]
    fn cfs_negative_is_unlimited_and_zero_is_rejected() {
        assert_eq!(cfs_params(-1.0, 100_000, 4).unwrap(), (100_000, -1));
        assert!(matches!(cfs_params(0.0, 100_000, 4), Err(Error::InvalidFraction { .. })));
        assert!(cfs_params(f64::NAN, 100_000, 4).is_err());
    }

    #[test]
    fn rt_needs_a_positive_fraction() {
        assert_eq!(rt_params(0.25, 100_000).unwrap(), (100_000, 25_000));
        assert!(matches!(rt_params(-1.0, 100_000), Err(Error::InvalidFraction { sched: Sched::Rt, .. })));
        assert!(rt_params(0.0, 100_000).is_err());
    }

    #[tokio::test]
    async fn creation_classifies_the_holder() {
        let _ = tracing_subscriber::fmt::try_init();

        let shell = Arc::new(MockShell::new());
        let (node, _limiter) = limited(&shell, Sched::Cfs).await;
        let pid = node.pid().unwrap();

        assert_eq!(shell.count("cgcreate -g cpu,cpuacct,cpuset:/h1"), 1);
        assert_eq!(shell.count(&format!("cgclassify -g cpu,cpuacct:/h1 {pid}")), 1);
        assert_eq!(node.cgroup(), Some("h1"));
    }

    #[tokio::test]
    async fn setting_the_same_fraction_twice_is_idempotent() {
        let shell = Arc::new(MockShell::new());
        let (mut node, mut limiter) = limited(&shell, Sched::Cfs).await;
        shell.respond("cgget -r cpu.cfs_quota_us", "cpu.cfs_quota_us: 200000\n");

        shell.clear();
        limiter.set_cpu_fraction(&mut node, 0.5, None).await.unwrap();
        let first = shell.commands();
        let first_bw = limiter.bandwidth();

        shell.clear();
        limiter.set_cpu_fraction(&mut node, 0.5, None).await.unwrap();

        assert_eq!(shell.commands(), first);
        assert!(first.contains(&"cgset -r cpu.cfs_quota_us=200000 /h1".to_owned()));
        assert_eq!(limiter.bandwidth(), first_bw);
        assert!((limiter.bandwidth().unwrap() - 0.5 * 4.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn rejected_fraction_issues_no_commands() {
        let shell = Arc::new(MockShell::new());
        let (mut node, mut limiter) = limited(&shell, Sched::Cfs).await;
        shell.clear();

        let err = limiter.set_cpu_fraction(&mut node, -0.5, Some(Sched::Rt)).await.unwrap_err();

        assert!(matches!(err, Error::InvalidFraction { .. }));
        assert!(shell.commands().is_empty());
        assert_eq!(limiter.bandwidth(), None);
    }

    #[tokio::test]
    async fn realtime_sets_priority_for_commands() {
        let shell = Arc::new(MockShell::new());
        shell.respond("uname -r", "6.1.0\n").respond("grep CONFIG_RT_GROUP_SCHED", "CONFIG_RT_GROUP_SCHED=y\n");
        shell.respond("chrt -p", "pid 4001's current scheduling policy: SCHED_RR\n");
        let (mut node, mut limiter) = limited(&shell, Sched::Rt).await;

        limiter.set_cpu_fraction(&mut node, 0.25, None).await.unwrap();

        assert_eq!(node.rt_priority(), Some(RT_PRIORITY));
        assert_eq!(shell.count("cgset -r cpu.rt_runtime_us=25000 /h1"), 1);
        assert_eq!(shell.count("grep CONFIG_RT_GROUP_SCHED"), 1);
        assert!((limiter.bandwidth().unwrap() - 0.25 * 4.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn missing_rt_group_sched_is_fatal() {
        let shell = Arc::new(MockShell::new());
        shell.respond("cat /proc/mounts", MOUNTS).respond("grep -c processor", "4\n");
        shell.respond("grep CONFIG_RT_GROUP_SCHED", "# CONFIG_RT_GROUP_SCHED is not set\n");
        let env = Env::new(shell.clone(), Platform::Linux, Arc::new(Registry::new()));
        let mut node = Node::new("h1", NodeOptions::default(), env);
        node.start_shell().await.unwrap();

        let err = CgroupLimiter::create(&mut node, Sched::Rt, DEFAULT_PERIOD_US).await.unwrap_err();

        assert!(matches!(err, Error::Precondition(_)));
        assert_eq!(shell.count("cgcreate"), 0);
    }

    #[tokio::test]
    async fn invalid_core_is_rejected_up_front() {
        let shell = Arc::new(MockShell::new());
        let (mut node, mut limiter) = limited(&shell, Sched::Cfs).await;
        shell.clear();

        let err = limiter.set_cores(&mut node, &[0, 7]).await.unwrap_err();

        assert!(matches!(err, Error::InvalidCore { core: 7, .. }));
        assert!(shell.commands().is_empty());

        limiter.set_cores(&mut node, &[0, 1]).await.unwrap();
        assert_eq!(shell.count("cgset -r cpuset.cpus=0,1 /h1"), 1);
        assert_eq!(shell.count("cgclassify -g cpuset:/h1"), 1);
    }

    #[tokio::test]
    async fn cleanup_treats_missing_group_as_clean() {
        let shell = Arc::new(MockShell::new());
        let (_node, mut limiter) = limited(&shell, Sched::Cfs).await;
        shell.fail("cgdelete", 1, "cgdelete: cannot remove group 'h1': No such file or directory");
        shell.respond_times("cgdelete", Output::new(1, "", "Device or resource busy"), 1);

        limiter.cleanup().await.unwrap();

        assert_eq!(shell.count("cgdelete -r cpu,cpuacct,cpuset:/h1"), 2);
    }

    #[tokio::test]
    async fn cleanup_gives_up_after_three_attempts() {
        let shell = Arc::new(MockShell::new());
        let (_node, mut limiter) = limited(&shell, Sched::Cfs).await;
        shell.fail("cgdelete", 1, "Device or resource busy");

        let err = limiter.cleanup().await.unwrap_err();

        assert!(matches!(err, Error::Cleanup { source, .. } if source.attempts == 3));
    }
}
