//! FreeBSD jail limits through `rctl(8)` and `cpuset(1)`.

use async_trait::async_trait;
use netlab_node::{Env, Isolation, Node};

use crate::{num_cores, CpuLimiter, Error, Result, Sched, CLEANUP_RETRY};

/// Core ids listed by `cpuset -g`, e.g. `pid -1 mask: 0, 1, 2, 3`.
pub fn parse_cpuset_mask(output: &str) -> Vec<u32> {
    output
        .split_whitespace()
        .skip_while(|token| *token != "mask:")
        .skip(1)
        .filter_map(|token| token.split(',').next().and_then(|core| core.parse().ok()))
        .collect()
}

/// Limits one jail. `pcpu` is a percentage of a single core, so the fraction is scaled by the
/// number of cores the jail may run on, recomputed whenever they change.
#[derive(Debug)]
pub struct RctlLimiter {
    env: Env,
    jail: String,
    fraction: Option<f64>,
    cores: u32,
    pcpu: Option<u64>,
}

impl RctlLimiter {
    /// Limiter for the jail `node` runs in. Fails for nodes outside a jail.
    pub async fn create(node: &Node) -> Result<Self> {
        let Some(Isolation::Jail { name }) = node.isolation() else {
            return Err(Error::Precondition(format!("{} does not run in a jail", node.name())));
        };

        let env = node.env().clone();
        let cores = num_cores(&env).await?;

        Ok(Self { env, jail: name.clone(), fraction: None, cores, pcpu: None })
    }

    async fn apply(&mut self) -> Result<()> {
        let Some(fraction) = self.fraction else { return Ok(()) };

        let pcpu = (fraction * 100.0 * f64::from(self.cores)) as u64;
        self.env.run_checked(&format!("rctl -a jail:{}:pcpu:deny={pcpu}", self.jail)).await?;
        self.pcpu = Some(pcpu);

        tracing::info!(jail = %self.jail, pcpu, cores = self.cores, "set cpu fraction");

        Ok(())
    }
}

#[async_trait]
impl CpuLimiter for RctlLimiter {
    async fn set_cpu_fraction(
        &mut self,
        _node: &mut Node,
        fraction: f64,
        sched: Option<Sched>,
    ) -> Result<()> {
        if fraction.is_nan() || fraction == 0.0 {
            return Err(Error::InvalidFraction { fraction, sched: sched.unwrap_or_default() });
        }

        if fraction < 0.0 {
            if self.pcpu.take().is_some() {
                self.env.run(&format!("rctl -r jail:{}:pcpu", self.jail)).await?;
            }
            self.fraction = None;
            return Ok(());
        }

        self.fraction = Some(fraction);
        self.apply().await
    }

    async fn set_cores(&mut self, _node: &mut Node, cores: &[u32]) -> Result<()> {
        if cores.is_empty() {
            return Ok(());
        }

        let available = parse_cpuset_mask(&self.env.run("cpuset -g").await?.stdout);
        if let Some(core) = cores.iter().find(|core| !available.contains(*core)) {
            return Err(Error::InvalidCore { node: self.jail.clone(), core: *core, available });
        }

        let list = cores.iter().map(u32::to_string).collect::<Vec<_>>().join(",");
        self.env.run_checked(&format!("cpuset -l {list} -j {}", self.jail)).await?;

        self.cores = cores.len() as u32;
        self.apply().await
    }

    async fn cleanup(&mut self) -> Result<()> {
        // cpuset bindings go away with the jail.
        let cmd = format!("rctl -r jail:{}", self.jail);
        let (env, cmd) = (&self.env, &cmd);

        CLEANUP_RETRY
            .run(|_| async move {
                let output = env.run(cmd).await.map_err(|e| e.to_string())?;
                if output.success() || output.stderr.to_lowercase().contains("no such") {
                    Ok(())
                } else {
                    Err(output.stderr)
                }
            })
            .await
            .map_err(|source| Error::Cleanup { node: self.jail.clone(), source })?;

        self.pcpu = None;

        Ok(())
    }

    fn bandwidth(&self) -> Option<f64> {
        self.pcpu.map(|pcpu| pcpu as f64 / 100.0)
    }
}
