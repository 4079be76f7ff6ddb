//! Bulk startup and shutdown of Open vSwitch switches.
//!
//! Queued switches each hold a list of `ovs-vsctl` argument fragments. [`batch_startup`] splits
//! them into subcommand groups and packs the groups of every switch into as few `ovs-vsctl`
//! invocations as the argument-length bound allows, then puts every switch back into immediate
//! mode and restores the link shaping of the switches it configured.

use netlab_node::Env;

use crate::{Error, OvsSwitch, Result, Switch};

/// Longest `ovs-vsctl` command line issued in one go. Well below `ARG_MAX`, which is not
/// reached in practice.
pub const ARGMAX: usize = 128_000;

const VSCTL: &str = "ovs-vsctl";

/// What a flush did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchReport {
    /// Packed `ovs-vsctl` invocations issued.
    pub invocations: usize,
    /// Total length of those invocations.
    pub bytes: usize,
}

/// Splits one queued fragment into groups that may go to different invocations, each starting
/// with `--`. `@id` references stay in the bridge group that creates them, and every
/// `add-port` keeps the `set Interface` that follows it.
fn subcommand_groups(fragment: &str) -> Vec<String> {
    let fragment = fragment.trim();
    let body = fragment.strip_prefix("-- ").unwrap_or(fragment);

    let mut groups: Vec<Vec<&str>> = Vec::new();
    for subcommand in body.split(" -- ").map(str::trim).filter(|s| !s.is_empty()) {
        match groups.last_mut() {
            Some(group) if !subcommand.starts_with("add-port ") => group.push(subcommand),
            _ => groups.push(vec![subcommand]),
        }
    }

    groups.into_iter().map(|group| format!("-- {}", group.join(" -- "))).collect()
}

#[derive(Debug)]
struct Accumulator<'a> {
    env: &'a Env,
    argmax: usize,
    cmd: String,
    report: BatchReport,
}

impl<'a> Accumulator<'a> {
    fn new(env: &'a Env, argmax: usize) -> Self {
        Self { env, argmax, cmd: VSCTL.to_owned(), report: BatchReport::default() }
    }

    async fn push(&mut self, group: &str) -> Result<()> {
        if VSCTL.len() + 1 + group.len() >= self.argmax {
            return Err(Error::TooLong { len: group.len(), argmax: self.argmax });
        }
        if self.cmd.len() + 1 + group.len() >= self.argmax {
            self.flush().await?;
        }
        self.cmd.push(' ');
        self.cmd.push_str(group);
        Ok(())
    }

    async fn flush(&mut self) -> Result<()> {
        if self.cmd.len() == VSCTL.len() {
            return Ok(());
        }

        let cmd = std::mem::replace(&mut self.cmd, VSCTL.to_owned());
        self.env.run_checked(&cmd).await?;

        self.report.invocations += 1;
        self.report.bytes += cmd.len();
        Ok(())
    }
}

/// Replays the queued configuration of `switches`, never issuing a command line of `argmax`
/// bytes or more. Every switch ends up in immediate mode, and each switch that had queued
/// configuration gets its link shaping re-applied once.
///
/// A failing `ovs-vsctl` call is returned as an error and every switch keeps its queue.
pub async fn batch_startup(env: &Env, switches: &mut [&mut OvsSwitch], argmax: usize) -> Result<BatchReport> {
    let mut acc = Accumulator::new(env, argmax);
    let mut replayed = vec![false; switches.len()];

    for (switch, replayed) in switches.iter().zip(replayed.iter_mut()) {
        if switch.queued().is_empty() {
            continue;
        }
        *replayed = true;

        if switch.version().is_old() {
            env.run(&format!("{VSCTL} del-br {}", switch.name())).await?;
        }
        for fragment in switch.queued() {
            for group in subcommand_groups(fragment) {
                acc.push(&group).await?;
            }
        }
    }
    acc.flush().await?;

    for (switch, replayed) in switches.iter_mut().zip(replayed) {
        switch.drain_queued();
        if replayed {
            switch.core().reapply_shaping().await?;
        }
    }

    tracing::info!(switches = switches.len(), invocations = acc.report.invocations, bytes = acc.report.bytes, "batch startup complete");
    Ok(acc.report)
}

/// Deletes every bridge in one `ovs-vsctl` call, hangs up the switches' holder processes and
/// releases their nodes.
pub async fn batch_shutdown(env: &Env, switches: &mut [&mut OvsSwitch]) -> Result<()> {
    let Some(first) = switches.first() else {
        return Ok(());
    };

    let if_exists = if first.version().is_old() { "" } else { "--if-exists " };
    let deletions =
        switches.iter().map(|s| format!("{if_exists}del-br {}", s.name())).collect::<Vec<_>>().join(" -- ");
    env.run(&format!("{VSCTL} {deletions}")).await?;

    let pids = switches.iter().filter_map(|s| s.node().pid()).map(|pid| pid.to_string()).collect::<Vec<_>>();
    if !pids.is_empty() {
        env.run(&format!("kill -HUP {}", pids.join(" "))).await?;
    }

    for switch in switches.iter_mut() {
        switch.node_mut().terminate().await?;
    }

    Ok(())
}
