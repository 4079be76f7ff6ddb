//! The node: a holder process plus the interfaces attached to it.

use std::{collections::BTreeMap, net::IpAddr, path::Path};

use netlab_common::Platform;

use crate::{
    command::{Capture, ExecContext, Holder, Isolate, Isolation, Output, Process},
    intf::{self, Interface},
    pair, Env, Error, Result,
};

/// Options fixed at construction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeOptions {
    /// Give the node its own network stack. Switches usually share the host's.
    pub in_namespace: bool,
    /// First port number handed out by [`Node::new_port`].
    pub port_base: u32,
}

impl Default for NodeOptions {
    fn default() -> Self {
        Self { in_namespace: true, port_base: 0 }
    }
}

impl NodeOptions {
    /// Gives the node its own network stack, or keeps it on the host.
    pub fn in_namespace(mut self, in_namespace: bool) -> Self {
        self.in_namespace = in_namespace;
        self
    }

    /// Sets the first port number handed out.
    pub fn port_base(mut self, port_base: u32) -> Self {
        self.port_base = port_base;
        self
    }
}

/// Lifecycle of a node. It only moves forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeState {
    Created,
    Running,
    Terminated,
}

/// One emulated host, switch or controller.
#[derive(Debug)]
pub struct Node {
    name: String,
    env: Env,
    options: NodeOptions,
    state: NodeState,
    holder: Option<Holder>,
    cgroup: Option<String>,
    rt_priority: Option<i32>,
    intfs: BTreeMap<u32, Interface>,
    control: Option<String>,
    pending: Option<Process>,
}

impl Node {
    /// A node that has not been started. Nothing runs until `start_shell`.
    pub fn new(name: impl Into<String>, options: NodeOptions, env: Env) -> Self {
        Self {
            name: name.into(),
            env,
            options,
            state: NodeState::Created,
            holder: None,
            cgroup: None,
            rt_priority: None,
            intfs: BTreeMap::new(),
            control: None,
            pending: None,
        }
    }

    /// Name of the node.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The collaborators the node was built with.
    pub fn env(&self) -> &Env {
        &self.env
    }

    /// The platform the node runs on.
    pub fn platform(&self) -> Platform {
        self.env.platform
    }

    /// Whether the node has its own network stack.
    pub fn in_namespace(&self) -> bool {
        self.options.in_namespace
    }

    /// Current lifecycle state.
    pub fn state(&self) -> NodeState {
        self.state
    }

    /// Pid of the holder process (jail id for jails). `None` until started.
    pub fn pid(&self) -> Option<u32> {
        self.holder.as_ref().map(|h| h.pid)
    }

    /// How commands are isolated, once started.
    pub fn isolation(&self) -> Option<&Isolation> {
        self.holder.as_ref().map(|h| &h.isolation)
    }

    /// Spawns the holder process. Calling it on a running node does nothing.
    pub async fn start_shell(&mut self) -> Result<()> {
        match self.state {
            NodeState::Running => return Ok(()),
            NodeState::Terminated => return Err(Error::Terminated(self.name.clone())),
            NodeState::Created => {}
        }

        let isolate = if !self.options.in_namespace {
            Isolate::None
        } else {
            match self.env.platform {
                Platform::Linux => Isolate::Namespace,
                Platform::FreeBsd => Isolate::Jail,
                Platform::OpenBsd => Isolate::Rdomain(self.env.registry.allocate_rdomain()),
            }
        };

        let holder = self.env.shell.spawn_holder(&self.name, isolate).await?;
        tracing::debug!(node = %self.name, pid = holder.pid, isolation = ?holder.isolation, "started node");

        self.holder = Some(holder);
        self.state = NodeState::Running;

        Ok(())
    }

    /// The context commands for this node run in.
    pub fn context(&self) -> Result<ExecContext> {
        let isolation = match (&self.holder, self.options.in_namespace) {
            (_, false) => Isolation::Host,
            (Some(_), true) if self.state == NodeState::Terminated => {
                return Err(Error::Terminated(self.name.clone()))
            }
            (Some(holder), true) => holder.isolation.clone(),
            (None, true) => return Err(Error::NotStarted(self.name.clone())),
        };

        Ok(ExecContext { isolation, cgroup: self.cgroup.clone(), rt_priority: self.rt_priority })
    }

    /// Runs `cmd` in the node and waits for it.
    pub async fn exec(&self, cmd: &str) -> Result<Output> {
        let ctx = self.context()?;
        Ok(self.env.shell.exec(&ctx, cmd).await?)
    }

    /// Runs `cmd` in the node and returns stdout followed by stderr.
    pub async fn cmd(&self, cmd: &str) -> Result<String> {
        Ok(self.exec(cmd).await?.combined())
    }

    /// Runs `cmd` in the node and fails on a non-zero exit status.
    pub async fn cmd_checked(&self, cmd: &str) -> Result<Output> {
        Ok(self.exec(cmd).await?.into_result(cmd)?)
    }

    /// Starts `cmd` in the background; collect its output with [`Node::monitor`].
    pub async fn send_cmd(&mut self, cmd: &str) -> Result<()> {
        if self.pending.is_some() {
            return Err(Error::Busy { node: self.name.clone() });
        }

        let ctx = self.context()?;
        let argv = ["sh".to_owned(), "-c".to_owned(), cmd.to_owned()];
        let process = self.env.shell.spawn(&ctx, &argv, Capture::Piped).await?;
        self.pending = Some(process);

        Ok(())
    }

    /// Whether a command sent with `send_cmd` is still pending.
    pub fn waiting(&self) -> bool {
        self.pending.is_some()
    }

    /// Waits for the command started by [`Node::send_cmd`].
    pub async fn monitor(&mut self) -> Result<Output> {
        let process =
            self.pending.take().ok_or_else(|| Error::NothingPending { node: self.name.clone() })?;

        Ok(process.wait_output().await?)
    }

    /// Starts `argv` in the background, sending its output to `log` (or discarding it).
    pub async fn popen(&self, argv: &[String], log: Option<&Path>) -> Result<Process> {
        let ctx = self.context()?;
        let capture = log.map_or(Capture::Null, |path| Capture::Log(path.to_path_buf()));

        Ok(self.env.shell.spawn(&ctx, argv, capture).await?)
    }

    /// Places subsequent commands in cgroup `group`.
    pub fn set_cgroup(&mut self, group: Option<String>) {
        self.cgroup = group;
    }

    /// Cgroup every command joins, if any.
    pub fn cgroup(&self) -> Option<&str> {
        self.cgroup.as_deref()
    }

    /// Schedules subsequent commands with `SCHED_RR` at `priority`.
    pub fn set_rt_priority(&mut self, priority: Option<i32>) {
        self.rt_priority = priority;
    }

    /// `SCHED_RR` priority of every command, if any.
    pub fn rt_priority(&self) -> Option<i32> {
        self.rt_priority
    }

    /// The next free port: one past the highest used port, never below the port base.
    pub fn new_port(&self) -> u32 {
        self.intfs
            .keys()
            .next_back()
            .map_or(self.options.port_base, |last| (last + 1).max(self.options.port_base))
    }

    /// Attaches `intf` at `port` (or the next free port) and returns the port.
    pub fn add_intf(&mut self, mut intf: Interface, port: Option<u32>) -> Result<u32> {
        let port = port.unwrap_or_else(|| self.new_port());

        if self.intfs.contains_key(&port) {
            return Err(Error::PortInUse { node: self.name.clone(), port });
        }
        if self.port_of(&intf.name).is_some() {
            return Err(Error::DuplicateIntf { node: self.name.clone(), intf: intf.name });
        }

        tracing::debug!(node = %self.name, intf = %intf.name, port, "added interface");

        intf.owner = Some(self.name.clone());
        self.intfs.insert(port, intf);

        Ok(port)
    }

    /// Attaches `intf` at port 0 and makes it the default interface.
    pub fn set_control_intf(&mut self, intf: Interface) -> Result<()> {
        let name = intf.name.clone();
        self.add_intf(intf, Some(0))?;
        self.control = Some(name);
        Ok(())
    }

    /// The out-of-band control interface, if set.
    pub fn control_intf(&self) -> Option<&Interface> {
        self.control.as_deref().and_then(|name| self.intf(name))
    }

    /// Detaches the interface named `name`. The device itself is left alone.
    pub fn del_intf(&mut self, name: &str) -> Option<Interface> {
        let port = self.port_of(name)?;
        let mut intf = self.intfs.remove(&port)?;
        intf.owner = None;

        if self.control.as_deref() == Some(name) {
            self.control = None;
        }

        Some(intf)
    }

    /// Interfaces in port order.
    pub fn intf_list(&self) -> impl Iterator<Item = &Interface> {
        self.intfs.values()
    }

    /// `(port, interface)` pairs in port order.
    pub fn ports(&self) -> impl Iterator<Item = (u32, &Interface)> {
        self.intfs.iter().map(|(port, intf)| (*port, intf))
    }

    /// The interface with logical name `name`.
    pub fn intf(&self, name: &str) -> Option<&Interface> {
        self.intfs.values().find(|intf| intf.name == name)
    }

    /// Mutable lookup by logical name.
    pub fn intf_mut(&mut self, name: &str) -> Option<&mut Interface> {
        self.intfs.values_mut().find(|intf| intf.name == name)
    }

    /// Port number of interface `name`.
    pub fn port_of(&self, name: &str) -> Option<u32> {
        self.intfs.iter().find(|(_, intf)| intf.name == name).map(|(port, _)| *port)
    }

    /// The control interface if there is one, otherwise the interface on the lowest port.
    pub fn default_intf(&self) -> Option<&Interface> {
        self.control_intf().or_else(|| self.intfs.values().next())
    }

    /// Assigns `ip/prefix_len` to interface `name` and brings it up.
    pub async fn set_ip(&mut self, name: &str, ip: IpAddr, prefix_len: u8) -> Result<()> {
        let dev = self.os_name_of(name)?;
        self.cmd_checked(&intf::set_ip_cmd(self.platform(), &dev, ip, prefix_len)).await?;

        if let Some(intf) = self.intf_mut(name) {
            intf.ip = Some(ip);
            intf.prefix_len = prefix_len;
        }

        Ok(())
    }

    /// Sets the hardware address of interface `name`.
    pub async fn set_mac(&mut self, name: &str, mac: &str) -> Result<()> {
        let dev = self.os_name_of(name)?;
        self.cmd_checked(&intf::set_mac_cmd(self.platform(), &dev, mac)).await?;

        if let Some(intf) = self.intf_mut(name) {
            intf.mac = Some(mac.to_owned());
        }

        Ok(())
    }

    fn os_name_of(&self, name: &str) -> Result<String> {
        self.intf(name).map(|intf| intf.os_name().to_owned()).ok_or_else(|| Error::UnknownIntf {
            node: self.name.clone(),
            intf: name.to_owned(),
        })
    }

    /// Deletes every attached interface except the control interface. Devices that are already
    /// gone are simply detached.
    pub async fn delete_intfs(&mut self) -> Result<()> {
        let doomed: Vec<(String, String)> = self
            .intfs
            .values()
            .filter(|intf| self.control.as_deref() != Some(intf.name.as_str()))
            .map(|intf| (intf.name.clone(), intf.os_name().to_owned()))
            .collect();

        for (name, dev) in doomed {
            pair::delete_intf(self, &dev).await?;
            self.del_intf(&name);
        }

        Ok(())
    }

    /// Kills the holder and any pending command. Terminating twice is fine.
    pub async fn terminate(&mut self) -> Result<()> {
        if self.state == NodeState::Terminated {
            return Ok(());
        }

        if let Some(mut process) = self.pending.take() {
            if let Err(e) = process.kill().await {
                tracing::warn!(node = %self.name, ?e, "failed to kill pending command");
            }
        }

        if let Some(holder) = self.holder.as_mut() {
            self.env.shell.release_holder(holder).await?;
        }

        self.state = NodeState::Terminated;
        tracing::debug!(node = %self.name, "terminated node");

        Ok(())
    }
}
