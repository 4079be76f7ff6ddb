//! Open vSwitch in the host's namespace, configured through `ovs-vsctl`.

use std::{fmt, sync::LazyLock};

use async_trait::async_trait;
use netlab_controller::ControllerEndpoint;
use netlab_node::{Env, Interface};
use parking_lot::Mutex;
use regex::Regex;

use crate::{base::SwitchCore, dpid, stp, Error, FailMode, Result, Switch, SwitchOptions};

/// Default cap on the controller reconnection backoff.
pub const RECONNECT_MS: u32 = 1000;

static VERSION: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(\d+)\.(\d+)").expect("valid regex"));

/// Major and minor version of the installed Open vSwitch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct OvsVersion {
    /// First component of `ovs-vsctl -V`, e.g. the `2` of `2.17.0`.
    pub major: u32,
    /// Second component.
    pub minor: u32,
}

impl OvsVersion {
    /// Releases before this one lack `ofport_request`, usable patch ports and `--if-exists`.
    pub const FIRST_MODERN: Self = Self { major: 1, minor: 10 };

    /// Version `major.minor`.
    pub const fn new(major: u32, minor: u32) -> Self {
        Self { major, minor }
    }

    /// The first `major.minor` in `ovs-vsctl --version` output.
    pub fn parse(text: &str) -> Option<Self> {
        let caps = VERSION.captures(text)?;
        Some(Self { major: caps[1].parse().ok()?, minor: caps[2].parse().ok()? })
    }

    /// Whether this release predates [`OvsVersion::FIRST_MODERN`].
    pub fn is_old(&self) -> bool {
        *self < Self::FIRST_MODERN
    }
}

impl fmt::Display for OvsVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

/// Where packets are forwarded.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum Datapath {
    #[default]
    Kernel,
    /// `netdev`, forwarding in `ovs-vswitchd` itself.
    User,
}

/// Open vSwitch settings on top of [`SwitchOptions`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OvsOptions {
    pub fail_mode: FailMode,
    pub datapath: Datapath,
    /// Use in-band control.
    pub inband: bool,
    /// OpenFlow versions, e.g. `OpenFlow13`. Ignored on old releases.
    pub protocols: Option<String>,
    /// Maximum reconnect backoff; `None` keeps the OVS default.
    pub reconnect_ms: Option<u32>,
    /// Spanning tree. Only honored in standalone mode.
    pub stp: bool,
    /// Queue configuration for [`crate::batch_startup`].
    pub batch: bool,
}

impl Default for OvsOptions {
    fn default() -> Self {
        Self {
            fail_mode: FailMode::Secure,
            datapath: Datapath::Kernel,
            inband: false,
            protocols: None,
            reconnect_ms: Some(RECONNECT_MS),
            stp: false,
            batch: false,
        }
    }
}

impl OvsOptions {
    /// Behaviour while no controller is connected.
    pub fn with_fail_mode(mut self, fail_mode: FailMode) -> Self {
        self.fail_mode = fail_mode;
        self
    }

    /// Kernel or user-space datapath.
    pub fn with_datapath(mut self, datapath: Datapath) -> Self {
        self.datapath = datapath;
        self
    }

    /// Sets the OpenFlow versions to advertise.
    pub fn with_protocols(mut self, protocols: impl Into<String>) -> Self {
        self.protocols = Some(protocols.into());
        self
    }

    /// Sets the maximum reconnect backoff.
    pub fn with_reconnect_ms(mut self, ms: Option<u32>) -> Self {
        self.reconnect_ms = ms;
        self
    }

    /// Uses in-band control.
    pub fn inband(mut self, inband: bool) -> Self {
        self.inband = inband;
        self
    }

    /// Turns spanning tree on or off.
    pub fn stp(mut self, stp: bool) -> Self {
        self.stp = stp;
        self
    }

    /// Queues the start transaction for `batch_startup` instead of running it.
    pub fn batch(mut self, batch: bool) -> Self {
        self.batch = batch;
        self
    }
}

/// Whether `ovs-vsctl` arguments run now or wait for a batch flush.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandMode {
    Immediate,
    Queuing(Vec<String>),
}

/// An Open vSwitch bridge configured with `ovs-vsctl`.
#[derive(Debug)]
pub struct OvsSwitch {
    core: SwitchCore,
    options: OvsOptions,
    version: OvsVersion,
    mode: CommandMode,
    /// The start transaction sits in the queue.
    start_queued: bool,
    uuids: Mutex<Vec<String>>,
}

impl OvsSwitch {
    /// `version` comes from [`crate::SwitchKind::setup`].
    pub fn new(
        name: &str,
        switch: &SwitchOptions,
        options: OvsOptions,
        env: Env,
        version: OvsVersion,
    ) -> Result<Self> {
        let core = SwitchCore::new(name, switch, env, dpid::DEFAULT_LEN)?;
        let mode = if options.batch { CommandMode::Queuing(Vec::new()) } else { CommandMode::Immediate };

        Ok(Self { core, options, version, mode, start_queued: false, uuids: Mutex::new(Vec::new()) })
    }

    /// Options the switch was built with.
    pub fn options(&self) -> &OvsOptions {
        &self.options
    }

    /// Installed Open vSwitch version.
    pub fn version(&self) -> OvsVersion {
        self.version
    }

    /// Whether commands run now or wait in the queue.
    pub fn mode(&self) -> &CommandMode {
        &self.mode
    }

    /// Arguments waiting for a batch flush.
    pub fn queued(&self) -> &[String] {
        match &self.mode {
            CommandMode::Queuing(queued) => queued,
            CommandMode::Immediate => &[],
        }
    }

    /// Takes the queued `ovs-vsctl` arguments and returns to immediate mode.
    pub fn drain_queued(&mut self) -> Vec<String> {
        self.start_queued = false;
        match std::mem::replace(&mut self.mode, CommandMode::Immediate) {
            CommandMode::Queuing(queued) => queued,
            CommandMode::Immediate => Vec::new(),
        }
    }

    /// Runs `ovs-vsctl args`, or queues `args` in batch mode.
    pub async fn vsctl(&mut self, args: &str) -> Result<Option<String>> {
        match &mut self.mode {
            CommandMode::Queuing(queued) => {
                queued.push(args.trim().to_owned());
                Ok(None)
            }
            CommandMode::Immediate => Ok(Some(self.core.cmd(&format!("ovs-vsctl {}", args.trim())).await?)),
        }
    }

    /// UUIDs of the bridge's controller records, cached after the first non-empty answer.
    pub async fn controller_uuids(&self, update: bool) -> Result<Vec<String>> {
        if !update {
            let cached = self.uuids.lock().clone();
            if !cached.is_empty() {
                return Ok(cached);
            }
        }

        let out = self.core.cmd(&format!("ovs-vsctl -- get Bridge {} Controller", self.name())).await?;
        let out = out.trim();

        if let Some(inner) = out.strip_prefix('[').and_then(|s| s.strip_suffix(']')) {
            if !inner.is_empty() {
                *self.uuids.lock() = inner.split(',').map(|uuid| uuid.trim().to_owned()).collect();
            }
        }

        Ok(self.uuids.lock().clone())
    }

    fn intf_opts(&self, port: u32, intf: &Interface) -> String {
        let mut opts = String::new();

        if !self.version.is_old() {
            opts.push_str(&format!(" ofport_request={port}"));
            if intf.patch {
                if let Some(peer) = &intf.link {
                    opts.push_str(&format!(" type=patch options:peer={peer}"));
                }
            }
        }

        if opts.is_empty() {
            opts
        } else {
            format!(" -- set Interface {}{opts}", intf.os_name())
        }
    }

    fn bridge_opts(&self) -> String {
        let mut opts =
            format!(" other_config:datapath-id={} fail_mode={}", self.core.dpid, self.options.fail_mode);

        if !self.options.inband {
            opts.push_str(" other_config:disable-in-band=true");
        }
        if self.options.datapath == Datapath::User {
            opts.push_str(" datapath_type=netdev");
        }
        if let Some(protocols) = self.options.protocols.as_ref().filter(|_| !self.version.is_old()) {
            opts.push_str(&format!(" protocols={protocols}"));
        }
        if self.options.stp && self.options.fail_mode == FailMode::Standalone {
            opts.push_str(" stp_enable=true");
        }

        opts
    }

    /// The single `ovs-vsctl` transaction that replaces any stale bridge of the same name and
    /// creates the controllers, the bridge, its options and its ports.
    pub fn start_args(&self, controllers: &[ControllerEndpoint]) -> String {
        let name = self.name();

        let mut targets: Vec<(String, String)> =
            controllers.iter().map(|c| (format!("{name}{}", c.name), c.target())).collect();
        if let Some(port) = self.core.listen_port {
            targets.push((format!("{name}-listen"), format!("ptcp:{port}")));
        }

        let mut args = targets
            .iter()
            .map(|(id, target)| {
                let mut create = format!("-- --id=@{id} create Controller target=\\\"{target}\\\"");
                if let Some(ms) = self.options.reconnect_ms.filter(|ms| *ms > 0) {
                    create.push_str(&format!(" max_backoff={ms}"));
                }
                create
            })
            .collect::<Vec<_>>()
            .join(" ");
        let ids = targets.iter().map(|(id, _)| format!("@{id}")).collect::<Vec<_>>().join(",");

        if !self.version.is_old() {
            args.push_str(&format!(" -- --if-exists del-br {name}"));
        }

        args.push_str(&format!(" -- add-br {name} -- set bridge {name} controller=[{ids}]"));
        args.push_str(&self.bridge_opts());

        for (port, intf) in self.core.node.ports().filter(|(port, intf)| *port > 0 && !intf.has_ip()) {
            args.push_str(&format!(" -- add-port {name} {}", intf.os_name()));
            args.push_str(&self.intf_opts(port, intf));
        }

        args
    }
}

#[async_trait]
impl Switch for OvsSwitch {
    fn core(&self) -> &SwitchCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut SwitchCore {
        &mut self.core
    }

    #[tracing::instrument(skip_all, fields(switch = %self.name()))]
    async fn start(&mut self, controllers: &[ControllerEndpoint]) -> Result<()> {
        if self.core.node.in_namespace() {
            return Err(Error::InNamespace { switch: self.name().to_owned() });
        }
        if self.start_queued {
            return Ok(());
        }

        self.core.node.start_shell().await?;

        let args = self.start_args(controllers);
        self.vsctl(&args).await?;

        // Bridge creation resets the qdiscs of its ports. Batched switches get their shaping back
        // after the flush.
        if self.mode == CommandMode::Immediate {
            self.core.reapply_shaping().await?;
        } else {
            self.start_queued = true;
        }

        tracing::debug!(dpid = %self.core.dpid, batched = self.mode != CommandMode::Immediate, "started switch");
        Ok(())
    }

    async fn connected(&self) -> bool {
        let uuids = match self.controller_uuids(false).await {
            Ok(uuids) => uuids,
            Err(e) => {
                tracing::debug!(switch = self.name(), error = %e, "could not read controllers");
                Vec::new()
            }
        };

        for uuid in uuids {
            let cmd = format!("ovs-vsctl -- get Controller {uuid} is_connected");
            if matches!(self.core.cmd(&cmd).await, Ok(out) if out.contains("true")) {
                return true;
            }
        }

        self.options.fail_mode == FailMode::Standalone
    }

    async fn stop(&mut self, delete_intfs: bool) -> Result<()> {
        let name = self.name().to_owned();
        self.core.teardown(&format!("ovs-vsctl del-br {name}")).await;
        if self.options.datapath == Datapath::User {
            self.core.teardown(&format!("ip link del {name}")).await;
        }

        self.core.stop(delete_intfs).await
    }

    async fn attach(&mut self, intf: &str) -> Result<()> {
        let name = self.name().to_owned();
        self.vsctl(&format!("add-port {name} {intf}")).await?;
        self.core.cmd(&format!("ifconfig {intf} up")).await?;

        if let Some(attached) = self.core.node.intf(intf) {
            attached.apply_shaping(&self.core.node).await?;
        }
        Ok(())
    }

    async fn detach(&mut self, intf: &str) -> Result<()> {
        let name = self.name().to_owned();
        self.vsctl(&format!("del-port {name} {intf}")).await?;
        Ok(())
    }

    async fn dpctl(&self, args: &[&str]) -> Result<String> {
        let (subcommand, rest) = args.split_first().map_or(("show", &[][..]), |(first, rest)| (*first, rest));
        let mut cmd = format!("ovs-ofctl {subcommand} {}", self.name());
        for arg in rest {
            cmd.push(' ');
            cmd.push_str(arg);
        }
        self.core.cmd(&cmd).await
    }
}

/// Open vSwitch as a standalone learning bridge. Controllers are ignored.
#[derive(Debug)]
pub struct OvsBridge {
    inner: OvsSwitch,
}

impl OvsBridge {
    /// An Open vSwitch bridge in standalone fail mode.
    pub fn new(
        name: &str,
        switch: &SwitchOptions,
        options: OvsOptions,
        env: Env,
        version: OvsVersion,
    ) -> Result<Self> {
        let options = options.with_fail_mode(FailMode::Standalone);
        Ok(Self { inner: OvsSwitch::new(name, switch, options, env, version)? })
    }

    /// The underlying switch, e.g. for batching.
    pub fn as_ovs_mut(&mut self) -> &mut OvsSwitch {
        &mut self.inner
    }
}

#[async_trait]
impl Switch for OvsBridge {
    fn core(&self) -> &SwitchCore {
        &self.inner.core
    }

    fn core_mut(&mut self) -> &mut SwitchCore {
        &mut self.inner.core
    }

    async fn start(&mut self, _controllers: &[ControllerEndpoint]) -> Result<()> {
        self.inner.start(&[]).await
    }

    async fn connected(&self) -> bool {
        if !self.inner.options.stp {
            return true;
        }

        match self.inner.dpctl(&["show"]).await {
            Ok(show) => stp::ofctl_forwarding(&show),
            Err(_) => false,
        }
    }

    async fn stop(&mut self, delete_intfs: bool) -> Result<()> {
        self.inner.stop(delete_intfs).await
    }

    async fn attach(&mut self, intf: &str) -> Result<()> {
        self.inner.attach(intf).await
    }

    async fn detach(&mut self, intf: &str) -> Result<()> {
        self.inner.detach(intf).await
    }

    async fn dpctl(&self, args: &[&str]) -> Result<String> {
        self.inner.dpctl(args).await
    }
}
