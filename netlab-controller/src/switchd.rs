use std::net::IpAddr;

use async_trait::async_trait;
use netlab_node::{command::send_signal, deps, Env, Node, NodeOptions};
use nix::sys::signal::Signal;

use crate::{
    endpoint::{DEFAULT_IP, DEFAULT_PORT},
    probe, Controller, ControllerEndpoint, Result,
};

/// Configuration file shipped for emulated topologies.
pub const DEFAULT_CONF: &str = "/etc/switchd.netlab.conf";

/// Launch options of OpenBSD's `switchd(8)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SwitchdOptions {
    pub conf: String,
    pub ip: IpAddr,
    pub port: u16,
    /// MAC address timeout in seconds.
    pub timeout: Option<u32>,
    /// Verbosity flags, e.g. `-vv`.
    pub vflags: Option<String>,
    /// MAC address cache size.
    pub cache: Option<u32>,
}

impl Default for SwitchdOptions {
    fn default() -> Self {
        Self {
            conf: DEFAULT_CONF.to_owned(),
            ip: DEFAULT_IP,
            port: DEFAULT_PORT,
            timeout: None,
            vflags: None,
            cache: None,
        }
    }
}

impl SwitchdOptions {
    /// Configuration file passed with `-f`.
    pub fn with_conf(mut self, conf: impl Into<String>) -> Self {
        self.conf = conf.into();
        self
    }

    /// Address `switchd` listens on.
    pub fn with_ip(mut self, ip: IpAddr) -> Self {
        self.ip = ip;
        self
    }

    /// Port `switchd` listens on.
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Idle flow timeout, in seconds.
    pub fn with_timeout(mut self, secs: u32) -> Self {
        self.timeout = Some(secs);
        self
    }

    /// Verbosity flags, e.g. `-vv`.
    pub fn with_vflags(mut self, vflags: impl Into<String>) -> Self {
        self.vflags = Some(vflags.into());
        self
    }

    /// Size of the MAC address cache.
    pub fn with_cache(mut self, size: u32) -> Self {
        self.cache = Some(size);
        self
    }

    /// The full `switchd` invocation for these options.
    pub fn command_line(&self) -> String {
        let mut cmd = format!("switchd -f {} -D ctl_ip={} -D port={}", self.conf, self.ip, self.port);
        if let Some(timeout) = self.timeout {
            cmd.push_str(&format!(" -t {timeout}"));
        }
        if let Some(vflags) = &self.vflags {
            cmd.push(' ');
            cmd.push_str(vflags);
        }
        if let Some(cache) = self.cache {
            cmd.push_str(&format!(" -c {cache}"));
        }
        cmd
    }
}

/// `switchd(8)`, which daemonizes itself; it is tracked by pid rather than by a child handle.
#[derive(Debug)]
pub struct Switchd {
    node: Node,
    options: SwitchdOptions,
    endpoint: ControllerEndpoint,
    pid: Option<u32>,
}

impl Switchd {
    /// Checks that the listening port is free. The daemon is started by `start`.
    pub async fn new(name: impl Into<String>, options: SwitchdOptions, env: Env) -> Result<Self> {
        let name = name.into();
        let endpoint = ControllerEndpoint::new(name.clone(), options.ip, options.port);

        probe::check_free(&env, &endpoint).await?;

        let node = Node::new(name, NodeOptions::default().in_namespace(false), env);
        Ok(Self { node, options, endpoint, pid: None })
    }

    /// Options the daemon was built with.
    pub fn options(&self) -> &SwitchdOptions {
        &self.options
    }

    /// Pid of the running daemon.
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }
}

#[async_trait]
impl Controller for Switchd {
    fn name(&self) -> &str {
        self.node.name()
    }

    fn endpoint(&self) -> &ControllerEndpoint {
        &self.endpoint
    }

    async fn start(&mut self) -> Result<()> {
        if self.pid.is_some() {
            return Ok(());
        }

        deps::path_check(self.node.env(), &["switchd"], "switchd").await?;
        self.node.start_shell().await?;
        self.node.cmd(&self.options.command_line()).await?;

        let found = self.node.env().run("pgrep -n switchd").await?;
        self.pid = found.stdout.trim().parse().ok();
        if self.pid.is_none() {
            tracing::warn!(controller = %self.node.name(), "switchd did not stay up");
        }

        tracing::info!(controller = %self.node.name(), pid = ?self.pid, "started switchd");
        Ok(())
    }

    async fn stop(&mut self) -> Result<()> {
        if let Some(pid) = self.pid.take() {
            if let Err(e) = send_signal(pid, Signal::SIGTERM) {
                tracing::debug!(controller = %self.node.name(), pid, error = %e, "could not signal switchd");
            }
        }

        self.node.terminate().await?;
        Ok(())
    }
}
