//! Kernel learning bridges with optional spanning tree: `brctl` on Linux, `if_bridge(4)` on
//! FreeBSD.

use async_trait::async_trait;
use netlab_controller::ControllerEndpoint;
use netlab_node::Env;

use crate::{base::SwitchCore, dpid, stp, Error, Result, Switch, SwitchOptions};

/// Spanning-tree settings shared by both bridge kinds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BridgeOptions {
    pub stp: bool,
    /// Spanning-tree bridge priority; allocated from the registry when unset.
    pub priority: Option<u32>,
}

impl BridgeOptions {
    /// Turns spanning tree on or off.
    pub fn stp(mut self, stp: bool) -> Self {
        self.stp = stp;
        self
    }

    /// Fixes the spanning-tree priority instead of taking one from the registry.
    pub fn with_priority(mut self, priority: u32) -> Self {
        self.priority = Some(priority);
        self
    }
}

/// A Linux kernel bridge managed with `brctl`.
#[derive(Debug)]
pub struct LinuxBridge {
    core: SwitchCore,
    stp: bool,
    priority: u32,
}

impl LinuxBridge {
    /// Builds the bridge. The priority is resolved after the node is built.
    pub fn new(name: &str, switch: &SwitchOptions, options: BridgeOptions, env: Env) -> Result<Self> {
        let core = SwitchCore::new(name, switch, env, dpid::DEFAULT_LEN)?;
        let priority = stp::resolve_priority(options.priority, &core.node.env().registry);
        Ok(Self { core, stp: options.stp, priority })
    }

    /// Spanning-tree priority, used only when STP is on.
    pub fn priority(&self) -> u32 {
        self.priority
    }
}

#[async_trait]
impl Switch for LinuxBridge {
    fn core(&self) -> &SwitchCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut SwitchCore {
        &mut self.core
    }

    async fn start(&mut self, _controllers: &[ControllerEndpoint]) -> Result<()> {
        self.core.node.start_shell().await?;
        let name = self.name().to_owned();

        self.core.cmd(&format!("ifconfig {name} down")).await?;
        self.core.cmd(&format!("brctl delbr {name}")).await?;
        self.core.node.cmd_checked(&format!("brctl addbr {name}")).await?;

        if self.stp {
            self.core.cmd(&format!("brctl setbridgeprio {name} {}", self.priority)).await?;
            self.core.cmd(&format!("brctl stp {name} on")).await?;
        }

        let ports: Vec<String> = self.core.data_intfs().iter().map(|i| i.os_name().to_owned()).collect();
        for port in ports {
            self.core.cmd(&format!("brctl addif {name} {port}")).await?;
        }

        self.core.cmd(&format!("ifconfig {name} up")).await?;
        Ok(())
    }

    async fn connected(&self) -> bool {
        if !self.stp {
            return true;
        }

        match self.core.cmd(&format!("brctl showstp {}", self.name())).await {
            Ok(out) => stp::brctl_forwarding(&out),
            Err(_) => false,
        }
    }

    async fn stop(&mut self, delete_intfs: bool) -> Result<()> {
        let name = self.name().to_owned();
        self.core.teardown(&format!("ifconfig {name} down")).await;
        self.core.teardown(&format!("brctl delbr {name}")).await;

        self.core.stop(delete_intfs).await
    }

    async fn dpctl(&self, args: &[&str]) -> Result<String> {
        self.core.cmd(&format!("brctl {}", args.join(" "))).await
    }
}

/// FreeBSD `if_bridge(4)`. The kernel picks the bridge's name at creation; it is kept for every
/// later call.
#[derive(Debug)]
pub struct IfBridge {
    core: SwitchCore,
    stp: bool,
    priority: u32,
    bname: Option<String>,
}

impl IfBridge {
    /// Builds the bridge. The priority is resolved after the node is built.
    pub fn new(name: &str, switch: &SwitchOptions, options: BridgeOptions, env: Env) -> Result<Self> {
        let core = SwitchCore::new(name, switch, env, dpid::DEFAULT_LEN)?;
        let priority = stp::resolve_priority(options.priority, &core.node.env().registry);
        Ok(Self { core, stp: options.stp, priority, bname: None })
    }

    /// Spanning-tree priority, used only when STP is on.
    pub fn priority(&self) -> u32 {
        self.priority
    }

    /// The kernel's name for the bridge, once started.
    pub fn bname(&self) -> Option<&str> {
        self.bname.as_deref()
    }

    async fn configure(&self, env: &Env, bname: &str) -> Result<()> {
        if self.core.node.in_namespace() {
            env.run_checked(&format!("ifconfig {bname} vnet {}", self.name())).await?;
        }

        let mut add = String::new();
        let mut stp = String::new();
        for port in self.core.data_intfs().iter().map(|i| i.os_name()) {
            add.push_str(&format!(" addm {port}"));
            if self.stp {
                stp.push_str(&format!(" stp {port}"));
            }
            self.core.cmd(&format!("ifconfig {port} up")).await?;
        }

        if !add.is_empty() {
            self.core.cmd(&format!("ifconfig {bname}{add}")).await?;
        }
        if self.stp {
            self.core.cmd(&format!("ifconfig {bname} priority {}", self.priority)).await?;
            if !stp.is_empty() {
                self.core.cmd(&format!("ifconfig {bname}{stp}")).await?;
            }
        }
        self.core.cmd(&format!("ifconfig {bname} up")).await?;
        Ok(())
    }
}

#[async_trait]
impl Switch for IfBridge {
    fn core(&self) -> &SwitchCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut SwitchCore {
        &mut self.core
    }

    async fn start(&mut self, _controllers: &[ControllerEndpoint]) -> Result<()> {
        if self.bname.is_some() {
            return Ok(());
        }
        self.core.node.start_shell().await?;

        let env = self.core.node.env().clone();
        let bname = env.run_checked("ifconfig bridge create").await?.stdout.trim().to_owned();
        if bname.is_empty() {
            return Err(Error::Precondition("ifconfig bridge create did not name a bridge".into()));
        }

        if let Err(e) = self.configure(&env, &bname).await {
            if let Err(destroy) = env.run(&format!("ifconfig {bname} destroy")).await {
                tracing::debug!(switch = self.name(), error = %destroy, "could not destroy bridge");
            }
            return Err(e);
        }
        self.bname = Some(bname.clone());

        tracing::debug!(switch = self.name(), %bname, "started bridge");
        Ok(())
    }

    async fn connected(&self) -> bool {
        if !self.stp {
            return true;
        }
        let Some(bname) = &self.bname else {
            return false;
        };

        match self.core.cmd(&format!("ifconfig {bname}")).await {
            Ok(out) => stp::ifconfig_up(&out),
            Err(_) => false,
        }
    }

    async fn stop(&mut self, delete_intfs: bool) -> Result<()> {
        if let Some(bname) = self.bname.take() {
            self.core.teardown(&format!("ifconfig {bname} destroy")).await;
        }

        self.core.stop(delete_intfs).await
    }

    async fn dpctl(&self, args: &[&str]) -> Result<String> {
        let bname = self
            .bname
            .as_deref()
            .ok_or_else(|| Error::Precondition(format!("bridge {} has not been started", self.name())))?;

        self.core.cmd(&format!("ifconfig {bname} {}", args.join(" "))).await
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use netlab_common::{registry::STP_PRIORITY_BASE, Platform, Registry};
    use netlab_node::{mock::MockShell, Interface};

    use super::*;

    fn env(shell: &Arc<MockShell>, platform: Platform) -> Env {
        Env::new(shell.clone(), platform, Arc::new(Registry::new()))
    }

    #[tokio::test]
    async fn linux_bridge_with_stp() {
        let _ = tracing_subscriber::fmt::try_init();

        let shell = Arc::new(MockShell::new());
        let env = env(&shell, Platform::Linux);
        let mut s1 = LinuxBridge::new("s1", &SwitchOptions::default(), BridgeOptions::default().stp(true), env.clone())
            .unwrap();
        let s2 = LinuxBridge::new("s2", &SwitchOptions::default(), BridgeOptions::default(), env).unwrap();
        s1.node_mut().add_intf(Interface::new("s1-eth1"), None).unwrap();

        assert_eq!(s1.priority(), STP_PRIORITY_BASE);
        assert!(s2.priority() > s1.priority());

        s1.start(&[]).await.unwrap();

        assert!(shell.position("brctl addbr s1").unwrap() < shell.position("brctl addif s1 s1-eth1").unwrap());
        assert_eq!(shell.count(&format!("brctl setbridgeprio s1 {STP_PRIORITY_BASE}")), 1);
        assert_eq!(shell.count("brctl stp s1 on"), 1);

        shell.respond("brctl showstp s1", "s1-eth1 (1)\n state listening\n");
        assert!(!s1.connected().await);
        shell.respond("brctl showstp s1", "s1-eth1 (1)\n state forwarding\n");
        assert!(s1.connected().await);
        assert!(s2.connected().await);
    }

    #[tokio::test]
    async fn failed_construction_keeps_the_priority() {
        let shell = Arc::new(MockShell::new());
        let env = env(&shell, Platform::Linux);
        let options = BridgeOptions::default().stp(true);

        assert!(LinuxBridge::new("edge", &SwitchOptions::default(), options, env.clone()).is_err());
        let s1 = LinuxBridge::new("s1", &SwitchOptions::default(), options, env).unwrap();

        assert_eq!(s1.priority(), STP_PRIORITY_BASE);
    }

    #[tokio::test]
    async fn if_bridge_start_can_be_retried() {
        let shell = Arc::new(MockShell::new());
        shell.respond("ifconfig bridge create", "bridge0\n");
        shell.respond_times("ifconfig bridge0 vnet s1", netlab_node::Output::new(1, "", "no such jail\n"), 1);
        let switch = SwitchOptions::default().in_namespace(true);
        let mut s1 = IfBridge::new("s1", &switch, BridgeOptions::default(), env(&shell, Platform::FreeBsd)).unwrap();

        assert!(s1.start(&[]).await.is_err());
        assert_eq!(s1.bname(), None);
        assert_eq!(shell.count("ifconfig bridge0 destroy"), 1);

        s1.start(&[]).await.unwrap();

        assert_eq!(s1.bname(), Some("bridge0"));
        assert_eq!(shell.count("ifconfig bridge create"), 2);
        assert_eq!(shell.count("ifconfig bridge0 up"), 1);
    }

    #[tokio::test]
    async fn explicit_priority() {
        let shell = Arc::new(MockShell::new());
        let options = BridgeOptions::default().stp(true).with_priority(4096);
        let br = LinuxBridge::new("s1", &SwitchOptions::default(), options, env(&shell, Platform::Linux)).unwrap();

        assert_eq!(br.priority(), 4096);
    }

    #[tokio::test]
    async fn if_bridge_keeps_the_kernel_name() {
        let shell = Arc::new(MockShell::new());
        shell.respond("ifconfig bridge create", "bridge3\n");
        let options = BridgeOptions::default().stp(true);
        let mut s1 =
            IfBridge::new("s1", &SwitchOptions::default(), options, env(&shell, Platform::FreeBsd)).unwrap();
        s1.node_mut().add_intf(Interface::new("s1-eth1"), None).unwrap();
        s1.node_mut().add_intf(Interface::new("s1-eth2"), None).unwrap();

        assert!(!s1.connected().await);
        assert!(s1.dpctl(&["addr"]).await.is_err());

        s1.start(&[]).await.unwrap();

        assert_eq!(s1.bname(), Some("bridge3"));
        assert_eq!(shell.count("ifconfig bridge create"), 1);
        assert_eq!(shell.count("ifconfig bridge3 addm s1-eth1 addm s1-eth2"), 1);
        assert_eq!(shell.count("ifconfig bridge3 stp s1-eth1 stp s1-eth2"), 1);
        assert_eq!(shell.count("vnet"), 0);

        s1.stop(false).await.unwrap();
        assert_eq!(shell.count("ifconfig bridge3 destroy"), 1);
        assert_eq!(s1.bname(), None);
    }
}
