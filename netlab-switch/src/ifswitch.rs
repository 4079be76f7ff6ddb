//! OpenBSD `switch(4)` devices, driven through `switchctl(8)`.

use std::sync::Arc;

use async_trait::async_trait;
use netlab_controller::{Controller, ControllerEndpoint, Switchd, SwitchdOptions, LEGACY_PORT};
use netlab_node::{Env, Isolation};
use tokio::sync::Mutex;

use crate::{base::SwitchCore, dpid, Error, Result, Switch, SwitchOptions};

/// Name of the local forwarding `switchd`.
pub const LOCAL_SWITCHD: &str = "lc0";

#[derive(Debug, Default)]
struct LocalState {
    switchd: Option<Switchd>,
    users: usize,
}

/// The `switchd` that forwards to remote controllers, shared by every `switch(4)` device.
/// Started by the first switch that needs it and stopped when the last one lets go.
#[derive(Debug, Default)]
pub struct LocalSwitchd {
    state: Mutex<LocalState>,
}

impl LocalSwitchd {
    /// A `switchd` that is not running yet.
    pub fn new() -> Self {
        Self::default()
    }

    async fn acquire(&self, env: &Env) -> Result<()> {
        let mut state = self.state.lock().await;
        if state.switchd.is_none() {
            let options = SwitchdOptions::default().with_port(LEGACY_PORT);
            let mut switchd = Switchd::new(LOCAL_SWITCHD, options, env.clone()).await?;
            switchd.start().await?;
            state.switchd = Some(switchd);
        }
        state.users += 1;
        Ok(())
    }

    async fn release(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        state.users = state.users.saturating_sub(1);
        if state.users == 0 {
            if let Some(mut switchd) = state.switchd.take() {
                switchd.stop().await?;
            }
        }
        Ok(())
    }

    /// Whether the daemon is up.
    pub async fn is_running(&self) -> bool {
        self.state.lock().await.switchd.is_some()
    }
}

/// An OpenBSD `switch(4)` device driven through `switchctl`.
#[derive(Debug)]
pub struct IfSwitch {
    core: SwitchCore,
    bname: String,
    cdev: String,
    new_cdev: bool,
    created: bool,
    local: Arc<LocalSwitchd>,
    uses_local: bool,
}

impl IfSwitch {
    /// Takes the next `switch(4)` unit from the registry.
    pub fn new(name: &str, switch: &SwitchOptions, env: Env, local: Arc<LocalSwitchd>) -> Result<Self> {
        let unit = env.registry.allocate_switch_unit();
        let core = SwitchCore::new(name, switch, env, dpid::DEFAULT_LEN)?;
        let bname = format!("switch{unit}");

        Ok(Self {
            core,
            cdev: format!("/dev/{bname}"),
            bname,
            new_cdev: false,
            created: false,
            local,
            uses_local: false,
        })
    }

    /// Device name, e.g. `switch0`.
    pub fn bname(&self) -> &str {
        &self.bname
    }

    fn env(&self) -> &Env {
        self.core.node.env()
    }

    fn rdomain_arg(&self) -> String {
        match self.core.node.isolation() {
            Some(Isolation::Rdomain { id }) if self.core.node.in_namespace() => format!(" rdomain {id}"),
            _ => String::new(),
        }
    }

    async fn cdev_exists(&self) -> Result<bool> {
        Ok(self.env().run(&format!("test -c {}", self.cdev)).await?.success())
    }

    /// Adds the ports to a freshly created device and connects it.
    async fn configure(&mut self, env: &Env, controllers: &[ControllerEndpoint]) -> Result<()> {
        let rdarg = self.rdomain_arg();

        let mut add = String::new();
        let ports: Vec<String> = self
            .core
            .node
            .intf_list()
            .filter_map(|i| i.realname.clone())
            .filter(|realname| realname.contains("pair"))
            .collect();
        for realname in ports {
            add.push_str(&format!(" add {realname}"));
            env.run(&format!("ifconfig {realname}{rdarg} up")).await?;
        }
        env.run(&format!("ifconfig {}{add}", self.bname)).await?;

        if !self.cdev_exists().await? {
            env.run(&format!("cd /dev && ./MAKEDEV {}", self.bname)).await?;
            self.new_cdev = true;
        }
        if !self.cdev_exists().await? {
            tracing::error!(switch = self.name(), cdev = %self.cdev, "can't connect to controller");
            return Err(Error::Precondition(format!("can't connect to controller: {} doesn't exist", self.cdev)));
        }

        let mut connect = format!("switchctl connect {}", self.cdev);
        if let Some(remote) = controllers.first().filter(|c| c.remote) {
            connect.push_str(&format!(" forward-to {}:{}", remote.ip, remote.port));
            if !self.uses_local {
                self.local.acquire(env).await?;
                self.uses_local = true;
            }
        }
        env.run_checked(&connect).await?;

        Ok(())
    }
}

#[async_trait]
impl Switch for IfSwitch {
    fn core(&self) -> &SwitchCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut SwitchCore {
        &mut self.core
    }

    async fn start(&mut self, controllers: &[ControllerEndpoint]) -> Result<()> {
        if self.created {
            return Ok(());
        }
        self.core.node.start_shell().await?;

        let env = self.env().clone();
        env.run(&format!(
            "ifconfig {} create datapath 0x{}{} description \"{}\" up",
            self.bname,
            self.core.dpid,
            self.rdomain_arg(),
            self.name()
        ))
        .await?;

        if let Err(e) = self.configure(&env, controllers).await {
            if let Err(destroy) = env.run(&format!("ifconfig {} destroy", self.bname)).await {
                tracing::debug!(switch = self.name(), error = %destroy, "could not destroy switch device");
            }
            if self.uses_local {
                self.uses_local = false;
                self.local.release().await?;
            }
            return Err(e);
        }

        self.created = true;
        Ok(())
    }

    async fn connected(&self) -> bool {
        match self.core.cmd("ifconfig switch").await {
            Ok(out) => out.contains(&self.bname),
            Err(_) => false,
        }
    }

    async fn stop(&mut self, delete_intfs: bool) -> Result<()> {
        let env = self.env().clone();

        if self.created {
            if let Err(e) = env.run(&format!("ifconfig {} destroy", self.bname)).await {
                tracing::debug!(switch = self.name(), error = %e, "could not destroy switch device");
            }
            self.created = false;
        }
        if self.uses_local {
            self.uses_local = false;
            self.local.release().await?;
        }
        if self.new_cdev {
            env.run(&format!("rm {}", self.cdev)).await?;
            self.new_cdev = false;
        }

        self.core.stop(delete_intfs).await
    }

    async fn dpctl(&self, args: &[&str]) -> Result<String> {
        self.core.cmd(&format!("switchctl {}", args.join(" "))).await
    }
}

#[cfg(test)]
mod tests {
    use netlab_common::{Platform, Registry};
    use netlab_node::{mock::MockShell, Interface};

    use super::*;

    fn env(shell: &Arc<MockShell>) -> Env {
        Env::new(shell.clone(), Platform::OpenBsd, Arc::new(Registry::new()))
    }

    #[tokio::test]
    async fn units_come_from_the_registry() {
        let shell = Arc::new(MockShell::new());
        let env = env(&shell);
        let local = Arc::new(LocalSwitchd::new());

        let s1 = IfSwitch::new("s1", &SwitchOptions::default(), env.clone(), local.clone()).unwrap();
        let s2 = IfSwitch::new("s2", &SwitchOptions::default(), env, local).unwrap();

        assert_eq!(s1.bname(), "switch0");
        assert_eq!(s2.bname(), "switch1");
    }

    #[tokio::test]
    async fn start_adds_pair_ports_and_connects() {
        let _ = tracing_subscriber::fmt::try_init();

        let shell = Arc::new(MockShell::new());
        let mut s1 =
            IfSwitch::new("s1", &SwitchOptions::default(), env(&shell), Arc::new(LocalSwitchd::new())).unwrap();
        s1.node_mut().add_intf(Interface::new("s1-eth1").with_realname("pair4"), None).unwrap();

        let c0 = ControllerEndpoint::new("c0", "127.0.0.1".parse().unwrap(), 6653);
        s1.start(&[c0]).await.unwrap();

        assert_eq!(shell.count("ifconfig switch0 create datapath 0x0000000000000001 description \"s1\" up"), 1);
        assert_eq!(shell.count("ifconfig switch0 add pair4"), 1);
        assert_eq!(shell.count("switchctl connect /dev/switch0"), 1);
        assert_eq!(shell.count("MAKEDEV"), 0);

        s1.stop(true).await.unwrap();
        assert_eq!(shell.count("ifconfig switch0 destroy"), 1);
    }

    #[tokio::test]
    async fn missing_device_is_created_then_removed() {
        let shell = Arc::new(MockShell::new());
        shell.respond_times("test -c /dev/switch0", netlab_node::Output::new(1, "", ""), 1);
        let mut s1 =
            IfSwitch::new("s1", &SwitchOptions::default(), env(&shell), Arc::new(LocalSwitchd::new())).unwrap();

        s1.start(&[]).await.unwrap();
        assert_eq!(shell.count("cd /dev && ./MAKEDEV switch0"), 1);

        s1.stop(false).await.unwrap();
        assert_eq!(shell.count("rm /dev/switch0"), 1);
    }

    #[tokio::test]
    async fn failed_start_can_be_retried() {
        let shell = Arc::new(MockShell::new());
        shell.respond_times("test -c /dev/switch0", netlab_node::Output::new(1, "", ""), 2);
        let mut s1 =
            IfSwitch::new("s1", &SwitchOptions::default(), env(&shell), Arc::new(LocalSwitchd::new())).unwrap();

        assert!(matches!(s1.start(&[]).await, Err(Error::Precondition(_))));
        assert_eq!(shell.count("ifconfig switch0 destroy"), 1);
        assert_eq!(shell.count("switchctl connect"), 0);

        s1.start(&[]).await.unwrap();

        assert_eq!(shell.count("ifconfig switch0 create"), 2);
        assert_eq!(shell.count("switchctl connect /dev/switch0"), 1);

        s1.stop(true).await.unwrap();
        assert_eq!(shell.count("ifconfig switch0 destroy"), 2);
        assert_eq!(shell.count("rm /dev/switch0"), 1);
    }

    #[tokio::test]
    async fn remote_controllers_share_one_local_switchd() {
        let shell = Arc::new(MockShell::new());
        shell.respond("which switchd", "/usr/sbin/switchd\n");
        let env = env(&shell);
        let local = Arc::new(LocalSwitchd::new());

        let mut s1 = IfSwitch::new("s1", &SwitchOptions::default(), env.clone(), local.clone()).unwrap();
        let mut s2 = IfSwitch::new("s2", &SwitchOptions::default(), env, local.clone()).unwrap();
        let c0 = ControllerEndpoint::new("c0", "192.0.2.10".parse().unwrap(), 6653).remote();

        s1.start(&[c0.clone()]).await.unwrap();
        s2.start(&[c0]).await.unwrap();

        assert_eq!(shell.count("switchctl connect /dev/switch0 forward-to 192.0.2.10:6653"), 1);
        assert_eq!(shell.count("switchd -f"), 1);
        assert!(local.is_running().await);

        s1.stop(true).await.unwrap();
        assert!(local.is_running().await);
        s2.stop(true).await.unwrap();
        assert!(!local.is_running().await);
    }

    #[tokio::test]
    async fn stop_without_start() {
        let shell = Arc::new(MockShell::new());
        let mut s1 =
            IfSwitch::new("s1", &SwitchOptions::default(), env(&shell), Arc::new(LocalSwitchd::new())).unwrap();

        assert!(!s1.connected().await);
        s1.stop(true).await.unwrap();
        assert_eq!(shell.count("destroy"), 0);
    }
}
