//! The OpenFlow reference user-space switch: `ofdatapath` forwards, `ofprotocol` talks to the
//! controllers.

use std::{path::PathBuf, time::Duration};

use async_trait::async_trait;
use netlab_controller::ControllerEndpoint;
use netlab_node::{Env, Interface, Process};

use crate::{base::SwitchCore, dpid, Result, Switch, SwitchOptions};

/// Datapath options used unless told otherwise.
pub const DEFAULT_DPOPTS: &str = "--no-slicing";

/// Rate of the queue the datapath's slicing sets up, in bit/s.
pub const IFSPEED: u64 = 10_000_000_000;

/// How long `ofdatapath` gets to set up its queues before they are rearranged.
const SLICING_SETTLE: Duration = Duration::from_secs(1);

/// The OpenFlow reference user-space switch: `ofdatapath` plus `ofprotocol`.
#[derive(Debug)]
pub struct UserSwitch {
    core: SwitchCore,
    dpopts: String,
    processes: Vec<Process>,
}

impl UserSwitch {
    /// Builds the switch. `dpopts` is passed to `ofdatapath` verbatim.
    pub fn new(name: &str, switch: &SwitchOptions, dpopts: Option<&str>, env: Env) -> Result<Self> {
        let mut core = SwitchCore::new(name, switch, env, dpid::USER_LEN)?;

        let listen = match core.listen_port {
            Some(port) => format!(" --listen=ptcp:{port}"),
            None => format!(" --listen=punix:/tmp/{name}.listen"),
        };
        core.opts.push_str(&listen);

        Ok(Self { core, dpopts: dpopts.unwrap_or(DEFAULT_DPOPTS).to_owned(), processes: Vec::new() })
    }

    fn slicing(&self) -> bool {
        !self.dpopts.contains("no-slicing")
    }

    fn log(&self, daemon: &str) -> PathBuf {
        PathBuf::from(format!("/tmp/{}-{daemon}.log", self.name()))
    }

    fn listen_addr(&self) -> String {
        match self.core.listen_port {
            Some(port) => format!("tcp:127.0.0.1:{port}"),
            None => format!("unix:/tmp/{}.listen", self.name()),
        }
    }

    /// Recreates the datapath's queues below the link shaping installed on `intf`.
    async fn reapply_under_shaping(&self, intf: &Interface) -> Result<()> {
        let Some(parent) = intf.apply_shaping(&self.core.node).await? else {
            return Ok(());
        };

        let dev = intf.os_name();
        let minspeed = IFSPEED / 1000;
        for cmd in [
            format!("tc qdisc add dev {dev} {parent} handle 1: htb default 0xfffe"),
            format!("tc class add dev {dev} classid 1:0xffff parent 1: htb rate {IFSPEED}"),
            format!("tc class add dev {dev} classid 1:0xfffe parent 1:0xffff htb rate {minspeed} ceil {IFSPEED}"),
        ] {
            self.core.cmd(&cmd).await?;
        }

        Ok(())
    }

    async fn kill_daemons(&mut self) {
        let name = self.name().to_owned();
        self.core.teardown(&format!("pkill -f 'ofdatapath.* punix:/tmp/{name} '")).await;
        self.core.teardown(&format!("pkill -f 'ofprotocol unix:/tmp/{name} '")).await;

        for mut process in self.processes.drain(..) {
            if let Err(e) = process.kill().await {
                tracing::debug!(switch = %name, error = %e, "user switch process already gone");
            }
        }
    }
}

fn words(s: &str) -> impl Iterator<Item = String> + '_ {
    s.split_whitespace().map(str::to_owned)
}

#[async_trait]
impl Switch for UserSwitch {
    fn core(&self) -> &SwitchCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut SwitchCore {
        &mut self.core
    }

    async fn start(&mut self, controllers: &[ControllerEndpoint]) -> Result<()> {
        if !self.processes.is_empty() {
            return Ok(());
        }
        self.core.node.start_shell().await?;

        let name = self.name().to_owned();
        let intfs: Vec<String> = self.core.data_intfs().iter().map(|i| i.os_name().to_owned()).collect();

        let mut datapath = vec!["ofdatapath".to_owned()];
        if !intfs.is_empty() {
            datapath.extend(["-i".to_owned(), intfs.join(",")]);
        }
        datapath.extend([format!("punix:/tmp/{name}"), "-d".to_owned(), self.core.dpid.to_string()]);
        datapath.extend(words(&self.dpopts));

        let targets = controllers.iter().map(|c| format!("tcp:{}:{}", c.ip, c.port)).collect::<Vec<_>>().join(",");
        let mut protocol = vec!["ofprotocol".to_owned(), format!("unix:/tmp/{name}")];
        if !targets.is_empty() {
            protocol.push(targets);
        }
        protocol.push("--fail=closed".to_owned());
        protocol.extend(words(&self.core.opts));

        let ofd = self.core.node.popen(&datapath, Some(&self.log("ofd"))).await?;
        self.processes.push(ofd);
        let ofp = self.core.node.popen(&protocol, Some(&self.log("ofp"))).await?;
        self.processes.push(ofp);

        if self.slicing() {
            tokio::time::sleep(SLICING_SETTLE).await;
            let mut sliced = Ok(());
            for intf in self.core.data_intfs() {
                sliced = self.reapply_under_shaping(intf).await;
                if sliced.is_err() {
                    break;
                }
            }
            if let Err(e) = sliced {
                self.kill_daemons().await;
                return Err(e);
            }
        }

        tracing::debug!(switch = %name, dpid = %self.core.dpid, "started user switch");
        Ok(())
    }

    async fn connected(&self) -> bool {
        match self.dpctl(&["status"]).await {
            Ok(status) => {
                status.contains("remote.is-connected=true") && status.contains("local.is-connected=true")
            }
            Err(_) => false,
        }
    }

    async fn stop(&mut self, delete_intfs: bool) -> Result<()> {
        self.kill_daemons().await;
        self.core.stop(delete_intfs).await
    }

    async fn dpctl(&self, args: &[&str]) -> Result<String> {
        self.core.cmd(&format!("dpctl {} {}", args.join(" "), self.listen_addr())).await
    }
}
