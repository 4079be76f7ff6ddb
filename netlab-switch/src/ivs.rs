use std::path::PathBuf;

use async_trait::async_trait;
use netlab_controller::ControllerEndpoint;
use netlab_node::{Env, Process};

use crate::{base::SwitchCore, dpid, Error, Result, Switch, SwitchOptions};

/// Indigo Virtual Switch. Everything is configured on the `ivs` command line.
#[derive(Debug)]
pub struct IvsSwitch {
    core: SwitchCore,
    verbose: bool,
    process: Option<Process>,
}

impl IvsSwitch {
    /// Builds the switch. `verbose` turns on `ivs` debug logging.
    pub fn new(name: &str, switch: &SwitchOptions, verbose: bool, env: Env) -> Result<Self> {
        let core = SwitchCore::new(name, switch, env, dpid::DEFAULT_LEN)?;
        Ok(Self { core, verbose, process: None })
    }

    /// The `ivs` launch line.
    pub fn argv(&self, controllers: &[ControllerEndpoint]) -> Vec<String> {
        let mut args = vec![
            "ivs".to_owned(),
            "--name".to_owned(),
            self.name().to_owned(),
            "--dpid".to_owned(),
            self.core.dpid.to_string(),
        ];
        if self.verbose {
            args.push("--verbose".to_owned());
        }
        for intf in self.core.node.intf_list().filter(|intf| !intf.has_ip()) {
            args.extend(["-i".to_owned(), intf.os_name().to_owned()]);
        }
        for c in controllers {
            args.extend(["-c".to_owned(), format!("{}:{}", c.ip, c.port)]);
        }
        if let Some(port) = self.core.listen_port {
            args.extend(["--listen".to_owned(), format!("127.0.0.1:{port}")]);
        }
        args.extend(self.core.opts.split_whitespace().map(str::to_owned));
        args
    }
}

#[async_trait]
impl Switch for IvsSwitch {
    fn core(&self) -> &SwitchCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut SwitchCore {
        &mut self.core
    }

    async fn start(&mut self, controllers: &[ControllerEndpoint]) -> Result<()> {
        if self.process.is_some() {
            return Ok(());
        }
        self.core.node.start_shell().await?;

        let log = PathBuf::from(format!("/tmp/ivs.{}.log", self.name()));
        let process = self.core.node.popen(&self.argv(controllers), Some(&log)).await?;
        self.process = Some(process);

        Ok(())
    }

    async fn stop(&mut self, delete_intfs: bool) -> Result<()> {
        if let Some(mut process) = self.process.take() {
            if let Err(e) = process.kill().await {
                tracing::debug!(switch = self.name(), error = %e, "ivs already gone");
            }
        }

        self.core.stop(delete_intfs).await
    }

    async fn attach(&mut self, intf: &str) -> Result<()> {
        self.core.cmd(&format!("ivs-ctl add-port --datapath {} {intf}", self.name())).await?;
        Ok(())
    }

    async fn detach(&mut self, intf: &str) -> Result<()> {
        self.core.cmd(&format!("ivs-ctl del-port --datapath {} {intf}", self.name())).await?;
        Ok(())
    }

    async fn dpctl(&self, args: &[&str]) -> Result<String> {
        let Some(port) = self.core.listen_port else {
            return Err(Error::Unsupported { switch: self.name().to_owned(), op: "dpctl without a listening port" });
        };

        self.core.cmd(&format!("ovs-ofctl {} tcp:127.0.0.1:{port}", args.join(" "))).await
    }
}
