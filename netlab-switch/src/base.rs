use netlab_node::{Env, Interface, Node, NodeOptions, NodeState};

use crate::{dpid::Dpid, Result, SwitchOptions};

/// OpenFlow numbers switch ports from 1.
pub const PORT_BASE: u32 = 1;

/// State every switch variant is built around.
#[derive(Debug)]
pub struct SwitchCore {
    pub node: Node,
    pub dpid: Dpid,
    /// Extra backend options appended to the launch line.
    pub opts: String,
    pub listen_port: Option<u16>,
}

impl SwitchCore {
    /// A switch outside a namespace gets the loopback interface as its control interface.
    pub fn new(name: &str, options: &SwitchOptions, env: Env, dpid_len: usize) -> Result<Self> {
        let dpid = Dpid::resolve(options.dpid.as_deref(), name, dpid_len)?;
        let platform = env.platform;
        let mut node = Node::new(
            name,
            NodeOptions::default().in_namespace(options.in_namespace).port_base(PORT_BASE),
            env,
        );

        if !options.in_namespace {
            node.set_control_intf(Interface::loopback(platform))?;
        }

        Ok(Self { node, dpid, opts: options.opts.clone(), listen_port: options.listen_port })
    }

    /// Name of the switch.
    pub fn name(&self) -> &str {
        self.node.name()
    }

    /// Forwarding ports: everything past port 0 that carries no address.
    pub fn data_intfs(&self) -> Vec<&Interface> {
        self.node.ports().filter(|(port, intf)| *port > 0 && !intf.has_ip()).map(|(_, intf)| intf).collect()
    }

    /// Installs the saved link shaping of every interface once.
    pub async fn reapply_shaping(&self) -> Result<()> {
        for intf in self.node.intf_list() {
            intf.apply_shaping(&self.node).await?;
        }
        Ok(())
    }

    /// Runs `cmd` in the switch's node.
    pub async fn cmd(&self, cmd: &str) -> Result<String> {
        Ok(self.node.cmd(cmd).await?)
    }

    /// Runs a teardown command. Nothing to tear down, or an unreachable node, is not an error.
    pub async fn teardown(&self, cmd: &str) {
        if self.node.in_namespace() && self.node.state() != NodeState::Running {
            return;
        }
        if let Err(e) = self.node.cmd(cmd).await {
            tracing::debug!(switch = %self.name(), cmd, error = %e, "teardown command failed");
        }
    }

    /// Deletes the data interfaces if asked and releases the node.
    pub async fn stop(&mut self, delete_intfs: bool) -> Result<()> {
        if delete_intfs && (!self.node.in_namespace() || self.node.state() == NodeState::Running) {
            self.node.delete_intfs().await?;
        }
        self.node.terminate().await?;
        Ok(())
    }
}
