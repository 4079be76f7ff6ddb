//! A node that gives the emulated network a way out through the host, using `ipfw` NAT on
//! FreeBSD.
//!
//! Installing the rules rewrites the host's firewall: with `flush` set every existing `ipfw`
//! rule is dropped first.

use netlab_common::Platform;

use crate::{Env, Error, Node, NodeOptions, Result};

/// Subnet NATed when none is given.
pub const DEFAULT_SUBNET: &str = "10.0/8";

const FORWARDING: &str = "net.inet.ip.forwarding";
const DEFAULT_TO_ACCEPT: &str = "net.inet.ip.fw.default_to_accept";

/// Rule `ipfw` falls back to; removed on terminate along with the node's own rule.
const CATCH_ALL_RULE: u32 = 32000;

/// How a [`Nat`] node translates.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NatOptions {
    /// Addresses translated on the way out, in `ipfw` notation.
    pub subnet: String,
    /// Interface facing the emulated network; the node's default interface when unset.
    pub local_intf: Option<String>,
    /// Drop every existing `ipfw` rule before installing ours.
    pub flush: bool,
    /// `ipfw nat` instance number; allocated from the registry when unset.
    pub nat_id: Option<u32>,
    /// `ipfw` rule number; allocated from the registry when unset.
    pub rule: Option<u32>,
}

impl Default for NatOptions {
    fn default() -> Self {
        Self { subnet: DEFAULT_SUBNET.to_owned(), local_intf: None, flush: false, nat_id: None, rule: None }
    }
}

impl NatOptions {
    /// Sets the subnet translated on the way out.
    pub fn subnet(mut self, subnet: impl Into<String>) -> Self {
        self.subnet = subnet.into();
        self
    }

    /// Sets the interface facing the emulated network.
    pub fn local_intf(mut self, intf: impl Into<String>) -> Self {
        self.local_intf = Some(intf.into());
        self
    }

    /// Drops existing `ipfw` rules before installing ours.
    pub fn flush(mut self, flush: bool) -> Self {
        self.flush = flush;
        self
    }

    /// Pins the `ipfw nat` instance number.
    pub fn nat_id(mut self, id: u32) -> Self {
        self.nat_id = Some(id);
        self
    }

    /// Pins the `ipfw` rule number.
    pub fn rule(mut self, rule: u32) -> Self {
        self.rule = Some(rule);
        self
    }
}

/// Loads `ipfw` and `ipfw_nat` once per registry. If the firewall denies by default, it is
/// switched to accept and reloaded so that hosts can still pass traffic.
pub async fn setup(env: &Env) -> Result<()> {
    env.registry
        .ipfw_loaded()
        .get_or_try_init(|| async move {
            if env.platform != Platform::FreeBsd {
                return Err(Error::Precondition(format!("ipfw NAT is not available on {}", env.platform)));
            }

            let deny = env.run(&format!("kenv {DEFAULT_TO_ACCEPT}")).await?.stdout.trim() == "0";
            if deny {
                env.run_checked(&format!("kenv {DEFAULT_TO_ACCEPT}=1")).await?;

                if env.run("kldstat -q -m ipfw").await?.success() {
                    tracing::info!("reloading ipfw to accept by default");
                    env.run_checked("kldunload ipfw").await?;
                    env.run_checked("kldload ipfw").await?;
                }
            }

            if !env.run("kldstat -q -m ipfw_nat").await?.success() {
                tracing::info!("loading ipfw_nat");
                env.run_checked("kldload ipfw_nat").await?;
            }

            Ok::<(), Error>(())
        })
        .await?;

    Ok(())
}

/// A host-side node translating traffic from the emulated subnet.
#[derive(Debug)]
pub struct Nat {
    node: Node,
    options: NatOptions,
    nat_id: u32,
    rule: u32,
    /// Value of the forwarding sysctl before the rules went in.
    saved_forwarding: Option<String>,
}

impl Nat {
    /// Builds the node in the host's network stack. Identifiers come from the registry unless
    /// given in `options`.
    pub fn new(name: &str, options: NatOptions, env: Env) -> Self {
        let nat_id = options.nat_id.unwrap_or_else(|| env.registry.allocate_nat_id());
        let rule = options.rule.unwrap_or_else(|| env.registry.allocate_nat_rule());
        let node = Node::new(name, NodeOptions::default().in_namespace(false), env);

        Self { node, options, nat_id, rule, saved_forwarding: None }
    }

    /// The node the rules are installed from.
    pub fn node(&self) -> &Node {
        &self.node
    }

    /// Mutable access to the node, to attach interfaces.
    pub fn node_mut(&mut self) -> &mut Node {
        &mut self.node
    }

    /// The `ipfw nat` instance this node configures.
    pub fn nat_id(&self) -> u32 {
        self.nat_id
    }

    /// The `ipfw` rule number of both NAT rules.
    pub fn rule(&self) -> u32 {
        self.rule
    }

    async fn ipfw(&self, args: &str) -> Result<()> {
        self.node.cmd_checked(&format!("ipfw -q {args}")).await?;
        Ok(())
    }

    /// Saves the forwarding state, installs the NAT rules and turns forwarding on.
    #[tracing::instrument(skip(self), fields(node = %self.node.name(), nat = self.nat_id, rule = self.rule))]
    pub async fn start(&mut self) -> Result<()> {
        self.node.start_shell().await?;

        let local = match &self.options.local_intf {
            Some(intf) => intf.clone(),
            None => self.node.default_intf().map(|intf| intf.os_name().to_owned()).ok_or_else(|| {
                Error::Precondition(format!("NAT node {} has no interface to translate on", self.node.name()))
            })?,
        };

        if self.saved_forwarding.is_none() {
            let state = self.node.cmd_checked(&format!("sysctl -n {FORWARDING}")).await?;
            self.saved_forwarding = Some(state.stdout.trim().to_owned());
        }

        if self.options.flush {
            self.node.cmd_checked(&format!("sysctl {FORWARDING}=0")).await?;
            self.ipfw("flush").await?;
        }

        let (id, rule, subnet) = (self.nat_id, self.rule, &self.options.subnet);
        self.ipfw(&format!("nat {id} config if {local} reset")).await?;
        self.ipfw(&format!("add {rule} nat {id} all from {subnet} to any out")).await?;
        self.ipfw(&format!("add {rule} nat {id} all from any to any in")).await?;

        self.node.cmd_checked(&format!("sysctl {FORWARDING}=1")).await?;
        tracing::debug!(%local, "NAT rules installed");

        Ok(())
    }

    /// Removes the rules, puts forwarding back the way it was and terminates the node. Every
    /// step runs; the first error is returned.
    pub async fn terminate(&mut self) -> Result<()> {
        let mut first = None;

        for args in [format!("delete {}", self.rule), format!("delete {CATCH_ALL_RULE}")] {
            if let Err(e) = self.ipfw(&args).await {
                tracing::warn!(node = %self.node.name(), ?e, "failed to remove ipfw rule");
                first.get_or_insert(e);
            }
        }

        if let Some(state) = self.saved_forwarding.take() {
            if let Err(e) = self.node.cmd_checked(&format!("sysctl {FORWARDING}={state}")).await {
                first.get_or_insert(e);
            }
        }

        if let Err(e) = self.node.terminate().await {
            first.get_or_insert(e);
        }

        first.map_or(Ok(()), Err)
    }
}
