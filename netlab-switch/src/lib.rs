#![cfg_attr(docsrs, feature(doc_cfg, doc_auto_cfg))]

//! Switches and bridges.
//!
//! Every backend implements [`Switch`] on top of a [`SwitchCore`], which owns the switch's node,
//! its datapath id and its launch options. Backends differ in what `start` and `stop` drive: an
//! `ovs-vsctl` transaction, a pair of user-space daemons, a kernel bridge or an OpenBSD
//! `switch(4)` device. Open vSwitch switches can also queue their configuration and have it
//! replayed in bulk by [`batch_startup`].

use std::{fmt, str::FromStr};

use async_trait::async_trait;
use netlab_controller::ControllerEndpoint;
use netlab_node::Node;

pub mod base;
pub mod batch;
pub mod bridge;
pub mod dpid;
pub mod ifswitch;
pub mod ivs;
pub mod kind;
pub mod ovs;
pub mod stp;
pub mod user;

pub use base::SwitchCore;
pub use batch::{batch_shutdown, batch_startup, BatchReport, ARGMAX};
pub use bridge::{BridgeOptions, IfBridge, LinuxBridge};
pub use dpid::Dpid;
pub use ifswitch::IfSwitch;
pub use ivs::IvsSwitch;
pub use kind::{SetupInfo, SwitchKind};
pub use ovs::{CommandMode, Datapath, OvsBridge, OvsOptions, OvsSwitch, OvsVersion};
pub use user::UserSwitch;

/// Errors from building, starting and stopping switches.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Node(#[from] netlab_node::Error),
    #[error(transparent)]
    Controller(#[from] netlab_controller::Error),
    #[error("invalid datapath id {0}")]
    InvalidDpid(String),
    #[error("unable to derive default datapath ID for {name}; please either specify a dpid or use a canonical switch name such as s23")]
    NoDpid { name: String },
    #[error("{switch}: OVS kernel switch does not work in a namespace")]
    InNamespace { switch: String },
    #[error("{switch} does not support {op}")]
    Unsupported { switch: String, op: &'static str },
    #[error("ovs-vsctl subcommand of {len} bytes does not fit a command line bound of {argmax}")]
    TooLong { len: usize, argmax: usize },
    #[error("unknown switch kind: {0}")]
    UnknownKind(String),
    #[error("{0}")]
    Precondition(String),
}

/// Result alias for switch operations.
pub type Result<T> = std::result::Result<T, Error>;

/// What a switch does when it loses its controllers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum FailMode {
    /// Drop traffic no flow matches.
    #[default]
    Secure,
    /// Fall back to learning-switch forwarding.
    Standalone,
}

impl fmt::Display for FailMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Secure => "secure",
            Self::Standalone => "standalone",
        })
    }
}

impl FromStr for FailMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "secure" => Ok(Self::Secure),
            "standalone" => Ok(Self::Standalone),
            other => Err(Error::Precondition(format!("unknown fail mode {other}"))),
        }
    }
}

/// Options common to every switch backend.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SwitchOptions {
    /// Hex datapath id; derived from the name when unset.
    pub dpid: Option<String>,
    /// Extra backend options.
    pub opts: String,
    /// Port to accept management connections on (e.g. from `dpctl`).
    pub listen_port: Option<u16>,
    pub in_namespace: bool,
}

impl SwitchOptions {
    /// Sets the datapath id explicitly, as hex.
    pub fn with_dpid(mut self, dpid: impl Into<String>) -> Self {
        self.dpid = Some(dpid.into());
        self
    }

    /// Extra backend options, appended verbatim.
    pub fn with_opts(mut self, opts: impl Into<String>) -> Self {
        self.opts = opts.into();
        self
    }

    /// Port for passive OpenFlow connections.
    pub fn with_listen_port(mut self, port: u16) -> Self {
        self.listen_port = Some(port);
        self
    }

    /// Gives the switch its own network stack.
    pub fn in_namespace(mut self, in_namespace: bool) -> Self {
        self.in_namespace = in_namespace;
        self
    }
}

/// A switch backend.
#[async_trait]
pub trait Switch: Send + Sync + fmt::Debug {
    fn core(&self) -> &SwitchCore;

    fn core_mut(&mut self) -> &mut SwitchCore;

    fn name(&self) -> &str {
        self.core().name()
    }

    fn dpid(&self) -> &Dpid {
        &self.core().dpid
    }

    fn node(&self) -> &Node {
        &self.core().node
    }

    fn node_mut(&mut self) -> &mut Node {
        &mut self.core_mut().node
    }

    /// Brings the datapath up, wires its data ports and points it at `controllers`.
    async fn start(&mut self, controllers: &[ControllerEndpoint]) -> Result<()>;

    /// Whether the switch is connected to a controller (or forwarding on its own). Asks the
    /// backend every time and never fails; a switch that cannot be asked is not connected.
    async fn connected(&self) -> bool {
        tracing::debug!(switch = self.name(), "assuming switch is connected");
        true
    }

    /// Tears the datapath down. Safe on a switch that never started.
    async fn stop(&mut self, delete_intfs: bool) -> Result<()>;

    /// Adds `intf` as a data port of a running switch.
    async fn attach(&mut self, _intf: &str) -> Result<()> {
        Err(Error::Unsupported { switch: self.name().to_owned(), op: "attach" })
    }

    /// Removes data port `intf` from a running switch.
    async fn detach(&mut self, _intf: &str) -> Result<()> {
        Err(Error::Unsupported { switch: self.name().to_owned(), op: "detach" })
    }

    /// Runs the backend's datapath inspection tool with `args`.
    async fn dpctl(&self, args: &[&str]) -> Result<String>;
}
