#![cfg_attr(docsrs, feature(doc_cfg, doc_auto_cfg))]

//! Emulated nodes and the plumbing around them.
//!
//! A [`Node`] is a long-lived holder process (a namespace on Linux, a jail on FreeBSD, a routing
//! domain on OpenBSD) plus the interfaces attached to it. Every command runs through a [`Shell`]
//! in the node's [`ExecContext`], so the whole crate can be driven by a recording shell in tests.

use std::{io, sync::Arc};

use netlab_common::{Platform, Registry, RetryError};

pub mod command;
pub mod deps;
pub mod intf;
#[cfg(any(test, feature = "test-utils"))]
pub mod mock;
pub mod nat;
pub mod node;
pub mod pair;
pub mod shaping;
pub mod sysctl;

pub use command::{Capture, ExecContext, HostShell, Isolation, Output, Process, Shell};
pub use intf::Interface;
pub use nat::{Nat, NatOptions};
pub use node::{Node, NodeOptions, NodeState};
pub use pair::{make_intf_pair, IntfPair, PairSpec};
pub use shaping::LinkShaping;

/// Errors from nodes, interfaces and the commands run for them.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error(transparent)]
    Command(#[from] command::Error),
    #[error(transparent)]
    Platform(#[from] netlab_common::platform::Error),
    #[error("node {0} has not been started")]
    NotStarted(String),
    #[error("node {0} has been terminated")]
    Terminated(String),
    #[error("node {node} is already waiting on a command")]
    Busy { node: String },
    #[error("node {node} has no pending command")]
    NothingPending { node: String },
    #[error("node {node} has no interface {intf}")]
    UnknownIntf { node: String, intf: String },
    #[error("port {port} of node {node} is already in use")]
    PortInUse { node: String, port: u32 },
    #[error("node {node} already has an interface named {intf}")]
    DuplicateIntf { node: String, intf: String },
    #[error("error creating interface pair ({first},{second}): {output}")]
    IntfPair { first: String, second: String, output: String },
    #[error("could not move {intf} into {node}")]
    MoveIntf {
        intf: String,
        node: String,
        #[source]
        source: RetryError<String>,
    },
    #[error("cannot find required executable {executable}; please make sure that {module} is installed and available in your $PATH ({path})")]
    MissingExecutable { executable: String, module: String, path: String },
    #[error("{0}")]
    Precondition(String),
}

/// Result alias for node operations.
pub type Result<T> = std::result::Result<T, Error>;

/// The collaborators every node, switch and controller is built with.
#[derive(Debug, Clone)]
pub struct Env {
    pub shell: Arc<dyn Shell>,
    pub platform: Platform,
    pub registry: Arc<Registry>,
}

impl Env {
    /// Bundles the collaborators.
    pub fn new(shell: Arc<dyn Shell>, platform: Platform, registry: Arc<Registry>) -> Self {
        Self { shell, platform, registry }
    }

    /// Real processes on the detected platform, with a fresh registry.
    pub fn host() -> Result<Self> {
        let platform = Platform::detect()?;
        Ok(Self::new(Arc::new(HostShell::new(platform)), platform, Arc::new(Registry::new())))
    }

    /// Runs `cmd` on the host and returns its output, whatever the exit status.
    pub async fn run(&self, cmd: &str) -> Result<Output> {
        Ok(self.shell.exec(&ExecContext::host(), cmd).await?)
    }

    /// Runs `cmd` on the host and fails on a non-zero exit status.
    pub async fn run_checked(&self, cmd: &str) -> Result<Output> {
        Ok(self.run(cmd).await?.into_result(cmd)?)
    }
}
