#![cfg_attr(docsrs, feature(doc_cfg, doc_auto_cfg))]

//! OpenFlow controllers: the reference and third-party controllers run as processes, remote
//! controllers that are only probed, and OpenBSD's `switchd(8)`.

use std::io;

use async_trait::async_trait;

pub mod endpoint;
pub mod frameworks;
pub mod kind;
pub mod probe;
pub mod process;
pub mod remote;
pub mod switchd;

pub use endpoint::{ControllerEndpoint, Protocol, DEFAULT_PORT, LEGACY_PORT};
pub use kind::{find_controller, ControllerKind, ControllerSettings};
pub use process::{ControllerOptions, ProcessController};
pub use remote::RemoteController;
pub use switchd::{Switchd, SwitchdOptions};

/// Errors from starting, probing or stopping controllers.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Node(#[from] netlab_node::Error),
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("please shut down the controller which is running on port {port}:\n{listeners}")]
    PortInUse { port: u16, listeners: String },
    #[error("invalid controller address: {0}")]
    InvalidAddress(String),
    #[error("unknown controller kind: {0}")]
    UnknownKind(String),
    #[error("{0}")]
    Precondition(String),
}

/// Result alias for controller operations.
pub type Result<T> = std::result::Result<T, Error>;

/// A controller switches connect to.
#[async_trait]
pub trait Controller: Send + Sync + std::fmt::Debug {
    fn name(&self) -> &str;

    fn endpoint(&self) -> &ControllerEndpoint;

    /// Starts the controller. Starting a running controller does nothing.
    async fn start(&mut self) -> Result<()>;

    /// Stops the controller. Safe to call on one that never started.
    async fn stop(&mut self) -> Result<()>;

    /// Whether the controller accepts connections right now.
    async fn is_listening(&self) -> bool {
        probe::is_listening(self.endpoint().socket_addr(), probe::PROBE_TIMEOUT).await
    }
}
