#![cfg_attr(docsrs, feature(doc_cfg, doc_auto_cfg))]

//! Process-based software-defined network emulation on a single host.
//!
//! Each member crate is re-exported under its own name, and the types a topology builder needs
//! most are re-exported at the root. Everything is built from an [`Env`]: the [`Shell`] commands
//! run through, the detected [`Platform`] and the [`Registry`] of per-topology counters.
//!
//! ```no_run
//! use netlab::{Env, Switch, SwitchKind, SwitchOptions};
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let env = Env::host()?;
//! let kind = SwitchKind::parse("default", env.platform)?;
//! let info = kind.setup(&env).await?;
//!
//! let mut s1 = kind.build("s1", &SwitchOptions::default(), env, &info)?;
//! s1.start(&[]).await?;
//! s1.stop(true).await?;
//! # Ok(())
//! # }
//! ```

pub use netlab_common as common;
pub use netlab_controller as controller;
pub use netlab_limit as limit;
pub use netlab_node as node;
pub use netlab_switch as switch;

pub use netlab_common::{Platform, Registry, Retry};
pub use netlab_controller::{
    find_controller, Controller, ControllerEndpoint, ControllerKind, ControllerSettings,
};
pub use netlab_limit::{CpuLimiter, HostLimits, LimitedHost, Sched};
pub use netlab_node::{
    make_intf_pair, sysctl::fix_limits, Env, Interface, LinkShaping, Nat, NatOptions, Node,
    NodeOptions, PairSpec, Shell,
};
pub use netlab_switch::{
    batch_shutdown, batch_startup, BatchReport, SetupInfo, Switch, SwitchKind, SwitchOptions,
};
