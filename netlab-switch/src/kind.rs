use std::{fmt, str::FromStr, sync::Arc};

use netlab_common::Platform;
use netlab_node::{deps, Env};

use crate::{
    ifswitch::LocalSwitchd, BridgeOptions, Error, IfBridge, IfSwitch, IvsSwitch, LinuxBridge, OvsBridge,
    OvsOptions, OvsSwitch, OvsVersion, Result, Switch, SwitchOptions, UserSwitch,
};

/// The switch implementations a topology can ask for by name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SwitchKind {
    /// Open vSwitch, kernel datapath.
    Ovs,
    /// Open vSwitch as a standalone learning bridge.
    OvsBridge,
    /// The OpenFlow reference user-space switch.
    User,
    /// Indigo Virtual Switch.
    Ivs,
    LinuxBridge,
    /// FreeBSD `if_bridge(4)`.
    IfBridge,
    /// OpenBSD `switch(4)`.
    IfSwitch,
}

impl fmt::Display for SwitchKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Ovs => "ovs",
            Self::OvsBridge => "ovsbr",
            Self::User => "user",
            Self::Ivs => "ivs",
            Self::LinuxBridge => "lxbr",
            Self::IfBridge => "ifbr",
            Self::IfSwitch => "ifsw",
        })
    }
}

impl SwitchKind {
    /// Parses an option name. `sysbr` and `default` depend on the platform.
    pub fn parse(name: &str, platform: Platform) -> Result<Self> {
        Ok(match name {
            "sysbr" => Self::system_bridge(platform),
            "default" => Self::default_for(platform),
            "ovs" | "ovsk" => Self::Ovs,
            "ovsbr" => Self::OvsBridge,
            "user" => Self::User,
            "ivs" => Self::Ivs,
            "lxbr" => Self::LinuxBridge,
            "ifbr" => Self::IfBridge,
            "ifsw" => Self::IfSwitch,
            other => return Err(Error::UnknownKind(other.to_owned())),
        })
    }

    /// The kernel bridge native to `platform`.
    pub const fn system_bridge(platform: Platform) -> Self {
        match platform {
            Platform::Linux => Self::LinuxBridge,
            Platform::FreeBsd => Self::IfBridge,
            Platform::OpenBsd => Self::IfSwitch,
        }
    }

    /// The backend used when none is asked for.
    pub const fn default_for(platform: Platform) -> Self {
        match platform {
            Platform::Linux | Platform::FreeBsd => Self::Ovs,
            Platform::OpenBsd => Self::IfSwitch,
        }
    }

    /// Checks the backend's dependencies once, before any switch of this kind is built.
    #[tracing::instrument(skip(env), fields(platform = %env.platform))]
    pub async fn setup(self, env: &Env) -> Result<SetupInfo> {
        let mut info = SetupInfo::default();

        match self {
            Self::Ovs | Self::OvsBridge => info.ovs_version = Some(setup_ovs(env).await?),
            Self::User => {
                deps::path_check(env, &["ofdatapath", "ofprotocol"], "the OpenFlow reference user switch").await?;
                if env.platform == Platform::Linux {
                    deps::ensure_tun(env).await?;
                }
            }
            Self::Ivs => {
                deps::path_check(env, &["ivs-ctl", "ivs"], "Indigo Virtual Switch (projectfloodlight.org)").await?;
                let output = env.run("ivs-ctl show").await?;
                if !output.success() {
                    return Err(Error::Precondition(format!(
                        "{}ivs-ctl exited with code {}\nthe openvswitch kernel module might not be loaded; try modprobe openvswitch",
                        output.combined(),
                        output.code().unwrap_or(-1),
                    )));
                }
            }
            Self::LinuxBridge => {
                deps::path_check(env, &["brctl"], "bridge-utils").await?;
                for table in ["arp", "ip", "ip6"] {
                    let out = env.run(&format!("sysctl net.bridge.bridge-nf-call-{table}tables")).await?;
                    let value = out.stdout.trim();
                    if value.ends_with('1') {
                        tracing::warn!(setting = value, "Linux bridge may not work with bridge firewalling on");
                    }
                }
            }
            Self::IfBridge => {
                if !env.run("kldstat -q -m if_bridge").await?.success() {
                    tracing::info!("loading if_bridge");
                    env.run_checked("kldload if_bridge").await?;
                }
            }
            Self::IfSwitch => {
                deps::path_check(env, &["switchctl"], "switchctl").await?;
                info.local_switchd = Some(Arc::new(LocalSwitchd::new()));
            }
        }

        tracing::debug!(kind = %self, "switch setup complete");
        Ok(info)
    }

    /// Builds a switch of this kind with the backend's default options.
    pub fn build(self, name: &str, switch: &SwitchOptions, env: Env, info: &SetupInfo) -> Result<Box<dyn Switch>> {
        let ovs_version = || {
            info.ovs_version.ok_or_else(|| Error::Precondition(format!("{self} switches need setup to run first")))
        };

        Ok(match self {
            Self::Ovs => Box::new(OvsSwitch::new(name, switch, OvsOptions::default(), env, ovs_version()?)?),
            Self::OvsBridge => Box::new(OvsBridge::new(name, switch, OvsOptions::default(), env, ovs_version()?)?),
            Self::User => Box::new(UserSwitch::new(name, switch, None, env)?),
            Self::Ivs => Box::new(IvsSwitch::new(name, switch, false, env)?),
            Self::LinuxBridge => Box::new(LinuxBridge::new(name, switch, BridgeOptions::default(), env)?),
            Self::IfBridge => Box::new(IfBridge::new(name, switch, BridgeOptions::default(), env)?),
            Self::IfSwitch => {
                let local = info.local_switchd.clone().unwrap_or_default();
                Box::new(IfSwitch::new(name, switch, env, local)?)
            }
        })
    }
}

impl FromStr for SwitchKind {
    type Err = Error;

    /// Platform-independent names only; use [`SwitchKind::parse`] for `sysbr` and `default`.
    fn from_str(s: &str) -> Result<Self> {
        match s {
            "sysbr" | "default" => Err(Error::UnknownKind(format!("{s} depends on the platform"))),
            other => Self::parse(other, Platform::Linux),
        }
    }
}

/// What [`SwitchKind::setup`] learned.
#[derive(Debug, Clone, Default)]
pub struct SetupInfo {
    pub ovs_version: Option<OvsVersion>,
    /// Shared by every `switch(4)` device.
    pub local_switchd: Option<Arc<LocalSwitchd>>,
}

async fn setup_ovs(env: &Env) -> Result<OvsVersion> {
    deps::path_check(env, &["ovs-vsctl"], "Open vSwitch (openvswitch.org)").await?;

    let output = env.run("ovs-vsctl -t 1 show").await?;
    if !output.success() {
        return Err(Error::Precondition(format!(
            "{}ovs-vsctl exited with code {}\nerror connecting to ovs-db with ovs-vsctl\n\
             make sure that Open vSwitch is installed, that ovsdb-server is running, and that \
             \"ovs-vsctl show\" works correctly. You may wish to try the following:\n\n{}",
            output.combined(),
            output.code().unwrap_or(-1),
            env.platform.ovs_start_hint(),
        )));
    }

    let version = env.run("ovs-vsctl --version").await?;
    let version = OvsVersion::parse(&version.stdout)
        .ok_or_else(|| Error::Precondition(format!("cannot parse ovs-vsctl --version: {}", version.stdout.trim())))?;

    tracing::debug!(%version, "found Open vSwitch");
    Ok(version)
}
