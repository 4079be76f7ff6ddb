use std::{fmt, net::IpAddr, str::FromStr};

use netlab_common::Platform;
use netlab_node::{deps, Env};

use crate::{
    endpoint::DEFAULT_IP,
    frameworks::{self, find_ovs_controller},
    switchd::{Switchd, SwitchdOptions},
    Controller, ControllerOptions, Error, ProcessController, RemoteController, Result,
};

/// The controller implementations a topology can ask for by name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ControllerKind {
    /// The OpenFlow reference controller.
    Ref,
    /// The Open vSwitch test controller.
    Ovsc,
    Nox,
    Ryu,
    Remote,
    /// OpenBSD's `switchd(8)`.
    Switchd,
    /// The first available of the platform's defaults.
    Default,
    None,
}

impl fmt::Display for ControllerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Ref => "ref",
            Self::Ovsc => "ovsc",
            Self::Nox => "nox",
            Self::Ryu => "ryu",
            Self::Remote => "remote",
            Self::Switchd => "swd",
            Self::Default => "default",
            Self::None => "none",
        })
    }
}

impl FromStr for ControllerKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Ok(match s {
            "ref" => Self::Ref,
            "ovsc" => Self::Ovsc,
            "nox" => Self::Nox,
            "ryu" => Self::Ryu,
            "remote" => Self::Remote,
            "swd" => Self::Switchd,
            "default" => Self::Default,
            "none" => Self::None,
            other => return Err(Error::UnknownKind(other.to_owned())),
        })
    }
}

/// Address and launch arguments shared by every kind. `args` are NOX modules or Ryu apps for
/// those kinds and replace the launch arguments of the others.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ControllerSettings {
    pub ip: Option<IpAddr>,
    pub port: Option<u16>,
    pub args: Vec<String>,
}

impl ControllerSettings {
    /// Parses `ip` or `ip:port`.
    pub fn with_address(mut self, address: &str) -> Result<Self> {
        let (ip, port) = crate::endpoint::parse_address(address)?;
        self.ip = Some(ip);
        self.port = port.or(self.port);
        Ok(self)
    }

    /// Extra arguments for the controller command line.
    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    fn apply(&self, mut options: ControllerOptions, replace_args: bool) -> ControllerOptions {
        if let Some(ip) = self.ip {
            options.ip = ip;
        }
        if let Some(port) = self.port {
            options.port = port;
        }
        if replace_args && !self.args.is_empty() {
            options.args = self.args.clone();
        }
        options
    }
}

impl ControllerKind {
    /// Kinds tried, in order, when [`ControllerKind::Default`] is requested.
    pub const fn defaults_for(platform: Platform) -> &'static [Self] {
        match platform {
            Platform::Linux => &[Self::Ref, Self::Ovsc],
            Platform::FreeBsd => &[Self::Ryu],
            Platform::OpenBsd => &[Self::Switchd],
        }
    }

    /// Whether the kind's executable (or environment) is present.
    pub async fn is_available(self, env: &Env) -> Result<bool> {
        Ok(match self {
            Self::Ref => deps::which(env, "controller").await?.is_some(),
            Self::Ovsc => find_ovs_controller(env).await?.is_some(),
            Self::Nox => std::env::var_os("NOX_CORE_DIR").is_some(),
            Self::Ryu => deps::which(env, "ryu-manager").await?.is_some(),
            Self::Switchd => deps::which(env, "switchd").await?.is_some(),
            Self::Remote => true,
            Self::Default | Self::None => false,
        })
    }

    /// Builds a controller of this kind. `None` yields no controller; `Default` resolves to the
    /// first available platform default.
    pub async fn build(
        self,
        name: &str,
        env: Env,
        settings: &ControllerSettings,
    ) -> Result<Option<Box<dyn Controller>>> {
        let kind = match self {
            Self::Default => find_controller(&env).await?.unwrap_or(Self::Default),
            kind => kind,
        };
        tracing::debug!(controller = name, %kind, "building controller");

        let var = |key: &str| std::env::var(key).ok();

        let controller: Box<dyn Controller> = match kind {
            Self::None => return Ok(None),
            Self::Ref => {
                let options = settings.apply(ControllerOptions::default(), true);
                Box::new(ProcessController::new(name, options, env).await?)
            }
            Self::Ovsc => {
                let options = settings.apply(frameworks::ovs_controller_options(&env).await?, true);
                Box::new(ProcessController::new(name, options, env).await?)
            }
            Self::Nox => {
                let options = settings.apply(frameworks::nox_options(&settings.args, var)?, false);
                Box::new(ProcessController::new(name, options, env).await?)
            }
            Self::Ryu => {
                let options =
                    settings.apply(frameworks::ryu_options(&env, &settings.args, var).await?, false);
                Box::new(ProcessController::new(name, options, env).await?)
            }
            Self::Remote => {
                Box::new(RemoteController::new(name, settings.ip.unwrap_or(DEFAULT_IP), settings.port).await)
            }
            Self::Switchd => {
                let mut options = SwitchdOptions::default();
                if let Some(ip) = settings.ip {
                    options.ip = ip;
                }
                if let Some(port) = settings.port {
                    options.port = port;
                }
                Box::new(Switchd::new(name, options, env).await?)
            }
            Self::Default => {
                return Err(Error::Precondition("could not find a default OpenFlow controller".into()))
            }
        };

        Ok(Some(controller))
    }
}

/// The first of the platform's default kinds that is available.
pub async fn find_controller(env: &Env) -> Result<Option<ControllerKind>> {
    for kind in ControllerKind::defaults_for(env.platform) {
        if kind.is_available(env).await? {
            return Ok(Some(*kind));
        }
    }

    Ok(None)
}
