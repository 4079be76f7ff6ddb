//! The host operating system, as a value.
//!
//! Backend selection never looks the OS up on its own: a [`Platform`] is detected (or chosen, in
//! tests) once and handed to every constructor that needs to pick an OS-specific command.

use std::{fmt, str::FromStr};

/// Platform detection failures.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("unsupported platform: {0}")]
    Unsupported(String),
    #[error("uname failed: {0}")]
    Uname(#[from] nix::Error),
}

/// Operating systems netlab knows how to drive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Platform {
    /// Network namespaces, veth pairs and cgroups.
    Linux,
    /// VNET jails, `epair(4)` and `rctl(8)`.
    FreeBsd,
    /// Routing domains, `pair(4)` and `switch(4)`.
    OpenBsd,
}

impl Platform {
    /// Detect the running platform with `uname(2)`.
    pub fn detect() -> Result<Self, Error> {
        let uts = nix::sys::utsname::uname()?;
        let sysname = uts.sysname().to_string_lossy();

        tracing::debug!(%sysname, "detected platform");

        sysname.parse()
    }

    /// Name of the loopback device.
    pub const fn loopback(self) -> &'static str {
        match self {
            Self::Linux => "lo",
            Self::FreeBsd | Self::OpenBsd => "lo0",
        }
    }

    /// The commands an operator should run to bring Open vSwitch up on this platform.
    pub const fn ovs_start_hint(self) -> &'static str {
        match self {
            Self::Linux => "service openvswitch-switch start",
            Self::FreeBsd => "service ovsdb-server onestart\nservice ovs-vswitchd onestart",
            Self::OpenBsd => "Open vSwitch is not available on OpenBSD",
        }
    }

    /// Arguments of a process that does nothing until it is killed.
    pub const fn holder_argv(self) -> [&'static str; 2] {
        match self {
            Self::Linux => ["sleep", "infinity"],
            Self::FreeBsd | Self::OpenBsd => ["sleep", "2147483647"],
        }
    }
}

impl FromStr for Platform {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Linux" => Ok(Self::Linux),
            "FreeBSD" => Ok(Self::FreeBsd),
            "OpenBSD" => Ok(Self::OpenBsd),
            other => Err(Error::Unsupported(other.to_owned())),
        }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Linux => "Linux",
            Self::FreeBsd => "FreeBSD",
            Self::OpenBsd => "OpenBSD",
        };

        f.write_str(name)
    }
}
