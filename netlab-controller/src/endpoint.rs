use std::{
    fmt,
    net::{IpAddr, Ipv4Addr, SocketAddr},
    str::FromStr,
};

use crate::{Error, Result};

/// Port assigned to OpenFlow by IANA.
pub const DEFAULT_PORT: u16 = 6653;
/// Port used by OpenFlow before 1.3.
pub const LEGACY_PORT: u16 = 6633;
/// Where local controllers listen unless told otherwise.
pub const DEFAULT_IP: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);

/// Transport of the control channel.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum Protocol {
    #[default]
    Tcp,
    Ssl,
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Tcp => "tcp",
            Self::Ssl => "ssl",
        })
    }
}

impl FromStr for Protocol {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "tcp" => Ok(Self::Tcp),
            "ssl" => Ok(Self::Ssl),
            other => Err(Error::InvalidAddress(format!("unknown protocol {other}"))),
        }
    }
}

/// Where switches reach a controller.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ControllerEndpoint {
    pub name: String,
    pub ip: IpAddr,
    pub port: u16,
    pub protocol: Protocol,
    /// Managed outside the emulator.
    pub remote: bool,
}

impl ControllerEndpoint {
    /// A local TCP endpoint.
    pub fn new(name: impl Into<String>, ip: IpAddr, port: u16) -> Self {
        Self { name: name.into(), ip, port, protocol: Protocol::Tcp, remote: false }
    }

    /// Connects over `protocol` instead of TCP.
    pub fn with_protocol(mut self, protocol: Protocol) -> Self {
        self.protocol = protocol;
        self
    }

    /// Marks the controller as managed outside the emulator.
    pub fn remote(mut self) -> Self {
        self.remote = true;
        self
    }

    /// The OpenFlow connection string, e.g. `tcp:127.0.0.1:6653`.
    pub fn target(&self) -> String {
        format!("{}:{}:{}", self.protocol, self.ip, self.port)
    }

    /// Address to probe for a listening controller.
    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.ip, self.port)
    }
}

/// Parses `ip` or the `ip:port` shorthand. The port is `None` when not given.
pub fn parse_address(address: &str) -> Result<(IpAddr, Option<u16>)> {
    if let Ok(ip) = address.parse::<IpAddr>() {
        return Ok((ip, None));
    }

    if let Ok(addr) = address.parse::<SocketAddr>() {
        return Ok((addr.ip(), Some(addr.port())));
    }

    Err(Error::InvalidAddress(address.to_owned()))
}
