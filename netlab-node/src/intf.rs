use std::net::{IpAddr, Ipv4Addr};

use netlab_common::Platform;

use crate::{node::Node, shaping::LinkShaping, Result};

/// Prefix length used when an address is given without one.
pub const DEFAULT_PREFIX_LEN: u8 = 8;

/// One network device attached to a node.
#[derive(Debug, Clone, PartialEq)]
pub struct Interface {
    /// Name the emulator knows the device by.
    pub name: String,
    /// Name the OS knows the device by, when it differs (OpenBSD `pairN`).
    pub realname: Option<String>,
    pub mac: Option<String>,
    pub ip: Option<IpAddr>,
    pub prefix_len: u8,
    /// Name of the other end of the pair this device belongs to.
    pub link: Option<String>,
    /// Name of the node the device is currently attached to.
    pub owner: Option<String>,
    /// Traffic control to (re-)install on the device.
    pub shaping: Option<LinkShaping>,
    /// Set for OVS patch ports, whose peer is `link`.
    pub patch: bool,
}

impl Interface {
    /// An interface whose OS name is `name`.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            realname: None,
            mac: None,
            ip: None,
            prefix_len: DEFAULT_PREFIX_LEN,
            link: None,
            owner: None,
            shaping: None,
            patch: false,
        }
    }

    /// The platform's loopback device with `127.0.0.1/8`.
    pub fn loopback(platform: Platform) -> Self {
        Self::new(platform.loopback()).with_ip(IpAddr::V4(Ipv4Addr::LOCALHOST), 8)
    }

    /// OS device name when it differs from the logical name.
    pub fn with_realname(mut self, realname: impl Into<String>) -> Self {
        self.realname = Some(realname.into());
        self
    }

    /// Hardware address set when the interface is configured.
    pub fn with_mac(mut self, mac: impl Into<String>) -> Self {
        self.mac = Some(mac.into());
        self
    }

    /// IPv4 or IPv6 address with its prefix length.
    pub fn with_ip(mut self, ip: IpAddr, prefix_len: u8) -> Self {
        self.ip = Some(ip);
        self.prefix_len = prefix_len;
        self
    }

    /// Name of the interface at the other end of the link.
    pub fn with_link(mut self, peer: impl Into<String>) -> Self {
        self.link = Some(peer.into());
        self
    }

    /// Shaping applied by `apply_shaping`.
    pub fn with_shaping(mut self, shaping: LinkShaping) -> Self {
        self.shaping = Some(shaping);
        self
    }

    /// Marks this as an OVS patch port peered with `peer`.
    pub fn patched(mut self, peer: impl Into<String>) -> Self {
        self.patch = true;
        self.link = Some(peer.into());
        self
    }

    /// The name to use in OS commands.
    pub fn os_name(&self) -> &str {
        self.realname.as_deref().unwrap_or(&self.name)
    }

    /// Whether an address has been assigned.
    pub fn has_ip(&self) -> bool {
        self.ip.is_some()
    }

    /// Installs the saved traffic-control configuration and returns the handle further qdiscs
    /// should attach to. Does nothing when no shaping is saved.
    pub async fn apply_shaping(&self, node: &Node) -> Result<Option<String>> {
        let Some(plan) = self.shaping.as_ref().and_then(|s| s.plan(self.os_name())) else {
            return Ok(None);
        };

        // There may be no root qdisc to remove yet.
        node.exec(&plan.reset).await?;

        for cmd in &plan.commands {
            node.exec(cmd).await?.into_result(cmd)?;
        }

        tracing::debug!(node = node.name(), intf = self.os_name(), parent = plan.parent, "applied link shaping");

        Ok(Some(plan.parent))
    }

    /// Whether the device is administratively up, as reported by the OS.
    pub async fn is_up(&self, node: &Node) -> Result<bool> {
        let output = match node.platform() {
            Platform::Linux => node.exec(&format!("ip link show {}", self.os_name())).await?,
            Platform::FreeBsd | Platform::OpenBsd => {
                node.exec(&format!("ifconfig {}", self.os_name())).await?
            }
        };

        Ok(output.success() && output.stdout.contains("UP"))
    }
}

pub(crate) fn set_ip_cmd(platform: Platform, dev: &str, ip: IpAddr, prefix_len: u8) -> String {
    match (platform, ip) {
        (Platform::Linux, _) => format!("ip addr add {ip}/{prefix_len} dev {dev} && ip link set {dev} up"),
        (_, IpAddr::V4(_)) => format!("ifconfig {dev} inet {ip}/{prefix_len} up"),
        (_, IpAddr::V6(_)) => format!("ifconfig {dev} inet6 {ip}/{prefix_len} up"),
    }
}

pub(crate) fn set_mac_cmd(platform: Platform, dev: &str, mac: &str) -> String {
    match platform {
        Platform::Linux => {
            format!("ip link set {dev} down && ip link set {dev} address {mac} && ip link set {dev} up")
        }
        Platform::FreeBsd => format!("ifconfig {dev} ether {mac}"),
        Platform::OpenBsd => format!("ifconfig {dev} lladdr {mac}"),
    }
}
