use std::{fmt, sync::LazyLock};

use regex::Regex;

use crate::{Error, Result};

/// Hex digits in a datapath id for most backends.
pub const DEFAULT_LEN: usize = 16;
/// Hex digits the reference user switch accepts.
pub const USER_LEN: usize = 12;

static FIRST_NUMBER: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\d+").expect("valid regex"));

/// A datapath id: lowercase hex, left-padded with zeros to the backend's length.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Dpid(String);

impl Dpid {
    /// Parses a hex dpid, colons allowed, e.g. `00:00:00:00:00:00:00:2a`.
    pub fn parse(s: &str, len: usize) -> Result<Self> {
        let hex: String = s.chars().filter(|c| *c != ':').collect();

        if hex.is_empty() || hex.len() > len || !hex.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(Error::InvalidDpid(s.to_owned()));
        }

        Ok(Self(format!("{:0>len$}", hex.to_ascii_lowercase())))
    }

    /// Derives the dpid from the first number in `name`, so `s23` becomes `...0017`.
    pub fn from_name(name: &str, len: usize) -> Result<Self> {
        let digits = FIRST_NUMBER
            .find(name)
            .ok_or_else(|| Error::NoDpid { name: name.to_owned() })?;
        let n: u64 = digits.as_str().parse().map_err(|_| Error::InvalidDpid(digits.as_str().to_owned()))?;

        Self::parse(&format!("{n:x}"), len)
    }

    /// The explicit dpid if given, otherwise the one derived from `name`.
    pub fn resolve(explicit: Option<&str>, name: &str, len: usize) -> Result<Self> {
        match explicit {
            Some(dpid) => Self::parse(dpid, len),
            None => Self::from_name(name, len),
        }
    }

    /// The dpid as hex digits.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The dpid as a number.
    pub fn value(&self) -> u64 {
        // Always valid hex of at most 16 digits.
        u64::from_str_radix(&self.0, 16).unwrap_or_default()
    }
}

impl fmt::Display for Dpid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
