use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;

use serde::Serialize;

use crate::{Error, Result};

/// An address together with its network prefix length, `a.b.c.d/n`
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct Ip {
    /// Host or network address
    pub address: IpAddr,
    /// Prefix length in bits
    pub prefix: u8,
}

impl Ip {
    /// Build from parts
    pub fn new(address: IpAddr, prefix: u8) -> Self {
        Self { address, prefix }
    }

    /// Parse `address/prefix`
    pub fn parse(text: &str) -> Result<Self> {
        let Some((address, prefix)) = text.rsplit_once('/') else {
            return Err(Error::config_schema(
                text,
                "IP address doesn't contain the slash that separates the address from the prefix",
            ));
        };
        let prefix: u8 = prefix.parse().map_err(|_| {
            Error::config_schema(text, format!("prefix '{}' isn't a valid integer", prefix))
        })?;
        let address = IpAddr::from_str(address).map_err(|e| {
            Error::config_schema(text, format!("'{}' isn't a valid address: {}", address, e))
        })?;
        let max = if address.is_ipv4() { 32 } else { 128 };
        if prefix > max {
            return Err(Error::config_schema(
                text,
                format!("prefix {} is longer than {} bits", prefix, max),
            ));
        }
        Ok(Self { address, prefix })
    }
}

impl fmt::Display for Ip {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.address, self.prefix)
    }
}

impl FromStr for Ip {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_and_display() {
        let ip = Ip::parse("192.168.7.10/24").unwrap();
        assert_eq!(ip.address, "192.168.7.10".parse::<IpAddr>().unwrap());
        assert_eq!(ip.prefix, 24);
        assert_eq!(ip.to_string(), "192.168.7.10/24");

        let v6: Ip = "fd00::1/64".parse().unwrap();
        assert_eq!(v6.to_string(), "fd00::1/64");
    }

    #[test]
    fn test_missing_slash() {
        let err = Ip::parse("192.168.7.10").unwrap_err();
        assert!(err.to_string().contains("slash"));
    }

    #[test]
    fn test_bad_prefix() {
        let err = Ip::parse("192.168.7.10/abc").unwrap_err();
        assert!(err.to_string().contains("'abc'"));
        assert!(Ip::parse("10.0.0.1/33").is_err());
    }
}
